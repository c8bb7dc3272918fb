use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::{
    config::ScriptsConfig,
    error::{AppError, AppResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEvent {
    Stdout { line: String },
    Stderr { line: String },
    Done { exit_code: Option<i32>, success: bool },
}

impl ScriptEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ScriptEvent::Stdout { .. } => "stdout",
            ScriptEvent::Stderr { .. } => "stderr",
            ScriptEvent::Done { .. } => "done",
        }
    }
}

/// Runs maintenance scripts from a fixed directory. Only names on the
/// allow-list run, and they take no arguments.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    dir: PathBuf,
    allowed: Vec<String>,
}

impl ScriptRunner {
    pub fn new(config: &ScriptsConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            allowed: config.allowed.clone(),
        }
    }

    pub fn list(&self) -> &[String] {
        &self.allowed
    }

    fn resolve(&self, name: &str) -> AppResult<PathBuf> {
        let plain = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !name.starts_with('.');

        if !plain || !self.allowed.iter().any(|allowed| allowed == name) {
            return Err(AppError::ScriptNotAllowed(name.to_string()));
        }

        Ok(self.dir.join(name))
    }

    /// Start `name` and stream its output. The receiver yields stdout and
    /// stderr lines as they arrive and ends with a single `Done`.
    pub fn run(&self, name: &str) -> AppResult<mpsc::Receiver<ScriptEvent>> {
        let path = self.resolve(name)?;

        let mut child = Command::new(&path)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!("Started script {} (pid {:?})", name, child.id());

        let (tx, rx) = mpsc::channel(64);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = name.to_string();

        tokio::spawn(async move {
            let out = forward_lines(stdout, tx.clone(), |line| ScriptEvent::Stdout { line });
            let err = forward_lines(stderr, tx.clone(), |line| ScriptEvent::Stderr { line });
            tokio::join!(out, err);

            let done = match child.wait().await {
                Ok(status) => {
                    tracing::info!("Script {} exited with {}", name, status);
                    ScriptEvent::Done {
                        exit_code: status.code(),
                        success: status.success(),
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to wait for script {}: {}", name, e);
                    ScriptEvent::Done {
                        exit_code: None,
                        success: false,
                    }
                }
            };
            let _ = tx.send(done).await;
        });

        Ok(rx)
    }
}

async fn forward_lines<R, F>(reader: Option<R>, tx: mpsc::Sender<ScriptEvent>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> ScriptEvent,
{
    let Some(reader) = reader else {
        return;
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(wrap(line)).await.is_err() {
                    // Client disconnected; keep draining so the child never blocks.
                    continue;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read script output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(dir: PathBuf) -> ScriptRunner {
        ScriptRunner::new(&ScriptsConfig {
            dir,
            allowed: vec!["sync-packs".to_string(), "echo.sh".to_string()],
        })
    }

    #[test]
    fn only_listed_names_resolve() {
        let runner = runner(PathBuf::from("/opt/scripts"));

        assert_eq!(
            runner.resolve("sync-packs").unwrap(),
            PathBuf::from("/opt/scripts/sync-packs")
        );
        assert!(matches!(
            runner.resolve("rm"),
            Err(AppError::ScriptNotAllowed(_))
        ));
        assert!(matches!(
            runner.resolve("../sync-packs"),
            Err(AppError::ScriptNotAllowed(_))
        ));
        assert!(matches!(
            runner.resolve(""),
            Err(AppError::ScriptNotAllowed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_output_then_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("scripts-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("echo.sh");
        std::fs::write(&script, "#!/bin/sh\necho hello\necho oops 1>&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut rx = runner(dir.clone()).run("echo.sh").unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        std::fs::remove_dir_all(&dir).ok();

        assert!(events.contains(&ScriptEvent::Stdout {
            line: "hello".to_string()
        }));
        assert!(events.contains(&ScriptEvent::Stderr {
            line: "oops".to_string()
        }));
        assert_eq!(
            events.last(),
            Some(&ScriptEvent::Done {
                exit_code: Some(3),
                success: false
            })
        );
    }
}
