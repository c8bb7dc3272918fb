pub mod auth;
pub mod bulk;
pub mod downloads;
pub mod importer;
pub mod jobs;
pub mod packs;
pub mod scripts;
pub mod stickers;
