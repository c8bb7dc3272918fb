pub mod bucket;
pub mod fetch;
pub mod redis;
