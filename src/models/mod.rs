pub mod download;
pub mod pack;
pub mod sticker;

pub use download::*;
pub use pack::*;
pub use sticker::*;
