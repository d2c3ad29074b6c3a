pub mod enums;
pub mod preview;

pub use enums::*;
pub use preview::*;
