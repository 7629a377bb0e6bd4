pub mod error;
pub mod frame;

pub use error::ErrorCode;
pub use frame::*;
