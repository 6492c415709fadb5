pub mod credentials;
pub mod error;
pub mod generation;
pub mod notification;
pub mod progress;

pub use error::{ErrorKind, Result, StudioError};
