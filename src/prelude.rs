//! Common imports and types used throughout Wawona Wire.

pub use crate::config::DisplayConfig;
pub use crate::core::{
    Client, ClientId, ClientState, CoreError, Display, DisplayHandle, DisplayHandler, Interest,
    MessageWriter, WireMessage, WireMessageHandler,
};
pub use crate::util::logging::LogHandler;

pub type Result<T> = std::result::Result<T, crate::core::errors::CoreError>;
