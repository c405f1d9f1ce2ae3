pub mod errors;
pub mod signal;
pub mod ring;
pub mod wire;
pub mod connection;
pub mod reactor;
pub mod socket_manager;
pub mod client;
pub mod display;


// Re-export key types
pub use client::{Client, ClientId, ClientState, Credentials, DestroyReason, WireMessageHandler};
pub use connection::{Connection, FlushStatus, ReadStatus};
pub use display::{Display, DisplayHandle, DisplayHandler, DisplayState};
pub use errors::{CoreError, Result};
pub use reactor::{Interest, Reactor, SourceId};
pub use signal::{ListenerId, Signal};
pub use wire::{ArgReader, Fixed, MessageHeader, MessageWriter, WireMessage};
