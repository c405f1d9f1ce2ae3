// Wawona Wire
//
// Server side runtime of the Wayland wire protocol: epoll reactor,
// ring-buffered connections with fd passing, client lifecycle and the
// display that ties them together. Protocol objects live in the layer
// above, which plugs in through `DisplayHandler` and `WireMessageHandler`.

pub mod core;
pub mod config;
pub mod util;
pub mod prelude;

pub use crate::config::DisplayConfig;
pub use crate::core::{
    Client, ClientId, CoreError, Display, DisplayHandle, DisplayHandler, Interest, WireMessage,
    WireMessageHandler,
};
