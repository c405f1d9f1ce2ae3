//! Display configuration.

use std::path::PathBuf;

use crate::core::ring::DEFAULT_CAPACITY;

/// Highest display number probed when choosing a socket name automatically
pub const DEFAULT_MAX_DISPLAY_NUMBER: u32 = 32;

/// Configuration for a [`Display`](crate::core::display::Display)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Directory holding named sockets (`XDG_RUNTIME_DIR` when unset)
    pub runtime_dir: Option<PathBuf>,
    /// Socket name (e.g., "wayland-1"); chosen automatically when unset
    pub socket_name: Option<String>,
    /// Auto-selection probes `wayland-0` up to `wayland-<max_display_number>`
    pub max_display_number: u32,
    /// Size of each connection ring buffer; must be a power of two
    pub buffer_size: usize,
    /// Incoming descriptors a connection may hold before it overflows
    pub max_fds_in: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            socket_name: None,
            max_display_number: DEFAULT_MAX_DISPLAY_NUMBER,
            buffer_size: DEFAULT_CAPACITY,
            max_fds_in: DEFAULT_CAPACITY / 4,
        }
    }
}

impl DisplayConfig {
    /// Read `XDG_RUNTIME_DIR` and `WAYLAND_DISPLAY` once.
    pub fn from_env() -> Self {
        Self {
            runtime_dir: std::env::var_os("XDG_RUNTIME_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            socket_name: std::env::var("WAYLAND_DISPLAY")
                .ok()
                .filter(|name| !name.is_empty()),
            ..Default::default()
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = Some(name.into());
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize, max_fds_in: usize) -> Self {
        self.buffer_size = buffer_size;
        self.max_fds_in = max_fds_in;
        self
    }
}
