use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use wawona_wire::core::errors;
use wawona_wire::prelude::*;

/// Logs every message of a client and accepts it unparsed.
struct MessageLogger;

impl WireMessageHandler for MessageLogger {
    fn on_message(&mut self, client: &mut Client, message: &WireMessage<'_>) -> errors::Result<usize> {
        let mut fds = 0;
        while client.take_next_incoming_fd().is_some() {
            fds += 1;
        }
        tracing::info!(
            "{}: {}@{} ({} bytes, {} fds)",
            client.id(),
            message.object_id(),
            message.opcode(),
            message.len(),
            fds
        );
        Ok(message.len())
    }
}

struct Inspector;

impl DisplayHandler for Inspector {
    fn client_created(&mut self, client: &mut Client) {
        client.set_handler(MessageLogger);
        client.add_destroy_listener(|id| tracing::info!("{} disconnected", id));
    }
}

fn main() -> Result<()> {
    // Set default log level to info
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,wawona_wire=debug");
    }
    // Initialize logging with standardized format
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .init();

    let config = DisplayConfig::from_env();
    let mut display = Display::new(config.clone()).context("Failed to create display")?;
    display.set_handler(Inspector);

    let name = match config.socket_name.as_deref() {
        Some(name) => {
            display
                .add_socket(name)
                .with_context(|| format!("Failed to add socket {}", name))?;
            name.to_string()
        }
        None => display
            .add_socket_auto()
            .context("Failed to pick a socket name")?,
    };
    tracing::info!("Serving WAYLAND_DISPLAY={}", name);

    display.run().context("Display loop failed")?;
    display.shutdown();
    Ok(())
}
