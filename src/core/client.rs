//! Client - one accepted connection and its protocol dispatch.
//!
//! A client owns its [`Connection`], the reactor registration watching the
//! socket, a snapshot of the peer credentials and a destroy signal. Decoded
//! messages are handed to the [`WireMessageHandler`] installed by the
//! protocol layer, usually from the display's accept hook.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::config::DisplayConfig;
use crate::core::connection::{Connection, FlushStatus, ReadStatus};
use crate::core::display::DisplayHandle;
use crate::core::errors::{CoreError, Result};
use crate::core::reactor::{Interest, SourceId};
use crate::core::signal::{ListenerId, Signal};
use crate::core::wire::WireMessage;

/// Identifier of a client, unique for the lifetime of its display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, not yet registered with the reactor
    Created,
    Active,
    /// Destroy listeners are running, output is being flushed
    Destroying,
    Destroyed,
}

/// Peer process credentials, read once at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Why a client was torn down
#[derive(Debug)]
pub enum DestroyReason {
    /// `Display::destroy_client` was called
    Requested,
    /// The reactor reported hangup or error on the socket
    Hangup,
    /// The peer closed its end
    PeerClosed,
    /// The display is shutting down
    Shutdown,
    /// I/O failure or protocol violation
    Failed(CoreError),
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyReason::Requested => write!(f, "destroy requested"),
            DestroyReason::Hangup => write!(f, "hangup"),
            DestroyReason::PeerClosed => write!(f, "peer closed the connection"),
            DestroyReason::Shutdown => write!(f, "display shutdown"),
            DestroyReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl From<CoreError> for DestroyReason {
    fn from(e: CoreError) -> Self {
        DestroyReason::Failed(e)
    }
}

/// Receives every decoded message of a client.
///
/// Descriptors that travel with the message are pulled from the client with
/// [`Client::take_next_incoming_fd`] in argument order. The return value is
/// the number of bytes consumed and must equal `message.len()`; anything else
/// (or an error) is treated as a protocol violation and destroys the client.
pub trait WireMessageHandler {
    fn on_message(&mut self, client: &mut Client, message: &WireMessage<'_>) -> Result<usize>;
}

pub struct Client {
    id: ClientId,
    state: ClientState,
    connection: Connection,
    source: Option<SourceId>,
    interest: Interest,
    credentials: Credentials,
    handler: Option<Box<dyn WireMessageHandler>>,
    destroy_signal: Signal<ClientId>,
    display: DisplayHandle,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("source", &self.source)
            .field("interest", &self.interest)
            .field("credentials", &self.credentials)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl Client {
    /// Wrap an accepted stream. Fails if the peer credentials are unavailable.
    pub(crate) fn new(
        id: ClientId,
        stream: UnixStream,
        config: &DisplayConfig,
        display: DisplayHandle,
    ) -> Result<Self> {
        let creds = getsockopt(&stream, PeerCredentials)?;
        stream.set_nonblocking(true)?;

        Ok(Self {
            id,
            state: ClientState::Created,
            connection: Connection::with_capacity(stream, config.buffer_size, config.max_fds_in),
            source: None,
            interest: Interest::READABLE,
            credentials: Credentials {
                pid: creds.pid(),
                uid: creds.uid(),
                gid: creds.gid(),
            },
            handler: None,
            destroy_signal: Signal::new(),
            display,
        })
    }

    pub(crate) fn activate(&mut self, source: SourceId) {
        assert_eq!(self.state, ClientState::Created, "{} activated twice", self.id);
        self.source = Some(source);
        self.state = ClientState::Active;
    }

    fn assert_alive(&self) {
        assert_ne!(self.state, ClientState::Destroyed, "use of destroyed {}", self.id);
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    /// Readiness the reactor currently waits for on this client
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// The display this client belongs to
    pub fn display(&self) -> &DisplayHandle {
        &self.display
    }

    pub fn set_handler(&mut self, handler: impl WireMessageHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn take_handler(&mut self) -> Option<Box<dyn WireMessageHandler>> {
        self.handler.take()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    // =========================================================================
    // Connection access
    // =========================================================================

    /// Queue bytes for the client, flushing first if the ring is full.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.assert_alive();
        self.connection.write(data)
    }

    pub fn queue_fd(&mut self, fd: OwnedFd) -> Result<()> {
        self.assert_alive();
        self.connection.queue_fd(fd)
    }

    pub fn flush(&mut self) -> Result<FlushStatus> {
        self.assert_alive();
        self.connection.flush()
    }

    pub fn pending_input(&self) -> usize {
        self.connection.pending_input()
    }

    pub fn pending_output(&self) -> usize {
        self.connection.pending_output()
    }

    pub fn count_incoming_fds(&self) -> usize {
        self.connection.count_incoming_fds()
    }

    pub fn take_next_incoming_fd(&mut self) -> Option<OwnedFd> {
        self.connection.take_next_incoming_fd()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a listener run once, with this client's id, on destruction.
    pub fn add_destroy_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClientId) + 'static,
    {
        self.destroy_signal.add(listener)
    }

    pub fn remove_destroy_listener(&self, listener: ListenerId) -> bool {
        self.destroy_signal.remove(listener)
    }

    /// First half of teardown: listeners run, then pending output goes out
    /// if the socket takes it.
    pub(crate) fn begin_destroy(&mut self) -> Option<SourceId> {
        self.assert_alive();
        self.state = ClientState::Destroying;
        self.destroy_signal.emit_final(&self.id);

        if let Err(e) = self.connection.flush() {
            tracing::debug!("{}: dropping unflushed output: {}", self.id, e);
        }
        self.source.take()
    }

    pub(crate) fn finish_destroy(&mut self) {
        self.state = ClientState::Destroyed;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// React to readiness reported by the reactor.
    ///
    /// Returns the interest to wait for next, or the reason the client has to
    /// be destroyed.
    pub(crate) fn dispatch(&mut self, mask: Interest) -> std::result::Result<Interest, DestroyReason> {
        if mask.intersects(Interest::HANGUP | Interest::ERROR) {
            return Err(DestroyReason::Hangup);
        }

        if mask.contains(Interest::WRITABLE) {
            self.interest = match self.connection.flush()? {
                FlushStatus::Done => Interest::READABLE,
                FlushStatus::WouldBlock => Interest::READABLE | Interest::WRITABLE,
            };
        }

        if mask.contains(Interest::READABLE) {
            match self.connection.read()? {
                ReadStatus::Closed => return Err(DestroyReason::PeerClosed),
                ReadStatus::Data(_) | ReadStatus::WouldBlock => {}
            }
            self.process_messages()?;
        }

        Ok(self.interest)
    }

    /// Flush buffered output, returning the interest to wait for next.
    pub(crate) fn flush_pending(&mut self) -> Result<Interest> {
        if !self.connection.want_flush() {
            return Ok(self.interest);
        }
        self.interest = match self.connection.flush()? {
            FlushStatus::Done => Interest::READABLE,
            FlushStatus::WouldBlock => Interest::READABLE | Interest::WRITABLE,
        };
        Ok(self.interest)
    }

    /// Deliver every complete message in the input ring.
    fn process_messages(&mut self) -> Result<()> {
        while let Some(header) = self.connection.peek_header() {
            header.validate()?;
            let size = usize::from(header.size);
            if size > self.connection.buffer_size() {
                return Err(CoreError::MessageTooLarge {
                    size,
                    capacity: self.connection.buffer_size(),
                });
            }
            if self.connection.pending_input() < size {
                break;
            }

            let buf = self.connection.take_message(size);
            let result = self.deliver(&buf);
            self.connection.recycle_scratch(buf);
            result?;
        }
        Ok(())
    }

    fn deliver(&mut self, bytes: &[u8]) -> Result<()> {
        let message = WireMessage::new(bytes)?;
        let mut handler = self.handler.take().ok_or_else(|| {
            CoreError::protocol(format!(
                "message for object {} opcode {} with no handler installed",
                message.object_id(),
                message.opcode()
            ))
        })?;

        tracing::trace!(
            "{}: object {} opcode {} ({} bytes)",
            self.id,
            message.object_id(),
            message.opcode(),
            message.len()
        );
        let result = handler.on_message(self, &message);

        // The handler may have installed a replacement for itself
        if self.handler.is_none() {
            self.handler = Some(handler);
        }

        let consumed = result?;
        if consumed != message.len() {
            return Err(CoreError::ShortConsume {
                consumed,
                size: message.len(),
            });
        }
        Ok(())
    }
}

impl AsFd for Client {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.connection.as_fd()
    }
}
