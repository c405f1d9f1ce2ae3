//! Display - the top level object of a Wayland server.
//!
//! A display owns the reactor, the listening sockets and every live client.
//! Readiness callbacks run against [`DisplayState`], everything a callback
//! may touch besides the reactor itself.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tracing::Level;

use crate::config::DisplayConfig;
use crate::core::client::{Client, ClientId, DestroyReason};
use crate::core::errors::{CoreError, Result};
use crate::core::reactor::{Interest, Reactor, SourceId};
use crate::core::signal::{ListenerId, Signal};
use crate::core::socket_manager::{SocketInfo, SocketManager};
use crate::util::logging::{LogHandler, TracingLog, CLIENT, DISPLAY, SOCKET};
use crate::wlog;

/// Rounds of client destruction attempted at shutdown before giving up on
/// clients that keep spawning new ones
const MAX_SHUTDOWN_SWEEPS: usize = 8;

/// Accept hook of the protocol layer.
pub trait DisplayHandler {
    /// Called once for every new client, before any of its messages are
    /// dispatched. Install a [`WireMessageHandler`](crate::core::client::WireMessageHandler)
    /// and destroy listeners here.
    fn client_created(&mut self, client: &mut Client);
}

// ============================================================================
// Display Handle
// ============================================================================

#[derive(Debug)]
struct HandleInner {
    running: Cell<bool>,
    /// Streams waiting to become clients at the next safe point
    pending: RefCell<VecDeque<UnixStream>>,
    waker: UnixStream,
    wake_rx: UnixStream,
}

/// Cheap handle to a display, usable from listeners and handlers.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    inner: Rc<HandleInner>,
}

impl DisplayHandle {
    pub(crate) fn new() -> Result<Self> {
        let (waker, wake_rx) = UnixStream::pair()?;
        waker.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        Ok(Self {
            inner: Rc::new(HandleInner {
                running: Cell::new(false),
                pending: RefCell::new(VecDeque::new()),
                waker,
                wake_rx,
            }),
        })
    }

    /// Make [`Display::run`] return after the current batch.
    pub fn terminate(&self) {
        self.inner.running.set(false);
        self.wake();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Queue `stream` to become a client once the current callback returns.
    pub fn create_client(&self, stream: UnixStream) {
        self.inner.pending.borrow_mut().push_back(stream);
        self.wake();
    }

    pub fn pending_clients(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    fn set_running(&self, running: bool) {
        self.inner.running.set(running);
    }

    fn take_pending(&self) -> Option<UnixStream> {
        self.inner.pending.borrow_mut().pop_front()
    }

    fn wake(&self) {
        // A full pipe already guarantees a wakeup
        let _ = (&self.inner.waker).write(&[1]);
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.inner.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

// ============================================================================
// Display State
// ============================================================================

/// The part of a display visible to reactor callbacks.
pub struct DisplayState {
    config: DisplayConfig,
    logger: Rc<dyn LogHandler>,
    handle: DisplayHandle,
    sockets: SocketManager,
    /// Live clients, iterated in creation order
    clients: BTreeMap<ClientId, Client>,
    next_client_id: u64,
    handler: Option<Box<dyn DisplayHandler>>,
    client_created: Signal<ClientId>,
}

impl fmt::Debug for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayState")
            .field("config", &self.config)
            .field("sockets", &self.sockets)
            .field("clients", &self.clients.len())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl DisplayState {
    pub fn handle(&self) -> &DisplayHandle {
        &self.handle
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn create_client(&mut self, reactor: &mut Reactor<DisplayState>, stream: UnixStream) -> Result<ClientId> {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        let mut client = Client::new(id, stream, &self.config, self.handle.clone())?;
        let source = reactor.add_fd(client.as_fd(), Interest::READABLE, move |reactor, state, _, mask| {
            state.dispatch_client(reactor, id, mask);
        })?;
        client.activate(source);

        let creds = client.credentials();
        wlog!(
            self.logger,
            Level::INFO,
            CLIENT,
            "{} connected (pid {}, uid {}, gid {})",
            id,
            creds.pid,
            creds.uid,
            creds.gid
        );

        if let Some(handler) = self.handler.as_mut() {
            handler.client_created(&mut client);
        }
        self.clients.insert(id, client);
        self.client_created.emit(&id);
        Ok(id)
    }

    /// Turn streams queued through the handle into clients.
    fn adopt_pending(&mut self, reactor: &mut Reactor<DisplayState>) {
        while let Some(stream) = self.handle.take_pending() {
            if let Err(e) = self.create_client(reactor, stream) {
                wlog!(self.logger, Level::WARN, CLIENT, "Failed to create queued client: {}", e);
            }
        }
    }

    fn accept_ready(&mut self, reactor: &mut Reactor<DisplayState>, source: SourceId) {
        loop {
            let accepted = match self.sockets.by_source(source) {
                Some(socket) => socket.accept(),
                None => return,
            };
            match accepted {
                Ok(Some(stream)) => {
                    if let Err(e) = self.create_client(reactor, stream) {
                        wlog!(self.logger, Level::WARN, CLIENT, "Failed to create client: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    wlog!(self.logger, Level::ERROR, SOCKET, "Failed to accept client: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch_client(&mut self, reactor: &mut Reactor<DisplayState>, id: ClientId, mask: Interest) {
        let outcome = match self.clients.get_mut(&id) {
            Some(client) => client.dispatch(mask).map(|interest| (client.source(), interest)),
            None => return,
        };
        let result = match outcome {
            Ok((Some(source), interest)) => reactor.update_interest(source, interest).map_err(DestroyReason::from),
            Ok((None, _)) => Ok(()),
            Err(reason) => Err(reason),
        };
        if let Err(reason) = result {
            let _ = self.destroy_client(reactor, id, reason);
        }
    }

    fn flush_clients(&mut self, reactor: &mut Reactor<DisplayState>) {
        let mut failed = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            let result = client.flush_pending().and_then(|interest| match client.source() {
                Some(source) => reactor.update_interest(source, interest),
                None => Ok(()),
            });
            if let Err(e) = result {
                failed.push((*id, e));
            }
        }
        for (id, e) in failed {
            let _ = self.destroy_client(reactor, id, DestroyReason::Failed(e));
        }
    }

    fn destroy_client(&mut self, reactor: &mut Reactor<DisplayState>, id: ClientId, reason: DestroyReason) -> Result<()> {
        let mut client = self.clients.remove(&id).ok_or(CoreError::InvalidClient(id.raw()))?;

        if let Some(source) = client.begin_destroy() {
            if let Err(e) = reactor.remove(source) {
                tracing::warn!("{}: failed to unregister {}: {}", id, source, e);
            }
        }
        client.finish_destroy();

        match &reason {
            DestroyReason::Failed(e) if e.is_protocol_violation() => {
                wlog!(self.logger, Level::WARN, CLIENT, "{} destroyed on protocol violation: {}", id, reason);
            }
            DestroyReason::Failed(_) => {
                wlog!(self.logger, Level::WARN, CLIENT, "{} destroyed: {}", id, reason);
            }
            _ => {
                wlog!(self.logger, Level::INFO, CLIENT, "{} destroyed: {}", id, reason);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Display
// ============================================================================

pub struct Display {
    reactor: Reactor<DisplayState>,
    state: DisplayState,
    destroy_signal: Signal<()>,
    wake_source: SourceId,
    torn_down: bool,
}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display")
            .field("reactor", &self.reactor)
            .field("state", &self.state)
            .finish()
    }
}

impl Display {
    /// Create a display logging through `tracing`.
    pub fn new(config: DisplayConfig) -> Result<Self> {
        Self::with_logger(config, Rc::new(TracingLog))
    }

    /// Create a display reporting client diagnostics to `logger`.
    pub fn with_logger(mut config: DisplayConfig, logger: Rc<dyn LogHandler>) -> Result<Self> {
        if !config.buffer_size.is_power_of_two() {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer size {} is not a power of two", config.buffer_size),
            )));
        }
        if config.runtime_dir.is_none() {
            config.runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from);
        }

        let mut reactor: Reactor<DisplayState> = Reactor::new()?;
        let handle = DisplayHandle::new()?;
        let wake_source = reactor.add_fd(handle.inner.wake_rx.as_fd(), Interest::READABLE, |_, state, _, _| {
            state.handle.drain_wakeups();
        })?;

        wlog!(logger, Level::DEBUG, DISPLAY, "Display created");
        Ok(Self {
            reactor,
            state: DisplayState {
                sockets: SocketManager::new(config.runtime_dir.clone()),
                config,
                logger,
                handle,
                clients: BTreeMap::new(),
                next_client_id: 1,
                handler: None,
                client_created: Signal::new(),
            },
            destroy_signal: Signal::new(),
            wake_source,
            torn_down: false,
        })
    }

    pub fn set_handler(&mut self, handler: impl DisplayHandler + 'static) {
        self.state.handler = Some(Box::new(handler));
    }

    pub fn handle(&self) -> DisplayHandle {
        self.state.handle.clone()
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.state.config
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    pub fn reactor(&self) -> &Reactor<DisplayState> {
        &self.reactor
    }

    /// For registering extra sources that run on the display loop
    pub fn reactor_mut(&mut self) -> &mut Reactor<DisplayState> {
        &mut self.reactor
    }

    // =========================================================================
    // Sockets
    // =========================================================================

    /// Listen on `name` under the runtime directory (or at `name` if absolute).
    pub fn add_socket(&mut self, name: &str) -> Result<()> {
        let index = self.state.sockets.bind(name)?;
        self.register_socket(index)
    }

    /// Listen on the first free `wayland-N` name and return it.
    pub fn add_socket_auto(&mut self) -> Result<String> {
        let (index, name) = self.state.sockets.bind_auto(self.state.config.max_display_number)?;
        self.register_socket(index)?;
        Ok(name)
    }

    /// Listen on a socket that is already bound and listening.
    pub fn add_socket_fd(&mut self, fd: OwnedFd) -> Result<()> {
        let index = self.state.sockets.adopt_fd(fd)?;
        self.register_socket(index)
    }

    pub fn sockets(&self) -> Vec<&SocketInfo> {
        self.state.sockets.get_socket_info()
    }

    fn register_socket(&mut self, index: usize) -> Result<()> {
        let Some(socket) = self.state.sockets.get(index) else {
            return Err(CoreError::InvalidSource(index as u64));
        };
        let identifier = socket.info().identifier.clone();
        let registered = self.reactor.add_fd(socket.as_fd(), Interest::READABLE, |reactor, state, source, _| {
            state.accept_ready(reactor, source);
        });

        match registered {
            Ok(source) => {
                if let Some(socket) = self.state.sockets.get_mut(index) {
                    socket.set_source(source);
                }
                wlog!(self.state.logger, Level::INFO, SOCKET, "Listening on {}", identifier);
                Ok(())
            }
            Err(e) => {
                let _ = self.state.sockets.remove_socket(&identifier);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Turn an already connected stream into a client.
    pub fn create_client(&mut self, stream: UnixStream) -> Result<ClientId> {
        self.state.create_client(&mut self.reactor, stream)
    }

    pub fn destroy_client(&mut self, id: ClientId) -> Result<()> {
        self.state.destroy_client(&mut self.reactor, id, DestroyReason::Requested)
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.state.client(id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.state.client_mut(id)
    }

    /// Live clients in creation order
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.state.clients.values()
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    /// Flush every client with pending output, arming writable interest for
    /// those whose socket is full.
    pub fn flush_clients(&mut self) {
        self.state.flush_clients(&mut self.reactor);
    }

    /// Destroy every live client.
    ///
    /// Clients created while doing so are adopted but left alive, and
    /// reported through [`CoreError::ClientsRemaining`].
    pub fn destroy_clients(&mut self) -> Result<()> {
        let ids: Vec<ClientId> = self.state.clients.keys().copied().collect();
        for id in ids {
            let _ = self.state.destroy_client(&mut self.reactor, id, DestroyReason::Shutdown);
        }
        self.state.adopt_pending(&mut self.reactor);

        match self.state.clients.len() {
            0 => Ok(()),
            remaining => {
                wlog!(
                    self.state.logger,
                    Level::WARN,
                    DISPLAY,
                    "{} client(s) created while destroying clients",
                    remaining
                );
                Err(CoreError::ClientsRemaining(remaining))
            }
        }
    }

    // =========================================================================
    // Event Loop
    // =========================================================================

    /// Run one reactor batch, waiting up to `timeout` (`None` blocks).
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.state.adopt_pending(&mut self.reactor);
        let count = self.reactor.dispatch(&mut self.state, timeout)?;
        self.state.adopt_pending(&mut self.reactor);
        Ok(count)
    }

    /// Flush and dispatch until [`Display::terminate`] is called.
    pub fn run(&mut self) -> Result<()> {
        self.state.handle.set_running(true);
        wlog!(self.state.logger, Level::INFO, DISPLAY, "Entering main loop");
        while self.state.handle.is_running() {
            self.flush_clients();
            self.dispatch(None)?;
        }
        wlog!(self.state.logger, Level::INFO, DISPLAY, "Main loop terminated");
        Ok(())
    }

    pub fn terminate(&self) {
        self.state.handle.terminate();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn add_client_created_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClientId) + 'static,
    {
        self.state.client_created.add(listener)
    }

    pub fn remove_client_created_listener(&self, listener: ListenerId) -> bool {
        self.state.client_created.remove(listener)
    }

    /// Register a listener run once when the display is torn down.
    pub fn add_destroy_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&()) + 'static,
    {
        self.destroy_signal.add(listener)
    }

    pub fn remove_destroy_listener(&self, listener: ListenerId) -> bool {
        self.destroy_signal.remove(listener)
    }

    /// Tear the display down: clients, then sockets, then the reactor.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.state.handle.terminate();

        for _ in 0..MAX_SHUTDOWN_SWEEPS {
            if self.destroy_clients().is_ok() {
                break;
            }
        }

        let leftover = std::mem::take(&mut self.state.clients);
        if !leftover.is_empty() {
            wlog!(
                self.state.logger,
                Level::WARN,
                DISPLAY,
                "Closing {} client(s) without destroy notification",
                leftover.len()
            );
        }
        for (_, mut client) in leftover {
            if let Some(source) = client.source() {
                let _ = self.reactor.remove(source);
            }
            client.finish_destroy();
        }
        while self.state.handle.take_pending().is_some() {}

        self.destroy_signal.emit_final(&());

        for socket in self.state.sockets.close_all() {
            if let Some(source) = socket.source() {
                let _ = self.reactor.remove(source);
            }
        }
        let _ = self.reactor.remove(self.wake_source);
        wlog!(self.state.logger, Level::INFO, DISPLAY, "Display shut down");
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.teardown();
    }
}
