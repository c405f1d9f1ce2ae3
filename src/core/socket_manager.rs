//! Socket Manager - handles the listening sockets of a display
//!
//! Supports:
//! - Named Unix domain sockets under the runtime directory, each guarded by a
//!   `<socket>.lock` file held with `flock`
//! - Automatic name selection (`wayland-0`, `wayland-1`, ...)
//! - Adopting an already bound and listening descriptor

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::core::errors::{CoreError, Result};
use crate::core::reactor::SourceId;

/// `sizeof(sun_path)` on Linux, NUL terminator included
const SUN_PATH_MAX: usize = 108;

const LOCK_SUFFIX: &str = ".lock";

/// Socket type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Bound by us at a path we own and unlink on teardown
    Named,
    /// Handed to us already bound and listening
    Adopted,
}

/// Information about a bound socket
#[derive(Debug, Clone)]
pub struct SocketInfo {
    /// Type of socket
    pub socket_type: SocketType,
    /// Path (for named sockets) or `fd:<n>`
    pub identifier: String,
}

/// One listening socket.
pub struct ListeningSocket {
    listener: UnixListener,
    info: SocketInfo,
    path: Option<PathBuf>,
    lock: Option<(PathBuf, Flock<File>)>,
    source: Option<SourceId>,
}

impl ListeningSocket {
    /// Bind `name` under `runtime_dir`, or at `name` itself if it is absolute.
    pub fn bind(runtime_dir: Option<&Path>, name: &str) -> Result<Self> {
        let path = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            runtime_dir.ok_or(CoreError::RuntimeDirUnset)?.join(name)
        };

        if path.as_os_str().len() >= SUN_PATH_MAX {
            return Err(CoreError::SocketNameTooLong(path.display().to_string()));
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_path);

        let lock = Self::lock(&path, &lock_path)?;

        // We hold the lock, so whatever sits at the socket path is stale.
        match std::fs::symlink_metadata(&path) {
            Ok(_) => {
                tracing::debug!("Removing stale socket: {}", path.display());
                std::fs::remove_file(&path)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Binding socket: {}", path.display());
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            info: SocketInfo {
                socket_type: SocketType::Named,
                identifier: path.to_string_lossy().to_string(),
            },
            path: Some(path),
            lock: Some((lock_path, lock)),
            source: None,
        })
    }

    fn lock(path: &Path, lock_path: &Path) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o660)
            .open(lock_path)
            .map_err(|e| {
                tracing::warn!("Unable to open lockfile {}: {}", lock_path.display(), e);
                CoreError::Io(e)
            })?;

        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            tracing::debug!(
                "Unable to lock {} ({}), another display owns {}",
                lock_path.display(),
                errno,
                path.display()
            );
            CoreError::SocketInUse(path.display().to_string())
        })
    }

    /// Wrap a descriptor that is already bound and listening.
    pub fn adopt(fd: OwnedFd) -> Result<Self> {
        let identifier = format!("fd:{}", fd.as_raw_fd());
        let listener = UnixListener::from(fd);
        listener.set_nonblocking(true)?;
        tracing::info!("Adopted listening socket {}", identifier);
        Ok(Self {
            listener,
            info: SocketInfo {
                socket_type: SocketType::Adopted,
                identifier,
            },
            path: None,
            lock: None,
            source: None,
        })
    }

    /// Accept one pending connection, `None` if there is none.
    pub fn accept(&self) -> Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn info(&self) -> &SocketInfo {
        &self.info
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File name of a named socket, as clients put it in `WAYLAND_DISPLAY`
    pub fn name(&self) -> Option<&str> {
        self.path.as_deref()?.file_name()?.to_str()
    }

    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    pub(crate) fn set_source(&mut self, source: SourceId) {
        self.source = Some(source);
    }
}

impl std::fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSocket")
            .field("info", &self.info)
            .field("locked", &self.lock.is_some())
            .field("source", &self.source)
            .finish()
    }
}

impl AsFd for ListeningSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ListeningSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove socket file {}: {}", path.display(), e);
            } else {
                tracing::debug!("Removed socket file: {}", path.display());
            }
        }
        // Unlink the lock file while still holding the lock
        if let Some((lock_path, _)) = &self.lock {
            let _ = std::fs::remove_file(lock_path);
        }
    }
}

/// Ordered set of the listening sockets of one display
#[derive(Debug)]
pub struct SocketManager {
    sockets: Vec<ListeningSocket>,
    /// Runtime directory for named sockets
    runtime_dir: Option<PathBuf>,
}

impl SocketManager {
    pub fn new(runtime_dir: Option<PathBuf>) -> Self {
        Self {
            sockets: Vec::new(),
            runtime_dir,
        }
    }

    pub fn runtime_dir(&self) -> Option<&Path> {
        self.runtime_dir.as_deref()
    }

    /// Bind a named socket and return its index.
    pub fn bind(&mut self, name: &str) -> Result<usize> {
        let socket = ListeningSocket::bind(self.runtime_dir.as_deref(), name)?;
        self.sockets.push(socket);
        Ok(self.sockets.len() - 1)
    }

    /// Bind the first free `wayland-N` name, `N` in `0..=max_display_number`.
    pub fn bind_auto(&mut self, max_display_number: u32) -> Result<(usize, String)> {
        for number in 0..=max_display_number {
            let name = format!("wayland-{}", number);
            match self.bind(&name) {
                Ok(index) => return Ok((index, name)),
                Err(CoreError::SocketInUse(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::NoFreeSocketName(max_display_number + 1))
    }

    /// Adopt a listening descriptor and return its index.
    pub fn adopt_fd(&mut self, fd: OwnedFd) -> Result<usize> {
        self.sockets.push(ListeningSocket::adopt(fd)?);
        Ok(self.sockets.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&ListeningSocket> {
        self.sockets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ListeningSocket> {
        self.sockets.get_mut(index)
    }

    pub fn by_source(&self, source: SourceId) -> Option<&ListeningSocket> {
        self.sockets.iter().find(|s| s.source == Some(source))
    }

    /// Remove a socket by its path/identifier, returning it
    pub fn remove_socket(&mut self, identifier: &str) -> Result<ListeningSocket> {
        let index = self
            .sockets
            .iter()
            .position(|s| s.info.identifier == identifier)
            .ok_or_else(|| {
                CoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Socket not found: {}", identifier),
                ))
            })?;
        tracing::info!("Removed socket: {}", identifier);
        Ok(self.sockets.remove(index))
    }

    /// Get information about all bound sockets
    pub fn get_socket_info(&self) -> Vec<&SocketInfo> {
        self.sockets.iter().map(|s| &s.info).collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Close all sockets and clean up socket files, returning them so the
    /// caller can unregister their event sources first.
    pub fn close_all(&mut self) -> Vec<ListeningSocket> {
        tracing::info!("Closing {} socket(s)", self.sockets.len());
        std::mem::take(&mut self.sockets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn get_test_runtime_dir() -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        // Keep it short, socket paths are limited to 108 bytes
        let dir = env::temp_dir().join(format!("ww-{}-{}", std::process::id(), timestamp % 1_000_000_000));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn test_bind_named_socket() {
        let runtime_dir = get_test_runtime_dir();
        let mut manager = SocketManager::new(Some(runtime_dir.clone()));

        let result = manager.bind("wayland-test-0");
        assert!(result.is_ok(), "Failed to bind socket: {:?}", result.err());

        // Verify socket and lock files exist
        assert!(runtime_dir.join("wayland-test-0").exists());
        assert!(runtime_dir.join("wayland-test-0.lock").exists());
        assert_eq!(manager.get(0).unwrap().name(), Some("wayland-test-0"));

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_second_bind_of_same_name_is_refused() {
        let runtime_dir = get_test_runtime_dir();
        let mut first = SocketManager::new(Some(runtime_dir.clone()));
        let mut second = SocketManager::new(Some(runtime_dir.clone()));

        first.bind("wayland-test-0").unwrap();
        assert!(matches!(second.bind("wayland-test-0"), Err(CoreError::SocketInUse(_))));

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_stale_socket_file_is_replaced() {
        let runtime_dir = get_test_runtime_dir();
        std::fs::write(runtime_dir.join("wayland-test-0"), b"stale").unwrap();

        let mut manager = SocketManager::new(Some(runtime_dir.clone()));
        manager.bind("wayland-test-0").unwrap();
        assert!(UnixStream::connect(runtime_dir.join("wayland-test-0")).is_ok());

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_bind_auto_probes_in_order() {
        let runtime_dir = get_test_runtime_dir();
        let mut manager = SocketManager::new(Some(runtime_dir.clone()));
        let mut other = SocketManager::new(Some(runtime_dir.clone()));

        other.bind("wayland-0").unwrap();
        let (_, name) = manager.bind_auto(32).unwrap();
        assert_eq!(name, "wayland-1");

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_bind_auto_fails_once_names_are_exhausted() {
        let runtime_dir = get_test_runtime_dir();
        let mut manager = SocketManager::new(Some(runtime_dir.clone()));

        manager.bind_auto(1).unwrap();
        manager.bind_auto(1).unwrap();
        assert!(matches!(manager.bind_auto(1), Err(CoreError::NoFreeSocketName(2))));
        assert_eq!(manager.len(), 2);

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_relative_name_needs_runtime_dir() {
        let mut manager = SocketManager::new(None);
        assert!(matches!(manager.bind("wayland-0"), Err(CoreError::RuntimeDirUnset)));
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let runtime_dir = get_test_runtime_dir();
        let mut manager = SocketManager::new(Some(runtime_dir.clone()));
        let name = "w".repeat(120);
        assert!(matches!(manager.bind(&name), Err(CoreError::SocketNameTooLong(_))));
        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_remove_socket_unlinks_files() {
        let runtime_dir = get_test_runtime_dir();
        let mut manager = SocketManager::new(Some(runtime_dir.clone()));
        manager.bind("wayland-test-0").unwrap();
        manager.bind("wayland-test-1").unwrap();

        let identifier = runtime_dir.join("wayland-test-1").to_string_lossy().to_string();
        drop(manager.remove_socket(&identifier).unwrap());

        assert_eq!(manager.get_socket_info().len(), 1);
        assert!(!runtime_dir.join("wayland-test-1").exists());
        assert!(!runtime_dir.join("wayland-test-1.lock").exists());

        let _ = std::fs::remove_dir_all(runtime_dir);
    }

    #[test]
    fn test_adopted_socket_accepts() {
        let runtime_dir = get_test_runtime_dir();
        let path = runtime_dir.join("external");
        let listener = UnixListener::bind(&path).unwrap();

        let mut manager = SocketManager::new(None);
        let index = manager.adopt_fd(OwnedFd::from(listener)).unwrap();
        let socket = manager.get(index).unwrap();
        assert_eq!(socket.info().socket_type, SocketType::Adopted);
        assert!(socket.accept().unwrap().is_none());

        let _client = UnixStream::connect(&path).unwrap();
        assert!(socket.accept().unwrap().is_some());

        // Adopted sockets are never unlinked by us
        drop(manager);
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(runtime_dir);
    }
}
