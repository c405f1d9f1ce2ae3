//! Per-client connection: ring-buffered bytes and file descriptors over one
//! Unix socket.
//!
//! Outgoing descriptors ride along with the next `sendmsg` as `SCM_RIGHTS`
//! ancillary data, at most [`MAX_FDS_OUT`] per call. A longer backlog is split
//! over several sends, each carrying a few bytes of its own. Incoming descriptors are
//! collected from every `recvmsg` into a FIFO that the message handler drains
//! as it decodes arguments.

use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::core::errors::{CoreError, Result};
use crate::core::ring::{FdQueue, RingBuffer, DEFAULT_CAPACITY};
use crate::core::wire::{MessageHeader, HEADER_SIZE};

/// Descriptors sent per `sendmsg`, sized to one control message buffer.
pub const MAX_FDS_OUT: usize = 28;

/// Bytes sent alongside each full batch of descriptors when more are queued
const FD_BATCH_BYTES: usize = 4;

/// Outcome of [`Connection::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were received; carries the total now buffered
    Data(usize),
    /// Nothing to read right now
    WouldBlock,
    /// The peer closed the connection
    Closed,
}

/// Outcome of [`Connection::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// All buffered output reached the kernel
    Done,
    /// The socket is full; wait for writability and flush again
    WouldBlock,
}

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    input: RingBuffer,
    output: RingBuffer,
    fds_in: FdQueue,
    fds_out: FdQueue,
    want_flush: bool,
    /// Reused for every decoded message
    scratch: Vec<u8>,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self::with_capacity(stream, DEFAULT_CAPACITY, DEFAULT_CAPACITY / 4)
    }

    /// `buffer_size` must be a power of two.
    pub fn with_capacity(stream: UnixStream, buffer_size: usize, max_fds_in: usize) -> Self {
        Self {
            stream,
            input: RingBuffer::new(buffer_size),
            output: RingBuffer::new(buffer_size),
            fds_in: FdQueue::new(max_fds_in),
            fds_out: FdQueue::new(buffer_size / 4),
            want_flush: false,
            scratch: Vec::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.input.capacity()
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Buffer `data` for sending, flushing first if it would not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.output.capacity() {
            return Err(CoreError::MessageTooLarge {
                size: data.len(),
                capacity: self.output.capacity(),
            });
        }
        if data.len() > self.output.free() {
            self.want_flush = true;
            self.flush()?;
        }
        self.output.put(data)?;
        self.want_flush = true;
        Ok(())
    }

    /// Queue a descriptor for the next send.
    ///
    /// The connection owns `fd` until a send hands it to the kernel, or until
    /// the connection is dropped. If the queue is still full after a flush,
    /// `fd` is closed and [`CoreError::FdQueueFull`] returned.
    pub fn queue_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.fds_out.is_full() {
            self.want_flush = true;
            self.flush()?;
            if self.fds_out.is_full() {
                drop(fd);
                return Err(CoreError::FdQueueFull(self.fds_out.capacity()));
            }
        }
        self.fds_out.push(fd)
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    pub fn want_flush(&self) -> bool {
        self.want_flush
    }

    /// Send as much buffered output as the socket takes.
    pub fn flush(&mut self) -> Result<FlushStatus> {
        if !self.want_flush {
            return Ok(FlushStatus::Done);
        }

        while !self.output.is_empty() {
            let (sent, fds_sent) = {
                let slices = self.output.used_slices();
                // Hold back bytes while more fds wait than one send carries
                let limit = if self.fds_out.len() > MAX_FDS_OUT {
                    FD_BATCH_BYTES
                } else {
                    usize::MAX
                };
                let first = slices[0].len().min(limit);
                let second = slices[1].len().min(limit - first);
                let iov_buf = [
                    IoSlice::new(&slices[0][..first]),
                    IoSlice::new(&slices[1][..second]),
                ];
                let iov_count = if second == 0 { 1 } else { 2 };
                let iovs: &[IoSlice<'_>] = &iov_buf[..iov_count];
                let raw_fds: Vec<RawFd> = self
                    .fds_out
                    .iter()
                    .take(MAX_FDS_OUT)
                    .map(AsRawFd::as_raw_fd)
                    .collect();
                let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
                let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &cmsgs };

                loop {
                    match sendmsg::<()>(
                        self.stream.as_raw_fd(),
                        iovs,
                        cmsgs,
                        MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
                        None,
                    ) {
                        Ok(n) => break (n, raw_fds.len()),
                        Err(Errno::EINTR) => continue,
                        Err(Errno::EAGAIN) => return Ok(FlushStatus::WouldBlock),
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            // The kernel holds its own references now; close ours.
            self.fds_out.drop_front(fds_sent);
            self.output.consume(sent);
            tracing::trace!("Flushed {} bytes and {} fds", sent, fds_sent);
        }

        self.want_flush = false;
        Ok(FlushStatus::Done)
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Receive once from the socket into the input ring.
    pub fn read(&mut self) -> Result<ReadStatus> {
        if self.input.is_full() {
            return Err(CoreError::BufferOverflow {
                size: self.input.len(),
                capacity: self.input.capacity(),
            });
        }

        let fd = self.stream.as_raw_fd();
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_OUT]);
        let (bytes, truncated, blocks) = loop {
            let mut iovs = self.input.free_slices();
            match recvmsg::<UnixAddr>(
                fd,
                &mut iovs,
                Some(&mut cmsg_space),
                MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut blocks: Vec<Vec<OwnedFd>> = Vec::new();
                    for cmsg in msg.cmsgs()? {
                        match cmsg {
                            ControlMessageOwned::ScmRights(raw) => blocks.push(
                                raw.into_iter()
                                    // SAFETY: the kernel just installed these fds
                                    // for us and nothing else records them
                                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
                                    .collect(),
                            ),
                            other => {
                                tracing::warn!("Unexpected control message: {:?}, ignoring", other);
                            }
                        }
                    }
                    break (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC), blocks);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(ReadStatus::WouldBlock),
                Err(Errno::ECONNRESET) => return Ok(ReadStatus::Closed),
                Err(e) => return Err(e.into()),
            }
        };

        // A block that does not fit is closed as a whole, and so is every
        // block after it.
        let mut overflow = truncated;
        for block in blocks {
            if overflow || block.len() > self.fds_in.free() {
                overflow = true;
                tracing::debug!("Closing {} received fds on overflow", block.len());
                drop(block);
                continue;
            }
            for fd in block {
                self.fds_in.push(fd)?;
            }
        }
        if overflow {
            return Err(CoreError::FdOverflow(self.fds_in.capacity()));
        }

        if bytes == 0 {
            return Ok(ReadStatus::Closed);
        }
        self.input.commit(bytes);
        Ok(ReadStatus::Data(self.input.len()))
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Copy the next `dst.len()` input bytes without consuming them.
    pub fn copy(&self, dst: &mut [u8]) {
        self.input.copy(dst);
    }

    pub fn consume(&mut self, count: usize) {
        self.input.consume(count);
    }

    /// Peek at the header of the next message, if one is buffered.
    pub fn peek_header(&self) -> Option<MessageHeader> {
        if self.input.len() < HEADER_SIZE {
            return None;
        }
        let mut raw = [0u8; HEADER_SIZE];
        self.input.copy(&mut raw);
        Some(MessageHeader::parse(&raw))
    }

    /// Move the next `size` input bytes into the scratch buffer.
    ///
    /// Hand the buffer back with [`Connection::recycle_scratch`] so its
    /// allocation is reused.
    pub fn take_message(&mut self, size: usize) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();
        buf.resize(size, 0);
        self.input.copy(&mut buf);
        self.input.consume(size);
        buf
    }

    pub fn recycle_scratch(&mut self, buf: Vec<u8>) {
        if buf.capacity() >= self.scratch.capacity() {
            self.scratch = buf;
        }
    }

    pub fn count_incoming_fds(&self) -> usize {
        self.fds_in.len()
    }

    pub fn take_next_incoming_fd(&mut self) -> Option<OwnedFd> {
        self.fds_in.pop()
    }

    pub fn queued_outgoing_fds(&self) -> usize {
        self.fds_out.len()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    fn pipe_writer_closed(reader: OwnedFd) -> bool {
        let mut buf = [0u8; 1];
        File::from(reader).read(&mut buf).unwrap() == 0
    }

    #[test]
    fn test_write_flush_reaches_peer() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(local);
        conn.write(b"hello wayland").unwrap();
        assert!(conn.want_flush());
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);
        assert_eq!(conn.pending_output(), 0);

        let mut buf = [0u8; 13];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello wayland");
    }

    #[test]
    fn test_write_larger_than_ring_is_rejected() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::with_capacity(local, 16, 4);
        assert!(matches!(
            conn.write(&[0u8; 17]),
            Err(CoreError::MessageTooLarge { size: 17, capacity: 16 })
        ));
    }

    #[test]
    fn test_write_flushes_eagerly_when_ring_fills() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::with_capacity(local, 16, 4);
        conn.write(&[1u8; 12]).unwrap();
        conn.write(&[2u8; 12]).unwrap();
        assert_eq!(conn.pending_output(), 12);

        let mut buf = [0u8; 12];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1u8; 12]);
    }

    #[test]
    fn test_fds_travel_with_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);

        let (reader, writer) = nix::unistd::pipe().unwrap();
        sender.queue_fd(writer).unwrap();
        sender.write(&[0u8; 8]).unwrap();
        assert_eq!(sender.flush().unwrap(), FlushStatus::Done);
        assert_eq!(sender.queued_outgoing_fds(), 0);

        assert_eq!(receiver.read().unwrap(), ReadStatus::Data(8));
        assert_eq!(receiver.count_incoming_fds(), 1);
        let received = receiver.take_next_incoming_fd().unwrap();
        File::from(received).write_all(b"x").unwrap();

        let mut buf = [0u8; 1];
        File::from(reader).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_unsent_fds_are_closed_on_drop() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(local);
        let (reader, writer) = nix::unistd::pipe().unwrap();
        conn.queue_fd(writer).unwrap();
        drop(conn);
        assert!(pipe_writer_closed(reader));
    }

    #[test]
    fn test_undelivered_incoming_fds_are_closed_on_drop() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);
        let (reader, writer) = nix::unistd::pipe().unwrap();
        sender.queue_fd(writer).unwrap();
        sender.write(&[0u8; 4]).unwrap();
        sender.flush().unwrap();
        receiver.read().unwrap();
        assert_eq!(receiver.count_incoming_fds(), 1);
        drop(receiver);
        assert!(pipe_writer_closed(reader));
    }

    #[test]
    fn test_read_on_full_ring_reports_overflow() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::with_capacity(local, 16, 4);
        let payload: Vec<u8> = (0u8..32).collect();
        peer.write_all(&payload).unwrap();

        assert_eq!(conn.read().unwrap(), ReadStatus::Data(16));
        assert!(matches!(conn.read(), Err(CoreError::BufferOverflow { size: 16, capacity: 16 })));

        // Ring state is still consistent
        assert_eq!(conn.pending_input(), 16);
        let mut out = [0u8; 16];
        conn.copy(&mut out);
        assert_eq!(&out[..], &payload[..16]);
    }

    #[test]
    fn test_fd_overflow_closes_the_whole_block() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::with_capacity(b, 4096, 2);

        let (reader, writer) = nix::unistd::pipe().unwrap();
        sender.queue_fd(writer.try_clone().unwrap()).unwrap();
        sender.queue_fd(writer.try_clone().unwrap()).unwrap();
        sender.queue_fd(writer).unwrap();
        sender.write(&[0u8; 4]).unwrap();
        sender.flush().unwrap();

        assert!(matches!(receiver.read(), Err(CoreError::FdOverflow(2))));
        assert_eq!(receiver.count_incoming_fds(), 0);
        assert_eq!(receiver.pending_input(), 0);
        assert!(pipe_writer_closed(reader));
    }

    #[test]
    fn test_fd_backlog_beyond_one_send_is_delivered() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);

        let (reader, writer) = nix::unistd::pipe().unwrap();
        for _ in 0..29 {
            sender.queue_fd(writer.try_clone().unwrap()).unwrap();
        }
        sender.write(&[1u8; 8]).unwrap();
        for _ in 0..29 {
            sender.queue_fd(writer.try_clone().unwrap()).unwrap();
        }
        sender.write(&[2u8; 8]).unwrap();
        drop(writer);
        assert_eq!(sender.queued_outgoing_fds(), 58);
        assert_eq!(sender.flush().unwrap(), FlushStatus::Done);
        assert_eq!(sender.queued_outgoing_fds(), 0);

        for _ in 0..16 {
            if receiver.pending_input() == 16 {
                break;
            }
            receiver.read().unwrap();
        }
        assert_eq!(receiver.pending_input(), 16);
        assert_eq!(receiver.count_incoming_fds(), 58);

        let mut bytes = [0u8; 16];
        receiver.copy(&mut bytes);
        assert_eq!(&bytes[..8], &[1u8; 8]);
        assert_eq!(&bytes[8..], &[2u8; 8]);

        drop(sender);
        drop(receiver);
        assert!(pipe_writer_closed(reader));
    }

    #[test]
    fn test_full_fd_queue_closes_fd_without_violation() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::with_capacity(local, 16, 4);
        let (reader, writer) = nix::unistd::pipe().unwrap();
        let (kept_reader, kept_writer) = nix::unistd::pipe().unwrap();
        for _ in 0..4 {
            conn.queue_fd(kept_writer.try_clone().unwrap()).unwrap();
        }

        let err = conn.queue_fd(writer).unwrap_err();
        assert!(matches!(err, CoreError::FdQueueFull(4)));
        assert!(!err.is_protocol_violation());
        assert_eq!(conn.queued_outgoing_fds(), 4);
        assert!(pipe_writer_closed(reader));

        drop(kept_writer);
        drop(conn);
        assert!(pipe_writer_closed(kept_reader));
    }

    #[test]
    fn test_peer_close_reads_as_closed() {
        let (local, peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(local);
        assert_eq!(conn.read().unwrap(), ReadStatus::WouldBlock);
        drop(peer);
        assert_eq!(conn.read().unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_take_message_consumes_exactly_one_message() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(local);
        let first = MessageHeader::new(1, 0, 12).encode();
        let second = MessageHeader::new(2, 3, 8).encode();
        peer.write_all(&first).unwrap();
        peer.write_all(&[9, 9, 9, 9]).unwrap();
        peer.write_all(&second).unwrap();
        conn.read().unwrap();

        let header = conn.peek_header().unwrap();
        assert_eq!(header.object_id, 1);
        let msg = conn.take_message(usize::from(header.size));
        assert_eq!(&msg[8..], &[9, 9, 9, 9]);
        conn.recycle_scratch(msg);

        assert_eq!(conn.peek_header().unwrap(), MessageHeader::new(2, 3, 8));
        assert_eq!(conn.pending_input(), 8);
    }
}
