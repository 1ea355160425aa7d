//! Network Driver - Non-Blocking Sockets and the Suspend/Wake Contract
//!
//! The interpreter is single-threaded; network instructions that would
//! block return [`NetOutcome::Blocked`], the VM parks the thread in
//! `blocked_threads`, and this driver remembers which socket the thread
//! is waiting on. The scheduler's idle loop calls
//! [`NetDriver::number_of_wakeups`], which polls the parked sockets (with
//! a timeout only when the database is idle) and converts readiness into
//! `(thread_id)` wakeups drained one at a time with
//! [`NetDriver::get_wakeup`].
//!
//! A woken thread re-executes its whole byte code sequence, so every
//! operation here is retried from scratch after a wakeup; nothing is
//! half-done across a suspension.
//!
//! Error words surfaced to byte code: 0 is success, positive values are
//! fatal for the connection (the instruction takes its error branch and
//! the socket is already closed).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::word::Word;

/// Peer closed the connection.
pub const NET_ERROR_EOF: Word = 1;
/// Any other socket failure.
pub const NET_ERROR_IO: Word = 2;
/// The handle does not name an open socket.
pub const NET_ERROR_BAD_HANDLE: Word = 3;

/// Result of one network operation.
pub enum NetOutcome<T> {
    Ok(T),
    /// The operation would block; the thread must suspend and retry.
    Blocked,
    /// Fatal; the socket has been closed and the error word is for the
    /// byte code's error branch.
    Fatal(Word),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Interest {
    Read,
    Write,
}

enum Sock {
    Listener(TcpListener),
    Conn(TcpStream),
}

struct BlockedOp {
    thread_id: Word,
    handle: Word,
    interest: Interest,
}

/// A `(thread_id)` event: the named thread may make progress.
#[derive(Clone, Copy, Debug)]
pub struct Wakeup {
    pub thread_id: Word,
}

pub struct NetDriver {
    socks: FxHashMap<Word, Sock>,
    next_handle: Word,
    blocked: Vec<BlockedOp>,
    wakeups: VecDeque<Wakeup>,
}

impl Default for NetDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDriver {
    pub fn new() -> NetDriver {
        NetDriver {
            socks: FxHashMap::default(),
            next_handle: 1,
            blocked: Vec::new(),
            wakeups: VecDeque::new(),
        }
    }

    fn register(&mut self, sock: Sock) -> Word {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.socks.insert(handle, sock);
        handle
    }

    fn block(&mut self, thread_id: Word, handle: Word, interest: Interest) {
        self.blocked.push(BlockedOp {
            thread_id,
            handle,
            interest,
        });
    }

    /// Open a listening socket on `port`. Listening never blocks.
    pub fn listen(&mut self, port: u16) -> Result<Word, Word> {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => {
                if l.set_nonblocking(true).is_err() {
                    return Err(NET_ERROR_IO);
                }
                log::debug!("listening on port {port}");
                Ok(self.register(Sock::Listener(l)))
            }
            Err(e) => {
                log::warn!("listen on port {port} failed: {e}");
                Err(NET_ERROR_IO)
            }
        }
    }

    /// Accept one connection from a listening handle.
    pub fn accept(&mut self, thread_id: Word, handle: Word) -> NetOutcome<Word> {
        match self.socks.get(&handle) {
            Some(Sock::Listener(l)) => match l.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        return NetOutcome::Fatal(NET_ERROR_IO);
                    }
                    log::debug!("accepted connection from {peer}");
                    NetOutcome::Ok(self.register(Sock::Conn(stream)))
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.block(thread_id, handle, Interest::Read);
                    NetOutcome::Blocked
                }
                Err(_) => NetOutcome::Fatal(NET_ERROR_IO),
            },
            _ => NetOutcome::Fatal(NET_ERROR_BAD_HANDLE),
        }
    }

    /// Read one byte from a connection.
    pub fn read_char(&mut self, thread_id: Word, handle: Word) -> NetOutcome<u8> {
        let outcome = match self.socks.get_mut(&handle) {
            Some(Sock::Conn(stream)) => {
                let mut buf = [0u8; 1];
                match stream.read(&mut buf) {
                    Ok(0) => NetOutcome::Fatal(NET_ERROR_EOF),
                    Ok(_) => NetOutcome::Ok(buf[0]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        self.block(thread_id, handle, Interest::Read);
                        NetOutcome::Blocked
                    }
                    Err(_) => NetOutcome::Fatal(NET_ERROR_IO),
                }
            }
            _ => NetOutcome::Fatal(NET_ERROR_BAD_HANDLE),
        };
        if let NetOutcome::Fatal(_) = outcome {
            self.close(handle);
        }
        outcome
    }

    /// Write one byte to a connection.
    pub fn write_char(&mut self, thread_id: Word, handle: Word, c: u8) -> NetOutcome<()> {
        let outcome = match self.socks.get_mut(&handle) {
            Some(Sock::Conn(stream)) => match stream.write(&[c]) {
                Ok(0) => NetOutcome::Fatal(NET_ERROR_IO),
                Ok(_) => NetOutcome::Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.block(thread_id, handle, Interest::Write);
                    NetOutcome::Blocked
                }
                Err(_) => NetOutcome::Fatal(NET_ERROR_IO),
            },
            _ => NetOutcome::Fatal(NET_ERROR_BAD_HANDLE),
        };
        if let NetOutcome::Fatal(_) = outcome {
            self.close(handle);
        }
        outcome
    }

    /// Close a handle. Closing is immediate and idempotent.
    pub fn close(&mut self, handle: Word) {
        self.socks.remove(&handle);
    }

    /// Poll the sockets of every parked thread and queue a wakeup for
    /// each that can make progress. The timeout applies only when the
    /// database is idle; otherwise the poll returns immediately. Returns
    /// the number of wakeups now available.
    pub fn number_of_wakeups(&mut self, timeout: Option<Duration>) -> usize {
        if self.blocked.is_empty() {
            if let Some(t) = timeout {
                std::thread::sleep(t);
            }
            return self.wakeups.len();
        }
        self.poll(timeout);
        self.wakeups.len()
    }

    /// Drain one wakeup.
    pub fn get_wakeup(&mut self) -> Option<Wakeup> {
        self.wakeups.pop_front()
    }

    /// The local port of a listening handle, for tests binding port 0.
    pub fn local_port(&self, handle: Word) -> Option<u16> {
        match self.socks.get(&handle) {
            Some(Sock::Listener(l)) => l.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    #[cfg(unix)]
    fn poll(&mut self, timeout: Option<Duration>) {
        use std::os::unix::io::AsRawFd;

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.blocked.len());
        let mut ready_now: Vec<usize> = Vec::new();
        let mut polled: Vec<usize> = Vec::new();
        for (i, op) in self.blocked.iter().enumerate() {
            let fd = match self.socks.get(&op.handle) {
                Some(Sock::Listener(l)) => l.as_raw_fd(),
                Some(Sock::Conn(s)) => s.as_raw_fd(),
                // The socket went away while the thread slept: wake it so
                // the retried instruction surfaces the error.
                None => {
                    ready_now.push(i);
                    continue;
                }
            };
            let events = match op.interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            };
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            polled.push(i);
        }

        let timeout_ms = match timeout {
            _ if !ready_now.is_empty() => 0,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => 0,
        };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        let mut woken: Vec<usize> = ready_now;
        if rc > 0 {
            for (slot, &i) in polled.iter().enumerate() {
                if fds[slot].revents != 0 {
                    woken.push(i);
                }
            }
        }
        woken.sort_unstable();
        for &i in woken.iter().rev() {
            let op = self.blocked.swap_remove(i);
            self.wakeups.push_back(Wakeup {
                thread_id: op.thread_id,
            });
        }
    }

    #[cfg(not(unix))]
    fn poll(&mut self, timeout: Option<Duration>) {
        // Portable fallback: wake everyone and let the retried
        // instructions re-block if they still cannot progress.
        if let Some(t) = timeout {
            std::thread::sleep(t);
        }
        for op in self.blocked.drain(..) {
            self.wakeups.push_back(Wakeup {
                thread_id: op.thread_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_and_accept_blocks_until_connect() {
        let mut net = NetDriver::new();
        let lh = net.listen(0).unwrap();
        let port = net.local_port(lh).unwrap();

        match net.accept(7, lh) {
            NetOutcome::Blocked => {}
            _ => panic!("accept with no client should block"),
        }
        assert_eq!(net.number_of_wakeups(Some(Duration::from_millis(1))), 0);

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut waited = 0;
        while net.number_of_wakeups(Some(Duration::from_millis(10))) == 0 {
            waited += 1;
            assert!(waited < 200, "connect never became visible");
        }
        let w = net.get_wakeup().unwrap();
        assert_eq!(w.thread_id, 7);

        match net.accept(7, lh) {
            NetOutcome::Ok(conn) => assert!(conn != lh),
            _ => panic!("retried accept should succeed"),
        }
    }

    #[test]
    fn test_read_round_trip_and_eof() {
        let mut net = NetDriver::new();
        let lh = net.listen(0).unwrap();
        let port = net.local_port(lh).unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let conn = loop {
            match net.accept(1, lh) {
                NetOutcome::Ok(c) => break c,
                NetOutcome::Blocked => {
                    net.number_of_wakeups(Some(Duration::from_millis(10)));
                    net.get_wakeup();
                }
                NetOutcome::Fatal(e) => panic!("accept failed: {e}"),
            }
        };

        match net.read_char(1, conn) {
            NetOutcome::Blocked => {}
            _ => panic!("read with no data should block"),
        }
        client.write_all(b"z").unwrap();
        while net.number_of_wakeups(Some(Duration::from_millis(10))) == 0 {}
        net.get_wakeup().unwrap();
        match net.read_char(1, conn) {
            NetOutcome::Ok(b) => assert_eq!(b, b'z'),
            _ => panic!("retried read should deliver the byte"),
        }

        drop(client);
        loop {
            match net.read_char(1, conn) {
                NetOutcome::Fatal(e) => {
                    assert_eq!(e, NET_ERROR_EOF);
                    break;
                }
                NetOutcome::Blocked => {
                    net.number_of_wakeups(Some(Duration::from_millis(10)));
                    net.get_wakeup();
                }
                NetOutcome::Ok(_) => panic!("read past EOF"),
            }
        }
        // The connection is gone now.
        match net.read_char(1, conn) {
            NetOutcome::Fatal(e) => assert_eq!(e, NET_ERROR_BAD_HANDLE),
            _ => panic!("closed handle should be fatal"),
        }
    }

    #[test]
    fn test_bad_handle_is_fatal() {
        let mut net = NetDriver::new();
        match net.accept(1, 999) {
            NetOutcome::Fatal(e) => assert_eq!(e, NET_ERROR_BAD_HANDLE),
            _ => panic!(),
        }
        match net.write_char(1, 999, b'x') {
            NetOutcome::Fatal(e) => assert_eq!(e, NET_ERROR_BAD_HANDLE),
            _ => panic!(),
        }
    }
}
