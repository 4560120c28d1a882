use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::net::{BpfProgram, Transport};

/// In-memory link: frames pushed by the test are returned by `recv`,
/// frames sent by the engines are recorded.
#[derive(Default)]
pub struct MockTransport {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    arrived: Condvar,
    sent: Mutex<Vec<Vec<u8>>>,
    held: Mutex<bool>,
    released: Condvar,
    broken: AtomicBool,
    deaf: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Vec<u8>) {
        self.inbox.lock().push_back(frame);
        self.arrived.notify_all();
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Make `send` block until `release` is called.
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    /// Fail every `send` from now on.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Fail every `recv` from now on.
    pub fn deafen(&self) {
        self.deaf.store(true, Ordering::Release);
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        drop(held);

        if self.broken.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        self.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn recv(&self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        if self.deaf.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "nic gone"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(frame) = inbox.pop_front() {
                return Ok(Some(frame));
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    let _ = self.arrived.wait_until(&mut inbox, deadline);
                }
                None => self.arrived.wait(&mut inbox),
            }
        }
    }
}

/// Link over a connected datagram socket pair, so the transport has a
/// real descriptor to poll. `inject` delivers a frame to the engine side,
/// `sent` drains what the engine transmitted.
pub struct DatagramTransport {
    local: UnixDatagram,
    peer: UnixDatagram,
}

impl DatagramTransport {
    pub fn new() -> io::Result<Self> {
        let (local, peer) = UnixDatagram::pair()?;
        peer.set_nonblocking(true)?;
        Ok(Self { local, peer })
    }

    pub fn inject(&self, frame: &[u8]) {
        self.peer.send(frame).unwrap();
    }

    pub fn sent(&self) -> usize {
        let mut buf = [0u8; 2048];
        let mut count = 0;
        while self.peer.recv(&mut buf).is_ok() {
            count += 1;
        }
        count
    }
}

impl Transport for DatagramTransport {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.local.send(frame).map(|_| ())
    }

    fn recv(&self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        match timeout {
            Some(t) if t.is_zero() => self.local.set_nonblocking(true)?,
            other => {
                self.local.set_nonblocking(false)?;
                self.local.set_read_timeout(other)?;
            }
        }
        let mut buf = vec![0u8; 65536];
        match self.local.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.local.as_raw_fd())
    }

    fn attach_filter(&self, program: &BpfProgram) -> io::Result<()> {
        program.attach(&self.local)
    }
}

/// Poll `probe` until it holds or a few seconds pass.
pub fn eventually(mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    probe()
}
