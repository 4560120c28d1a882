//! One-shot sender to receiver channel.
//!
//! The delta travels over a bounded channel; a pipe alongside it gives the
//! receiver a descriptor to poll. The write end closes when the sender side
//! is dropped, whether or not a delta was delivered.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

use log::debug;

use super::cache::CacheDelta;

pub struct HandoffSender {
    tx: SyncSender<CacheDelta>,
    _notify: OwnedFd,
}

enum Slot {
    Pending,
    Ready(Option<CacheDelta>),
}

pub struct HandoffReceiver {
    rx: Receiver<CacheDelta>,
    notify: OwnedFd,
    slot: Slot,
}

pub fn handoff() -> io::Result<(HandoffSender, HandoffReceiver)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 returned two fresh descriptors that nothing else owns
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let (tx, rx) = mpsc::sync_channel(1);
    Ok((
        HandoffSender {
            tx,
            _notify: write_end,
        },
        HandoffReceiver {
            rx,
            notify: read_end,
            slot: Slot::Pending,
        },
    ))
}

impl HandoffSender {
    /// Deliver the delta and close the channel.
    pub fn complete(self, delta: CacheDelta) {
        if self.tx.send(delta).is_err() {
            debug!("Receiver gone before the sender handed off its cache");
        }
    }
}

impl HandoffReceiver {
    pub fn raw_fd(&self) -> RawFd {
        self.notify.as_raw_fd()
    }

    /// True once the sender delivered its delta or went away. Never blocks.
    pub fn poll(&mut self) -> bool {
        if let Slot::Pending = self.slot {
            match self.rx.try_recv() {
                Ok(delta) => self.slot = Slot::Ready(Some(delta)),
                Err(TryRecvError::Disconnected) => self.slot = Slot::Ready(None),
                Err(TryRecvError::Empty) => return false,
            }
        }
        true
    }

    /// Wait for the sender. `None` means it exited without a delta.
    pub fn take(self) -> Option<CacheDelta> {
        match self.slot {
            Slot::Ready(delta) => delta,
            Slot::Pending => self.rx.recv().ok(),
        }
    }
}
