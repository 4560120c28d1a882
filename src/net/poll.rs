//! Waiting on a transport and a handoff channel at the same time.

use std::io;
use std::time::Duration;

use log::debug;

use super::handoff::HandoffReceiver;
use super::Transport;

pub const DEFAULT_GRANULARITY: Duration = Duration::from_millis(50);
/// Shorter slices would turn the receive loop into a busy wait.
pub const MIN_GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum Ready {
    Frame(Vec<u8>),
    /// Nothing arrived before the timeout.
    Idle,
    /// The handoff channel delivered or closed.
    SenderDone,
}

pub trait Multiplexer: Send {
    /// Wait at most `timeout` (forever if `None`) for a frame or for the
    /// handoff channel to become ready.
    fn wait(
        &self,
        transport: &dyn Transport,
        handoff: Option<&mut HandoffReceiver>,
        timeout: Option<Duration>,
    ) -> io::Result<Ready>;
}

/// Short-timeout loop for transports without a pollable descriptor.
#[derive(Debug)]
pub struct PollingMux {
    granularity: Duration,
}

impl PollingMux {
    pub fn new(granularity: Duration) -> Self {
        Self {
            granularity: granularity.max(MIN_GRANULARITY),
        }
    }
}

impl Multiplexer for PollingMux {
    fn wait(
        &self,
        transport: &dyn Transport,
        handoff: Option<&mut HandoffReceiver>,
        timeout: Option<Duration>,
    ) -> io::Result<Ready> {
        let slice = timeout.map_or(self.granularity, |t| t.min(self.granularity));
        if let Some(frame) = transport.recv(Some(slice))? {
            return Ok(Ready::Frame(frame));
        }
        if let Some(handoff) = handoff {
            if handoff.poll() {
                return Ok(Ready::SenderDone);
            }
        }
        // Nothing reported ready, try the transport once more without blocking
        Ok(transport
            .recv(Some(Duration::ZERO))?
            .map_or(Ready::Idle, Ready::Frame))
    }
}

/// poll(2) on the transport descriptor and the handoff pipe.
#[derive(Debug, Default)]
pub struct BlockingMux;

impl Multiplexer for BlockingMux {
    fn wait(
        &self,
        transport: &dyn Transport,
        handoff: Option<&mut HandoffReceiver>,
        timeout: Option<Duration>,
    ) -> io::Result<Ready> {
        let Some(fd) = transport.raw_fd() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "transport has no pollable descriptor",
            ));
        };

        let mut fds = vec![libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        if let Some(handoff) = handoff.as_deref() {
            fds.push(libc::pollfd {
                fd: handoff.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let millis = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Ready::Idle);
            }
            return Err(err);
        }

        let revents = fds[0].revents;
        if revents & libc::POLLIN != 0 {
            return Ok(transport
                .recv(Some(Duration::ZERO))?
                .map_or(Ready::Idle, Ready::Frame));
        }
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("transport descriptor reported poll events {:#x}", revents),
            ));
        }
        if let Some(handoff) = handoff {
            if fds[1].revents != 0 && handoff.poll() {
                return Ok(Ready::SenderDone);
            }
        }
        Ok(Ready::Idle)
    }
}

/// Pick the multiplexer the platform and transport support.
pub fn probe(transport: &dyn Transport, granularity: Duration) -> Box<dyn Multiplexer> {
    if cfg!(any(target_os = "linux", target_os = "android")) && transport.raw_fd().is_some() {
        debug!("Receiver waits on descriptors with poll(2)");
        Box::new(BlockingMux)
    } else {
        debug!("Receiver polls every {:?}", granularity);
        Box::new(PollingMux::new(granularity))
    }
}
