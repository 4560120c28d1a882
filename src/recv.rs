use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::net::handoff::HandoffReceiver;
use crate::net::poll::{Multiplexer, Ready, DEFAULT_GRANULARITY, MIN_GRANULARITY};
use crate::net::ArpCache;
use crate::packet::{Fingerprint, MetaPacket};
use crate::progress;
use crate::sendrecv::SendRecvShared;
use crate::state::State;
use crate::worker::Worker;

/// Receive side of a send/receive run. Owns the sender worker so it can
/// join it before settling the run.
pub(crate) struct Receiver {
    shared: Arc<SendRecvShared>,
    mux: Box<dyn Multiplexer>,
    handoff: HandoffReceiver,
    sender: Worker,
    cache: ArpCache,
    cooldown: Duration,
    granularity: Duration,
    fingerprint: Fingerprint,
}

impl Receiver {
    pub fn new(
        shared: Arc<SendRecvShared>,
        mux: Box<dyn Multiplexer>,
        handoff: HandoffReceiver,
        sender: Worker,
    ) -> Self {
        let fingerprint = shared.packet.fingerprint();
        Self {
            shared,
            mux,
            handoff,
            sender,
            cache: ArpCache::new(),
            cooldown: Duration::ZERO,
            granularity: DEFAULT_GRANULARITY,
            fingerprint,
        }
    }

    pub fn with_cache(mut self, cache: ArpCache) -> Self {
        self.cache = cache;
        self
    }

    /// After the sender is done, keep listening for `cooldown`, waking every
    /// `granularity` to check for a stop request.
    pub fn with_cooldown(mut self, cooldown: Duration, granularity: Duration) -> Self {
        self.cooldown = cooldown;
        self.granularity = granularity.max(MIN_GRANULARITY);
        self
    }

    pub fn run(mut self) {
        debug!("Receiver thread started");
        let outcome = self.correlate();
        if let Err(e) = &outcome {
            // Stop the sender before waiting on it
            error!("Receiver failed: {}", e);
            self.shared.lifecycle.fail();
        }

        match self.handoff.take() {
            Some(delta) if delta.is_empty() => debug!("Sender learned no bindings"),
            Some(delta) => {
                debug!("Merging {} learned binding(s)", delta.len());
                self.cache.merge(delta);
            }
            None => warn!("Sender exited without handing off its address cache"),
        }
        self.sender.join();

        match outcome {
            Err(e) => {
                self.shared.exchange.lock().summary = format!("Receive failed: {}", e);
            }
            Ok(()) if self.shared.lifecycle.state() != State::Error => {
                let mut exchange = self.shared.exchange.lock();
                exchange.summary = format!(
                    "{} of {} replies received",
                    exchange.answers,
                    exchange.answers + exchange.received
                );
            }
            Ok(()) => {}
        }

        self.shared.notify_recv(None, false);
        self.shared.lifecycle.finish();
        debug!("Receiver finished");
    }

    fn correlate(&mut self) -> io::Result<()> {
        let transport = Arc::clone(&self.shared.transport);
        let mut deadline: Option<Instant> = None;

        while self.shared.lifecycle.is_active() {
            let ready = match deadline {
                None => self.mux.wait(&*transport, Some(&mut self.handoff), None)?,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        debug!("Cooldown elapsed");
                        break;
                    }
                    self.mux
                        .wait(&*transport, None, Some(left.min(self.granularity)))?
                }
            };

            match ready {
                Ready::Frame(bytes) => {
                    if self.process(MetaPacket::new(bytes)) {
                        break;
                    }
                }
                Ready::Idle => {}
                Ready::SenderDone => {
                    debug!("Sender done, cooling down for {:?}", self.cooldown);
                    deadline = Some(Instant::now() + self.cooldown);
                }
            }
        }
        Ok(())
    }

    /// Account for one frame. Returns true when the loop should end.
    fn process(&self, frame: MetaPacket) -> bool {
        if frame.encode() == self.shared.packet.encode() {
            // Our own transmission looped back, e.g. on a loopback interface
            debug!("Skipping a copy of our own request");
            return false;
        }
        let is_reply =
            frame.fingerprint() == self.fingerprint && frame.is_answer_to(&self.shared.packet);

        let all_answered = {
            let mut exchange = self.shared.exchange.lock();
            if is_reply {
                exchange.answers += 1;
                exchange.remaining = exchange.remaining.saturating_sub(1);
                exchange.data.push(frame.clone());
            } else {
                exchange.received += 1;
            }
            exchange.summary = format!(
                "Received/Answered/Remaining {}/{}/{}",
                exchange.received, exchange.answers, exchange.remaining
            );
            exchange.percentage = progress::pulse(exchange.percentage);
            exchange.remaining == 0
        };

        if self.shared.notify_recv(Some(&frame), is_reply) {
            debug!("Receive hook requested termination");
            self.shared.lifecycle.request(State::NotRunning);
            return true;
        }
        all_answered
    }
}
