//! Send a probe repeatedly and correlate the replies.
//!
//! Two workers cooperate: the sender transmits and learns address bindings
//! from what it sends, the receiver matches incoming frames against the
//! probe. When the sender is done it hands its learned bindings to the
//! receiver over a one-shot channel; the receiver merges them into the
//! shared [`ArpCache`] and joins the sender before settling the run.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::context::Operation;
use crate::net::handoff::{handoff, HandoffSender};
use crate::net::poll::{self, Multiplexer, PollingMux, DEFAULT_GRANULARITY};
use crate::net::{ArpCache, CacheDelta, Transport};
use crate::packet::MetaPacket;
use crate::progress;
use crate::recv::Receiver;
use crate::state::{Lifecycle, State};
use crate::worker::{Completion, Worker};

/// Called after every transmission with the running send count.
/// Returning true ends the run.
pub type SendHook = Box<dyn FnMut(&MetaPacket, u64) -> bool + Send>;

/// Called for every received frame with whether it answers the probe, and
/// once with `None` when the run ends. Returning true ends the run.
pub type RecvHook = Box<dyn FnMut(Option<&MetaPacket>, bool) -> bool + Send>;

/// Snapshot of the counters, read under one lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub count: u64,
    pub tot_count: u64,
    /// Frames that did not answer the probe.
    pub received: u64,
    pub answers: u64,
    pub remaining: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Exchange {
    pub count: u64,
    pub received: u64,
    pub answers: u64,
    pub remaining: u64,
    pub percentage: f64,
    pub summary: String,
    pub data: Vec<MetaPacket>,
}

pub(crate) struct SendRecvShared {
    pub lifecycle: Lifecycle,
    pub packet: MetaPacket,
    pub tot_count: u64,
    pub inter: Duration,
    pub transport: Arc<dyn Transport>,
    pub exchange: Mutex<Exchange>,
    on_send: Mutex<Option<SendHook>>,
    on_recv: Mutex<Option<RecvHook>>,
}

impl SendRecvShared {
    pub fn notify_send(&self, packet: &MetaPacket, count: u64) -> bool {
        match self.on_send.lock().as_mut() {
            Some(hook) => hook(packet, count),
            None => false,
        }
    }

    pub fn notify_recv(&self, packet: Option<&MetaPacket>, is_reply: bool) -> bool {
        match self.on_recv.lock().as_mut() {
            Some(hook) => hook(packet, is_reply),
            None => false,
        }
    }

    fn send_all(&self, handoff: HandoffSender) {
        debug!("Sender thread started");
        let mut delta = CacheDelta::default();
        match self.transmit(&mut delta) {
            Ok(()) => {
                debug!("Sender finished, handing off {} binding(s)", delta.len());
                handoff.complete(delta);
            }
            Err(e) => {
                // Dropping the handoff unsent tells the receiver we died
                error!("Sender failed: {}", e);
                self.exchange.lock().summary = format!("Send failed: {}", e);
                self.lifecycle.fail();
            }
        }
    }

    fn transmit(&self, delta: &mut CacheDelta) -> io::Result<()> {
        let pending = {
            let exchange = self.exchange.lock();
            self.tot_count.saturating_sub(exchange.count)
        };

        for _ in 0..pending {
            if !self.lifecycle.is_active() {
                break;
            }
            self.transport.send(self.packet.encode())?;
            delta.learn(&self.packet);

            let count = {
                let mut exchange = self.exchange.lock();
                exchange.count += 1;
                exchange.summary = format!("Sending packet {} of {}", exchange.count, self.tot_count);
                exchange.percentage = progress::pulse(exchange.percentage);
                exchange.count
            };

            if self.notify_send(&self.packet, count) {
                debug!("Send hook requested termination");
                self.lifecycle.request(State::NotRunning);
                break;
            }
            if !self.lifecycle.is_active() {
                break;
            }
            thread::sleep(self.inter);
        }
        Ok(())
    }
}

/// Sends `tot_count` copies of a probe and counts the frames answering it.
pub struct SendReceiveContext {
    shared: Arc<SendRecvShared>,
    cache: ArpCache,
    cooldown: Duration,
    granularity: Duration,
    force_polling: bool,
    sender: Option<Completion>,
    receiver: Option<Worker>,
}

impl SendReceiveContext {
    pub fn new(
        packet: MetaPacket,
        tot_count: u64,
        inter: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let exchange = Exchange {
            remaining: tot_count,
            ..Default::default()
        };
        Self {
            shared: Arc::new(SendRecvShared {
                lifecycle: Lifecycle::new(),
                packet,
                tot_count,
                inter,
                transport,
                exchange: Mutex::new(exchange),
                on_send: Mutex::new(None),
                on_recv: Mutex::new(None),
            }),
            cache: ArpCache::new(),
            cooldown: Duration::ZERO,
            granularity: DEFAULT_GRANULARITY,
            force_polling: false,
            sender: None,
            receiver: None,
        }
    }

    /// Keep correlating this long after the sender finished.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_poll_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity;
        self
    }

    /// Use the short-timeout multiplexer even where poll(2) works.
    pub fn force_polling(mut self, force: bool) -> Self {
        self.force_polling = force;
        self
    }

    /// Share an address cache with other contexts.
    pub fn with_cache(mut self, cache: ArpCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn on_send<F>(self, hook: F) -> Self
    where
        F: FnMut(&MetaPacket, u64) -> bool + Send + 'static,
    {
        *self.shared.on_send.lock() = Some(Box::new(hook));
        self
    }

    pub fn on_recv<F>(self, hook: F) -> Self
    where
        F: FnMut(Option<&MetaPacket>, bool) -> bool + Send + 'static,
    {
        *self.shared.on_recv.lock() = Some(Box::new(hook));
        self
    }

    pub fn packet(&self) -> &MetaPacket {
        &self.shared.packet
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    pub fn stats(&self) -> Stats {
        let exchange = self.shared.exchange.lock();
        Stats {
            count: exchange.count,
            tot_count: self.shared.tot_count,
            received: exchange.received,
            answers: exchange.answers,
            remaining: exchange.remaining,
        }
    }

    /// Replies collected so far.
    pub fn data(&self) -> Vec<MetaPacket> {
        self.shared.exchange.lock().data.clone()
    }

    fn multiplexer(&self) -> Box<dyn Multiplexer> {
        if self.force_polling {
            Box::new(PollingMux::new(self.granularity))
        } else {
            poll::probe(&*self.shared.transport, self.granularity)
        }
    }
}

impl Operation for SendReceiveContext {
    fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    fn on_start(&mut self) -> bool {
        let stats = self.stats();
        if stats.count >= stats.tot_count || stats.remaining == 0 {
            return false;
        }

        let (handoff_tx, handoff_rx) = match handoff() {
            Ok(pair) => pair,
            Err(e) => {
                self.set_summary(format!("Could not create handoff channel: {}", e));
                return false;
            }
        };
        let mux = self.multiplexer();

        info!(
            "Sending {} probe(s), expecting {} answer(s)",
            stats.tot_count - stats.count,
            stats.remaining
        );
        self.shared.lifecycle.launch();

        let shared = Arc::clone(&self.shared);
        let sender = match Worker::spawn("sender", move || shared.send_all(handoff_tx)) {
            Ok(worker) => worker,
            Err(e) => {
                self.shared.lifecycle.abort_launch();
                self.set_summary(e.to_string());
                return false;
            }
        };
        self.sender = Some(sender.completion());

        let receiver = Receiver::new(Arc::clone(&self.shared), mux, handoff_rx, sender)
            .with_cache(self.cache.clone())
            .with_cooldown(self.cooldown, self.granularity);
        match Worker::spawn("receiver", move || receiver.run()) {
            Ok(worker) => {
                self.receiver = Some(worker);
                true
            }
            Err(e) => {
                // The sender sees the cleared flag at its next checkpoint
                self.shared.lifecycle.abort_launch();
                self.set_summary(e.to_string());
                false
            }
        }
    }

    fn on_restart(&mut self) -> bool {
        {
            let mut exchange = self.shared.exchange.lock();
            exchange.count = 0;
            exchange.percentage = 0.0;
            exchange.remaining = self.shared.tot_count;
            exchange.answers = 0;
            exchange.received = 0;
            exchange.data.clear();
        }
        self.on_start()
    }

    fn workers_alive(&self) -> bool {
        self.sender.as_ref().is_some_and(|done| !done.is_done())
            || self.receiver.as_ref().is_some_and(Worker::is_alive)
    }

    fn join_workers(&mut self) {
        // The receiver joins the sender before it exits
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.join();
        }
    }

    fn summary(&self) -> String {
        self.shared.exchange.lock().summary.clone()
    }

    fn set_summary(&self, summary: String) {
        self.shared.exchange.lock().summary = summary;
    }

    fn percentage(&self) -> f64 {
        if self.state() != State::Running {
            return 100.0;
        }
        self.shared.exchange.lock().percentage
    }

    fn indeterminate(&self) -> bool {
        true
    }
}
