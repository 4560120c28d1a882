use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::context::Operation;
use crate::net::Transport;
use crate::packet::MetaPacket;
use crate::progress;
use crate::state::{Lifecycle, State};
use crate::worker::Worker;

/// Called after every transmission and once with `None` when the run ends.
/// Returning true stops the run.
pub type SendCallback = Box<dyn FnMut(Option<&MetaPacket>) -> bool + Send>;

#[derive(Debug, Default)]
struct SendProgress {
    count: u64,
    summary: String,
    percentage: f64,
}

struct SendShared {
    lifecycle: Lifecycle,
    packet: MetaPacket,
    tot_count: u64,
    inter: Duration,
    transport: Arc<dyn Transport>,
    progress: Mutex<SendProgress>,
    callback: Mutex<Option<SendCallback>>,
}

/// Transmits one packet `tot_count` times, `inter` apart.
pub struct SendContext {
    shared: Arc<SendShared>,
    worker: Option<Worker>,
}

impl SendContext {
    pub fn new(
        packet: MetaPacket,
        tot_count: u64,
        inter: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let progress = SendProgress {
            count: 0,
            summary: String::new(),
            percentage: if tot_count == 0 { 100.0 } else { 0.0 },
        };
        Self {
            shared: Arc::new(SendShared {
                lifecycle: Lifecycle::new(),
                packet,
                tot_count,
                inter,
                transport,
                progress: Mutex::new(progress),
                callback: Mutex::new(None),
            }),
            worker: None,
        }
    }

    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(Option<&MetaPacket>) -> bool + Send + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(callback));
        self
    }

    pub fn packet(&self) -> &MetaPacket {
        &self.shared.packet
    }

    pub fn count(&self) -> u64 {
        self.shared.progress.lock().count
    }

    pub fn tot_count(&self) -> u64 {
        self.shared.tot_count
    }

    pub fn inter(&self) -> Duration {
        self.shared.inter
    }
}

impl SendShared {
    fn run(&self) {
        debug!("Sender thread started");
        if let Err(e) = self.transmit() {
            error!("Sender failed: {}", e);
            self.progress.lock().summary = format!("Send failed: {}", e);
            self.lifecycle.fail();
        }

        self.notify(None);
        self.lifecycle.finish();
        debug!("Sender finished");
    }

    fn transmit(&self) -> io::Result<()> {
        while self.lifecycle.is_active() {
            if self.progress.lock().count >= self.tot_count {
                break;
            }
            self.transport.send(self.packet.encode())?;

            let finished = {
                let mut progress = self.progress.lock();
                progress.count += 1;
                progress.summary = if progress.count == self.tot_count {
                    format!("{} packet(s) sent.", self.tot_count)
                } else {
                    format!("Sending packet {} of {}", progress.count, self.tot_count)
                };
                progress.percentage = progress::fraction(progress.count, self.tot_count);
                progress.count == self.tot_count
            };

            if self.notify(Some(&self.packet)) {
                debug!("Send callback requested termination");
                self.lifecycle.request(State::NotRunning);
                break;
            }
            if finished || !self.lifecycle.is_active() {
                break;
            }
            thread::sleep(self.inter);
        }
        Ok(())
    }

    fn notify(&self, packet: Option<&MetaPacket>) -> bool {
        match self.callback.lock().as_mut() {
            Some(callback) => callback(packet),
            None => false,
        }
    }
}

impl Operation for SendContext {
    fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    fn on_start(&mut self) -> bool {
        let count = self.count();
        if count >= self.shared.tot_count {
            return false;
        }

        info!(
            "Sending {} packet(s) every {:?}",
            self.shared.tot_count - count,
            self.shared.inter
        );
        self.shared.lifecycle.launch();
        let shared = Arc::clone(&self.shared);
        match Worker::spawn("sender", move || shared.run()) {
            Ok(worker) => {
                self.worker = Some(worker);
                true
            }
            Err(e) => {
                self.shared.lifecycle.abort_launch();
                self.set_summary(e.to_string());
                false
            }
        }
    }

    fn on_restart(&mut self) -> bool {
        {
            let mut progress = self.shared.progress.lock();
            progress.count = 0;
            progress.percentage = 0.0;
        }
        self.on_start()
    }

    fn workers_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_alive)
    }

    fn join_workers(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            worker.join();
        }
    }

    fn summary(&self) -> String {
        self.shared.progress.lock().summary.clone()
    }

    fn set_summary(&self, summary: String) {
        self.shared.progress.lock().summary = summary;
    }

    fn percentage(&self) -> f64 {
        self.shared.progress.lock().percentage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::echo_request;
    use crate::testing::{eventually, MockTransport};

    fn recorder() -> (
        Arc<Mutex<Vec<bool>>>,
        impl FnMut(Option<&MetaPacket>) -> bool + Send + 'static,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |packet: Option<&MetaPacket>| {
            sink.lock().push(packet.is_some());
            false
        })
    }

    #[test]
    fn sends_every_packet() {
        let transport = Arc::new(MockTransport::new());
        let (events, callback) = recorder();
        let mut ctx = SendContext::new(echo_request(1, 1), 3, Duration::ZERO, transport.clone())
            .with_callback(callback);

        assert!(ctx.start());
        ctx.join();

        assert_eq!(transport.sent(), 3);
        assert_eq!(ctx.count(), 3);
        assert_eq!(ctx.percentage(), 100.0);
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(ctx.summary(), "3 packet(s) sent.");
        assert_eq!(*events.lock(), vec![true, true, true, false]);
    }

    #[test]
    fn nothing_left_to_send() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = SendContext::new(echo_request(1, 1), 0, Duration::ZERO, transport.clone());
        assert!(!ctx.start());
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(ctx.percentage(), 100.0);

        let mut ctx = SendContext::new(echo_request(1, 1), 2, Duration::ZERO, transport.clone());
        assert!(ctx.start());
        ctx.join();
        assert!(!ctx.start());
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(transport.sent(), 2);
    }

    #[test]
    fn callback_can_end_the_run() {
        let transport = Arc::new(MockTransport::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut ctx = SendContext::new(echo_request(1, 1), 10, Duration::ZERO, transport.clone())
            .with_callback(move |packet| {
                sink.lock().push(packet.is_some());
                true
            });

        assert!(ctx.start());
        ctx.join();

        assert_eq!(ctx.count(), 1);
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(*events.lock(), vec![true, false]);
    }

    #[test]
    fn stop_on_idle_context_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = SendContext::new(echo_request(1, 1), 1, Duration::ZERO, transport);
        assert!(ctx.stop());
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(ctx.stop());
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(!ctx.resume());
    }

    #[test]
    fn pause_keeps_counters_for_resume() {
        let transport = Arc::new(MockTransport::new());
        transport.hold();
        let mut ctx = SendContext::new(echo_request(1, 1), 5, Duration::ZERO, transport.clone());

        assert!(ctx.start());
        assert!(ctx.pause());
        transport.release();
        ctx.join();

        assert_eq!(ctx.state(), State::Paused);
        assert!(!ctx.pause());
        let paused_at = ctx.count();
        assert!(paused_at <= 1);
        assert!(!ctx.start());

        assert!(ctx.resume());
        ctx.join();
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(ctx.count(), 5);
        assert_eq!(transport.sent(), 5);
        assert_eq!(ctx.percentage(), 100.0);
    }

    #[test]
    fn stop_collapses_paused_context() {
        let transport = Arc::new(MockTransport::new());
        transport.hold();
        let mut ctx = SendContext::new(echo_request(1, 1), 5, Duration::ZERO, transport.clone());
        assert!(ctx.start());
        assert!(ctx.pause());
        transport.release();
        ctx.join();

        assert!(ctx.stop());
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(!ctx.resume());
    }

    #[test]
    fn restart_resets_counters() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = SendContext::new(echo_request(1, 1), 2, Duration::ZERO, transport.clone());
        assert!(ctx.start());
        ctx.join();
        assert_eq!(ctx.count(), 2);

        transport.hold();
        assert!(ctx.restart());
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.percentage(), 0.0);
        assert!(!ctx.restart());

        transport.release();
        ctx.join();
        assert_eq!(ctx.count(), 2);
        assert_eq!(transport.sent(), 4);
    }

    #[test]
    fn transport_failure_is_an_error_state() {
        let transport = Arc::new(MockTransport::new());
        transport.break_link();
        let (events, callback) = recorder();
        let mut ctx = SendContext::new(echo_request(1, 1), 3, Duration::ZERO, transport.clone())
            .with_callback(callback);

        assert!(ctx.start());
        ctx.join();

        assert_eq!(ctx.state(), State::Error);
        assert!(ctx.summary().starts_with("Send failed"));
        assert_eq!(ctx.count(), 0);
        assert_eq!(*events.lock(), vec![false]);
    }

    #[test]
    fn interval_spaces_transmissions() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = SendContext::new(
            echo_request(1, 1),
            3,
            Duration::from_millis(200),
            transport.clone(),
        );

        assert!(ctx.start());
        assert!(eventually(|| transport.sent() >= 1));
        assert!(ctx.workers_alive());
        assert!(ctx.stop());
        ctx.join();

        assert!(ctx.count() < 3);
        assert_eq!(ctx.state(), State::NotRunning);
    }
}
