//! Continuous capture on one interface.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::context::Operation;
use crate::net::poll::DEFAULT_GRANULARITY;
use crate::net::{BpfProgram, RawEthSocket, Transport};
use crate::packet::MetaPacket;
use crate::progress;
use crate::state::{Lifecycle, State};
use crate::worker::Worker;

/// Called for every captured frame and once with `None` when the capture
/// ends. Returning true ends the capture.
pub type SniffCallback = Box<dyn FnMut(Option<&MetaPacket>) -> bool + Send>;

/// Independent bounds; the capture completes when the mean of the
/// configured ratios reaches 100%.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StopConditions {
    pub count: Option<u64>,
    pub time: Option<Duration>,
    pub size: Option<u64>,
}

impl StopConditions {
    pub fn is_bounded(&self) -> bool {
        self.completion(0, 0, 0.0).is_some()
    }

    fn completion(&self, count: u64, size: u64, secs: f64) -> Option<f64> {
        progress::mean_of_bounds(&[
            (count as f64, self.count.map(|c| c as f64)),
            (secs, self.time.map(|t| t.as_secs_f64())),
            (size as f64, self.size.map(|s| s as f64)),
        ])
    }
}

struct Capture {
    tot_count: u64,
    tot_size: u64,
    /// Seconds, summed from the gaps between consecutive frames.
    tot_time: f64,
    percentage: f64,
    summary: String,
    data: Vec<MetaPacket>,
    prev: DateTime<Local>,
}

impl Capture {
    fn record(&mut self, frame: &MetaPacket) {
        self.tot_count += 1;
        self.tot_size += frame.size() as u64;

        let now = frame.timestamp();
        // A clock stepping backwards yields a negative gap, which is skipped
        if let Ok(gap) = now.signed_duration_since(self.prev).to_std() {
            self.tot_time += gap.as_secs_f64();
        }
        self.prev = now;
        self.data.push(frame.clone());
    }

    fn status(&self) -> String {
        format!(
            "{}/{}/{} pks",
            progress::format_size(self.tot_size),
            progress::format_duration(self.tot_time),
            self.tot_count
        )
    }
}

struct SniffShared {
    lifecycle: Lifecycle,
    iface: String,
    stop: StopConditions,
    capture: Mutex<Capture>,
    callback: Mutex<Option<SniffCallback>>,
}

impl SniffShared {
    fn run(&self, transport: &dyn Transport) {
        debug!("Sniffer thread started on {}", self.iface);
        if let Err(e) = self.ingest(transport) {
            error!("Capture on {} failed: {}", self.iface, e);
            self.capture.lock().summary = format!("Sniff failed: {}", e);
            self.lifecycle.fail();
        }

        {
            let mut capture = self.capture.lock();
            capture.percentage = 100.0;
            if self.lifecycle.state() != State::Error {
                capture.summary = format!("Finished sniffing on {} ({})", self.iface, capture.status());
                info!("{}", capture.summary);
            }
        }

        self.notify(None);
        self.lifecycle.finish();
        debug!("Sniffer finished");
    }

    fn ingest(&self, transport: &dyn Transport) -> io::Result<()> {
        while self.lifecycle.is_active() {
            let Some(bytes) = transport.recv(Some(DEFAULT_GRANULARITY))? else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            let frame = MetaPacket::new(bytes);

            let complete = {
                let mut capture = self.capture.lock();
                capture.record(&frame);
                match self
                    .stop
                    .completion(capture.tot_count, capture.tot_size, capture.tot_time)
                {
                    Some(percentage) => {
                        capture.percentage = percentage;
                        percentage >= 100.0
                    }
                    None => {
                        capture.percentage = progress::pulse(capture.percentage);
                        false
                    }
                }
            };

            if self.notify(Some(&frame)) {
                debug!("Sniff callback requested termination");
                self.lifecycle.request(State::NotRunning);
                break;
            }
            if complete {
                debug!("Stop conditions reached");
                break;
            }
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

/// Captures frames until stopped or until its stop conditions complete.
pub struct SniffContext {
    shared: Arc<SniffShared>,
    transport: Option<Arc<dyn Transport>>,
    filter: Option<BpfProgram>,
    worker: Option<Worker>,
}

impl SniffContext {
    pub fn new(iface: impl Into<String>, stop: StopConditions) -> Self {
        let iface = iface.into();
        let capture = Capture {
            tot_count: 0,
            tot_size: 0,
            tot_time: 0.0,
            percentage: 0.0,
            summary: format!("Sniffing on {}", iface),
            data: Vec::new(),
            prev: Local::now(),
        };
        Self {
            shared: Arc::new(SniffShared {
                lifecycle: Lifecycle::new(),
                iface,
                stop,
                capture: Mutex::new(capture),
                callback: Mutex::new(None),
            }),
            transport: None,
            filter: None,
            worker: None,
        }
    }

    /// Capture from an already open transport instead of opening the
    /// interface on start.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Only capture frames the program accepts.
    pub fn with_filter(mut self, filter: BpfProgram) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(Option<&MetaPacket>) -> bool + Send + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(callback));
        self
    }

    pub fn iface(&self) -> &str {
        &self.shared.iface
    }

    pub fn stop_conditions(&self) -> StopConditions {
        self.shared.stop
    }

    pub fn tot_count(&self) -> u64 {
        self.shared.capture.lock().tot_count
    }

    pub fn tot_size(&self) -> u64 {
        self.shared.capture.lock().tot_size
    }

    pub fn tot_time(&self) -> Duration {
        Duration::from_secs_f64(self.shared.capture.lock().tot_time)
    }

    pub fn data(&self) -> Vec<MetaPacket> {
        self.shared.capture.lock().data.clone()
    }

    fn begin(&mut self, fresh: bool) -> bool {
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => match RawEthSocket::open(&self.shared.iface) {
                Ok(socket) => {
                    let transport: Arc<dyn Transport> = Arc::new(socket);
                    self.transport = Some(Arc::clone(&transport));
                    transport
                }
                Err(e) => {
                    self.set_summary(e.to_string());
                    return false;
                }
            },
        };
        if let Some(filter) = &self.filter {
            if let Err(e) = transport.attach_filter(filter) {
                error!("Could not attach capture filter on {}: {}", self.shared.iface, e);
                self.set_summary(format!("Could not attach capture filter: {}", e));
                return false;
            }
        }

        {
            let mut capture = self.shared.capture.lock();
            capture.prev = Local::now();
            capture.summary = format!("Sniffing on {}", self.shared.iface);
            if fresh {
                capture.data.clear();
            }
        }

        info!("Sniffing on {}", self.shared.iface);
        self.shared.lifecycle.launch();
        let shared = Arc::clone(&self.shared);
        match Worker::spawn("sniffer", move || shared.run(&*transport)) {
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
}

impl Operation for SniffContext {
    fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    fn on_start(&mut self) -> bool {
        self.begin(true)
    }

    fn on_resume(&mut self) -> bool {
        self.begin(false)
    }

    fn on_restart(&mut self) -> bool {
        {
            let mut capture = self.shared.capture.lock();
            capture.tot_count = 0;
            capture.tot_size = 0;
            capture.tot_time = 0.0;
            capture.percentage = 0.0;
        }
        self.begin(true)
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
        self.shared.capture.lock().summary.clone()
    }

    fn set_summary(&self, summary: String) {
        self.shared.capture.lock().summary = summary;
    }

    fn percentage(&self) -> f64 {
        if self.state() != State::Running {
            return 100.0;
        }
        self.shared.capture.lock().percentage
    }

    fn indeterminate(&self) -> bool {
        !self.shared.stop.is_bounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{udp, HOST_IP, PEER_IP};
    use crate::testing::{eventually, DatagramTransport, MockTransport};

    fn frame() -> Vec<u8> {
        udp(PEER_IP, HOST_IP, 53, 4000).encode().to_vec()
    }

    fn sniffer(transport: &Arc<MockTransport>, stop: StopConditions) -> SniffContext {
        SniffContext::new("test0", stop).with_transport(transport.clone())
    }

    #[test]
    fn stops_after_count() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..12 {
            transport.push(frame());
        }
        let stop = StopConditions {
            count: Some(10),
            ..Default::default()
        };
        let mut ctx = sniffer(&transport, stop);

        assert!(ctx.start());
        ctx.join();

        assert_eq!(ctx.tot_count(), 10);
        assert_eq!(ctx.data().len(), 10);
        assert_eq!(ctx.percentage(), 100.0);
        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(transport.pending(), 2);
        assert!(ctx.summary().starts_with("Finished sniffing on test0 ("));
        assert!(ctx.summary().ends_with("/10 pks)"));
    }

    #[test]
    fn frames_fed_one_at_a_time() {
        let transport = Arc::new(MockTransport::new());
        let stop = StopConditions {
            count: Some(10),
            ..Default::default()
        };
        let mut ctx = sniffer(&transport, stop);
        assert!(ctx.start());

        for sent in 1..=10 {
            transport.push(frame());
            assert!(eventually(|| ctx.tot_count() == sent));
        }
        ctx.join();

        assert_eq!(ctx.tot_count(), 10);
        assert_eq!(ctx.percentage(), 100.0);
        assert_eq!(ctx.state(), State::NotRunning);
    }

    #[test]
    fn percentage_is_mean_of_bounds() {
        let transport = Arc::new(MockTransport::new());
        let size = frame().len() as u64;
        let stop = StopConditions {
            count: Some(10),
            size: Some(size * 10),
            time: None,
        };
        let mut ctx = sniffer(&transport, stop);
        assert!(!ctx.indeterminate());
        assert!(ctx.start());

        for _ in 0..5 {
            transport.push(frame());
        }
        assert!(eventually(|| ctx.tot_count() == 5));
        assert_eq!(ctx.state(), State::Running);
        assert_eq!(ctx.percentage(), 50.0);

        for _ in 0..5 {
            transport.push(frame());
        }
        ctx.join();
        assert_eq!(ctx.tot_count(), 10);
        assert_eq!(ctx.tot_size(), size * 10);
        assert_eq!(ctx.state(), State::NotRunning);
    }

    #[test]
    fn unbounded_capture_runs_until_stopped() {
        let transport = Arc::new(MockTransport::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut ctx = sniffer(&transport, StopConditions::default()).with_callback(move |p| {
            sink.lock().push(p.is_some());
            false
        });
        assert!(ctx.indeterminate());
        assert!(ctx.start());

        for _ in 0..3 {
            transport.push(frame());
        }
        assert!(eventually(|| ctx.tot_count() == 3));
        assert!(ctx.stop());
        ctx.join();

        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(ctx.percentage(), 100.0);
        assert_eq!(*events.lock(), vec![true, true, true, false]);
        assert!(ctx.summary().starts_with("Finished sniffing on test0 ("));
    }

    #[test]
    fn resume_keeps_data_restart_clears_it() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = sniffer(&transport, StopConditions::default());
        assert!(ctx.start());
        transport.push(frame());
        assert!(eventually(|| ctx.tot_count() == 1));
        assert!(ctx.pause());
        ctx.join();
        assert_eq!(ctx.state(), State::Paused);

        assert!(ctx.resume());
        transport.push(frame());
        assert!(eventually(|| ctx.tot_count() == 2));
        assert_eq!(ctx.data().len(), 2);
        ctx.stop();
        ctx.join();

        assert!(ctx.restart());
        assert_eq!(ctx.tot_count(), 0);
        assert_eq!(ctx.tot_size(), 0);
        assert_eq!(ctx.tot_time(), Duration::ZERO);
        assert!(ctx.data().is_empty());
        ctx.stop();
        ctx.join();
        assert_eq!(ctx.state(), State::NotRunning);
    }

    #[test]
    fn callback_can_end_the_capture() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.push(frame());
        }
        let mut ctx = sniffer(&transport, StopConditions::default()).with_callback(|p| p.is_some());
        assert!(ctx.start());
        ctx.join();

        assert_eq!(ctx.tot_count(), 1);
        assert_eq!(ctx.state(), State::NotRunning);
    }

    #[test]
    fn missing_interface_fails_to_start() {
        let mut ctx = SniffContext::new("no-such-iface0", StopConditions::default());
        assert!(!ctx.start());
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(ctx.summary().contains("no-such-iface0"));
    }

    #[test]
    fn time_bound_counts_gaps_between_frames() {
        let mut capture = Capture {
            tot_count: 0,
            tot_size: 0,
            tot_time: 0.0,
            percentage: 0.0,
            summary: String::new(),
            data: Vec::new(),
            prev: Local::now(),
        };
        let start = capture.prev;
        let later = MetaPacket::with_time(frame(), start + chrono::Duration::seconds(3));
        let earlier = MetaPacket::with_time(frame(), start + chrono::Duration::seconds(1));

        capture.record(&later);
        capture.record(&earlier);
        assert_eq!(capture.tot_count, 2);
        assert!((capture.tot_time - 3.0).abs() < 1e-9);

        let stop = StopConditions {
            time: Some(Duration::from_secs(6)),
            ..Default::default()
        };
        assert_eq!(stop.completion(2, 0, capture.tot_time), Some(50.0));
        assert!(capture.status().ends_with("/3 s/2 pks"));
    }

    #[test]
    fn filter_limits_what_is_captured() {
        let transport = Arc::new(DatagramTransport::new().unwrap());
        let filter =
            BpfProgram::from_bytecode("4,48 0 0 0,21 0 1 170,6 0 0 65535,6 0 0 0").unwrap();
        let stop = StopConditions {
            count: Some(2),
            ..Default::default()
        };
        let mut ctx = SniffContext::new("test0", stop)
            .with_transport(transport.clone())
            .with_filter(filter);
        assert!(ctx.start());

        transport.inject(&[0xbb, 1]);
        transport.inject(&[0xaa, 2]);
        transport.inject(&[0xbb, 3]);
        transport.inject(&[0xaa, 4]);
        ctx.join();

        let data = ctx.data();
        assert_eq!(ctx.tot_count(), 2);
        assert_eq!(data[0].encode(), &[0xaa, 2]);
        assert_eq!(data[1].encode(), &[0xaa, 4]);
    }

    #[test]
    fn filter_needs_a_capable_transport() {
        let transport = Arc::new(MockTransport::new());
        let filter = BpfProgram::from_bytecode("1,6 0 0 65535").unwrap();
        let mut ctx = sniffer(&transport, StopConditions::default()).with_filter(filter);

        assert!(!ctx.start());
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(ctx.summary().starts_with("Could not attach capture filter"));
    }

    #[test]
    fn stop_handle_ends_an_unbounded_capture() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = sniffer(&transport, StopConditions::default());
        let stopper = ctx.lifecycle().stop_handle();
        assert!(ctx.start());

        transport.push(frame());
        transport.push(frame());
        assert!(eventually(|| ctx.tot_count() == 2));
        std::thread::spawn(move || stopper.stop()).join().unwrap();
        ctx.join();

        assert_eq!(ctx.state(), State::NotRunning);
        assert_eq!(ctx.data().len(), 2);
    }
}
