use std::time::{Duration, Instant};

use log::info;

use crate::context::Operation;
use crate::state::State;

/// Periodic progress reporter for a running operation.
pub struct Monitor {
    interval: Duration,
    start: Instant,
}

impl Monitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            start: Instant::now(),
        }
    }

    /// Report on `op` until it leaves RUNNING, then join it.
    pub fn watch(&mut self, op: &mut dyn Operation) {
        self.start = Instant::now();
        while op.state() == State::Running && op.workers_alive() {
            std::thread::sleep(self.interval);
            self.update(op);
        }
        op.join();
        info!(
            "{:.0?} {}; {}",
            self.start.elapsed(),
            describe(op.state()),
            op.summary()
        );
    }

    fn update(&self, op: &dyn Operation) {
        let age = self.start.elapsed();
        if op.indeterminate() {
            info!("{:.0?} working; {}", age, op.summary());
        } else {
            info!("{:.0?} {:.2}%; {}", age, op.percentage(), op.summary());
        }
    }
}

fn describe(state: State) -> &'static str {
    match state {
        State::NotRunning => "done",
        State::Running => "running",
        State::Paused => "paused",
        State::Error => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::echo_request;
    use crate::send::SendContext;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    #[test]
    fn watch_returns_after_the_run() {
        let transport = Arc::new(MockTransport::new());
        let mut ctx = SendContext::new(
            echo_request(1, 1),
            3,
            Duration::from_millis(5),
            transport.clone(),
        );
        assert!(ctx.start());

        Monitor::new(Duration::from_millis(2)).watch(&mut ctx);
        assert_eq!(ctx.state(), State::NotRunning);
        assert!(!ctx.workers_alive());
        assert_eq!(transport.sent(), 3);
    }
}
