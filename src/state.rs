use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NotRunning,
    Running,
    Paused,
    /// A worker failed mid-run; the cause is in the context summary.
    Error,
}

#[derive(Debug)]
struct Phase {
    state: State,
    /// Where a worker settles once it observes the cleared continuation flag.
    settle: State,
}

/// Lifecycle bookkeeping shared between a context and its workers.
///
/// The continuation flag is the only cancellation mechanism: workers poll
/// it at their checkpoints and settle into the requested state.
#[derive(Clone, Debug)]
pub struct Lifecycle {
    phase: Arc<Mutex<Phase>>,
    active: Arc<AtomicBool>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase {
                state: State::NotRunning,
                settle: State::NotRunning,
            })),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> State {
        self.phase.lock().state
    }

    /// Whether workers should keep going.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Enter RUNNING. Must happen before the first worker is spawned.
    pub(crate) fn launch(&self) {
        let mut phase = self.phase.lock();
        phase.state = State::Running;
        phase.settle = State::NotRunning;
        self.active.store(true, Ordering::Release);
    }

    /// Undo `launch` when no worker could be started.
    pub(crate) fn abort_launch(&self) {
        let mut phase = self.phase.lock();
        self.active.store(false, Ordering::Release);
        phase.state = State::NotRunning;
    }

    /// Clear the continuation flag and record where a running worker settles.
    pub(crate) fn request(&self, target: State) {
        let mut phase = self.phase.lock();
        self.active.store(false, Ordering::Release);
        match phase.state {
            State::Running => phase.settle = target,
            State::Paused if target == State::NotRunning => phase.state = State::NotRunning,
            _ => {}
        }
    }

    /// Called by the last worker of a run on its way out.
    pub(crate) fn finish(&self) {
        let mut phase = self.phase.lock();
        if phase.state != State::Error {
            phase.state = if self.active.load(Ordering::Acquire) {
                State::NotRunning
            } else {
                phase.settle
            };
        }
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn fail(&self) {
        let mut phase = self.phase.lock();
        self.active.store(false, Ordering::Release);
        phase.state = State::Error;
    }

    /// A handle another thread can use to stop the run.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.clone())
    }

    /// Move a run whose workers are all gone but never settled to ERROR.
    /// Returns true if that happened.
    pub(crate) fn abandon(&self) -> bool {
        let mut phase = self.phase.lock();
        if phase.state != State::Running {
            return false;
        }
        self.active.store(false, Ordering::Release);
        phase.state = State::Error;
        true
    }
}

/// Stops a run from outside its context, e.g. from a signal listener.
#[derive(Clone, Debug)]
pub struct StopHandle(Lifecycle);

impl StopHandle {
    pub fn stop(&self) {
        self.0.request(State::NotRunning);
    }
}
