//! The lifecycle contract shared by every packet operation.
//!
//! Engines implement the `on_*` hooks and the accessors; the provided
//! methods guard the state transitions so every engine behaves the same
//! way from the caller's side.

use log::warn;

use crate::state::{Lifecycle, State};

pub trait Operation: Send {
    fn lifecycle(&self) -> &Lifecycle;

    /// Schedule work. Returns false if there is nothing to do or the
    /// workers could not be set up.
    fn on_start(&mut self) -> bool;

    fn on_resume(&mut self) -> bool {
        self.on_start()
    }

    /// Reset counters to their initial values and start again.
    fn on_restart(&mut self) -> bool;

    fn on_stop(&mut self) -> bool {
        true
    }

    /// None of the engines can suspend a transmission in flight, so a pause
    /// is a stop that keeps the counters for `resume`.
    fn on_pause(&mut self) -> bool {
        self.on_stop()
    }

    fn workers_alive(&self) -> bool;

    fn join_workers(&mut self);

    fn summary(&self) -> String;

    fn set_summary(&self, summary: String);

    fn percentage(&self) -> f64;

    /// True when `percentage` is an activity pulse rather than a fraction.
    fn indeterminate(&self) -> bool {
        false
    }

    fn state(&self) -> State {
        self.lifecycle().state()
    }

    fn start(&mut self) -> bool {
        if !matches!(self.state(), State::NotRunning | State::Error) || self.workers_alive() {
            return false;
        }
        self.on_start()
    }

    fn pause(&mut self) -> bool {
        if self.state() != State::Running {
            return false;
        }
        self.lifecycle().request(State::Paused);
        self.on_pause()
    }

    fn resume(&mut self) -> bool {
        if self.state() != State::Paused || self.workers_alive() {
            return false;
        }
        self.on_resume()
    }

    fn restart(&mut self) -> bool {
        if self.workers_alive() {
            return false;
        }
        self.on_restart()
    }

    /// Ask the workers to stop at their next checkpoint. Never blocks.
    fn stop(&mut self) -> bool {
        self.lifecycle().request(State::NotRunning);
        self.on_stop()
    }

    /// Wait for every worker of this context to terminate.
    fn join(&mut self) {
        self.join_workers();
        if self.lifecycle().abandon() {
            warn!("Workers exited without settling the operation state");
            self.set_summary(String::from("Worker terminated unexpectedly"));
        }
    }
}
