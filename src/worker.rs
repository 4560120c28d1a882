use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::error::{Error, Result};

/// Completion signal of one worker thread, set when its body returns or
/// unwinds.
#[derive(Clone, Debug, Default)]
pub struct Completion(Arc<AtomicBool>);

impl Completion {
    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct CompletionGuard(Completion);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        (self.0).0.store(true, Ordering::Release);
    }
}

/// A named, detached worker thread with an explicit completion signal.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    done: Completion,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Completion::default();
        let signal = done.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _guard = CompletionGuard(signal);
                body();
            })
            .map_err(|e| Error::Spawn(name, e))?;

        debug!("Spawned {} thread", name);
        Ok(Self {
            name,
            handle: Some(handle),
            done,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.done.is_done()
    }

    pub fn completion(&self) -> Completion {
        self.done.clone()
    }

    /// Block until the thread exits. Joining twice is a no-op.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} thread panicked", self.name);
            }
        }
    }
}
