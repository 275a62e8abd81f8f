//! Progress reporting, cooperative cancellation and the background worker
//! that long-running operations execute on.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, anyhow};
use log::info;

use crate::error::SurveyError;

/// Receives `(message, percent)` updates. `percent` is `None` for phases
/// whose length is unknown.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str, percent: Option<f32>);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, Option<f32>) + Send + Sync,
{
    fn report(&self, message: &str, percent: Option<f32>) {
        self(message, percent)
    }
}

/// Sends progress to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, message: &str, percent: Option<f32>) {
        match percent {
            Some(pct) => info!("[{pct:>5.1}%] {message}"),
            None => info!("{message}"),
        }
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _message: &str, _percent: Option<f32>) {}
}

pub fn percent(done: usize, total: usize) -> Option<f32> {
    if total == 0 {
        None
    } else {
        Some((done as f32 / total as f32 * 100.0).min(100.0))
    }
}

/// Shared cancellation flag, polled at chunk boundaries and every few
/// thousand rows inside long loops.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SurveyError> {
        if self.is_cancelled() {
            Err(SurveyError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A job running on its own thread.
pub struct Worker<T> {
    handle: JoinHandle<Result<T>>,
    token: CancellationToken,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: &str, job: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
    {
        let token = CancellationToken::new();
        let job_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(job_token))
            .with_context(|| format!("Spawning worker thread '{name}'"))?;
        Ok(Worker { handle, token })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| anyhow!("Worker thread panicked"))?
    }
}
