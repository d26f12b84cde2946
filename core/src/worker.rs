//! Background worker loop.
//!
//! One task drives the whole pipeline: poll outstanding responses,
//! advance to the next chapter when everything settled, submit whatever
//! became sendable, sleep, repeat. The loop can be paused, resumed, and
//! killed; all of its state is in the database, so killing it loses
//! nothing.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use strum_macros::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::Processor;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkerStatus {
    /// Never started.
    Initialized,
    Running,
    Paused,
    /// Every chapter has been processed.
    Complete,
    /// The task has exited.
    Dead,
}

pub struct Worker {
    processor: Arc<Processor>,
    running: watch::Sender<bool>,
    kill: CancellationToken,
    complete: Arc<AtomicBool>,
    poll_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(processor: Processor) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            processor: Arc::new(processor),
            running,
            kill: CancellationToken::new(),
            complete: Arc::new(AtomicBool::new(false)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            handle: Mutex::new(None),
        }
    }

    /// Shorten the sleep between cycles, used by tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn status(&self) -> WorkerStatus {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        match handle.as_ref() {
            None => WorkerStatus::Initialized,
            Some(handle) if handle.is_finished() => WorkerStatus::Dead,
            Some(_) if self.complete.load(Ordering::SeqCst) => WorkerStatus::Complete,
            Some(_) if !*self.running.borrow() => WorkerStatus::Paused,
            Some(_) => WorkerStatus::Running,
        }
    }

    /// Start the loop, or wake it up after a pause.
    pub fn resume(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            let processor = self.processor.clone();
            let mut running_rx = self.running.subscribe();
            let kill = self.kill.clone();
            let complete = self.complete.clone();
            let running_tx = self.running.clone();
            let poll_interval = self.poll_interval;
            *handle = Some(tokio::spawn(async move {
                run_loop(processor, &mut running_rx, running_tx, kill, complete, poll_interval)
                    .await;
            }));
            info!("worker started");
        }
        self.running.send_replace(true);
    }

    /// Stop processing after the current cycle. In-flight provider
    /// requests keep running server-side and are picked up on resume.
    pub fn pause(&self) {
        self.running.send_replace(false);
        info!("worker paused");
    }

    /// Stop the loop for good.
    pub fn kill(&self) {
        self.kill.cancel();
        // Wake the loop if it is parked waiting to run.
        self.running.send_replace(true);
        info!("worker killed");
    }
}

async fn run_loop(
    processor: Arc<Processor>,
    running: &mut watch::Receiver<bool>,
    running_tx: watch::Sender<bool>,
    kill: CancellationToken,
    complete: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    loop {
        while !*running.borrow() {
            if running.changed().await.is_err() {
                return;
            }
        }
        if kill.is_cancelled() {
            return;
        }

        // Errors that reach this level are non-retryable; the processor
        // already absorbed everything transient. Stop, leaving status
        // Dead, rather than hammering the provider with a doomed turn.
        if let Err(e) = processor.process_waiting().await {
            error!(error = %e, "failed to poll outstanding responses");
            return;
        }

        match processor.advance_chapter_if_needed().await {
            Ok(true) => {}
            Ok(false) => {
                info!("all chapters processed");
                complete.store(true, Ordering::SeqCst);
                running_tx.send_replace(false);
                continue;
            }
            Err(e) => {
                error!(error = %e, "failed to advance chapter");
                return;
            }
        }

        if let Err(e) = processor.process_sendable().await {
            error!(error = %e, "failed to submit sendable conversations");
            return;
        }

        tokio::select! {
            _ = kill.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
