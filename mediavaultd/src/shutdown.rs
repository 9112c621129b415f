use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::model::ChannelState;
use crate::sync::reconcile::{StateReconciler, StoreError};
use crate::sync::sequencer::{RunSummary, SequencerError, UploadSequencer};

#[derive(Debug, Default)]
struct SignalInner {
    triggered: AtomicBool,
    notify: Notify,
}

/// Cooperative "shutting down" flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.triggered.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Wraps channel runs: turns termination signals into the shutdown flag
/// and owns the single final snapshot write.
#[derive(Debug, Clone, Default)]
pub struct CrashRecoveryHandler {
    shutdown: ShutdownSignal,
    flushed: Arc<AtomicBool>,
}

impl CrashRecoveryHandler {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            flushed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Returns false when shutdown was already underway.
    pub fn on_signal(&self, name: &str) -> bool {
        if self.shutdown.trigger() {
            info!(signal = name, "shutdown requested, finishing in-flight file");
            true
        } else {
            info!(signal = name, "shutdown already in progress");
            false
        }
    }

    /// Listens for SIGINT and SIGTERM until the process exits.
    pub fn install(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let handler = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let name = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => "SIGINT",
                        Err(err) => {
                            warn!(error = %err, "cannot listen for SIGINT");
                            return;
                        }
                    },
                    _ = terminate.recv() => "SIGTERM",
                };
                #[cfg(not(unix))]
                let name = match tokio::signal::ctrl_c().await {
                    Ok(()) => "SIGINT",
                    Err(err) => {
                        warn!(error = %err, "cannot listen for SIGINT");
                        return;
                    }
                };
                handler.on_signal(name);
            }
        }))
    }

    /// Final full-snapshot write. Runs at most once per handler; later calls
    /// return `Ok(false)`.
    pub async fn finish(
        &self,
        reconciler: &StateReconciler,
        channel: &ChannelState,
    ) -> Result<bool, StoreError> {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        reconciler.flush_all(channel).await?;
        info!(channel = %channel.id, "final snapshot written");
        Ok(true)
    }

    /// Runs one channel; on interruption performs the final flush.
    pub async fn run_channel(
        &self,
        sequencer: &mut UploadSequencer,
        channel: &mut ChannelState,
    ) -> Result<RunSummary, SequencerError> {
        let summary = sequencer.run(channel).await?;
        if summary.interrupted() {
            if let Err(err) = self.finish(sequencer.reconciler(), channel).await {
                warn!(channel = %channel.id, error = %err, "final snapshot failed");
            }
        }
        Ok(summary)
    }
}
