// Download session: one key's record, its event bus, and the task supervising its worker.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::EventBus;
use super::events::ProgressEvent;
use super::interpret::ProgressInterpreter;
use super::state::SessionState;
use crate::worker::output::for_each_line;
use crate::worker::process::{signal_worker, WorkerError, WorkerProcess, WorkerSignal};
use crate::worker::traits::DownloadKey;

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub filename: String,
    pub state: SessionState,
    pub progress: f64,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub subscribed: bool,
}

/// Handle on the running worker, owned by the session record.
pub(crate) struct WorkerControl {
    pid: u32,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl WorkerControl {
    /// Stop the worker and wait until the supervisor has reaped it.
    pub(crate) async fn stop(self) -> Result<(), WorkerError> {
        self.cancel.cancel();
        let Some(supervisor) = self.supervisor else {
            return Ok(());
        };
        match supervisor.await {
            Ok(result) => result,
            Err(e) => {
                warn!("supervisor for worker {} panicked: {}", self.pid, e);
                Ok(())
            }
        }
    }
}

struct SessionRecord {
    state: SessionState,
    progress: f64,
    last_error: Option<String>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    worker: Option<WorkerControl>,
}

impl SessionRecord {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            progress: 0.0,
            last_error: None,
            exit_code: None,
            created_at: Utc::now(),
            finished_at: None,
            worker: None,
        }
    }
}

/// How a supervised worker came to an end.
enum WorkerExit {
    Exited(ExitStatus),
    Cancelled(ExitStatus),
    Lost(WorkerError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SupervisorSettings {
    pub terminate_grace: Duration,
    pub force_kill_timeout: Duration,
    pub output_drain: Duration,
}

/// Registry entry for one key. `record` is `None` only while a start is
/// being carried out.
pub(crate) struct SessionSlot {
    pub(crate) key: DownloadKey,
    pub(crate) control: Arc<tokio::sync::Mutex<()>>,
    record: Mutex<Option<SessionRecord>>,
    bus: Arc<EventBus>,
}

impl SessionSlot {
    pub(crate) fn new(key: DownloadKey, event_buffer: usize) -> Self {
        let bus = Arc::new(EventBus::new(key.as_str(), event_buffer));
        Self {
            key,
            control: Arc::new(tokio::sync::Mutex::new(())),
            record: Mutex::new(None),
            bus,
        }
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn state(&self) -> Option<SessionState> {
        self.record.lock().as_ref().map(|r| r.state)
    }

    pub(crate) fn snapshot(&self) -> Option<SessionSnapshot> {
        let record = self.record.lock();
        let record = record.as_ref()?;
        Some(SessionSnapshot {
            filename: self.key.to_string(),
            state: record.state,
            progress: record.progress,
            last_error: record.last_error.clone(),
            exit_code: record.exit_code,
            created_at: record.created_at,
            pid: record.worker.as_ref().map(|w| w.pid),
            subscribed: self.bus.has_subscriber(),
        })
    }

    /// Terminal, unwatched, and either delivered or unclaimed for `retention`.
    pub(crate) fn is_reapable(&self, retention: Duration) -> bool {
        let record = self.record.lock();
        let Some(record) = record.as_ref() else {
            return true;
        };
        if !record.state.is_terminal() || self.bus.has_subscriber() {
            return false;
        }
        self.bus.terminal_delivered()
            || record
                .finished_at
                .is_some_and(|at| at.elapsed() >= retention)
    }

    /// Record a worker that could not be launched.
    pub(crate) fn fail_to_launch(&self, error: &WorkerError) {
        let message = error.to_string();
        let mut record = self.record.lock();
        let record = record.insert(SessionRecord::new(SessionState::Failed));
        record.last_error = Some(message.clone());
        record.finished_at = Some(Instant::now());
        self.bus.publish(ProgressEvent::Error { message });
        self.bus.publish(ProgressEvent::Complete { exit_code: None });
    }

    /// Spawn the supervisor for `process` and mark the session downloading.
    pub(crate) fn begin(
        self: &Arc<Self>,
        process: WorkerProcess,
        settings: SupervisorSettings,
        on_finish: impl FnOnce() + Send + 'static,
    ) {
        let pid = process.pid();
        let cancel = CancellationToken::new();
        {
            let mut record = self.record.lock();
            let record = record.insert(SessionRecord::new(SessionState::Downloading));
            record.worker = Some(WorkerControl {
                pid,
                cancel: cancel.clone(),
                supervisor: None,
            });
        }

        let slot = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            let result = slot.supervise(process, cancel, settings).await;
            on_finish();
            result
        });

        let mut record = self.record.lock();
        match record.as_mut().and_then(|r| r.worker.as_mut()) {
            Some(worker) => worker.supervisor = Some(supervisor),
            // Already finished; the task has nothing left to await.
            None => drop(supervisor),
        }
    }

    /// Detach the worker control so the caller can stop it.
    pub(crate) fn take_worker(&self) -> Option<WorkerControl> {
        self.record.lock().as_mut().and_then(|r| r.worker.take())
    }

    /// Deliver pause/resume to the worker if the session is in `from`.
    pub(crate) fn signal(
        &self,
        from: SessionState,
        to: SessionState,
        signal: WorkerSignal,
    ) -> Result<bool, WorkerError> {
        let mut record = self.record.lock();
        let Some(record) = record.as_mut().filter(|r| r.state == from) else {
            return Ok(false);
        };
        let Some(worker) = &record.worker else {
            return Ok(false);
        };
        signal_worker(worker.pid, signal)?;
        record.state = to;
        info!("session {} {} -> {}", self.key, from, to);
        Ok(true)
    }

    fn apply(&self, event: ProgressEvent) {
        let mut record = self.record.lock();
        let Some(record) = record.as_mut() else {
            return;
        };
        match &event {
            ProgressEvent::Progress { percent } => {
                if *percent < record.progress {
                    debug!(
                        "session {} progress {} below {}, dropped",
                        self.key, percent, record.progress
                    );
                    return;
                }
                record.progress = *percent;
            }
            ProgressEvent::Error { message } => {
                record.last_error = Some(message.clone());
            }
            _ => {}
        }
        self.bus.publish(event);
    }

    async fn supervise(
        self: &Arc<Self>,
        mut process: WorkerProcess,
        cancel: CancellationToken,
        settings: SupervisorSettings,
    ) -> Result<(), WorkerError> {
        let interpreter = ProgressInterpreter::new();

        let stdout_task = process.take_stdout().map(|stdout| {
            let slot = Arc::clone(self);
            tokio::spawn(async move {
                for_each_line(stdout, |line| {
                    if let Some(event) = interpreter.interpret(line) {
                        slot.apply(event);
                    }
                })
                .await;
            })
        });
        let stderr_task = process.take_stderr().map(|stderr| {
            let slot = Arc::clone(self);
            tokio::spawn(async move {
                for_each_line(stderr, |line| {
                    if let Some(event) = interpreter.interpret_diagnostic(line) {
                        slot.apply(event);
                    }
                })
                .await;
            })
        });

        let exit = tokio::select! {
            status = process.wait() => match status {
                Ok(status) => WorkerExit::Exited(status),
                Err(e) => WorkerExit::Lost(e),
            },
            _ = cancel.cancelled() => {
                info!("session {} cancelling worker {}", self.key, process.pid());
                match process
                    .shutdown(settings.terminate_grace, settings.force_kill_timeout)
                    .await
                {
                    Ok(status) => WorkerExit::Cancelled(status),
                    Err(e) => WorkerExit::Lost(e),
                }
            }
        };

        // Everything the worker wrote must be published before the terminal event.
        for mut task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(settings.output_drain, &mut task)
                .await
                .is_err()
            {
                warn!("session {} output still open after exit, abandoning", self.key);
                task.abort();
            }
        }

        self.finish(exit, &interpreter)
    }

    fn finish(
        &self,
        exit: WorkerExit,
        interpreter: &ProgressInterpreter,
    ) -> Result<(), WorkerError> {
        let mut record = self.record.lock();
        let Some(record) = record.as_mut() else {
            return Ok(());
        };
        record.worker = None;
        record.finished_at = Some(Instant::now());

        match exit {
            WorkerExit::Exited(status) => {
                let event = interpreter.exited(status);
                record.exit_code = status.code();
                if record.state.is_active() {
                    record.state = SessionState::after_exit(record.exit_code);
                }
                if record.state == SessionState::Failed && record.last_error.is_none() {
                    record.last_error = Some(format!("worker exited with {}", status));
                }
                info!("session {} worker exited: {} ({})", self.key, status, record.state);
                self.bus.publish(event);
                Ok(())
            }
            WorkerExit::Cancelled(status) => {
                // No worker is left, so the record must not stay active.
                record.exit_code = status.code();
                record.state = SessionState::Failed;
                record.last_error.get_or_insert_with(|| "cancelled".to_string());
                info!("session {} cancelled, worker exited: {}", self.key, status);
                self.bus.publish(ProgressEvent::Cancelled);
                Ok(())
            }
            WorkerExit::Lost(error) => {
                let message = error.to_string();
                warn!("session {} lost its worker: {}", self.key, message);
                record.state = SessionState::Failed;
                record.last_error = Some(message.clone());
                self.bus.publish(ProgressEvent::Error { message });
                self.bus.publish(ProgressEvent::Complete { exit_code: None });
                Err(error)
            }
        }
    }
}
