// Session registry: the single source of truth for live downloads, one lock per key.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::bus::Subscription;
use super::session::{SessionSlot, SessionSnapshot, SupervisorSettings};
use super::state::{transition, ControlAction, Refusal, SessionState, Transition};
use crate::config::OrchestratorConfig;
use crate::worker::process::{WorkerError, WorkerSignal};
use crate::worker::traits::{DownloadKey, WorkerLauncher};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a download for {0} is already active")]
    AlreadyActive(DownloadKey),
    #[error("no download session for {0}")]
    NoSuchSession(DownloadKey),
    #[error("{0} is not supported by the worker")]
    UnsupportedAction(ControlAction),
    #[error("cannot {action} a download that is {state}")]
    InvalidTransition {
        action: ControlAction,
        state: SessionState,
    },
    #[error("failed to start worker: {0}")]
    Spawn(#[source] WorkerError),
    #[error("worker control failed: {0}")]
    Worker(#[source] WorkerError),
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub event_buffer: usize,
    pub terminate_grace: Duration,
    pub force_kill_timeout: Duration,
    pub output_drain: Duration,
    pub unclaimed_retention: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            event_buffer: config.event_buffer,
            terminate_grace: config.terminate_grace(),
            force_kill_timeout: config.force_kill_timeout(),
            output_drain: config.output_drain(),
            unclaimed_retention: config.unclaimed_retention(),
        }
    }

    fn supervisor(&self) -> SupervisorSettings {
        SupervisorSettings {
            terminate_grace: self.terminate_grace,
            force_kill_timeout: self.force_kill_timeout,
            output_drain: self.output_drain,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

struct RegistryInner {
    slots: DashMap<DownloadKey, Arc<SessionSlot>>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: RegistrySettings,
}

/// Owns every session. Control actions on the same key are serialized;
/// different keys never wait on each other.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: DashMap::new(),
                launcher,
                settings,
            }),
        }
    }

    pub fn supports_pause(&self) -> bool {
        self.inner.launcher.supports_pause()
    }

    /// Lock the slot for `key`, creating an empty one if asked.
    ///
    /// Slots are only removed under their own lock, so after locking we check
    /// the slot is still the registered one and retry otherwise.
    async fn lock_slot(
        &self,
        key: &DownloadKey,
        create: bool,
    ) -> Option<(Arc<SessionSlot>, OwnedMutexGuard<()>)> {
        loop {
            let slot = if create {
                self.inner
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| {
                        Arc::new(SessionSlot::new(key.clone(), self.inner.settings.event_buffer))
                    })
                    .value()
                    .clone()
            } else {
                self.inner.slots.get(key)?.value().clone()
            };

            let guard = Arc::clone(&slot.control).lock_owned().await;
            let current = self
                .inner
                .slots
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
            if current {
                return Some((slot, guard));
            }
        }
    }

    /// Validate `action` for `key` and carry it out.
    pub async fn apply(
        &self,
        key: &DownloadKey,
        action: ControlAction,
    ) -> Result<Transition, ControlError> {
        let create = action == ControlAction::Start;
        let Some((slot, guard)) = self.lock_slot(key, create).await else {
            return match transition(None, action) {
                Ok(step) => Ok(step),
                Err(refusal) => Err(self.refused(key, action, refusal)),
            };
        };

        let step = transition(slot.state(), action)
            .map_err(|refusal| self.refused(key, action, refusal))?;
        debug!("session {} {} accepted as {:?}", key, action, step);

        match step {
            Transition::Spawn => self.spawn(&slot).await?,
            Transition::Pause => {
                if !self.supports_pause() {
                    return Err(ControlError::UnsupportedAction(action));
                }
                self.signal(&slot, SessionState::Downloading, SessionState::Paused, WorkerSignal::Pause)?;
            }
            Transition::Resume => {
                if !self.supports_pause() {
                    return Err(ControlError::UnsupportedAction(action));
                }
                self.signal(&slot, SessionState::Paused, SessionState::Downloading, WorkerSignal::Resume)?;
            }
            Transition::Terminate => {
                // The stop runs in its own task holding the key lock, so it
                // completes and removes the session even if this caller is dropped.
                let registry = self.clone();
                let stopping = tokio::spawn(async move {
                    let _guard = guard;
                    registry.terminate(&slot).await
                });
                match stopping.await {
                    Ok(result) => result?,
                    Err(e) => {
                        return Err(ControlError::Worker(WorkerError::Io(io::Error::other(e))));
                    }
                }
            }
            Transition::Reset => {
                self.remove(&slot);
                info!("session {} reset", key);
            }
            Transition::Nothing => {}
        }
        Ok(step)
    }

    pub async fn start(&self, key: &DownloadKey) -> Result<(), ControlError> {
        self.apply(key, ControlAction::Start).await.map(|_| ())
    }

    pub async fn pause(&self, key: &DownloadKey) -> Result<(), ControlError> {
        self.apply(key, ControlAction::Pause).await.map(|_| ())
    }

    pub async fn resume(&self, key: &DownloadKey) -> Result<(), ControlError> {
        self.apply(key, ControlAction::Resume).await.map(|_| ())
    }

    /// Cancel is idempotent: an idle key is left untouched.
    pub async fn cancel(&self, key: &DownloadKey) -> Result<(), ControlError> {
        self.apply(key, ControlAction::Cancel).await.map(|_| ())
    }

    async fn terminate(&self, slot: &Arc<SessionSlot>) -> Result<(), ControlError> {
        if let Some(worker) = slot.take_worker() {
            worker.stop().await.map_err(ControlError::Worker)?;
        }
        self.remove(slot);
        info!("session {} cancelled", slot.key);
        Ok(())
    }

    fn refused(&self, key: &DownloadKey, action: ControlAction, refusal: Refusal) -> ControlError {
        match refusal {
            Refusal::AlreadyActive => ControlError::AlreadyActive(key.clone()),
            Refusal::NoSuchSession => ControlError::NoSuchSession(key.clone()),
            Refusal::WrongState(state) => ControlError::InvalidTransition { action, state },
        }
    }

    async fn spawn(&self, slot: &Arc<SessionSlot>) -> Result<(), ControlError> {
        let process = match self.inner.launcher.launch(&slot.key).await {
            Ok(process) => process,
            Err(e) => {
                warn!("session {} failed to launch worker: {}", slot.key, e);
                slot.fail_to_launch(&e);
                self.schedule_reap(&slot.key, Some(self.inner.settings.unclaimed_retention));
                return Err(ControlError::Spawn(e));
            }
        };

        let registry = Arc::downgrade(&self.inner);
        let key = slot.key.clone();
        let retention = self.inner.settings.unclaimed_retention;
        slot.begin(process, self.inner.settings.supervisor(), move || {
            schedule_reap(&registry, key.clone(), None);
            schedule_reap(&registry, key, Some(retention));
        });
        info!("session {} downloading", slot.key);
        Ok(())
    }

    fn signal(
        &self,
        slot: &SessionSlot,
        from: SessionState,
        to: SessionState,
        signal: WorkerSignal,
    ) -> Result<(), ControlError> {
        // The worker may have exited since validation; the exit wins.
        if !slot.signal(from, to, signal).map_err(ControlError::Worker)? {
            debug!("session {} left {} before {:?} was delivered", slot.key, from, signal);
        }
        Ok(())
    }

    fn remove(&self, slot: &Arc<SessionSlot>) {
        self.inner
            .slots
            .remove_if(&slot.key, |_, current| Arc::ptr_eq(current, slot));
    }

    fn schedule_reap(&self, key: &DownloadKey, after: Option<Duration>) {
        schedule_reap(&Arc::downgrade(&self.inner), key.clone(), after);
    }

    async fn reap(&self, key: &DownloadKey) {
        let Some((slot, _guard)) = self.lock_slot(key, false).await else {
            return;
        };
        if slot.is_reapable(self.inner.settings.unclaimed_retention) {
            self.remove(&slot);
            debug!("session {} reaped", key);
        }
    }

    /// Attach the (single) subscriber for `key`, superseding any existing one.
    pub fn subscribe(&self, key: &DownloadKey) -> Result<Subscription, ControlError> {
        let slot = self
            .inner
            .slots
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|slot| slot.state().is_some() && !slot.bus().terminal_delivered())
            .ok_or_else(|| ControlError::NoSuchSession(key.clone()))?;

        let mut subscription = slot.bus().subscribe();
        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        subscription.on_detach(move || schedule_reap(&registry, key, None));
        Ok(subscription)
    }

    /// Current state; `None` means idle.
    pub fn state(&self, key: &DownloadKey) -> Option<SessionState> {
        let slot = self.inner.slots.get(key).map(|entry| entry.value().clone())?;
        slot.state()
    }

    pub fn snapshot(&self, key: &DownloadKey) -> Option<SessionSnapshot> {
        let slot = self.inner.slots.get(key).map(|entry| entry.value().clone())?;
        slot.snapshot()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Arc<SessionSlot>> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots: Vec<SessionSnapshot> =
            slots.iter().filter_map(|slot| slot.snapshot()).collect();
        snapshots.sort_by(|a, b| a.filename.cmp(&b.filename));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|entry| entry.value().state().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every session, stopping all workers.
    pub async fn shutdown(&self) {
        let keys: Vec<DownloadKey> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Err(e) = self.cancel(&key).await {
                warn!("shutdown: cancelling {} failed: {}", key, e);
            }
        }
    }
}

fn schedule_reap(registry: &Weak<RegistryInner>, key: DownloadKey, after: Option<Duration>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let registry = registry.clone();
    runtime.spawn(async move {
        if let Some(delay) = after {
            tokio::time::sleep(delay).await;
        }
        if let Some(inner) = registry.upgrade() {
            SessionRegistry { inner }.reap(&key).await;
        }
    });
}
