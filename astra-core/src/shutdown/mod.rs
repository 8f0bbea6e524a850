//! Graceful shutdown coordinator
//!
//! Background tasks are spawned through the coordinator and listen on its
//! broadcast channel. `shutdown()` signals them, waits up to the grace
//! period for them to finish, and aborts whatever is still running.

use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            grace,
        }
    }

    /// Receiver that fires once shutdown starts
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a background task tracked for shutdown
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "starting background task");
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|(_, handle)| !handle.is_finished());
            tasks.push((name, handle));
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state.read().map(|state| *state).unwrap_or(ShutdownState::Shutdown)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Signal every task and wait for them; repeated calls are no-ops
    pub async fn shutdown(&self) {
        {
            let Ok(mut state) = self.state.write() else { return };
            if *state != ShutdownState::Running {
                debug!("shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!("initiating graceful shutdown");
        // Tasks that already exited have dropped their receivers
        let _ = self.shutdown_tx.send(());

        let tasks = self.tasks.lock().map(|mut tasks| std::mem::take(&mut *tasks)).unwrap_or_default();
        for (name, mut handle) in tasks {
            if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                warn!(task = name, "task did not stop within grace period, aborting");
                handle.abort();
            }
        }

        if let Ok(mut state) = self.state.write() {
            *state = ShutdownState::Shutdown;
        }
        info!("shutdown complete");
    }
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C elsewhere)
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
