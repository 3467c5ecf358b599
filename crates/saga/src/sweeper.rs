//! Timeout sweeper: the scheduled source of saga-initiated transitions.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::coordinator::{CommandExecutor, SagaCoordinator};
use crate::store::SagaStore;
use crate::workflow::Workflow;

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan for instances past their deadline.
    pub poll_interval: Duration,
    /// Maximum instances processed per scan.
    pub batch_size: usize,
    /// Name for logging and the worker thread.
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 64,
            name: "saga-timeout-sweeper".to_string(),
        }
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Background worker driving timed-out instances to compensation.
pub struct TimeoutSweeper;

impl TimeoutSweeper {
    pub fn spawn<W, S, X>(
        coordinator: Arc<SagaCoordinator<W, S, X>>,
        config: SweeperConfig,
    ) -> SweeperHandle
    where
        W: Workflow,
        S: SagaStore + Send + Sync + 'static,
        X: CommandExecutor + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || sweeper_loop(coordinator, config, shutdown_rx))
            .expect("failed to spawn timeout sweeper thread");

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn sweeper_loop<W, S, X>(
    coordinator: Arc<SagaCoordinator<W, S, X>>,
    config: SweeperConfig,
    shutdown_rx: mpsc::Receiver<()>,
) where
    W: Workflow,
    S: SagaStore,
    X: CommandExecutor,
{
    info!(sweeper = %config.name, "timeout sweeper started");

    loop {
        // Interruptible sleep: shutdown requests cut the wait short.
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        match coordinator.sweep_timeouts(config.batch_size) {
            Ok(0) => {}
            Ok(advanced) => {
                info!(sweeper = %config.name, advanced, "timed-out instances compensated");
            }
            Err(e) => {
                error!(sweeper = %config.name, error = ?e, "timeout sweep failed");
            }
        }
    }

    info!(sweeper = %config.name, "timeout sweeper stopped");
}
