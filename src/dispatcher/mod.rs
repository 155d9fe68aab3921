//! # Dispatcher
//!
//! Background delivery of stored hits. A dedicated thread drains the hit store
//! on a periodic timer or on request, POSTs every hit through the transport, and
//! puts failed or unsent hits back for the next cycle.
//!
//! - **Version**: 2.0.1
//! - **Since**: 0.1.0
//!
//! ## Changelog
//! - 2.0.1: Shutdown cancels a running drain at its next batch boundary
//! - 2.0.0: Commands and interval changes are sent to the worker over channels
//!   instead of shared flags; the polling sleep is replaced by a select loop
//! - 1.1.0: In-flight sends are bounded and returned to the store at shutdown
//! - 1.0.0: Initial release with periodic and immediate dispatch

mod command;
mod in_flight;
pub mod interval;
mod stats;
mod worker;

use crate::hit::Hit;
use crate::store::HitStore;
use crate::transport::{Address, Scheme, Transport, DEFAULT_HOST, HTTPS_PORT, HTTP_PORT};
use anyhow::{anyhow, Result};
use command::Command;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use worker::{Worker, WorkerOptions};

pub use interval::interval_period;
pub use stats::DispatchStatsSnapshot;

/// Maximum hits fetched from the store per round-trip
pub const DISPATCH_BLOCK_SIZE: usize = 20;

/// Default seconds between periodic dispatches
pub const DEFAULT_DISPATCH_INTERVAL: f64 = 120.0;

/// Default bound on concurrently running requests
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Default seconds the worker waits for in-flight sends at shutdown
pub const DEFAULT_SHUTDOWN_GRACE: f64 = 5.0;

/// Capacity of the caller-to-worker command channel
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Name of the background dispatch thread
const THREAD_NAME: &str = "hitrelay-dispatch";

fn default_dispatch_interval() -> f64 {
    DEFAULT_DISPATCH_INTERVAL
}

fn default_block_size() -> usize {
    DISPATCH_BLOCK_SIZE
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_shutdown_grace() -> f64 {
    DEFAULT_SHUTDOWN_GRACE
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_http_port() -> u16 {
    HTTP_PORT
}

fn default_https_port() -> u16 {
    HTTPS_PORT
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between periodic dispatches; zero or less means manual only
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval: f64,

    /// Drop new hits instead of storing them
    #[serde(default)]
    pub opt_out: bool,

    #[serde(default)]
    pub use_https: bool,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Seconds to wait for in-flight sends when shutting down
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: f64,

    /// Collection host
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            opt_out: false,
            use_https: false,
            block_size: DISPATCH_BLOCK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            host: DEFAULT_HOST.to_string(),
            http_port: HTTP_PORT,
            https_port: HTTPS_PORT,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(anyhow!("block_size must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(anyhow!("max_in_flight must be at least 1"));
        }
        self.shutdown_grace()?;
        if self.host.is_empty() {
            return Err(anyhow!("host must not be empty"));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.shutdown_grace).map_err(|e| {
            anyhow!(
                "shutdown_grace must be a non-negative number of seconds: {} ({e})",
                self.shutdown_grace
            )
        })
    }

    /// Transport address for the given scheme choice
    pub fn address(&self, use_https: bool) -> Address {
        if use_https {
            Address::new(Scheme::Https, self.host.clone(), self.https_port)
        } else {
            Address::new(Scheme::Http, self.host.clone(), self.http_port)
        }
    }
}

/// Handle to the background dispatch worker.
///
/// Setters and `store_hit` are called from the application's thread and never
/// wait for the network. Dropping the handle stops the worker, waits for its
/// thread to exit, then closes the store; avoid dropping it on an async
/// runtime worker thread that must not block.
pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn HitStore>,
    transport: Arc<dyn Transport>,
    opt_out: AtomicBool,
    use_https: AtomicBool,
    interval_bits: AtomicU64,
    commands: mpsc::Sender<Command>,
    interval_tx: watch::Sender<Option<Duration>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<stats::DispatchStats>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Point the transport at the configured endpoint, arm the timer and start
    /// the background thread.
    pub fn new(
        store: Arc<dyn HitStore>,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (interval_tx, interval_rx) =
            watch::channel(interval_period(config.dispatch_interval));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(stats::DispatchStats::default());

        transport.set_address(config.address(config.use_https));

        let worker = Worker::new(
            store.clone(),
            transport.clone(),
            WorkerOptions {
                block_size: config.block_size,
                max_in_flight: config.max_in_flight,
                shutdown_grace: config.shutdown_grace()?,
            },
            command_rx,
            interval_rx,
            shutdown_rx,
            stats.clone(),
        );

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(worker.run()))?;

        info!(
            "Dispatcher started (interval: {}s, block size: {}, endpoint: {})",
            config.dispatch_interval,
            config.block_size,
            transport.address().base_url()
        );

        Ok(Dispatcher {
            opt_out: AtomicBool::new(config.opt_out),
            use_https: AtomicBool::new(config.use_https),
            interval_bits: AtomicU64::new(config.dispatch_interval.to_bits()),
            config,
            store,
            transport,
            commands: command_tx,
            interval_tx,
            shutdown_tx,
            stats,
            thread: Some(thread),
        })
    }

    /// Queue a hit for delivery.
    ///
    /// While opted out the hit is dropped and `true` is still returned.
    /// Returns `false` when the store could not be opened or refused the hit.
    pub fn store_hit(&self, hit: &Hit) -> bool {
        if self.is_opt_out() {
            debug!("Opted out, dropping {} hit", hit.kind);
            return true;
        }

        if !self.store.is_open() {
            if let Err(e) = self.store.open() {
                warn!("Failed to open hit store: {e}");
                return false;
            }
        }

        match self.store.add_hit(hit) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to store {} hit: {e}", hit.kind);
                false
            }
        }
    }

    /// Request a drain cycle now, independent of the timer. Clears any
    /// earlier cancel.
    pub fn queue_dispatch(&self) {
        self.send_command(Command::Flush);
    }

    /// Stop the running drain at its next batch boundary. Sends already
    /// started are not recalled; a cancel while idle does nothing.
    pub fn cancel_dispatch(&self) {
        self.send_command(Command::Cancel);
    }

    fn send_command(&self, command: Command) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                warn!("Dispatch command queue full, dropping {command:?}");
            }
            Err(TrySendError::Closed(command)) => {
                debug!("Dispatch worker stopped, ignoring {command:?}");
            }
        }
    }

    pub fn is_opt_out(&self) -> bool {
        self.opt_out.load(Ordering::SeqCst)
    }

    pub fn set_opt_out(&self, opt_out: bool) {
        self.opt_out.store(opt_out, Ordering::SeqCst);
        info!("Tracking {}", if opt_out { "disabled (opt-out)" } else { "enabled" });
    }

    pub fn is_use_https(&self) -> bool {
        self.use_https.load(Ordering::SeqCst)
    }

    /// Switch scheme and port for every send started from now on
    pub fn set_use_https(&self, use_https: bool) {
        self.use_https.store(use_https, Ordering::SeqCst);
        self.transport.set_address(self.config.address(use_https));
    }

    pub fn dispatch_interval(&self) -> f64 {
        f64::from_bits(self.interval_bits.load(Ordering::SeqCst))
    }

    /// Rearm the periodic timer. Zero, negative or non-finite values turn
    /// periodic dispatch off.
    pub fn set_dispatch_interval(&self, seconds: f64) {
        self.interval_bits.store(seconds.to_bits(), Ordering::SeqCst);
        self.interval_tx.send_replace(interval_period(seconds));
    }

    pub fn user_agent(&self) -> String {
        self.transport.user_agent()
    }

    /// Hits waiting in the store, not counting sends in flight
    pub fn pending_hits(&self) -> Result<usize> {
        if !self.store.is_open() {
            self.store.open()?;
        }
        self.store.len()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Stop the worker, wait for it, and close the store
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        debug!("Stopping dispatcher");
        self.shutdown_tx.send_replace(true);
        if thread.join().is_err() {
            error!("Dispatch thread panicked");
        }

        self.store.close();
        info!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
