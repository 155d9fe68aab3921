//! The dispatch worker: sole owner of the timer, the drain loop and every
//! send in flight. Runs on the dispatcher's background thread.

use super::command::{Command, DrainControl, Trigger};
use super::in_flight::{InFlight, Settled};
use super::interval::{arm_timer, next_tick};
use super::stats::DispatchStats;
use crate::hit::{build_post_payload, build_post_url, Hit};
use crate::store::HitStore;
use crate::transport::Transport;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, Interval};

/// Result of one drain cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrainReport {
    /// Hits handed to the transport
    pub submitted: usize,
    /// Fetched hits put back unsent
    pub requeued: usize,
    pub cancelled: bool,
    /// A flush arrived while draining
    pub rerun: bool,
}

pub(crate) struct WorkerOptions {
    pub block_size: usize,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
}

pub(crate) struct Worker {
    store: Arc<dyn HitStore>,
    transport: Arc<dyn Transport>,
    block_size: usize,
    shutdown_grace: Duration,
    commands: mpsc::Receiver<Command>,
    interval_rx: watch::Receiver<Option<Duration>>,
    shutdown_rx: watch::Receiver<bool>,
    timer: Option<Interval>,
    in_flight: InFlight,
    stats: Arc<DispatchStats>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn HitStore>,
        transport: Arc<dyn Transport>,
        options: WorkerOptions,
        commands: mpsc::Receiver<Command>,
        interval_rx: watch::Receiver<Option<Duration>>,
        shutdown_rx: watch::Receiver<bool>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Worker {
            store,
            transport,
            block_size: options.block_size.max(1),
            shutdown_grace: options.shutdown_grace,
            commands,
            interval_rx,
            shutdown_rx,
            timer: None,
            in_flight: InFlight::new(options.max_in_flight),
            stats,
        }
    }

    /// Serve timer ticks, commands and send completions until shutdown
    pub async fn run(mut self) {
        let period = *self.interval_rx.borrow_and_update();
        self.timer = arm_timer(period);
        info!("Dispatch worker started (interval: {})", describe_period(period));

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = self.interval_rx.changed() => {
                    // The handle owns the sender, so a closed channel means it is gone
                    if changed.is_err() {
                        break;
                    }
                    let period = *self.interval_rx.borrow_and_update();
                    self.timer = arm_timer(period);
                    debug!("Dispatch timer rearmed (interval: {})", describe_period(period));
                }
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = next_tick(&mut self.timer) => self.drain(Trigger::Timer).await,
                Some(joined) = self.in_flight.join_next() => self.complete(joined),
            }
        }

        self.finish().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Flush => self.drain(Trigger::Flush).await,
            Command::Cancel => debug!("Cancel received with no drain running, ignoring"),
        }
    }

    /// Run drain cycles until no flush arrives mid-cycle
    async fn drain(&mut self, trigger: Trigger) {
        let mut report = self.dispatch(trigger).await;
        while report.rerun {
            report = self.dispatch(Trigger::Flush).await;
        }
    }

    /// One drain cycle: fetch bounded batches, submit a send per hit, and put
    /// back whatever was fetched but not submitted.
    pub async fn dispatch(&mut self, trigger: Trigger) -> DrainReport {
        let mut control = DrainControl::default();
        let mut report = DrainReport::default();

        if !self.ensure_store_open() {
            return report;
        }

        let mut batch = self.fetch_batch();
        loop {
            self.poll_commands(&mut control);
            if batch.is_empty() || control.cancelled {
                break;
            }

            report.submitted += batch.len();
            self.stats.record_submitted(batch.len());
            for hit in batch.drain(..) {
                self.in_flight.submit(hit, &self.transport);
            }

            // Let the sends start before the next store round-trip
            tokio::task::yield_now().await;
            batch = self.fetch_batch();
        }

        if !batch.is_empty() {
            report.requeued = batch.len();
            self.requeue(batch);
        }

        report.cancelled = control.cancelled;
        report.rerun = control.rerun;
        self.stats.record_cycle(control.cancelled);

        if report.submitted > 0 || report.cancelled {
            info!(
                "Dispatch ({trigger}): submitted {} hit(s), returned {} to the store{}",
                report.submitted,
                report.requeued,
                if report.cancelled { ", cancelled" } else { "" }
            );
        } else {
            debug!("Dispatch ({trigger}): nothing pending");
        }

        report
    }

    /// Apply every command that arrived since the last check. A pending
    /// shutdown cancels the drain and overrides any flush.
    fn poll_commands(&mut self, control: &mut DrainControl) {
        while let Ok(command) = self.commands.try_recv() {
            debug!("Command {command:?} received mid-drain");
            control.apply(command);
        }
        if self.is_shutting_down() {
            control.apply(Command::Cancel);
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn ensure_store_open(&self) -> bool {
        if self.store.is_open() {
            return true;
        }
        match self.store.open() {
            Ok(()) => true,
            Err(e) => {
                warn!("Hit store unavailable, skipping dispatch: {e}");
                false
            }
        }
    }

    fn fetch_batch(&self) -> Vec<Hit> {
        match self.store.fetch_hits(self.block_size, true) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Failed to fetch pending hits: {e}");
                Vec::new()
            }
        }
    }

    /// Return unsent hits to the store in one bulk add
    fn requeue(&self, hits: Vec<Hit>) {
        let count = hits.len();
        if let Err(e) = self.put_back(hits) {
            error!("Failed to return {count} hit(s) to the store, they are lost: {e}");
            return;
        }
        self.stats.record_requeued(count);
    }

    fn put_back(&self, hits: Vec<Hit>) -> Result<()> {
        if !self.store.is_open() {
            self.store.open()?;
        }
        self.store.add_hits(hits)
    }

    /// Handle one finished send
    pub fn complete(&mut self, joined: Result<(u64, Result<()>), JoinError>) {
        match self.in_flight.settle(joined) {
            Some(Settled::Delivered(hit)) => {
                self.stats.record_delivered();
                debug!("URL: {}", self.transport.address().url_for(&build_post_url(&hit)));
                debug!("Payload: {}", build_post_payload(&hit));
                debug!("User Agent: {}", self.transport.user_agent());
            }
            Some(Settled::Failed(hit, e)) => {
                self.stats.record_failed();
                debug!("Send of {} hit failed, retrying next cycle: {e}", hit.kind);
                if let Err(e) = self.put_back(vec![hit]) {
                    error!("Failed to requeue hit after send failure, it is lost: {e}");
                }
            }
            Some(Settled::Lost(e)) => {
                error!("Send task ended without reporting: {e}");
            }
            None => {}
        }

        let orphans = self.in_flight.take_orphans();
        if !orphans.is_empty() {
            warn!("Requeueing {} hit(s) from lost send tasks", orphans.len());
            self.requeue(orphans);
        }
    }

    /// Give in-flight sends the grace period, then put back what is left
    async fn finish(&mut self) {
        self.timer = None;

        if !self.in_flight.is_empty() {
            info!(
                "Waiting up to {:?} for {} in-flight send(s)",
                self.shutdown_grace,
                self.in_flight.len()
            );
            let deadline = Instant::now() + self.shutdown_grace;
            while let Ok(Some(joined)) =
                tokio::time::timeout_at(deadline, self.in_flight.join_next()).await
            {
                self.complete(joined);
            }

            let stranded = self.in_flight.abort_all();
            if !stranded.is_empty() {
                warn!(
                    "Returning {} unfinished send(s) to the store at shutdown",
                    stranded.len()
                );
                self.requeue(stranded);
            }
        }

        info!("Dispatch worker stopped");
    }
}

fn describe_period(period: Option<Duration>) -> String {
    match period {
        Some(period) => format!("{:.3}s", period.as_secs_f64()),
        None => "manual only".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HitStore, MemoryHitStore};
    use crate::testing::{hits, HookedStore, RecordingTransport};

    struct Harness {
        worker: Worker,
        commands: mpsc::Sender<Command>,
        _interval_tx: watch::Sender<Option<Duration>>,
        shutdown_tx: Arc<watch::Sender<bool>>,
        stats: Arc<DispatchStats>,
    }

    fn harness(
        store: Arc<dyn HitStore>,
        transport: Arc<dyn Transport>,
        block_size: usize,
    ) -> Harness {
        let (commands, command_rx) = mpsc::channel(16);
        let (interval_tx, interval_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DispatchStats::default());
        let worker = Worker::new(
            store,
            transport,
            WorkerOptions {
                block_size,
                max_in_flight: 4,
                shutdown_grace: Duration::from_millis(50),
            },
            command_rx,
            interval_rx,
            shutdown_rx,
            stats.clone(),
        );
        Harness {
            worker,
            commands,
            _interval_tx: interval_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            stats,
        }
    }

    async fn settle_all(worker: &mut Worker) {
        while let Some(joined) = worker.in_flight.join_next().await {
            worker.complete(joined);
        }
    }

    fn memory_store_with(count: usize) -> Arc<MemoryHitStore> {
        let store = Arc::new(MemoryHitStore::new());
        store.open().unwrap();
        store.add_hits(hits(count)).unwrap();
        store
    }

    #[tokio::test]
    async fn test_single_dispatch_drains_more_than_one_block() {
        let store = Arc::new(HookedStore::new(memory_store_with(45)));
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let report = h.worker.dispatch(Trigger::Flush).await;
        assert_eq!(report.submitted, 45);
        assert_eq!(report.requeued, 0);
        assert!(!report.cancelled);
        // five full or partial blocks plus the empty fetch that ends the loop
        assert_eq!(store.fetch_count(), 6);
        assert!(store.is_empty().unwrap());

        settle_all(&mut h.worker).await;
        assert_eq!(transport.delivered(), 45);
        assert_eq!(h.stats.snapshot().delivered, 45);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_batch_boundary() {
        let store = Arc::new(HookedStore::new(memory_store_with(25)));
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let commands = h.commands.clone();
        store.on_fetch(move |index| {
            if index == 1 {
                commands.try_send(Command::Cancel).unwrap();
            }
        });

        let report = h.worker.dispatch(Trigger::Flush).await;
        assert_eq!(report.submitted, 10);
        assert_eq!(report.requeued, 10);
        assert!(report.cancelled);
        assert_eq!(store.len().unwrap(), 15);

        settle_all(&mut h.worker).await;
        assert_eq!(transport.delivered(), 10);
        assert_eq!(store.len().unwrap(), 15);
    }

    #[tokio::test]
    async fn test_cancel_between_submit_and_fetch_loses_nothing() {
        for total in [10, 11, 19, 20, 21] {
            let store = Arc::new(HookedStore::new(memory_store_with(total)));
            let transport = Arc::new(RecordingTransport::new());
            let mut h = harness(store.clone(), transport.clone(), 10);

            let commands = h.commands.clone();
            store.on_fetch(move |index| {
                if index == 1 {
                    commands.try_send(Command::Cancel).unwrap();
                }
            });

            let report = h.worker.dispatch(Trigger::Timer).await;
            settle_all(&mut h.worker).await;

            assert_eq!(report.submitted, 10, "total {total}");
            assert_eq!(
                transport.delivered() + store.len().unwrap(),
                total,
                "total {total}"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_sends_are_requeued_once_per_cycle() {
        let store = memory_store_with(5);
        let transport = Arc::new(RecordingTransport::failing());
        let mut h = harness(store.clone(), transport.clone(), 2);

        let report = h.worker.dispatch(Trigger::Timer).await;
        assert_eq!(report.submitted, 5);

        settle_all(&mut h.worker).await;
        assert_eq!(transport.attempts(), 5);
        assert_eq!(store.len().unwrap(), 5);
        assert_eq!(h.stats.snapshot().failed, 5);
    }

    #[tokio::test]
    async fn test_hit_retried_until_delivered() {
        let store = memory_store_with(1);
        let transport = Arc::new(RecordingTransport::failing_first(2));
        let mut h = harness(store.clone(), transport.clone(), 10);

        for _ in 0..2 {
            h.worker.dispatch(Trigger::Timer).await;
            settle_all(&mut h.worker).await;
            assert_eq!(store.len().unwrap(), 1);
            assert_eq!(transport.delivered(), 0);
        }

        h.worker.dispatch(Trigger::Timer).await;
        settle_all(&mut h.worker).await;
        assert!(store.is_empty().unwrap());
        assert_eq!(transport.delivered(), 1);
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn test_idle_cancel_does_not_affect_next_cycle() {
        let store = memory_store_with(3);
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        h.worker.handle_command(Command::Cancel).await;
        let report = h.worker.dispatch(Trigger::Timer).await;

        assert_eq!(report.submitted, 3);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_queued_behind_flush_stops_before_first_batch() {
        let store = memory_store_with(3);
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        h.commands.try_send(Command::Cancel).unwrap();
        h.worker.handle_command(Command::Flush).await;

        assert_eq!(h.stats.snapshot().submitted, 0);
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(h.stats.snapshot().cancelled_cycles, 1);
    }

    #[tokio::test]
    async fn test_flush_mid_drain_runs_another_cycle() {
        let store = Arc::new(HookedStore::new(memory_store_with(4)));
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let commands = h.commands.clone();
        store.on_fetch(move |index| {
            if index == 0 {
                commands.try_send(Command::Flush).unwrap();
            }
        });

        h.worker.drain(Trigger::Timer).await;
        assert_eq!(h.stats.snapshot().cycles, 2);
        assert_eq!(h.stats.snapshot().submitted, 4);
    }

    #[tokio::test]
    async fn test_dispatch_opens_closed_store() {
        let store = memory_store_with(2);
        store.close();
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let report = h.worker.dispatch(Trigger::Timer).await;
        assert_eq!(report.submitted, 2);
        assert!(store.is_open());
    }

    #[tokio::test]
    async fn test_finish_returns_stalled_sends_to_store() {
        let store = memory_store_with(3);
        let transport = Arc::new(RecordingTransport::stalled());
        let mut h = harness(store.clone(), transport.clone(), 10);

        h.worker.dispatch(Trigger::Flush).await;
        assert!(store.is_empty().unwrap());

        h.worker.finish().await;
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(h.stats.snapshot().requeued, 3);
    }

    #[tokio::test]
    async fn test_shutdown_mid_drain_stops_at_batch_boundary() {
        let store = Arc::new(HookedStore::new(memory_store_with(25)));
        let transport = Arc::new(RecordingTransport::new());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let shutdown_tx = h.shutdown_tx.clone();
        store.on_fetch(move |index| {
            if index == 1 {
                shutdown_tx.send_replace(true);
            }
        });
        h.commands.try_send(Command::Flush).unwrap();

        h.worker.drain(Trigger::Flush).await;
        settle_all(&mut h.worker).await;

        assert_eq!(h.stats.snapshot().submitted, 10);
        assert_eq!(h.stats.snapshot().cycles, 1);
        assert_eq!(transport.delivered(), 10);
        assert_eq!(store.len().unwrap(), 15);
    }

    #[tokio::test]
    async fn test_panicked_send_is_requeued() {
        let store = memory_store_with(2);
        let transport = Arc::new(RecordingTransport::panicking());
        let mut h = harness(store.clone(), transport.clone(), 10);

        let report = h.worker.dispatch(Trigger::Timer).await;
        assert_eq!(report.submitted, 2);
        assert!(store.is_empty().unwrap());

        settle_all(&mut h.worker).await;
        assert_eq!(transport.attempts(), 2);
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(h.stats.snapshot().requeued, 2);
        assert!(h.worker.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let store = memory_store_with(0);
        let transport = Arc::new(RecordingTransport::new());
        let h = harness(store, transport, 10);

        let handle = tokio::spawn(h.worker.run());
        h.shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
