//! Probe scheduler: target registry, per-target timers, bounded check queue
//! and the worker pool draining it.

mod pipeline;

pub use pipeline::Pipeline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::db::{CurrentStatus, DbError, Store, Target};
use crate::probe::{new_checker, CheckResult, ErrorKind};

/// Delay before a freshly added target's first check, letting surrounding
/// state settle.
const FIRST_CHECK_DELAY: Duration = Duration::from_millis(500);

/// History beyond the uptime window plus slack is pruned daily.
const HISTORY_RETENTION_DAYS: i64 = 35;

struct TargetHandle {
    target: Arc<Target>,
    stop: broadcast::Sender<()>,
}

/// The monitoring engine: owns the live target registry and the worker pool.
pub struct Engine {
    store: Arc<Store>,
    targets: Arc<RwLock<HashMap<u32, TargetHandle>>>,
    check_tx: mpsc::Sender<Arc<Target>>,
    shutdown: broadcast::Sender<()>,
    queue_drops: Arc<AtomicU64>,
}

impl Engine {
    /// Build the engine and start its worker pool.
    pub fn new(
        store: Arc<Store>,
        pipeline: Pipeline,
        workers: usize,
        queue_capacity: usize,
        probe_timeout: Duration,
    ) -> Self {
        let (check_tx, check_rx) = mpsc::channel::<Arc<Target>>(queue_capacity);
        let check_rx = Arc::new(Mutex::new(check_rx));
        let (shutdown, _) = broadcast::channel(1);

        tracing::info!(workers, queue_capacity, "starting worker pool");
        for worker_id in 0..workers {
            tokio::spawn(worker_loop(
                worker_id,
                check_rx.clone(),
                shutdown.subscribe(),
                pipeline.clone(),
                probe_timeout,
            ));
        }

        Self {
            store,
            targets: Arc::new(RwLock::new(HashMap::new())),
            check_tx,
            shutdown,
            queue_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rehydrate enabled targets from the store and start their timers,
    /// plus the daily history prune task.
    pub async fn start(&self) -> Result<(), DbError> {
        let targets = self.store.list_targets()?;
        tracing::info!(count = targets.len(), "starting scheduler");

        for target in targets {
            if target.enabled {
                self.schedule(Arc::new(target)).await;
            }
        }

        self.start_history_prune();
        Ok(())
    }

    /// Persist a new target and start monitoring it.
    pub async fn add_target(&self, target: &mut Target) -> Result<u32, DbError> {
        let id = self.store.add_target(target)?;
        if target.enabled {
            self.schedule(Arc::new(target.clone())).await;
        }
        Ok(id)
    }

    /// Stop monitoring and delete the target with its status and history.
    /// In-flight probes complete and their results are still processed.
    pub async fn remove_target(&self, id: u32) -> Result<(), DbError> {
        let handle = self.targets.write().await.remove(&id);
        if let Some(handle) = handle {
            let _ = handle.stop.send(());
            tracing::info!(target_id = id, "scheduler: removed target");
        }
        self.store.delete_target(id)
    }

    /// Enqueue a one-off check, subject to the same non-blocking rule as
    /// timer ticks.
    pub async fn trigger_check(&self, id: u32) -> Result<(), DbError> {
        let target = {
            let targets = self.targets.read().await;
            targets.get(&id).map(|h| h.target.clone())
        };
        match target {
            Some(target) => {
                enqueue(&self.check_tx, target, &self.queue_drops);
                Ok(())
            }
            None => Err(DbError::NotFound),
        }
    }

    pub fn get_status(&self, id: u32) -> Result<CurrentStatus, DbError> {
        self.store.get_status(id)
    }

    pub fn list_statuses(&self) -> Result<Vec<CurrentStatus>, DbError> {
        self.store.list_statuses()
    }

    /// Snapshot of the live registry.
    pub async fn list_targets(&self) -> Vec<Arc<Target>> {
        let targets = self.targets.read().await;
        let mut list: Vec<Arc<Target>> = targets.values().map(|h| h.target.clone()).collect();
        list.sort_by_key(|t| t.id);
        list
    }

    pub async fn get_target(&self, id: u32) -> Option<Arc<Target>> {
        self.targets.read().await.get(&id).map(|h| h.target.clone())
    }

    /// Ticks dropped because the check queue was full.
    pub fn dropped_ticks(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    /// Stop timers and let workers drain the queue.
    pub fn shutdown(&self) {
        tracing::info!("scheduler shutting down");
        let _ = self.shutdown.send(());
    }

    async fn schedule(&self, target: Arc<Target>) {
        let mut targets = self.targets.write().await;
        if targets.contains_key(&target.id) {
            return;
        }

        let (stop, _) = broadcast::channel(1);
        targets.insert(
            target.id,
            TargetHandle {
                target: target.clone(),
                stop: stop.clone(),
            },
        );
        drop(targets);

        tracing::info!(target_id = target.id, name = %target.name, "scheduler: adding target");

        tokio::spawn(run_target_loop(
            target,
            self.check_tx.clone(),
            self.queue_drops.clone(),
            stop.subscribe(),
            self.shutdown.subscribe(),
        ));
    }

    fn start_history_prune(&self) {
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        let cutoff = chrono::Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS);
                        match store.prune_history(cutoff) {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(removed, "pruned old history rows"),
                            Err(e) => tracing::error!(error = %e, "history prune failed"),
                        }
                    }
                }
            }
        });
    }
}

/// Non-blocking enqueue; a full queue drops the tick with a warning.
fn enqueue(tx: &mpsc::Sender<Arc<Target>>, target: Arc<Target>, drops: &AtomicU64) {
    if let Err(mpsc::error::TrySendError::Full(target)) = tx.try_send(target) {
        let dropped = drops.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            target_id = target.id,
            target_name = %target.name,
            dropped,
            "check queue full, skipping check"
        );
    }
}

/// Per-target timer: one immediate first check after a settle delay, then a
/// tick every `interval_secs`.
async fn run_target_loop(
    target: Arc<Target>,
    tx: mpsc::Sender<Arc<Target>>,
    drops: Arc<AtomicU64>,
    mut stop_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let period = Duration::from_secs(target.interval_secs.max(1));

    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = shutdown_rx.recv() => return,
        _ = tokio::time::sleep(FIRST_CHECK_DELAY) => {
            enqueue(&tx, target.clone(), &drops);
        }
    }

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                enqueue(&tx, target.clone(), &drops);
            }
        }
    }
}

/// Worker: dequeue, run the probe under the per-check deadline, forward the
/// result to the pipeline.
async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Arc<Target>>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    pipeline: Pipeline,
    probe_timeout: Duration,
) {
    loop {
        let target = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.recv() => None,
                maybe = rx.recv() => maybe,
            }
        };

        match target {
            Some(target) => run_check(&pipeline, &target, probe_timeout).await,
            None => break,
        }
    }

    // Drain whatever is still queued before exiting.
    loop {
        let target = rx.lock().await.try_recv().ok();
        match target {
            Some(target) => run_check(&pipeline, &target, probe_timeout).await,
            None => break,
        }
    }
    tracing::debug!(worker_id, "worker exiting");
}

async fn run_check(pipeline: &Pipeline, target: &Target, probe_timeout: Duration) {
    let checker = new_checker(target.kind);

    let result = match tokio::time::timeout(probe_timeout, checker.check(target)).await {
        Ok(result) => result,
        Err(_) => CheckResult::failed(
            ErrorKind::Timeout,
            format!("probe exceeded {}s deadline", probe_timeout.as_secs()),
            probe_timeout.as_millis() as i64,
        ),
    };

    pipeline.apply(target, &result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertEngine;
    use crate::db::{CheckStatus, TargetKind};
    use crate::logsink::FileSink;
    use tempfile::tempdir;

    fn test_engine(workers: usize, queue_capacity: usize) -> (Engine, Arc<Store>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let alert = Arc::new(AlertEngine::new(store.clone()));
        let file_sink = FileSink::spawn(dir.path(), 16);
        let pipeline = Pipeline::new(store.clone(), alert, file_sink, None);
        let engine = Engine::new(
            store.clone(),
            pipeline,
            workers,
            queue_capacity,
            Duration::from_secs(5),
        );
        (engine, store, dir)
    }

    #[tokio::test]
    async fn add_then_remove_leaves_registry_unchanged() {
        let (engine, store, _dir) = test_engine(1, 16);

        let mut target = Target {
            name: "tcp".to_string(),
            kind: TargetKind::Tcp,
            address: "127.0.0.1".to_string(),
            port: 1,
            interval_secs: 60,
            ..Default::default()
        };
        let id = engine.add_target(&mut target).await.unwrap();
        assert_eq!(engine.list_targets().await.len(), 1);
        assert!(engine.get_target(id).await.is_some());

        engine.remove_target(id).await.unwrap();
        assert!(engine.list_targets().await.is_empty());
        assert!(engine.get_target(id).await.is_none());
        assert!(matches!(store.get_target(id), Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn invalid_target_rejected_at_admit_time() {
        let (engine, _store, _dir) = test_engine(1, 16);
        let mut target = Target {
            address: "example.com".to_string(),
            interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            engine.add_target(&mut target).await,
            Err(DbError::Invalid(_))
        ));
        assert!(engine.list_targets().await.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_tick_and_counts() {
        // No workers: nothing drains the queue.
        let (engine, _store, _dir) = test_engine(0, 1);

        let mut target = Target {
            name: "t".to_string(),
            kind: TargetKind::Tcp,
            address: "127.0.0.1".to_string(),
            port: 1,
            interval_secs: 3600,
            enabled: false, // keep the timer loop out of the picture
            ..Default::default()
        };
        let id = engine.add_target(&mut target).await.unwrap();

        // Manually register so trigger_check can find it.
        engine.schedule(Arc::new(target.clone())).await;

        engine.trigger_check(id).await.unwrap();
        assert_eq!(engine.dropped_ticks(), 0);

        engine.trigger_check(id).await.unwrap();
        assert_eq!(engine.dropped_ticks(), 1);
    }

    #[tokio::test]
    async fn trigger_unknown_target_errors() {
        let (engine, _store, _dir) = test_engine(1, 16);
        assert!(matches!(
            engine.trigger_check(999).await,
            Err(DbError::NotFound)
        ));
    }

    #[tokio::test]
    async fn worker_executes_probe_and_pipeline_applies() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (engine, store, _dir) = test_engine(2, 16);
        let mut target = Target {
            name: "local".to_string(),
            kind: TargetKind::Tcp,
            address: "127.0.0.1".to_string(),
            port,
            interval_secs: 3600,
            ..Default::default()
        };
        let id = engine.add_target(&mut target).await.unwrap();
        engine.trigger_check(id).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(status) = store.get_status(id) {
                assert_eq!(status.status, CheckStatus::Up);
                assert_eq!(status.uptime_percentage, 100);
                assert!(store.count_history(id, chrono::Utc::now() - chrono::Duration::days(1), None).unwrap() >= 1);
                return;
            }
        }
        panic!("status row never appeared");
    }

    #[tokio::test]
    async fn probe_deadline_synthesizes_timeout_result() {
        // A TCP probe against a blackholed port under a tiny deadline.
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let alert = Arc::new(AlertEngine::new(store.clone()));
        let pipeline = Pipeline::new(
            store.clone(),
            alert,
            FileSink::spawn(dir.path(), 16),
            None,
        );

        let target = Target {
            id: 5,
            name: "slow".to_string(),
            kind: TargetKind::Tcp,
            // RFC 5737 test address, expected to blackhole the SYN
            address: "192.0.2.1".to_string(),
            port: 9,
            interval_secs: 60,
            ..Default::default()
        };

        run_check(&pipeline, &target, Duration::from_millis(50)).await;

        let status = store.get_status(5).unwrap();
        assert_eq!(status.status, CheckStatus::Down);
    }
}
