//! Dissection stage: intake, worker pool and lifecycle.
//!
//! # Architecture
//!
//! ```text
//!              submit()            ┌──────────┐   plan    ┌─────────┐
//! resolver ───────────> rendezvous ┤ worker 0 ├─────────> │ session │
//!            (blocks)    channel   ├──────────┤  <─rows── ├─────────┤
//!                        (cap 0)   │ worker N ├───...     │ session │
//!                                  └────┬─────┘           └─────────┘
//!                                       │ classify
//!                                       v
//!                              AnalysisSink::dissected ──> scoring stage
//! ```
//!
//! The intake has no buffer: `submit` returns only once a worker has taken
//! the unit, so a slow store stalls the resolver instead of growing memory.
//! Each worker owns its store session and its statistics. Statistics come
//! back through `JoinHandle::join` at shutdown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::classifier::{classify, AnalysisRecord, RecordKind};
use crate::error::{DissectError, SubmitError};
use crate::metrics::DissectorObserver;
use crate::query::{QueryPlan, DEFAULT_MIN_CONNECTIONS};
use crate::resolution::ResolutionUnit;
use crate::store::{SourceSummary, StoreConnector, StoreSession};

/// Downstream consumer of dissected records.
pub trait AnalysisSink: Send + Sync {
    /// Called from whichever worker produced the record.
    fn dissected(&self, record: AnalysisRecord);

    /// Called exactly once, after every `dissected` call has returned.
    fn closed(&self);
}

/// Tuning for one dissection run.
#[derive(Debug, Clone)]
pub struct DissectorSettings {
    /// Sources above this many connections are flagged as strobes.
    pub strobe_limit: i64,
    /// Noise floor applied inside the store query.
    pub min_connections: i64,
    pub worker_count: usize,
    /// Extra attempts after a failed query before the unit is abandoned.
    pub query_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for DissectorSettings {
    fn default() -> Self {
        Self {
            strobe_limit: 86_400,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            worker_count: 4,
            query_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl DissectorSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".to_string());
        }
        if self.strobe_limit < 0 {
            return Err("strobe_limit must not be negative".to_string());
        }
        if self.min_connections < 0 {
            return Err("min_connections must not be negative".to_string());
        }
        Ok(())
    }
}

/// Counters one worker accumulates over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub units: u64,
    pub summaries: u64,
    pub strobes: u64,
    pub beacon_candidates: u64,
    pub discarded: u64,
    pub query_failures: u64,
    pub units_abandoned: u64,
    pub query_time: Duration,
}

impl WorkerStats {
    fn absorb(&mut self, other: &WorkerStats) {
        self.units += other.units;
        self.summaries += other.summaries;
        self.strobes += other.strobes;
        self.beacon_candidates += other.beacon_candidates;
        self.discarded += other.discarded;
        self.query_failures += other.query_failures;
        self.units_abandoned += other.units_abandoned;
        self.query_time += other.query_time;
    }

    pub fn records(&self) -> u64 {
        self.strobes + self.beacon_candidates
    }
}

/// Outcome of a full dissection run.
#[derive(Debug, Clone, Default)]
pub struct DissectionReport {
    pub workers: usize,
    pub panicked_workers: usize,
    pub totals: WorkerStats,
    pub elapsed: Duration,
}

/// The dissection stage. Dropping it has the same effect as [`Dissector::shutdown`].
pub struct Dissector {
    intake: Option<Sender<ResolutionUnit>>,
    workers: Vec<JoinHandle<WorkerStats>>,
    sink: Arc<dyn AnalysisSink>,
    started: Instant,
    finished: bool,
}

impl Dissector {
    /// Opens one store session per worker and spawns the pool.
    pub fn start(
        settings: DissectorSettings,
        connector: &dyn StoreConnector,
        sink: Arc<dyn AnalysisSink>,
        observer: Arc<dyn DissectorObserver>,
    ) -> Result<Self, DissectError> {
        settings.validate().map_err(DissectError::InvalidSettings)?;

        let sessions = (0..settings.worker_count)
            .map(|worker| {
                connector
                    .open_session()
                    .map_err(|source| DissectError::Session { worker, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (intake_tx, intake_rx) = crossbeam_channel::bounded::<ResolutionUnit>(0);

        let mut workers = Vec::with_capacity(settings.worker_count);
        for (id, session) in sessions.into_iter().enumerate() {
            let worker = Worker {
                id,
                session,
                intake: intake_rx.clone(),
                sink: Arc::clone(&sink),
                observer: Arc::clone(&observer),
                settings: settings.clone(),
                stats: WorkerStats::default(),
            };

            let handle = thread::Builder::new()
                .name(format!("dissector-worker-{id}"))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }

        // Workers hold the only receivers, so their exit is observable to submit().
        drop(intake_rx);

        info!(
            "Dissector started: {} workers against {} (strobe_limit={}, min_connections={})",
            settings.worker_count,
            connector.describe(),
            settings.strobe_limit,
            settings.min_connections
        );

        Ok(Self {
            intake: Some(intake_tx),
            workers,
            sink,
            started: Instant::now(),
            finished: false,
        })
    }

    /// Hands one unit to the pool, blocking until a worker takes it.
    pub fn submit(&self, unit: ResolutionUnit) -> Result<(), SubmitError> {
        unit.validate().map_err(|reason| SubmitError::InvalidUnit {
            fqdn: unit.fqdn().to_string(),
            reason,
        })?;

        let intake = self.intake.as_ref().ok_or(SubmitError::IntakeClosed)?;
        intake.send(unit).map_err(|_| SubmitError::IntakeClosed)
    }

    /// Closes the intake, waits for every worker to drain, then signals the
    /// sink that no more records will arrive.
    pub fn shutdown(mut self) -> DissectionReport {
        self.finish()
    }

    fn finish(&mut self) -> DissectionReport {
        drop(self.intake.take());

        let mut report = DissectionReport {
            workers: self.workers.len(),
            ..Default::default()
        };

        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(stats) => report.totals.absorb(&stats),
                Err(_) => {
                    error!("Dissector worker panicked");
                    report.panicked_workers += 1;
                }
            }
        }
        report.elapsed = self.started.elapsed();

        info!(
            "Total for dissector: {:.3}s querying across {} workers, {} units, {} records ({} strobes), {} abandoned",
            report.totals.query_time.as_secs_f64(),
            report.workers,
            report.totals.units,
            report.totals.records(),
            report.totals.strobes,
            report.totals.units_abandoned
        );

        self.finished = true;
        self.sink.closed();
        report
    }
}

impl Drop for Dissector {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

struct Worker {
    id: usize,
    session: Box<dyn StoreSession>,
    intake: Receiver<ResolutionUnit>,
    sink: Arc<dyn AnalysisSink>,
    observer: Arc<dyn DissectorObserver>,
    settings: DissectorSettings,
    stats: WorkerStats,
}

impl Worker {
    fn run(mut self) -> WorkerStats {
        debug!("Worker {} started", self.id);

        while let Ok(unit) = self.intake.recv() {
            self.dissect(unit);
        }

        debug!("Worker {} drained, exiting", self.id);
        self.stats
    }

    fn dissect(&mut self, unit: ResolutionUnit) {
        let plan = QueryPlan::build(unit.filters(), self.settings.min_connections);
        let Some(rows) = self.query(&unit, &plan) else {
            return;
        };

        self.stats.units += 1;
        self.stats.summaries += rows.len() as u64;

        for summary in rows {
            let Some(kind) = classify(&summary, self.settings.strobe_limit).record_kind() else {
                trace!(
                    "Dropping {} for {}: {} unique timestamps",
                    summary.src,
                    unit.fqdn(),
                    summary.timestamps.len()
                );
                self.stats.discarded += 1;
                self.observer.summary_discarded(unit.fqdn(), &summary.src);
                continue;
            };

            let record = AnalysisRecord::with_kind(&unit, summary, kind);
            match kind {
                RecordKind::Strobe => self.stats.strobes += 1,
                RecordKind::BeaconCandidate => self.stats.beacon_candidates += 1,
            }
            self.observer.record_emitted(&record);
            self.sink.dissected(record);
        }
    }

    /// Runs the plan, retrying with exponential backoff. `None` means the
    /// unit was abandoned.
    fn query(&mut self, unit: &ResolutionUnit, plan: &QueryPlan) -> Option<Vec<SourceSummary>> {
        let attempts = self.settings.query_retries.saturating_add(1);
        let mut backoff = self.settings.retry_backoff;

        for attempt in 1..=attempts {
            let start = Instant::now();
            match self.session.aggregate(plan) {
                Ok(rows) => {
                    let elapsed = start.elapsed();
                    self.stats.query_time += elapsed;
                    self.observer.query_completed(unit.fqdn(), rows.len(), elapsed);
                    debug!(
                        "Worker {} queried {} ({} addresses): {} sources in {:?}",
                        self.id,
                        unit.fqdn(),
                        unit.filters().len(),
                        rows.len(),
                        elapsed
                    );
                    return Some(rows);
                }
                Err(e) => {
                    self.stats.query_failures += 1;
                    warn!(
                        worker = self.id,
                        fqdn = %unit.fqdn(),
                        filters = unit.filters().len(),
                        attempt,
                        attempts,
                        error = %e,
                        "store query failed"
                    );
                    self.observer
                        .query_failed(unit.fqdn(), unit.filters().len(), attempt, &e);

                    if attempt < attempts {
                        thread::sleep(backoff);
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        self.stats.units_abandoned += 1;
        warn!(
            worker = self.id,
            fqdn = %unit.fqdn(),
            filters = unit.filters().len(),
            "abandoning resolution unit after {} failed attempts",
            attempts
        );
        self.observer.unit_abandoned(unit.fqdn());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use uuid::Uuid;

    use crate::error::{QueryError, StoreError};
    use crate::metrics::{Metrics, NoopObserver};
    use crate::resolution::ResolvedIp;
    use crate::store::{DailyConnections, MemoryStore, SourceIdentity, UniqueConnection};

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<AnalysisRecord>>,
        closed: AtomicUsize,
        records_at_close: AtomicUsize,
    }

    impl AnalysisSink for CollectingSink {
        fn dissected(&self, record: AnalysisRecord) {
            self.records.lock().unwrap().push(record);
        }

        fn closed(&self) {
            let seen = self.records.lock().unwrap().len();
            self.records_at_close.store(seen, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CollectingSink {
        fn records(&self) -> Vec<AnalysisRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    fn settings(workers: usize) -> DissectorSettings {
        DissectorSettings {
            strobe_limit: 50,
            min_connections: 10,
            worker_count: workers,
            query_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn resolved(addr: &str) -> ResolvedIp {
        ResolvedIp::new(addr.parse().unwrap(), Uuid::nil(), "external")
    }

    fn unit(fqdn: &str, addrs: &[&str]) -> ResolutionUnit {
        ResolutionUnit::new(fqdn, addrs.iter().map(|a| resolved(a)))
    }

    fn doc(src: &str, dst: &str, ts: Vec<i64>, count: i64) -> UniqueConnection {
        UniqueConnection {
            src: SourceIdentity::new(src.parse().unwrap(), Uuid::nil(), "internal"),
            dst: dst.parse().unwrap(),
            dst_network_uuid: Uuid::nil(),
            dat: vec![DailyConnections {
                bytes: vec![300; ts.len()],
                tbytes: 300 * ts.len() as i64,
                ts,
                count,
                icerts: false,
            }],
        }
    }

    fn run(
        store: &dyn StoreConnector,
        workers: usize,
        units: Vec<ResolutionUnit>,
    ) -> (Arc<CollectingSink>, DissectionReport) {
        let sink = Arc::new(CollectingSink::default());
        let dissector =
            Dissector::start(settings(workers), store, sink.clone(), Arc::new(NoopObserver)).unwrap();
        for unit in units {
            dissector.submit(unit).unwrap();
        }
        let report = dissector.shutdown();
        (sink, report)
    }

    #[test]
    fn test_scenario_beacon_candidate() {
        let store = MemoryStore::new(vec![doc(
            "10.0.0.7",
            "198.51.100.5",
            vec![100, 160, 220, 280, 340],
            15,
        )]);

        let (sink, report) = run(&store, 1, vec![unit("evil.example.com", &["198.51.100.5"])]);
        let records = sink.records();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::BeaconCandidate);
        assert_eq!(records[0].fqdn, "evil.example.com");
        assert_eq!(records[0].src.ip, "10.0.0.7".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(records[0].timestamps, vec![100, 160, 220, 280, 340]);
        assert_eq!(report.totals.beacon_candidates, 1);
    }

    #[test]
    fn test_scenario_strobe() {
        let store = MemoryStore::new(vec![doc("10.0.0.7", "198.51.100.5", vec![100, 160], 5000)]);

        let (sink, report) = run(&store, 1, vec![unit("evil.example.com", &["198.51.100.5"])]);
        let records = sink.records();

        assert_eq!(records.len(), 1);
        assert!(records[0].is_strobe());
        assert_eq!(records[0].connection_count, 5000);
        assert!(records[0].timestamps.is_empty());
        assert_eq!(report.totals.strobes, 1);
    }

    #[test]
    fn test_scenario_insufficient_evidence() {
        let store = MemoryStore::new(vec![doc("10.0.0.7", "198.51.100.5", vec![100, 160], 15)]);

        let (sink, report) = run(&store, 1, vec![unit("evil.example.com", &["198.51.100.5"])]);

        assert!(sink.records().is_empty());
        assert_eq!(report.totals.discarded, 1);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_each_summary_counted_once() {
        let store = MemoryStore::new(vec![
            doc("10.0.0.1", "198.51.100.5", vec![1, 2], 5000),
            doc("10.0.0.2", "198.51.100.5", vec![1, 2, 3, 4], 20),
            doc("10.0.0.3", "198.51.100.5", vec![1, 2, 3], 20),
        ]);

        let (sink, report) = run(&store, 1, vec![unit("evil.example.com", &["198.51.100.5"])]);

        assert_eq!(report.totals.summaries, 3);
        assert_eq!(report.totals.strobes, 1);
        assert_eq!(report.totals.beacon_candidates, 1);
        assert_eq!(report.totals.discarded, 1);
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_completion_fires_once_after_all_records() {
        let docs: Vec<UniqueConnection> = (0..30)
            .map(|i| doc(&format!("10.0.1.{i}"), "198.51.100.5", vec![1, 2, 3, 4, 5], 20))
            .collect();
        let store = MemoryStore::new(docs);
        let units: Vec<ResolutionUnit> = (0..12)
            .map(|i| unit(&format!("host{i}.example.com"), &["198.51.100.5"]))
            .collect();

        let (sink, report) = run(&store, 4, units);

        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
        assert_eq!(sink.records().len(), 12 * 30);
        assert_eq!(sink.records_at_close.load(Ordering::SeqCst), 12 * 30);
        assert_eq!(report.workers, 4);
        assert_eq!(report.totals.units, 12);
        assert_eq!(report.panicked_workers, 0);
    }

    #[test]
    fn test_single_worker_preserves_submission_order() {
        let store = MemoryStore::new(vec![
            doc("10.0.0.1", "198.51.100.1", vec![1, 2, 3, 4], 20),
            doc("10.0.0.2", "198.51.100.2", vec![1, 2, 3, 4], 20),
            doc("10.0.0.3", "198.51.100.3", vec![1, 2, 3, 4], 20),
        ]);
        let units = vec![
            unit("c.example.com", &["198.51.100.3"]),
            unit("a.example.com", &["198.51.100.1"]),
            unit("b.example.com", &["198.51.100.2"]),
        ];

        let (sink, _) = run(&store, 1, units);
        let order: Vec<String> = sink.records().into_iter().map(|r| r.fqdn).collect();

        assert_eq!(order, vec!["c.example.com", "a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_rejects_invalid_units() {
        let sink = Arc::new(CollectingSink::default());
        let dissector = Dissector::start(
            settings(1),
            &MemoryStore::default(),
            sink.clone(),
            Arc::new(NoopObserver),
        )
        .unwrap();

        assert!(matches!(
            dissector.submit(unit("evil.example.com", &[])),
            Err(SubmitError::InvalidUnit { .. })
        ));
        assert!(matches!(
            dissector.submit(unit("", &["198.51.100.5"])),
            Err(SubmitError::InvalidUnit { .. })
        ));

        dissector.shutdown();
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = Dissector::start(
            settings(0),
            &MemoryStore::default(),
            Arc::new(CollectingSink::default()),
            Arc::new(NoopObserver),
        );

        assert!(matches!(result, Err(DissectError::InvalidSettings(_))));
    }

    #[test]
    fn test_drop_closes_exactly_once() {
        let sink = Arc::new(CollectingSink::default());
        {
            let _dissector = Dissector::start(
                settings(2),
                &MemoryStore::default(),
                sink.clone(),
                Arc::new(NoopObserver),
            )
            .unwrap();
        }

        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    /// Fails the first `failures` queries across all of its sessions.
    struct FlakyStore {
        inner: MemoryStore,
        remaining_failures: Arc<AtomicU32>,
    }

    struct FlakySession {
        inner: Box<dyn StoreSession>,
        remaining_failures: Arc<AtomicU32>,
    }

    impl StoreConnector for FlakyStore {
        fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
            Ok(Box::new(FlakySession {
                inner: self.inner.open_session()?,
                remaining_failures: Arc::clone(&self.remaining_failures),
            }))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    impl StoreSession for FlakySession {
        fn aggregate(&mut self, plan: &QueryPlan) -> Result<Vec<SourceSummary>, QueryError> {
            let took_failure = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if took_failure {
                return Err(QueryError::Unavailable("connection reset".to_string()));
            }
            self.inner.aggregate(plan)
        }
    }

    #[test]
    fn test_retries_transient_failures() {
        let store = FlakyStore {
            inner: MemoryStore::new(vec![doc("10.0.0.7", "198.51.100.5", vec![1, 2, 3, 4, 5], 15)]),
            remaining_failures: Arc::new(AtomicU32::new(2)),
        };
        let sink = Arc::new(CollectingSink::default());
        let metrics = Arc::new(Metrics::new());

        let dissector = Dissector::start(settings(1), &store, sink.clone(), metrics.clone()).unwrap();
        dissector.submit(unit("evil.example.com", &["198.51.100.5"])).unwrap();
        let report = dissector.shutdown();

        assert_eq!(sink.records().len(), 1);
        assert_eq!(report.totals.query_failures, 2);
        assert_eq!(report.totals.units_abandoned, 0);
        assert_eq!(metrics.query_failures_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.beacon_candidates_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_abandons_unit_and_moves_on() {
        // Three attempts for the first unit fail; the second unit succeeds.
        let store = FlakyStore {
            inner: MemoryStore::new(vec![doc("10.0.0.7", "198.51.100.5", vec![1, 2, 3, 4, 5], 15)]),
            remaining_failures: Arc::new(AtomicU32::new(3)),
        };
        let sink = Arc::new(CollectingSink::default());
        let metrics = Arc::new(Metrics::new());

        let dissector = Dissector::start(settings(1), &store, sink.clone(), metrics.clone()).unwrap();
        dissector.submit(unit("lost.example.com", &["198.51.100.5"])).unwrap();
        dissector.submit(unit("evil.example.com", &["198.51.100.5"])).unwrap();
        let report = dissector.shutdown();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fqdn, "evil.example.com");
        assert_eq!(report.totals.units_abandoned, 1);
        assert_eq!(metrics.units_abandoned_total.load(Ordering::Relaxed), 1);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    struct UnreachableStore;

    impl StoreConnector for UnreachableStore {
        fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
            Err(StoreError::InvalidCollection("unreachable".to_string()))
        }

        fn describe(&self) -> String {
            "unreachable".to_string()
        }
    }

    #[test]
    fn test_session_failure_aborts_start() {
        let sink = Arc::new(CollectingSink::default());
        let result = Dissector::start(settings(2), &UnreachableStore, sink.clone(), Arc::new(NoopObserver));

        assert!(matches!(result, Err(DissectError::Session { worker: 0, .. })));
        assert_eq!(sink.closed.load(Ordering::SeqCst), 0);
    }

    /// Blocks every query until the test releases it.
    struct GatedStore {
        gate: Receiver<()>,
    }

    struct GatedSession {
        gate: Receiver<()>,
    }

    impl StoreConnector for GatedStore {
        fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
            Ok(Box::new(GatedSession {
                gate: self.gate.clone(),
            }))
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    impl StoreSession for GatedSession {
        fn aggregate(&mut self, _plan: &QueryPlan) -> Result<Vec<SourceSummary>, QueryError> {
            self.gate
                .recv()
                .map_err(|_| QueryError::Unavailable("gate closed".to_string()))?;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_submit_blocks_while_workers_are_busy() {
        let (release, gate) = crossbeam_channel::unbounded();
        let store = GatedStore { gate };
        let sink = Arc::new(CollectingSink::default());
        let dissector = Dissector::start(settings(1), &store, sink.clone(), Arc::new(NoopObserver)).unwrap();

        // The only worker takes this unit and then waits on the gate.
        dissector.submit(unit("first.example.com", &["198.51.100.5"])).unwrap();

        let handed_off = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                dissector.submit(unit("second.example.com", &["198.51.100.5"])).unwrap();
                handed_off.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(100));
            assert!(!handed_off.load(Ordering::SeqCst));

            release.send(()).unwrap();
        });

        assert!(handed_off.load(Ordering::SeqCst));
        release.send(()).unwrap();

        let report = dissector.shutdown();
        assert_eq!(report.totals.units, 2);
    }
}
