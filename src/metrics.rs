//! Observability for the dissection stage.
//!
//! Workers report through the [`DissectorObserver`] trait and never hold a
//! lock of their own. [`Metrics`] is the counting implementation and renders
//! Prometheus text, served by [`run_metrics_server`].
//!
//! # Metrics Exported
//!
//! - `beacon_dissector_units_total` - Resolution units whose query succeeded
//! - `beacon_dissector_query_failures_total` - Failed query attempts
//! - `beacon_dissector_units_abandoned_total` - Units dropped after exhausting retries
//! - `beacon_dissector_summaries_total` - Source summaries returned by the store
//! - `beacon_dissector_strobes_total` - Strobe records emitted
//! - `beacon_dissector_beacon_candidates_total` - Beacon-candidate records emitted
//! - `beacon_dissector_discarded_total` - Summaries dropped for insufficient evidence
//! - `beacon_dissector_query_seconds_sum` / `_count` - Successful query latency

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::classifier::{AnalysisRecord, RecordKind};
use crate::error::QueryError;
use crate::store::SourceIdentity;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives events from dissector workers. Called concurrently from every
/// worker thread, so implementations must be thread-safe.
pub trait DissectorObserver: Send + Sync {
    fn query_completed(&self, _fqdn: &str, _rows: usize, _elapsed: Duration) {}

    fn query_failed(&self, _fqdn: &str, _filters: usize, _attempt: u32, _error: &QueryError) {}

    /// Every attempt for the unit failed; its evidence is lost.
    fn unit_abandoned(&self, _fqdn: &str) {}

    fn record_emitted(&self, _record: &AnalysisRecord) {}

    fn summary_discarded(&self, _fqdn: &str, _src: &SourceIdentity) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DissectorObserver for NoopObserver {}

/// Atomic counters for thread-safe updates.
#[derive(Debug, Default)]
pub struct Metrics {
    pub units_total: AtomicU64,
    pub query_failures_total: AtomicU64,
    pub units_abandoned_total: AtomicU64,
    pub summaries_total: AtomicU64,
    pub strobes_total: AtomicU64,
    pub beacon_candidates_total: AtomicU64,
    pub discarded_total: AtomicU64,
    /// Cumulative successful query time in microseconds.
    pub query_micros_sum: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        write_metric(
            &mut output,
            "beacon_dissector_units_total",
            "Resolution units whose query succeeded",
            "counter",
            self.units_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_query_failures_total",
            "Failed store query attempts",
            "counter",
            self.query_failures_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_units_abandoned_total",
            "Resolution units dropped after exhausting retries",
            "counter",
            self.units_abandoned_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_summaries_total",
            "Source summaries returned by the store",
            "counter",
            self.summaries_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_strobes_total",
            "Strobe records emitted",
            "counter",
            self.strobes_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_beacon_candidates_total",
            "Beacon-candidate records emitted",
            "counter",
            self.beacon_candidates_total.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "beacon_dissector_discarded_total",
            "Summaries dropped for insufficient evidence",
            "counter",
            self.discarded_total.load(Ordering::Relaxed),
        );

        // Latency summary
        output.push_str("# HELP beacon_dissector_query_seconds Successful store query latency\n");
        output.push_str("# TYPE beacon_dissector_query_seconds summary\n");
        output.push_str(&format!(
            "beacon_dissector_query_seconds_sum {:.6}\n",
            self.query_micros_sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "beacon_dissector_query_seconds_count {}\n",
            self.units_total.load(Ordering::Relaxed)
        ));

        output
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} {}\n", name, kind));
    output.push_str(&format!("{} {}\n\n", name, value));
}

impl DissectorObserver for Metrics {
    fn query_completed(&self, _fqdn: &str, rows: usize, elapsed: Duration) {
        self.units_total.fetch_add(1, Ordering::Relaxed);
        self.summaries_total.fetch_add(rows as u64, Ordering::Relaxed);
        self.query_micros_sum
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn query_failed(&self, _fqdn: &str, _filters: usize, _attempt: u32, _error: &QueryError) {
        self.query_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    fn unit_abandoned(&self, _fqdn: &str) {
        self.units_abandoned_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_emitted(&self, record: &AnalysisRecord) {
        let counter = match record.kind {
            RecordKind::Strobe => &self.strobes_total,
            RecordKind::BeaconCandidate => &self.beacon_candidates_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summary_discarded(&self, _fqdn: &str, _src: &SourceIdentity) {
        self.discarded_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared metrics handle for use across threads/tasks.
pub type SharedMetrics = Arc<Metrics>;

/// Create a new shared metrics instance.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(Metrics::new())
}

/// Runs a minimal Prometheus scrape endpoint until `shutdown` flips to true.
///
/// Answers `GET /metrics` with the text exposition, any other `GET` with a
/// health response, and everything else with 404.
pub async fn run_metrics_server(
    bind_address: SocketAddr,
    metrics: SharedMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", bind_address);

    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Metrics server shutting down");
                    break;
                }
                continue;
            }
        };

        debug!("Metrics request from {}", addr);
        tokio::spawn(serve_scrape(socket, Arc::clone(&metrics)));
    }

    Ok(())
}

/// Answers one request. Clients that send nothing are dropped after
/// [`REQUEST_TIMEOUT`].
async fn serve_scrape(mut socket: TcpStream, metrics: SharedMetrics) {
    let mut buf = [0u8; 1024];
    let n = match tokio::time::timeout(REQUEST_TIMEOUT, socket.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(_) => return,
        Err(_) => {
            debug!("Metrics client sent no request within {:?}", REQUEST_TIMEOUT);
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let response = if request.starts_with("GET /metrics") {
        http_ok("text/plain; version=0.0.4; charset=utf-8", &metrics.to_prometheus_format())
    } else if request.starts_with("GET ") {
        http_ok("text/plain", "OK\n")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!("Failed to write response: {}", e);
    }
}

fn http_ok(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
        Content-Type: {}\r\n\
        Content-Length: {}\r\n\
        Connection: close\r\n\
        \r\n\
        {}",
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::AnalysisRecord;
    use crate::resolution::{ResolutionUnit, ResolvedIp};
    use crate::store::SourceSummary;
    use uuid::Uuid;

    fn record(count: i64) -> AnalysisRecord {
        let unit = ResolutionUnit::new(
            "evil.example.com",
            vec![ResolvedIp::new("198.51.100.5".parse().unwrap(), Uuid::nil(), "")],
        );
        let summary = SourceSummary {
            src: SourceIdentity::new("10.0.0.7".parse().unwrap(), Uuid::nil(), ""),
            connection_count: count,
            total_bytes: 0,
            timestamps: vec![1, 2, 3, 4, 5],
            orig_bytes: vec![1; 5],
            invalid_cert: false,
        };
        AnalysisRecord::from_summary(&unit, summary, 50).unwrap()
    }

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.units_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.query_failures_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_observer_counts() {
        let metrics = Metrics::new();
        let src = SourceIdentity::new("10.0.0.7".parse().unwrap(), Uuid::nil(), "");

        metrics.query_completed("evil.example.com", 3, Duration::from_millis(250));
        metrics.query_failed(
            "evil.example.com",
            1,
            1,
            &QueryError::Unavailable("down".to_string()),
        );
        metrics.unit_abandoned("evil.example.com");
        metrics.record_emitted(&record(5000));
        metrics.record_emitted(&record(15));
        metrics.record_emitted(&record(16));
        metrics.summary_discarded("evil.example.com", &src);

        assert_eq!(metrics.units_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.summaries_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.query_failures_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.units_abandoned_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.strobes_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.beacon_candidates_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.discarded_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.query_micros_sum.load(Ordering::Relaxed), 250_000);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.units_total.store(10, Ordering::Relaxed);
        metrics.units_abandoned_total.store(2, Ordering::Relaxed);
        metrics.query_micros_sum.store(1_500_000, Ordering::Relaxed);

        let output = metrics.to_prometheus_format();

        assert!(output.contains("beacon_dissector_units_total 10"));
        assert!(output.contains("beacon_dissector_units_abandoned_total 2"));
        assert!(output.contains("beacon_dissector_query_seconds_sum 1.500000"));
        assert!(output.contains("beacon_dissector_query_seconds_count 10"));
        assert!(output.contains("# HELP beacon_dissector_strobes_total"));
        assert!(output.contains("# TYPE beacon_dissector_discarded_total counter"));
    }

    #[test]
    fn test_shared_metrics() {
        let shared = new_shared_metrics();
        let clone = Arc::clone(&shared);

        shared.unit_abandoned("a.example.com");
        clone.unit_abandoned("b.example.com");

        assert_eq!(shared.units_abandoned_total.load(Ordering::Relaxed), 2);
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        for _ in 0..50 {
            if let Ok(s) = TcpStream::connect(addr).await {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("metrics server did not start");
    }

    async fn scrape(addr: SocketAddr) -> String {
        let mut stream = connect(addr).await;
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_idle_client_does_not_block_scrapes_or_shutdown() {
        let metrics = new_shared_metrics();
        metrics.strobes_total.store(3, Ordering::Relaxed);

        let addr = free_addr();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(run_metrics_server(addr, Arc::clone(&metrics), rx));

        // Connects and never sends a request.
        let _idle = connect(addr).await;

        let body = tokio::time::timeout(Duration::from_secs(3), scrape(addr))
            .await
            .expect("scrape stalled behind an idle client");
        assert!(body.contains("beacon_dissector_strobes_total 3"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("server did not stop with an idle client connected")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_metrics_server_serves_and_stops() {
        let metrics = new_shared_metrics();
        metrics.units_total.store(7, Ordering::Relaxed);

        let addr = free_addr();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(run_metrics_server(addr, Arc::clone(&metrics), rx));

        let body = scrape(addr).await;

        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("beacon_dissector_units_total 7"));

        tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
