//! beacon-dissector: per-FQDN evidence gathering for C2 beacon detection.
//!
//! Reads resolved hostnames as JSON Lines, queries the connection-graph store
//! for every internal source that reached any of their addresses, and writes
//! strobe and beacon-candidate records for the scoring stage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ JSONL input │────>│  Dissector  │────>│   Output    │
//! │  (reader)   │ cap0│  (workers)  │sink │ (text/json) │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!  spawn_blocking       OS threads          Mutex<W>
//! ```
//!
//! - **Reader**: line-reader thread plus a blocking task feeding the rendezvous
//!   intake; Ctrl+C stops intake even while the reader waits for input
//! - **Dissector**: worker threads, each with its own SQLite session
//! - **Metrics**: optional async Prometheus endpoint

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use beacon_dissector::config::Config;
use beacon_dissector::error::SubmitError;
use beacon_dissector::export::{OutputFormat, RecordWriter};
use beacon_dissector::metrics::{new_shared_metrics, run_metrics_server, DissectorObserver};
use beacon_dissector::resolution::ResolutionInput;
use beacon_dissector::store::{SqliteStore, UniqueConnection};
use beacon_dissector::{DissectionReport, Dissector};

/// beacon-dissector: gather per-source connection evidence for resolved hostnames.
#[derive(Parser, Debug)]
#[command(name = "beacon-dissector")]
#[command(version = "0.1.0")]
#[command(about = "Triage per-hostname connection evidence for C2 beacon analysis")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dissect resolved hostnames against the connection store.
    Dissect {
        /// Path to a TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON Lines file of resolved hostnames (default: stdin).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// SQLite store path (overrides config).
        #[arg(long)]
        store: Option<PathBuf>,

        /// Store collection (overrides config).
        #[arg(long)]
        collection: Option<String>,

        /// Number of worker threads (overrides config).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Connection count above which a source is a strobe (overrides config).
        #[arg(long)]
        strobe_limit: Option<i64>,

        /// Minimum connections per source (overrides config).
        #[arg(long)]
        min_connections: Option<i64>,

        /// Output format: text, json, jsonl (overrides config).
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<String>,

        /// Serve Prometheus metrics on this address.
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,

        /// Enable verbose logging (writes to stderr).
        #[arg(short, long)]
        verbose: bool,
    },

    /// Load unique-connection documents (JSON Lines) into a SQLite store.
    Import {
        /// SQLite store path.
        #[arg(long)]
        store: PathBuf,

        /// Target collection.
        #[arg(long, default_value = "uconn")]
        collection: String,

        /// JSON Lines file of unique connections.
        #[arg(short, long)]
        file: PathBuf,

        /// Enable verbose logging (writes to stderr).
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a default configuration file.
    GenerateConfig {
        /// Write to this path instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Dissect {
            config,
            input,
            store,
            collection,
            workers,
            strobe_limit,
            min_connections,
            format,
            output,
            metrics_addr,
            verbose,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };

            if let Some(path) = store {
                config.store.path = path;
            }
            if let Some(collection) = collection {
                config.store.collection = collection;
            }
            if let Some(workers) = workers {
                config.dissector.worker_count = workers;
            }
            if let Some(limit) = strobe_limit {
                config.dissector.strobe_limit = limit;
            }
            if let Some(min) = min_connections {
                config.dissector.min_connections = min;
            }
            if let Some(format) = format {
                config.output.format = format;
            }
            if output.is_some() {
                config.output.file = output;
            }
            if metrics_addr.is_some() {
                config.metrics.bind_address = metrics_addr;
            }
            config.output.verbose |= verbose;

            init_logging(config.output.verbose)?;
            config.validate()?;

            run_dissect(config, input).await
        }

        Commands::Import {
            store,
            collection,
            file,
            verbose,
        } => {
            init_logging(verbose)?;
            run_import(&store, &collection, &file)
        }

        Commands::GenerateConfig { output } => {
            let content = Config::generate_default();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write config: {}", path.display()))?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Records go to stdout, so logs stay on stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn run_dissect(config: Config, input: Option<PathBuf>) -> Result<()> {
    info!("Starting beacon dissector...");

    let store = SqliteStore::new(&config.store.path, &config.store.collection)?;
    let settings = config.dissector.to_settings();

    let reader: Box<dyn BufRead + Send> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let out: Box<dyn Write + Send> = match &config.output.file {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {}", path))?,
        )),
        None => Box::new(std::io::stdout()),
    };
    let sink = Arc::new(RecordWriter::new(out, config.output.format));

    let metrics = new_shared_metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_handle = config.metrics.bind_address.map(|addr| {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    tokio::spawn(watch_interrupts(stop_tx));

    let lines = spawn_line_reader(reader)?;
    let observer: Arc<dyn DissectorObserver> = metrics.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<DissectionReport> {
        let dissector = Dissector::start(settings, &store, sink, observer)?;
        feed(&dissector, lines, stop_rx)?;
        Ok(dissector.shutdown())
    })
    .await
    .context("Dissection task panicked")??;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!(
        "Beacon dissector finished in {:.2}s: {} units, {} strobes, {} beacon candidates, {} discarded, {} abandoned",
        report.elapsed.as_secs_f64(),
        report.totals.units,
        report.totals.strobes,
        report.totals.beacon_candidates,
        report.totals.discarded,
        report.totals.units_abandoned
    );
    if report.panicked_workers > 0 {
        anyhow::bail!("{} dissector workers panicked", report.panicked_workers);
    }
    Ok(())
}

/// First Ctrl+C stops intake and lets workers drain; a second one exits.
async fn watch_interrupts(stop: Sender<()>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("Received Ctrl+C, draining workers (press again to exit immediately)...");
    let _ = stop.try_send(());

    if tokio::signal::ctrl_c().await.is_ok() {
        error!("Received second Ctrl+C, exiting without draining");
        std::process::exit(130);
    }
}

/// Reads lines on a dedicated thread so a blocked read never delays shutdown.
/// The thread ends at EOF or once the receiver is dropped.
fn spawn_line_reader(reader: Box<dyn BufRead + Send>) -> Result<Receiver<io::Result<String>>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("intake-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn input reader")?;
    Ok(rx)
}

enum Intake {
    Line(io::Result<String>),
    Eof,
    Interrupted,
    SignalsGone,
}

/// Submits every JSON line until EOF or a stop signal. Malformed lines and
/// rejected units are logged and skipped.
fn feed(dissector: &Dissector, lines: Receiver<io::Result<String>>, stop: Receiver<()>) -> Result<()> {
    let mut stop = stop;
    let mut submitted = 0usize;
    let mut skipped = 0usize;
    let mut index = 0usize;

    loop {
        let event = crossbeam_channel::select! {
            recv(lines) -> msg => match msg {
                Ok(line) => Intake::Line(line),
                Err(_) => Intake::Eof,
            },
            recv(stop) -> msg => match msg {
                Ok(()) => Intake::Interrupted,
                Err(_) => Intake::SignalsGone,
            },
        };

        let line = match event {
            Intake::Line(line) => line,
            Intake::Eof => break,
            Intake::Interrupted => {
                info!("Intake stopped after {} lines", index);
                break;
            }
            Intake::SignalsGone => {
                stop = crossbeam_channel::never();
                continue;
            }
        };
        index += 1;

        let line = line.with_context(|| format!("Failed to read input line {}", index))?;
        if line.trim().is_empty() {
            continue;
        }

        let input: ResolutionInput = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!("Skipping input line {}: {}", index, e);
                skipped += 1;
                continue;
            }
        };

        match dissector.submit(input.into()) {
            Ok(()) => submitted += 1,
            Err(e @ SubmitError::InvalidUnit { .. }) => {
                warn!("Skipping input line {}: {}", index, e);
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!("Submitted {} resolution units ({} skipped)", submitted, skipped);
    Ok(())
}

fn run_import(store: &Path, collection: &str, file: &Path) -> Result<()> {
    let store = SqliteStore::new(store, collection)?;

    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );

    let mut documents = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: UniqueConnection = serde_json::from_str(&line)
            .with_context(|| format!("Invalid unique connection on line {}", index + 1))?;
        documents.push(doc);
    }

    let rows = store.import(&documents)?;
    info!(
        "Imported {} unique connections ({} day buckets) into {}:{}",
        documents.len(),
        rows,
        store.path().display(),
        store.collection()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use beacon_dissector::metrics::Metrics;
    use beacon_dissector::store::{DailyConnections, MemoryStore, SourceIdentity};
    use beacon_dissector::DissectorSettings;
    use uuid::Uuid;

    fn store() -> MemoryStore {
        MemoryStore::new(vec![UniqueConnection {
            src: SourceIdentity::new("10.0.0.7".parse().unwrap(), Uuid::nil(), "internal"),
            dst: "198.51.100.5".parse().unwrap(),
            dst_network_uuid: Uuid::nil(),
            dat: vec![DailyConnections {
                ts: vec![100, 160, 220, 280, 340],
                bytes: vec![300; 5],
                count: 25,
                tbytes: 1500,
                icerts: false,
            }],
        }])
    }

    fn start(metrics: Arc<Metrics>) -> Dissector {
        let settings = DissectorSettings {
            worker_count: 1,
            ..Default::default()
        };
        let sink = Arc::new(RecordWriter::new(Vec::new(), OutputFormat::JsonLines));
        Dissector::start(settings, &store(), sink, metrics).unwrap()
    }

    #[test]
    fn test_feed_submits_until_eof() {
        let input = concat!(
            "{\"fqdn\": \"evil.example.com\", \"resolved_ips\": [{\"ip\": \"198.51.100.5\"}]}\n",
            "not json\n",
            "\n",
            "{\"fqdn\": \"empty.example.com\", \"resolved_ips\": []}\n",
        );
        let lines = spawn_line_reader(Box::new(io::Cursor::new(input))).unwrap();
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let metrics = Arc::new(Metrics::new());
        let dissector = start(metrics.clone());
        feed(&dissector, lines, stop_rx).unwrap();
        let report = dissector.shutdown();

        assert_eq!(report.totals.units, 1);
        assert_eq!(metrics.beacon_candidates_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_feed_stops_while_input_is_idle() {
        // Input that never produces a line and never reaches EOF.
        let (_line_tx, lines) = crossbeam_channel::bounded::<io::Result<String>>(0);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let dissector = start(Arc::new(Metrics::new()));
        thread::spawn(move || {
            let result = feed(&dissector, lines, stop_rx);
            dissector.shutdown();
            let _ = done_tx.send(result.is_ok());
        });

        stop_tx.send(()).unwrap();
        let finished = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("intake did not stop while waiting for input");
        assert!(finished);
    }

    #[test]
    fn test_feed_survives_lost_signal_source() {
        let input = "{\"fqdn\": \"evil.example.com\", \"resolved_ips\": [{\"ip\": \"198.51.100.5\"}]}\n";
        let lines = spawn_line_reader(Box::new(io::Cursor::new(input))).unwrap();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        drop(stop_tx);

        let dissector = start(Arc::new(Metrics::new()));
        feed(&dissector, lines, stop_rx).unwrap();

        assert_eq!(dissector.shutdown().totals.units, 1);
    }
}
