//! SQLite-backed connection-graph store.
//!
//! One row per (source, destination, day bucket), where the day is the
//! bucket's position in the document's `dat` array. Importing a document again
//! replaces its buckets instead of adding to them. Timestamp and byte arrays
//! are stored as JSON text. Sessions push the destination disjunction into the
//! `WHERE` clause in bounded chunks, fold the ordered rows back into
//! unique-connection documents and evaluate the rest of the plan in-process.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{QueryError, StoreError};
use crate::query::QueryPlan;
use crate::resolution::DestinationFilter;
use crate::store::engine::{self, Frame};
use crate::store::{
    DailyConnections, SourceIdentity, SourceSummary, StoreConnector, StoreSession, UniqueConnection,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Filter terms per `SELECT`. Each term binds two parameters, well under
/// SQLite's host parameter limit.
const FILTERS_PER_QUERY: usize = 500;

/// Location and collection of a SQLite connection-graph store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    collection: String,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>, collection: &str) -> Result<Self, StoreError> {
        if !is_valid_identifier(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            collection: collection.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|e| StoreError::Open {
            path: self.path.display().to_string(),
            source: e,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Creates the collection table and its destination index if missing.
    pub fn create(&self) -> Result<(), StoreError> {
        let conn = self.open()?;
        self.create_schema(&conn)
    }

    fn create_schema(&self, conn: &Connection) -> Result<(), StoreError> {
        let c = &self.collection;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {c} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                src TEXT NOT NULL,
                src_network_uuid TEXT NOT NULL,
                src_network_name TEXT NOT NULL,
                dst TEXT NOT NULL,
                dst_network_uuid TEXT NOT NULL,
                day INTEGER NOT NULL,
                ts TEXT NOT NULL,
                bytes TEXT NOT NULL,
                conn_count INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                invalid_cert INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {c}_dst_idx ON {c} (dst, dst_network_uuid);
            CREATE UNIQUE INDEX IF NOT EXISTS {c}_bucket_idx
                ON {c} (src, src_network_uuid, dst, dst_network_uuid, day);"
        ))
        .map_err(|e| StoreError::Schema {
            collection: c.clone(),
            source: e,
        })
    }

    /// Writes every day bucket of the given documents in one transaction,
    /// replacing buckets already stored for the same pair and day.
    /// Returns the number of rows written.
    pub fn import<'a, I>(&self, documents: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a UniqueConnection>,
    {
        let mut conn = self.open()?;
        self.create_schema(&conn)?;

        let tx = conn.transaction()?;
        let mut rows = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (src, src_network_uuid, src_network_name, dst, dst_network_uuid,
                                 day, ts, bytes, conn_count, total_bytes, invalid_cert)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                self.collection
            ))?;

            for doc in documents {
                for (day, bucket) in doc.dat.iter().enumerate() {
                    stmt.execute(params![
                        doc.src.ip.to_string(),
                        doc.src.network_uuid.to_string(),
                        doc.src.network_name,
                        doc.dst.to_string(),
                        doc.dst_network_uuid.to_string(),
                        day as i64,
                        serde_json::to_string(&bucket.ts)?,
                        serde_json::to_string(&bucket.bytes)?,
                        bucket.count,
                        bucket.tbytes,
                        bucket.icerts,
                    ])?;
                    rows += 1;
                }
            }
        }
        tx.commit()?;

        info!("Imported {} day buckets into {}", rows, self.collection);
        Ok(rows)
    }
}

impl StoreConnector for SqliteStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let conn = self.open()?;
        conn.execute_batch("PRAGMA query_only = ON;")?;

        Ok(Box::new(SqliteSession {
            conn,
            collection: self.collection.clone(),
            filters_per_query: FILTERS_PER_QUERY,
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite {} [{}]", self.path.display(), self.collection)
    }
}

/// Column values of one stored day bucket, before decoding.
struct RawRow {
    src: String,
    src_network_uuid: String,
    src_network_name: String,
    dst: String,
    dst_network_uuid: String,
    ts: String,
    bytes: String,
    count: i64,
    tbytes: i64,
    icerts: bool,
}

struct SqliteSession {
    conn: Connection,
    collection: String,
    filters_per_query: usize,
}

impl SqliteSession {
    /// Loads documents matching any filter, one bounded query per chunk.
    fn load_matching(&self, filters: &[DestinationFilter]) -> Result<Vec<UniqueConnection>, QueryError> {
        let mut seen = HashSet::with_capacity(filters.len());
        let unique: Vec<DestinationFilter> = filters.iter().copied().filter(|f| seen.insert(*f)).collect();

        let chunk_size = self.filters_per_query.max(1);
        if unique.len() <= chunk_size {
            return self.load(Some(&unique));
        }

        let mut documents = Vec::new();
        for chunk in unique.chunks(chunk_size) {
            documents.extend(self.load(Some(chunk))?);
        }

        // Same order a single query would have produced.
        documents.sort_by_cached_key(|doc| {
            (
                doc.src.ip.to_string(),
                doc.src.network_uuid.to_string(),
                doc.src.network_name.clone(),
                doc.dst.to_string(),
                doc.dst_network_uuid.to_string(),
            )
        });
        Ok(documents)
    }

    /// Loads matching documents, or every document when `filters` is `None`.
    fn load(&self, filters: Option<&[DestinationFilter]>) -> Result<Vec<UniqueConnection>, QueryError> {
        let mut sql = format!(
            "SELECT src, src_network_uuid, src_network_name, dst, dst_network_uuid,
                    ts, bytes, conn_count, total_bytes, invalid_cert
             FROM {}",
            self.collection
        );
        let mut values: Vec<String> = Vec::new();

        if let Some(filters) = filters {
            let terms: Vec<String> = filters
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    values.push(f.dst.to_string());
                    values.push(f.dst_network_uuid.to_string());
                    format!("(dst = ?{} AND dst_network_uuid = ?{})", 2 * i + 1, 2 * i + 2)
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&terms.join(" OR "));
        }
        sql.push_str(
            " ORDER BY src, src_network_uuid, src_network_name, dst, dst_network_uuid, day, id",
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(RawRow {
                src: row.get(0)?,
                src_network_uuid: row.get(1)?,
                src_network_name: row.get(2)?,
                dst: row.get(3)?,
                dst_network_uuid: row.get(4)?,
                ts: row.get(5)?,
                bytes: row.get(6)?,
                count: row.get(7)?,
                tbytes: row.get(8)?,
                icerts: row.get(9)?,
            })
        })?;

        let mut documents: Vec<UniqueConnection> = Vec::new();
        for raw in rows {
            let (src, dst, dst_network_uuid, bucket) = decode(raw?)?;

            match documents.last_mut() {
                Some(doc) if doc.src == src && doc.dst == dst && doc.dst_network_uuid == dst_network_uuid => {
                    doc.dat.push(bucket);
                }
                _ => documents.push(UniqueConnection {
                    src,
                    dst,
                    dst_network_uuid,
                    dat: vec![bucket],
                }),
            }
        }

        Ok(documents)
    }
}

impl StoreSession for SqliteSession {
    fn aggregate(&mut self, plan: &QueryPlan) -> Result<Vec<SourceSummary>, QueryError> {
        let (documents, remaining) = match plan.destination_filters() {
            // Nothing can match an empty disjunction.
            Some([]) => (Vec::new(), &plan.stages()[1..]),
            Some(filters) => (self.load_matching(filters)?, &plan.stages()[1..]),
            None => (self.load(None)?, plan.stages()),
        };

        debug!(
            "Loaded {} documents from {} for {} remaining stages",
            documents.len(),
            self.collection,
            remaining.len()
        );

        engine::evaluate_stages(remaining, Frame::Documents(documents.iter().collect()))
    }
}

fn decode(raw: RawRow) -> Result<(SourceIdentity, IpAddr, Uuid, DailyConnections), QueryError> {
    let src = SourceIdentity {
        ip: parse_ip("src", &raw.src)?,
        network_uuid: parse_uuid("src_network_uuid", &raw.src_network_uuid)?,
        network_name: raw.src_network_name,
    };
    let dst = parse_ip("dst", &raw.dst)?;
    let dst_network_uuid = parse_uuid("dst_network_uuid", &raw.dst_network_uuid)?;

    let bucket = DailyConnections {
        ts: serde_json::from_str(&raw.ts).map_err(|e| QueryError::Decode {
            field: "ts",
            source: e,
        })?,
        bytes: serde_json::from_str(&raw.bytes).map_err(|e| QueryError::Decode {
            field: "bytes",
            source: e,
        })?,
        count: raw.count,
        tbytes: raw.tbytes,
        icerts: raw.icerts,
    };

    Ok((src, dst, dst_network_uuid, bucket))
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, QueryError> {
    value.parse().map_err(|_| QueryError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, QueryError> {
    Uuid::parse_str(value).map_err(|_| QueryError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
