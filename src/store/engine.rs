//! Evaluates aggregation plans over unique-connection documents.
//!
//! Every backend funnels through here. A backend that can push the leading
//! match stage into its own query language does so, then hands the matched
//! documents and the remaining stages to [`evaluate_stages`].

use std::collections::BTreeMap;

use crate::error::QueryError;
use crate::query::{QueryPlan, Stage};
use crate::store::{SourceIdentity, SourceSummary, UniqueConnection};

/// A per-document view after the daily buckets have been flattened.
#[derive(Debug, Clone)]
pub struct FlatConnection {
    src: SourceIdentity,
    ts: Vec<i64>,
    bytes: Vec<i64>,
    count: i64,
    tbytes: i64,
    icerts: bool,
}

/// An array column that is either still nested per destination or flattened.
#[derive(Debug, Clone)]
enum Column {
    Nested(Vec<Vec<i64>>),
    Flat(Vec<i64>),
}

/// Per-source accumulation after grouping.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    src: SourceIdentity,
    ts: Column,
    bytes: Column,
    count: i64,
    tbytes: i64,
    icerts: Vec<bool>,
}

/// Intermediate result between stages.
pub enum Frame<'a> {
    Documents(Vec<&'a UniqueConnection>),
    Flattened(Vec<FlatConnection>),
    Grouped(Vec<SourceGroup>),
    Summaries(Vec<SourceSummary>),
}

impl Frame<'_> {
    fn shape(&self) -> &'static str {
        match self {
            Self::Documents(_) => "documents",
            Self::Flattened(_) => "flattened connections",
            Self::Grouped(_) => "source groups",
            Self::Summaries(_) => "summaries",
        }
    }
}

/// Runs a full plan over the given documents.
pub fn evaluate<'a, I>(plan: &QueryPlan, documents: I) -> Result<Vec<SourceSummary>, QueryError>
where
    I: IntoIterator<Item = &'a UniqueConnection>,
{
    let frame = Frame::Documents(documents.into_iter().collect());
    evaluate_stages(plan.stages(), frame)
}

/// Runs `stages` starting from `frame`, which must end as summaries.
pub fn evaluate_stages(stages: &[Stage], mut frame: Frame<'_>) -> Result<Vec<SourceSummary>, QueryError> {
    for stage in stages {
        frame = apply(stage, frame)?;
    }

    match frame {
        Frame::Summaries(rows) => Ok(rows),
        other => Err(QueryError::MalformedPlan(format!(
            "plan ends with {} instead of summaries",
            other.shape()
        ))),
    }
}

fn apply<'a>(stage: &Stage, frame: Frame<'a>) -> Result<Frame<'a>, QueryError> {
    match (stage, frame) {
        (Stage::MatchDestinations(filters), Frame::Documents(docs)) => Ok(Frame::Documents(
            docs.into_iter()
                .filter(|doc| filters.iter().any(|f| f.matches(doc.dst, doc.dst_network_uuid)))
                .collect(),
        )),

        (Stage::FlattenDays, Frame::Documents(docs)) => {
            Ok(Frame::Flattened(docs.into_iter().map(flatten_days).collect()))
        }

        (Stage::GroupBySource, Frame::Flattened(flat)) => Ok(Frame::Grouped(group_by_source(flat))),

        (Stage::MinConnections(threshold), Frame::Grouped(mut groups)) => {
            groups.retain(|g| g.count > *threshold);
            Ok(Frame::Grouped(groups))
        }

        (Stage::UniqueTimestamps, Frame::Grouped(mut groups)) => {
            for group in &mut groups {
                group.ts = match std::mem::replace(&mut group.ts, Column::Flat(Vec::new())) {
                    Column::Nested(nested) => {
                        let mut ts: Vec<i64> = nested.into_iter().flatten().collect();
                        ts.sort_unstable();
                        ts.dedup();
                        Column::Flat(ts)
                    }
                    Column::Flat(_) => return Err(already_flat(stage)),
                };
            }
            Ok(Frame::Grouped(groups))
        }

        (Stage::FlattenBytes, Frame::Grouped(mut groups)) => {
            for group in &mut groups {
                group.bytes = match std::mem::replace(&mut group.bytes, Column::Flat(Vec::new())) {
                    Column::Nested(nested) => Column::Flat(nested.into_iter().flatten().collect()),
                    Column::Flat(_) => return Err(already_flat(stage)),
                };
            }
            Ok(Frame::Grouped(groups))
        }

        (Stage::Project, Frame::Grouped(groups)) => groups
            .into_iter()
            .map(project)
            .collect::<Result<Vec<_>, _>>()
            .map(Frame::Summaries),

        (stage, frame) => Err(QueryError::MalformedPlan(format!(
            "stage '{}' cannot run on {}",
            stage.name(),
            frame.shape()
        ))),
    }
}

fn already_flat(stage: &Stage) -> QueryError {
    QueryError::MalformedPlan(format!("stage '{}' applied to an already flat column", stage.name()))
}

fn flatten_days(doc: &UniqueConnection) -> FlatConnection {
    let mut flat = FlatConnection {
        src: doc.src.clone(),
        ts: Vec::new(),
        bytes: Vec::new(),
        count: 0,
        tbytes: 0,
        icerts: false,
    };

    for day in &doc.dat {
        flat.ts.extend_from_slice(&day.ts);
        flat.bytes.extend_from_slice(&day.bytes);
        flat.count = flat.count.saturating_add(day.count);
        flat.tbytes = flat.tbytes.saturating_add(day.tbytes);
        flat.icerts |= day.icerts;
    }

    flat
}

fn group_by_source(flat: Vec<FlatConnection>) -> Vec<SourceGroup> {
    let mut groups: BTreeMap<SourceIdentity, SourceGroup> = BTreeMap::new();

    for conn in flat {
        let group = groups.entry(conn.src.clone()).or_insert_with(|| SourceGroup {
            src: conn.src,
            ts: Column::Nested(Vec::new()),
            bytes: Column::Nested(Vec::new()),
            count: 0,
            tbytes: 0,
            icerts: Vec::new(),
        });

        if let Column::Nested(ts) = &mut group.ts {
            ts.push(conn.ts);
        }
        if let Column::Nested(bytes) = &mut group.bytes {
            bytes.push(conn.bytes);
        }
        group.count = group.count.saturating_add(conn.count);
        group.tbytes = group.tbytes.saturating_add(conn.tbytes);
        group.icerts.push(conn.icerts);
    }

    groups.into_values().collect()
}

fn project(group: SourceGroup) -> Result<SourceSummary, QueryError> {
    let (Column::Flat(timestamps), Column::Flat(orig_bytes)) = (group.ts, group.bytes) else {
        return Err(QueryError::MalformedPlan(
            "projection requires flattened timestamps and bytes".to_string(),
        ));
    };

    Ok(SourceSummary {
        src: group.src,
        connection_count: group.count,
        total_bytes: group.tbytes,
        timestamps,
        orig_bytes,
        invalid_cert: group.icerts.iter().any(|flag| *flag),
    })
}
