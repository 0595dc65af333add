//! Query accumulation and plan resolution.
//!
//! A [`QueryBuilder`] collects a field selection plus range-scoped requests
//! from every stage of a pipeline. [`QueryBuilder::calculate_ranges`] turns
//! them into an ordered, non-overlapping plan bounded by the portal head and
//! the stream's committed progress.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cursor::BlockCursor;
use crate::error::{PlanError, PortalError};
use crate::portal::Portal;
use crate::range::{BlockRange, Range, RangeBound, RangeLimit};
use crate::schema::FieldSelection;

// ─── DataRequest ─────────────────────────────────────────────────────────────

/// Domain filters grouped by kind (`"logs"`, `"instructions"`, …).
///
/// Filters are opaque JSON values; the core only merges them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRequest(BTreeMap<String, Vec<Value>>);

impl DataRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request holding one filter of one kind.
    pub fn single(kind: impl Into<String>, filter: Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert(kind.into(), vec![filter]);
        Self(map)
    }

    pub fn filters(&self, kind: &str) -> &[Value] {
        self.0.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

/// Concatenate filters of the same kind.
///
/// Each list is sorted by canonical JSON and deduplicated, which makes the
/// merge associative, commutative and idempotent.
pub fn merge_data_requests(a: &DataRequest, b: &DataRequest) -> DataRequest {
    let mut merged = a.0.clone();
    for (kind, filters) in &b.0 {
        merged.entry(kind.clone()).or_default().extend(filters.iter().cloned());
    }
    for filters in merged.values_mut() {
        filters.sort_by_cached_key(Value::to_string);
        filters.dedup();
    }
    DataRequest(merged)
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// A requested range and the filters scoped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub range: Range,
    pub request: DataRequest,
}

/// One executable step of a query plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub range: BlockRange,
    pub request: DataRequest,
}

impl PlanEntry {
    /// Cache key of this entry under `fields`.
    pub fn query_hash(&self, fields: &FieldSelection) -> String {
        query_hash(fields, &self.request)
    }
}

/// Hex SHA-256 of the resolved request.
///
/// Equivalent queries hash identically no matter how they were built: the
/// selection is canonicalised and the filters are already normalised.
pub fn query_hash(fields: &FieldSelection, request: &DataRequest) -> String {
    let canonical = serde_json::json!({
        "fields": fields.canonical(),
        "request": request,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

// ─── QueryBuilder ────────────────────────────────────────────────────────────

/// Accumulates fields and range-scoped requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBuilder {
    fields: FieldSelection,
    requests: Vec<RequestEntry>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-merge a partial field selection; later calls win per leaf.
    pub fn add_fields(&mut self, selection: &FieldSelection) -> &mut Self {
        self.fields.merge(selection);
        self
    }

    /// Append a request of `kind` over `range`. Ranges may overlap and arrive in any order.
    pub fn add_request(&mut self, kind: impl Into<String>, range: Range, filter: Value) -> &mut Self {
        self.requests.push(RequestEntry {
            range,
            request: DataRequest::single(kind, filter),
        });
        self
    }

    pub fn add_entry(&mut self, entry: RequestEntry) -> &mut Self {
        self.requests.push(entry);
        self
    }

    /// Absorb another builder's fields and requests.
    pub fn merge(&mut self, other: QueryBuilder) -> &mut Self {
        self.fields.merge(&other.fields);
        self.requests.extend(other.requests);
        self
    }

    pub fn fields(&self) -> &FieldSelection {
        &self.fields
    }

    pub fn requests(&self) -> &[RequestEntry] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Returns `true` if any request starts at `latest`.
    pub fn has_latest(&self) -> bool {
        self.requests.iter().any(|e| e.range.from == RangeBound::Latest)
    }

    /// Replace every `latest` start with `block`, so later plans keep the
    /// head observed when the stream started.
    pub fn pin_latest(&mut self, block: u64) {
        for entry in &mut self.requests {
            if entry.range.from == RangeBound::Latest {
                entry.range.from = RangeBound::Block(block);
            }
        }
    }

    pub fn has_timestamps(&self) -> bool {
        self.requests.iter().any(|e| e.range.has_timestamp())
    }

    /// Replace timestamp bounds with block numbers looked up on the portal.
    pub async fn resolve_timestamps<P>(&mut self, portal: &P) -> Result<(), PortalError>
    where
        P: Portal + ?Sized,
    {
        for entry in &mut self.requests {
            if let RangeBound::Timestamp(ts) = entry.range.from {
                entry.range.from = RangeBound::Block(portal.block_at_timestamp(ts).await?);
            }
            if let Some(RangeBound::Timestamp(ts)) = entry.range.to {
                entry.range.to = Some(RangeBound::Block(portal.block_at_timestamp(ts).await?));
            }
        }
        Ok(())
    }

    /// Resolve every request into an ordered, non-overlapping plan.
    ///
    /// `latest` resolves to `bound.from` when present, otherwise to the head.
    /// Ranges are clipped to `bound`, split at every boundary, and each segment
    /// carries the merged filters of all requests covering it. Adjacent
    /// segments with identical filters are coalesced; uncovered gaps are skipped.
    pub fn calculate_ranges(
        &self,
        portal_head: Option<&BlockCursor>,
        bound: &RangeLimit,
    ) -> Result<Vec<PlanEntry>, PlanError> {
        let mut resolved = Vec::with_capacity(self.requests.len());
        for entry in &self.requests {
            let from = match &entry.range.from {
                RangeBound::Block(n) => *n,
                RangeBound::Latest => match bound.from {
                    Some(from) => from,
                    None => portal_head.ok_or(PlanError::MissingHead)?.number,
                },
                RangeBound::Timestamp(_) => {
                    return Err(PlanError::UnresolvedTimestamp {
                        bound: entry.range.from.to_string(),
                    })
                }
            };
            let to = match &entry.range.to {
                None => None,
                Some(RangeBound::Block(n)) => Some(*n),
                Some(RangeBound::Latest) => Some(portal_head.ok_or(PlanError::MissingHead)?.number),
                Some(ts @ RangeBound::Timestamp(_)) => {
                    return Err(PlanError::UnresolvedTimestamp {
                        bound: ts.to_string(),
                    })
                }
            };
            let range = BlockRange::new(from, to).clip(bound);
            if !range.is_empty() {
                resolved.push((range, &entry.request));
            }
        }

        let mut points = BTreeSet::new();
        for (range, _) in &resolved {
            points.insert(range.from);
            if let Some(end) = range.to.and_then(|to| to.checked_add(1)) {
                points.insert(end);
            }
        }
        let points: Vec<u64> = points.into_iter().collect();

        let mut plan: Vec<PlanEntry> = Vec::new();
        for (i, &start) in points.iter().enumerate() {
            let end = points.get(i + 1).map(|next| next - 1);
            let request = resolved
                .iter()
                .filter(|(range, _)| range.contains(start))
                .fold(None, |acc: Option<DataRequest>, (_, request)| {
                    Some(match acc {
                        Some(acc) => merge_data_requests(&acc, request),
                        None => merge_data_requests(&DataRequest::new(), request),
                    })
                });
            let Some(request) = request else {
                continue;
            };

            if let Some(prev) = plan.last_mut() {
                let adjacent = prev.range.to.and_then(|t| t.checked_add(1)) == Some(start);
                if adjacent && prev.request == request {
                    prev.range.to = end;
                    continue;
                }
            }
            plan.push(PlanEntry {
                range: BlockRange::new(start, end),
                request,
            });
        }

        Ok(plan)
    }
}
