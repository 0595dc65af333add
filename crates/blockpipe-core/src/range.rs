//! Block ranges and the textual range expressions accepted by builders and the CLI.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// One end of a requested range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeBound {
    /// An absolute block number.
    Block(u64),
    /// The portal head at plan time. Only valid as a range start.
    Latest,
    /// The first block at or after this instant, resolved through the portal.
    Timestamp(DateTime<Utc>),
}

impl std::fmt::Display for RangeBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(n) => write!(f, "{n}"),
            Self::Latest => write!(f, "latest"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// A requested range, possibly open-ended and possibly unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub from: RangeBound,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RangeBound>,
}

impl Range {
    /// `[from, to]`, both inclusive.
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            from: RangeBound::Block(from),
            to: Some(RangeBound::Block(to)),
        }
    }

    /// `[from, ∞)`.
    pub fn from_block(from: u64) -> Self {
        Self {
            from: RangeBound::Block(from),
            to: None,
        }
    }

    /// `[head, ∞)`.
    pub fn latest() -> Self {
        Self {
            from: RangeBound::Latest,
            to: None,
        }
    }

    /// Parse a range from its textual start and optional end.
    ///
    /// A relative end (`+N`) is anchored at a numeric start.
    pub fn parse(from: &str, to: Option<&str>) -> Result<Self, ParseError> {
        let from = parse_bound(from, None)?;
        let anchor = match from {
            RangeBound::Block(n) => Some(n),
            _ => None,
        };
        let to = to
            .map(|t| parse_bound(t, anchor))
            .transpose()?;
        if to == Some(RangeBound::Latest) {
            return Err(ParseError::LatestNotAllowed { field: "to" });
        }
        Ok(Self { from, to })
    }

    /// Returns `true` if either end is a timestamp that still needs resolving.
    pub fn has_timestamp(&self) -> bool {
        matches!(self.from, RangeBound::Timestamp(_))
            || matches!(self.to, Some(RangeBound::Timestamp(_)))
    }
}

/// A resolved, inclusive block range. `to: None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u64>,
}

impl BlockRange {
    pub fn new(from: u64, to: Option<u64>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.from && self.to.map_or(true, |to| block <= to)
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_some_and(|to| to < self.from)
    }

    /// Intersection with a caller-supplied bound.
    pub fn clip(&self, bound: &RangeLimit) -> BlockRange {
        let from = bound.from.map_or(self.from, |b| b.max(self.from));
        let to = match (self.to, bound.to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        BlockRange { from, to }
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to {
            Some(to) => write!(f, "[{}, {}]", self.from, to),
            None => write!(f, "[{}, ∞)", self.from),
        }
    }
}

/// An external lower/upper bound applied at plan time.
///
/// A resumed stream passes its next unprocessed block as `from`, which always
/// beats `latest`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLimit {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl RangeLimit {
    pub fn from_block(from: u64) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }
}

/// Parse a single range bound.
///
/// Accepts plain integers, `_`/`,`-grouped integers, `+N` relative to
/// `anchor`, `latest`, ISO dates, and RFC 3339 or offset-less (UTC) timestamps.
pub fn parse_bound(text: &str, anchor: Option<u64>) -> Result<RangeBound, ParseError> {
    let value = text.trim();
    let invalid = || ParseError::InvalidBound {
        value: text.to_string(),
    };

    if value.eq_ignore_ascii_case("latest") {
        return Ok(RangeBound::Latest);
    }

    if let Some(offset) = value.strip_prefix('+') {
        let offset = parse_block_number(offset).ok_or_else(invalid)?;
        let anchor = anchor.ok_or_else(|| ParseError::MissingAnchor {
            value: text.to_string(),
        })?;
        let block = anchor.checked_add(offset).ok_or_else(|| ParseError::Overflow {
            value: text.to_string(),
        })?;
        return Ok(RangeBound::Block(block));
    }

    if value.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some(n) = parse_block_number(value) {
            return Ok(RangeBound::Block(n));
        }
        if let Some(ts) = parse_date(value) {
            return Ok(RangeBound::Timestamp(ts));
        }
        if is_digit_run(value) {
            return Err(ParseError::Overflow {
                value: text.to_string(),
            });
        }
    }

    Err(invalid())
}

/// `1000000`, `1_000_000` or `1,000,000`. Separators must group by thousands
/// and may not be mixed.
fn parse_block_number(value: &str) -> Option<u64> {
    if is_digit_run(value) {
        return value.parse().ok();
    }
    let sep = if value.contains('_') { '_' } else { ',' };
    let mut groups = value.split(sep);
    let head = groups.next()?;
    if head.is_empty() || head.len() > 3 || !is_digit_run(head) {
        return None;
    }
    let mut digits = head.to_string();
    let mut grouped = false;
    for group in groups {
        if group.len() != 3 || !is_digit_run(group) {
            return None;
        }
        digits.push_str(group);
        grouped = true;
    }
    if !grouped {
        return None;
    }
    digits.parse().ok()
}

fn is_digit_run(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    // Datetimes without an offset are UTC.
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(ts.and_utc());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}
