//! Field selection and batch normalization.
//!
//! The portal payload is shaped by the requested fields: anything that was not
//! selected is absent. A [`FieldSelection`] is a small declarative tree of
//! `group → field → bool`, and [`normalize_batch`] validates raw JSON-lines
//! batches against it at runtime.
//!
//! ```text
//! {"header": {"number": 1, "hash": "0x…", "timestamp": 1700000000},
//!  "logs": [{"address": "0x…", "topics": ["0x…"]}]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cursor::BlockCursor;
use crate::error::NormalizeError;

/// Group holding the block header.
pub const HEADER: &str = "header";

/// Header fields present in every block regardless of the selection.
const REQUIRED_HEADER_FIELDS: [&str; 2] = ["number", "hash"];

// ─── FieldSelection ──────────────────────────────────────────────────────────

/// Which optional fields of each block group to request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSelection(BTreeMap<String, BTreeMap<String, bool>>);

impl FieldSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select `fields` in `group`.
    pub fn select<I, S>(mut self, group: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let leaves = self.0.entry(group.into()).or_default();
        for field in fields {
            leaves.insert(field.into(), true);
        }
        self
    }

    /// Explicitly deselect a field.
    pub fn deselect(mut self, group: impl Into<String>, field: impl Into<String>) -> Self {
        self.0.entry(group.into()).or_default().insert(field.into(), false);
        self
    }

    /// Deep-merge `other` into `self`; on conflicting leaves `other` wins.
    pub fn merge(&mut self, other: &FieldSelection) {
        for (group, leaves) in &other.0 {
            let target = self.0.entry(group.clone()).or_default();
            for (field, selected) in leaves {
                target.insert(field.clone(), *selected);
            }
        }
    }

    pub fn is_selected(&self, group: &str, field: &str) -> bool {
        self.0
            .get(group)
            .and_then(|leaves| leaves.get(field))
            .copied()
            .unwrap_or(false)
    }

    /// Returns `true` if at least one field of `group` is selected.
    pub fn has_group(&self, group: &str) -> bool {
        self.0
            .get(group)
            .is_some_and(|leaves| leaves.values().any(|selected| *selected))
    }

    /// Selected fields of `group`, in name order.
    pub fn selected<'a>(&'a self, group: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .get(group)
            .into_iter()
            .flat_map(|leaves| leaves.iter())
            .filter(|(_, selected)| **selected)
            .map(|(field, _)| field.as_str())
    }

    /// Selected groups other than the header.
    pub fn item_groups(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .map(String::as_str)
            .filter(move |g| *g != HEADER && self.has_group(g))
    }

    /// The selection with deselected leaves and empty groups removed.
    pub fn canonical(&self) -> FieldSelection {
        let groups = self
            .0
            .iter()
            .filter_map(|(group, leaves)| {
                let leaves: BTreeMap<_, _> = leaves
                    .iter()
                    .filter(|(_, selected)| **selected)
                    .map(|(f, s)| (f.clone(), *s))
                    .collect();
                (!leaves.is_empty()).then(|| (group.clone(), leaves))
            })
            .collect();
        FieldSelection(groups)
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// Header of a normalized block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: Option<String>,
    pub timestamp: Option<i64>,
    /// Every selected header field, including the ones above.
    pub fields: Map<String, Value>,
}

/// A block whose shape has been checked against the field selection.
///
/// Every selected leaf is present on every row; leaves the portal omitted are
/// `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Selected item groups (`logs`, `transactions`, …) → rows.
    pub items: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl Block {
    pub fn cursor(&self) -> BlockCursor {
        BlockCursor {
            number: self.header.number,
            hash: self.header.hash.clone(),
            timestamp: self.header.timestamp,
        }
    }

    /// Rows of an item group; empty if the group was not selected.
    pub fn rows(&self, group: &str) -> &[Map<String, Value>] {
        self.items.get(group).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ─── Normalization ───────────────────────────────────────────────────────────

/// Parse and validate a JSON-lines batch against `fields`.
pub fn normalize_batch(data: &[u8], fields: &FieldSelection) -> Result<Vec<Block>, NormalizeError> {
    let mut blocks = Vec::new();
    for (idx, line) in data.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let line_no = idx + 1;
        let value: Value = serde_json::from_slice(line).map_err(|source| {
            NormalizeError::InvalidJson {
                line: line_no,
                source,
            }
        })?;
        blocks.push(normalize_block(value, line_no, fields)?);
    }
    Ok(blocks)
}

fn normalize_block(value: Value, line: usize, fields: &FieldSelection) -> Result<Block, NormalizeError> {
    let Value::Object(mut obj) = value else {
        return Err(NormalizeError::MissingHeader { line });
    };
    let Some(Value::Object(raw_header)) = obj.remove(HEADER) else {
        return Err(NormalizeError::MissingHeader { line });
    };

    let header = normalize_header(raw_header, line, fields)?;
    let label = header.number.to_string();

    let mut items = BTreeMap::new();
    for (group, value) in obj {
        if !fields.has_group(&group) {
            return Err(NormalizeError::UnexpectedGroup { block: label, group });
        }
        let Value::Array(raw_rows) = value else {
            return Err(NormalizeError::InvalidType {
                block: label,
                group,
                field: "*".into(),
                expected: "an array of objects",
            });
        };
        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let Value::Object(row) = raw else {
                return Err(NormalizeError::InvalidType {
                    block: label,
                    group,
                    field: "*".into(),
                    expected: "an object",
                });
            };
            rows.push(cast_row(row, &group, &label, fields)?);
        }
        items.insert(group, rows);
    }
    for group in fields.item_groups() {
        items.entry(group.to_string()).or_default();
    }

    Ok(Block { header, items })
}

fn normalize_header(
    raw: Map<String, Value>,
    line: usize,
    fields: &FieldSelection,
) -> Result<BlockHeader, NormalizeError> {
    let line_label = format!("at line {line}");
    let missing = |field: &str| NormalizeError::MissingField {
        block: line_label.clone(),
        group: HEADER.into(),
        field: field.into(),
    };

    let number = raw
        .get("number")
        .ok_or_else(|| missing("number"))?
        .as_u64()
        .ok_or_else(|| invalid(&line_label, HEADER, "number", "an unsigned integer"))?;
    let label = number.to_string();
    let hash = raw
        .get("hash")
        .ok_or_else(|| missing("hash"))?
        .as_str()
        .ok_or_else(|| invalid(&label, HEADER, "hash", "a string"))?
        .to_string();

    let fields_map = cast_row_with(raw, HEADER, &label, fields, &REQUIRED_HEADER_FIELDS)?;

    let parent_hash = match fields_map.get("parentHash") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(invalid(&label, HEADER, "parentHash", "a string")),
    };
    let timestamp = match fields_map.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .ok_or_else(|| invalid(&label, HEADER, "timestamp", "a number"))?,
        ),
    };

    Ok(BlockHeader {
        number,
        hash,
        parent_hash,
        timestamp,
        fields: fields_map,
    })
}

fn cast_row(
    row: Map<String, Value>,
    group: &str,
    block: &str,
    fields: &FieldSelection,
) -> Result<Map<String, Value>, NormalizeError> {
    cast_row_with(row, group, block, fields, &[])
}

/// Reject unselected leaves and fill selected-but-absent leaves with `null`.
fn cast_row_with(
    mut row: Map<String, Value>,
    group: &str,
    block: &str,
    fields: &FieldSelection,
    always: &[&str],
) -> Result<Map<String, Value>, NormalizeError> {
    if let Some(field) = row
        .keys()
        .find(|k| !always.contains(&k.as_str()) && !fields.is_selected(group, k))
    {
        return Err(NormalizeError::UnexpectedField {
            block: block.to_string(),
            group: group.to_string(),
            field: field.clone(),
        });
    }
    for field in fields.selected(group) {
        row.entry(field.to_string()).or_insert(Value::Null);
    }
    Ok(row)
}

fn invalid(block: &str, group: &str, field: &str, expected: &'static str) -> NormalizeError {
    NormalizeError::InvalidType {
        block: block.to_string(),
        group: group.to_string(),
        field: field.to_string(),
        expected,
    }
}
