//! BlockPipe CLI — inspect ranges, query plans and cache keys offline.
//!
//! # Commands
//! ```text
//! blockpipe info
//! blockpipe range      <from> [to]
//! blockpipe plan       <query.json> [--head N] [--from N] [--json]
//! blockpipe query-hash <query.json>
//! ```
//!
//! A query file looks like:
//! ```json
//! {
//!   "fields": { "block": { "timestamp": true }, "log": { "topics": true } },
//!   "requests": [
//!     { "kind": "logs", "from": "19000000", "to": "+10000", "filter": { "address": ["0xa0b8…"] } },
//!     { "kind": "transactions", "from": "latest", "filter": { "to": ["0xa0b8…"] } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use blockpipe_core::{
    init_tracing, merge_data_requests, query_hash, BlockCursor, DataRequest, FieldSelection,
    LogConfig, QueryBuilder, Range, RangeLimit, RetryConfig, StreamConfig,
};

#[derive(Parser)]
#[command(
    name = "blockpipe",
    about = "BlockPipe CLI — inspect ranges, query plans and cache keys",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show defaults and capabilities
    Info,

    /// Parse a block range, e.g. `1_000_000 +500` or `2024-01-01 2024-02-01`
    Range {
        from: String,
        to: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the execution plan of a query file
    Plan {
        /// Path to the query JSON file
        file: PathBuf,
        /// Portal head used to resolve `latest`
        #[arg(long)]
        head: Option<u64>,
        /// Resume point: plan from this block on
        #[arg(long)]
        from: Option<u64>,
        /// Stop planning at this block
        #[arg(long)]
        to: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the cache key of every request of a query file, merged
    #[command(name = "query-hash")]
    QueryHash {
        /// Path to the query JSON file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        init_tracing(&LogConfig {
            level: "debug".into(),
            ..LogConfig::default()
        });
    }

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Range { from, to, json } => cmd_range(&from, to.as_deref(), json),
        Commands::Plan {
            file,
            head,
            from,
            to,
            json,
        } => cmd_plan(&file, head, RangeLimit { from, to }, json),
        Commands::QueryHash { file } => cmd_query_hash(&file),
    }
}

// ─── Query files ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QueryFile {
    #[serde(default)]
    fields: FieldSelection,
    requests: Vec<RequestSpec>,
}

#[derive(Debug, Deserialize)]
struct RequestSpec {
    kind: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default = "empty_filter")]
    filter: Value,
}

fn empty_filter() -> Value {
    Value::Object(Default::default())
}

fn parse_query(text: &str) -> Result<QueryBuilder> {
    let file: QueryFile = serde_json::from_str(text).context("invalid query file")?;
    if file.requests.is_empty() {
        bail!("query file has no requests");
    }

    let mut query = QueryBuilder::new();
    query.add_fields(&file.fields);
    for (i, spec) in file.requests.into_iter().enumerate() {
        let range = Range::parse(&spec.from, spec.to.as_deref())
            .with_context(|| format!("request #{i} ({})", spec.kind))?;
        query.add_request(spec.kind, range, spec.filter);
    }
    Ok(query)
}

fn load_query(path: &Path) -> Result<QueryBuilder> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    parse_query(&text).with_context(|| path.display().to_string())
}

// ─── Command implementations ─────────────────────────────────────────────────

fn cmd_info() -> Result<()> {
    let config = StreamConfig::default();
    let retry = RetryConfig::default();

    println!("BlockPipe v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Stream defaults:");
    println!("  Rollback depth:       {} blocks", config.rollback_depth);
    println!("  Poll interval:        {} ms", config.poll_interval_ms);
    println!("  Progress interval:    {} ms", config.progress_interval_ms);
    println!(
        "  Retries:              {} (backoff {}–{} ms, x{})",
        retry.max_retries, retry.initial_backoff_ms, retry.max_backoff_ms, retry.multiplier
    );
    println!();
    println!("Range bounds:           block numbers (1_000_000, 1,000,000), +N, latest,");
    println!("                        ISO dates and RFC 3339 timestamps");
    println!("Cache / state backends: memory, SQLite (blockpipe-storage, feature: sqlite)");
    Ok(())
}

fn cmd_range(from: &str, to: Option<&str>, as_json: bool) -> Result<()> {
    let range = Range::parse(from, to)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&range)?);
        return Ok(());
    }
    match &range.to {
        Some(to) => println!("from {} to {}", range.from, to),
        None => println!("from {} (open-ended)", range.from),
    }
    if range.has_timestamp() {
        println!("note: timestamp bounds are resolved through the portal at run time");
    }
    Ok(())
}

fn cmd_plan(path: &Path, head: Option<u64>, bound: RangeLimit, as_json: bool) -> Result<()> {
    let query = load_query(path)?;
    let head = head.map(|n| BlockCursor::new(n, String::new()));
    let plan = query.calculate_ranges(head.as_ref(), &bound)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    if plan.is_empty() {
        println!("nothing to fetch");
        return Ok(());
    }

    println!("{} plan entries", plan.len());
    for entry in &plan {
        let kinds: Vec<String> = entry
            .request
            .kinds()
            .map(|kind| format!("{kind}×{}", entry.request.filters(kind).len()))
            .collect();
        println!(
            "  {:<24} {:<32} {}",
            entry.range.to_string(),
            kinds.join(", "),
            &entry.query_hash(query.fields())[..16]
        );
    }
    Ok(())
}

fn cmd_query_hash(path: &Path) -> Result<()> {
    let query = load_query(path)?;
    let merged = query
        .requests()
        .iter()
        .fold(DataRequest::new(), |acc, entry| merge_data_requests(&acc, &entry.request));
    println!("{}", query_hash(query.fields(), &merged));
    Ok(())
}
