//! blockpipe-storage — persistent backends for BlockPipe streams.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx`: batch cache ([`CacheAdapter`]) and
//!   pipeline state log ([`StateStore`]) in a single file
//!
//! In-memory equivalents live in `blockpipe-core` (`MemoryCache`,
//! `MemoryStateStore`).
//!
//! [`CacheAdapter`]: blockpipe_core::CacheAdapter
//! [`StateStore`]: blockpipe_core::StateStore

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
