//! Persistence layer for queue entries
//!
//! This module provides:
//! - [`EntryStore`] trait: claim, outcome, archival and reaping operations
//! - [`InMemoryEntryStore`] for `in_memory` mode and testing
//! - [`PostgresEntryStore`] for production

mod entry;
mod memory;
mod postgres;
mod schema;
mod store;

pub use entry::{EntryId, EntryState, HistoryEntry, NewEntry, QueueEntry};
pub use memory::InMemoryEntryStore;
pub use postgres::PostgresEntryStore;
pub use schema::schema_statements;
pub use store::{ClaimScope, EntryStore, StoreError};
