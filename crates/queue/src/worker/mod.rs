//! Background machinery of a running queue service
//!
//! ```text
//!   Poller ──claim──▶ EntryBuffer ──take──▶ DispatcherPool ──outcome──▶ EntryStore
//!     ▲                                         (N workers)
//!     │ wake (STICKY_EVENTS)
//!   CommitNotifier                 Reaper ──reclaim stale──▶ EntryStore
//! ```
//!
//! - [`Poller`] claims entries within the [`InFlightTracker`] bounds
//! - [`EntryBuffer`] is the bounded hand-off to the dispatchers
//! - [`DispatcherPool`] runs handlers and records outcomes
//! - [`Reaper`] returns stale claims to `AVAILABLE` and archives stranded terminal rows

mod buffer;
mod dispatcher;
mod in_flight;
mod notifier;
mod poller;
mod reaper;

pub use buffer::EntryBuffer;
pub use dispatcher::{
    DispatchOutcome, DispatchStats, DispatchStatsSnapshot, Dispatcher, DispatcherPool,
};
pub use in_flight::InFlightTracker;
pub use notifier::CommitNotifier;
pub use poller::Poller;
pub use reaper::{ReapReport, Reaper};
