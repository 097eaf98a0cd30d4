//! Reminder scheduling and adherence reconciliation engine for the
//! care-reminder app.
//!
//! The [`engine::ReminderEngine`] is the single owner of reminder state
//! for a device session: it loads from the remote service (falling back
//! to the offline cache), applies mutations optimistically with
//! snapshot rollback, sweeps for missed doses, deduplicates taken
//! events, and derives the device's local alerts from confirmed state.
//! [`schedule`] holds the pure timing policy; [`remote`] and [`alerts`]
//! are the seams to the hosted service and the platform notification
//! primitive.

pub mod alerts;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod reminder;
pub mod remote;
pub mod schedule;

pub use alerts::{AlertAction, AlertEvent, AlertHandle, AlertPayload, AlertScheduler, MemoryAlerts};
pub use cache::CacheStore;
pub use config::{AdaptivePolicy, EnginePolicy, Tier};
pub use engine::{
    start_event_loop, start_sweep_scheduler, HistoricalStats, LoadState, ReminderEngine,
    SweepHandle, SweepOutcome,
};
pub use error::{EngineError, EngineResult};
pub use reminder::{
    Cadence, Frequency, Occurrence, OccurrenceStatus, Reminder, ReminderDraft, ReminderKind,
    ReminderPatch,
};
pub use remote::{
    AdherenceStats, HistoryEntryBody, HttpReminderService, ReminderService, ReminderStats,
    ServiceConfig, UpcomingDose,
};
