use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::alerts::{AlertAction, AlertEvent, AlertPayload, AlertScheduler};
use crate::cache::CacheStore;
use crate::config::{EnginePolicy, OCCURRENCE_MATCH_TOLERANCE_SECS};
use crate::error::{EngineError, EngineResult};
use crate::reminder::{
    Occurrence, OccurrenceStatus, Reminder, ReminderDraft, ReminderKind, ReminderPatch,
};
use crate::remote::{AdherenceStats, HistoryEntryBody, ReminderService, UpcomingDose};
use crate::schedule;

/// Load/sync state of the reminder list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Loading,
    Ready,
    /// Remote unreachable; the offline cache is the data source until the
    /// next refresh or sweep tick succeeds.
    Degraded,
}

/// Outcome of one missed-detection sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another pass was already in flight; this request was absorbed.
    Coalesced,
    Completed {
        flagged: usize,
        failures: usize,
        adjusted: usize,
    },
}

/// Adherence series computed from local history for the reporting panel.
#[derive(Debug, Clone, Serialize)]
pub struct HistoricalStats {
    /// Completions per day, oldest first, for the trailing two weeks
    pub daily_completions: Vec<(String, usize)>,
    /// Completions per hour of day
    pub hourly: Vec<usize>,
    /// Completions per weekday (0 = Monday)
    pub weekday: Vec<usize>,
    pub missed_total: usize,
}

/// Optimistic local change awaiting server confirmation; carries the
/// pre-mutation snapshot needed for rollback. Destroyed on confirmation
/// or after the rollback has been applied and persisted.
enum PendingMutation {
    Creating { temp_id: i64 },
    Updating { snapshot: Reminder },
    Deleting { snapshot: Reminder, history: Vec<Occurrence> },
    Snoozing { snapshot: Reminder },
}

impl PendingMutation {
    fn reminder_id(&self) -> i64 {
        match self {
            PendingMutation::Creating { temp_id } => *temp_id,
            PendingMutation::Updating { snapshot }
            | PendingMutation::Deleting { snapshot, .. }
            | PendingMutation::Snoozing { snapshot } => snapshot.id,
        }
    }
}

struct EngineState {
    load_state: LoadState,
    reminders: Vec<Reminder>,
    history: Vec<Occurrence>,
    pending: Vec<PendingMutation>,
    /// missed_count last seen when an adaptive adjustment was applied
    adjustment_marks: HashMap<i64, u32>,
    next_temp_id: i64,
    next_local_occurrence_id: i64,
    resync_requested: bool,
}

impl EngineState {
    fn alloc_temp_id(&mut self) -> i64 {
        self.next_temp_id -= 1;
        self.next_temp_id
    }

    fn alloc_occurrence_id(&mut self) -> i64 {
        self.next_local_occurrence_id -= 1;
        self.next_local_occurrence_id
    }

    fn drop_pending(&mut self, reminder_id: i64) {
        self.pending.retain(|p| p.reminder_id() != reminder_id);
    }
}

/// The reconciliation controller: single owner of reminder state for the
/// device session. All mutation flows through here; local alerts are
/// only ever derived from confirmed (or, in degraded state, cached)
/// data, never from a rolled-back optimistic change.
pub struct ReminderEngine {
    state: Mutex<EngineState>,
    service: Arc<dyn ReminderService>,
    alerts: Arc<dyn AlertScheduler>,
    cache: CacheStore,
    policy: EnginePolicy,
    sweep_active: AtomicBool,
}

impl ReminderEngine {
    pub fn new(
        service: Arc<dyn ReminderService>,
        alerts: Arc<dyn AlertScheduler>,
        cache: CacheStore,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                load_state: LoadState::Idle,
                reminders: Vec::new(),
                history: Vec::new(),
                pending: Vec::new(),
                adjustment_marks: HashMap::new(),
                next_temp_id: 0,
                next_local_occurrence_id: 0,
                resync_requested: false,
            }),
            service,
            alerts,
            cache,
            policy,
            sweep_active: AtomicBool::new(false),
        }
    }

    /// Lock engine state, recovering from poison if needed
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============ Load / sync ============

    /// Fetch the reminder list and per-reminder history, falling back to
    /// the offline cache slice-by-slice, then sweep and derive alerts.
    pub fn load_all(&self) -> EngineResult<Vec<Reminder>> {
        self.load_all_at(Utc::now())
    }

    /// Re-enter the load path; in degraded state this is how the engine
    /// gets back to `Ready`.
    pub fn refresh(&self) -> EngineResult<Vec<Reminder>> {
        self.load_all()
    }

    fn load_all_at(&self, now: DateTime<Utc>) -> EngineResult<Vec<Reminder>> {
        self.lock_state().load_state = LoadState::Loading;

        let (reminders, degraded) = match self.service.list_reminders() {
            Ok(list) => {
                if let Err(e) = self.cache.save_reminders(&list) {
                    warn!("failed to cache reminder list: {}", e);
                }
                (list, false)
            }
            Err(e) => {
                warn!("reminder list fetch failed, serving cache: {}", e);
                (self.cache.load_reminders(), true)
            }
        };

        let history = self.fetch_history_settled(&reminders, now);
        if let Err(e) = self.cache.save_history(&history) {
            warn!("failed to cache history: {}", e);
        }

        {
            let mut guard = self.lock_state();
            let st = &mut *guard;
            st.reminders = reminders;
            st.history = history;
            st.resync_requested = false;
            for r in &st.reminders {
                st.adjustment_marks.entry(r.id).or_insert(r.missed_count);
            }
            st.load_state = if degraded {
                LoadState::Degraded
            } else {
                LoadState::Ready
            };
        }

        self.run_sweep_inner(now, false);
        self.reschedule_all_alerts(now);
        Ok(self.reminders())
    }

    /// Issue one history fetch per synced reminder on its own thread and
    /// settle them independently: a failed or timed-out member falls back
    /// to the cached slice for that reminder only and never blocks the
    /// rest.
    fn fetch_history_settled(&self, reminders: &[Reminder], now: DateTime<Utc>) -> Vec<Occurrence> {
        let cached = self.cache.load_history();

        let mut handles: Vec<(i64, JoinHandle<EngineResult<Vec<Occurrence>>>)> = Vec::new();
        for r in reminders.iter().filter(|r| r.is_synced()) {
            let service = Arc::clone(&self.service);
            let id = r.id;
            handles.push((id, thread::spawn(move || service.fetch_history(id))));
        }

        let mut history: Vec<Occurrence> = Vec::new();
        for (id, handle) in handles {
            match handle.join() {
                Ok(Ok(entries)) => history.extend(entries),
                Ok(Err(e)) => {
                    warn!("history fetch for reminder {} failed ({}); using cached slice", id, e);
                    history.extend(cached.iter().filter(|o| o.reminder_id == id).cloned());
                }
                Err(_) => {
                    warn!("history fetch for reminder {} panicked; using cached slice", id);
                    history.extend(cached.iter().filter(|o| o.reminder_id == id).cloned());
                }
            }
        }
        history.sort_by_key(|o| (o.reminder_id, o.scheduled_time));
        self.trim_history(history, now)
    }

    fn trim_history(&self, mut history: Vec<Occurrence>, now: DateTime<Utc>) -> Vec<Occurrence> {
        if let Some(days) = self.policy.tier.history_days() {
            let cutoff = now - Duration::days(days);
            history.retain(|o| o.recorded_time >= cutoff);
        }
        history
    }

    // ============ Accessors ============

    pub fn reminders(&self) -> Vec<Reminder> {
        self.lock_state().reminders.clone()
    }

    pub fn history(&self) -> Vec<Occurrence> {
        self.lock_state().history.clone()
    }

    pub fn load_state(&self) -> LoadState {
        self.lock_state().load_state
    }

    // ============ Mutations ============

    /// Create a reminder: applied locally under a temporary id, replaced
    /// by the server's record on confirmation, withdrawn on failure.
    pub fn create(&self, draft: ReminderDraft) -> EngineResult<Reminder> {
        self.create_at(draft, Utc::now())
    }

    fn create_at(&self, draft: ReminderDraft, now: DateTime<Utc>) -> EngineResult<Reminder> {
        draft.validate()?;

        let temp_id = {
            let mut st = self.lock_state();
            let temp_id = st.alloc_temp_id();
            st.reminders.push(draft.clone().into_local(temp_id, now));
            st.pending.push(PendingMutation::Creating { temp_id });
            temp_id
        };

        match self.service.create_reminder(&draft) {
            Ok(created) => {
                {
                    let mut st = self.lock_state();
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == temp_id) {
                        *slot = created.clone();
                    }
                    let mark = created.missed_count;
                    st.adjustment_marks.insert(created.id, mark);
                    st.drop_pending(temp_id);
                }
                self.persist_reminders_best_effort();
                self.sync_alert(&created, now);
                Ok(created)
            }
            Err(e) => {
                let mut st = self.lock_state();
                st.reminders.retain(|r| r.id != temp_id);
                st.drop_pending(temp_id);
                drop(st);
                Err(e)
            }
        }
    }

    /// Update a reminder. A `NotFound` answer means the entity is already
    /// gone server-side: the local copy is dropped, a background resync
    /// is requested, and the (non-alarming) error is returned for
    /// information only.
    pub fn update(&self, id: i64, patch: ReminderPatch) -> EngineResult<Reminder> {
        self.update_at(id, patch, Utc::now())
    }

    fn update_at(
        &self,
        id: i64,
        patch: ReminderPatch,
        now: DateTime<Utc>,
    ) -> EngineResult<Reminder> {
        patch.validate()?;

        let snapshot = {
            let mut st = self.lock_state();
            let slot = st
                .reminders
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::not_found(format!("reminder {} not loaded", id)))?;
            let snapshot = slot.clone();
            patch.apply_to(slot);
            st.pending.push(PendingMutation::Updating { snapshot: snapshot.clone() });
            snapshot
        };

        // Disabling must cancel alerts synchronously, ahead of the remote
        // confirmation; the rollback path re-derives them.
        if patch.enabled == Some(false) {
            self.alerts.cancel_all(id);
        }

        match self.service.update_reminder(id, &patch) {
            Ok(updated) => {
                {
                    let mut st = self.lock_state();
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                        *slot = updated.clone();
                    }
                    st.drop_pending(id);
                }
                self.persist_reminders_best_effort();
                self.sync_alert(&updated, now);
                Ok(updated)
            }
            Err(e) if e.is_recoverable() => {
                {
                    let mut st = self.lock_state();
                    st.reminders.retain(|r| r.id != id);
                    st.history.retain(|o| o.reminder_id != id);
                    st.drop_pending(id);
                    st.resync_requested = true;
                }
                self.persist_all()?;
                self.alerts.cancel_all(id);
                info!("reminder {} was already removed server-side", id);
                Err(e)
            }
            Err(e) => {
                {
                    let mut st = self.lock_state();
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                        *slot = snapshot.clone();
                    }
                    st.drop_pending(id);
                }
                self.persist_all()?;
                self.sync_alert(&snapshot, now);
                Err(e)
            }
        }
    }

    /// Delete a reminder. The optimistic removal is persisted before the
    /// remote call so a crash mid-flight cannot resurrect stale data; a
    /// non-recoverable failure rolls the reminder and its history back
    /// exactly and persists the rollback before surfacing.
    pub fn remove(&self, id: i64) -> EngineResult<()> {
        self.remove_at(id, Utc::now())
    }

    fn remove_at(&self, id: i64, now: DateTime<Utc>) -> EngineResult<()> {
        let snapshot = {
            let mut st = self.lock_state();
            let pos = st
                .reminders
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| EngineError::not_found(format!("reminder {} not loaded", id)))?;
            let snapshot = st.reminders.remove(pos);
            let (slice, rest): (Vec<Occurrence>, Vec<Occurrence>) =
                st.history.drain(..).partition(|o| o.reminder_id == id);
            st.history = rest;
            st.pending.push(PendingMutation::Deleting {
                snapshot: snapshot.clone(),
                history: slice,
            });
            snapshot
        };

        self.persist_all()?;
        self.alerts.cancel_all(id);

        let unsynced = !snapshot.is_synced();
        let result = if unsynced {
            // Never reached the server; nothing to delete remotely
            Ok(())
        } else {
            self.service.delete_reminder(id)
        };

        match result {
            Ok(()) => {
                self.lock_state().drop_pending(id);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                let mut st = self.lock_state();
                st.drop_pending(id);
                st.resync_requested = true;
                drop(st);
                info!("reminder {} was already deleted server-side", id);
                Ok(())
            }
            Err(e) => {
                {
                    let mut st = self.lock_state();
                    let restored_history = match st
                        .pending
                        .iter()
                        .position(|p| matches!(p, PendingMutation::Deleting { snapshot, .. } if snapshot.id == id))
                    {
                        Some(pos) => match st.pending.remove(pos) {
                            PendingMutation::Deleting { history, .. } => history,
                            _ => Vec::new(),
                        },
                        None => Vec::new(),
                    };
                    st.reminders.push(snapshot.clone());
                    st.reminders.sort_by_key(|r| r.id);
                    st.history.extend(restored_history);
                    st.history.sort_by_key(|o| (o.reminder_id, o.scheduled_time));
                }
                self.persist_all()?;
                self.sync_alert(&snapshot, now);
                Err(e)
            }
        }
    }

    /// Snooze a reminder. Only the server's confirmed snooze target is
    /// kept; a resolved snooze occurrence shields the due instant from
    /// the missed sweep.
    pub fn snooze(&self, id: i64, minutes: i64) -> EngineResult<Reminder> {
        self.snooze_at(id, minutes, Utc::now())
    }

    fn snooze_at(&self, id: i64, minutes: i64, now: DateTime<Utc>) -> EngineResult<Reminder> {
        if minutes <= 0 {
            return Err(EngineError::validation("snooze must be a positive number of minutes"));
        }

        let snapshot = {
            let mut st = self.lock_state();
            let slot = st
                .reminders
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::not_found(format!("reminder {} not loaded", id)))?;
            let snapshot = slot.clone();
            slot.snoozed_until = Some(now + Duration::minutes(minutes));
            st.pending.push(PendingMutation::Snoozing { snapshot: snapshot.clone() });
            snapshot
        };

        match self.service.snooze_reminder(id, minutes) {
            Ok(updated) => {
                let snoozed_instant =
                    schedule::last_due_at_or_before(&updated.cadence, updated.created_at, now);
                {
                    let mut st = self.lock_state();
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                        *slot = updated.clone();
                    }
                    if let Some(instant) = snoozed_instant {
                        let occ_id = st.alloc_occurrence_id();
                        st.history.push(Occurrence {
                            id: occ_id,
                            reminder_id: id,
                            scheduled_time: instant,
                            status: OccurrenceStatus::Snoozed,
                            recorded_time: now,
                        });
                    }
                    st.drop_pending(id);
                }
                self.persist_all()?;
                self.sync_alert(&updated, now);
                Ok(updated)
            }
            Err(e) if e.is_recoverable() => {
                {
                    let mut st = self.lock_state();
                    st.reminders.retain(|r| r.id != id);
                    st.history.retain(|o| o.reminder_id != id);
                    st.drop_pending(id);
                    st.resync_requested = true;
                }
                self.persist_all()?;
                self.alerts.cancel_all(id);
                Err(e)
            }
            Err(e) => {
                {
                    let mut st = self.lock_state();
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                        *slot = snapshot.clone();
                    }
                    st.drop_pending(id);
                }
                self.persist_reminders_best_effort();
                self.sync_alert(&snapshot, now);
                Err(e)
            }
        }
    }

    /// Record a taken dose. Without an explicit time the dose is resolved
    /// to the most recent due instant; a completed occurrence inside the
    /// dedup window — found locally or reported by the server as a 409 —
    /// rejects the action with `Conflict` and appends nothing.
    pub fn mark_taken(&self, id: i64, time: Option<DateTime<Utc>>) -> EngineResult<Occurrence> {
        self.mark_taken_at(id, time, Utc::now())
    }

    fn mark_taken_at(
        &self,
        id: i64,
        time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<Occurrence> {
        let candidate = {
            let st = self.lock_state();
            let reminder = st
                .reminders
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::not_found(format!("reminder {} not loaded", id)))?;
            let candidate = match time {
                Some(t) => t,
                None => schedule::last_due_at_or_before(&reminder.cadence, reminder.created_at, now)
                    .ok_or_else(|| {
                        EngineError::validation("reminder has no due instant to mark taken")
                    })?,
            };
            let window = Duration::minutes(self.policy.dedup_window_minutes);
            if schedule::duplicate_completed(&st.history, id, candidate, window).is_some() {
                return Err(EngineError::conflict("this dose is already recorded as taken"));
            }
            candidate
        };

        let entry = HistoryEntryBody {
            status: OccurrenceStatus::Completed,
            time: candidate,
        };
        match self.service.record_history(id, &entry) {
            Ok(occurrence) => {
                {
                    let mut st = self.lock_state();
                    st.history.retain(|o| {
                        !(o.reminder_id == id
                            && o.status == OccurrenceStatus::Completed
                            && o.matches_instant(candidate, OCCURRENCE_MATCH_TOLERANCE_SECS))
                    });
                    st.history.push(occurrence.clone());
                    st.history.sort_by_key(|o| (o.reminder_id, o.scheduled_time));
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                        slot.snoozed_until = None;
                    }
                }
                self.persist_history_best_effort();
                if let Some(reminder) = self.reminders().into_iter().find(|r| r.id == id) {
                    self.sync_alert(&reminder, now);
                }
                Ok(occurrence)
            }
            Err(e) => Err(e),
        }
    }

    /// Explicitly mark the most recent due instant missed. The server is
    /// the authority: the local occurrence and missed_count are only
    /// updated from its successful answer.
    pub fn mark_missed(&self, id: i64) -> EngineResult<Reminder> {
        self.mark_missed_at(id, Utc::now())
    }

    fn mark_missed_at(&self, id: i64, now: DateTime<Utc>) -> EngineResult<Reminder> {
        let candidate = {
            let st = self.lock_state();
            let reminder = st
                .reminders
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::not_found(format!("reminder {} not loaded", id)))?;
            let candidate =
                schedule::last_due_at_or_before(&reminder.cadence, reminder.created_at, now)
                    .ok_or_else(|| {
                        EngineError::validation("reminder has no due instant to mark missed")
                    })?;
            let already = st.history.iter().any(|o| {
                o.reminder_id == id && o.matches_instant(candidate, OCCURRENCE_MATCH_TOLERANCE_SECS)
            });
            if already {
                return Err(EngineError::conflict("this instant is already resolved"));
            }
            candidate
        };

        let updated = self.service.mark_missed(id)?;
        {
            let mut st = self.lock_state();
            if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == id) {
                *slot = updated.clone();
            }
            let occ_id = st.alloc_occurrence_id();
            st.history.push(Occurrence {
                id: occ_id,
                reminder_id: id,
                scheduled_time: candidate,
                status: OccurrenceStatus::Missed,
                recorded_time: now,
            });
            st.history.sort_by_key(|o| (o.reminder_id, o.scheduled_time));
        }
        self.persist_all_best_effort();
        Ok(updated)
    }

    // ============ Missed sweep & adaptive cadence ============

    /// Run one missed-detection pass. Requests arriving while a pass is
    /// in flight are coalesced, never run concurrently, so the same
    /// instant cannot be proposed missed twice.
    pub fn run_missed_sweep(&self) -> SweepOutcome {
        self.run_sweep_inner(Utc::now(), true)
    }

    fn run_sweep_inner(&self, now: DateTime<Utc>, allow_refresh: bool) -> SweepOutcome {
        if self
            .sweep_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sweep already in flight, coalescing request");
            return SweepOutcome::Coalesced;
        }

        // Ensure we reset the flag when done (success or failure)
        struct ResetGuard<'a>(&'a AtomicBool);
        impl Drop for ResetGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _reset_guard = ResetGuard(&self.sweep_active);

        if allow_refresh {
            let stale = {
                let st = self.lock_state();
                st.resync_requested || st.load_state == LoadState::Degraded
            };
            if stale {
                debug!("sweep tick found stale state, refreshing first");
                if let Err(e) = self.load_all_at(now) {
                    warn!("background refresh failed: {}", e);
                }
            }
        }

        let (reminders, history) = {
            let st = self.lock_state();
            (st.reminders.clone(), st.history.clone())
        };
        let grace = Duration::minutes(self.policy.grace_minutes);
        let lookback = Duration::hours(self.policy.missed_lookback_hours);

        let mut flagged = 0;
        let mut failures = 0;
        for reminder in reminders.iter().filter(|r| r.enabled && r.is_synced()) {
            let missed = schedule::missed_instants(
                reminder,
                &history,
                now,
                grace,
                lookback,
                OCCURRENCE_MATCH_TOLERANCE_SECS,
            );
            for instant in missed {
                match self.service.mark_missed(reminder.id) {
                    Ok(updated) => {
                        let mut st = self.lock_state();
                        if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == reminder.id) {
                            *slot = updated;
                        }
                        let occ_id = st.alloc_occurrence_id();
                        st.history.push(Occurrence {
                            id: occ_id,
                            reminder_id: reminder.id,
                            scheduled_time: instant,
                            status: OccurrenceStatus::Missed,
                            recorded_time: now,
                        });
                        flagged += 1;
                    }
                    Err(e) => {
                        // Server keeps the authority; untouched state makes
                        // the retry on the next sweep idempotent.
                        debug!(
                            "mark-missed for reminder {} at {} failed: {} (will retry)",
                            reminder.id, instant, e
                        );
                        failures += 1;
                    }
                }
            }
        }

        let adjusted = self.run_adaptive_pass();

        if flagged > 0 || adjusted > 0 {
            self.persist_all_best_effort();
            self.reschedule_all_alerts(now);
        }
        if flagged > 0 {
            info!("missed sweep flagged {} instant(s)", flagged);
        }

        SweepOutcome::Completed {
            flagged,
            failures,
            adjusted,
        }
    }

    /// Propose cadence adjustments for chronically missed reminders. The
    /// proposal is advisory: only the server's accepted version is
    /// applied locally.
    fn run_adaptive_pass(&self) -> usize {
        let (reminders, history, marks) = {
            let st = self.lock_state();
            (
                st.reminders.clone(),
                st.history.clone(),
                st.adjustment_marks.clone(),
            )
        };

        let mut adjusted = 0;
        for reminder in reminders.iter().filter(|r| r.enabled && r.is_synced()) {
            let mark = marks.get(&reminder.id).copied().unwrap_or(0);
            let Some(proposed) = schedule::propose_cadence_adjustment(
                reminder,
                &history,
                mark,
                &self.policy.adaptive,
            ) else {
                continue;
            };

            let patch = ReminderPatch {
                cadence: Some(proposed),
                ..Default::default()
            };
            match self.service.update_reminder(reminder.id, &patch) {
                Ok(updated) => {
                    info!(
                        "adaptive cadence applied for reminder {} after {} missed",
                        reminder.id, updated.missed_count
                    );
                    let mut st = self.lock_state();
                    let mark = updated.missed_count;
                    st.adjustment_marks.insert(updated.id, mark);
                    if let Some(slot) = st.reminders.iter_mut().find(|r| r.id == reminder.id) {
                        *slot = updated;
                    }
                    adjusted += 1;
                }
                Err(e) => {
                    debug!(
                        "cadence proposal for reminder {} not accepted: {} (trend reevaluated next sweep)",
                        reminder.id, e
                    );
                }
            }
        }
        adjusted
    }

    // ============ Alerts ============

    /// Handle a fired device alert. Enabled state is re-checked here:
    /// an alert that lost the cancellation race at the OS level must not
    /// act on a disabled or removed reminder.
    pub fn handle_alert(&self, event: AlertEvent) {
        self.handle_alert_at(event, Utc::now())
    }

    fn handle_alert_at(&self, event: AlertEvent, now: DateTime<Utc>) {
        let enabled = {
            let st = self.lock_state();
            st.reminders
                .iter()
                .find(|r| r.id == event.reminder_id)
                .map(|r| r.enabled)
        };
        if enabled != Some(true) {
            debug!(
                "dropping fired alert for disabled or unknown reminder {}",
                event.reminder_id
            );
            self.alerts.cancel_all(event.reminder_id);
            return;
        }

        let result = match event.action {
            AlertAction::Complete => self
                .mark_taken_at(event.reminder_id, None, now)
                .map(|_| ()),
            AlertAction::Snooze { minutes } => {
                self.snooze_at(event.reminder_id, minutes, now).map(|_| ())
            }
            AlertAction::Missed => self.mark_missed_at(event.reminder_id, now).map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(EngineError::Conflict(msg)) => {
                info!("alert action for {} was a duplicate: {}", event.reminder_id, msg)
            }
            Err(e) if e.is_transient() => {
                debug!("alert action for {} deferred: {}", event.reminder_id, e)
            }
            Err(e) => warn!("alert action for {} failed: {}", event.reminder_id, e),
        }
    }

    fn reschedule_all_alerts(&self, now: DateTime<Utc>) {
        for reminder in self.reminders() {
            self.sync_alert(&reminder, now);
        }
    }

    /// Derive the reminder's single outstanding alert from its confirmed
    /// state: schedule (replacing) when one is due, cancel otherwise.
    fn sync_alert(&self, reminder: &Reminder, now: DateTime<Utc>) {
        match schedule::next_alert_instant(reminder, now) {
            Some(when) => {
                if let Err(e) =
                    self.alerts
                        .schedule(reminder.id, when, alert_payload(reminder))
                {
                    warn!("failed to schedule alert for reminder {}: {}", reminder.id, e);
                }
            }
            None => self.alerts.cancel_all(reminder.id),
        }
    }

    // ============ Reporting ============

    /// Doses completed today and this week (week starts Monday).
    pub fn completion_stats(&self) -> (usize, usize) {
        self.completion_stats_at(Utc::now())
    }

    fn completion_stats_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let today_start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let week_start =
            today_start - Duration::days(now.weekday().num_days_from_monday() as i64);

        let st = self.lock_state();
        let completed = st
            .history
            .iter()
            .filter(|o| o.status == OccurrenceStatus::Completed);

        let mut today_count = 0;
        let mut week_count = 0;
        for o in completed {
            if o.recorded_time >= week_start {
                week_count += 1;
                if o.recorded_time >= today_start {
                    today_count += 1;
                }
            }
        }
        (today_count, week_count)
    }

    /// Adherence series for the reporting panel, computed from local
    /// history.
    pub fn historical_stats(&self) -> HistoricalStats {
        self.historical_stats_at(Utc::now())
    }

    fn historical_stats_at(&self, now: DateTime<Utc>) -> HistoricalStats {
        let st = self.lock_state();

        let mut daily_completions: Vec<(String, usize)> = Vec::new();
        for days_ago in (0..14).rev() {
            let date = now.date_naive() - Duration::days(days_ago);
            let count = st
                .history
                .iter()
                .filter(|o| {
                    o.status == OccurrenceStatus::Completed
                        && o.recorded_time.date_naive() == date
                })
                .count();
            daily_completions.push((date.format("%Y-%m-%d").to_string(), count));
        }

        let mut hourly: Vec<usize> = vec![0; 24];
        let mut weekday: Vec<usize> = vec![0; 7];
        let mut missed_total = 0;
        for o in &st.history {
            match o.status {
                OccurrenceStatus::Completed => {
                    hourly[o.recorded_time.hour() as usize] += 1;
                    weekday[o.recorded_time.weekday().num_days_from_monday() as usize] += 1;
                }
                OccurrenceStatus::Missed => missed_total += 1,
                _ => {}
            }
        }

        HistoricalStats {
            daily_completions,
            hourly,
            weekday,
            missed_total,
        }
    }

    /// Server-side aggregate stats for the admin panel.
    pub fn fetch_remote_stats(&self) -> EngineResult<AdherenceStats> {
        self.service.fetch_stats()
    }

    /// Upcoming doses within the window, computed from local state.
    pub fn upcoming(&self, within: Duration) -> Vec<UpcomingDose> {
        self.upcoming_at(within, Utc::now())
    }

    fn upcoming_at(&self, within: Duration, now: DateTime<Utc>) -> Vec<UpcomingDose> {
        let st = self.lock_state();
        let mut doses: Vec<UpcomingDose> = st
            .reminders
            .iter()
            .filter_map(|r| {
                let when = schedule::next_alert_instant(r, now)?;
                (when <= now + within).then(|| UpcomingDose {
                    reminder_id: r.id,
                    label: r.label.clone(),
                    scheduled_time: when,
                })
            })
            .collect();
        doses.sort_by_key(|d| d.scheduled_time);
        doses
    }

    /// Export the occurrence log as a JSON document. Premium-tier only.
    pub fn export_history(&self) -> EngineResult<String> {
        if !self.policy.tier.can_export() {
            return Err(EngineError::validation(
                "history export is available on the premium tier",
            ));
        }
        let st = self.lock_state();
        serde_json::to_string_pretty(&st.history).map_err(|e| EngineError::storage(e.to_string()))
    }

    // ============ Persistence helpers ============

    fn persist_all(&self) -> EngineResult<()> {
        let (reminders, history) = {
            let st = self.lock_state();
            (st.reminders.clone(), st.history.clone())
        };
        self.cache.save_reminders(&reminders)?;
        self.cache.save_history(&history)
    }

    fn persist_all_best_effort(&self) {
        if let Err(e) = self.persist_all() {
            warn!("failed to persist state: {}", e);
        }
    }

    fn persist_reminders_best_effort(&self) {
        let reminders = self.lock_state().reminders.clone();
        if let Err(e) = self.cache.save_reminders(&reminders) {
            warn!("failed to persist reminders: {}", e);
        }
    }

    fn persist_history_best_effort(&self) {
        let history = self.lock_state().history.clone();
        if let Err(e) = self.cache.save_history(&history) {
            warn!("failed to persist history: {}", e);
        }
    }
}

fn alert_payload(reminder: &Reminder) -> AlertPayload {
    let title = match reminder.kind {
        ReminderKind::Medication => "Medication due",
        ReminderKind::Hydration => "Time to hydrate",
        ReminderKind::General => "Reminder",
    };
    AlertPayload {
        title: title.to_string(),
        body: reminder.label.clone(),
    }
}

/// Owned handle to the recurring sweep timer. Dropping it stops the
/// timer; `stop` additionally joins the thread.
pub struct SweepHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Start the recurring missed-detection sweep for this engine session.
pub fn start_sweep_scheduler(engine: Arc<ReminderEngine>) -> SweepHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = thread::spawn(move || loop {
        let interval = engine.policy.sweep_interval_secs;
        let mut slept = 0;
        while slept < interval {
            if stop_flag.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(std::time::Duration::from_secs(1));
            slept += 1;
        }
        engine.run_missed_sweep();
    });

    SweepHandle {
        stop,
        handle: Some(handle),
    }
}

/// Consume fired-alert events on a dedicated thread until the sending
/// side hangs up. Events per reminder are processed in firing order.
pub fn start_event_loop(engine: Arc<ReminderEngine>, events: Receiver<AlertEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            engine.handle_alert(event);
        }
        debug!("alert event channel closed, stopping event loop");
    })
}
