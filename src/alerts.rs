use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::error::{EngineError, EngineResult};

/// What the device shows when the alert fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub title: String,
    pub body: String,
}

/// Opaque handle to a scheduled device alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertHandle(pub u64);

/// The action a user took on a fired alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Complete,
    Snooze { minutes: i64 },
    Missed,
}

/// Delivered over the event channel when a device alert fires. Events
/// for one reminder arrive in firing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub reminder_id: i64,
    pub action: AlertAction,
}

/// Device-local alert primitive. Exactly two operations; scheduling is
/// idempotent per reminder — a second schedule call replaces, never
/// duplicates, that reminder's outstanding alert.
pub trait AlertScheduler: Send + Sync {
    fn schedule(
        &self,
        reminder_id: i64,
        when_utc: DateTime<Utc>,
        payload: AlertPayload,
    ) -> EngineResult<AlertHandle>;

    fn cancel_all(&self, reminder_id: i64);
}

struct ScheduledAlert {
    handle: AlertHandle,
    when_utc: DateTime<Utc>,
    payload: AlertPayload,
}

/// In-process alert scheduler backing tests and headless hosts. Firing
/// is driven manually through [`MemoryAlerts::fire`], which forwards the
/// user's action over the event channel.
pub struct MemoryAlerts {
    alerts: Mutex<HashMap<i64, ScheduledAlert>>,
    next_handle: Mutex<u64>,
    events: Sender<AlertEvent>,
}

impl MemoryAlerts {
    pub fn new() -> (Self, Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                alerts: Mutex::new(HashMap::new()),
                next_handle: Mutex::new(1),
                events: tx,
            },
            rx,
        )
    }

    fn lock_alerts(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ScheduledAlert>> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outstanding alert count for one reminder (0 or 1 by idempotence).
    pub fn outstanding(&self, reminder_id: i64) -> usize {
        usize::from(self.lock_alerts().contains_key(&reminder_id))
    }

    /// The instant the reminder's alert is set for, if one is scheduled.
    pub fn scheduled_for(&self, reminder_id: i64) -> Option<DateTime<Utc>> {
        self.lock_alerts().get(&reminder_id).map(|a| a.when_utc)
    }

    pub fn handle_for(&self, reminder_id: i64) -> Option<AlertHandle> {
        self.lock_alerts().get(&reminder_id).map(|a| a.handle)
    }

    pub fn payload_for(&self, reminder_id: i64) -> Option<AlertPayload> {
        self.lock_alerts().get(&reminder_id).map(|a| a.payload.clone())
    }

    /// Simulate the device firing the reminder's alert with the user's
    /// chosen action. The alert is consumed; the event lands on the
    /// channel even when nothing was scheduled, mirroring an OS-level
    /// alert that lost the cancellation race.
    pub fn fire(&self, reminder_id: i64, action: AlertAction) {
        self.lock_alerts().remove(&reminder_id);
        let _ = self.events.send(AlertEvent { reminder_id, action });
    }
}

impl AlertScheduler for MemoryAlerts {
    fn schedule(
        &self,
        reminder_id: i64,
        when_utc: DateTime<Utc>,
        payload: AlertPayload,
    ) -> EngineResult<AlertHandle> {
        let mut next = self
            .next_handle
            .lock()
            .map_err(|_| EngineError::storage("alert handle counter poisoned"))?;
        let handle = AlertHandle(*next);
        *next += 1;

        self.lock_alerts().insert(
            reminder_id,
            ScheduledAlert {
                handle,
                when_utc,
                payload,
            },
        );
        Ok(handle)
    }

    fn cancel_all(&self, reminder_id: i64) {
        self.lock_alerts().remove(&reminder_id);
    }
}
