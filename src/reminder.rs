use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Medication,
    Hydration,
    General,
}

/// Date-based repetition rule for calendar cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// The rule generating due instants for a reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cadence {
    /// Fixed times-of-day, every day. Times are "HH:MM" strings.
    Times { times: Vec<String> },
    /// Repeating interval anchored at the reminder's creation instant.
    Interval { every_minutes: u32 },
    /// Date-ranged rule. `days_of_week` uses ISO indices (1 = Monday ..
    /// 7 = Sunday) and only applies to weekly frequency; `every_days` is
    /// the step for custom frequency. An absent end date means unbounded.
    Calendar {
        start_date: NaiveDate,
        #[serde(default)]
        end_date: Option<NaiveDate>,
        frequency: Frequency,
        #[serde(default)]
        days_of_week: Vec<u8>,
        #[serde(default)]
        every_days: Option<u32>,
        times: Vec<String>,
    },
}

impl Cadence {
    /// Parse a "HH:MM" time-of-day as carried on the wire.
    pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M").ok()
    }

    /// The time-of-day list, if this cadence has one.
    pub fn times(&self) -> Option<&[String]> {
        match self {
            Cadence::Times { times } => Some(times),
            Cadence::Calendar { times, .. } => Some(times),
            Cadence::Interval { .. } => None,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Cadence::Times { times } => validate_times(times),
            Cadence::Interval { every_minutes } => {
                if *every_minutes == 0 {
                    return Err(EngineError::validation("interval must be at least one minute"));
                }
                Ok(())
            }
            Cadence::Calendar {
                start_date,
                end_date,
                frequency,
                days_of_week,
                every_days,
                times,
            } => {
                validate_times(times)?;
                if let Some(end) = end_date {
                    if end < start_date {
                        return Err(EngineError::validation("end date precedes start date"));
                    }
                }
                match frequency {
                    Frequency::Weekly => {
                        if days_of_week.is_empty() {
                            return Err(EngineError::validation(
                                "weekly cadence needs at least one weekday",
                            ));
                        }
                        if days_of_week.iter().any(|d| *d < 1 || *d > 7) {
                            return Err(EngineError::validation(
                                "weekday indices must be 1 (Monday) through 7 (Sunday)",
                            ));
                        }
                    }
                    Frequency::Custom => {
                        if !matches!(every_days, Some(n) if *n > 0) {
                            return Err(EngineError::validation(
                                "custom cadence needs a day step of at least one",
                            ));
                        }
                    }
                    Frequency::Daily | Frequency::Monthly => {}
                }
                Ok(())
            }
        }
    }
}

fn validate_times(times: &[String]) -> EngineResult<()> {
    if times.is_empty() {
        return Err(EngineError::validation("no reminder times configured"));
    }
    for t in times {
        if Cadence::parse_time_of_day(t).is_none() {
            return Err(EngineError::validation(format!("invalid time of day: {}", t)));
        }
    }
    Ok(())
}

/// A user-configured recurring prompt. Ids are server-assigned once
/// synced; an unsynced reminder carries a negative temporary id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub kind: ReminderKind,
    pub label: String,
    #[serde(default)]
    pub note: Option<String>,
    pub cadence: Cadence,
    pub enabled: bool,
    #[serde(default)]
    pub missed_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl Reminder {
    pub fn is_synced(&self) -> bool {
        self.id > 0
    }
}

/// Body of a create call; the server assigns the id and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderDraft {
    pub kind: ReminderKind,
    pub label: String,
    #[serde(default)]
    pub note: Option<String>,
    pub cadence: Cadence,
    pub enabled: bool,
}

impl ReminderDraft {
    pub fn validate(&self) -> EngineResult<()> {
        if self.label.trim().is_empty() {
            return Err(EngineError::validation("label must not be empty"));
        }
        self.cadence.validate()
    }

    /// Materialize the draft locally under a temporary id, pending sync.
    pub fn into_local(self, temp_id: i64, now: DateTime<Utc>) -> Reminder {
        Reminder {
            id: temp_id,
            kind: self.kind,
            label: self.label,
            note: self.note,
            cadence: self.cadence,
            enabled: self.enabled,
            missed_count: 0,
            created_at: now,
            snoozed_until: None,
        }
    }
}

/// Body of an update call; absent fields are left untouched server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Cadence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ReminderPatch {
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(label) = &self.label {
            if label.trim().is_empty() {
                return Err(EngineError::validation("label must not be empty"));
            }
        }
        if let Some(cadence) = &self.cadence {
            cadence.validate()?;
        }
        Ok(())
    }

    /// Apply the patch to a local copy, mirroring what the server will do.
    pub fn apply_to(&self, reminder: &mut Reminder) {
        if let Some(label) = &self.label {
            reminder.label = label.clone();
        }
        if let Some(note) = &self.note {
            reminder.note = Some(note.clone());
        }
        if let Some(cadence) = &self.cadence {
            reminder.cadence = cadence.clone();
        }
        if let Some(enabled) = self.enabled {
            reminder.enabled = enabled;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Completed,
    Skipped,
    Missed,
    Snoozed,
}

/// One concrete due instant of a reminder. History entries are
/// append-only: never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: i64,
    pub reminder_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub status: OccurrenceStatus,
    pub recorded_time: DateTime<Utc>,
}

impl Occurrence {
    /// Whether this entry resolves the given due instant, within the
    /// clock-skew tolerance.
    pub fn matches_instant(&self, instant: DateTime<Utc>, tolerance_secs: i64) -> bool {
        (self.scheduled_time - instant).num_seconds().abs() <= tolerance_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_with_times(times: &[&str]) -> ReminderDraft {
        ReminderDraft {
            kind: ReminderKind::Medication,
            label: "Blood pressure pill".to_string(),
            note: None,
            cadence: Cadence::Times {
                times: times.iter().map(|s| s.to_string()).collect(),
            },
            enabled: true,
        }
    }

    #[test]
    fn test_draft_rejects_empty_label() {
        let mut draft = draft_with_times(&["08:00"]);
        draft.label = "   ".to_string();
        assert!(matches!(draft.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_draft_rejects_empty_times() {
        let draft = draft_with_times(&[]);
        assert!(matches!(draft.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_draft_rejects_bad_time_string() {
        let draft = draft_with_times(&["25:99"]);
        assert!(matches!(draft.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_weekly_cadence_needs_weekdays() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
            frequency: Frequency::Weekly,
            days_of_week: vec![],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        assert!(cadence.validate().is_err());

        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
            frequency: Frequency::Weekly,
            days_of_week: vec![1, 8],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        assert!(cadence.validate().is_err());
    }

    #[test]
    fn test_custom_cadence_needs_day_step() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
            frequency: Frequency::Custom,
            days_of_week: vec![],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        assert!(cadence.validate().is_err());
    }

    #[test]
    fn test_end_date_before_start_rejected() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            end_date: Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            frequency: Frequency::Daily,
            days_of_week: vec![],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        assert!(cadence.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cadence = Cadence::Interval { every_minutes: 0 };
        assert!(cadence.validate().is_err());
    }

    #[test]
    fn test_draft_into_local_uses_temp_id() {
        let draft = draft_with_times(&["08:00"]);
        let now = Utc::now();
        let reminder = draft.into_local(-3, now);
        assert_eq!(reminder.id, -3);
        assert!(!reminder.is_synced());
        assert_eq!(reminder.missed_count, 0);
        assert_eq!(reminder.created_at, now);
    }

    #[test]
    fn test_patch_apply_is_partial() {
        let draft = draft_with_times(&["08:00"]);
        let mut reminder = draft.into_local(1, Utc::now());
        let patch = ReminderPatch {
            enabled: Some(false),
            ..Default::default()
        };
        patch.apply_to(&mut reminder);
        assert!(!reminder.enabled);
        assert_eq!(reminder.label, "Blood pressure pill");
    }

    #[test]
    fn test_cadence_wire_format_round_trip() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: Some(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()),
            frequency: Frequency::Weekly,
            days_of_week: vec![1, 3, 5],
            every_days: None,
            times: vec!["08:30".to_string()],
        };
        let json = serde_json::to_string(&cadence).unwrap();
        assert!(json.contains("\"type\":\"calendar\""));
        assert!(json.contains("\"frequency\":\"weekly\""));
        let back: Cadence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cadence);
    }

    #[test]
    fn test_occurrence_matches_instant_within_tolerance() {
        let instant = Utc::now();
        let occ = Occurrence {
            id: 1,
            reminder_id: 1,
            scheduled_time: instant + chrono::Duration::seconds(45),
            status: OccurrenceStatus::Completed,
            recorded_time: instant,
        };
        assert!(occ.matches_instant(instant, 60));
        assert!(!occ.matches_instant(instant, 30));
    }
}
