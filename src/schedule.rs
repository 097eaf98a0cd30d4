//! Scheduling policy: pure decisions over (cadence, reference instant).
//!
//! Nothing in this module performs I/O or touches shared state; every
//! function is deterministic given its inputs so the timing rules stay
//! unit-testable.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;

use crate::config::{AdaptivePolicy, CALENDAR_SCAN_DAYS};
use crate::reminder::{Cadence, Frequency, Occurrence, OccurrenceStatus, Reminder};

/// Nearest due instant strictly after `now`, or None when the cadence is
/// exhausted. `anchor` is the reminder's creation instant (only interval
/// cadences consume it). Past instants are never re-offered.
pub fn next_due(
    cadence: &Cadence,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match cadence {
        Cadence::Times { times } => {
            let mut best: Option<DateTime<Utc>> = None;
            for tod in parse_times(times) {
                let mut cand = now.date_naive().and_time(tod).and_utc();
                if cand <= now {
                    cand += Duration::days(1);
                }
                best = Some(match best {
                    Some(b) if b <= cand => b,
                    _ => cand,
                });
            }
            best
        }
        Cadence::Interval { every_minutes } => {
            if anchor > now {
                return Some(anchor);
            }
            let every_secs = i64::from(*every_minutes) * 60;
            let k = (now - anchor).num_seconds() / every_secs + 1;
            Some(anchor + Duration::seconds(k * every_secs))
        }
        Cadence::Calendar {
            start_date,
            end_date,
            frequency,
            days_of_week,
            every_days,
            times,
        } => {
            let day_times = parse_times(times);
            let mut date = (*start_date).max(now.date_naive());
            for _ in 0..=CALENDAR_SCAN_DAYS {
                if let Some(end) = end_date {
                    if date > *end {
                        return None;
                    }
                }
                if date_matches(date, *start_date, *frequency, days_of_week, *every_days) {
                    for tod in &day_times {
                        let cand = date.and_time(*tod).and_utc();
                        if cand > now {
                            return Some(cand);
                        }
                    }
                }
                date += Duration::days(1);
            }
            None
        }
    }
}

/// Every due instant in the half-open window (from, to]. Used by the
/// missed sweep, which only ever looks a bounded distance back.
pub fn due_instants_between(
    cadence: &Cadence,
    anchor: DateTime<Utc>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    if to <= from {
        return out;
    }
    match cadence {
        Cadence::Times { times } => {
            let day_times = parse_times(times);
            collect_dated_instants(from.date_naive(), to.date_naive(), &day_times, |_| true, &mut out);
            out.retain(|i| *i > from && *i <= to);
        }
        Cadence::Interval { every_minutes } => {
            let every_secs = i64::from(*every_minutes) * 60;
            let mut k = if anchor > from {
                0
            } else {
                (from - anchor).num_seconds() / every_secs + 1
            };
            loop {
                let cand = anchor + Duration::seconds(k * every_secs);
                if cand > to {
                    break;
                }
                if cand > from {
                    out.push(cand);
                }
                k += 1;
            }
        }
        Cadence::Calendar {
            start_date,
            end_date,
            frequency,
            days_of_week,
            every_days,
            times,
        } => {
            let day_times = parse_times(times);
            let first = (*start_date).max(from.date_naive());
            let mut last = to.date_naive();
            if let Some(end) = end_date {
                last = last.min(*end);
            }
            collect_dated_instants(first, last, &day_times, |date| {
                date_matches(date, *start_date, *frequency, days_of_week, *every_days)
            }, &mut out);
            out.retain(|i| *i > from && *i <= to);
        }
    }
    out.sort();
    out
}

/// The most recent due instant at or before `now`: today's already-passed
/// time-of-day, else the prior day's. Resolves which dose an unqualified
/// "taken" refers to.
pub fn last_due_at_or_before(
    cadence: &Cadence,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match cadence {
        Cadence::Times { times } => {
            let mut best: Option<DateTime<Utc>> = None;
            for tod in parse_times(times) {
                let mut cand = now.date_naive().and_time(tod).and_utc();
                if cand > now {
                    cand -= Duration::days(1);
                }
                best = Some(match best {
                    Some(b) if b >= cand => b,
                    _ => cand,
                });
            }
            best
        }
        Cadence::Interval { every_minutes } => {
            if anchor > now {
                return None;
            }
            let every_secs = i64::from(*every_minutes) * 60;
            let k = (now - anchor).num_seconds() / every_secs;
            Some(anchor + Duration::seconds(k * every_secs))
        }
        Cadence::Calendar {
            start_date,
            end_date,
            frequency,
            days_of_week,
            every_days,
            times,
        } => {
            let day_times = parse_times(times);
            let mut date = now.date_naive();
            if let Some(end) = end_date {
                date = date.min(*end);
            }
            for _ in 0..=CALENDAR_SCAN_DAYS {
                if date < *start_date {
                    return None;
                }
                if date_matches(date, *start_date, *frequency, days_of_week, *every_days) {
                    for tod in day_times.iter().rev() {
                        let cand = date.and_time(*tod).and_utc();
                        if cand <= now {
                            return Some(cand);
                        }
                    }
                }
                date -= Duration::days(1);
            }
            None
        }
    }
}

/// When the next local alert for this reminder should fire. A live
/// snooze takes precedence over the cadence; a disabled reminder never
/// alerts.
pub fn next_alert_instant(reminder: &Reminder, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !reminder.enabled {
        return None;
    }
    if let Some(snoozed_until) = reminder.snoozed_until {
        if snoozed_until > now {
            return Some(snoozed_until);
        }
    }
    next_due(&reminder.cadence, reminder.created_at, now)
}

/// Due instants of `reminder` that are past their grace period and have
/// no occurrence of any status recorded for them. An instant I qualifies
/// iff `I + grace < now`; already-recorded missed entries keep the sweep
/// from double-counting, and instants predating the reminder's creation
/// are never considered.
pub fn missed_instants(
    reminder: &Reminder,
    history: &[Occurrence],
    now: DateTime<Utc>,
    grace: Duration,
    lookback: Duration,
    match_tolerance_secs: i64,
) -> Vec<DateTime<Utc>> {
    let from = (now - lookback).max(reminder.created_at);
    due_instants_between(&reminder.cadence, reminder.created_at, from, now)
        .into_iter()
        .filter(|i| *i + grace < now)
        .filter(|i| {
            !history.iter().any(|o| {
                o.reminder_id == reminder.id && o.matches_instant(*i, match_tolerance_secs)
            })
        })
        .collect()
}

/// An existing completed occurrence inside the dedup window around
/// `candidate`, if any. The window is inclusive on both edges: a delta
/// of exactly the window width still counts as the same dose.
pub fn duplicate_completed<'a>(
    history: &'a [Occurrence],
    reminder_id: i64,
    candidate: DateTime<Utc>,
    window: Duration,
) -> Option<&'a Occurrence> {
    history.iter().find(|o| {
        o.reminder_id == reminder_id
            && o.status == OccurrenceStatus::Completed
            && (o.scheduled_time - candidate).num_seconds().abs() <= window.num_seconds()
    })
}

/// Advisory cadence change once the missed-count trend crosses the
/// policy threshold: shift the most-missed time-of-day later, wrapping
/// within the day. Interval cadences are never adjusted. The caller
/// submits the proposal to the server and applies only its response.
pub fn propose_cadence_adjustment(
    reminder: &Reminder,
    history: &[Occurrence],
    last_adjusted_missed_count: u32,
    policy: &AdaptivePolicy,
) -> Option<Cadence> {
    let growth = reminder.missed_count.saturating_sub(last_adjusted_missed_count);
    if growth < policy.missed_threshold {
        return None;
    }
    let times = reminder.cadence.times()?;
    if times.is_empty() {
        return None;
    }

    let mut missed_per_time: HashMap<&str, u32> = HashMap::new();
    for o in history {
        if o.reminder_id == reminder.id && o.status == OccurrenceStatus::Missed {
            let key = o.scheduled_time.format("%H:%M").to_string();
            if let Some(t) = times.iter().find(|t| **t == key) {
                *missed_per_time.entry(t.as_str()).or_insert(0) += 1;
            }
        }
    }

    // Ties and an empty local history both fall back to the first time slot.
    let target_idx = times
        .iter()
        .enumerate()
        .max_by_key(|(i, t)| (missed_per_time.get(t.as_str()).copied().unwrap_or(0), usize::MAX - i))
        .map(|(i, _)| i)?;

    let tod = Cadence::parse_time_of_day(&times[target_idx])?;
    let shifted = tod + Duration::minutes(policy.shift_minutes);
    let mut new_times = times.to_vec();
    new_times[target_idx] = shifted.format("%H:%M").to_string();

    Some(match &reminder.cadence {
        Cadence::Times { .. } => Cadence::Times { times: new_times },
        Cadence::Calendar {
            start_date,
            end_date,
            frequency,
            days_of_week,
            every_days,
            ..
        } => Cadence::Calendar {
            start_date: *start_date,
            end_date: *end_date,
            frequency: *frequency,
            days_of_week: days_of_week.clone(),
            every_days: *every_days,
            times: new_times,
        },
        Cadence::Interval { .. } => return None,
    })
}

fn parse_times(times: &[String]) -> Vec<NaiveTime> {
    let mut parsed: Vec<NaiveTime> = times
        .iter()
        .filter_map(|t| Cadence::parse_time_of_day(t))
        .collect();
    parsed.sort();
    parsed
}

fn date_matches(
    date: NaiveDate,
    start_date: NaiveDate,
    frequency: Frequency,
    days_of_week: &[u8],
    every_days: Option<u32>,
) -> bool {
    if date < start_date {
        return false;
    }
    match frequency {
        Frequency::Daily => true,
        Frequency::Weekly => days_of_week.contains(&(date.weekday().number_from_monday() as u8)),
        Frequency::Monthly => date.day() == start_date.day(),
        Frequency::Custom => {
            let step = i64::from(every_days.unwrap_or(1).max(1));
            (date - start_date).num_days() % step == 0
        }
    }
}

fn collect_dated_instants(
    first: NaiveDate,
    last: NaiveDate,
    day_times: &[NaiveTime],
    mut include_date: impl FnMut(NaiveDate) -> bool,
    out: &mut Vec<DateTime<Utc>>,
) {
    let mut date = first;
    let mut scanned: i64 = 0;
    while date <= last && scanned <= CALENDAR_SCAN_DAYS {
        if include_date(date) {
            for tod in day_times {
                out.push(date.and_time(*tod).and_utc());
            }
        }
        date += Duration::days(1);
        scanned += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::ReminderKind;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn times_cadence(times: &[&str]) -> Cadence {
        Cadence::Times {
            times: times.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn reminder_with(cadence: Cadence, created_at: DateTime<Utc>) -> Reminder {
        Reminder {
            id: 7,
            kind: ReminderKind::Medication,
            label: "Pill".to_string(),
            note: None,
            cadence,
            enabled: true,
            missed_count: 0,
            created_at,
            snoozed_until: None,
        }
    }

    fn occurrence(
        reminder_id: i64,
        scheduled: DateTime<Utc>,
        status: OccurrenceStatus,
    ) -> Occurrence {
        Occurrence {
            id: 0,
            reminder_id,
            scheduled_time: scheduled,
            status,
            recorded_time: scheduled,
        }
    }

    #[test]
    fn test_next_due_picks_remaining_slot_today() {
        let cadence = times_cadence(&["08:00", "20:00"]);
        let now = utc(2024, 5, 14, 9, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 5, 14, 20, 0)));
    }

    #[test]
    fn test_next_due_rolls_to_tomorrow_after_last_slot() {
        let cadence = times_cadence(&["08:00", "20:00"]);
        let now = utc(2024, 5, 14, 21, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 5, 15, 8, 0)));
    }

    #[test]
    fn test_next_due_exact_slot_is_not_reoffered() {
        let cadence = times_cadence(&["08:00"]);
        let now = utc(2024, 5, 14, 8, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 5, 15, 8, 0)));
    }

    #[test]
    fn test_next_due_is_monotonic() {
        let cadences = [
            times_cadence(&["08:00", "13:30", "20:00"]),
            Cadence::Interval { every_minutes: 90 },
            Cadence::Calendar {
                start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                end_date: None,
                frequency: Frequency::Weekly,
                days_of_week: vec![1, 3, 5],
                every_days: None,
                times: vec!["09:00".to_string()],
            },
        ];
        let anchor = utc(2024, 5, 1, 0, 0);
        for cadence in &cadences {
            let mut prev: Option<DateTime<Utc>> = None;
            for hour in 0..96 {
                let now = anchor + Duration::hours(hour);
                let due = next_due(cadence, anchor, now);
                if let (Some(p), Some(d)) = (prev, due) {
                    assert!(d >= p, "cadence {:?} regressed at hour {}", cadence, hour);
                }
                if due.is_some() {
                    prev = due;
                }
            }
        }
    }

    #[test]
    fn test_interval_next_due_from_anchor() {
        let cadence = Cadence::Interval { every_minutes: 60 };
        let anchor = utc(2024, 5, 14, 8, 0);
        assert_eq!(
            next_due(&cadence, anchor, utc(2024, 5, 14, 9, 30)),
            Some(utc(2024, 5, 14, 10, 0))
        );
        // Anchor still in the future is itself the first due instant
        assert_eq!(
            next_due(&cadence, anchor, utc(2024, 5, 14, 7, 0)),
            Some(anchor)
        );
    }

    #[test]
    fn test_weekly_cadence_lands_on_configured_weekday() {
        // 2024-05-14 is a Tuesday; Mon/Wed/Fri should resolve to Wednesday
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end_date: None,
            frequency: Frequency::Weekly,
            days_of_week: vec![1, 3, 5],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        let now = utc(2024, 5, 14, 12, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 5, 15, 9, 0)));
    }

    #[test]
    fn test_calendar_exhausted_past_end_date() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end_date: Some(NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()),
            frequency: Frequency::Daily,
            days_of_week: vec![],
            every_days: None,
            times: vec!["09:00".to_string()],
        };
        let now = utc(2024, 5, 11, 0, 0);
        assert_eq!(next_due(&cadence, now, now), None);
    }

    #[test]
    fn test_monthly_cadence_uses_start_day_of_month() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            end_date: None,
            frequency: Frequency::Monthly,
            days_of_week: vec![],
            every_days: None,
            times: vec!["10:00".to_string()],
        };
        let now = utc(2024, 5, 16, 0, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 6, 15, 10, 0)));
    }

    #[test]
    fn test_custom_cadence_steps_by_days() {
        let cadence = Cadence::Calendar {
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end_date: None,
            frequency: Frequency::Custom,
            days_of_week: vec![],
            every_days: Some(3),
            times: vec!["09:00".to_string()],
        };
        // Matching dates: May 1, 4, 7, 10, ...
        let now = utc(2024, 5, 5, 0, 0);
        assert_eq!(next_due(&cadence, now, now), Some(utc(2024, 5, 7, 9, 0)));
    }

    #[test]
    fn test_due_instants_between_windows() {
        let cadence = times_cadence(&["08:00", "20:00"]);
        let anchor = utc(2024, 5, 10, 0, 0);
        let instants = due_instants_between(
            &cadence,
            anchor,
            utc(2024, 5, 13, 20, 0),
            utc(2024, 5, 14, 20, 0),
        );
        // Half-open: the 13th 20:00 edge is excluded, the 14th 20:00 included
        assert_eq!(
            instants,
            vec![utc(2024, 5, 14, 8, 0), utc(2024, 5, 14, 20, 0)]
        );
    }

    #[test]
    fn test_last_due_at_or_before_prefers_today() {
        let cadence = times_cadence(&["08:00", "20:00"]);
        let now = utc(2024, 5, 14, 9, 0);
        assert_eq!(
            last_due_at_or_before(&cadence, now, now),
            Some(utc(2024, 5, 14, 8, 0))
        );
    }

    #[test]
    fn test_last_due_at_or_before_falls_back_to_prior_day() {
        let cadence = times_cadence(&["08:00", "20:00"]);
        let now = utc(2024, 5, 14, 7, 0);
        assert_eq!(
            last_due_at_or_before(&cadence, now, now),
            Some(utc(2024, 5, 13, 20, 0))
        );
    }

    #[test]
    fn test_missed_respects_grace_boundary() {
        let due = utc(2024, 5, 14, 8, 0);
        let reminder = reminder_with(times_cadence(&["08:00"]), utc(2024, 5, 1, 0, 0));
        let grace = Duration::minutes(10);
        let lookback = Duration::hours(24);

        let at_9m = missed_instants(&reminder, &[], due + Duration::minutes(9), grace, lookback, 60);
        assert!(at_9m.is_empty());

        let at_11m =
            missed_instants(&reminder, &[], due + Duration::minutes(11), grace, lookback, 60);
        assert_eq!(at_11m, vec![due]);
    }

    #[test]
    fn test_missed_skips_resolved_and_recorded_instants() {
        let due = utc(2024, 5, 14, 8, 0);
        let reminder = reminder_with(times_cadence(&["08:00"]), utc(2024, 5, 1, 0, 0));
        let now = due + Duration::hours(1);
        let grace = Duration::minutes(10);
        let lookback = Duration::hours(12);

        for status in [
            OccurrenceStatus::Completed,
            OccurrenceStatus::Skipped,
            OccurrenceStatus::Snoozed,
            OccurrenceStatus::Missed,
        ] {
            let history = vec![occurrence(reminder.id, due, status)];
            assert!(
                missed_instants(&reminder, &history, now, grace, lookback, 60).is_empty(),
                "{:?} should suppress the instant",
                status
            );
        }

        // Another reminder's entry does not resolve ours
        let history = vec![occurrence(99, due, OccurrenceStatus::Completed)];
        assert_eq!(
            missed_instants(&reminder, &history, now, grace, lookback, 60),
            vec![due]
        );
    }

    #[test]
    fn test_missed_ignores_instants_before_creation() {
        let created = utc(2024, 5, 14, 12, 0);
        let reminder = reminder_with(times_cadence(&["08:00"]), created);
        let missed = missed_instants(
            &reminder,
            &[],
            utc(2024, 5, 14, 13, 0),
            Duration::minutes(10),
            Duration::hours(24),
            60,
        );
        assert!(missed.is_empty(), "the 08:00 slot predates the reminder");
    }

    #[test]
    fn test_dedup_window_boundary_inclusive() {
        let candidate = utc(2024, 5, 14, 8, 0);
        let window = Duration::minutes(120);

        let at_edge = vec![occurrence(
            7,
            candidate + Duration::hours(2),
            OccurrenceStatus::Completed,
        )];
        assert!(duplicate_completed(&at_edge, 7, candidate, window).is_some());

        let past_edge = vec![occurrence(
            7,
            candidate + Duration::hours(2) + Duration::seconds(1),
            OccurrenceStatus::Completed,
        )];
        assert!(duplicate_completed(&past_edge, 7, candidate, window).is_none());
    }

    #[test]
    fn test_dedup_ignores_non_completed_statuses() {
        let candidate = utc(2024, 5, 14, 8, 0);
        let history = vec![occurrence(7, candidate, OccurrenceStatus::Missed)];
        assert!(duplicate_completed(&history, 7, candidate, Duration::minutes(120)).is_none());
    }

    #[test]
    fn test_next_alert_instant_honors_snooze_and_enabled() {
        let now = utc(2024, 5, 14, 9, 0);
        let mut reminder = reminder_with(times_cadence(&["08:00", "20:00"]), now);

        assert_eq!(next_alert_instant(&reminder, now), Some(utc(2024, 5, 14, 20, 0)));

        reminder.snoozed_until = Some(now + Duration::minutes(15));
        assert_eq!(next_alert_instant(&reminder, now), Some(now + Duration::minutes(15)));

        // An expired snooze falls back to the cadence
        reminder.snoozed_until = Some(now - Duration::minutes(5));
        assert_eq!(next_alert_instant(&reminder, now), Some(utc(2024, 5, 14, 20, 0)));

        reminder.enabled = false;
        assert_eq!(next_alert_instant(&reminder, now), None);
    }

    #[test]
    fn test_adaptive_proposal_shifts_most_missed_time() {
        let created = utc(2024, 5, 1, 0, 0);
        let mut reminder = reminder_with(times_cadence(&["08:00", "20:00"]), created);
        reminder.missed_count = 3;

        let history = vec![
            occurrence(7, utc(2024, 5, 10, 8, 0), OccurrenceStatus::Missed),
            occurrence(7, utc(2024, 5, 11, 8, 0), OccurrenceStatus::Missed),
            occurrence(7, utc(2024, 5, 12, 20, 0), OccurrenceStatus::Missed),
        ];

        let proposed =
            propose_cadence_adjustment(&reminder, &history, 0, &AdaptivePolicy::default()).unwrap();
        assert_eq!(
            proposed,
            times_cadence(&["09:00", "20:00"]),
        );
    }

    #[test]
    fn test_adaptive_proposal_requires_threshold_growth() {
        let reminder = {
            let mut r = reminder_with(times_cadence(&["08:00"]), utc(2024, 5, 1, 0, 0));
            r.missed_count = 5;
            r
        };
        // Already adjusted at missed_count 4: growth of 1 is below threshold
        assert!(propose_cadence_adjustment(&reminder, &[], 4, &AdaptivePolicy::default()).is_none());
    }

    #[test]
    fn test_adaptive_proposal_skips_interval_cadence() {
        let mut reminder = reminder_with(
            Cadence::Interval { every_minutes: 120 },
            utc(2024, 5, 1, 0, 0),
        );
        reminder.missed_count = 10;
        assert!(propose_cadence_adjustment(&reminder, &[], 0, &AdaptivePolicy::default()).is_none());
    }

    #[test]
    fn test_adaptive_shift_wraps_past_midnight() {
        let mut reminder = reminder_with(times_cadence(&["23:30"]), utc(2024, 5, 1, 0, 0));
        reminder.missed_count = 3;
        let proposed =
            propose_cadence_adjustment(&reminder, &[], 0, &AdaptivePolicy::default()).unwrap();
        assert_eq!(proposed, times_cadence(&["00:30"]));
    }
}
