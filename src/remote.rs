use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::reminder::{Occurrence, OccurrenceStatus, Reminder, ReminderDraft, ReminderPatch};

/// Abstract REST contract of the remote reminder service. The engine
/// only ever talks to this seam; tests substitute their own
/// implementation.
pub trait ReminderService: Send + Sync {
    fn list_reminders(&self) -> EngineResult<Vec<Reminder>>;
    fn create_reminder(&self, draft: &ReminderDraft) -> EngineResult<Reminder>;
    fn update_reminder(&self, id: i64, patch: &ReminderPatch) -> EngineResult<Reminder>;
    fn delete_reminder(&self, id: i64) -> EngineResult<()>;
    fn snooze_reminder(&self, id: i64, minutes: i64) -> EngineResult<Reminder>;
    fn mark_missed(&self, id: i64) -> EngineResult<Reminder>;
    fn record_history(&self, id: i64, entry: &HistoryEntryBody) -> EngineResult<Occurrence>;
    fn fetch_history(&self, id: i64) -> EngineResult<Vec<Occurrence>>;
    fn fetch_stats(&self) -> EngineResult<AdherenceStats>;
    fn fetch_upcoming(&self) -> EngineResult<Vec<UpcomingDose>>;
}

/// Body of `POST /medications/{id}/history`. The server answers 409 when
/// the entry falls inside its own duplicate-tolerance window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntryBody {
    pub status: OccurrenceStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct SnoozeBody {
    minutes: i64,
}

/// Aggregate adherence numbers served to the reporting panel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdherenceStats {
    #[serde(default)]
    pub total_taken: u32,
    #[serde(default)]
    pub total_missed: u32,
    #[serde(default)]
    pub adherence_rate: f64,
    #[serde(default)]
    pub per_reminder: Vec<ReminderStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderStats {
    pub reminder_id: i64,
    #[serde(default)]
    pub taken: u32,
    #[serde(default)]
    pub missed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingDose {
    pub reminder_id: i64,
    pub label: String,
    pub scheduled_time: DateTime<Utc>,
}

/// Connection settings for the hosted reminder service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout_secs: crate::config::DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

/// Blocking HTTP client for the reminder service. Every call is bounded
/// by the agent's timeout; a timeout surfaces as `Network`, never as a
/// not-found or server error.
pub struct HttpReminderService {
    agent: ureq::Agent,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpReminderService {
    pub fn new(config: ServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let req = self.agent.request(method, &self.url(path));
        match &self.auth_token {
            Some(token) => req.set("Authorization", &format!("Bearer {}", token)),
            None => req,
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        response: ureq::Response,
        what: &str,
    ) -> EngineResult<T> {
        response
            .into_json()
            .map_err(|e| EngineError::server(format!("malformed {} response: {}", what, e)))
    }
}

/// Map an HTTP failure status onto the engine's error taxonomy.
fn error_for_status(code: u16, what: &str) -> EngineError {
    match code {
        401 | 403 => EngineError::unauthorized(format!("{} rejected ({})", what, code)),
        404 => EngineError::not_found(format!("{}: entity not on server", what)),
        409 => EngineError::conflict(format!("{}: already recorded", what)),
        400 | 422 => EngineError::validation(format!("{} rejected by server ({})", what, code)),
        code => EngineError::server(format!("{} failed with status {}", what, code)),
    }
}

fn map_call(
    result: Result<ureq::Response, ureq::Error>,
    what: &str,
) -> EngineResult<ureq::Response> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(code, _)) => Err(error_for_status(code, what)),
        Err(e) => Err(EngineError::network(format!("{}: {}", what, e))),
    }
}

impl ReminderService for HttpReminderService {
    fn list_reminders(&self) -> EngineResult<Vec<Reminder>> {
        let response = map_call(self.request("GET", "/reminders").call(), "list reminders")?;
        Self::read_json(response, "reminder list")
    }

    fn create_reminder(&self, draft: &ReminderDraft) -> EngineResult<Reminder> {
        debug!("creating reminder {:?}", draft.label);
        let response = map_call(
            self.request("POST", "/reminders").send_json(draft),
            "create reminder",
        )?;
        Self::read_json(response, "created reminder")
    }

    fn update_reminder(&self, id: i64, patch: &ReminderPatch) -> EngineResult<Reminder> {
        let response = map_call(
            self.request("PUT", &format!("/reminders/{}", id)).send_json(patch),
            "update reminder",
        )?;
        Self::read_json(response, "updated reminder")
    }

    fn delete_reminder(&self, id: i64) -> EngineResult<()> {
        map_call(
            self.request("DELETE", &format!("/reminders/{}", id)).call(),
            "delete reminder",
        )?;
        Ok(())
    }

    fn snooze_reminder(&self, id: i64, minutes: i64) -> EngineResult<Reminder> {
        let response = map_call(
            self.request("POST", &format!("/reminders/{}/snooze", id))
                .send_json(SnoozeBody { minutes }),
            "snooze reminder",
        )?;
        Self::read_json(response, "snoozed reminder")
    }

    fn mark_missed(&self, id: i64) -> EngineResult<Reminder> {
        let response = map_call(
            self.request("POST", &format!("/reminders/{}/missed", id))
                .send_json(serde_json::json!({})),
            "mark missed",
        )?;
        Self::read_json(response, "missed reminder")
    }

    fn record_history(&self, id: i64, entry: &HistoryEntryBody) -> EngineResult<Occurrence> {
        let response = map_call(
            self.request("POST", &format!("/medications/{}/history", id)).send_json(entry),
            "record history",
        )?;
        Self::read_json(response, "history entry")
    }

    fn fetch_history(&self, id: i64) -> EngineResult<Vec<Occurrence>> {
        let response = map_call(
            self.request("GET", &format!("/medications/{}/history", id)).call(),
            "fetch history",
        )?;
        Self::read_json(response, "history")
    }

    fn fetch_stats(&self) -> EngineResult<AdherenceStats> {
        let response = map_call(self.request("GET", "/medications/stats").call(), "fetch stats")?;
        Self::read_json(response, "stats")
    }

    fn fetch_upcoming(&self) -> EngineResult<Vec<UpcomingDose>> {
        let response = map_call(
            self.request("GET", "/medications/upcoming").call(),
            "fetch upcoming",
        )?;
        Self::read_json(response, "upcoming doses")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_covers_the_taxonomy() {
        assert!(matches!(error_for_status(401, "x"), EngineError::Unauthorized(_)));
        assert!(matches!(error_for_status(403, "x"), EngineError::Unauthorized(_)));
        assert!(matches!(error_for_status(404, "x"), EngineError::NotFound(_)));
        assert!(matches!(error_for_status(409, "x"), EngineError::Conflict(_)));
        assert!(matches!(error_for_status(400, "x"), EngineError::Validation(_)));
        assert!(matches!(error_for_status(500, "x"), EngineError::Server(_)));
        assert!(matches!(error_for_status(503, "x"), EngineError::Server(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_is_normalized() {
        let service = HttpReminderService::new(ServiceConfig::new("https://api.example.test/"));
        assert_eq!(service.url("/reminders"), "https://api.example.test/reminders");
    }

    #[test]
    fn test_history_body_wire_shape() {
        let entry = HistoryEntryBody {
            status: OccurrenceStatus::Completed,
            time: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert!(json.contains("\"time\":"));
    }

    #[test]
    fn test_stats_tolerate_sparse_payload() {
        let stats: AdherenceStats = serde_json::from_str("{\"total_taken\": 4}").unwrap();
        assert_eq!(stats.total_taken, 4);
        assert_eq!(stats.total_missed, 0);
        assert!(stats.per_reminder.is_empty());
    }
}
