/*!
 # Status and health payloads

 Builders for the retained JSON documents the service publishes, plus the
 [`Health`] record that collects device faults between publishes.
*/

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::config::Profile;
use crate::control::{ControlState, OverrideKind, Snapshot};
use crate::Result;

/// Reported service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Error,
    Offline,
}

/// Device faults seen while handling the current event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Health {
    degraded: bool,
    last_error: Option<String>,
}

impl Health {
    /// Starts a new event; the last error text stays for diagnostics
    pub fn begin(&mut self) {
        self.degraded = false;
    }

    /// Logs and remembers a failed device call. Returns true on success.
    pub fn record(&mut self, operation: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(operation, error = %e, "Device operation failed");
                self.degraded = true;
                self.last_error = Some(format!("{operation}: {e}"));
                false
            }
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.degraded {
            HealthStatus::Error
        } else {
            HealthStatus::Online
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    #[serde(flatten)]
    snapshot: Snapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Snapshot of the state, tagged with what caused the publish
pub fn status_payload(state: &ControlState, reason: Option<&str>) -> Result<String> {
    let payload = StatusPayload {
        snapshot: state.snapshot(),
        reason,
    };
    Ok(serde_json::to_string(&payload)?)
}

#[derive(Serialize)]
struct HealthPayload<'a> {
    status: HealthStatus,
    validated_at: DateTime<Utc>,
    config_path: String,
    schema_revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<&'a str>,
}

pub fn health_payload(
    profile: &Profile,
    status: HealthStatus,
    validated_at: DateTime<Utc>,
    health: &Health,
) -> Result<String> {
    let payload = HealthPayload {
        status,
        validated_at,
        config_path: profile.source_path.display().to_string(),
        schema_revision: profile.schema_revision(),
        last_error: health.last_error(),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Status reason for an override lifecycle step, e.g. `alert_start`
pub fn override_reason(kind: OverrideKind, action: &str) -> String {
    format!("{kind}_{action}")
}
