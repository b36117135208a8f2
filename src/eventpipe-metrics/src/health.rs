use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Health of a single component or of the whole process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Serving, but running on a fallback path (e.g. buffering to disk)
    Degraded,
    /// Not able to do its job
    Unhealthy,
}

/// Health entry for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name (broker, storage, consumer, buffer)
    pub name: String,
    /// Current status
    pub status: HealthStatus,
    /// Human readable detail, e.g. the probe error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ComponentHealth {
    /// Healthy component with no details
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            details: None,
        }
    }

    /// Degraded component with a reason
    pub fn degraded(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            details: Some(details.into()),
        }
    }

    /// Unhealthy component with a reason
    pub fn unhealthy(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            details: Some(details.into()),
        }
    }
}

/// Aggregated health served by `/health` and `/health/ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all components
    pub status: HealthStatus,
    /// Per component entries
    pub components: Vec<ComponentHealth>,
    /// When the report was produced (RFC 3339)
    pub timestamp: String,
}

impl HealthReport {
    /// Aggregate component health; a single unhealthy component makes the report unhealthy
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if status == HealthStatus::Unhealthy {
            for c in components.iter().filter(|c| c.status == HealthStatus::Unhealthy) {
                warn!(
                    "[HEALTH] Component {} unhealthy: {}",
                    c.name,
                    c.details.as_deref().unwrap_or("no details")
                );
            }
        }

        Self {
            status,
            components,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Ready to take traffic unless something is unhealthy
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let code = if self.is_ready() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (code, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_unhealthy_component_fails_report() {
        let report = HealthReport::from_components(vec![
            ComponentHealth::healthy("broker"),
            ComponentHealth::unhealthy("storage", "bucket unreachable"),
            ComponentHealth::healthy("consumer"),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_degraded_is_still_ready() {
        let report = HealthReport::from_components(vec![
            ComponentHealth::healthy("broker"),
            ComponentHealth::degraded("buffer", "3 batches pending"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
    }

    #[test]
    fn test_report_status_codes() {
        let ok = HealthReport::from_components(vec![ComponentHealth::healthy("broker")]);
        assert_eq!(ok.into_response().status(), StatusCode::OK);

        let down = HealthReport::from_components(vec![ComponentHealth::unhealthy("broker", "timeout")]);
        assert_eq!(down.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
