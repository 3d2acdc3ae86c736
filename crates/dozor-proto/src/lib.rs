//! Shared data model for the dozor operations engine.
//!
//! Everything here is a per-triage-cycle value type: snapshots are built
//! during composition and discarded once the report text is emitted. The
//! closed enumerations fold unknown wire strings to their `Unknown` variant
//! instead of failing, so a newer container runtime can never break a cycle.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Container labels ─────────────────────────────────────────────────────────

/// Container labels the engine recognizes.
pub mod labels {
    /// `"false"` opts the container out of monitoring.
    pub const ENABLE: &str = "dozor.enable";
    /// Display-name override.
    pub const NAME: &str = "dozor.name";
    /// Group membership for group health.
    pub const GROUP: &str = "dozor.group";
    /// Comma-separated dependency list.
    pub const DEPENDS_ON: &str = "dozor.depends_on";
    /// HTTP healthcheck probe URL.
    pub const HEALTHCHECK_URL: &str = "dozor.healthcheck.url";
    /// Alert routing hint.
    pub const ALERT_CHANNEL: &str = "dozor.alert.channel";
    /// Extra regex for the log analyzer.
    pub const LOGS_PATTERN: &str = "dozor.logs.pattern";
    /// Compose project service name, set by the orchestrator.
    pub const COMPOSE_SERVICE: &str = "com.docker.compose.service";
}

// ─── Container state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited,
    Restarting,
    Paused,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Parse a runtime state string, folding anything unrecognized to
    /// [`ContainerState::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" | "up" => Self::Running,
            "exited" | "stopped" => Self::Exited,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// True for the terminal bad states that trigger the P0 override.
    pub fn is_terminal_bad(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead | Self::Restarting)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Restarting => write!(f, "restarting"),
            Self::Paused => write!(f, "paused"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ─── Alert level ──────────────────────────────────────────────────────────────

/// Alert severity. Ordered so that `Critical` compares greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Parse an UPPERCASE report tag, folding unknown tags to `Info`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Self::Critical,
            "ERROR" => Self::Error,
            "WARNING" | "WARN" => Self::Warning,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Error => write!(f, "ERROR"),
            Self::Warning => write!(f, "WARNING"),
            Self::Info => write!(f, "INFO"),
        }
    }
}

// ─── Overall health ───────────────────────────────────────────────────────────

/// Overall cycle health. Ordered by severity: critical > degraded > warning
/// > healthy > unknown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl From<AlertLevel> for HealthState {
    fn from(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Critical => Self::Critical,
            AlertLevel::Error => Self::Degraded,
            AlertLevel::Warning => Self::Warning,
            AlertLevel::Info => Self::Healthy,
        }
    }
}

/// Overall health is the max severity of any produced alert; `Unknown` only
/// when the cycle saw no services at all.
pub fn overall_health(service_count: usize, alerts: &[Alert]) -> HealthState {
    if service_count == 0 {
        return HealthState::Unknown;
    }
    alerts
        .iter()
        .map(|a| HealthState::from(a.level))
        .max()
        .unwrap_or(HealthState::Healthy)
}

// ─── Log entry ────────────────────────────────────────────────────────────────

/// One fetched log line, with the runtime timestamp when one was present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub line: String,
}

impl LogEntry {
    pub fn new(timestamp: Option<DateTime<Utc>>, line: impl Into<String>) -> Self {
        Self {
            timestamp,
            line: line.into(),
        }
    }
}

// ─── Service status ───────────────────────────────────────────────────────────

/// A snapshot of one container, created per triage cycle and never mutated
/// after enrichment completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    /// Runtime health string (`healthy`, `unhealthy`, `starting`, or empty).
    pub health: String,
    pub uptime: String,
    pub restart_count: u32,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub memory_limit_mb: Option<f64>,
    pub error_count: u32,
    /// Up to 5 most-recent error log entries.
    pub recent_errors: Vec<LogEntry>,
    pub healthcheck_url: Option<String>,
    pub healthcheck_ok: Option<bool>,
    pub healthcheck_message: String,
    pub alert_channel: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ServiceStatus {
    /// A bare status for a named service in the given state.
    pub fn new(name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            state,
            health: String::new(),
            uptime: String::new(),
            restart_count: 0,
            cpu_percent: None,
            memory_mb: None,
            memory_limit_mb: None,
            error_count: 0,
            recent_errors: Vec::new(),
            healthcheck_url: None,
            healthcheck_ok: None,
            healthcheck_message: String::new(),
            alert_channel: None,
            labels: HashMap::new(),
        }
    }

    /// Healthy iff running, never restarted, healthcheck not failed, and the
    /// error count is below the configured threshold.
    pub fn is_healthy(&self, error_threshold: u32) -> bool {
        self.state == ContainerState::Running
            && self.restart_count == 0
            && self.healthcheck_ok != Some(false)
            && self.error_count < error_threshold
    }

    /// Memory usage as a percentage of the limit, when a limit is set.
    pub fn memory_percent(&self) -> Option<f64> {
        match (self.memory_mb, self.memory_limit_mb) {
            (Some(used), Some(limit)) if limit > 0.0 => Some(used / limit * 100.0),
            _ => None,
        }
    }
}

// ─── Discovered container ─────────────────────────────────────────────────────

/// A raw inventory record from the container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredContainer {
    /// Short (12-char) id prefix.
    pub id: String,
    /// Cleaned container name (leading `/` stripped, `dozor.name` applied).
    pub name: String,
    pub compose_service: Option<String>,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

impl DiscoveredContainer {
    /// Monitoring is opt-out: only an explicit `dozor.enable=false` disables.
    pub fn is_enabled(&self) -> bool {
        self.labels
            .get(labels::ENABLE)
            .map(|v| v != "false")
            .unwrap_or(true)
    }
}

// ─── Alert ────────────────────────────────────────────────────────────────────

/// An immutable alert record emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub service: String,
    pub title: String,
    pub description: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub channel: Option<String>,
}

impl Alert {
    pub fn new(
        level: AlertLevel,
        service: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            level,
            service: service.into(),
            title: title.into(),
            description: description.into(),
            action: action.into(),
            timestamp: Utc::now(),
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: Option<String>) -> Self {
        self.channel = channel;
        self
    }

    /// Identifies a repeatable alert shape across cycles.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.level, self.service, self.title)
    }
}

// ─── Triage issue ─────────────────────────────────────────────────────────────

/// One problematic service recovered from a formatted triage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageIssue {
    pub service: String,
    pub description: String,
    pub level: AlertLevel,
}

// ─── Disk status ──────────────────────────────────────────────────────────────

/// Host disk pressure for the report footer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStatus {
    pub filesystem: String,
    pub used_pct: u32,
    pub free_gb: f64,
}

// ─── Diagnostic report ────────────────────────────────────────────────────────

/// The structured counterpart of the triage text, built in the same pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub services: Vec<ServiceStatus>,
    pub alerts: Vec<Alert>,
    pub overall: HealthState,
}

impl DiagnosticReport {
    /// Names of services with at least one alert, in report order.
    pub fn problematic_services(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for a in &self.alerts {
            if !seen.contains(&a.service.as_str()) {
                seen.push(a.service.as_str());
            }
        }
        seen
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
