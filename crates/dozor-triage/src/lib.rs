//! The triage composer: one pass over the host state producing the report
//! text other components parse, plus the structured report beside it.
//!
//! The text surface is an external contract. Consumers rely on the
//! `[LEVEL] service — …` line shape, the `Healthy services (` headline, and
//! the `\nHealth: healthy |` header; changes here break the remediator and
//! the watch loop.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dozor_alerts::{
    disk_alert, generate_alerts, group_alerts, inhibit, DependencyGraph, Thresholds,
};
use dozor_discovery::Discovery;
use dozor_logscan::{recent_error_entries, LogAnalyzer, LogReport};
use dozor_proto::{
    labels, overall_health, Alert, AlertLevel, ContainerState, DiagnosticReport, DiskStatus,
    HealthState, ServiceStatus, TriageIssue,
};
use dozor_transport::Transport;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Healthcheck probes run under this deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Recent error lines kept per service.
const RECENT_ERRORS: usize = 5;
/// Recent error lines are clipped to this many chars in the report.
const ERROR_LINE_CAP: usize = 150;

// ─── Dev mode ─────────────────────────────────────────────────────────────────

/// Observe-only switch plus the per-service exclusion map with lazy expiry.
/// Owned by the engine for the process lifetime.
pub struct DevMode {
    enabled: AtomicBool,
    exclusions: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DevMode {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            exclusions: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Exclude a service from triage until the TTL elapses.
    pub fn exclude(&self, service: impl Into<String>, ttl: Duration) {
        let deadline = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        self.exclusions.lock().insert(service.into(), deadline);
    }

    /// Drop one exclusion before its deadline.
    pub fn include(&self, service: &str) -> bool {
        self.exclusions.lock().remove(service).is_some()
    }

    pub fn is_excluded(&self, service: &str) -> bool {
        let mut map = self.exclusions.lock();
        match map.get(service) {
            Some(deadline) if *deadline > Utc::now() => true,
            Some(_) => {
                map.remove(service);
                false
            }
            None => false,
        }
    }

    /// Active exclusions, deleting expired entries as it walks.
    pub fn list_exclusions(&self) -> Vec<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let mut map = self.exclusions.lock();
        map.retain(|_, deadline| *deadline > now);
        let mut list: Vec<(String, DateTime<Utc>)> =
            map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}

impl Default for DevMode {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Snapshot and outcome ─────────────────────────────────────────────────────

/// Everything one cycle gathered, ready for composition. Pure data so the
/// composer can be driven without a container runtime.
#[derive(Debug, Clone, Default)]
pub struct TriageSnapshot {
    pub host: String,
    pub statuses: Vec<ServiceStatus>,
    /// Dev-excluded services re-included because they are down (P0 override).
    pub p0_overrides: Vec<String>,
    /// Dev-excluded services omitted from this cycle.
    pub dev_excluded: Vec<String>,
    pub log_reports: HashMap<String, LogReport>,
    pub disk: Option<DiskStatus>,
    /// Alerts injected by callers (systemd probe, add-on checks).
    pub extra_alerts: Vec<Alert>,
}

/// The composed cycle: canonical text plus the structured report, which must
/// agree on the problematic-service set.
#[derive(Debug, Clone)]
pub struct TriageOutcome {
    pub text: String,
    pub report: DiagnosticReport,
    pub inhibited: Vec<Alert>,
}

impl TriageOutcome {
    pub fn all_healthy(&self) -> bool {
        is_all_healthy(&self.text)
    }
}

// ─── Composition ──────────────────────────────────────────────────────────────

/// Compose one cycle: alerts, inhibition, overall health, report text.
pub fn compose(snapshot: &TriageSnapshot, thresholds: &Thresholds) -> TriageOutcome {
    let timestamp = Utc::now();

    if snapshot.statuses.is_empty() && snapshot.extra_alerts.is_empty() {
        let alert = Alert::new(
            AlertLevel::Warning,
            "dozor",
            "no services discovered",
            "discovery returned nothing and no services are configured",
            "configure DOZOR_SERVICES or check the container runtime",
        );
        let report = DiagnosticReport {
            timestamp,
            host: snapshot.host.clone(),
            services: Vec::new(),
            alerts: vec![alert],
            overall: HealthState::Unknown,
        };
        let text = format!(
            "Server Triage Report\nHealth: {} | Time: {}\n\nNo services discovered.\n",
            HealthState::Unknown,
            timestamp.format("%Y-%m-%d %H:%M"),
        );
        return TriageOutcome {
            text,
            report,
            inhibited: Vec::new(),
        };
    }

    // Alerts in discovery order of their subject, fixed rule order within.
    let mut alerts: Vec<Alert> = Vec::new();
    for status in &snapshot.statuses {
        alerts.extend(generate_alerts(status, thresholds));
    }
    alerts.extend(group_alerts(&snapshot.statuses));
    if let Some(disk) = &snapshot.disk {
        alerts.extend(disk_alert(disk, thresholds));
    }
    alerts.extend(snapshot.extra_alerts.iter().cloned());

    let graph = DependencyGraph::build(&snapshot.statuses);
    let outcome = inhibit(&snapshot.statuses, alerts, &graph);

    let overall = overall_health(snapshot.statuses.len(), &outcome.kept);
    let report = DiagnosticReport {
        timestamp,
        host: snapshot.host.clone(),
        services: snapshot.statuses.clone(),
        alerts: outcome.kept.clone(),
        overall,
    };
    let text = render_report(snapshot, &report, thresholds, timestamp);

    TriageOutcome {
        text,
        report,
        inhibited: outcome.inhibited,
    }
}

/// Level shown on a service's report line.
fn service_line_level(status: &ServiceStatus, thresholds: &Thresholds) -> AlertLevel {
    if status.state != ContainerState::Running {
        AlertLevel::Critical
    } else if status.healthcheck_ok == Some(false)
        || status.restart_count > 0
        || status.error_count >= thresholds.error_count
    {
        AlertLevel::Error
    } else {
        AlertLevel::Warning
    }
}

fn render_report(
    snapshot: &TriageSnapshot,
    report: &DiagnosticReport,
    thresholds: &Thresholds,
    timestamp: DateTime<Utc>,
) -> String {
    let (problematic, healthy): (Vec<&ServiceStatus>, Vec<&ServiceStatus>) = snapshot
        .statuses
        .iter()
        .partition(|s| !s.is_healthy(thresholds.error_count));

    let mut out = String::new();
    out.push_str("Server Triage Report\n");
    out.push_str(&format!(
        "Health: {} | Time: {}\n",
        report.overall,
        timestamp.format("%Y-%m-%d %H:%M")
    ));

    let attention_count = problematic.len() + snapshot.extra_alerts.len();
    if attention_count > 0 {
        out.push_str(&format!(
            "\nServices needing attention ({attention_count}):\n"
        ));
        for status in &problematic {
            out.push('\n');
            render_service_section(&mut out, status, snapshot, thresholds);
        }
        // Injected alerts (systemd units, add-on checks) render in the same
        // parseable line shape.
        for alert in &snapshot.extra_alerts {
            out.push_str(&format!(
                "\n[{}] {} — {}\n",
                alert.level, alert.service, alert.description
            ));
        }
    }

    if !healthy.is_empty() {
        let names: Vec<&str> = healthy.iter().map(|s| s.name.as_str()).collect();
        out.push_str(&format!(
            "\nHealthy services ({}): {}\n",
            names.len(),
            names.join(", ")
        ));
    }

    if let Some(disk) = &snapshot.disk {
        let band = if disk.used_pct >= thresholds.disk_crit_pct {
            "CRITICAL"
        } else if disk.used_pct >= thresholds.disk_warn_pct {
            "WARNING"
        } else {
            "OK"
        };
        out.push_str(&format!(
            "\nDisk: {} {}% ({:.0}G free) — {}\n",
            disk.filesystem, disk.used_pct, disk.free_gb, band
        ));
    }

    if !snapshot.p0_overrides.is_empty() {
        out.push_str(&format!(
            "\nP0 OVERRIDE — dev-excluded but DOWN: {}\n",
            snapshot.p0_overrides.join(", ")
        ));
    }
    if !snapshot.dev_excluded.is_empty() {
        out.push_str(&format!(
            "Dev-excluded ({}): {}\n",
            snapshot.dev_excluded.len(),
            snapshot.dev_excluded.join(", ")
        ));
    }

    out
}

fn render_service_section(
    out: &mut String,
    status: &ServiceStatus,
    snapshot: &TriageSnapshot,
    thresholds: &Thresholds,
) {
    let level = service_line_level(status, thresholds);
    let mut line = format!("[{}] {} — {}", level, status.name, status.state);
    if status.restart_count > 0 {
        line.push_str(&format!(", {} restarts", status.restart_count));
    }
    if status.error_count > 0 {
        line.push_str(&format!(", {} errors", status.error_count));
    }
    out.push_str(&line);
    out.push('\n');

    if let Some(log_report) = snapshot.log_reports.get(&status.name) {
        for issue in &log_report.issues {
            out.push_str(&format!(
                "  Issue: {} ({} occurrences)\n",
                issue.description, issue.count
            ));
            out.push_str(&format!("  Action: {}\n", issue.action));
        }
    }

    if !status.recent_errors.is_empty() {
        out.push_str("  Recent errors:\n");
        for entry in status.recent_errors.iter().take(RECENT_ERRORS) {
            let time = entry
                .timestamp
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "--:--:--".to_string());
            let line: String = entry.line.chars().take(ERROR_LINE_CAP).collect();
            out.push_str(&format!("    [{time}] {line}\n"));
        }
    }
}

// ─── Extraction ───────────────────────────────────────────────────────────────

fn issue_line_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\[(CRITICAL|ERROR|WARNING)\] (.+?) — (.+)$")
            .expect("issue line regex must compile")
    })
}

/// Recover the problematic services from a formatted report. Lines that do
/// not match the exact shape are ignored.
pub fn extract_issues(text: &str) -> Vec<TriageIssue> {
    issue_line_re()
        .captures_iter(text)
        .map(|caps| TriageIssue {
            level: AlertLevel::parse(&caps[1]),
            service: caps[2].to_string(),
            description: caps[3].to_string(),
        })
        .collect()
}

/// Level for one exactly-named service. A service whose name is a prefix of
/// another's never collides: the full name is matched up to the separator.
pub fn extract_issue_level(text: &str, service: &str) -> Option<AlertLevel> {
    issue_line_re()
        .captures_iter(text)
        .find(|caps| &caps[2] == service)
        .map(|caps| AlertLevel::parse(&caps[1]))
}

/// The header check the watch loop short-circuits on.
pub fn is_all_healthy(text: &str) -> bool {
    text.contains("\nHealth: healthy |")
}

// ─── Disk parsing ─────────────────────────────────────────────────────────────

/// Parse `df -P -k` output, reporting the fullest real filesystem.
pub fn parse_df(output: &str) -> Option<DiskStatus> {
    let mut best: Option<DiskStatus> = None;
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || !fields[0].starts_with('/') {
            continue;
        }
        let Ok(available_kb) = fields[3].parse::<f64>() else {
            continue;
        };
        let Ok(used_pct) = fields[4].trim_end_matches('%').parse::<u32>() else {
            continue;
        };
        let candidate = DiskStatus {
            filesystem: fields[0].to_string(),
            used_pct,
            free_gb: available_kb / (1024.0 * 1024.0),
        };
        if best.as_ref().map(|b| candidate.used_pct > b.used_pct).unwrap_or(true) {
            best = Some(candidate);
        }
    }
    best
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Engine-level knobs for snapshot gathering.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Configured monitored set; discovery is the fallback.
    pub services: Vec<String>,
    pub log_lines: u32,
    pub thresholds: Thresholds,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            log_lines: 100,
            thresholds: Thresholds::default(),
        }
    }
}

/// Gathers one snapshot from the host and composes the cycle report.
pub struct TriageEngine {
    discovery: Arc<Discovery>,
    transport: Arc<dyn Transport>,
    analyzer: LogAnalyzer,
    dev_mode: Arc<DevMode>,
    config: TriageConfig,
    host: String,
    http: reqwest::Client,
}

impl TriageEngine {
    pub fn new(
        discovery: Arc<Discovery>,
        transport: Arc<dyn Transport>,
        dev_mode: Arc<DevMode>,
        config: TriageConfig,
        host: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            transport,
            analyzer: LogAnalyzer::new(),
            dev_mode,
            config,
            host: host.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn dev_mode(&self) -> &Arc<DevMode> {
        &self.dev_mode
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.config.thresholds
    }

    /// Run one full triage cycle. `explicit` narrows the cycle to the given
    /// services; otherwise the configured list, then discovery, decides.
    pub async fn run(
        &self,
        explicit: Option<Vec<String>>,
        extra_alerts: Vec<Alert>,
        cancel: &CancellationToken,
    ) -> TriageOutcome {
        let snapshot = self.gather(explicit, extra_alerts, cancel).await;
        compose(&snapshot, &self.config.thresholds)
    }

    /// Build the cycle snapshot: resolve services, apply dev exclusions with
    /// the P0 override, enrich statuses, fetch logs and disk pressure.
    pub async fn gather(
        &self,
        explicit: Option<Vec<String>>,
        extra_alerts: Vec<Alert>,
        cancel: &CancellationToken,
    ) -> TriageSnapshot {
        let names = self.resolve_services(explicit).await;

        let mut statuses = Vec::with_capacity(names.len());
        let mut p0_overrides = Vec::new();
        let mut dev_excluded = Vec::new();

        for name in names {
            let status = match self.discovery.inspect(&name).await {
                Some(status) => status,
                None => {
                    debug!(subsystem = "triage", service = %name, "service missing from runtime");
                    ServiceStatus::new(name.clone(), ContainerState::Unknown)
                }
            };

            if self.dev_mode.is_excluded(&status.name) {
                if status.state.is_terminal_bad() {
                    info!(
                        subsystem = "triage",
                        service = %status.name,
                        state = %status.state,
                        "dev-excluded service is down, P0 override"
                    );
                    p0_overrides.push(status.name.clone());
                } else {
                    dev_excluded.push(status.name.clone());
                    continue;
                }
            }
            statuses.push(status);
        }

        // Copy recognized labels into the status snapshot.
        for status in &mut statuses {
            status.healthcheck_url = status.labels.get(labels::HEALTHCHECK_URL).cloned();
            status.alert_channel = status.labels.get(labels::ALERT_CHANNEL).cloned();
        }

        self.discovery.enrich_resources(&mut statuses).await;
        self.probe_healthchecks(&mut statuses).await;

        let mut log_reports = HashMap::new();
        let now = Utc::now();
        for status in &mut statuses {
            if status.state != ContainerState::Running {
                continue;
            }
            let entries = self
                .discovery
                .fetch_logs(&status.name, self.config.log_lines)
                .await;
            if entries.is_empty() {
                continue;
            }
            let extra_pattern = status.labels.get(labels::LOGS_PATTERN).map(String::as_str);
            let log_report = self
                .analyzer
                .analyze(&status.name, &entries, extra_pattern, now);
            status.error_count = log_report.error_count;
            status.recent_errors = recent_error_entries(&entries, RECENT_ERRORS);
            log_reports.insert(status.name.clone(), log_report);
        }

        let disk = self.collect_disk(cancel).await;

        TriageSnapshot {
            host: self.host.clone(),
            statuses,
            p0_overrides,
            dev_excluded,
            log_reports,
            disk,
            extra_alerts,
        }
    }

    /// Resolution order: explicit argument, configured list, discovery.
    async fn resolve_services(&self, explicit: Option<Vec<String>>) -> Vec<String> {
        if let Some(list) = explicit {
            if !list.is_empty() {
                return list;
            }
        }
        if !self.config.services.is_empty() {
            return self.config.services.clone();
        }
        let discovered = self.discovery.services().await;
        if discovered.is_empty() {
            warn!(subsystem = "triage", "discovery returned no services");
        }
        discovered
    }

    /// 5-second HTTP probes for running services with a healthcheck URL.
    /// One task per target; results land at the input index.
    async fn probe_healthchecks(&self, statuses: &mut [ServiceStatus]) {
        let targets: Vec<(usize, String)> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ContainerState::Running)
            .filter_map(|(i, s)| s.healthcheck_url.clone().map(|url| (i, url)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut results: Vec<Option<(bool, String)>> = vec![None; statuses.len()];
        let probes = targets.into_iter().map(|(idx, url)| {
            let client = self.http.clone();
            async move { (idx, probe_url(&client, &url).await) }
        });
        for (idx, outcome) in futures_util::future::join_all(probes).await {
            results[idx] = Some(outcome);
        }

        for (idx, outcome) in results.into_iter().enumerate() {
            if let Some((ok, message)) = outcome {
                statuses[idx].healthcheck_ok = Some(ok);
                statuses[idx].healthcheck_message = message;
            }
        }
    }

    async fn collect_disk(&self, cancel: &CancellationToken) -> Option<DiskStatus> {
        match self.transport.exec("df -P -k", cancel).await {
            Ok(output) if output.success() => parse_df(&output.stdout),
            Ok(output) => {
                warn!(
                    subsystem = "triage",
                    exit_code = output.exit_code,
                    "df failed"
                );
                None
            }
            Err(e) => {
                warn!(subsystem = "triage", error = %e, "disk check failed");
                None
            }
        }
    }
}

async fn probe_url(client: &reqwest::Client, url: &str) -> (bool, String) {
    match client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status();
            (status.is_success(), format!("{status}"))
        }
        Err(e) => (false, format!("probe failed: {e}")),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
