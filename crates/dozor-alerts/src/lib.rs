//! The alert pipeline: threshold-driven generation, dependency-based
//! inhibition, group health, confirmation gating, flap detection, and
//! hash-based dedup.
//!
//! Within one cycle alerts are produced in discovery order of their subject
//! service, and per service in the fixed rule order of [`generate_alerts`].
//! Only the FailureTracker, FlapDetector, and DedupGate survive across
//! cycles; everything else is recomputed per triage.

#![forbid(unsafe_code)]

use dozor_proto::{labels, Alert, AlertLevel, ContainerState, DiskStatus, HealthState, ServiceStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ─── Thresholds ───────────────────────────────────────────────────────────────

/// Numeric triggers for the alert generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// CPU percent at or above which a warning fires.
    pub cpu_pct: f64,
    /// Memory percent of limit at or above which a warning fires.
    pub memory_pct: f64,
    pub disk_warn_pct: u32,
    pub disk_crit_pct: u32,
    /// Log error count at or above which an error fires.
    pub error_count: u32,
    /// Restart count at or above which an error fires.
    pub restart_count: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_pct: 80.0,
            memory_pct: 85.0,
            disk_warn_pct: 80,
            disk_crit_pct: 90,
            error_count: 10,
            restart_count: 3,
        }
    }
}

// ─── Alert generation ─────────────────────────────────────────────────────────

/// Derive alerts for one service, at most one per rule, in fixed rule order.
pub fn generate_alerts(status: &ServiceStatus, t: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let channel = status.alert_channel.clone();

    if status.state != ContainerState::Running {
        alerts.push(
            Alert::new(
                AlertLevel::Critical,
                &status.name,
                "service not running",
                format!("state: {}", status.state),
                "restart the service and find out why it stopped",
            )
            .with_channel(channel.clone()),
        );
    }

    if status.healthcheck_ok == Some(false) {
        alerts.push(
            Alert::new(
                AlertLevel::Error,
                &status.name,
                "healthcheck failed",
                if status.healthcheck_message.is_empty() {
                    "healthcheck probe failed".to_string()
                } else {
                    status.healthcheck_message.clone()
                },
                "probe the endpoint by hand and read the service logs",
            )
            .with_channel(channel.clone()),
        );
    }

    if status.restart_count >= t.restart_count {
        alerts.push(
            Alert::new(
                AlertLevel::Error,
                &status.name,
                "restarting repeatedly",
                format!("{} restarts", status.restart_count),
                "inspect the exit reason before it loops again",
            )
            .with_channel(channel.clone()),
        );
    }

    if let Some(cpu) = status.cpu_percent {
        if cpu >= t.cpu_pct {
            alerts.push(
                Alert::new(
                    AlertLevel::Warning,
                    &status.name,
                    "CPU usage high",
                    format!("{cpu:.1}% CPU"),
                    "profile the workload or raise the CPU allocation",
                )
                .with_channel(channel.clone()),
            );
        }
    }

    if let Some(mem_pct) = status.memory_percent() {
        if mem_pct >= t.memory_pct {
            alerts.push(
                Alert::new(
                    AlertLevel::Warning,
                    &status.name,
                    "memory usage high",
                    format!("{mem_pct:.1}% of limit"),
                    "check for leaks or raise the memory limit",
                )
                .with_channel(channel.clone()),
            );
        }
    }

    if status.error_count >= t.error_count {
        alerts.push(
            Alert::new(
                AlertLevel::Error,
                &status.name,
                "errors in logs",
                format!("{} errors in the log window", status.error_count),
                "read the recent errors in the report",
            )
            .with_channel(channel),
        );
    }

    alerts
}

/// Two-band disk alert against used percent. `None` while under the warn band.
pub fn disk_alert(disk: &DiskStatus, t: &Thresholds) -> Option<Alert> {
    if disk.used_pct >= t.disk_crit_pct {
        Some(Alert::new(
            AlertLevel::Critical,
            "disk",
            "disk almost full",
            format!(
                "{} at {}% ({:.1}G free)",
                disk.filesystem, disk.used_pct, disk.free_gb
            ),
            "prune unused images, volumes and rotated logs now",
        ))
    } else if disk.used_pct >= t.disk_warn_pct {
        Some(Alert::new(
            AlertLevel::Warning,
            "disk",
            "disk filling up",
            format!(
                "{} at {}% ({:.1}G free)",
                disk.filesystem, disk.used_pct, disk.free_gb
            ),
            "schedule a cleanup before it crosses the critical band",
        ))
    } else {
        None
    }
}

// ─── Dependency graph ─────────────────────────────────────────────────────────

/// Edges `service → [direct dependencies]`, rebuilt per cycle from the
/// `dozor.depends_on` label. Reverse reachability is computed on demand.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build from the cycle's statuses. Dangling references are logged and
    /// dropped.
    pub fn build(statuses: &[ServiceStatus]) -> Self {
        let known: HashSet<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();

        for status in statuses {
            let Some(raw) = status.labels.get(labels::DEPENDS_ON) else {
                continue;
            };
            let mut list = Vec::new();
            for dep in raw.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                if known.contains(dep) {
                    list.push(dep.to_string());
                } else {
                    warn!(
                        service = %status.name,
                        dependency = dep,
                        "dropping dangling dependency reference"
                    );
                }
            }
            if !list.is_empty() {
                deps.insert(status.name.clone(), list);
            }
        }
        Self { deps }
    }

    pub fn direct_deps(&self, service: &str) -> &[String] {
        self.deps.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All services that transitively depend on `service`.
    pub fn dependents(&self, service: &str) -> HashSet<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (svc, deps) in &self.deps {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().push(svc.as_str());
            }
        }

        let mut out = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(service);
        while let Some(current) = queue.pop_front() {
            for parent in reverse.get(current).into_iter().flatten() {
                if out.insert((*parent).to_string()) {
                    queue.push_back(parent);
                }
            }
        }
        out
    }
}

// ─── Inhibition ───────────────────────────────────────────────────────────────

/// Alerts split by the dependency-inhibition pass.
#[derive(Debug, Clone)]
pub struct InhibitOutcome {
    pub kept: Vec<Alert>,
    pub inhibited: Vec<Alert>,
}

/// Suppress alerts on services whose trouble is already explained by a down
/// dependency that alerts in the same cycle. A down dependent keeps its own
/// alert: the fault is local.
pub fn inhibit(
    statuses: &[ServiceStatus],
    alerts: Vec<Alert>,
    graph: &DependencyGraph,
) -> InhibitOutcome {
    let down: HashSet<&str> = statuses
        .iter()
        .filter(|s| s.state != ContainerState::Running)
        .map(|s| s.name.as_str())
        .collect();
    let alerted: HashSet<&str> = alerts.iter().map(|a| a.service.as_str()).collect();

    let mut inhibit_set: HashSet<String> = HashSet::new();
    for d in &down {
        if !alerted.contains(d) {
            continue;
        }
        for dependent in graph.dependents(d) {
            if !down.contains(dependent.as_str()) {
                inhibit_set.insert(dependent);
            }
        }
    }

    let mut kept = Vec::new();
    let mut inhibited = Vec::new();
    for alert in alerts {
        if inhibit_set.contains(&alert.service) {
            debug!(service = %alert.service, title = %alert.title, "alert inhibited by down dependency");
            inhibited.push(alert);
        } else {
            kept.push(alert);
        }
    }
    InhibitOutcome { kept, inhibited }
}

// ─── Group health ─────────────────────────────────────────────────────────────

/// Health of one labeled group and its member names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub health: HealthState,
    pub members: Vec<String>,
}

fn member_health(status: &ServiceStatus) -> HealthState {
    if status.state.is_terminal_bad() {
        return HealthState::Critical;
    }
    let degraded = status.state != ContainerState::Running
        || status.healthcheck_ok == Some(false)
        || status.restart_count > 0
        || status.error_count > 5;
    if degraded {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Bucket statuses by the `dozor.group` label; group health is the worst
/// member health.
pub fn group_statuses(statuses: &[ServiceStatus]) -> BTreeMap<String, GroupStatus> {
    let mut groups: BTreeMap<String, GroupStatus> = BTreeMap::new();
    for status in statuses {
        let Some(group) = status.labels.get(labels::GROUP) else {
            continue;
        };
        let entry = groups.entry(group.clone()).or_insert(GroupStatus {
            health: HealthState::Healthy,
            members: Vec::new(),
        });
        entry.members.push(status.name.clone());
        entry.health = entry.health.max(member_health(status));
    }
    groups
}

/// Group-level alerts for groups that are degraded or worse.
pub fn group_alerts(statuses: &[ServiceStatus]) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for (name, group) in group_statuses(statuses) {
        let level = match group.health {
            HealthState::Critical => AlertLevel::Critical,
            HealthState::Degraded => AlertLevel::Error,
            _ => continue,
        };
        alerts.push(Alert::new(
            level,
            format!("group:{name}"),
            format!("group {}", group.health),
            format!("members: {}", group.members.join(", ")),
            "check the unhealthy members listed in the report",
        ));
    }
    alerts
}

// ─── Failure tracker ──────────────────────────────────────────────────────────

/// Requires `threshold` consecutive failures per key before confirming; any
/// success resets the key to zero. Shared across tasks behind a mutex.
pub struct FailureTracker {
    threshold: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failure. True once the consecutive count reaches the
    /// threshold (and on every failure after that until a success resets).
    pub fn record_failure(&self, key: &str) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count >= self.threshold
    }

    /// Record a success, resetting the consecutive-failure count.
    pub fn record_success(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    pub fn count(&self, key: &str) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}

// ─── Flap detector ────────────────────────────────────────────────────────────

/// Minimum rolling-window size.
pub const FLAP_WINDOW_MIN: usize = 5;

#[derive(Debug, Default)]
struct FlapWindow {
    samples: VecDeque<bool>,
    flapping: bool,
}

/// Rolling-window flap detection per key with high/low hysteresis.
///
/// The state-change rate is `transitions / (samples − 1)`. A key enters the
/// flapping state at `rate ≥ high_pct` and leaves it at `rate ≤ low_pct`;
/// with fewer than 3 samples the prior state is retained.
pub struct FlapDetector {
    window: usize,
    high_pct: f64,
    low_pct: f64,
    state: Mutex<HashMap<String, FlapWindow>>,
}

impl FlapDetector {
    pub fn new(window: usize, high_pct: f64, low_pct: f64) -> Self {
        Self {
            window: window.max(FLAP_WINDOW_MIN),
            high_pct,
            low_pct,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record one healthy/unhealthy sample and return whether the key is
    /// flapping after this sample.
    pub fn record(&self, key: &str, healthy: bool) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(key.to_string()).or_default();

        entry.samples.push_back(healthy);
        while entry.samples.len() > self.window {
            entry.samples.pop_front();
        }

        if entry.samples.len() < 3 {
            return entry.flapping;
        }

        let transitions = entry
            .samples
            .iter()
            .zip(entry.samples.iter().skip(1))
            .filter(|(a, b)| a != b)
            .count();
        let rate = transitions as f64 / (entry.samples.len() - 1) as f64;

        if !entry.flapping && rate >= self.high_pct {
            entry.flapping = true;
        } else if entry.flapping && rate <= self.low_pct {
            entry.flapping = false;
        }
        entry.flapping
    }

    pub fn is_flapping(&self, key: &str) -> bool {
        self.state
            .lock()
            .get(key)
            .map(|w| w.flapping)
            .unwrap_or(false)
    }
}

// ─── Dedup ────────────────────────────────────────────────────────────────────

/// Hash of an alert set: sorted dedup keys, newline-joined, SHA-256 hex.
/// Two cycles with the same (level, service, title) multiset hash equal.
pub fn alerts_hash(alerts: &[Alert]) -> String {
    let mut keys: Vec<String> = alerts.iter().map(Alert::dedup_key).collect();
    keys.sort();
    let mut hasher = Sha256::new();
    hasher.update(keys.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Cycle-to-cycle dedup gate with forced re-emission after `repeat_after`.
pub struct DedupGate {
    repeat_after: Duration,
    last: Mutex<Option<(String, Instant)>>,
}

impl DedupGate {
    pub fn new(repeat_after: Duration) -> Self {
        Self {
            repeat_after,
            last: Mutex::new(None),
        }
    }

    /// True when this hash should be emitted: it differs from the previous
    /// cycle, or the repeat timer on an identical hash has elapsed.
    pub fn should_emit(&self, hash: &str) -> bool {
        let mut last = self.last.lock();
        match last.as_ref() {
            Some((prev, at)) if prev == hash && at.elapsed() < self.repeat_after => false,
            _ => {
                *last = Some((hash.to_string(), Instant::now()));
                true
            }
        }
    }

    /// Forget the stored hash, e.g. after a healthy cycle.
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
