//! Container discovery, status inspection, and resource enrichment over the
//! Docker Engine API.
//!
//! Inventory queries go through a 30-second TTL cache; a single event-stream
//! connection invalidates it on container lifecycle events. Transient runtime
//! errors surface as empty results with one log record so the next tick can
//! retry, and the engine can fall back to its configured service list.

#![forbid(unsafe_code)]

use bollard::container::{
    ListContainersOptions, LogOutput, LogsOptions, RestartContainerOptions, Stats, StatsOptions,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use dozor_proto::{labels, ContainerState, DiscoveredContainer, LogEntry, ServiceStatus};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inventory cache lifetime.
pub const CACHE_TTL: Duration = Duration::from_secs(30);
/// Log fetches are clamped to this window.
pub const MAX_LOG_LINES: u32 = 10_000;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("service {0:?} not found")]
    NotFound(String),
}

// ─── Service cache ────────────────────────────────────────────────────────────

/// TTL cache over the raw inventory, shared between the tick path and the
/// event listener.
pub struct ServiceCache {
    ttl: Duration,
    inner: RwLock<Option<(Instant, Vec<DiscoveredContainer>)>>,
}

impl ServiceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<Vec<DiscoveredContainer>> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some((at, list)) if at.elapsed() < self.ttl => Some(list.clone()),
            _ => None,
        }
    }

    pub fn put(&self, list: Vec<DiscoveredContainer>) {
        *self.inner.write() = Some((Instant::now(), list));
    }

    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }
}

// ─── Discovery ────────────────────────────────────────────────────────────────

/// Container inventory and per-service status collection.
pub struct Discovery {
    docker: Docker,
    cache: ServiceCache,
}

impl Discovery {
    /// Connect to the daemon named by the environment (`DOCKER_HOST` or the
    /// local socket).
    pub fn connect() -> Result<Self, DiscoveryError> {
        Ok(Self::new(Docker::connect_with_local_defaults()?))
    }

    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            cache: ServiceCache::new(CACHE_TTL),
        }
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Raw inventory, cached. Errors degrade to an empty list.
    pub async fn list(&self) -> Vec<DiscoveredContainer> {
        if let Some(cached) = self.cache.get() {
            return cached;
        }
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        match self.docker.list_containers(Some(options)).await {
            Ok(summaries) => {
                let mut list: Vec<DiscoveredContainer> = summaries
                    .into_iter()
                    .filter_map(summary_to_discovered)
                    .collect();
                list.sort_by(|a, b| a.name.cmp(&b.name));
                self.cache.put(list.clone());
                list
            }
            Err(e) => {
                warn!(subsystem = "discovery", error = %e, "container list failed");
                Vec::new()
            }
        }
    }

    /// Display names of enabled containers, in inventory order.
    pub async fn services(&self) -> Vec<String> {
        self.list()
            .await
            .into_iter()
            .filter(DiscoveredContainer::is_enabled)
            .map(|c| c.name)
            .collect()
    }

    /// Resolve `name_or_id` and build its status snapshot. Matching order:
    /// exact name, compose-service label, substring. `None` when nothing
    /// matches or the inspect call fails.
    pub async fn inspect(&self, name_or_id: &str) -> Option<ServiceStatus> {
        let list = self.list().await;
        let candidate = select_candidate(&list, name_or_id)?.clone();

        let inspected = match self
            .docker
            .inspect_container(
                &candidate.id,
                None::<bollard::container::InspectContainerOptions>,
            )
            .await
        {
            Ok(details) => details,
            Err(e) => {
                warn!(
                    subsystem = "discovery",
                    service = %candidate.name,
                    error = %e,
                    "container inspect failed"
                );
                return None;
            }
        };

        let mut status = ServiceStatus::new(candidate.name.clone(), candidate.state);
        status.id = candidate.id.clone();
        status.labels = candidate.labels.clone();

        if let Some(state) = inspected.state {
            if let Some(s) = state.status {
                status.state = ContainerState::parse(&s.to_string());
            }
            if let Some(health) = state.health {
                status.health = health
                    .status
                    .map(|h| h.to_string())
                    .unwrap_or_default();
            }
            if let Some(started) = state.started_at.as_deref() {
                status.uptime = uptime_since(started, Utc::now());
            }
        }
        status.restart_count = inspected.restart_count.unwrap_or(0).max(0) as u32;

        Some(status)
    }

    /// Restart one container by its resolved id or name.
    pub async fn restart(&self, name_or_id: &str) -> Result<(), DiscoveryError> {
        let list = self.list().await;
        let target = select_candidate(&list, name_or_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| DiscoveryError::NotFound(name_or_id.to_string()))?;
        self.docker
            .restart_container(&target, Some(RestartContainerOptions { t: 10 }))
            .await?;
        self.cache.invalidate();
        info!(subsystem = "discovery", service = name_or_id, "container restarted");
        Ok(())
    }

    /// Fetch the last `lines` log entries (clamped to [1, 10 000]).
    pub async fn fetch_logs(&self, name_or_id: &str, lines: u32) -> Vec<LogEntry> {
        let lines = lines.clamp(1, MAX_LOG_LINES);
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name_or_id, Some(options));
        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => {
                    let raw = log_output_text(&output);
                    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                        entries.push(parse_log_line(line));
                    }
                }
                Err(e) => {
                    warn!(
                        subsystem = "discovery",
                        service = name_or_id,
                        error = %e,
                        "log fetch failed"
                    );
                    break;
                }
            }
        }
        entries
    }

    /// Enrich running statuses with CPU percent and memory from one-sample
    /// stats. Fans out one task per container; results land at their input
    /// index so order is preserved.
    pub async fn enrich_resources(&self, statuses: &mut [ServiceStatus]) {
        let docker = self.docker.clone();
        let targets: Vec<(usize, String)> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ContainerState::Running && !s.id.is_empty())
            .map(|(i, s)| (i, s.id.clone()))
            .collect();

        let fetches = targets.into_iter().map(|(idx, id)| {
            let docker = docker.clone();
            async move { (idx, fetch_stats_sample(&docker, &id).await) }
        });
        // Results land at their input index, preserving report order.
        for (idx, sample) in futures_util::future::join_all(fetches).await {
            if let Some(sample) = sample {
                statuses[idx].cpu_percent = sample.cpu_percent;
                statuses[idx].memory_mb = sample.memory_mb;
                statuses[idx].memory_limit_mb = sample.memory_limit_mb;
            }
        }
    }

    /// Single-connection event listener: any container lifecycle event
    /// invalidates the inventory cache. Returns on cancellation.
    pub async fn run_event_listener(&self, cancel: CancellationToken) {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        let mut stream = self.docker.events(Some(options));

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(msg)) => {
                        debug!(
                            subsystem = "discovery",
                            action = msg.action.as_deref().unwrap_or(""),
                            "container event, invalidating cache"
                        );
                        self.cache.invalidate();
                    }
                    Some(Err(e)) => {
                        warn!(subsystem = "discovery", error = %e, "event stream error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    None => {
                        warn!(subsystem = "discovery", "event stream ended");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                _ = cancel.cancelled() => {
                    info!(subsystem = "discovery", "event listener shutting down");
                    return;
                }
            }
        }
    }
}

// ─── Mapping helpers ──────────────────────────────────────────────────────────

fn summary_to_discovered(
    summary: bollard::models::ContainerSummary,
) -> Option<DiscoveredContainer> {
    let id = summary.id.unwrap_or_default();
    if id.is_empty() {
        return None;
    }
    let label_map = summary.labels.unwrap_or_default();
    let raw_name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| clean_name(n))
        .unwrap_or_else(|| short_id(&id).to_string());
    let name = label_map.get(labels::NAME).cloned().unwrap_or(raw_name);
    Some(DiscoveredContainer {
        id: short_id(&id).to_string(),
        name,
        compose_service: label_map.get(labels::COMPOSE_SERVICE).cloned(),
        state: ContainerState::parse(summary.state.as_deref().unwrap_or("")),
        labels: label_map,
    })
}

/// Strip the runtime's leading slash from a container name.
pub fn clean_name(raw: &str) -> String {
    raw.trim_start_matches('/').to_string()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Matching order: exact name, compose-service label, substring.
pub fn select_candidate<'a>(
    list: &'a [DiscoveredContainer],
    query: &str,
) -> Option<&'a DiscoveredContainer> {
    list.iter()
        .find(|c| c.name == query || c.id == query)
        .or_else(|| {
            list.iter()
                .find(|c| c.compose_service.as_deref() == Some(query))
        })
        .or_else(|| list.iter().find(|c| c.name.contains(query)))
}

/// Parse one `docker logs --timestamps` line into a [`LogEntry`].
pub fn parse_log_line(raw: &str) -> LogEntry {
    if let Some((ts, rest)) = raw.split_once(' ') {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
            return LogEntry::new(Some(parsed.with_timezone(&Utc)), rest);
        }
    }
    LogEntry::new(None, raw)
}

fn log_output_text(output: &LogOutput) -> String {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => String::from_utf8_lossy(message).into_owned(),
    }
}

/// Human uptime since an RFC3339 start time: `3d4h`, `2h15m`, `42m`, `30s`.
pub fn uptime_since(started_at: &str, now: DateTime<Utc>) -> String {
    let Ok(started) = DateTime::parse_from_rfc3339(started_at) else {
        return String::new();
    };
    let secs = now
        .signed_duration_since(started.with_timezone(&Utc))
        .num_seconds()
        .max(0) as u64;
    format_uptime(secs)
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}

// ─── Resource sampling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct ResourceSample {
    cpu_percent: Option<f64>,
    memory_mb: Option<f64>,
    memory_limit_mb: Option<f64>,
}

async fn fetch_stats_sample(docker: &Docker, id: &str) -> Option<ResourceSample> {
    let options = StatsOptions {
        stream: false,
        one_shot: false,
    };
    let mut stream = docker.stats(id, Some(options));
    match stream.next().await {
        Some(Ok(stats)) => Some(sample_from_stats(&stats)),
        Some(Err(e)) => {
            warn!(subsystem = "discovery", container = id, error = %e, "stats fetch failed");
            None
        }
        None => None,
    }
}

fn sample_from_stats(stats: &Stats) -> ResourceSample {
    let cpu_percent = cpu_percent_from(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage,
        stats.precpu_stats.system_cpu_usage,
        stats.cpu_stats.online_cpus,
    );
    let memory_mb = stats.memory_stats.usage.map(bytes_to_mb);
    // Unlimited containers report the host total; treat that as no limit.
    let memory_limit_mb = stats
        .memory_stats
        .limit
        .filter(|limit| *limit < u64::MAX / 2)
        .map(bytes_to_mb);
    ResourceSample {
        cpu_percent,
        memory_mb,
        memory_limit_mb,
    }
}

/// The daemon's two-sample CPU formula; `None` when the deltas are unusable.
pub fn cpu_percent_from(
    total: u64,
    pre_total: u64,
    system: Option<u64>,
    pre_system: Option<u64>,
    online_cpus: Option<u64>,
) -> Option<f64> {
    let cpu_delta = total.checked_sub(pre_total)? as f64;
    let system_delta = system?.checked_sub(pre_system.unwrap_or(0))? as f64;
    if system_delta <= 0.0 {
        return None;
    }
    let cpus = online_cpus.unwrap_or(1).max(1) as f64;
    Some(cpu_delta / system_delta * cpus * 100.0)
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
