//! Options binding for the dozor engine.
//!
//! Every option is optional and carries a default. Values are read from
//! `DOZOR_*` environment variables; malformed entries are logged and fall
//! back to the default rather than aborting startup.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bad duration {0:?}: expected forms like 30s, 5m, 1h")]
    BadDuration(String),
}

// ─── Parsed list entries ──────────────────────────────────────────────────────

/// One `name[:port]` user-service entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserService {
    pub name: String,
    pub port: Option<u16>,
}

/// One `owner/repo[:binary]` tracked-binary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedBinary {
    pub owner: String,
    pub repo: String,
    pub binary: Option<String>,
}

impl TrackedBinary {
    /// Binary name, defaulting to the repository name.
    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or(&self.repo)
    }
}

/// One `name=url` MCP server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub url: String,
}

// ─── Options ──────────────────────────────────────────────────────────────────

/// The full recognized option set. Defaults match a single-host deployment
/// watching the local container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// `local` for direct execution, `user@host` for a remote shell.
    pub host: String,
    pub ssh_port: u16,
    /// Project directory for container-orchestrator commands.
    pub compose_path: Option<String>,
    /// Explicit monitored set; overrides discovery when non-empty.
    pub services: Vec<String>,
    /// Command execution deadline.
    pub timeout: Duration,
    /// Cadence of the triage tick.
    pub watch_interval: Duration,
    pub webhook_url: Option<String>,

    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_warn_threshold: u32,
    pub disk_crit_threshold: u32,
    pub error_threshold: u32,
    pub restart_threshold: u32,

    /// Default log window. Clamped to [1, 10_000] at the fetch site.
    pub log_lines: u32,

    pub remote_host: Option<String>,
    pub remote_url: Option<String>,
    pub remote_services: Vec<String>,
    pub remote_interval: Duration,

    pub systemd_services: Vec<String>,
    pub required_auth_vars: Vec<String>,
    pub user_services: Vec<UserService>,
    pub tracked_binaries: Vec<TrackedBinary>,
    pub mcp_servers: Vec<McpServer>,

    /// Per-service reasons for known benign WARNING/ERROR conditions.
    pub suppress_warnings: HashMap<String, String>,

    /// FailureTracker threshold: consecutive cycles before an alert fires.
    pub alert_confirm_count: u32,
    pub flap_window: usize,
    pub flap_high_pct: f64,
    pub flap_low_pct: f64,

    /// Re-emit an unchanged alert set after this long.
    pub repeat_after: Duration,

    /// Initial dev-mode exclusions, `service=duration` entries.
    pub dev_exclusions: HashMap<String, Duration>,

    pub llm_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub max_tool_iterations: u32,
    pub max_tool_result_len: usize,
    pub max_repeat_fails: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "local".to_string(),
            ssh_port: 22,
            compose_path: None,
            services: Vec::new(),
            timeout: Duration::from_secs(30),
            watch_interval: Duration::from_secs(300),
            webhook_url: None,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_warn_threshold: 80,
            disk_crit_threshold: 90,
            error_threshold: 10,
            restart_threshold: 3,
            log_lines: 100,
            remote_host: None,
            remote_url: None,
            remote_services: Vec::new(),
            remote_interval: Duration::from_secs(60),
            systemd_services: Vec::new(),
            required_auth_vars: Vec::new(),
            user_services: Vec::new(),
            tracked_binaries: Vec::new(),
            mcp_servers: Vec::new(),
            suppress_warnings: HashMap::new(),
            alert_confirm_count: 1,
            flap_window: 10,
            flap_high_pct: 0.5,
            flap_low_pct: 0.25,
            repeat_after: Duration::from_secs(3600),
            dev_exclusions: HashMap::new(),
            llm_url: None,
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            max_tool_iterations: 10,
            max_tool_result_len: 4000,
            max_repeat_fails: 2,
        }
    }
}

impl Options {
    /// Bind options from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Bind options from an arbitrary lookup, used by tests.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(v) = get("DOZOR_HOST") {
            opts.host = v;
        }
        set_parsed(&mut opts.ssh_port, get("DOZOR_SSH_PORT"), "DOZOR_SSH_PORT");
        opts.compose_path = get("DOZOR_COMPOSE_PATH").filter(|v| !v.trim().is_empty());
        if let Some(v) = get("DOZOR_SERVICES") {
            opts.services = parse_name_list(&v);
        }
        set_duration(&mut opts.timeout, get("DOZOR_TIMEOUT"), "DOZOR_TIMEOUT");
        set_duration(
            &mut opts.watch_interval,
            get("DOZOR_WATCH_INTERVAL"),
            "DOZOR_WATCH_INTERVAL",
        );
        opts.webhook_url = get("DOZOR_WEBHOOK_URL").filter(|v| !v.trim().is_empty());

        set_parsed(
            &mut opts.cpu_threshold,
            get("DOZOR_CPU_THRESHOLD"),
            "DOZOR_CPU_THRESHOLD",
        );
        set_parsed(
            &mut opts.memory_threshold,
            get("DOZOR_MEMORY_THRESHOLD"),
            "DOZOR_MEMORY_THRESHOLD",
        );
        set_parsed(
            &mut opts.disk_warn_threshold,
            get("DOZOR_DISK_WARN_THRESHOLD"),
            "DOZOR_DISK_WARN_THRESHOLD",
        );
        set_parsed(
            &mut opts.disk_crit_threshold,
            get("DOZOR_DISK_CRIT_THRESHOLD"),
            "DOZOR_DISK_CRIT_THRESHOLD",
        );
        set_parsed(
            &mut opts.error_threshold,
            get("DOZOR_ERROR_THRESHOLD"),
            "DOZOR_ERROR_THRESHOLD",
        );
        set_parsed(
            &mut opts.restart_threshold,
            get("DOZOR_RESTART_THRESHOLD"),
            "DOZOR_RESTART_THRESHOLD",
        );
        set_parsed(&mut opts.log_lines, get("DOZOR_LOG_LINES"), "DOZOR_LOG_LINES");

        opts.remote_host = get("DOZOR_REMOTE_HOST").filter(|v| !v.trim().is_empty());
        opts.remote_url = get("DOZOR_REMOTE_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = get("DOZOR_REMOTE_SERVICES") {
            opts.remote_services = parse_name_list(&v);
        }
        set_duration(
            &mut opts.remote_interval,
            get("DOZOR_REMOTE_INTERVAL"),
            "DOZOR_REMOTE_INTERVAL",
        );

        if let Some(v) = get("DOZOR_SYSTEMD_SERVICES") {
            opts.systemd_services = parse_name_list(&v);
        }
        if let Some(v) = get("DOZOR_REQUIRED_AUTH_VARS") {
            opts.required_auth_vars = parse_name_list(&v);
        }
        if let Some(v) = get("DOZOR_USER_SERVICES") {
            opts.user_services = parse_user_services(&v);
        }
        if let Some(v) = get("DOZOR_TRACKED_BINARIES") {
            opts.tracked_binaries = parse_tracked_binaries(&v);
        }
        if let Some(v) = get("DOZOR_MCP_SERVERS") {
            opts.mcp_servers = parse_mcp_servers(&v);
        }
        if let Some(v) = get("DOZOR_SUPPRESS_WARNINGS") {
            opts.suppress_warnings = parse_pair_map(&v, "DOZOR_SUPPRESS_WARNINGS");
        }

        set_parsed(
            &mut opts.alert_confirm_count,
            get("DOZOR_ALERT_CONFIRM_COUNT"),
            "DOZOR_ALERT_CONFIRM_COUNT",
        );
        set_parsed(&mut opts.flap_window, get("DOZOR_FLAP_WINDOW"), "DOZOR_FLAP_WINDOW");
        set_parsed(&mut opts.flap_high_pct, get("DOZOR_FLAP_HIGH"), "DOZOR_FLAP_HIGH");
        set_parsed(&mut opts.flap_low_pct, get("DOZOR_FLAP_LOW"), "DOZOR_FLAP_LOW");
        set_duration(
            &mut opts.repeat_after,
            get("DOZOR_REPEAT_AFTER"),
            "DOZOR_REPEAT_AFTER",
        );
        if let Some(v) = get("DOZOR_DEV_EXCLUSIONS") {
            opts.dev_exclusions = parse_exclusions(&v);
        }

        opts.llm_url = get("DOZOR_LLM_URL").filter(|v| !v.trim().is_empty());
        opts.llm_api_key = get("DOZOR_LLM_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .filter(|v| !v.trim().is_empty());
        if let Some(v) = get("DOZOR_LLM_MODEL") {
            if !v.trim().is_empty() {
                opts.llm_model = v.trim().to_string();
            }
        }
        set_parsed(
            &mut opts.max_tool_iterations,
            get("DOZOR_MAX_TOOL_ITERATIONS"),
            "DOZOR_MAX_TOOL_ITERATIONS",
        );
        set_parsed(
            &mut opts.max_tool_result_len,
            get("DOZOR_MAX_TOOL_RESULT_LEN"),
            "DOZOR_MAX_TOOL_RESULT_LEN",
        );
        set_parsed(
            &mut opts.max_repeat_fails,
            get("DOZOR_MAX_REPEAT_FAILS"),
            "DOZOR_MAX_REPEAT_FAILS",
        );

        opts
    }

    /// Whether the remote watch path is configured at all.
    pub fn remote_watch_enabled(&self) -> bool {
        self.remote_url.is_some() || self.remote_host.is_some()
    }
}

// ─── Field helpers ────────────────────────────────────────────────────────────

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: Option<String>, key: &str) {
    if let Some(raw) = value {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable option"),
        }
    }
}

fn set_duration(slot: &mut Duration, value: Option<String>, key: &str) {
    if let Some(raw) = value {
        match parse_duration(&raw) {
            Ok(d) => *slot = d,
            Err(e) => warn!(key, error = %e, "ignoring unparseable duration"),
        }
    }
}

// ─── List parsers ─────────────────────────────────────────────────────────────

/// Comma-separated names, trimmed, empties dropped.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `name[:port]` comma-separated entries.
pub fn parse_user_services(raw: &str) -> Vec<UserService> {
    let mut out = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once(':') {
            Some((name, port)) => match port.trim().parse::<u16>() {
                Ok(p) => out.push(UserService {
                    name: name.trim().to_string(),
                    port: Some(p),
                }),
                Err(_) => warn!(entry = item, "ignoring user service with bad port"),
            },
            None => out.push(UserService {
                name: item.to_string(),
                port: None,
            }),
        }
    }
    out
}

/// `owner/repo[:binary]` comma-separated entries.
pub fn parse_tracked_binaries(raw: &str) -> Vec<TrackedBinary> {
    let mut out = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (repo_part, binary) = match item.split_once(':') {
            Some((r, b)) => (r.trim(), Some(b.trim().to_string())),
            None => (item, None),
        };
        match repo_part.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
                out.push(TrackedBinary {
                    owner: owner.trim().to_string(),
                    repo: repo.trim().to_string(),
                    binary: binary.filter(|b| !b.is_empty()),
                });
            }
            _ => warn!(entry = item, "ignoring tracked binary without owner/repo"),
        }
    }
    out
}

/// `name=url` comma-separated entries.
pub fn parse_mcp_servers(raw: &str) -> Vec<McpServer> {
    let mut out = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                out.push(McpServer {
                    name: name.trim().to_string(),
                    url: url.trim().to_string(),
                });
            }
            _ => warn!(entry = item, "ignoring MCP server entry without name=url"),
        }
    }
    out
}

/// `key=value` comma-separated entries into a map.
pub fn parse_pair_map(raw: &str, key: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                out.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => warn!(key, entry = item, "ignoring entry without key=value"),
        }
    }
    out
}

/// `service=duration` comma-separated dev-mode exclusions.
pub fn parse_exclusions(raw: &str) -> HashMap<String, Duration> {
    let mut out = HashMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((svc, dur)) if !svc.trim().is_empty() => match parse_duration(dur) {
                Ok(d) => {
                    out.insert(svc.trim().to_string(), d);
                }
                Err(e) => warn!(entry = item, error = %e, "ignoring exclusion"),
            },
            _ => warn!(entry = item, "ignoring exclusion without service=duration"),
        }
    }
    out
}

/// Parse `30s` / `5m` / `2h` / `1d`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ConfigError::BadDuration(raw.to_string()));
    }
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num
        .parse()
        .map_err(|_| ConfigError::BadDuration(raw.to_string()))?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => n,
        "m" | "min" | "mins" => n * 60,
        "h" | "hr" | "hrs" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(ConfigError::BadDuration(raw.to_string())),
    };
    Ok(Duration::from_secs(secs))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
