//! Log analysis: pattern classification, error clustering, and the 24-hour
//! error timeline.
//!
//! The analyzer walks a service's fetched log window once. Every entry is
//! matched against a fixed, ordered pattern list (plus any extra pattern the
//! service declares via its `dozor.logs.pattern` label); error-class entries
//! additionally feed the cluster templates and the hourly timeline.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use dozor_proto::{AlertLevel, LogEntry};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Example lines stored on an issue are capped at this many chars.
const EXAMPLE_CAP: usize = 200;
/// Cluster templates are capped at this many chars.
const TEMPLATE_CAP: usize = 120;
/// Number of clusters reported.
const TOP_CLUSTERS: usize = 5;
/// Histogram bar width at the busiest hour.
const MAX_BAR_WIDTH: usize = 30;

// ─── Entry classification ─────────────────────────────────────────────────────

/// Coarse log-line class used for counting and clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Error,
    Warning,
    Other,
}

/// Classify one raw line. ERROR/FATAL/CRITICAL/PANIC count as errors.
pub fn classify_line(line: &str) -> LineClass {
    // Compiled once per thread on first use.
    thread_local! {
        static ERROR_RE: Regex =
            Regex::new(r"(?i)\b(error|err|fatal|critical|panic)\b").unwrap();
        static WARN_RE: Regex = Regex::new(r"(?i)\b(warn|warning)\b").unwrap();
    }
    if ERROR_RE.with(|re| re.is_match(line)) {
        LineClass::Error
    } else if WARN_RE.with(|re| re.is_match(line)) {
        LineClass::Warning
    } else {
        LineClass::Other
    }
}

/// The most recent error-class entries, newest last, capped at `limit`.
pub fn recent_error_entries(entries: &[LogEntry], limit: usize) -> Vec<LogEntry> {
    let errors: Vec<&LogEntry> = entries
        .iter()
        .filter(|e| classify_line(&e.line) == LineClass::Error)
        .collect();
    errors
        .iter()
        .skip(errors.len().saturating_sub(limit))
        .map(|e| (*e).clone())
        .collect()
}

// ─── Patterns and issues ──────────────────────────────────────────────────────

/// One compiled classification rule.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub regex: Regex,
    pub level: AlertLevel,
    pub category: String,
    pub description: String,
    pub action: String,
    /// When set, the rule only applies to these services.
    pub services: Option<Vec<String>>,
}

impl ErrorPattern {
    fn applies_to(&self, service: &str) -> bool {
        match &self.services {
            Some(list) => list.iter().any(|s| s == service),
            None => true,
        }
    }
}

/// A pattern match summary for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub level: AlertLevel,
    pub category: String,
    pub description: String,
    pub action: String,
    pub count: u32,
    /// First matching line, capped at 200 chars.
    pub example: String,
}

impl Issue {
    /// Counting key for this issue shape.
    pub fn key(&self) -> String {
        format!("{}:{}", self.category, self.description)
    }
}

/// The built-in classification rules, in report order.
pub fn builtin_patterns() -> Vec<ErrorPattern> {
    let table: &[(&str, AlertLevel, &str, &str, &str)] = &[
        (
            r"(?i)\b(out of memory|oom[- ]?kill(ed)?)\b",
            AlertLevel::Critical,
            "memory",
            "out-of-memory kill",
            "raise the memory limit or find the leak",
        ),
        (
            r"(?i)(no space left on device|disk (is )?full)",
            AlertLevel::Critical,
            "disk",
            "filesystem full",
            "prune images, volumes and rotated logs",
        ),
        (
            r"(?i)(segmentation fault|sigsegv)",
            AlertLevel::Critical,
            "runtime",
            "segmentation fault",
            "inspect the crash and roll back the last deploy",
        ),
        (
            r"(?i)panic(:|\b)",
            AlertLevel::Error,
            "runtime",
            "panic in service",
            "read the stack trace at the panic site",
        ),
        (
            r"(?i)connection refused",
            AlertLevel::Error,
            "network",
            "connection refused",
            "check that the target service is up and listening",
        ),
        (
            r"(?i)\b(connection reset|broken pipe)\b",
            AlertLevel::Error,
            "network",
            "connection dropped",
            "check upstream stability and keepalive settings",
        ),
        (
            r"(?i)permission denied",
            AlertLevel::Error,
            "permissions",
            "permission denied",
            "check file ownership and volume mounts",
        ),
        (
            r"(?i)(unauthorized|401\b|invalid (api[- ]?key|token|credentials))",
            AlertLevel::Error,
            "auth",
            "authentication failure",
            "rotate or fix the credentials in the environment",
        ),
        (
            r"(?i)(certificate (has )?expired|x509|tls handshake (error|failure))",
            AlertLevel::Error,
            "tls",
            "TLS or certificate problem",
            "renew the certificate and reload the service",
        ),
        (
            r"(?i)(database .{0,40}(down|unavailable)|too many connections|deadlock)",
            AlertLevel::Error,
            "database",
            "database trouble",
            "check the database service and its connection pool",
        ),
        (
            r"(?i)\b(no such host|name resolution|dns (error|failure))\b",
            AlertLevel::Error,
            "dns",
            "DNS resolution failure",
            "check the resolver and the service's network",
        ),
        (
            r"(?i)\b(timeout|timed out)\b",
            AlertLevel::Warning,
            "network",
            "operation timed out",
            "check upstream latency and timeouts",
        ),
        (
            r"(?i)\b5\d\d\b.{0,40}\b(error|status)|status(=| )5\d\d",
            AlertLevel::Warning,
            "http",
            "upstream 5xx responses",
            "inspect the upstream service logs",
        ),
    ];

    table
        .iter()
        .map(|(re, level, cat, desc, action)| ErrorPattern {
            regex: Regex::new(re).expect("builtin pattern must compile"),
            level: *level,
            category: (*cat).to_string(),
            description: (*desc).to_string(),
            action: (*action).to_string(),
            services: None,
        })
        .collect()
}

// ─── Clusters ─────────────────────────────────────────────────────────────────

/// A group of error lines sharing one normalized template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCluster {
    pub template: String,
    pub count: u32,
    pub example: String,
}

/// Normalize an error message into its cluster template.
///
/// Strips ISO-like timestamps, then substitutes volatile tokens:
/// IPv4 (with optional port) → `<IP>`, UUIDs → `<UUID>`, `0x…` hex literals
/// of 4+ digits → `<HEX>`, integers of 2+ digits → `<N>`. The result is
/// whitespace-collapsed, trimmed, and capped at 120 chars. Idempotent.
pub fn normalize_message(msg: &str) -> String {
    thread_local! {
        static TS_RE: Regex = Regex::new(
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        )
        .unwrap();
        static UUID_RE: Regex = Regex::new(
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        )
        .unwrap();
        static IP_RE: Regex =
            Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b").unwrap();
        static HEX_RE: Regex = Regex::new(r"0x[0-9a-fA-F]{4,}\b").unwrap();
        static INT_RE: Regex = Regex::new(r"\b\d{2,}\b").unwrap();
        static WS_RE: Regex = Regex::new(r"\s+").unwrap();
    }

    let s = TS_RE.with(|re| re.replace_all(msg, "").into_owned());
    let s = UUID_RE.with(|re| re.replace_all(&s, "<UUID>").into_owned());
    let s = IP_RE.with(|re| re.replace_all(&s, "<IP>").into_owned());
    let s = HEX_RE.with(|re| re.replace_all(&s, "<HEX>").into_owned());
    let s = INT_RE.with(|re| re.replace_all(&s, "<N>").into_owned());
    let s = WS_RE.with(|re| re.replace_all(&s, " ").into_owned());
    let capped: String = s.trim().chars().take(TEMPLATE_CAP).collect();
    // The cap can leave a trailing space; trim again so the result is stable
    // under re-normalization.
    capped.trim_end().to_string()
}

/// Cluster error-class entries by normalized template, top 5 by count.
pub fn cluster_errors(entries: &[LogEntry]) -> Vec<ErrorCluster> {
    // Preserve first-seen order for deterministic tie-breaks.
    let mut order: Vec<String> = Vec::new();
    let mut counts: std::collections::HashMap<String, (u32, String)> =
        std::collections::HashMap::new();

    for entry in entries {
        if classify_line(&entry.line) != LineClass::Error {
            continue;
        }
        let template = normalize_message(&entry.line);
        if template.is_empty() {
            continue;
        }
        match counts.get_mut(&template) {
            Some((count, _)) => *count += 1,
            None => {
                order.push(template.clone());
                counts.insert(template, (1, cap_chars(&entry.line, EXAMPLE_CAP)));
            }
        }
    }

    let mut clusters: Vec<ErrorCluster> = order
        .into_iter()
        .map(|template| {
            let (count, example) = counts.remove(&template).unwrap_or((0, String::new()));
            ErrorCluster {
                template,
                count,
                example,
            }
        })
        .collect();
    clusters.sort_by(|a, b| b.count.cmp(&a.count));
    clusters.truncate(TOP_CLUSTERS);
    clusters
}

fn cap_chars(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}

// ─── Timeline ─────────────────────────────────────────────────────────────────

/// 24 hourly buckets of error-class entries; index 23 is the current hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub buckets: [u32; 24],
}

impl Timeline {
    /// Bucket error-class entries from the last 24 h relative to `now`.
    pub fn build(entries: &[LogEntry], now: DateTime<Utc>) -> Self {
        let mut buckets = [0u32; 24];
        for entry in entries {
            if classify_line(&entry.line) != LineClass::Error {
                continue;
            }
            let Some(ts) = entry.timestamp else { continue };
            let age = now.signed_duration_since(ts);
            if age < chrono::Duration::zero() {
                continue;
            }
            let age_hours = age.num_hours();
            if age_hours >= 24 {
                continue;
            }
            buckets[23 - age_hours as usize] += 1;
        }
        Self { buckets }
    }

    pub fn total(&self) -> u32 {
        self.buckets.iter().sum()
    }

    /// ASCII histogram, bars scaled to the busiest bucket (30 chars max).
    /// Empty when no errors landed in the window.
    pub fn render(&self) -> String {
        let max = self.buckets.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return String::new();
        }
        let mut out = String::from("Error timeline (last 24h):\n");
        for (i, count) in self.buckets.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let width =
                ((*count as usize * MAX_BAR_WIDTH) / max as usize).max(1);
            let hours_ago = 23 - i;
            out.push_str(&format!(
                "  -{:>2}h {} {}\n",
                hours_ago,
                "#".repeat(width),
                count
            ));
        }
        out
    }
}

// ─── Analyzer ─────────────────────────────────────────────────────────────────

/// Full analysis of one service's log window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReport {
    pub issues: Vec<Issue>,
    pub error_count: u32,
    pub warning_count: u32,
    pub clusters: Vec<ErrorCluster>,
    pub timeline: Timeline,
}

/// Pattern-driven log analyzer. Construct once, reuse across cycles.
pub struct LogAnalyzer {
    patterns: Vec<ErrorPattern>,
}

impl LogAnalyzer {
    pub fn new() -> Self {
        Self {
            patterns: builtin_patterns(),
        }
    }

    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self { patterns }
    }

    /// Analyze one service's entries, optionally with the extra pattern from
    /// its `dozor.logs.pattern` label. A label pattern that fails to compile
    /// is logged and skipped.
    pub fn analyze(
        &self,
        service: &str,
        entries: &[LogEntry],
        extra_pattern: Option<&str>,
        now: DateTime<Utc>,
    ) -> LogReport {
        let extra = extra_pattern.and_then(|raw| match Regex::new(raw) {
            Ok(regex) => Some(ErrorPattern {
                regex,
                level: AlertLevel::Warning,
                category: "custom".to_string(),
                description: format!("label pattern matched: {raw}"),
                action: "inspect the matching lines".to_string(),
                services: Some(vec![service.to_string()]),
            }),
            Err(e) => {
                warn!(service, pattern = raw, error = %e, "invalid label log pattern");
                None
            }
        });

        let mut issues: Vec<Issue> = Vec::new();
        let mut error_count = 0u32;
        let mut warning_count = 0u32;

        let all_patterns: Vec<&ErrorPattern> =
            self.patterns.iter().chain(extra.as_ref()).collect();
        // One issue slot per declared pattern, in declaration order.
        let mut slots: Vec<Option<Issue>> = vec![None; all_patterns.len()];

        for entry in entries {
            match classify_line(&entry.line) {
                LineClass::Error => error_count += 1,
                LineClass::Warning => warning_count += 1,
                LineClass::Other => {}
            }
            for (idx, pattern) in all_patterns.iter().enumerate() {
                if !pattern.applies_to(service) || !pattern.regex.is_match(&entry.line) {
                    continue;
                }
                match &mut slots[idx] {
                    Some(issue) => issue.count += 1,
                    None => {
                        slots[idx] = Some(Issue {
                            level: pattern.level,
                            category: pattern.category.clone(),
                            description: pattern.description.clone(),
                            action: pattern.action.clone(),
                            count: 1,
                            example: cap_chars(&entry.line, EXAMPLE_CAP),
                        });
                    }
                }
            }
        }
        issues.extend(slots.into_iter().flatten());

        LogReport {
            issues,
            error_count,
            warning_count,
            clusters: cluster_errors(entries),
            timeline: Timeline::build(entries, now),
        }
    }
}

impl Default for LogAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
