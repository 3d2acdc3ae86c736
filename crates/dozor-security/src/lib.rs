//! System-level security audit checks.
//!
//! Every check shells through [`Transport`], so the audit works identically
//! for the local host and a remote `user@host` target. Commands that fail or
//! are unavailable degrade to an `unknown` finding with a log record; the
//! audit itself never errors out.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use dozor_proto::AlertLevel;
use dozor_transport::{Transport, TransportResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Database ports that must not listen on a public address.
const SENSITIVE_PORTS: &[u16] = &[3306, 5432, 6379, 9200, 27017];

// ─── Findings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub check: String,
    pub severity: AlertLevel,
    pub summary: String,
    pub recommendation: String,
}

impl SecurityFinding {
    fn new(
        check: &str,
        severity: AlertLevel,
        summary: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            check: check.to_string(),
            severity,
            summary: summary.into(),
            recommendation: recommendation.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub findings: Vec<SecurityFinding>,
    pub checked_at: DateTime<Utc>,
}

impl SecurityReport {
    /// Worst severity across findings.
    pub fn worst(&self) -> AlertLevel {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(AlertLevel::Info)
    }

    /// Text block for LLM consumption.
    pub fn render(&self) -> String {
        let mut out = String::from("Security audit:\n");
        for f in &self.findings {
            out.push_str(&format!("  [{}] {}: {}\n", f.severity, f.check, f.summary));
            if f.severity > AlertLevel::Info {
                out.push_str(&format!("    Action: {}\n", f.recommendation));
            }
        }
        out
    }
}

// ─── Auditor ──────────────────────────────────────────────────────────────────

pub struct SecurityAuditor {
    transport: Arc<dyn Transport>,
    required_auth_vars: Vec<String>,
    compose_path: Option<String>,
}

impl SecurityAuditor {
    pub fn new(
        transport: Arc<dyn Transport>,
        required_auth_vars: Vec<String>,
        compose_path: Option<String>,
    ) -> Self {
        Self {
            transport,
            required_auth_vars,
            compose_path,
        }
    }

    /// Run all checks. Each check contributes exactly one finding.
    pub async fn audit(&self, cancel: &CancellationToken) -> SecurityReport {
        let mut findings = Vec::new();
        findings.push(self.check_ssh_sessions(cancel).await);
        findings.push(self.check_failed_logins(cancel).await);
        findings.push(self.check_listening_ports(cancel).await);
        findings.push(self.check_firewall(cancel).await);
        findings.push(self.check_docker_socket(cancel).await);
        if !self.required_auth_vars.is_empty() {
            findings.push(self.check_auth_vars(cancel).await);
        }
        SecurityReport {
            findings,
            checked_at: Utc::now(),
        }
    }

    async fn run(&self, check: &str, command: &str, cancel: &CancellationToken) -> Option<String> {
        match self.transport.exec(command, cancel).await {
            Ok(output) => Some(output.stdout),
            Err(e) => {
                warn!(subsystem = "security", check, error = %e, "check command failed");
                None
            }
        }
    }

    async fn check_ssh_sessions(&self, cancel: &CancellationToken) -> SecurityFinding {
        match self.run("ssh-sessions", "who", cancel).await {
            Some(output) => finding_from_sessions(&output),
            None => unknown_finding("ssh-sessions"),
        }
    }

    async fn check_failed_logins(&self, cancel: &CancellationToken) -> SecurityFinding {
        let cmd = "journalctl -u ssh -u sshd --since '24 hours ago' --no-pager 2>/dev/null \
                   | grep -ci 'failed password'";
        match self.run("failed-logins", cmd, cancel).await {
            Some(output) => finding_from_failed_logins(&output),
            None => unknown_finding("failed-logins"),
        }
    }

    async fn check_listening_ports(&self, cancel: &CancellationToken) -> SecurityFinding {
        let cmd = "ss -tln 2>/dev/null || netstat -tln 2>/dev/null";
        match self.run("listening-ports", cmd, cancel).await {
            Some(output) => finding_from_ports(&output),
            None => unknown_finding("listening-ports"),
        }
    }

    async fn check_firewall(&self, cancel: &CancellationToken) -> SecurityFinding {
        let cmd = "ufw status 2>/dev/null || echo unavailable";
        match self.run("firewall", cmd, cancel).await {
            Some(output) => finding_from_firewall(&output),
            None => unknown_finding("firewall"),
        }
    }

    async fn check_docker_socket(&self, cancel: &CancellationToken) -> SecurityFinding {
        let cmd = "stat -c %a /var/run/docker.sock 2>/dev/null || echo missing";
        match self.run("docker-socket", cmd, cancel).await {
            Some(output) => finding_from_socket_mode(&output),
            None => unknown_finding("docker-socket"),
        }
    }

    /// Presence-check required auth variables against the compose config.
    async fn check_auth_vars(&self, cancel: &CancellationToken) -> SecurityFinding {
        let cmd = match &self.compose_path {
            Some(path) => format!(
                "cd {path} && docker compose config 2>/dev/null || cat .env 2>/dev/null"
            ),
            None => "docker compose config 2>/dev/null || cat .env 2>/dev/null".to_string(),
        };
        match self.run("auth-vars", &cmd, cancel).await {
            Some(output) => finding_from_auth_vars(&output, &self.required_auth_vars),
            None => unknown_finding("auth-vars"),
        }
    }
}

fn unknown_finding(check: &str) -> SecurityFinding {
    SecurityFinding::new(
        check,
        AlertLevel::Info,
        "check unavailable on this host",
        "none",
    )
}

// ─── Check parsers ────────────────────────────────────────────────────────────

pub fn finding_from_sessions(who_output: &str) -> SecurityFinding {
    let sessions: Vec<&str> = who_output.lines().filter(|l| !l.trim().is_empty()).collect();
    let users: Vec<&str> = sessions
        .iter()
        .filter_map(|l| l.split_whitespace().next())
        .collect();
    SecurityFinding::new(
        "ssh-sessions",
        AlertLevel::Info,
        if sessions.is_empty() {
            "no active login sessions".to_string()
        } else {
            format!("{} active session(s): {}", sessions.len(), users.join(", "))
        },
        "none",
    )
}

pub fn finding_from_failed_logins(grep_count_output: &str) -> SecurityFinding {
    let count: u32 = grep_count_output.trim().parse().unwrap_or(0);
    let severity = if count >= 100 {
        AlertLevel::Error
    } else if count >= 10 {
        AlertLevel::Warning
    } else {
        AlertLevel::Info
    };
    SecurityFinding::new(
        "failed-logins",
        severity,
        format!("{count} failed SSH logins in the last 24h"),
        "consider fail2ban or tightening sshd access",
    )
}

/// Parse `ss -tln` / `netstat -tln` local addresses into (address, port).
pub fn parse_listening_ports(output: &str) -> Vec<(String, u16)> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // ss: State Recv-Q Send-Q Local-Address:Port …; netstat has it at 3.
        for field in fields.iter().take(5) {
            let Some((addr, port)) = field.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else { continue };
            if addr.is_empty() {
                continue;
            }
            ports.push((addr.to_string(), port));
            break;
        }
    }
    ports
}

fn is_public(addr: &str) -> bool {
    matches!(addr, "0.0.0.0" | "*" | "::" | "[::]")
}

pub fn finding_from_ports(output: &str) -> SecurityFinding {
    let ports = parse_listening_ports(output);
    let public: Vec<u16> = ports
        .iter()
        .filter(|(addr, _)| is_public(addr))
        .map(|(_, port)| *port)
        .collect();
    let exposed: Vec<u16> = public
        .iter()
        .copied()
        .filter(|p| SENSITIVE_PORTS.contains(p))
        .collect();

    if !exposed.is_empty() {
        SecurityFinding::new(
            "listening-ports",
            AlertLevel::Error,
            format!(
                "database port(s) listening publicly: {}",
                exposed
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            "bind them to localhost or firewall them off",
        )
    } else {
        SecurityFinding::new(
            "listening-ports",
            AlertLevel::Info,
            format!("{} listening socket(s), {} public", ports.len(), public.len()),
            "none",
        )
    }
}

pub fn finding_from_firewall(output: &str) -> SecurityFinding {
    let lower = output.to_lowercase();
    if lower.contains("status: active") {
        SecurityFinding::new("firewall", AlertLevel::Info, "ufw active", "none")
    } else if lower.contains("status: inactive") {
        SecurityFinding::new(
            "firewall",
            AlertLevel::Warning,
            "ufw installed but inactive",
            "enable ufw or confirm another firewall covers this host",
        )
    } else {
        SecurityFinding::new(
            "firewall",
            AlertLevel::Info,
            "no ufw status available",
            "none",
        )
    }
}

pub fn finding_from_socket_mode(output: &str) -> SecurityFinding {
    let mode = output.trim();
    if mode == "missing" || mode.is_empty() {
        return SecurityFinding::new(
            "docker-socket",
            AlertLevel::Info,
            "docker socket not present",
            "none",
        );
    }
    let world_accessible = mode
        .chars()
        .last()
        .map(|c| matches!(c, '2' | '3' | '6' | '7'))
        .unwrap_or(false);
    if world_accessible {
        SecurityFinding::new(
            "docker-socket",
            AlertLevel::Error,
            format!("docker socket is world-writable (mode {mode})"),
            "chmod the socket back to 660 and audit who changed it",
        )
    } else {
        SecurityFinding::new(
            "docker-socket",
            AlertLevel::Info,
            format!("docker socket mode {mode}"),
            "none",
        )
    }
}

pub fn finding_from_auth_vars(config_output: &str, required: &[String]) -> SecurityFinding {
    let missing: Vec<&str> = required
        .iter()
        .filter(|var| !config_output.contains(var.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        SecurityFinding::new(
            "auth-vars",
            AlertLevel::Info,
            format!("all {} required auth vars present", required.len()),
            "none",
        )
    } else {
        SecurityFinding::new(
            "auth-vars",
            AlertLevel::Error,
            format!("missing required auth vars: {}", missing.join(", ")),
            "add them to the compose environment before the next deploy",
        )
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
