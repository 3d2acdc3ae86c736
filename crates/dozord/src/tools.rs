//! Engine-backed tools exposed to the agent loop.
//!
//! Each tool calls back into the operations engine; nothing here shells out
//! on its own. Arguments are validated at the registry boundary: a bad
//! service name or unknown mode is refused with a precise message and no
//! state change.

use async_trait::async_trait;
use dozor_agent::{optional_u64, require_str, Tool, ToolError, ToolRegistry, ValidationPredicate};
use dozor_config::parse_duration;
use dozor_discovery::Discovery;
use dozor_logscan::LogReport;
use dozor_security::SecurityAuditor;
use dozor_triage::{DevMode, TriageEngine};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Maximum log window a tool may request.
const TOOL_LOG_LINES_MAX: u64 = 10_000;

// ─── Validation predicate ─────────────────────────────────────────────────────

/// Default registry validation: any `service` argument must look like a
/// container name.
pub fn default_validator() -> ValidationPredicate {
    let name_re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$")
        .expect("service name regex must compile");
    Arc::new(move |_tool: &str, args: &Value| {
        if let Some(service) = args.get("service").and_then(Value::as_str) {
            if !name_re.is_match(service) {
                return Err(format!("bad service name {service:?}"));
            }
        }
        Ok(())
    })
}

// ─── Tools ────────────────────────────────────────────────────────────────────

/// `triage_report`: run one triage cycle and return the report text.
pub struct TriageReportTool {
    engine: Arc<TriageEngine>,
}

#[async_trait]
impl Tool for TriageReportTool {
    fn name(&self) -> &str {
        "triage_report"
    }

    fn description(&self) -> &str {
        "Run a full triage pass over the container fleet and return the report"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "services": {
                    "type": "string",
                    "description": "Optional comma-separated services to narrow the pass"
                }
            }
        })
    }

    async fn execute(&self, cancel: &CancellationToken, args: &Value) -> Result<String, ToolError> {
        let explicit = args
            .get("services")
            .and_then(Value::as_str)
            .map(dozor_config::parse_name_list)
            .filter(|list| !list.is_empty());
        let outcome = self.engine.run(explicit, Vec::new(), cancel).await;
        Ok(outcome.text)
    }
}

/// `service_status`: one service's status snapshot as JSON.
pub struct ServiceStatusTool {
    discovery: Arc<Discovery>,
}

#[async_trait]
impl Tool for ServiceStatusTool {
    fn name(&self) -> &str {
        "service_status"
    }

    fn description(&self) -> &str {
        "Inspect one service: state, restarts, health, resources, labels"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "service": {"type": "string", "description": "Service name or container id"}
            },
            "required": ["service"]
        })
    }

    async fn execute(&self, _cancel: &CancellationToken, args: &Value) -> Result<String, ToolError> {
        let service = require_str(args, "service")?;
        match self.discovery.inspect(service).await {
            Some(status) => serde_json::to_string_pretty(&status)
                .map_err(|e| ToolError::Failed(format!("encode status: {e}"))),
            None => Err(ToolError::Failed(format!("service {service:?} not found"))),
        }
    }
}

/// `service_logs`: fetch and analyze one service's log window.
pub struct ServiceLogsTool {
    discovery: Arc<Discovery>,
    analyzer: dozor_logscan::LogAnalyzer,
    default_lines: u32,
}

#[async_trait]
impl Tool for ServiceLogsTool {
    fn name(&self) -> &str {
        "service_logs"
    }

    fn description(&self) -> &str {
        "Fetch recent logs for a service with pattern analysis, error clusters, and a 24h timeline"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "service": {"type": "string", "description": "Service name or container id"},
                "lines": {"type": "integer", "description": "Log window size (default 100, max 10000)"}
            },
            "required": ["service"]
        })
    }

    async fn execute(&self, _cancel: &CancellationToken, args: &Value) -> Result<String, ToolError> {
        let service = require_str(args, "service")?;
        let lines = match optional_u64(args, "lines")? {
            Some(n) if n == 0 || n > TOOL_LOG_LINES_MAX => {
                return Err(ToolError::InvalidArgs(format!(
                    "lines must be between 1 and {TOOL_LOG_LINES_MAX}"
                )));
            }
            Some(n) => n as u32,
            None => self.default_lines,
        };
        let entries = self.discovery.fetch_logs(service, lines).await;
        if entries.is_empty() {
            return Ok(format!("no log entries for {service}"));
        }
        let report = self
            .analyzer
            .analyze(service, &entries, None, chrono::Utc::now());
        Ok(render_log_report(service, lines, &entries, &report))
    }
}

/// Text rendering of a log analysis, shaped for model consumption.
pub fn render_log_report(
    service: &str,
    lines: u32,
    entries: &[dozor_proto::LogEntry],
    report: &LogReport,
) -> String {
    let mut out = format!(
        "Logs for {service} (last {lines} lines): {} errors, {} warnings\n",
        report.error_count, report.warning_count
    );

    if !report.issues.is_empty() {
        out.push_str("Issues:\n");
        for issue in &report.issues {
            out.push_str(&format!(
                "- [{}] {} ({} occurrences): {}\n",
                issue.level, issue.description, issue.count, issue.action
            ));
        }
    }

    if !report.clusters.is_empty() {
        out.push_str("Top error clusters:\n");
        for cluster in &report.clusters {
            out.push_str(&format!("- {}x {}\n", cluster.count, cluster.template));
        }
    }

    let timeline = report.timeline.render();
    if !timeline.is_empty() {
        out.push_str(&timeline);
    }

    out.push_str("Tail:\n");
    for entry in entries.iter().rev().take(10).rev() {
        out.push_str(&format!("  {}\n", entry.line));
    }
    out
}

/// `restart_service`: restart one container through the engine.
pub struct RestartServiceTool {
    discovery: Arc<Discovery>,
}

#[async_trait]
impl Tool for RestartServiceTool {
    fn name(&self) -> &str {
        "restart_service"
    }

    fn description(&self) -> &str {
        "Restart one service container and invalidate the inventory cache"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "service": {"type": "string", "description": "Service name or container id"}
            },
            "required": ["service"]
        })
    }

    async fn execute(&self, _cancel: &CancellationToken, args: &Value) -> Result<String, ToolError> {
        let service = require_str(args, "service")?;
        self.discovery
            .restart(service)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(format!("restarted {service}"))
    }
}

/// `security_audit`: run the host audit checks.
pub struct SecurityAuditTool {
    auditor: Arc<SecurityAuditor>,
}

#[async_trait]
impl Tool for SecurityAuditTool {
    fn name(&self) -> &str {
        "security_audit"
    }

    fn description(&self) -> &str {
        "Audit the host: SSH sessions, failed logins, open ports, firewall, docker socket, auth vars"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, cancel: &CancellationToken, _args: &Value) -> Result<String, ToolError> {
        Ok(self.auditor.audit(cancel).await.render())
    }
}

/// `dev_mode`: inspect or change the observe-only state and exclusions.
pub struct DevModeTool {
    dev_mode: Arc<DevMode>,
}

#[async_trait]
impl Tool for DevModeTool {
    fn name(&self) -> &str {
        "dev_mode"
    }

    fn description(&self) -> &str {
        "Dev-mode control: status, on, off, exclude a service for a duration, include, list"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["status", "on", "off", "exclude", "include", "list"]
                },
                "service": {"type": "string", "description": "Service for exclude/include"},
                "duration": {"type": "string", "description": "Exclusion TTL, e.g. 1h (default 1h)"}
            },
            "required": ["mode"]
        })
    }

    async fn execute(&self, _cancel: &CancellationToken, args: &Value) -> Result<String, ToolError> {
        let mode = require_str(args, "mode")?;
        match mode {
            "status" => Ok(format!(
                "dev mode: {}",
                if self.dev_mode.is_enabled() { "on" } else { "off" }
            )),
            "on" => {
                self.dev_mode.set_enabled(true);
                Ok("dev mode enabled: observe only".to_string())
            }
            "off" => {
                self.dev_mode.set_enabled(false);
                Ok("dev mode disabled".to_string())
            }
            "exclude" => {
                let service = require_str(args, "service")?;
                let ttl = match args.get("duration").and_then(Value::as_str) {
                    Some(raw) => parse_duration(raw)
                        .map_err(|e| ToolError::InvalidArgs(e.to_string()))?,
                    None => std::time::Duration::from_secs(3600),
                };
                self.dev_mode.exclude(service, ttl);
                Ok(format!("excluded {service} for {}s", ttl.as_secs()))
            }
            "include" => {
                let service = require_str(args, "service")?;
                if self.dev_mode.include(service) {
                    Ok(format!("{service} re-included"))
                } else {
                    Ok(format!("{service} was not excluded"))
                }
            }
            "list" => {
                let listed = self.dev_mode.list_exclusions();
                if listed.is_empty() {
                    Ok("no active exclusions".to_string())
                } else {
                    Ok(listed
                        .into_iter()
                        .map(|(svc, until)| format!("{svc} until {}", until.format("%H:%M:%S")))
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
            other => Err(ToolError::InvalidArgs(format!("unknown mode {other:?}"))),
        }
    }
}

// ─── Registry assembly ────────────────────────────────────────────────────────

/// Build the default registry over the engine components.
pub fn build_registry(
    engine: Arc<TriageEngine>,
    discovery: Arc<Discovery>,
    auditor: Arc<SecurityAuditor>,
    dev_mode: Arc<DevMode>,
    default_log_lines: u32,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new().with_validator(default_validator());
    registry.register(Arc::new(TriageReportTool { engine }));
    registry.register(Arc::new(ServiceStatusTool {
        discovery: discovery.clone(),
    }));
    registry.register(Arc::new(ServiceLogsTool {
        discovery: discovery.clone(),
        analyzer: dozor_logscan::LogAnalyzer::new(),
        default_lines: default_log_lines,
    }));
    registry.register(Arc::new(RestartServiceTool { discovery }));
    registry.register(Arc::new(SecurityAuditTool { auditor }));
    registry.register(Arc::new(DevModeTool { dev_mode }));
    registry
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dozor_logscan::LogAnalyzer;
    use dozor_proto::LogEntry;

    #[test]
    fn validator_accepts_container_names() {
        let validate = default_validator();
        for name in ["api", "go-hully-worker", "proj_db_1", "unit:nginx", "a.b"] {
            assert!(
                validate("any", &json!({"service": name})).is_ok(),
                "{name} should pass"
            );
        }
    }

    #[test]
    fn validator_rejects_shell_metacharacters() {
        let validate = default_validator();
        for name in ["db; rm -rf /", "$(boom)", "a b", "", "-leading"] {
            assert!(
                validate("any", &json!({"service": name})).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn validator_ignores_toolcalls_without_service() {
        let validate = default_validator();
        assert!(validate("security_audit", &json!({})).is_ok());
    }

    #[tokio::test]
    async fn dev_mode_tool_cycle() {
        let dev = Arc::new(DevMode::new());
        let tool = DevModeTool {
            dev_mode: dev.clone(),
        };
        let cancel = CancellationToken::new();

        assert_eq!(
            tool.execute(&cancel, &json!({"mode": "status"})).await.unwrap(),
            "dev mode: off"
        );
        tool.execute(&cancel, &json!({"mode": "on"})).await.unwrap();
        assert!(dev.is_enabled());

        tool.execute(
            &cancel,
            &json!({"mode": "exclude", "service": "api", "duration": "30m"}),
        )
        .await
        .unwrap();
        assert!(dev.is_excluded("api"));

        let listed = tool
            .execute(&cancel, &json!({"mode": "list"}))
            .await
            .unwrap();
        assert!(listed.contains("api until"));

        tool.execute(&cancel, &json!({"mode": "include", "service": "api"}))
            .await
            .unwrap();
        assert!(!dev.is_excluded("api"));
    }

    #[tokio::test]
    async fn dev_mode_tool_rejects_unknown_mode() {
        let tool = DevModeTool {
            dev_mode: Arc::new(DevMode::new()),
        };
        let err = tool
            .execute(&CancellationToken::new(), &json!({"mode": "sideways"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown mode"));
    }

    #[tokio::test]
    async fn dev_mode_tool_rejects_bad_duration() {
        let tool = DevModeTool {
            dev_mode: Arc::new(DevMode::new()),
        };
        let err = tool
            .execute(
                &CancellationToken::new(),
                &json!({"mode": "exclude", "service": "api", "duration": "soon"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[test]
    fn log_report_render_sections() {
        let entries = vec![
            LogEntry::new(None, "ERROR connection refused to 10.0.0.5:5432"),
            LogEntry::new(None, "ERROR connection refused to 10.0.0.6:5432"),
            LogEntry::new(None, "INFO started"),
        ];
        let report = LogAnalyzer::new().analyze("db", &entries, None, chrono::Utc::now());
        let rendered = render_log_report("db", 100, &entries, &report);

        assert!(rendered.starts_with("Logs for db (last 100 lines): 2 errors"));
        assert!(rendered.contains("connection refused"));
        assert!(rendered.contains("Top error clusters:"));
        assert!(rendered.contains("- 2x"));
        assert!(rendered.contains("Tail:"));
    }
}
