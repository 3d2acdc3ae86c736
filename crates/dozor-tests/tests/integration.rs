//! End-to-end scenarios across the engine crates:
//! - healthy fleet → healthy report, no alerts
//! - cascading failure → dependency inhibition keeps only the root cause
//! - prefix-named services → exact extraction, no collisions
//! - auto-fix with post-restart verification and notification
//! - dev-mode exclusion with the P0 override
//! - confirmation gating across consecutive watch ticks

use async_trait::async_trait;
use dozor_alerts::Thresholds;
use dozor_bus::Bus;
use dozor_proto::{
    labels, Alert, AlertLevel, ContainerState, HealthState, ServiceStatus,
};
use dozor_remedy::{Notifier, Remediator, ServiceController};
use dozor_transport::{ExecOutput, Transport, TransportResult};
use dozor_triage::{compose, extract_issue_level, extract_issues, DevMode, TriageOutcome, TriageSnapshot};
use dozor_watch::{KnowledgeBase, Triager, WatchConfig, WatchLoop};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─── Fixtures ─────────────────────────────────────────────────────────────────

fn status(name: &str, state: ContainerState) -> ServiceStatus {
    ServiceStatus::new(name, state)
}

fn snapshot(statuses: Vec<ServiceStatus>) -> TriageSnapshot {
    TriageSnapshot {
        host: "testhost".to_string(),
        statuses,
        ..Default::default()
    }
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

#[derive(Default)]
struct FleetController {
    // Services that restart successfully and their post-restart state.
    recoverable: Mutex<HashMap<String, ContainerState>>,
    restarts: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceController for FleetController {
    async fn restart_service(&self, service: &str) -> Result<(), String> {
        self.restarts.lock().push(service.to_string());
        if self.recoverable.lock().contains_key(service) {
            Ok(())
        } else {
            Err(format!("no such container: {service}"))
        }
    }

    async fn service_state(&self, service: &str) -> Option<ContainerState> {
        self.recoverable.lock().get(service).copied()
    }
}

// ─── Scenario 1: happy path ───────────────────────────────────────────────────

#[test]
fn happy_path_two_running_services() {
    let outcome = compose(
        &snapshot(vec![
            status("api", ContainerState::Running),
            status("db", ContainerState::Running),
        ]),
        &Thresholds::default(),
    );

    assert_eq!(outcome.report.overall, HealthState::Healthy);
    assert!(outcome.text.contains("\nHealth: healthy |"));
    assert!(outcome.text.contains("Healthy services (2): api, db"));
    assert!(outcome.report.alerts.is_empty());
    assert!(extract_issues(&outcome.text).is_empty());
    // A quiet fleet produces a short report.
    assert!(
        outcome.text.len() < 500,
        "healthy report unexpectedly long: {} bytes",
        outcome.text.len()
    );
}

// ─── Scenario 2: cascading failure ────────────────────────────────────────────

#[test]
fn cascading_failure_keeps_root_cause_only() {
    let mut api = status("api", ContainerState::Running);
    api.healthcheck_ok = Some(false);
    api.labels
        .insert(labels::DEPENDS_ON.to_string(), "db".to_string());

    let outcome = compose(
        &snapshot(vec![api, status("db", ContainerState::Exited)]),
        &Thresholds::default(),
    );

    let kept: Vec<(&str, AlertLevel)> = outcome
        .report
        .alerts
        .iter()
        .map(|a| (a.service.as_str(), a.level))
        .collect();
    assert_eq!(kept, vec![("db", AlertLevel::Critical)]);

    assert_eq!(outcome.inhibited.len(), 1);
    assert_eq!(outcome.inhibited[0].service, "api");

    assert!(outcome.text.contains("[CRITICAL] db — exited"));
    assert_eq!(outcome.report.overall, HealthState::Critical);
}

#[test]
fn transitive_dependents_are_inhibited() {
    let mut web = status("web", ContainerState::Running);
    web.healthcheck_ok = Some(false);
    web.labels
        .insert(labels::DEPENDS_ON.to_string(), "api".to_string());
    let mut api = status("api", ContainerState::Running);
    api.healthcheck_ok = Some(false);
    api.labels
        .insert(labels::DEPENDS_ON.to_string(), "db".to_string());

    let outcome = compose(
        &snapshot(vec![web, api, status("db", ContainerState::Exited)]),
        &Thresholds::default(),
    );

    let kept_services: Vec<&str> = outcome
        .report
        .alerts
        .iter()
        .map(|a| a.service.as_str())
        .collect();
    assert_eq!(kept_services, vec!["db"]);
    assert_eq!(outcome.inhibited.len(), 2);
}

// ─── Scenario 3: prefix collision ─────────────────────────────────────────────

#[test]
fn prefix_named_services_extract_exactly() {
    let text = "Server Triage Report\nHealth: degraded | Time: 2026-08-01 12:00\n\n\
                Services needing attention (2):\n\n\
                [WARNING] go-hully-worker — running, 2 restarts\n\
                [ERROR] go-hully — running, 12 errors\n";

    assert_eq!(
        extract_issue_level(text, "go-hully"),
        Some(AlertLevel::Error)
    );
    assert_eq!(
        extract_issue_level(text, "go-hully-worker"),
        Some(AlertLevel::Warning)
    );

    let issues = extract_issues(text);
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0].service, "go-hully-worker");
    assert_eq!(issues[1].service, "go-hully");
}

// ─── Scenario 4: auto-fix + verify ────────────────────────────────────────────

#[tokio::test]
async fn auto_fix_restarts_and_verifies() {
    let controller = Arc::new(FleetController::default());
    controller
        .recoverable
        .lock()
        .insert("moonshine".to_string(), ContainerState::Running);
    let notifier = RecordingNotifier::default();

    let outcome = compose(
        &snapshot(vec![status("moonshine", ContainerState::Exited)]),
        &Thresholds::default(),
    );
    assert!(outcome.text.contains("[CRITICAL] moonshine — exited"));

    let remediator = Remediator::new(controller.clone(), HashMap::new())
        .with_verify_delay(Duration::ZERO);
    let remedy = remediator.auto_fix(&outcome.text, &notifier).await;

    assert!(remedy.handled);
    assert_eq!(*controller.restarts.lock(), vec!["moonshine"]);
    let messages = notifier.messages.lock();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("moonshine"));
    assert!(messages[0].contains("all services recovered"));
}

#[tokio::test]
async fn auto_fix_escalates_when_restart_does_not_stick() {
    let controller = Arc::new(FleetController::default());
    controller
        .recoverable
        .lock()
        .insert("moonshine".to_string(), ContainerState::Exited);
    let notifier = RecordingNotifier::default();

    let outcome = compose(
        &snapshot(vec![status("moonshine", ContainerState::Exited)]),
        &Thresholds::default(),
    );
    let remediator = Remediator::new(controller, HashMap::new())
        .with_verify_delay(Duration::ZERO);
    let remedy = remediator.auto_fix(&outcome.text, &notifier).await;

    assert!(!remedy.handled);
    assert_eq!(remedy.unhandled.len(), 1);
    assert_eq!(
        remedy.unhandled[0].description,
        "restart failed, still exited"
    );
    assert!(notifier.messages.lock().is_empty());
}

// ─── Scenario 5: dev mode P0 override ─────────────────────────────────────────

#[test]
fn dev_excluded_down_service_is_reincluded() {
    let dev = DevMode::new();
    dev.exclude("api", Duration::from_secs(3600));
    assert!(dev.is_excluded("api"));

    // The gather path re-includes a dev-excluded service in a terminal bad
    // state; mirror its decision here against the exclusion map.
    let api = status("api", ContainerState::Exited);
    let (p0, omitted) = if dev.is_excluded(&api.name) && api.state.is_terminal_bad() {
        (vec![api.name.clone()], vec![])
    } else {
        (vec![], vec![api.name.clone()])
    };
    assert_eq!(p0, vec!["api"]);
    assert!(omitted.is_empty());

    let mut snap = snapshot(vec![api, status("db", ContainerState::Running)]);
    snap.p0_overrides = p0;
    let outcome = compose(&snap, &Thresholds::default());

    assert!(outcome.text.contains("[CRITICAL] api — exited"));
    assert!(outcome
        .text
        .contains("P0 OVERRIDE — dev-excluded but DOWN: api"));
    assert_eq!(outcome.report.overall, HealthState::Critical);
}

#[test]
fn dev_excluded_healthy_service_is_omitted() {
    let dev = DevMode::new();
    dev.exclude("api", Duration::from_secs(3600));

    let mut snap = snapshot(vec![status("db", ContainerState::Running)]);
    snap.dev_excluded = vec!["api".to_string()];
    let outcome = compose(&snap, &Thresholds::default());

    assert!(outcome.text.contains("Dev-excluded (1): api"));
    assert!(!outcome.text.contains("[CRITICAL] api"));
    assert_eq!(outcome.report.overall, HealthState::Healthy);
}

// ─── Scenario 6: confirmation gating across watch ticks ───────────────────────

struct ScriptedTriager {
    statuses: Mutex<Vec<ServiceStatus>>,
}

#[async_trait]
impl Triager for ScriptedTriager {
    async fn triage(
        &self,
        extra_alerts: Vec<Alert>,
        _cancel: &CancellationToken,
    ) -> TriageOutcome {
        let snap = TriageSnapshot {
            host: "testhost".to_string(),
            statuses: self.statuses.lock().clone(),
            extra_alerts,
            ..Default::default()
        };
        compose(&snap, &Thresholds::default())
    }
}

struct SilentTransport;

#[async_trait]
impl Transport for SilentTransport {
    async fn exec(
        &self,
        _command: &str,
        _cancel: &CancellationToken,
    ) -> TransportResult<ExecOutput> {
        Ok(ExecOutput {
            stdout: "active".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn target(&self) -> String {
        "test".to_string()
    }
}

#[tokio::test]
async fn confirmation_gates_webhook_dispatch() {
    let triager = Arc::new(ScriptedTriager {
        statuses: Mutex::new(vec![status("api", ContainerState::Exited)]),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let controller = Arc::new(FleetController::default());
    let bus = Arc::new(Bus::new());

    let watch = WatchLoop::new(
        triager.clone(),
        Arc::new(
            Remediator::new(controller, HashMap::new()).with_verify_delay(Duration::ZERO),
        ),
        notifier.clone(),
        bus.clone(),
        Arc::new(DevMode::new()),
        Arc::new(SilentTransport),
        KnowledgeBase::builtin(),
        WatchConfig {
            boot_delay: Duration::ZERO,
            confirm_count: 3,
            ..Default::default()
        },
    );

    // Two cycles with the same problem: nothing surfaces yet.
    watch.tick(&token()).await;
    watch.tick(&token()).await;
    assert!(notifier.messages.lock().is_empty());

    // Third consecutive cycle confirms and dispatches.
    watch.tick(&token()).await;
    assert!(!notifier.messages.lock().is_empty());

    // The unresolvable issue escalates to the agent with watch metadata.
    let escalation = bus.consume_inbound(&token()).await.expect("escalation");
    assert!(escalation.id.starts_with("watch-"));
    assert_eq!(escalation.channel, "internal");
    assert_eq!(escalation.sender, "watch");

    // A healthy cycle resets the counter: two failing cycles after it stay
    // silent again.
    notifier.messages.lock().clear();
    *triager.statuses.lock() = vec![status("api", ContainerState::Running)];
    watch.tick(&token()).await;
    *triager.statuses.lock() = vec![status("api", ContainerState::Exited)];
    watch.tick(&token()).await;
    watch.tick(&token()).await;
    assert!(notifier.messages.lock().is_empty());
}

// ─── Cross-crate: agent loop over a real registry ─────────────────────────────

mod agent_end_to_end {
    use super::*;
    use dozor_agent::{AgentConfig, AgentLoop, Tool, ToolError, ToolRegistry};
    use dozor_provider::{
        ChatMessage, ChatProvider, ChatResponse, ProviderError, ToolCall, ToolSchema,
    };
    use serde_json::{json, Value};

    struct ScriptedProvider {
        responses: Mutex<Vec<ChatResponse>>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSchema],
        ) -> Result<ChatResponse, ProviderError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(ProviderError::InvalidResponse("script over".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    struct TriageTextTool {
        text: String,
    }

    #[async_trait]
    impl Tool for TriageTextTool {
        fn name(&self) -> &str {
            "triage_report"
        }

        fn description(&self) -> &str {
            "Run a triage pass"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _args: &Value,
        ) -> Result<String, ToolError> {
            Ok(self.text.clone())
        }
    }

    #[tokio::test]
    async fn escalation_flows_through_agent_to_answer() {
        // The watch escalates; the model pulls the triage tool, then answers.
        let triage_text = compose(
            &TriageSnapshot {
                host: "testhost".to_string(),
                statuses: vec![ServiceStatus::new("db", ContainerState::Exited)],
                ..Default::default()
            },
            &Thresholds::default(),
        )
        .text;

        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![
                ChatResponse {
                    content: None,
                    tool_calls: vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "triage_report".to_string(),
                        args: json!({}),
                    }],
                    finish_reason: "tool_calls".to_string(),
                },
                ChatResponse {
                    content: Some("db is down; restart recommended".to_string()),
                    tool_calls: vec![],
                    finish_reason: "stop".to_string(),
                },
            ]),
        });

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(TriageTextTool { text: triage_text }));

        let mut agent = AgentLoop::new(provider, Arc::new(registry), AgentConfig::default());
        let answer = agent
            .process("what is wrong with the fleet?", &token())
            .await
            .expect("agent answer");
        assert_eq!(answer, "db is down; restart recommended");
    }
}
