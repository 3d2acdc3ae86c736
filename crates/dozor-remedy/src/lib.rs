//! Deterministic auto-remediation: the non-LLM recovery pass that runs
//! before any model is invoked.
//!
//! The remediator consumes the triage text (the documented line shape is
//! the contract), restarts CRITICAL services, silences known-benign
//! warnings, verifies restarts after a fixed delay, and reports whether
//! everything was handled. Any unhandled issue short-circuits to `false`
//! and the watch loop escalates to the agent.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use dozor_discovery::Discovery;
use dozor_proto::{AlertLevel, ContainerState, TriageIssue};
use dozor_triage::extract_issues;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Delay before re-inspecting restarted services.
pub const VERIFY_DELAY: Duration = Duration::from_secs(10);

// ─── Seams ────────────────────────────────────────────────────────────────────

/// The engine surface the remediator drives.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Restart one service; the error string is surfaced in the outcome.
    async fn restart_service(&self, service: &str) -> Result<(), String>;

    /// Current container state, `None` when the service cannot be found.
    async fn service_state(&self, service: &str) -> Option<ContainerState>;
}

#[async_trait]
impl ServiceController for Discovery {
    async fn restart_service(&self, service: &str) -> Result<(), String> {
        self.restart(service).await.map_err(|e| e.to_string())
    }

    async fn service_state(&self, service: &str) -> Option<ContainerState> {
        self.inspect(service).await.map(|s| s.state)
    }
}

/// Delivery sink for remediation summaries and alerts. The rendered string
/// may carry HTML-lite markup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnhandledIssue {
    pub service: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemedyOutcome {
    /// True when every issue was restarted or suppressed (the watch loop
    /// escalates on false).
    pub handled: bool,
    pub restarted: Vec<String>,
    pub suppressed: Vec<(String, String)>,
    pub unhandled: Vec<UnhandledIssue>,
}

// ─── Remediator ───────────────────────────────────────────────────────────────

pub struct Remediator {
    controller: Arc<dyn ServiceController>,
    /// Per-service reasons for known benign WARNING/ERROR conditions.
    suppress_warnings: HashMap<String, String>,
    verify_delay: Duration,
}

impl Remediator {
    pub fn new(
        controller: Arc<dyn ServiceController>,
        suppress_warnings: HashMap<String, String>,
    ) -> Self {
        Self {
            controller,
            suppress_warnings,
            verify_delay: VERIFY_DELAY,
        }
    }

    /// Shrink the verification delay (tests).
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    /// One auto-fix pass over a triage report.
    pub async fn auto_fix(&self, triage_text: &str, notifier: &dyn Notifier) -> RemedyOutcome {
        let issues = extract_issues(triage_text);
        let mut outcome = RemedyOutcome::default();

        for issue in issues {
            match issue.level {
                AlertLevel::Critical => match self.controller.restart_service(&issue.service).await
                {
                    Ok(()) => {
                        info!(subsystem = "remedy", service = %issue.service, "restarted");
                        outcome.restarted.push(issue.service);
                    }
                    Err(e) => {
                        warn!(subsystem = "remedy", service = %issue.service, error = %e, "restart failed");
                        outcome.unhandled.push(UnhandledIssue {
                            service: issue.service,
                            description: format!("restart failed: {e}"),
                        });
                    }
                },
                AlertLevel::Warning | AlertLevel::Error => {
                    match self.suppress_warnings.get(&issue.service) {
                        Some(reason) => {
                            outcome
                                .suppressed
                                .push((issue.service, reason.clone()));
                        }
                        None => outcome.unhandled.push(UnhandledIssue {
                            service: issue.service,
                            description: issue.description,
                        }),
                    }
                }
                AlertLevel::Info => outcome.unhandled.push(UnhandledIssue {
                    service: issue.service,
                    description: issue.description,
                }),
            }
        }

        self.verify_restarts(&mut outcome).await;

        if !outcome.unhandled.is_empty() {
            outcome.handled = false;
            return outcome;
        }

        // Suppression-only cycles stay silent.
        if !outcome.restarted.is_empty() {
            notifier
                .notify(&format_summary(&outcome.restarted, &outcome.suppressed))
                .await;
        }

        outcome.handled = true;
        outcome
    }

    /// Re-inspect each restarted service after the fixed delay; anything not
    /// running becomes unhandled.
    async fn verify_restarts(&self, outcome: &mut RemedyOutcome) {
        if outcome.restarted.is_empty() {
            return;
        }
        tokio::time::sleep(self.verify_delay).await;

        let mut verified = Vec::new();
        for service in outcome.restarted.drain(..) {
            match self.controller.service_state(&service).await {
                Some(ContainerState::Running) => verified.push(service),
                Some(state) => {
                    warn!(subsystem = "remedy", service = %service, state = %state, "restart did not recover service");
                    outcome.unhandled.push(UnhandledIssue {
                        service,
                        description: format!("restart failed, still {state}"),
                    });
                }
                None => {
                    warn!(subsystem = "remedy", service = %service, "service gone after restart");
                    outcome.unhandled.push(UnhandledIssue {
                        service,
                        description: "restart failed, service not found".to_string(),
                    });
                }
            }
        }
        outcome.restarted = verified;
    }
}

/// Summary sent to the notifier after a fully handled cycle with restarts.
pub fn format_summary(restarted: &[String], suppressed: &[(String, String)]) -> String {
    let mut out = format!(
        "<b>Auto-remediation</b>: restarted {} — all services recovered.",
        restarted.join(", ")
    );
    if !suppressed.is_empty() {
        let listed: Vec<String> = suppressed
            .iter()
            .map(|(svc, reason)| format!("{svc} ({reason})"))
            .collect();
        out.push_str(&format!("\nSuppressed: {}", listed.join(", ")));
    }
    out
}

/// Re-exported for callers that only need extraction semantics.
pub fn issues_from_text(text: &str) -> Vec<TriageIssue> {
    extract_issues(text)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockController {
        restart_results: Mutex<HashMap<String, Result<(), String>>>,
        post_restart_state: Mutex<HashMap<String, ContainerState>>,
        restarts: Mutex<Vec<String>>,
    }

    impl MockController {
        fn will_restart(&self, service: &str) {
            self.restart_results
                .lock()
                .insert(service.to_string(), Ok(()));
            self.post_restart_state
                .lock()
                .insert(service.to_string(), ContainerState::Running);
        }

        fn restart_leaves_state(&self, service: &str, state: ContainerState) {
            self.restart_results
                .lock()
                .insert(service.to_string(), Ok(()));
            self.post_restart_state
                .lock()
                .insert(service.to_string(), state);
        }

        fn restart_fails(&self, service: &str, error: &str) {
            self.restart_results
                .lock()
                .insert(service.to_string(), Err(error.to_string()));
        }
    }

    #[async_trait]
    impl ServiceController for MockController {
        async fn restart_service(&self, service: &str) -> Result<(), String> {
            self.restarts.lock().push(service.to_string());
            self.restart_results
                .lock()
                .get(service)
                .cloned()
                .unwrap_or(Err(format!("service {service:?} not found")))
        }

        async fn service_state(&self, service: &str) -> Option<ContainerState> {
            self.post_restart_state.lock().get(service).copied()
        }
    }

    #[derive(Default)]
    struct MockNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, message: &str) {
            self.messages.lock().push(message.to_string());
        }
    }

    fn remediator(
        controller: Arc<MockController>,
        suppress: &[(&str, &str)],
    ) -> Remediator {
        let map = suppress
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Remediator::new(controller, map).with_verify_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn critical_service_restarted_and_verified() {
        let controller = Arc::new(MockController::default());
        controller.will_restart("moonshine");
        let notifier = MockNotifier::default();

        let outcome = remediator(controller.clone(), &[])
            .auto_fix("[CRITICAL] moonshine — exited\n", &notifier)
            .await;

        assert!(outcome.handled);
        assert_eq!(outcome.restarted, vec!["moonshine"]);
        assert!(outcome.unhandled.is_empty());
        let messages = notifier.messages.lock();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("moonshine"));
        assert!(messages[0].contains("all services recovered"));
    }

    #[tokio::test]
    async fn failed_restart_is_unhandled() {
        let controller = Arc::new(MockController::default());
        controller.restart_fails("db", "no such container");
        let notifier = MockNotifier::default();

        let outcome = remediator(controller, &[])
            .auto_fix("[CRITICAL] db — exited\n", &notifier)
            .await;

        assert!(!outcome.handled);
        assert_eq!(outcome.unhandled.len(), 1);
        assert!(outcome.unhandled[0].description.contains("no such container"));
        assert!(notifier.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn restart_that_does_not_recover_is_unhandled() {
        let controller = Arc::new(MockController::default());
        controller.restart_leaves_state("db", ContainerState::Exited);
        let notifier = MockNotifier::default();

        let outcome = remediator(controller, &[])
            .auto_fix("[CRITICAL] db — exited\n", &notifier)
            .await;

        assert!(!outcome.handled);
        assert_eq!(outcome.unhandled.len(), 1);
        assert_eq!(
            outcome.unhandled[0].description,
            "restart failed, still exited"
        );
        assert!(outcome.restarted.is_empty());
        assert!(notifier.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn suppressed_warning_is_silent() {
        let controller = Arc::new(MockController::default());
        let notifier = MockNotifier::default();

        let outcome = remediator(controller, &[("worker", "known flaky startup")])
            .auto_fix("[WARNING] worker — running, 2 restarts\n", &notifier)
            .await;

        assert!(outcome.handled);
        assert_eq!(
            outcome.suppressed,
            vec![("worker".to_string(), "known flaky startup".to_string())]
        );
        // Suppression-only cycles do not notify.
        assert!(notifier.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn unsuppressed_warning_escalates() {
        let controller = Arc::new(MockController::default());
        let notifier = MockNotifier::default();

        let outcome = remediator(controller, &[])
            .auto_fix("[ERROR] api — running, 12 errors\n", &notifier)
            .await;

        assert!(!outcome.handled);
        assert_eq!(outcome.unhandled[0].service, "api");
    }

    #[tokio::test]
    async fn mixed_cycle_restarts_and_suppresses() {
        let controller = Arc::new(MockController::default());
        controller.will_restart("db");
        let notifier = MockNotifier::default();

        let text = "[CRITICAL] db — exited\n[WARNING] worker — running, 1 restarts\n";
        let outcome = remediator(controller, &[("worker", "slow warmup")])
            .auto_fix(text, &notifier)
            .await;

        assert!(outcome.handled);
        assert_eq!(outcome.restarted, vec!["db"]);
        assert_eq!(outcome.suppressed.len(), 1);
        let messages = notifier.messages.lock();
        assert!(messages[0].contains("db"));
        assert!(messages[0].contains("slow warmup"));
    }

    #[tokio::test]
    async fn prefix_named_services_do_not_collide() {
        let controller = Arc::new(MockController::default());
        let notifier = MockNotifier::default();
        let text = "[WARNING] go-hully-worker — running, 1 restarts\n\
                    [CRITICAL] go-hully — exited\n";
        controller.will_restart("go-hully");

        let outcome = remediator(controller.clone(), &[("go-hully-worker", "benign")])
            .auto_fix(text, &notifier)
            .await;

        assert!(outcome.handled);
        // Only the exactly-named critical service is restarted.
        assert_eq!(*controller.restarts.lock(), vec!["go-hully"]);
    }

    #[tokio::test]
    async fn healthy_report_is_noop() {
        let controller = Arc::new(MockController::default());
        let notifier = MockNotifier::default();
        let outcome = remediator(controller, &[])
            .auto_fix("Server Triage Report\nHealth: healthy | Time: x\n", &notifier)
            .await;
        assert!(outcome.handled);
        assert!(outcome.restarted.is_empty());
        assert!(notifier.messages.lock().is_empty());
    }
}
