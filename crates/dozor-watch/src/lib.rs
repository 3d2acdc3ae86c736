//! The watch loop: periodic triage, confirmation and dedup gating,
//! auto-remediation, and escalation into the agent loop via the bus.
//!
//! A companion remote watch probes a secondary host over HTTP at a shorter
//! interval with its own confirmation and flap gating, notifying directly
//! and bypassing the LLM entirely.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use dozor_alerts::{alerts_hash, DedupGate, FailureTracker, FlapDetector};
use dozor_bus::{Bus, BusMessage};
use dozor_proto::{Alert, AlertLevel};
use dozor_remedy::{Notifier, Remediator, UnhandledIssue};
use dozor_transport::Transport;
use dozor_triage::{DevMode, TriageEngine, TriageOutcome};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before the first tick after boot.
pub const BOOT_DELAY: Duration = Duration::from_secs(30);
/// LLM-key health is probed at most this often.
const LLM_CHECK_EVERY: Duration = Duration::from_secs(12 * 3600);

// ─── Seams ────────────────────────────────────────────────────────────────────

/// One triage cycle with injected extra alerts. The watch loop talks to this
/// seam so ticks can run without a container runtime in tests.
#[async_trait]
pub trait Triager: Send + Sync {
    async fn triage(&self, extra_alerts: Vec<Alert>, cancel: &CancellationToken) -> TriageOutcome;
}

#[async_trait]
impl Triager for TriageEngine {
    async fn triage(&self, extra_alerts: Vec<Alert>, cancel: &CancellationToken) -> TriageOutcome {
        self.run(None, extra_alerts, cancel).await
    }
}

// ─── Knowledge base ───────────────────────────────────────────────────────────

/// Known failure signatures and the operator note that goes with them. The
/// matching notes are appended to the escalation prompt so the model starts
/// with prior context.
pub struct KnowledgeBase {
    entries: Vec<(String, String)>,
}

impl KnowledgeBase {
    pub fn builtin() -> Self {
        let entries = [
            (
                "out of memory",
                "OOM kills here usually mean a leak after a deploy; compare the image tag with yesterday's before raising limits.",
            ),
            (
                "connection refused",
                "Check dependency start order first; compose services race on cold boots.",
            ),
            (
                "no space left on device",
                "Log rotation has failed before on this host; check /var/lib/docker and journald limits.",
            ),
            (
                "restarting repeatedly",
                "A restart loop with exit code 137 is the memory limit, not the application.",
            ),
            (
                "certificate",
                "Certificates renew via a timer unit; if one expired the timer is probably dead.",
            ),
        ];
        Self {
            entries: entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    pub fn with_entries(mut self, extra: Vec<(String, String)>) -> Self {
        self.entries.extend(extra);
        self
    }

    /// Notes whose signature occurs in the report text (case-insensitive).
    pub fn enrich(&self, text: &str) -> Vec<&str> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .filter(|(signature, _)| lower.contains(&signature.to_lowercase()))
            .map(|(_, note)| note.as_str())
            .collect()
    }
}

// ─── Watch configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub boot_delay: Duration,
    pub interval: Duration,
    pub systemd_services: Vec<String>,
    pub repeat_after: Duration,
    pub confirm_count: u32,
    pub flap_window: usize,
    pub flap_high_pct: f64,
    pub flap_low_pct: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            boot_delay: BOOT_DELAY,
            interval: Duration::from_secs(300),
            systemd_services: Vec::new(),
            repeat_after: Duration::from_secs(3600),
            confirm_count: 1,
            flap_window: 10,
            flap_high_pct: 0.5,
            flap_low_pct: 0.25,
        }
    }
}

// ─── Watch loop ───────────────────────────────────────────────────────────────

pub struct WatchLoop {
    triager: Arc<dyn Triager>,
    remediator: Arc<Remediator>,
    notifier: Arc<dyn Notifier>,
    bus: Arc<Bus>,
    dev_mode: Arc<DevMode>,
    transport: Arc<dyn Transport>,
    kb: KnowledgeBase,
    config: WatchConfig,

    tracker: FailureTracker,
    flap: FlapDetector,
    gate: DedupGate,
    last_keys: Mutex<HashSet<String>>,
    llm_probe: Option<Arc<dyn LlmHealthProbe>>,
    last_llm_check: Mutex<Option<Instant>>,
}

/// Add-on seam: a cheap provider-credential check.
#[async_trait]
pub trait LlmHealthProbe: Send + Sync {
    /// `Some(alert)` when the credential looks broken.
    async fn check(&self) -> Option<Alert>;
}

impl WatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        triager: Arc<dyn Triager>,
        remediator: Arc<Remediator>,
        notifier: Arc<dyn Notifier>,
        bus: Arc<Bus>,
        dev_mode: Arc<DevMode>,
        transport: Arc<dyn Transport>,
        kb: KnowledgeBase,
        config: WatchConfig,
    ) -> Self {
        let tracker = FailureTracker::new(config.confirm_count);
        let flap = FlapDetector::new(
            config.flap_window,
            config.flap_high_pct,
            config.flap_low_pct,
        );
        let gate = DedupGate::new(config.repeat_after);
        Self {
            triager,
            remediator,
            notifier,
            bus,
            dev_mode,
            transport,
            kb,
            config,
            tracker,
            flap,
            gate,
            last_keys: Mutex::new(HashSet::new()),
            llm_probe: None,
            last_llm_check: Mutex::new(None),
        }
    }

    pub fn with_llm_probe(mut self, probe: Arc<dyn LlmHealthProbe>) -> Self {
        self.llm_probe = Some(probe);
        self
    }

    /// Run until cancelled: boot delay, then one tick per interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            subsystem = "watch",
            boot_delay_secs = self.config.boot_delay.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "watch loop starting"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.config.boot_delay) => {}
            _ = cancel.cancelled() => {
                info!(subsystem = "watch", "watch loop shutting down before first tick");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&cancel).await,
                _ = cancel.cancelled() => {
                    info!(subsystem = "watch", "watch loop shutting down");
                    return;
                }
            }
        }
    }

    /// One tick: triage, gate, remediate, escalate.
    pub async fn tick(&self, cancel: &CancellationToken) {
        let mut extra_alerts = self.systemd_alerts(cancel).await;
        if let Some(alert) = self.maybe_check_llm().await {
            extra_alerts.push(alert);
        }

        let outcome = self.triager.triage(extra_alerts, cancel).await;

        if outcome.all_healthy() {
            debug!(subsystem = "watch", "all healthy");
            self.settle_resolved(&HashSet::new());
            self.gate.reset();
            return;
        }

        if self.dev_mode.is_enabled() {
            info!(subsystem = "watch", "dev mode: observe only");
            return;
        }

        // Confirmation + flap gating over this cycle's kept alerts.
        let current_keys: HashSet<String> =
            outcome.report.alerts.iter().map(Alert::dedup_key).collect();
        self.settle_resolved(&current_keys);

        let mut confirmed = Vec::new();
        for alert in &outcome.report.alerts {
            let key = alert.dedup_key();
            let is_confirmed = self.tracker.record_failure(&key);
            let is_flapping = self.flap.record(&key, false);
            if is_flapping {
                debug!(subsystem = "watch", key = %key, "alert suppressed: flapping");
                continue;
            }
            if !is_confirmed {
                debug!(
                    subsystem = "watch",
                    key = %key,
                    count = self.tracker.count(&key),
                    "alert awaiting confirmation"
                );
                continue;
            }
            confirmed.push(alert.clone());
        }
        if confirmed.is_empty() {
            return;
        }

        let hash = alerts_hash(&confirmed);
        if !self.gate.should_emit(&hash) {
            debug!(subsystem = "watch", "alert set unchanged, suppressed by dedup");
            return;
        }

        self.notifier
            .notify(&render_alert_notification(&confirmed))
            .await;

        let remedy = self.remediator.auto_fix(&outcome.text, &*self.notifier).await;
        if remedy.handled {
            info!(
                subsystem = "watch",
                restarted = remedy.restarted.len(),
                suppressed = remedy.suppressed.len(),
                "cycle auto-remediated"
            );
            return;
        }

        let prompt = compose_escalation_prompt(&outcome, &remedy.unhandled, &self.kb);
        let msg = BusMessage::new("internal", "watch", prompt)
            .with_id(format!("watch-{}", Utc::now().timestamp_millis()));
        if self.bus.publish_inbound(msg) {
            info!(subsystem = "watch", "escalated unresolved cycle to agent");
        } else {
            warn!(subsystem = "watch", "escalation dropped: bus unavailable");
        }
    }

    /// Record recoveries for alert keys that vanished since the last cycle.
    fn settle_resolved(&self, current: &HashSet<String>) {
        let mut last = self.last_keys.lock();
        for key in last.iter() {
            if !current.contains(key) {
                self.tracker.record_success(key);
                self.flap.record(key, true);
            }
        }
        *last = current.clone();
    }

    /// Probe configured systemd units through the transport.
    async fn systemd_alerts(&self, cancel: &CancellationToken) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for unit in &self.config.systemd_services {
            let cmd = format!("systemctl is-active {unit}");
            match self.transport.exec(&cmd, cancel).await {
                Ok(output) => {
                    let state = output.text().trim().to_string();
                    if let Some(alert) = alert_for_unit_state(unit, &state) {
                        alerts.push(alert);
                    }
                }
                Err(e) => {
                    warn!(subsystem = "watch", unit = %unit, error = %e, "systemd probe failed");
                }
            }
        }
        alerts
    }

    async fn maybe_check_llm(&self) -> Option<Alert> {
        let probe = self.llm_probe.as_ref()?;
        {
            let last = self.last_llm_check.lock();
            if let Some(at) = *last {
                if at.elapsed() < LLM_CHECK_EVERY {
                    return None;
                }
            }
        }
        *self.last_llm_check.lock() = Some(Instant::now());
        probe.check().await
    }
}

/// Alert for an inactive systemd unit; `None` while active.
pub fn alert_for_unit_state(unit: &str, state: &str) -> Option<Alert> {
    if state == "active" {
        return None;
    }
    Some(Alert::new(
        AlertLevel::Critical,
        format!("unit:{unit}"),
        "systemd unit inactive",
        if state.is_empty() {
            "unit state unknown".to_string()
        } else {
            state.to_string()
        },
        format!("systemctl restart {unit}"),
    ))
}

/// Rendered alert notification (HTML-lite markup allowed by the sink).
pub fn render_alert_notification(alerts: &[Alert]) -> String {
    let mut out = String::from("<b>dozor alerts</b>\n");
    for alert in alerts {
        out.push_str(&format!(
            "[{}] {} — {}: {}\n",
            alert.level, alert.service, alert.title, alert.description
        ));
        if !alert.action.is_empty() {
            out.push_str(&format!("  Action: {}\n", alert.action));
        }
    }
    out
}

/// The prompt published to the agent when auto-fix left issues unresolved.
pub fn compose_escalation_prompt(
    outcome: &TriageOutcome,
    unhandled: &[UnhandledIssue],
    kb: &KnowledgeBase,
) -> String {
    let mut prompt = String::from(
        "Auto-remediation could not resolve the following issues; investigate \
         and fix them with your tools.\n\nUnresolved:\n",
    );
    for issue in unhandled {
        prompt.push_str(&format!("- {}: {}\n", issue.service, issue.description));
    }
    prompt.push_str("\nTriage report:\n");
    prompt.push_str(&outcome.text);

    let notes = kb.enrich(&outcome.text);
    if !notes.is_empty() {
        prompt.push_str("\nKnown issues on this host:\n");
        for note in notes {
            prompt.push_str(&format!("- {note}\n"));
        }
    }
    prompt
}

// ─── Remote watch ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemoteWatchConfig {
    pub url: String,
    pub interval: Duration,
    pub confirm_count: u32,
    pub flap_window: usize,
    pub flap_high_pct: f64,
    pub flap_low_pct: f64,
}

/// Short-interval HTTP probe of a secondary host, notifying directly and
/// bypassing the LLM.
pub struct RemoteWatch {
    config: RemoteWatchConfig,
    notifier: Arc<dyn Notifier>,
    http: reqwest::Client,
    tracker: FailureTracker,
    flap: FlapDetector,
    down: Mutex<bool>,
}

impl RemoteWatch {
    pub fn new(config: RemoteWatchConfig, notifier: Arc<dyn Notifier>) -> Self {
        let tracker = FailureTracker::new(config.confirm_count);
        let flap = FlapDetector::new(
            config.flap_window,
            config.flap_high_pct,
            config.flap_low_pct,
        );
        Self {
            config,
            notifier,
            http: reqwest::Client::new(),
            tracker,
            flap,
            down: Mutex::new(false),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            subsystem = "remote-watch",
            url = %self.config.url,
            interval_secs = self.config.interval.as_secs(),
            "remote watch starting"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.probe().await;
                    if let Some(message) = self.handle_probe(result) {
                        self.notifier.notify(&message).await;
                    }
                }
                _ = cancel.cancelled() => {
                    info!(subsystem = "remote-watch", "remote watch shutting down");
                    return;
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), String> {
        match self
            .http
            .get(&self.config.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("status {}", response.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Confirmation-gated, flap-suppressed state transition. Returns the
    /// notification to send, if any.
    pub fn handle_probe(&self, result: Result<(), String>) -> Option<String> {
        const KEY: &str = "remote";
        match result {
            Ok(()) => {
                self.tracker.record_success(KEY);
                self.flap.record(KEY, true);
                let mut down = self.down.lock();
                if *down {
                    *down = false;
                    Some(format!(
                        "<b>Remote recovered</b>: {} is responding again",
                        self.config.url
                    ))
                } else {
                    None
                }
            }
            Err(reason) => {
                let confirmed = self.tracker.record_failure(KEY);
                let flapping = self.flap.record(KEY, false);
                if !confirmed || flapping {
                    return None;
                }
                let mut down = self.down.lock();
                if *down {
                    return None;
                }
                *down = true;
                Some(format!(
                    "<b>Remote DOWN</b>: {} ({reason})",
                    self.config.url
                ))
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dozor_proto::{ContainerState, ServiceStatus};
    use dozor_remedy::ServiceController;
    use dozor_triage::{compose, TriageSnapshot};
    use std::collections::HashMap;

    // ── Doubles ──────────────────────────────────────────────────────────────

    struct StaticTriager {
        statuses: Mutex<Vec<ServiceStatus>>,
    }

    #[async_trait]
    impl Triager for StaticTriager {
        async fn triage(
            &self,
            extra_alerts: Vec<Alert>,
            _cancel: &CancellationToken,
        ) -> TriageOutcome {
            let snapshot = TriageSnapshot {
                host: "test".to_string(),
                statuses: self.statuses.lock().clone(),
                extra_alerts,
                ..Default::default()
            };
            compose(&snapshot, &dozor_alerts::Thresholds::default())
        }
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
    struct StubController {
        restartable: Mutex<HashMap<String, ContainerState>>,
        restarts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceController for StubController {
        async fn restart_service(&self, service: &str) -> Result<(), String> {
            self.restarts.lock().push(service.to_string());
            if self.restartable.lock().contains_key(service) {
                Ok(())
            } else {
                Err("no such container".to_string())
            }
        }

        async fn service_state(&self, service: &str) -> Option<ContainerState> {
            self.restartable.lock().get(service).copied()
        }
    }

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn exec(
            &self,
            _command: &str,
            _cancel: &CancellationToken,
        ) -> dozor_transport::TransportResult<dozor_transport::ExecOutput> {
            Ok(dozor_transport::ExecOutput {
                stdout: "active".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        fn target(&self) -> String {
            "noop".to_string()
        }
    }

    struct Harness {
        watch: WatchLoop,
        triager: Arc<StaticTriager>,
        notifier: Arc<RecordingNotifier>,
        controller: Arc<StubController>,
        bus: Arc<Bus>,
    }

    fn harness(confirm_count: u32) -> Harness {
        let triager = Arc::new(StaticTriager {
            statuses: Mutex::new(vec![ServiceStatus::new("api", ContainerState::Running)]),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = Arc::new(StubController::default());
        let bus = Arc::new(Bus::new());
        let remediator = Arc::new(
            Remediator::new(controller.clone(), HashMap::new())
                .with_verify_delay(Duration::ZERO),
        );
        let config = WatchConfig {
            boot_delay: Duration::ZERO,
            interval: Duration::from_secs(300),
            confirm_count,
            ..Default::default()
        };
        let watch = WatchLoop::new(
            triager.clone(),
            remediator,
            notifier.clone(),
            bus.clone(),
            Arc::new(DevMode::new()),
            Arc::new(NoopTransport),
            KnowledgeBase::builtin(),
            config,
        );
        Harness {
            watch,
            triager,
            notifier,
            controller,
            bus,
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn set_down(h: &Harness, service: &str) {
        *h.triager.statuses.lock() = vec![
            ServiceStatus::new(service, ContainerState::Exited),
            ServiceStatus::new("api", ContainerState::Running),
        ];
    }

    // ── Watch ticks ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn healthy_tick_is_silent() {
        let h = harness(1);
        h.watch.tick(&token()).await;
        assert!(h.notifier.messages.lock().is_empty());
        assert!(h.bus.consume_inbound(&cancelled_token()).await.is_none());
    }

    fn cancelled_token() -> CancellationToken {
        let t = CancellationToken::new();
        t.cancel();
        t
    }

    #[tokio::test]
    async fn confirmed_critical_restarts_and_notifies() {
        let h = harness(1);
        set_down(&h, "db");
        h.controller
            .restartable
            .lock()
            .insert("db".to_string(), ContainerState::Running);

        h.watch.tick(&token()).await;

        assert_eq!(*h.controller.restarts.lock(), vec!["db"]);
        let messages = h.notifier.messages.lock();
        // Alert notification plus the remediation summary.
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("service not running"));
        assert!(messages[1].contains("all services recovered"));
        drop(messages);
        // Fully handled cycle: no escalation.
        assert!(h.bus.consume_inbound(&cancelled_token()).await.is_none());
    }

    #[tokio::test]
    async fn confirmation_gates_until_threshold() {
        let h = harness(3);
        set_down(&h, "db");

        h.watch.tick(&token()).await;
        h.watch.tick(&token()).await;
        assert!(
            h.notifier.messages.lock().is_empty(),
            "unconfirmed alerts must not surface"
        );

        h.watch.tick(&token()).await;
        assert!(
            !h.notifier.messages.lock().is_empty(),
            "third consecutive cycle confirms"
        );
    }

    #[tokio::test]
    async fn healthy_cycle_resets_confirmation() {
        let h = harness(3);
        set_down(&h, "db");
        h.watch.tick(&token()).await;
        h.watch.tick(&token()).await;

        // One healthy cycle in between.
        *h.triager.statuses.lock() = vec![ServiceStatus::new("db", ContainerState::Running)];
        h.watch.tick(&token()).await;

        set_down(&h, "db");
        h.watch.tick(&token()).await;
        h.watch.tick(&token()).await;
        assert!(
            h.notifier.messages.lock().is_empty(),
            "counter must restart after the healthy cycle"
        );
        h.watch.tick(&token()).await;
        assert!(!h.notifier.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn unresolved_cycle_escalates_with_metadata() {
        let h = harness(1);
        set_down(&h, "ghost"); // not restartable → auto-fix fails

        h.watch.tick(&token()).await;

        let msg = h.bus.consume_inbound(&token()).await.expect("escalation");
        assert!(msg.id.starts_with("watch-"));
        assert_eq!(msg.channel, "internal");
        assert_eq!(msg.sender, "watch");
        assert!(msg.text.contains("ghost"));
        assert!(msg.text.contains("Triage report:"));
    }

    #[tokio::test]
    async fn identical_cycles_are_deduped() {
        let h = harness(1);
        set_down(&h, "ghost");

        h.watch.tick(&token()).await;
        let first_count = h.notifier.messages.lock().len();
        assert!(first_count > 0);

        h.watch.tick(&token()).await;
        assert_eq!(
            h.notifier.messages.lock().len(),
            first_count,
            "identical alert set must be suppressed"
        );
    }

    #[tokio::test]
    async fn dev_mode_observes_only() {
        let h = harness(1);
        set_down(&h, "db");
        h.controller
            .restartable
            .lock()
            .insert("db".to_string(), ContainerState::Running);
        h.watch.dev_mode.set_enabled(true);

        h.watch.tick(&token()).await;

        assert!(h.controller.restarts.lock().is_empty());
        assert!(h.notifier.messages.lock().is_empty());
        assert!(h.bus.consume_inbound(&cancelled_token()).await.is_none());
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn systemd_unit_alert_shape() {
        assert!(alert_for_unit_state("nginx", "active").is_none());
        let alert = alert_for_unit_state("nginx", "inactive").unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.service, "unit:nginx");
        assert!(alert.action.contains("systemctl restart nginx"));
        let unknown = alert_for_unit_state("cron", "").unwrap();
        assert_eq!(unknown.description, "unit state unknown");
    }

    #[test]
    fn kb_enriches_matching_signatures() {
        let kb = KnowledgeBase::builtin();
        let notes = kb.enrich("ERROR dial tcp: Connection Refused");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("start order"));
        assert!(kb.enrich("nothing matches here").is_empty());
    }

    #[test]
    fn escalation_prompt_contains_sections() {
        let snapshot = TriageSnapshot {
            host: "h".to_string(),
            statuses: vec![ServiceStatus::new("db", ContainerState::Exited)],
            ..Default::default()
        };
        let outcome = compose(&snapshot, &dozor_alerts::Thresholds::default());
        let unhandled = vec![UnhandledIssue {
            service: "db".to_string(),
            description: "restart failed, still exited".to_string(),
        }];
        let prompt = compose_escalation_prompt(&outcome, &unhandled, &KnowledgeBase::builtin());
        assert!(prompt.contains("Unresolved:"));
        assert!(prompt.contains("- db: restart failed, still exited"));
        assert!(prompt.contains("Triage report:"));
        assert!(prompt.contains("[CRITICAL] db — exited"));
    }

    #[test]
    fn alert_notification_render() {
        let alerts = vec![Alert::new(
            AlertLevel::Critical,
            "db",
            "service not running",
            "state: exited",
            "restart it",
        )];
        let rendered = render_alert_notification(&alerts);
        assert!(rendered.contains("<b>dozor alerts</b>"));
        assert!(rendered.contains("[CRITICAL] db — service not running: state: exited"));
        assert!(rendered.contains("Action: restart it"));
    }

    // ── Remote watch ─────────────────────────────────────────────────────────

    fn remote(confirm: u32) -> RemoteWatch {
        RemoteWatch::new(
            RemoteWatchConfig {
                url: "http://remote.example/health".to_string(),
                interval: Duration::from_secs(30),
                confirm_count: confirm,
                flap_window: 10,
                flap_high_pct: 0.5,
                flap_low_pct: 0.25,
            },
            Arc::new(RecordingNotifier::default()),
        )
    }

    #[test]
    fn remote_confirms_before_alerting() {
        let rw = remote(2);
        assert!(rw.handle_probe(Err("timeout".to_string())).is_none());
        let msg = rw.handle_probe(Err("timeout".to_string())).unwrap();
        assert!(msg.contains("Remote DOWN"));
        assert!(msg.contains("timeout"));
        // Already-down state stays silent.
        assert!(rw.handle_probe(Err("timeout".to_string())).is_none());
    }

    #[test]
    fn remote_recovery_notice_once() {
        let rw = remote(1);
        rw.handle_probe(Err("refused".to_string())).unwrap();
        let msg = rw.handle_probe(Ok(())).unwrap();
        assert!(msg.contains("Remote recovered"));
        assert!(rw.handle_probe(Ok(())).is_none());
    }

    #[test]
    fn remote_success_resets_confirmation() {
        let rw = remote(3);
        assert!(rw.handle_probe(Err("x".to_string())).is_none());
        assert!(rw.handle_probe(Err("x".to_string())).is_none());
        assert!(rw.handle_probe(Ok(())).is_none());
        assert!(rw.handle_probe(Err("x".to_string())).is_none());
        assert!(rw.handle_probe(Err("x".to_string())).is_none());
        assert!(rw.handle_probe(Err("x".to_string())).is_some());
    }
}
