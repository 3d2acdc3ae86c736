//! dozord, the dozor server-operations agent daemon.
//!
//! Wires the engine together: discovery over the container runtime, the
//! triage engine, auto-remediation, the watch loops, and the LLM agent loop
//! consuming escalations from the bus.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dozor_agent::{AgentConfig, AgentError, AgentLoop, ToolRegistry};
use dozor_alerts::Thresholds;
use dozor_bus::{Bus, BusMessage};
use dozor_config::Options;
use dozor_discovery::Discovery;
use dozor_provider::{ChatMessage, ChatProvider, OpenAiProvider};
use dozor_remedy::{Notifier, Remediator};
use dozor_security::SecurityAuditor;
use dozor_transport::Transport;
use dozor_triage::{DevMode, TriageConfig, TriageEngine};
use dozor_watch::{
    KnowledgeBase, LlmHealthProbe, RemoteWatch, RemoteWatchConfig, WatchConfig, WatchLoop,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod notify;
mod tools;

use notify::{LogNotifier, WebhookNotifier};

#[derive(Parser)]
#[command(name = "dozord")]
#[command(about = "AI server-operations agent for a container fleet")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: watch loops, bus consumer, event listener
    Run,

    /// Run one triage pass and print the report
    Triage {
        /// Comma-separated services to narrow the pass
        #[arg(long)]
        services: Option<String>,
    },

    /// Run the security audit and print the findings
    Audit,

    /// Execute one registered tool (testing / system.run)
    ///
    /// Examples:
    ///   dozord exec triage_report
    ///   dozord exec service_logs --params '{"service":"api","lines":200}'
    Exec {
        /// Tool name (e.g. triage_report, service_logs, restart_service)
        tool: String,

        /// JSON arguments for the tool
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean for exec output.
    if !matches!(cli.command, Commands::Exec { .. }) {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(
                EnvFilter::from_default_env()
                    .add_directive("dozord=info".parse()?)
                    .add_directive("dozor_watch=info".parse()?)
                    .add_directive("dozor_triage=info".parse()?)
                    .add_directive("dozor_agent=info".parse()?),
            )
            .init();
    }

    dotenvy::dotenv().ok();
    let opts = Options::from_env();

    match cli.command {
        Commands::Run => run_daemon(opts).await,
        Commands::Triage { services } => triage_once(opts, services).await,
        Commands::Audit => audit_once(opts).await,
        Commands::Exec { tool, params } => exec_tool(opts, &tool, &params).await,
    }
}

// ─── Engine assembly ──────────────────────────────────────────────────────────

struct Engine {
    opts: Options,
    transport: Arc<dyn Transport>,
    discovery: Arc<Discovery>,
    dev_mode: Arc<DevMode>,
    triage: Arc<TriageEngine>,
    auditor: Arc<SecurityAuditor>,
    notifier: Arc<dyn Notifier>,
}

fn build_engine(opts: Options) -> anyhow::Result<Engine> {
    let transport = dozor_transport::for_host(&opts.host, opts.ssh_port, opts.timeout);
    let discovery = Arc::new(Discovery::connect().context("connect to container runtime")?);

    let dev_mode = Arc::new(DevMode::new());
    for (service, ttl) in &opts.dev_exclusions {
        dev_mode.exclude(service.clone(), *ttl);
    }

    let thresholds = Thresholds {
        cpu_pct: opts.cpu_threshold,
        memory_pct: opts.memory_threshold,
        disk_warn_pct: opts.disk_warn_threshold,
        disk_crit_pct: opts.disk_crit_threshold,
        error_count: opts.error_threshold,
        restart_count: opts.restart_threshold,
    };
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let triage = Arc::new(TriageEngine::new(
        discovery.clone(),
        transport.clone(),
        dev_mode.clone(),
        TriageConfig {
            services: opts.services.clone(),
            log_lines: opts.log_lines,
            thresholds,
        },
        host,
    ));

    let auditor = Arc::new(SecurityAuditor::new(
        transport.clone(),
        opts.required_auth_vars.clone(),
        opts.compose_path.clone(),
    ));

    let notifier: Arc<dyn Notifier> = match &opts.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(Engine {
        opts,
        transport,
        discovery,
        dev_mode,
        triage,
        auditor,
        notifier,
    })
}

fn build_provider(opts: &Options) -> anyhow::Result<Option<Arc<dyn ChatProvider>>> {
    let Some(api_key) = &opts.llm_api_key else {
        return Ok(None);
    };
    let base_url = opts
        .llm_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    let provider = OpenAiProvider::new(&base_url, api_key.clone(), opts.llm_model.clone())
        .context("build LLM provider")?;
    Ok(Some(Arc::new(provider)))
}

// ─── Run ──────────────────────────────────────────────────────────────────────

async fn run_daemon(opts: Options) -> anyhow::Result<()> {
    let engine = build_engine(opts)?;
    let opts = engine.opts.clone();
    info!(
        host = %opts.host,
        interval_secs = opts.watch_interval.as_secs(),
        services = ?opts.services,
        target = %engine.transport.target(),
        "dozord starting"
    );

    let cancel = CancellationToken::new();
    let bus = Arc::new(Bus::new());

    let registry = Arc::new(tools::build_registry(
        engine.triage.clone(),
        engine.discovery.clone(),
        engine.auditor.clone(),
        engine.dev_mode.clone(),
        opts.log_lines,
    ));

    let provider = build_provider(&opts)?;

    // Container event listener invalidates the discovery cache.
    let listener = {
        let discovery = engine.discovery.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { discovery.run_event_listener(cancel).await })
    };

    // Watch loop.
    let remediator = Arc::new(Remediator::new(
        engine.discovery.clone(),
        opts.suppress_warnings.clone(),
    ));
    let watch_config = WatchConfig {
        interval: opts.watch_interval,
        systemd_services: opts.systemd_services.clone(),
        repeat_after: opts.repeat_after,
        confirm_count: opts.alert_confirm_count,
        flap_window: opts.flap_window,
        flap_high_pct: opts.flap_high_pct,
        flap_low_pct: opts.flap_low_pct,
        ..Default::default()
    };
    let mut watch = WatchLoop::new(
        engine.triage.clone(),
        remediator,
        engine.notifier.clone(),
        bus.clone(),
        engine.dev_mode.clone(),
        engine.transport.clone(),
        KnowledgeBase::builtin(),
        watch_config,
    );
    if let Some(provider) = &provider {
        watch = watch.with_llm_probe(Arc::new(LlmKeyProbe {
            provider: provider.clone(),
        }));
    }
    let watch_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watch.run(cancel).await })
    };

    // Remote watch, when a secondary target is configured. A bare remote
    // host is probed over plain HTTP.
    let remote_url = opts
        .remote_url
        .clone()
        .or_else(|| opts.remote_host.clone().map(|h| format!("http://{h}/")));
    let remote_task = remote_url.map(|url| {
        let remote = RemoteWatch::new(
            RemoteWatchConfig {
                url,
                interval: opts.remote_interval,
                confirm_count: opts.alert_confirm_count,
                flap_window: opts.flap_window,
                flap_high_pct: opts.flap_high_pct,
                flap_low_pct: opts.flap_low_pct,
            },
            engine.notifier.clone(),
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { remote.run(cancel).await })
    });

    // Bus consumer: the agent loop, or a notifier fallback without an LLM.
    let consumer_task = match provider {
        Some(provider) => {
            let agent = AgentLoop::new(
                provider,
                registry,
                AgentConfig {
                    max_iterations: opts.max_tool_iterations,
                    max_tool_result_len: opts.max_tool_result_len,
                    max_repeat_fails: opts.max_repeat_fails,
                    ..Default::default()
                },
            );
            let bus = bus.clone();
            let notifier = engine.notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent_consumer(agent, bus, notifier, cancel).await })
        }
        None => {
            warn!("no LLM configured; escalations will be delivered to the notifier");
            let bus = bus.clone();
            let notifier = engine.notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { fallback_consumer(bus, notifier, cancel).await })
        }
    };

    info!("dozord ready");
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    cancel.cancel();
    bus.close();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = watch_task.await;
        let _ = consumer_task.await;
        let _ = listener.await;
        if let Some(task) = remote_task {
            let _ = task.await;
        }
    })
    .await;

    info!("dozord stopped");
    Ok(())
}

async fn agent_consumer(
    mut agent: AgentLoop,
    bus: Arc<Bus>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    while let Some(msg) = bus.consume_inbound(&cancel).await {
        info!(subsystem = "agent", id = %msg.id, sender = %msg.sender, "processing message");
        match agent.process(&msg.text, &cancel).await {
            Ok(answer) => {
                bus.publish_outbound(BusMessage::new(msg.channel.clone(), "agent", answer.clone()));
                if msg.channel == "internal" {
                    notifier.notify(&answer).await;
                }
            }
            Err(AgentError::Cancelled) => break,
            Err(e) => {
                error!(subsystem = "agent", id = %msg.id, error = %e, "agent run failed");
                notifier
                    .notify(&format!("<b>agent error</b>: {e}"))
                    .await;
            }
        }
    }
    info!(subsystem = "agent", "bus consumer shutting down");
}

async fn fallback_consumer(bus: Arc<Bus>, notifier: Arc<dyn Notifier>, cancel: CancellationToken) {
    while let Some(msg) = bus.consume_inbound(&cancel).await {
        notifier
            .notify(&format!("<b>Escalation (no LLM configured)</b>\n{}", msg.text))
            .await;
    }
    info!(subsystem = "bus", "fallback consumer shutting down");
}

/// Cheap credential check used by the watch add-ons.
struct LlmKeyProbe {
    provider: Arc<dyn ChatProvider>,
}

#[async_trait::async_trait]
impl LlmHealthProbe for LlmKeyProbe {
    async fn check(&self) -> Option<dozor_proto::Alert> {
        match self.provider.chat(&[ChatMessage::user("ping")], &[]).await {
            Err(e) if e.is_auth() => Some(dozor_proto::Alert::new(
                dozor_proto::AlertLevel::Warning,
                "llm",
                "LLM credential rejected",
                e.to_string(),
                "rotate the API key before the next escalation needs it",
            )),
            _ => None,
        }
    }
}

// ─── One-shot commands ────────────────────────────────────────────────────────

async fn triage_once(opts: Options, services: Option<String>) -> anyhow::Result<()> {
    let engine = build_engine(opts)?;
    let explicit = services
        .as_deref()
        .map(dozor_config::parse_name_list)
        .filter(|list| !list.is_empty());
    let cancel = CancellationToken::new();
    let outcome = engine.triage.run(explicit, Vec::new(), &cancel).await;
    println!("{}", outcome.text);
    Ok(())
}

async fn audit_once(opts: Options) -> anyhow::Result<()> {
    let engine = build_engine(opts)?;
    let report = engine.auditor.audit(&CancellationToken::new()).await;
    println!("{}", report.render());
    Ok(())
}

async fn exec_tool(opts: Options, tool: &str, params: &str) -> anyhow::Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(params).map_err(|e| anyhow::anyhow!("invalid JSON params: {e}"))?;

    let engine = build_engine(opts)?;
    let registry: ToolRegistry = tools::build_registry(
        engine.triage.clone(),
        engine.discovery.clone(),
        engine.auditor.clone(),
        engine.dev_mode.clone(),
        engine.opts.log_lines,
    );

    match registry.execute(tool, &args, &CancellationToken::new()).await {
        Ok(result) => {
            println!("{result}");
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
