use std::sync::Arc;
use std::sync::atomic::Ordering;

use replyloop::config::AppConfig;
use replyloop::dispatch::{Dispatcher, MessageTemplate};
use replyloop::mailbox::HttpMailboxClient;
use replyloop::metrics::OutcomeAggregator;
use replyloop::monitor::routes::{monitor_routes, MonitorRouteState};
use replyloop::monitor::scheduler::{spawn_monitor_loop, spawn_sweep_loop};
use replyloop::monitor::ReplyMonitor;
use replyloop::quota::QuotaLedger;
use replyloop::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env()?;

    // Initialize tracing; optionally tee into a daily rolling file
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _file_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "replyloop.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📡 ReplyLoop v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Trigger API: http://{}/api/monitor/run", config.bind_addr);
    eprintln!("   Metrics API: http://{}/api/metrics/outcomes", config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Mailbox client ───────────────────────────────────────────────────
    let mailbox = Arc::new(HttpMailboxClient::new(
        config.provider.clone(),
        Arc::clone(&db),
    )?);
    eprintln!("   Provider: {}", config.provider.api_base);

    // ── Core components ──────────────────────────────────────────────────
    let monitor = Arc::new(ReplyMonitor::new(
        Arc::clone(&db),
        mailbox.clone(),
        config.monitor.clone(),
    ));
    let aggregator = Arc::new(OutcomeAggregator::new(Arc::clone(&db)));
    let quota = Arc::new(QuotaLedger::new(Arc::clone(&db), config.quota.clone()));

    let initial_template = match (
        std::env::var("REPLYLOOP_TEMPLATE_SUBJECT"),
        std::env::var("REPLYLOOP_TEMPLATE_BODY"),
    ) {
        (Ok(subject), Ok(body)) => Some(MessageTemplate { subject, body }),
        _ => None,
    };
    let follow_up_template = MessageTemplate {
        subject: std::env::var("REPLYLOOP_FOLLOW_UP_SUBJECT")
            .unwrap_or_else(|_| "Following up".to_string()),
        body: std::env::var("REPLYLOOP_FOLLOW_UP_BODY").unwrap_or_else(|_| {
            "Just floating this back to the top of your inbox — any thoughts?".to_string()
        }),
    };
    eprintln!(
        "   Initial dispatch: {}",
        if initial_template.is_some() { "enabled" } else { "disabled (follow-ups only)" }
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        mailbox.clone(),
        Arc::clone(&quota),
        config.monitor.clone(),
        initial_template,
        follow_up_template,
    ));

    // ── Background loops ─────────────────────────────────────────────────
    let (_monitor_handle, monitor_shutdown) =
        spawn_monitor_loop(Arc::clone(&monitor), config.monitor.poll_interval);
    let (_sweep_handle, sweep_shutdown) =
        spawn_sweep_loop(Arc::clone(&monitor), &config.monitor.sweep_schedule)?;

    // Dispatch rides the poll interval too, offset by the monitor's jitter.
    let dispatch_shutdown = {
        let dispatcher = Arc::clone(&dispatcher);
        let interval = config.monitor.poll_interval;
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let summary = dispatcher.run_once().await;
                for error in &summary.errors {
                    tracing::warn!(error = %error, "Dispatch error");
                }
            }
        });
        flag
    };

    // ── HTTP trigger surface ─────────────────────────────────────────────
    let app = monitor_routes(MonitorRouteState {
        monitor: Arc::clone(&monitor),
        aggregator,
        secret: config.trigger.secret.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Trigger server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    monitor_shutdown.store(true, Ordering::Relaxed);
    sweep_shutdown.store(true, Ordering::Relaxed);
    dispatch_shutdown.store(true, Ordering::Relaxed);

    Ok(())
}
