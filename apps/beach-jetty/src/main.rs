use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_jetty::{
    acceptor,
    cli::{Cli, Commands},
    config::{ConsoleConfig, ReapConfig, ServeConfig},
    console,
    handlers::{self, AppState},
    reaper::Reaper,
    telemetry::Telemetry,
    RelayEngine,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Blocking stdin reads of an attached console must not hold the process open.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;
    let result = runtime.block_on(run());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    match cli.into_command() {
        Commands::Serve(args) => {
            let config = ServeConfig::try_from(args)?;
            serve(config, telemetry.metrics_handle()).await
        }
        Commands::Console(args) => run_console(ConsoleConfig::try_from(args)?).await,
        Commands::Reap(args) => reap(ReapConfig::try_from(args)?).await,
    }
}

async fn serve(config: ServeConfig, metrics: PrometheusHandle) -> Result<()> {
    info!(
        tcp_listen = %config.tcp_listen,
        http_listen = %config.http_listen,
        store = %config.store.describe(),
        reap_interval_secs = config.reap_interval.map(|interval| interval.as_secs()),
        "starting beach-jetty relay"
    );

    let control = config.store.open().await?;
    let engine = RelayEngine::new(Arc::clone(&control));

    let tcp_listener = acceptor::bind(config.tcp_listen).await?;
    let http_listener = tokio::net::TcpListener::bind(config.http_listen)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.http_listen))?;
    let tcp_addr = tcp_listener.local_addr().context("transport listener address")?;
    let http_addr = http_listener.local_addr().context("http listener address")?;

    let shutdown = CancellationToken::new();
    let acceptor_task = tokio::spawn(acceptor::run(
        tcp_listener,
        Arc::clone(&engine),
        Arc::from(config.greeting.as_str()),
        shutdown.clone(),
    ));

    let reaper_task = config.reap_interval.map(|interval| {
        Reaper::new(Arc::clone(&control), config.settle, engine.reap_guard())
            .spawn_periodic(interval, shutdown.clone())
    });

    if config.console {
        let reaper = Reaper::new(Arc::clone(&control), config.settle, engine.reap_guard());
        let control = Arc::clone(&control);
        let templates = config.templates.clone();
        let quit = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) =
                console::run_stdio(control, reaper, &templates, console::DEFAULT_OUTPUT_TIMEOUT)
                    .await
            {
                error!(error = %err, "console failed");
            }
            quit.cancel();
        });
    }

    let router = handlers::router(AppState {
        engine: Arc::clone(&engine),
        metrics: Some(metrics),
        tcp_addr,
        http_addr,
    });
    info!(%tcp_addr, %http_addr, "beach-jetty listening");

    let stop = shutdown.clone();
    axum::serve(http_listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = stop.cancelled() => {}
            }
        })
        .await
        .context("http server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; ending sessions"
    );
    shutdown.cancel();
    engine.shutdown().await;
    if let Err(err) = acceptor_task.await {
        warn!(error = %err, "transport acceptor task failed");
    }
    if let Some(task) = reaper_task {
        task.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn run_console(config: ConsoleConfig) -> Result<()> {
    info!(store = %config.store.describe(), "starting operator console");
    let control = config.store.open().await?;
    let reaper = Reaper::standalone(Arc::clone(&control), config.settle);
    console::run_stdio(control, reaper, &config.templates, config.output_timeout).await
}

async fn reap(config: ReapConfig) -> Result<()> {
    let control = config.store.open().await?;
    let report = Reaper::standalone(control, config.settle).run_pass().await;
    for record in &report.removed {
        println!("removed {} ({})", record.id, record.label);
    }
    println!(
        "probed {} client(s), removed {}, retained {}",
        report.probed.len(),
        report.removed.len(),
        report.retained()
    );
    Ok(())
}
