use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use eew_correlator::engine::types::{Action, EngineStats};
use eew_correlator::{cli, config, dispatch, engine, feed, http};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,eew_correlator=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn forward_actions(actions: Vec<Action>, tx: &mpsc::Sender<Action>) {
    for action in actions {
        if let Err(err) = tx.try_send(action) {
            tracing::warn!(error = %err, "dispatch queue full; dropping outbound notification");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing()?;
    let config = config::Config::from_env(&args)?;

    tracing::info!(mag_types = ?config.mag_types, "listening to magnitude types");
    if config.email.is_none() {
        tracing::info!("sending email has been disabled");
    }
    if config.report_enabled {
        tracing::info!(dir = %config.report_dir.display(), "reports are stored on disk");
    } else {
        tracing::info!("saving reports to disk has been disabled");
    }
    if config.playback {
        tracing::info!("playback mode: bus and email transports disabled");
    }

    let cancel = CancellationToken::new();
    let (feed_tx, mut feed_rx) = mpsc::channel::<engine::Inbound>(4096);
    let (action_tx, action_rx) = mpsc::channel::<Action>(256);
    let (stats_tx, stats_rx) = watch::channel(EngineStats::default());

    dispatch::DispatchService::new(config.clone()).start(action_rx, cancel.clone())?;

    let engine_config = config.engine_config();
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move {
        let mut engine = engine::Engine::new(engine_config);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = worker_cancel.cancelled() => break,
                maybe = feed_rx.recv() => {
                    let Some(inbound) = maybe else { break };
                    forward_actions(engine.handle(inbound, Utc::now()), &action_tx);
                    let _ = stats_tx.send(engine.stats());
                }
                _ = tick.tick() => {
                    forward_actions(engine.on_tick(Utc::now()), &action_tx);
                    let _ = stats_tx.send(engine.stats());
                }
            }
        }
    });

    let app = http::router(http::HttpState { stats: stats_rx });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind status listener on {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "status endpoint listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let feed_config = config.clone();
    let feed_cancel = cancel.clone();
    let feed_handle = tokio::spawn(async move {
        if let Err(err) = feed::run(feed_config, feed_tx, feed_cancel.clone()).await {
            tracing::error!(error = %err, "inbound feed failed");
            feed_cancel.cancel();
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
        _ = http_handle => {}
    }

    cancel.cancel();
    let _ = worker.await;
    feed_handle.abort();

    Ok(())
}
