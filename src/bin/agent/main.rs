mod face;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use webpilot::config::AgentArgs;
use webpilot::{ChromeSession, Controller, Executor, OllamaClient, logging};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = AgentArgs::parse();
    logging::init_stderr();

    info!(model = %args.model, ollama = %args.ollama_url, "starting browser agent");

    let client = OllamaClient::new(&args.ollama_url, &args.model, args.inference_timeout())
        .context("building inference client")?;
    let (event_tx, _) = broadcast::channel(64);
    let controller = Controller::new(
        client,
        Executor::new(args.executor_config()),
        args.controller_config(),
    )
    .with_events(event_tx.clone());
    let state = Arc::new(face::AppState::new(controller, event_tx, args.max_iterations));

    // Serve the API right away; tasks get 503 until Chrome is up.
    let browser_config = args.browser_config();
    let launcher = state.clone();
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || ChromeSession::acquire(&browser_config)).await {
            Ok(Ok(session)) => launcher.install_session(session).await,
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "browser launch failed"),
            Err(e) => error!(error = %e, "browser launch panicked"),
        }
    });

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("binding port {}", args.port))?;
    info!("task API listening on http://localhost:{}", args.port);

    axum::serve(listener, face::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving task API")?;

    if let Some(session) = state.take_session().await {
        tokio::task::spawn_blocking(move || session.release()).await?;
    }
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
