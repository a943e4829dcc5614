mod api;
mod config;
mod dispatcher;
mod formatter;
mod languages;
mod runner;
mod templates;
mod terminal;
mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::languages::LanguageTable;
use crate::runner::ShellRunner;
use crate::workspace::Workspace;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("polyrun=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env();

    // Load language configurations
    let languages = match &config.languages_config {
        Some(path) => LanguageTable::load(path)
            .with_context(|| format!("Failed to load languages from {}", path.display()))?,
        None => LanguageTable::builtin()?,
    };
    info!(
        "Loaded {} languages: {}",
        languages.len(),
        languages.supported_languages().join(", ")
    );
    for config in languages.iter() {
        debug!(
            "{}: extensions [{}], aliases [{}]",
            config.name,
            config.extensions.join(", "),
            config.aliases.join(", ")
        );
    }
    let languages = Arc::new(languages);

    let workspace = Workspace::open(&config.workspace_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to open workspace {}",
                config.workspace_dir.display()
            )
        })?;
    info!("Workspace: {}", workspace.root().display());

    let dispatcher = Dispatcher::new(
        workspace.clone(),
        languages.clone(),
        Arc::new(ShellRunner::new()),
        config.limits(),
    )
    .with_max_concurrent(config.max_concurrent_runs);
    if config.max_concurrent_runs > 0 {
        info!("Concurrent runs limited to {}", config.max_concurrent_runs);
    }

    let state = AppState {
        workspace,
        dispatcher,
        languages,
    };
    let app = api::build_router(state, config.static_dir.as_deref());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Polyrun listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
