use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use credgate_auth::manager::{Manager, ManagerConfig};
use credgate_auth::{LoginOptions, TokenStore, spawn_refresh_worker};
use credgate_management::{ManagementState, management_router};
use credgate_providers::builtin_registry;
use credgate_usage::UsageHub;

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("credgate.json"));
    let mut config = credgate_common::load_config(Some(&config_path))?;
    if let Some(host) = cli.host.clone() {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let store = TokenStore::new(&config.auth_dir);
    store.ensure_dir().await?;
    let manager = Arc::new(Manager::new(
        store,
        builtin_registry(),
        ManagerConfig::from_global(&config),
    ));
    let loaded = manager.load().await?;
    info!(loaded, auth_dir = %config.auth_dir.display(), "credentials loaded");

    match cli.command {
        Some(Command::Login {
            provider,
            label,
            idp,
            import,
            import_ide,
            no_browser,
        }) => {
            let import_path = match import {
                Some(path) => Some(path),
                None if import_ide => {
                    let home = std::env::var_os("HOME")
                        .map(PathBuf::from)
                        .unwrap_or_default();
                    let found = credgate_providers::kiro::ide_token_candidates(&home)
                        .into_iter()
                        .find(|path| path.is_file());
                    match found {
                        Some(path) => {
                            info!(path = %path.display(), "found IDE token cache");
                            Some(path)
                        }
                        None => anyhow::bail!("no Kiro IDE token cache found"),
                    }
                }
                None => None,
            };
            let options = LoginOptions {
                label,
                no_browser,
                import_path,
                idp,
            };
            let record = manager.login(&config, &provider, &options).await?;
            println!("registered {} ({})", record.id, record.label);
            Ok(())
        }
        Some(Command::Serve) | None => serve(config, manager).await,
    }
}

async fn serve(config: credgate_common::GlobalConfig, manager: Arc<Manager>) -> Result<()> {
    if config.management_password.is_none() {
        anyhow::bail!(
            "management password missing: set {}",
            credgate_common::MANAGEMENT_PASSWORD_ENV
        );
    }

    let worker = spawn_refresh_worker(manager.clone(), config.refresh_tick());

    let client = credgate_providers::http::build_client(config.proxy.as_deref())?;
    let state = ManagementState {
        manager,
        usage: UsageHub::new(),
        config: Arc::new(config.clone()),
        client,
    };

    let app = axum::Router::new().nest("/v0/management", management_router(state));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "management listener up");
    axum::serve(listener, app).await?;

    worker.abort();
    Ok(())
}
