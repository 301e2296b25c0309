use clap::Parser;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};

use despacho::cli::{Cli, CliHandler, Commands};
use despacho::config::Config;
use despacho::mail::fetcher::ScriptFetcher;
use despacho::mail::radar::Radar;
use despacho::notion::client::NotionClient;
use despacho::scheduler::{ExitReason, Scheduler};
use despacho::state::StateStore;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("despacho=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Configuration trouble is exit code 2, always.
    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "configuration error");
            exit(2);
        }
    };

    match cli.command {
        Some(Commands::Stats) => {
            let handler = match CliHandler::new(&config).await {
                Ok(handler) => handler,
                Err(e) => {
                    error!(error = %e, "could not open state store");
                    exit(1);
                }
            };
            if let Err(e) = handler.handle_stats().await {
                error!(error = %e, "stats failed");
                exit(1);
            }
        }
        Some(Commands::DeadLetter { action }) => {
            let handler = match CliHandler::new(&config).await {
                Ok(handler) => handler,
                Err(e) => {
                    error!(error = %e, "could not open state store");
                    exit(1);
                }
            };
            if let Err(e) = handler.handle_dead_letter(action).await {
                error!(error = %e, "dead-letter command failed");
                exit(1);
            }
        }
        Some(Commands::Once) => {
            let mut scheduler = match build_scheduler(&config).await {
                Ok(scheduler) => scheduler,
                Err(code) => exit(code),
            };
            scheduler.run_once().await;
            info!(stats = ?scheduler.stats(), "single cycle complete");
        }
        None => {
            let mut scheduler = match build_scheduler(&config).await {
                Ok(scheduler) => scheduler,
                Err(code) => exit(code),
            };
            match scheduler.run().await {
                ExitReason::Shutdown => exit(0),
                ExitReason::AuthFailure => exit(3),
            }
        }
    }
}

/// Wire the production components together. Returns the exit code on
/// failure: missing index is configuration (2), everything else is 1.
async fn build_scheduler(config: &Arc<Config>) -> Result<Scheduler, i32> {
    let index_path = match &config.mail_index_path {
        Some(path) => path.clone(),
        None => match Radar::discover_index_path() {
            Some(path) => path,
            None => {
                error!("mail index not found; set mail_index_path or grant disk access");
                return Err(2);
            }
        },
    };
    if !index_path.exists() {
        error!(path = %index_path.display(), "mail index file does not exist");
        return Err(2);
    }

    let store = match StateStore::new(&config.state_db_path).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "could not open state store");
            return Err(1);
        }
    };

    let radar = match Radar::open(&index_path, config.sync_mailboxes.clone()).await {
        Ok(radar) => radar,
        Err(e) => {
            error!(error = %e, "could not open mail index");
            return Err(2);
        }
    };

    let mail = Arc::new(ScriptFetcher::new(
        config.mail_account_name.clone(),
        config.script_timeout_s,
    ));
    let notion = Arc::new(NotionClient::new(config.notion_token.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    Ok(Scheduler::new(
        Arc::clone(config),
        store,
        radar,
        mail,
        notion,
        shutdown_rx,
    ))
}
