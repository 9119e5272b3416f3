use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use decistrip::bot::{BotHandler, SessionStore};
use decistrip::cli::{Cli, Command, run_cleanup_command, run_status_command};
use decistrip::config::Config;
use decistrip::instance::{
    ConflictController, InstanceGuard, OsProcesses, PollDriver, PollOptions, ShutdownOutcome,
    Startup, WebhookApi, start_until,
};
use decistrip::keep_alive::KeepAliveServer;
use decistrip::telegram::{TelegramClient, TelegramPoller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = match Config::from_env(cli.home.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.log_json);
            return Err(e).context("Failed to load configuration");
        }
    };
    init_tracing(cli.log_json || config.log_json);

    match cli.effective_command() {
        Command::Status => run_status_command(&config.instance),
        Command::Cleanup => run_cleanup_command(&config.instance),
        Command::Run => run(config).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).compact().init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let token = config.telegram.require_token()?;
    // Installed before anything is acquired so a signal during startup
    // still goes through the shutdown path.
    let mut signal = shutdown_signal();

    let guard = Arc::new(InstanceGuard::new(
        config.instance.clone(),
        Arc::new(OsProcesses),
    ));
    let client = Arc::new(TelegramClient::new(token, config.telegram.api_base.clone()));
    match client.get_me().await {
        Ok(me) => tracing::info!(
            bot = me.username.as_deref().unwrap_or(&me.first_name),
            "Authenticated with the bot API"
        ),
        Err(e) => tracing::warn!(error = %e, "Could not identify bot; continuing"),
    }

    let api: Arc<dyn WebhookApi> = client.clone();
    let handler = Arc::new(BotHandler::new(
        Arc::clone(&client),
        Arc::new(SessionStore::new()),
    ));
    let controller = Arc::new(ConflictController::new(
        Arc::clone(&guard),
        Some(Arc::clone(&api)),
    ));
    let driver: Arc<dyn PollDriver> = Arc::new(TelegramPoller::new(
        Arc::clone(&client),
        handler,
        controller.clone(),
    ));
    controller.attach_driver(&driver);

    let options = PollOptions {
        drop_pending_updates: false,
        timeout: config.telegram.poll_timeout,
    };
    let startup = start_until(
        &guard,
        Arc::clone(&driver),
        Some(Arc::clone(&api)),
        options,
        &mut signal,
    )
    .await;
    match startup {
        Ok(Startup::Started) => {}
        Ok(Startup::Interrupted(signal)) => {
            tracing::info!(signal, "Shutdown signal received during startup");
            return Ok(());
        }
        Err(e) => {
            guard.reclaim();
            return Err(e).context("Bot failed to start");
        }
    }
    tracing::info!(pid = std::process::id(), "Bot started successfully");

    // Independent of the lock stack; a bind failure only costs the
    // health endpoint.
    let mut keep_alive = KeepAliveServer::new(config.keep_alive.clone());
    if let Err(e) = keep_alive.start().await {
        tracing::error!(error = %e, "Failed to start keep-alive server");
    }

    tokio::select! {
        signal = &mut signal => tracing::info!(signal, "Shutdown signal received"),
        _ = driver.idle() => tracing::info!("Polling stopped"),
    }

    match guard.shutdown(Some(driver), Some(api)).await {
        ShutdownOutcome::Completed => tracing::info!("Shutdown complete"),
        ShutdownOutcome::AlreadyInProgress => {
            // The conflict controller is tearing down and will exit the
            // process itself; the watchdog bounds the wait.
            tracing::info!("Shutdown already in progress elsewhere");
            while guard.is_shutting_down() {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    keep_alive.shutdown().await;
    Ok(())
}

type ShutdownSignal = Pin<Box<dyn Future<Output = &'static str> + Send>>;

/// Register SIGINT and SIGTERM handlers now and return a future that
/// resolves with the name of the first signal delivered.
fn shutdown_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut int), Ok(mut term)) => {
                return Box::pin(async move {
                    tokio::select! {
                        _ = int.recv() => "SIGINT",
                        _ = term.recv() => "SIGTERM",
                    }
                });
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Could not install signal handlers; using ctrl-c only");
            }
        }
    }
    Box::pin(async {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    })
}
