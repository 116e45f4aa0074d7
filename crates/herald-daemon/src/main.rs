//! # herald
//!
//! Usage:
//!   herald run                                              # scheduler + workers until Ctrl-C
//!   herald schedule --channel reminders --title Hi --in 60  # one-shot in a minute
//!   herald schedule --channel digest --title D --daily 08:00 --unique digest
//!   herald list --state pending
//!   herald cancel <ID>
//!   herald disable promotions                               # off switch, cancels live jobs

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use herald_core::config::NotifierKind;
use herald_core::{ChannelRegistry, HeraldConfig, Notification};
use herald_scheduler::{
    db, Clock, JobFilter, JobStore, NotificationService, Notifier, RetryPolicy, SqliteJobStore,
    SystemClock, UniquePolicy,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod notifier;

use cli::{Cli, Commands};
use notifier::{LogNotifier, WebhookNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "herald=debug,herald_scheduler=debug"
    } else {
        "herald=info,herald_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // config: --config > HERALD_CONFIG env > ~/.herald/herald.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("HERALD_CONFIG").ok());
    let config = HeraldConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db::open(db_path)?)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    execute(cli.command, &config, store, clock).await
}

async fn run(config: &HeraldConfig, store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Result<()> {
    let notifier: Arc<dyn Notifier> = match config.notifier.kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Webhook => Arc::new(WebhookNotifier::new(
            &config.channels,
            Duration::from_secs(config.delivery.timeout_secs.max(1)),
        )?),
    };

    let (_service, handle) = herald_scheduler::start(config, store, clock, notifier).await?;
    info!("herald running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

async fn execute(
    command: Commands,
    config: &HeraldConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    let now = clock.now();
    let service = NotificationService::new(Arc::clone(&store), Arc::clone(&clock))
        .with_channels(ChannelRegistry::from_configs(&config.channels)?)
        .with_retry_policy(RetryPolicy::from_config(&config.delivery));

    match command {
        Commands::Run => run(config, store, clock).await?,

        Commands::Schedule {
            channel,
            title,
            body,
            data,
            trigger,
            unique,
            replace,
        } => {
            let mut notification = Notification::new(title, body);
            if let Some(data) = data {
                notification.data = Some(serde_json::from_str(&data)?);
            }
            let payload = notification.to_payload();
            let trigger = trigger.into_trigger(now)?;
            let id = match unique {
                Some(key) => {
                    let policy = if replace {
                        UniquePolicy::Replace
                    } else {
                        UniquePolicy::Keep
                    };
                    service.schedule_unique(&key, &channel, payload, trigger, policy)?
                }
                None => service.schedule(&channel, payload, trigger)?,
            };
            println!("{id}");
        }

        Commands::Cancel { id } => {
            service.cancel(&id)?;
            println!("cancelled {id}");
        }

        Commands::CancelChannel { channel } => {
            let n = service.cancel_channel(&channel)?;
            println!("cancelled {n} job(s) on {channel}");
        }

        Commands::Enable { channel } => {
            service.set_channel_enabled(&channel, true)?;
            println!("{channel} enabled");
        }

        Commands::Disable { channel } => {
            let n = service.set_channel_enabled(&channel, false)?;
            println!("{channel} disabled, cancelled {n} job(s)");
        }

        Commands::Reschedule { id, trigger } => {
            service.reschedule(&id, trigger.into_trigger(now)?)?;
            let job = service.query(&id)?;
            println!("{id} next fires at {}", job.trigger_time.to_rfc3339());
        }

        Commands::Show { id } => {
            let job = service.query(&id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        Commands::List {
            channel,
            state,
            limit,
        } => {
            let jobs = service.list(&JobFilter {
                channel,
                state,
                limit,
            })?;
            for job in &jobs {
                println!(
                    "{}  {:<9}  {:<25}  {}  attempt {}/{}",
                    job.id,
                    job.state,
                    job.trigger_time.to_rfc3339(),
                    job.channel,
                    job.attempt,
                    job.max_attempts,
                );
            }
            if jobs.is_empty() {
                println!("no jobs");
            }
        }

        Commands::Purge { older_than } => {
            let n = service.purge_finished(Duration::from_secs(older_than))?;
            println!("purged {n} finished job(s)");
        }
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
