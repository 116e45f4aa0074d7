use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use herald_core::{ChannelRegistry, HeraldConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    backoff::RetryPolicy,
    clock::Clock,
    engine::Scheduler,
    error::Result,
    notifier::Notifier,
    service::NotificationService,
    store::JobStore,
    worker::DeliveryPool,
};

/// Running scheduler and delivery workers.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop ticking, let the workers finish what is already queued, and wait.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.scheduler.await {
            warn!(%error, "scheduler task panicked");
        }
        join_all(self.workers)
            .await
            .into_iter()
            .for_each(|result| {
                if let Err(error) = result {
                    warn!(%error, "delivery worker task panicked");
                }
            });
        info!("engine stopped");
    }
}

/// Build and spawn the engine described by `config`.
///
/// Registers every configured channel with the notifier, then starts the
/// scheduler loop and the delivery pool. The returned service is wired to
/// wake the scheduler on every schedule/reschedule.
pub async fn start(
    config: &HeraldConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
) -> Result<(NotificationService, EngineHandle)> {
    let channels = ChannelRegistry::from_configs(&config.channels)?;
    for channel in channels.iter() {
        match notifier.register_channel(channel).await {
            Ok(()) => info!(channel = %channel.id, "channel registered"),
            Err(e) => warn!(channel = %channel.id, "channel registration failed: {e}"),
        }
    }

    let policy = RetryPolicy::from_config(&config.delivery);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(config.scheduler.dispatch_capacity.max(1));

    let timeout = Duration::from_secs(config.delivery.timeout_secs.max(1));
    let mut scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&clock), dispatch_tx)
        .with_tick_interval(Duration::from_millis(config.scheduler.tick_interval_ms.max(1)))
        .with_lease(timeout * 2);
    if let Some(keep_secs) = config.retention.finished_after_secs {
        scheduler = scheduler.with_retention(
            Duration::from_secs(keep_secs),
            Duration::from_secs(config.retention.sweep_interval_secs.max(1)),
        );
    }

    let service = NotificationService::new(Arc::clone(&store), Arc::clone(&clock))
        .with_channels(channels)
        .with_retry_policy(policy)
        .with_waker(scheduler.waker());

    let pool = DeliveryPool::new(store, clock, notifier, policy)
        .with_timeout(timeout)
        .with_workers(config.delivery.workers);
    let workers = Arc::new(pool).spawn(dispatch_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(scheduler.run(shutdown_rx));
    info!(workers = workers.len(), "engine started");

    Ok((
        service,
        EngineHandle {
            shutdown_tx,
            scheduler,
            workers,
        },
    ))
}
