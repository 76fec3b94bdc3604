//! The monitoring loop
//!
//! Each iteration refreshes the service heartbeat records, fetches every
//! request needing attention, and reconciles them one at a time — submission
//! for newly approved requests, cascade removal for requests marked for
//! deletion, status monitoring for everything else. Reconciliation is
//! deliberately serial: one request at a time on one thread, so aggregation
//! within a request subtree is never racing itself.

use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use prodsys::config::MonitoringConfig;
use prodsys::grid::GridInterface;
use prodsys::models::{LocalStatus, RequestModel, ServiceStatus};
use prodsys::reconciler::Reconciler;
use prodsys::store::Store;
use prodsys::template::ScriptTemplate;

pub struct MonitoringDaemon {
    store: Store,
    grid: Box<dyn GridInterface>,
    template: ScriptTemplate,
    config: MonitoringConfig,
    max_reschedules: i32,
}

impl MonitoringDaemon {
    pub fn new(
        store: Store,
        grid: Box<dyn GridInterface>,
        template: ScriptTemplate,
        config: MonitoringConfig,
        max_reschedules: i32,
    ) -> Self {
        Self {
            store,
            grid,
            template,
            config,
            max_reschedules,
        }
    }

    /// Run the monitoring loop until interrupted. The "monitord" heartbeat is
    /// set to down on the way out so dashboards see a clean shutdown rather
    /// than a stale record.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting monitoring loop with interval = {} minute(s)",
            self.config.interval_mins
        );
        let delay = Duration::from_secs_f64(self.config.interval_mins * 60.0);

        let shutdown = shutdown_signal()?;
        tokio::pin!(shutdown);

        loop {
            self.check_services().await;
            self.monitor_requests().await;

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, exiting monitoring loop");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Err(err) = self
            .store
            .upsert_service("monitord", ServiceStatus::Down)
            .await
        {
            error!(
                "Error updating the status of the monitoring daemon: {:#}",
                err
            );
        }
        Ok(())
    }

    /// Refresh the heartbeat records: probe the grid backend's reachability
    /// and mark this daemon as up.
    async fn check_services(&self) {
        let grid_status = match self.grid.ping().await {
            Ok(true) => ServiceStatus::Up,
            Ok(false) => ServiceStatus::Down,
            Err(err) => {
                error!(
                    "Couldn't connect to grid backend to get status: {:#}",
                    err
                );
                ServiceStatus::Unknown
            }
        };
        if let Err(err) = self.store.upsert_service("grid", grid_status).await {
            error!("Error updating grid service status: {:#}", err);
        }

        if let Err(err) = self.store.upsert_service("monitord", ServiceStatus::Up).await {
            error!("Error updating monitord service status: {:#}", err);
        }
    }

    /// Reconcile every active request plus the failed ones with a pending
    /// manual reschedule. Each request is handled inside its own failure
    /// boundary; one bad request never halts the loop.
    async fn monitor_requests(&self) {
        let reconciler = Reconciler::new(
            self.grid.as_ref(),
            &self.template,
            self.max_reschedules,
        );

        let mut requests = match self.store.get_requests(&self.config.active_statuses).await {
            Ok(requests) => requests,
            Err(err) => {
                error!("Error fetching requests to monitor: {:#}", err);
                return;
            }
        };
        match self.store.get_reschedule_requests().await {
            Ok(reschedules) => requests.extend(reschedules),
            Err(err) => error!("Error fetching reschedule-pending requests: {:#}", err),
        }

        if requests.is_empty() {
            return;
        }
        info!("Monitoring {} request(s)", requests.len());

        for mut request in requests {
            let request_id = request.id;
            if let Err(err) = self.handle_request(&reconciler, &mut request).await {
                error!(
                    "Unhandled error while monitoring request {}: {:#}",
                    request_id, err
                );
            }
        }
    }

    async fn handle_request(
        &self,
        reconciler: &Reconciler<'_>,
        request: &mut RequestModel,
    ) -> Result<()> {
        if request.status == LocalStatus::Approved {
            request.set_status(LocalStatus::Submitting);
            self.store.save_request(request).await?;
            reconciler.submit_request(request).await;
            self.store.save_request(request).await?;
        }

        if request.status == LocalStatus::Removing {
            reconciler.remove_request(request).await;
            self.store.delete_request(request.id).await?;
            return Ok(());
        }

        reconciler.monitor_request(request).await;
        self.store.save_request(request).await?;
        Ok(())
    }
}

/// Register the shutdown handlers up front and return a future that resolves
/// when the process receives SIGINT or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("keyboard interrupt!"),
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal. Initiating graceful shutdown.");
            }
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
        warn!("keyboard interrupt!");
    })
}
