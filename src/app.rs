use crate::cache::SnapshotCache;
use crate::config::Config;
use crate::data::{PersistenceWriter, PgRecordStore};
use crate::query::FlowStats;
use crate::refresh::{Aggregator, CycleTrigger, RefreshScheduler};
use crate::source::SourceFetcher;
use crate::state::{AppState, ServiceStatus, ServiceStatusRegistry};
use crate::utils::fmt_duration;
use crate::web::create_router;
use anyhow::Context;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SERVICE_REFRESH: &str = "refresh";
const SERVICE_WEB: &str = "web";
const SERVICE_PERSISTENCE: &str = "persistence";

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    scheduler: RefreshScheduler,
    app_state: AppState,
}

impl App {
    /// Wire up storage, upstream sources, and the refresh pipeline.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let statuses = ServiceStatusRegistry::new();

        let writer = match &config.database_url {
            Some(url) => {
                let pool = Self::connect_database(url).await?;
                statuses.set(SERVICE_PERSISTENCE, ServiceStatus::Active);
                Some(PersistenceWriter::new(
                    Arc::new(PgRecordStore::new(pool)),
                    config.persist_batch_size,
                ))
            }
            None => {
                info!("DATABASE_URL not set, snapshot persistence disabled");
                statuses.set(SERVICE_PERSISTENCE, ServiceStatus::Disabled);
                None
            }
        };

        let http = reqwest::Client::builder()
            .user_agent(concat!("marketflow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.fetch_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let fetchers: Vec<SourceFetcher> = config
            .segments
            .iter()
            .cloned()
            .map(|segment| SourceFetcher::for_segment(segment, &http))
            .collect();
        for fetcher in &fetchers {
            let segment = fetcher.segment();
            info!(
                segment = %segment.id,
                endpoint = segment.endpoint.as_ref().map(|u| u.as_str()).unwrap_or("none"),
                fallback_size = segment.fallback_size,
                "Segment configured"
            );
        }

        let aggregator = Aggregator::new(fetchers, config.aggregator_settings());
        let scheduler = RefreshScheduler::new(
            aggregator,
            SnapshotCache::new(),
            writer,
            config.refresh_interval,
            config.shutdown_timeout,
        );
        statuses.set(SERVICE_REFRESH, ServiceStatus::Starting);

        info!(
            segments = config.segments.len(),
            refresh_interval = fmt_duration(config.refresh_interval),
            fetch_timeout = fmt_duration(config.fetch_timeout),
            cycle_deadline = fmt_duration(config.cycle_deadline),
            max_concurrent_fetches = config.max_concurrent_fetches,
            "Refresh pipeline configured"
        );

        let app_state = AppState::new(scheduler.clone(), statuses);
        Ok(App {
            config,
            scheduler,
            app_state,
        })
    }

    async fn connect_database(url: &str) -> anyhow::Result<sqlx::PgPool> {
        let connect_options = PgConnectOptions::from_str(url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            max_connections = 4,
            acquire_timeout = "4s",
            "database pool established"
        );

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        Ok(pool)
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Run one startup cycle, wait for its snapshot to persist, and return stats.
    pub async fn run_once(self) -> anyhow::Result<FlowStats> {
        let cycle = self
            .scheduler
            .refresh_now(CycleTrigger::Startup)
            .await
            .context("Refresh cycle did not run")?;
        info!(
            cycle = cycle.id,
            records = cycle.total_records,
            "Single refresh cycle completed"
        );

        if let Some(writer) = self.scheduler.writer() {
            writer.drain().await;
        }
        Ok(self.app_state.queries.stats()?)
    }

    /// Run the scheduler (and the web server, when enabled) until a shutdown signal.
    pub async fn run(self, serve_web: bool) -> ExitCode {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let statuses = self.app_state.service_statuses.clone();

        let refresh_handle = {
            let scheduler = self.scheduler.clone();
            let statuses = statuses.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                // Warm-up cycle; the scheduled cadence starts once it completes.
                match scheduler.refresh_now(CycleTrigger::Startup).await {
                    Some(cycle) => {
                        info!(records = cycle.total_records, "Startup refresh completed");
                        statuses.set(SERVICE_REFRESH, ServiceStatus::Active);
                    }
                    None => warn!("Startup refresh did not run"),
                }
                scheduler.run(shutdown_rx).await;
            })
        };

        let web_handle = if serve_web {
            match self.spawn_web(shutdown_tx.subscribe()).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(error = ?e, "Failed to start web server");
                    statuses.set(SERVICE_WEB, ServiceStatus::Error);
                    let _ = shutdown_tx.send(());
                    self.scheduler.shutdown().await;
                    let _ = refresh_handle.await;
                    return ExitCode::FAILURE;
                }
            }
        } else {
            info!("Web server disabled");
            statuses.set(SERVICE_WEB, ServiceStatus::Disabled);
            None
        };

        shutdown_signal().await;
        info!("Shutdown signal received, stopping services");
        let _ = shutdown_tx.send(());
        // Also reaches a warm-up cycle that started before the scheduler loop.
        self.scheduler.shutdown().await;

        // The scheduler bounds its own wait; this only covers a wedged task.
        let limit = self.config.shutdown_timeout + Duration::from_secs(1);
        let mut exit = ExitCode::SUCCESS;
        if tokio::time::timeout(limit, refresh_handle).await.is_err() {
            warn!("Refresh service did not stop in time");
            exit = ExitCode::FAILURE;
        }
        if let Some(handle) = web_handle
            && tokio::time::timeout(limit, handle).await.is_err()
        {
            warn!("Web server did not stop in time");
            exit = ExitCode::FAILURE;
        }

        info!("Shutdown complete");
        exit
    }

    async fn spawn_web(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(address = %addr, "Web server listening");

        let router = create_router(self.app_state.clone());
        let statuses = self.app_state.service_statuses.clone();
        statuses.set(SERVICE_WEB, ServiceStatus::Active);

        Ok(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = ?e, "Web server exited with error");
                statuses.set(SERVICE_WEB, ServiceStatus::Error);
            }
        }))
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
