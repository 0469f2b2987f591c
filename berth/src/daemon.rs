//! Daemon composition and lifecycle.
//!
//! The daemon is an explicit context value: catalog, engine, metrics, audit
//! writer, and state store are constructed once at startup and passed down.
//! Startup runs recovery before the listener opens; shutdown drains the
//! audit backlog and writes a final synchronous snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::audit::{AuditSink, AuditWriter, DEFAULT_BACKLOG, DEFAULT_ROTATE_BYTES};
use crate::auth::AuthToken;
use crate::catalog::Catalog;
use crate::config::Settings;
use crate::engine::AllocationEngine;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::metrics::Metrics;
use crate::process::SystemProcessProbe;
use crate::recovery::{self, RecoveryReport};
use crate::server::{self, ServerState};
use crate::state::{ChannelScheduler, SnapshotData, SnapshotScheduler, StateStore};
use crate::writer::CatalogWriter;

/// A fully wired daemon, ready to serve.
pub struct Daemon {
    settings: Settings,
    engine: Arc<AllocationEngine>,
    token: AuthToken,
    store: StateStore,
    audit: Arc<AuditWriter>,
    audit_thread: std::thread::JoinHandle<()>,
    snapshot_rx: watch::Receiver<Option<SnapshotData>>,
    recovery_report: RecoveryReport,
}

impl Daemon {
    /// Construct the context: validate config, mint or load the token,
    /// start the audit writer, run recovery, and seed the engine.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or unrecoverable I/O problems; a
    /// corrupt snapshot is not fatal (recovery quarantines it).
    pub fn bootstrap(settings: Settings) -> Result<Self> {
        let catalog = Catalog::from_config(&settings.config_file)?;
        let token = AuthToken::load_or_generate(&settings.token_path())?;
        let metrics = Arc::new(Metrics::new());

        let (audit, audit_thread) = AuditWriter::spawn(
            settings.audit_path(),
            Arc::clone(&metrics),
            DEFAULT_BACKLOG,
            DEFAULT_ROTATE_BYTES,
        );

        let store = StateStore::new(settings.state_path());
        let process = Arc::new(SystemProcessProbe);
        let (recovered, recovery_report) =
            recovery::recover(&store, &catalog, process.as_ref(), audit.as_ref())?;

        let (scheduler, snapshot_rx) = ChannelScheduler::new();
        let prober = crate::probe::SystemProber::with_timeout(Duration::from_millis(
            settings.recovery.probe_timeout_ms,
        ));
        let engine = Arc::new(
            AllocationEngine::builder(catalog)
                .auto_allocation(settings.auto_allocation.clone())
                .recovery(settings.recovery.clone())
                .prober(Arc::new(prober))
                .process(process)
                .audit(Arc::clone(&audit) as Arc<dyn AuditSink>)
                .scheduler(Arc::new(scheduler) as Arc<dyn SnapshotScheduler>)
                .catalog_writer(CatalogWriter::new(
                    settings.config_path(),
                    settings.backups_dir(),
                ))
                .metrics(metrics)
                .build(),
        );
        engine.restore(recovered);

        Ok(Self {
            settings,
            engine,
            token,
            store,
            audit,
            audit_thread,
            snapshot_rx,
            recovery_report,
        })
    }

    /// What recovery found at startup.
    #[must_use]
    pub const fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// The engine, for embedding and tests.
    #[must_use]
    pub fn engine(&self) -> Arc<AllocationEngine> {
        Arc::clone(&self.engine)
    }

    /// Serve until interrupted, then shut down cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let listen_port = self.settings.listen_port;
        let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
        tracing::info!(port = listen_port, "berth daemon listening on loopback");

        write_pidfile(&self.settings)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let snapshot_task = tokio::spawn(crate::state::snapshot_writer_task(
            self.store.clone(),
            self.snapshot_rx.clone(),
        ));

        let monitor = HealthMonitor::new(
            Arc::clone(&self.engine),
            Duration::from_secs(self.settings.recovery.health_check_interval_secs),
        );
        let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

        let state = Arc::new(ServerState::new(
            Arc::clone(&self.engine),
            self.token.clone(),
        ));
        let app = server::router(state);

        let serve_result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
        monitor_task.abort();
        snapshot_task.abort();

        // Final synchronous snapshot; the background writer may have been
        // mid-flight when it was stopped.
        if let Err(e) = self.store.save(&self.engine.snapshot_data()) {
            tracing::error!(error = %e, "final snapshot failed");
        }

        self.audit.shutdown();
        if self.audit_thread.join().is_err() {
            tracing::warn!("audit writer thread panicked");
        }

        remove_pidfile(&self.settings);
        serve_result?;
        Ok(())
    }
}

fn write_pidfile(settings: &Settings) -> Result<()> {
    std::fs::write(
        settings.pidfile_path(),
        format!("{}\n", std::process::id()),
    )?;
    Ok(())
}

fn remove_pidfile(settings: &Settings) {
    let _ = std::fs::remove_file(settings.pidfile_path());
}

/// Resolves when the process receives ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            () = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
