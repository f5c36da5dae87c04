//! Broker assembly and the serve loop.

use std::sync::Arc;

use klefki_auth::BoundedReplayCache;
use klefki_core::SessionEngine;
use klefki_proto::{klefki_service_server::KlefkiServiceServer, FILE_DESCRIPTOR_SET};
use klefki_registry::MachineStore;
use tokio::signal;
use tokio::sync::broadcast;
use tonic::transport::Server;

use crate::config::ServeArgs;
use crate::maintenance::Maintenance;
use crate::services::{KlefkiBroker, PollRateLimiter};

/// Upper bound on remembered nonces when replay rejection is enabled.
const REPLAY_CACHE_CAPACITY: usize = 100_000;

/// The engine as the daemon runs it: backed by the SQLite registry.
pub type BrokerEngine = SessionEngine<Arc<MachineStore>>;

/// Build the session engine with the optional hardening from `args`.
///
/// Returns the replay cache too so the sweep can trim it.
pub fn build_engine(
    store: Arc<MachineStore>,
    args: &ServeArgs,
) -> (Arc<BrokerEngine>, Option<Arc<BoundedReplayCache>>) {
    let mut engine = SessionEngine::new(store);

    if let Some(skew) = args.max_clock_skew {
        engine = engine.with_max_clock_skew(skew);
    }

    let replay_cache = args
        .reject_replayed_nonces
        .then(|| Arc::new(BoundedReplayCache::new(args.replay_window(), REPLAY_CACHE_CAPACITY)));
    if let Some(cache) = &replay_cache {
        engine = engine.with_replay_cache(cache.clone());
    }

    (Arc::new(engine), replay_cache)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

/// Open the registry and serve until a shutdown signal arrives.
pub async fn run(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = args.database_path();
    tracing::info!(path = %db_path.display(), "Opening machine registry");

    let store = Arc::new(MachineStore::open(&db_path).await?);
    tracing::info!(machines = store.cached_len(), "Machine registry loaded");

    let (engine, replay_cache) = build_engine(Arc::clone(&store), &args);
    let broker =
        KlefkiBroker::new(Arc::clone(&engine)).with_registry_sync(Arc::clone(&store));
    let rate_limiter = PollRateLimiter::new(args.rate_limit_per_second, args.rate_limit_burst);

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    // Broadcast channel for shutdown (multiple receivers)
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let maintenance = Maintenance {
        engine: Arc::clone(&engine),
        store,
        replay_cache,
        session_max_age: args.session_max_age(),
        interval: args.sweep_interval,
    }
    .spawn(shutdown_tx.subscribe());

    let shutdown_tx_signal = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx_signal.send(());
    });

    let mut shutdown_rx = shutdown_tx.subscribe();

    tracing::info!(
        listen = %args.listen,
        session_max_age = ?args.session_max_age(),
        max_clock_skew = ?args.max_clock_skew,
        reject_replayed_nonces = args.reject_replayed_nonces,
        "Klefki broker starting"
    );

    let served = Server::builder()
        .add_service(reflection)
        .add_service(KlefkiServiceServer::with_interceptor(broker, rate_limiter))
        .serve_with_shutdown(args.listen, async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;

    // Stop the sweep even if the server exited on its own
    let _ = shutdown_tx.send(());
    signal_task.abort();
    if let Err(e) = maintenance.await {
        tracing::error!(error = %e, "Maintenance task panicked");
    }

    let discarded = engine.pending_count();
    if discarded > 0 {
        tracing::warn!(
            count = discarded,
            "Discarding pending sessions; operators must resubmit after restart"
        );
    }

    match served {
        Ok(()) => {
            tracing::info!("Broker shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Broker stopped with error");
            Err(e.into())
        }
    }
}
