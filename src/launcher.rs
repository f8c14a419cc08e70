use crate::chain::consumer::{ChainConsumer, ForcedRollback};
use crate::chain::ogmios::{OgmiosConnector, OgmiosFetchClient};
use crate::chain::{FetchBlockClient, ProducerConnector};
use crate::config::{DatabaseLocation, ProducerConfig, Settings};
use crate::error::ChainError;
use crate::gc::GarbageCollector;
use crate::health::Health;
use crate::http::{self, AppState};
use crate::logger::Component;
use crate::registry::PatternRegistry;
use crate::storage::{ops, Storage};
use crate::{error, info, logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Semaphore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How long the consumer waits for a producer message before counting a
/// timeout; three in a row are treated as a disconnection.
const PRODUCER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire everything together and run until a signal or a fatal error.
/// Start order: storage (migrations) → registry → consumer, GC and HTTP
/// server side by side; stop order is the reverse, driven by one watch
/// channel.
pub async fn launch(settings: Settings) -> Result<(), ChainError> {
    logger::init(settings.log_levels.clone());

    let storage = match &settings.database {
        DatabaseLocation::Dir(dir) => {
            Storage::open(dir, settings.longest_rollback, settings.input_management, settings.defer_indexes)?
        }
        DatabaseLocation::InMemory => Storage::in_memory(settings.longest_rollback, settings.input_management)?,
    };

    // command-line patterns join whatever previous runs persisted
    let cli_patterns = settings.patterns.clone();
    let active_patterns = storage
        .write(move |conn| {
            for pattern in &cli_patterns {
                ops::insert_pattern(conn, pattern)?;
            }
            ops::list_patterns(conn)
        })
        .await?;
    if active_patterns.is_empty() {
        info!(Component::Configuration, "No patterns configured, the index will stay empty until one is added");
    } else {
        info!(
            Component::Configuration,
            "Indexing {}",
            active_patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
        );
    }
    let registry = PatternRegistry::new(active_patterns);
    let health = Health::new(settings.input_management);
    health.record_checkpoint(storage.read(crate::storage::checkpoints::most_recent).await?);

    let (connector, fetch): (Box<dyn ProducerConnector>, Arc<dyn FetchBlockClient>) = match &settings.producer {
        ProducerConfig::Ogmios { host, port } => (
            Box::new(OgmiosConnector::new(host.clone(), *port)),
            Arc::new(OgmiosFetchClient::new(host.clone(), *port)),
        ),
    };

    let (forced_tx, forced_rx) = mpsc::channel::<ForcedRollback>(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = ChainConsumer::new(
        Arc::clone(&storage),
        registry.clone(),
        Arc::clone(&health),
        settings.since,
        PRODUCER_READ_TIMEOUT,
    );
    let mut consumer_handle = tokio::spawn(consumer.run(connector, forced_rx, shutdown_rx.clone()));

    let collector = GarbageCollector::new(Arc::clone(&storage), settings.gc_interval);
    let gc_handle = tokio::spawn(collector.run(shutdown_rx.clone()));

    let state = AppState {
        storage: Arc::clone(&storage),
        registry,
        health,
        forced: forced_tx,
        fetch,
        concurrency: Arc::new(Semaphore::new(settings.max_concurrency)),
    };
    let server_handle = tokio::spawn(http::serve(state, settings.server, shutdown_rx));

    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler installs");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installs");

    enum Exit {
        Signal(&'static str),
        Consumer(Result<(), ChainError>),
    }

    let exit = tokio::select! {
        _ = sigint.recv() => Exit::Signal("SIGINT"),
        _ = sigterm.recv() => Exit::Signal("SIGTERM"),
        finished = &mut consumer_handle => Exit::Consumer(match finished {
            Ok(result) => result,
            Err(e) => Err(ChainError::Custom(format!("consumer task died: {}", e))),
        }),
    };

    let _ = shutdown_tx.send(true);
    if let Exit::Signal(name) = &exit {
        info!(Component::Configuration, "Received {}, shutting down", name);
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut consumer_handle).await;
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = gc_handle.await;
        let _ = server_handle.await;
    })
    .await;

    // pending short-lived transactions have had their grace period; the
    // close itself waits them out through the writer lock, bounded too
    let closing = Arc::clone(&storage);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, tokio::task::spawn_blocking(move || closing.close())).await;

    match exit {
        Exit::Signal(_) => Ok(()),
        Exit::Consumer(Ok(())) => Ok(()),
        Exit::Consumer(Err(e)) => {
            error!(Component::Configuration, "{}", e);
            Err(e)
        }
    }
}
