use crate::chain::{ChainEvent, ChainProducer};
use crate::error::{ChainError, StorageError};
use crate::health::Health;
use crate::logger::Component;
use crate::model::{Block, Checkpoint, OutputReference, Point, SpentAt};
use crate::pattern::Pattern;
use crate::registry::PatternRegistry;
use crate::storage::{checkpoints, ops, Storage};
use crate::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(250);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const PROGRESS_REPORT_EVERY: u64 = 1000;

/// Handoff from `PUT /patterns` to the consumer: roll the index back to
/// `point` and activate `pattern` before following resumes. The oneshot
/// reply is the completion pair; the consumer is its sole fulfiller.
pub struct ForcedRollback {
    pub point: Point,
    pub pattern: Pattern,
    pub reply: oneshot::Sender<Result<Point, String>>,
}

/// The chain-follower: Initializing → Intersecting → Following, with
/// excursions through ForcedRollback and back, until shutdown.
pub struct ChainConsumer {
    storage: Arc<Storage>,
    registry: PatternRegistry,
    health: Arc<Health>,
    since: Option<Point>,
    event_timeout: Duration,
}

impl ChainConsumer {
    pub fn new(
        storage: Arc<Storage>,
        registry: PatternRegistry,
        health: Arc<Health>,
        since: Option<Point>,
        event_timeout: Duration,
    ) -> Self {
        ChainConsumer { storage, registry, health, since, event_timeout }
    }

    pub async fn run(
        self,
        connector: Box<dyn crate::chain::ProducerConnector>,
        mut forced: mpsc::Receiver<ForcedRollback>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
        let mut blocks_since_report = 0u64;
        let mut report_started = Instant::now();

        'intersecting: loop {
            if *shutdown.borrow() {
                info!(Component::Consumer, "Consumer stopped");
                return Ok(());
            }

            let candidates = self.intersection_candidates().await?;
            let session = async {
                let mut producer = connector.connect().await?;
                let intersection = producer.find_intersection(candidates).await?;
                Ok::<_, ChainError>((producer, intersection))
            };
            let (mut producer, (intersection, tip)) = match session.await {
                Ok(result) => result,
                Err(e) => {
                    self.health.set_connected(false);
                    warn!(
                        Component::Consumer,
                        "Producer unreachable ({}), retrying in {:?}", e, reconnect_delay
                    );
                    tokio::select! {
                        _ = shutdown.changed() => continue 'intersecting,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    continue 'intersecting;
                }
            };
            reconnect_delay = INITIAL_RECONNECT_DELAY;

            let intersection = match intersection {
                Some(point) => point,
                None if self.since.is_some() => {
                    return Err(ChainError::IntersectionNotFound(format!(
                        "no ancestor found for the requested starting point {}; \
                         check --since against the producer's chain",
                        self.since.expect("just checked")
                    )));
                }
                None => {
                    warn!(Component::Consumer, "No intersection with persisted checkpoints, resyncing from genesis");
                    self.rollback(&Point::Origin).await?;
                    continue 'intersecting;
                }
            };

            info!(Component::Consumer, "Following the chain from {}", intersection);
            self.health.set_connected(true);
            self.health.record_node_tip(&tip);
            let mut consecutive_timeouts = 0u32;

            // Following
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(Component::Consumer, "Consumer stopped");
                        return Ok(());
                    }
                    request = forced.recv() => {
                        match request {
                            None => return Ok(()),
                            Some(request) => {
                                if self.forced_rollback(&mut producer, request).await? {
                                    continue;
                                }
                                // the producer session needs a fresh intersection
                                continue 'intersecting;
                            }
                        }
                    }
                    event = tokio::time::timeout(self.event_timeout, producer.next_event()) => {
                        match event {
                            Err(_elapsed) => {
                                consecutive_timeouts += 1;
                                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                                    warn!(Component::Consumer, "Producer silent for too long, re-intersecting");
                                    self.health.set_connected(false);
                                    continue 'intersecting;
                                }
                            }
                            Ok(Err(e)) => {
                                self.health.set_connected(false);
                                warn!(Component::Consumer, "Lost the producer session: {}", e);
                                continue 'intersecting;
                            }
                            Ok(Ok(ChainEvent::RollForward { block, tip })) => {
                                consecutive_timeouts = 0;
                                let slot_no = block.slot_no;
                                let checkpoint = self.ingest(block).await?;
                                self.health.record_checkpoint(Some(checkpoint));
                                self.health.record_node_tip(&tip);
                                blocks_since_report += 1;
                                if blocks_since_report >= PROGRESS_REPORT_EVERY {
                                    let elapsed = report_started.elapsed().as_secs_f64();
                                    info!(
                                        Component::Consumer,
                                        "Synchronized up to slot {} ({:.1} blocks/s, {} slots behind the tip)",
                                        slot_no,
                                        blocks_since_report as f64 / elapsed.max(0.001),
                                        tip.slot_no().saturating_sub(slot_no)
                                    );
                                    blocks_since_report = 0;
                                    report_started = Instant::now();
                                }
                            }
                            Ok(Ok(ChainEvent::RollBackward { point, tip })) => {
                                consecutive_timeouts = 0;
                                info!(Component::Consumer, "Rolling backward to {}", point);
                                let new_tip = self.rollback(&point).await?;
                                self.health.record_checkpoint(new_tip);
                                self.health.record_node_tip(&tip);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn intersection_candidates(&self) -> Result<Vec<Point>, ChainError> {
        let persisted = self.storage.read(checkpoints::list_descending).await?;
        if !persisted.is_empty() {
            return Ok(persisted.into_iter().map(Point::from).collect());
        }
        match self.since {
            Some(point) => Ok(vec![point]),
            None => Err(ChainError::Configuration(
                "no checkpoints to resume from and no starting point configured; \
                 provide --since (e.g. --since origin) on first start"
                    .to_string(),
            )),
        }
    }

    /// Fold one block into the store: everything the block does to the index,
    /// its checkpoint included, commits atomically before the next block is
    /// looked at. The registry is sampled exactly once, at the boundary.
    async fn ingest(&self, block: Block) -> Result<Checkpoint, ChainError> {
        let patterns = self.registry.snapshot();
        let storage = Arc::clone(&self.storage);
        let checkpoint = tokio::task::spawn_blocking(move || {
            storage.with_writer(|conn| {
                let checkpoint = block.checkpoint();
                for tx in &block.transactions {
                    for (index, output) in tx.outputs.iter().enumerate() {
                        let reference =
                            OutputReference { transaction_id: tx.id, output_index: index as u16 };
                        if !patterns.iter().any(|pattern| pattern.matches(&reference, output)) {
                            continue;
                        }
                        ops::insert_input(
                            conn,
                            &crate::model::Input {
                                output_reference: reference,
                                address: output.address.clone(),
                                value: output.value.clone(),
                                datum_hash: output.datum_hash,
                                script_hash: output.script_hash,
                                created_at: checkpoint,
                                spent_at: None,
                            },
                        )?;
                        if let Some(datum_hash) = &output.datum_hash {
                            if let Some(datum) = tx.datums.get(datum_hash) {
                                ops::insert_binary_data(conn, datum_hash, datum)?;
                            }
                        }
                        if let Some(script_hash) = &output.script_hash {
                            if let Some(script) = tx.scripts.get(script_hash) {
                                ops::insert_script(conn, script_hash, script)?;
                            }
                        }
                    }
                    let spent_at = SpentAt {
                        slot_no: block.slot_no,
                        header_hash: block.header_hash,
                        transaction_id: tx.id,
                    };
                    for spend in &tx.spends {
                        ops::mark_spent(conn, spend, &spent_at)?;
                    }
                }
                checkpoints::insert(conn, &checkpoint)?;
                checkpoints::prune(conn, storage.longest_rollback)?;
                Ok(checkpoint)
            })
        })
        .await
        .map_err(|e| ChainError::Custom(e.to_string()))??;
        debug!(Component::Consumer, "Ingested block at {}", checkpoint.slot_no);
        Ok(checkpoint)
    }

    async fn rollback(&self, point: &Point) -> Result<Option<Checkpoint>, ChainError> {
        let storage = Arc::clone(&self.storage);
        let point = *point;
        let new_tip = tokio::task::spawn_blocking(move || {
            storage.with_writer(|conn| checkpoints::rollback_to(conn, &point))
        })
        .await
        .map_err(|e| ChainError::Custom(e.to_string()))??;
        Ok(new_tip)
    }

    /// Handle one forced-rollback request. Returns true when following can
    /// continue on the same producer session, false when the session has to
    /// be re-established through a fresh intersection.
    async fn forced_rollback(
        &self,
        producer: &mut Box<dyn ChainProducer>,
        request: ForcedRollback,
    ) -> Result<bool, ChainError> {
        let ForcedRollback { point, pattern, reply } = request;
        info!(Component::Consumer, "Forced rollback to {} for pattern {}", point, pattern);

        match producer.find_intersection(vec![point]).await {
            Err(e) => {
                let _ = reply.send(Err(format!("producer unreachable: {}", e)));
                self.health.set_connected(false);
                Ok(false)
            }
            Ok((None, _tip)) => {
                warn!(Component::Consumer, "Producer does not know {}, resuming unchanged", point);
                let _ = reply.send(Err(format!("point {} is unknown to the block producer", point)));
                Ok(false)
            }
            Ok((Some(_), tip)) => {
                let storage = Arc::clone(&self.storage);
                let target = point;
                let activated = pattern.clone();
                let result: Result<Option<Checkpoint>, StorageError> =
                    tokio::task::spawn_blocking(move || {
                        storage.with_writer(|conn| {
                            let new_tip = checkpoints::rollback_to(conn, &target)?;
                            ops::insert_pattern(conn, &activated)?;
                            Ok(new_tip)
                        })
                    })
                    .await
                    .map_err(|e| ChainError::Custom(e.to_string()))?;
                match result {
                    Err(e) => {
                        error!(Component::Consumer, "Forced rollback failed: {}", e);
                        let _ = reply.send(Err(e.to_string()));
                        Ok(false)
                    }
                    Ok(new_tip) => {
                        self.registry.insert(pattern);
                        self.health.record_checkpoint(new_tip);
                        self.health.record_node_tip(&tip);
                        let _ = reply.send(Ok(point));
                        Ok(true)
                    }
                }
            }
        }
    }
}
