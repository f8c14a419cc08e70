pub mod consumer;
pub mod ogmios;

use crate::error::ChainError;
use crate::model::{Block, Point};
use async_trait::async_trait;

/// What the producer tells us on each step of the synchronization.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    RollForward { block: Block, tip: Point },
    RollBackward { point: Point, tip: Point },
}

/// The consumer-side view of the upstream block provider. One long-lived
/// session per consumer; implementations speak either the node-to-client
/// mini-protocols or the JSON-RPC bridge, the consumer does not care which.
#[async_trait]
pub trait ChainProducer: Send {
    /// Negotiate a starting point from the candidates, most recent first.
    /// Returns the agreed intersection (None when the producer knows none of
    /// the candidates) together with its current tip.
    async fn find_intersection(&mut self, candidates: Vec<Point>) -> Result<(Option<Point>, Point), ChainError>;

    /// Await the next roll-forward or roll-backward instruction.
    async fn next_event(&mut self) -> Result<ChainEvent, ChainError>;
}

/// Dials a fresh producer session. The consumer reconnects through this
/// whenever a session dies or a new intersection is needed.
#[async_trait]
pub trait ProducerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChainProducer>, ChainError>;
}

/// Random access to single blocks, used by `GET /metadata/{slot}`. Kept apart
/// from [`ChainProducer`] because it serves the HTTP side over its own
/// connection while the consumer holds the synchronization session.
#[async_trait]
pub trait FetchBlockClient: Send + Sync {
    async fn fetch_block(&self, point: &Point) -> Result<Option<Block>, ChainError>;
}
