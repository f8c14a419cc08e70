//! A chain-index: follows a block producer from a chosen point, materializes
//! the transaction outputs matching a set of address/asset patterns into an
//! embedded SQLite store, and serves the result over HTTP with live pattern
//! management and rollback-safe semantics.

pub mod chain;
pub mod config;
pub mod error;
pub mod gc;
pub mod health;
pub mod http;
pub mod launcher;
pub mod logger;
pub mod model;
pub mod pattern;
pub mod registry;
pub mod storage;

pub use error::{AppError, ChainError, StorageError};
pub use model::{Block, Checkpoint, Input, Output, Point, Transaction, Value};
pub use pattern::Pattern;
