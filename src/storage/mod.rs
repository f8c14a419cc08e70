pub mod checkpoints;
pub mod filters;
pub mod ops;
pub mod schema;

use crate::error::StorageError;
use crate::logger::Component;
use crate::{debug, info};
use crossbeam::channel::{bounded, Receiver, Sender};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What happens to inputs once they are spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputManagement {
    /// Spent inputs are removed by the garbage collector once they fall
    /// behind the rollback horizon.
    RemoveSpentInputs,
    /// Spent inputs are kept forever, with their spent marker.
    MarkSpentInputs,
}

/// Reader/writer arbitration between the one long-lived writer (consumer,
/// garbage collector) and the many short-lived connections (HTTP).
///
/// Short-lived sessions register as readers and only wait for the writer
/// flag; they never wait on each other. The long-lived writer waits for the
/// reader count to drain. This biases liveness toward the HTTP side while
/// letting the writer advance whenever no request is mid-transaction.
pub struct Arbitrator {
    state: Mutex<ArbitratorState>,
    cond: Condvar,
}

#[derive(Default)]
struct ArbitratorState {
    readers: usize,
    writer: bool,
}

impl Arbitrator {
    pub fn new() -> Self {
        Arbitrator { state: Mutex::new(ArbitratorState::default()), cond: Condvar::new() }
    }

    pub fn reader(&self) -> ReaderGuard<'_> {
        let mut state = self.state.lock().expect("arbitrator poisoned");
        state.readers += 1;
        while state.writer {
            state = self.cond.wait(state).expect("arbitrator poisoned");
        }
        ReaderGuard { arbitrator: self }
    }

    pub fn writer(&self) -> WriterGuard<'_> {
        let mut state = self.state.lock().expect("arbitrator poisoned");
        while state.readers > 0 || state.writer {
            state = self.cond.wait(state).expect("arbitrator poisoned");
        }
        state.writer = true;
        WriterGuard { arbitrator: self }
    }
}

impl Default for Arbitrator {
    fn default() -> Self {
        Arbitrator::new()
    }
}

pub struct ReaderGuard<'a> {
    arbitrator: &'a Arbitrator,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.arbitrator.state.lock().expect("arbitrator poisoned");
        state.readers -= 1;
        self.arbitrator.cond.notify_all();
    }
}

pub struct WriterGuard<'a> {
    arbitrator: &'a Arbitrator,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.arbitrator.state.lock().expect("arbitrator poisoned");
        state.writer = false;
        self.arbitrator.cond.notify_all();
    }
}

/// Where connections come from. On disk there is exactly one long-lived
/// connection, the writer's, held open for the life of the process; every
/// short-lived session opens its own connection against the shared WAL file.
/// In memory there is exactly one connection for everyone, parked in a
/// single-slot mailbox and handed to one session at a time.
enum ConnectionSource {
    OnDisk { path: PathBuf, writer: Mutex<Option<Connection>> },
    InMemory { park: Sender<Connection>, fetch: Receiver<Connection> },
}

pub struct PooledConnection {
    conn: Option<Connection>,
    home: Option<Sender<Connection>>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(home)) = (self.conn.take(), self.home.take()) {
            let _ = home.send(conn);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Deferred, for read-only sessions.
    ReadOnly,
    /// Immediate, taking the write lock up front.
    ReadWrite,
}

impl TransactionKind {
    fn begin_sql(&self) -> &'static str {
        match self {
            TransactionKind::ReadOnly => "BEGIN DEFERRED",
            TransactionKind::ReadWrite => "BEGIN IMMEDIATE",
        }
    }
}

pub struct Storage {
    source: ConnectionSource,
    arbitrator: Arbitrator,
    closed: AtomicBool,
    pub longest_rollback: u64,
    pub input_management: InputManagement,
}

fn is_busy(e: &StorageError) -> bool {
    match e {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
            matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = OFF;",
    )?;
    Ok(())
}

impl Storage {
    /// Open (or create) the on-disk database under `workdir`, apply forward
    /// migrations and, unless deferred, install the secondary indexes.
    pub fn open(
        workdir: &Path,
        longest_rollback: u64,
        input_management: InputManagement,
        defer_indexes: bool,
    ) -> Result<Arc<Storage>, StorageError> {
        std::fs::create_dir_all(workdir)?;
        let path = workdir.join("kupo.sqlite3");
        info!(Component::Database, "Opening database at {}", path.display());
        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        schema::migrate(&conn)?;
        if defer_indexes {
            info!(Component::Database, "Secondary index creation deferred until next start");
        } else {
            schema::install_indexes(&conn)?;
        }
        // the connection that ran the migrations stays on as the long-lived
        // writer
        Ok(Arc::new(Storage {
            source: ConnectionSource::OnDisk { path, writer: Mutex::new(Some(conn)) },
            arbitrator: Arbitrator::new(),
            closed: AtomicBool::new(false),
            longest_rollback,
            input_management,
        }))
    }

    /// Fully in-memory database: one connection, shared through a mailbox.
    pub fn in_memory(
        longest_rollback: u64,
        input_management: InputManagement,
    ) -> Result<Arc<Storage>, StorageError> {
        info!(Component::Database, "Opening in-memory database");
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        schema::install_indexes(&conn)?;
        let (park, fetch) = bounded(1);
        park.send(conn).expect("fresh mailbox cannot be full");
        Ok(Arc::new(Storage {
            source: ConnectionSource::InMemory { park, fetch },
            arbitrator: Arbitrator::new(),
            closed: AtomicBool::new(false),
            longest_rollback,
            input_management,
        }))
    }

    /// A connection for one short-lived session.
    fn connection(&self) -> Result<PooledConnection, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Custom("database closed".to_string()));
        }
        match &self.source {
            ConnectionSource::OnDisk { path, .. } => {
                let conn = Connection::open(path)?;
                apply_pragmas(&conn)?;
                Ok(PooledConnection { conn: Some(conn), home: None })
            }
            ConnectionSource::InMemory { park, fetch } => {
                let conn = fetch.recv().map_err(|e| StorageError::Custom(e.to_string()))?;
                Ok(PooledConnection { conn: Some(conn), home: Some(park.clone()) })
            }
        }
    }

    /// One transaction over one connection, retried forever on BUSY with a
    /// fixed backoff. A failed commit rolls back before the error propagates
    /// so the engine is never left mid-transaction.
    fn transact<T>(
        conn: &Connection,
        kind: TransactionKind,
        f: &impl Fn(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        loop {
            match Self::attempt(conn, kind, f) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    debug!(Component::Database, "Database busy, retrying in {:?}", BUSY_RETRY_DELAY);
                    std::thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn run_transaction<T>(
        &self,
        kind: TransactionKind,
        f: impl Fn(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self.connection()?;
        Self::transact(&conn, kind, &f)
    }

    fn attempt<T>(
        conn: &Connection,
        kind: TransactionKind,
        f: &impl Fn(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        conn.execute_batch(kind.begin_sql())?;
        match f(conn).and_then(|value| {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }) {
            Ok(value) => Ok(value),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Short-lived read-only transaction, from an async context.
    pub async fn read<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = storage.arbitrator.reader();
            storage.run_transaction(TransactionKind::ReadOnly, f)
        })
        .await
        .map_err(|e| StorageError::Custom(e.to_string()))?
    }

    /// Short-lived read-write transaction (pattern mutations and the like).
    /// Serializes against the long-lived writer through the arbitration, and
    /// against concurrent short-lived writers through IMMEDIATE + retry.
    pub async fn write<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = storage.arbitrator.reader();
            storage.run_transaction(TransactionKind::ReadWrite, f)
        })
        .await
        .map_err(|e| StorageError::Custom(e.to_string()))?
    }

    /// The long-lived writer path: consumer block folds, rollbacks and the
    /// garbage collector, all over the one persistent writer connection.
    /// Blocking; callers run on a blocking thread.
    pub fn with_writer<T>(
        &self,
        f: impl Fn(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let _guard = self.arbitrator.writer();
        match &self.source {
            ConnectionSource::OnDisk { writer, .. } => {
                let held = writer.lock().expect("writer connection poisoned");
                let conn = held.as_ref().ok_or_else(|| StorageError::Custom("database closed".to_string()))?;
                Self::transact(conn, TransactionKind::ReadWrite, &f)
            }
            ConnectionSource::InMemory { .. } => {
                let conn = self.connection()?;
                Self::transact(&conn, TransactionKind::ReadWrite, &f)
            }
        }
    }

    /// Close the long-lived writer connection. The last step of shutdown:
    /// taking the writer lock waits out pending sessions, then the connection
    /// is surrendered and any later transaction fails instead of reopening.
    pub fn close(&self) {
        let _guard = self.arbitrator.writer();
        self.closed.store(true, Ordering::SeqCst);
        let taken = match &self.source {
            ConnectionSource::OnDisk { writer, .. } => writer.lock().expect("writer connection poisoned").take(),
            ConnectionSource::InMemory { fetch, .. } => fetch.try_recv().ok(),
        };
        if let Some(conn) = taken {
            if let Err((_, e)) = conn.close() {
                crate::error!(Component::Database, "Closing the database failed: {}", e);
            } else {
                info!(Component::Database, "Database connection closed");
            }
        }
    }

    /// A streaming read: `f` runs inside one deferred transaction on a
    /// blocking thread and pushes rows through the yield callback; the
    /// callback returns false once the receiving side has gone away. The
    /// whole response therefore observes one consistent snapshot.
    pub fn spawn_stream_read<F>(
        self: &Arc<Self>,
        buffer: usize,
        f: F,
    ) -> tokio::sync::mpsc::Receiver<Vec<u8>>
    where
        F: FnOnce(&Connection, &mut dyn FnMut(Vec<u8>) -> bool) -> Result<(), StorageError> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(buffer);
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = storage.arbitrator.reader();
            let conn = match storage.connection() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            if conn.execute_batch("BEGIN DEFERRED").is_err() {
                return;
            }
            let mut push = |bytes: Vec<u8>| tx.blocking_send(bytes).is_ok();
            let _ = f(&conn, &mut push);
            let _ = conn.execute_batch("COMMIT");
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn readers_do_not_block_each_other() {
        let arbitrator = Arc::new(Arbitrator::new());
        let first = arbitrator.reader();
        let started = Instant::now();
        let second = arbitrator.reader();
        assert!(started.elapsed() < Duration::from_millis(50));
        drop(first);
        drop(second);
    }

    #[test]
    fn writer_waits_for_readers_to_drain() {
        let arbitrator = Arc::new(Arbitrator::new());
        let order = Arc::new(AtomicUsize::new(0));

        let reader = arbitrator.reader();
        let writer_order = Arc::clone(&order);
        let writer_arb = Arc::clone(&arbitrator);
        let handle = std::thread::spawn(move || {
            let _guard = writer_arb.writer();
            writer_order.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(order.load(Ordering::SeqCst), 0, "writer must wait while a reader is active");
        drop(reader);
        handle.join().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readers_wait_while_writer_holds_the_lock() {
        let arbitrator = Arc::new(Arbitrator::new());
        let writer = arbitrator.writer();

        let reader_arb = Arc::clone(&arbitrator);
        let acquired = Arc::new(AtomicUsize::new(0));
        let acquired_clone = Arc::clone(&acquired);
        let handle = std::thread::spawn(move || {
            let _guard = reader_arb.reader();
            acquired_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0, "reader must wait for the writer");
        drop(writer);
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writers_are_mutually_exclusive() {
        let arbitrator = Arc::new(Arbitrator::new());
        let first = arbitrator.writer();
        let other = Arc::clone(&arbitrator);
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            let _guard = other.writer();
            done_clone.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        drop(first);
        handle.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_memory_mailbox_hands_the_connection_around() {
        let storage = Storage::in_memory(100, InputManagement::RemoveSpentInputs).unwrap();
        for _ in 0..3 {
            let conn = storage.connection().unwrap();
            conn.execute_batch("SELECT 1").unwrap();
            // dropping returns the connection to the mailbox
        }
    }

    fn temp_workdir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        std::env::temp_dir().join("kupo").join("test").join(format!("{}_{}", name, nanos))
    }

    #[test]
    fn on_disk_writer_connection_is_long_lived_and_closable() {
        let dir = temp_workdir("writer_close");
        let storage = Storage::open(&dir, 100, InputManagement::RemoveSpentInputs, false).unwrap();

        storage
            .with_writer(|conn| {
                conn.execute("INSERT INTO patterns (pattern) VALUES (?1)", ["*"])?;
                Ok(())
            })
            .unwrap();
        // short-lived sessions open their own connections against the same file
        let count: i64 = storage
            .run_transaction(TransactionKind::ReadOnly, |conn| {
                Ok(conn.query_row("SELECT count(*) FROM patterns", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);

        storage.close();
        assert!(storage.with_writer(|_conn| Ok(())).is_err(), "writes after close must fail");
        assert!(
            storage.run_transaction(TransactionKind::ReadOnly, |_conn| Ok(())).is_err(),
            "sessions after close must fail"
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn in_memory_close_severs_the_mailbox() {
        let storage = Storage::in_memory(100, InputManagement::RemoveSpentInputs).unwrap();
        storage.with_writer(|conn| Ok(conn.execute("INSERT INTO patterns (pattern) VALUES (?1)", ["*"]).map(|_| ())?)).unwrap();
        storage.close();
        assert!(storage.with_writer(|_conn| Ok(())).is_err(), "writes after close must fail");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let storage = Storage::in_memory(100, InputManagement::RemoveSpentInputs).unwrap();
        let result: Result<(), StorageError> = storage.run_transaction(TransactionKind::ReadWrite, |conn| {
            conn.execute("INSERT INTO patterns (pattern) VALUES (?1)", ["*"])?;
            Err(StorageError::Custom("boom".to_string()))
        });
        assert!(result.is_err());
        let count: i64 = storage
            .run_transaction(TransactionKind::ReadOnly, |conn| {
                Ok(conn.query_row("SELECT count(*) FROM patterns", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0, "the failed insert must not be visible");
    }
}
