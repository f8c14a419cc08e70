use crate::error::StorageError;
use crate::info;
use crate::logger::Component;
use rusqlite::Connection;

/// Forward-only migrations; the applied count lives in `user_version`.
/// Each entry runs as one batch inside a single IMMEDIATE transaction.
const MIGRATIONS: &[&str] = &[
    // v1: the full relational schema. Only the essential uniqueness
    // constraints are part of the schema itself; secondary indexes are
    // installed separately so a first sync can defer them.
    "CREATE TABLE IF NOT EXISTS inputs (
        output_reference BLOB NOT NULL PRIMARY KEY,
        address TEXT NOT NULL,
        payment_credential TEXT,
        delegation_credential TEXT,
        value BLOB NOT NULL,
        datum_hash BLOB,
        script_hash BLOB,
        created_at_slot_no INTEGER NOT NULL,
        created_at_header_hash BLOB NOT NULL,
        spent_at_slot_no INTEGER,
        spent_at_header_hash BLOB,
        spent_at_transaction_id BLOB
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS policies (
        output_reference BLOB NOT NULL,
        policy_id TEXT NOT NULL,
        PRIMARY KEY (output_reference, policy_id)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS checkpoints (
        slot_no INTEGER NOT NULL PRIMARY KEY,
        header_hash BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS patterns (
        pattern TEXT NOT NULL PRIMARY KEY
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS binary_data (
        binary_data_hash BLOB NOT NULL PRIMARY KEY,
        binary_data BLOB NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS scripts (
        script_hash BLOB NOT NULL PRIMARY KEY,
        script_language TEXT NOT NULL,
        script BLOB NOT NULL
    ) WITHOUT ROWID;",
];

/// Secondary indexes backing pattern pre-filters and slot scans. Idempotent;
/// skipped entirely when index creation is deferred.
const INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS inputsByAddress ON inputs(address);
    CREATE INDEX IF NOT EXISTS inputsByPaymentCredential ON inputs(payment_credential);
    CREATE INDEX IF NOT EXISTS inputsByDelegationCredential ON inputs(delegation_credential);
    CREATE INDEX IF NOT EXISTS inputsByCreatedAt ON inputs(created_at_slot_no);
    CREATE INDEX IF NOT EXISTS inputsBySpentAt ON inputs(spent_at_slot_no);
    CREATE INDEX IF NOT EXISTS policiesByPolicyId ON policies(policy_id);
";

pub fn current_version(conn: &Connection) -> Result<u32, StorageError> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply pending forward migrations. A database created by a newer binary is
/// refused: downgrades are unsupported.
pub fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let version = current_version(conn)? as usize;
    if version > MIGRATIONS.len() {
        return Err(StorageError::BadMigration(format!(
            "database version {} is newer than this binary (expected at most {}); downgrades are unsupported",
            version,
            MIGRATIONS.len()
        )));
    }
    if version == MIGRATIONS.len() {
        return Ok(());
    }
    info!(Component::Database, "Migrating database from version {} to {}", version, MIGRATIONS.len());
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let applied: Result<(), StorageError> = MIGRATIONS[version..].iter().try_for_each(|migration| {
        conn.execute_batch(migration)?;
        Ok(())
    });
    match applied {
        Ok(()) => {
            conn.execute_batch(&format!("PRAGMA user_version = {}", MIGRATIONS.len()))?;
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(StorageError::BadMigration(e.to_string()))
        }
    }
}

pub fn install_indexes(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(INDEXES)?;
    Ok(())
}
