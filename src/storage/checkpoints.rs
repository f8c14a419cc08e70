use crate::error::StorageError;
use crate::model::{Checkpoint, HeaderHash, Point};
use rusqlite::{params, Connection, OptionalExtension};

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(u64, Vec<u8>)> {
    Ok((row.get::<_, i64>(0)? as u64, row.get(1)?))
}

fn decode(slot_no: u64, hash: Vec<u8>) -> Result<Checkpoint, StorageError> {
    let header_hash = HeaderHash::from_slice(&hash)
        .ok_or_else(|| StorageError::UnexpectedRow(format!("checkpoint {} has a malformed header hash", slot_no)))?;
    Ok(Checkpoint { slot_no, header_hash })
}

pub fn insert(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR REPLACE INTO checkpoints (slot_no, header_hash) VALUES (?1, ?2)",
        params![checkpoint.slot_no as i64, checkpoint.header_hash.as_bytes()],
    )?;
    Ok(())
}

pub fn most_recent(conn: &Connection) -> Result<Option<Checkpoint>, StorageError> {
    let row = conn
        .query_row("SELECT slot_no, header_hash FROM checkpoints ORDER BY slot_no DESC LIMIT 1", [], checkpoint_from_row)
        .optional()?;
    row.map(|(slot, hash)| decode(slot, hash)).transpose()
}

pub fn oldest(conn: &Connection) -> Result<Option<Checkpoint>, StorageError> {
    let row = conn
        .query_row("SELECT slot_no, header_hash FROM checkpoints ORDER BY slot_no ASC LIMIT 1", [], checkpoint_from_row)
        .optional()?;
    row.map(|(slot, hash)| decode(slot, hash)).transpose()
}

/// All checkpoints, most recent first.
pub fn list_descending(conn: &Connection) -> Result<Vec<Checkpoint>, StorageError> {
    let mut stmt = conn.prepare("SELECT slot_no, header_hash FROM checkpoints ORDER BY slot_no DESC")?;
    let rows = stmt.query_map([], checkpoint_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let (slot, hash) = row?;
        out.push(decode(slot, hash)?);
    }
    Ok(out)
}

/// The checkpoint exactly at `slot_no`, or with `strict = false` the closest
/// ancestor at or below it.
pub fn at_slot(conn: &Connection, slot_no: u64, strict: bool) -> Result<Option<Checkpoint>, StorageError> {
    let row = if strict {
        conn.query_row(
            "SELECT slot_no, header_hash FROM checkpoints WHERE slot_no = ?1",
            params![slot_no as i64],
            checkpoint_from_row,
        )
        .optional()?
    } else {
        conn.query_row(
            "SELECT slot_no, header_hash FROM checkpoints WHERE slot_no <= ?1 ORDER BY slot_no DESC LIMIT 1",
            params![slot_no as i64],
            checkpoint_from_row,
        )
        .optional()?
    };
    row.map(|(slot, hash)| decode(slot, hash)).transpose()
}

/// Thin the ring after a new checkpoint landed: everything within
/// `longest_rollback` slots of the tip survives untouched; behind the horizon
/// only the nearest checkpoint and one per doubling distance are kept, so a
/// resume always finds an anchor however far back it needs to reach.
pub fn prune(conn: &Connection, longest_rollback: u64) -> Result<usize, StorageError> {
    let tip = match most_recent(conn)? {
        Some(checkpoint) => checkpoint.slot_no,
        None => return Ok(0),
    };
    let horizon = tip.saturating_sub(longest_rollback);
    if horizon == 0 {
        return Ok(0);
    }

    let mut stmt = conn.prepare("SELECT slot_no FROM checkpoints WHERE slot_no < ?1 ORDER BY slot_no DESC")?;
    let old: Vec<u64> =
        stmt.query_map(params![horizon as i64], |row| row.get::<_, i64>(0).map(|s| s as u64))?.collect::<Result<_, _>>()?;
    if old.is_empty() {
        return Ok(0);
    }

    let mut keep = std::collections::BTreeSet::new();
    let mut target = horizon;
    let mut step = 1u64;
    loop {
        if let Some(slot) = old.iter().find(|slot| **slot <= target) {
            keep.insert(*slot);
        }
        if target < step {
            break;
        }
        target -= step;
        step = step.saturating_mul(2);
    }

    let mut deleted = 0;
    for slot in &old {
        if !keep.contains(slot) {
            deleted += conn.execute("DELETE FROM checkpoints WHERE slot_no = ?1", params![*slot as i64])?;
        }
    }
    Ok(deleted)
}

/// Retract everything strictly after the target point: created inputs go
/// away, later spends are undone, later checkpoints are dropped. A target
/// that is not a known checkpoint is persisted as a synthetic one, so
/// optimistic forced rollbacks leave a resumable anchor behind. Returns the
/// new tip.
pub fn rollback_to(conn: &Connection, point: &Point) -> Result<Option<Checkpoint>, StorageError> {
    let slot_no = point.slot_no() as i64;
    conn.execute(
        "DELETE FROM policies WHERE output_reference IN
           (SELECT output_reference FROM inputs WHERE created_at_slot_no > ?1)",
        params![slot_no],
    )?;
    conn.execute("DELETE FROM inputs WHERE created_at_slot_no > ?1", params![slot_no])?;
    conn.execute(
        "UPDATE inputs
            SET spent_at_slot_no = NULL, spent_at_header_hash = NULL, spent_at_transaction_id = NULL
          WHERE spent_at_slot_no > ?1",
        params![slot_no],
    )?;
    conn.execute("DELETE FROM checkpoints WHERE slot_no > ?1", params![slot_no])?;
    if let Point::At { slot_no, header_hash } = point {
        if at_slot(conn, *slot_no, true)?.is_none() {
            insert(conn, &Checkpoint { slot_no: *slot_no, header_hash: *header_hash })?;
        }
    }
    most_recent(conn)
}
