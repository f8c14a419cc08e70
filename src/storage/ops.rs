use crate::error::StorageError;
use crate::model::{
    Address, AssetName, DatumHash, HeaderHash, Input, Output, OutputReference, PolicyId, Script, ScriptHash,
    ScriptLanguage, SortDirection, SpentAt, StatusFlag, TransactionId, Value,
};
use crate::pattern::Pattern;
use crate::storage::filters;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::str::FromStr;

/// Extra narrowing applied to `/matches` on top of the path pattern.
#[derive(Debug, Default, Clone)]
pub struct MatchFilters {
    pub policy_id: Option<PolicyId>,
    pub asset_name: Option<AssetName>,
    pub transaction_id: Option<TransactionId>,
    pub output_index: Option<u16>,
}

impl MatchFilters {
    pub fn is_empty(&self) -> bool {
        self.policy_id.is_none() && self.transaction_id.is_none()
    }

    fn accepts(&self, input: &Input) -> bool {
        if let Some(policy_id) = &self.policy_id {
            let ok = match &self.asset_name {
                Some(asset_name) => input.value.has_asset(policy_id, asset_name),
                None => input.value.has_policy(policy_id),
            };
            if !ok {
                return false;
            }
        }
        if let Some(transaction_id) = &self.transaction_id {
            if &input.output_reference.transaction_id != transaction_id {
                return false;
            }
            if let Some(output_index) = self.output_index {
                if input.output_reference.output_index != output_index {
                    return false;
                }
            }
        }
        true
    }
}

fn optional_hash<const N: usize>(
    bytes: Option<Vec<u8>>,
    what: &str,
) -> Result<Option<[u8; N]>, StorageError> {
    match bytes {
        None => Ok(None),
        Some(raw) => raw
            .try_into()
            .map(Some)
            .map_err(|_| StorageError::UnexpectedRow(format!("malformed {} digest", what))),
    }
}

fn input_from_row(row: &rusqlite::Row<'_>) -> Result<Input, StorageError> {
    let reference: Vec<u8> = row.get(0).map_err(StorageError::from)?;
    let output_reference = OutputReference::from_bytes(&reference)
        .ok_or_else(|| StorageError::UnexpectedRow("malformed output reference key".to_string()))?;
    let address_text: String = row.get(1).map_err(StorageError::from)?;
    let address = Address::from_text(&address_text)
        .ok_or_else(|| StorageError::UnexpectedRow(format!("unreadable address: {}", address_text)))?;
    let value_bytes: Vec<u8> = row.get(2).map_err(StorageError::from)?;
    let value = Value::from_cbor(&value_bytes)
        .map_err(|e| StorageError::Corruption(format!("undecodable value for {}: {}", output_reference, e)))?;
    let datum_hash = optional_hash::<32>(row.get(3).map_err(StorageError::from)?, "datum")?.map(DatumHash);
    let script_hash = optional_hash::<28>(row.get(4).map_err(StorageError::from)?, "script")?.map(ScriptHash);
    let created_at_slot: i64 = row.get(5).map_err(StorageError::from)?;
    let created_hash: Vec<u8> = row.get(6).map_err(StorageError::from)?;
    let created_at = crate::model::Checkpoint {
        slot_no: created_at_slot as u64,
        header_hash: HeaderHash::from_slice(&created_hash)
            .ok_or_else(|| StorageError::UnexpectedRow("malformed creation header hash".to_string()))?,
    };
    let spent_at_slot: Option<i64> = row.get(7).map_err(StorageError::from)?;
    let spent_at = match spent_at_slot {
        None => None,
        Some(slot_no) => {
            let hash: Vec<u8> = row.get(8).map_err(StorageError::from)?;
            let transaction: Vec<u8> = row.get(9).map_err(StorageError::from)?;
            Some(SpentAt {
                slot_no: slot_no as u64,
                header_hash: HeaderHash::from_slice(&hash)
                    .ok_or_else(|| StorageError::UnexpectedRow("malformed spend header hash".to_string()))?,
                transaction_id: TransactionId::from_slice(&transaction)
                    .ok_or_else(|| StorageError::UnexpectedRow("malformed spend transaction id".to_string()))?,
            })
        }
    };
    Ok(Input { output_reference, address, value, datum_hash, script_hash, created_at, spent_at })
}

pub fn insert_input(conn: &Connection, input: &Input) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR REPLACE INTO inputs
            (output_reference, address, payment_credential, delegation_credential, value, datum_hash, script_hash,
             created_at_slot_no, created_at_header_hash, spent_at_slot_no, spent_at_header_hash, spent_at_transaction_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL)",
        params![
            input.output_reference.to_bytes().to_vec(),
            input.address.text(),
            input.address.payment_credential().map(|c| c.to_string()),
            input.address.delegation_credential().map(|c| c.to_string()),
            input.value.to_cbor(),
            input.datum_hash.map(|h| h.as_bytes().to_vec()),
            input.script_hash.map(|h| h.as_bytes().to_vec()),
            input.created_at.slot_no as i64,
            input.created_at.header_hash.as_bytes(),
        ],
    )?;
    for policy_id in input.value.assets.keys().map(|asset| asset.policy_id).collect::<std::collections::BTreeSet<_>>() {
        conn.execute(
            "INSERT OR IGNORE INTO policies (output_reference, policy_id) VALUES (?1, ?2)",
            params![input.output_reference.to_bytes().to_vec(), policy_id.to_string()],
        )?;
    }
    Ok(())
}

/// Marks the referenced input spent; a reference to an output this index
/// never materialized is a no-op.
pub fn mark_spent(conn: &Connection, reference: &OutputReference, spent_at: &SpentAt) -> Result<usize, StorageError> {
    let updated = conn.execute(
        "UPDATE inputs
            SET spent_at_slot_no = ?2, spent_at_header_hash = ?3, spent_at_transaction_id = ?4
          WHERE output_reference = ?1",
        params![
            reference.to_bytes().to_vec(),
            spent_at.slot_no as i64,
            spent_at.header_hash.as_bytes(),
            spent_at.transaction_id.as_bytes(),
        ],
    )?;
    Ok(updated)
}

/// Runs `each` over every row matched by the pattern, filters and status
/// flag, in creation-slot order. The SQL pre-filter may over-select for asset
/// patterns; the in-process match settles it. `each` returning false stops
/// the scan.
pub fn fold_matches(
    conn: &Connection,
    pattern: &Pattern,
    status: StatusFlag,
    sort: SortDirection,
    match_filters: &MatchFilters,
    each: &mut dyn FnMut(Input) -> bool,
) -> Result<(), StorageError> {
    let (sql, sql_params) = filters::build_match_query(pattern, status, sort);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(sql_params))?;
    while let Some(row) = rows.next()? {
        let input = input_from_row(row)?;
        let output = Output {
            address: input.address.clone(),
            value: input.value.clone(),
            datum_hash: input.datum_hash,
            script_hash: input.script_hash,
        };
        if !pattern.matches(&input.output_reference, &output) || !match_filters.accepts(&input) {
            continue;
        }
        if !each(input) {
            break;
        }
    }
    Ok(())
}

/// Deletes every row matched by the pattern and status flag, together with
/// its policy join rows. Collected in process first so the asset-level
/// post-filter applies to deletions exactly as it does to queries.
pub fn delete_matches(conn: &Connection, pattern: &Pattern, status: StatusFlag) -> Result<usize, StorageError> {
    let mut references: Vec<OutputReference> = Vec::new();
    fold_matches(conn, pattern, status, SortDirection::Desc, &MatchFilters::default(), &mut |input| {
        references.push(input.output_reference);
        true
    })?;
    for reference in &references {
        let key = reference.to_bytes().to_vec();
        conn.execute("DELETE FROM policies WHERE output_reference = ?1", params![key])?;
        conn.execute("DELETE FROM inputs WHERE output_reference = ?1", params![key])?;
    }
    Ok(references.len())
}

pub fn insert_binary_data(conn: &Connection, hash: &DatumHash, bytes: &[u8]) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO binary_data (binary_data_hash, binary_data) VALUES (?1, ?2)",
        params![hash.as_bytes(), bytes],
    )?;
    Ok(())
}

pub fn get_binary_data(conn: &Connection, hash: &DatumHash) -> Result<Option<Vec<u8>>, StorageError> {
    let row = conn
        .query_row(
            "SELECT binary_data FROM binary_data WHERE binary_data_hash = ?1",
            params![hash.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row)
}

pub fn insert_script(conn: &Connection, hash: &ScriptHash, script: &Script) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO scripts (script_hash, script_language, script) VALUES (?1, ?2, ?3)",
        params![hash.as_bytes(), script.language.as_str(), script.bytes],
    )?;
    Ok(())
}

pub fn get_script(conn: &Connection, hash: &ScriptHash) -> Result<Option<Script>, StorageError> {
    let row = conn
        .query_row(
            "SELECT script_language, script FROM scripts WHERE script_hash = ?1",
            params![hash.as_bytes()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((language, bytes)) => {
            let language = ScriptLanguage::from_str(&language)
                .map_err(|_| StorageError::UnexpectedRow(format!("unknown script language: {}", language)))?;
            Ok(Some(Script { language, bytes }))
        }
    }
}

pub fn insert_pattern(conn: &Connection, pattern: &Pattern) -> Result<(), StorageError> {
    conn.execute("INSERT OR IGNORE INTO patterns (pattern) VALUES (?1)", params![pattern.to_string()])?;
    Ok(())
}

pub fn delete_pattern(conn: &Connection, pattern: &Pattern) -> Result<usize, StorageError> {
    let deleted = conn.execute("DELETE FROM patterns WHERE pattern = ?1", params![pattern.to_string()])?;
    Ok(deleted)
}

pub fn list_patterns(conn: &Connection) -> Result<Vec<Pattern>, StorageError> {
    let mut stmt = conn.prepare("SELECT pattern FROM patterns ORDER BY pattern")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let text = row?;
        let pattern = text
            .parse::<Pattern>()
            .map_err(|_| StorageError::UnexpectedRow(format!("unreadable persisted pattern: {}", text)))?;
        out.push(pattern);
    }
    Ok(out)
}

/// Garbage collection: spent inputs that fell behind the rollback horizon
/// cannot be resurrected by any admissible rollback, so they can go.
pub fn prune_spent_inputs(conn: &Connection, horizon_slot: u64) -> Result<usize, StorageError> {
    conn.execute(
        "DELETE FROM policies WHERE output_reference IN
           (SELECT output_reference FROM inputs WHERE spent_at_slot_no IS NOT NULL AND spent_at_slot_no < ?1)",
        params![horizon_slot as i64],
    )?;
    let deleted = conn.execute(
        "DELETE FROM inputs WHERE spent_at_slot_no IS NOT NULL AND spent_at_slot_no < ?1",
        params![horizon_slot as i64],
    )?;
    Ok(deleted)
}

/// Binary data and scripts are kept alive by referencing inputs; anything no
/// longer referenced is collected.
pub fn prune_orphan_binary_data(conn: &Connection) -> Result<usize, StorageError> {
    let deleted = conn.execute(
        "DELETE FROM binary_data WHERE binary_data_hash NOT IN
           (SELECT datum_hash FROM inputs WHERE datum_hash IS NOT NULL)",
        [],
    )?;
    Ok(deleted)
}

pub fn prune_orphan_scripts(conn: &Connection) -> Result<usize, StorageError> {
    let deleted = conn.execute(
        "DELETE FROM scripts WHERE script_hash NOT IN
           (SELECT script_hash FROM inputs WHERE script_hash IS NOT NULL)",
        [],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Checkpoint;
    use crate::storage::schema;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        schema::install_indexes(&conn).unwrap();
        conn
    }

    fn address(payment: u8, delegation: u8) -> Address {
        let mut payload = vec![0x01];
        payload.extend_from_slice(&[payment; 28]);
        payload.extend_from_slice(&[delegation; 28]);
        Address::from_text(&hex::encode(payload)).unwrap()
    }

    fn input_at(slot_no: u64, transaction: u8, index: u16, value: Value) -> Input {
        Input {
            output_reference: OutputReference { transaction_id: TransactionId([transaction; 32]), output_index: index },
            address: address(1, 2),
            value,
            datum_hash: None,
            script_hash: None,
            created_at: Checkpoint { slot_no, header_hash: HeaderHash([slot_no as u8; 32]) },
            spent_at: None,
        }
    }

    fn collect(conn: &Connection, pattern: &Pattern, status: StatusFlag, sort: SortDirection) -> Vec<Input> {
        let mut out = Vec::new();
        fold_matches(conn, pattern, status, sort, &MatchFilters::default(), &mut |input| {
            out.push(input);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn insert_then_fold_roundtrips_the_row() {
        let conn = fresh();
        let input = input_at(10, 7, 0, Value::coins(42));
        insert_input(&conn, &input).unwrap();
        let rows = collect(&conn, &Pattern::Any, StatusFlag::Any, SortDirection::Desc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].output_reference, input.output_reference);
        assert_eq!(rows[0].value, input.value);
        assert_eq!(rows[0].address.text(), input.address.text());
        assert!(rows[0].spent_at.is_none());
    }

    #[test]
    fn status_flags_split_spent_and_unspent() {
        let conn = fresh();
        insert_input(&conn, &input_at(10, 1, 0, Value::coins(1))).unwrap();
        insert_input(&conn, &input_at(20, 2, 0, Value::coins(2))).unwrap();
        let spend = SpentAt { slot_no: 30, header_hash: HeaderHash([30; 32]), transaction_id: TransactionId([9; 32]) };
        let updated = mark_spent(
            &conn,
            &OutputReference { transaction_id: TransactionId([1; 32]), output_index: 0 },
            &spend,
        )
        .unwrap();
        assert_eq!(updated, 1);

        assert_eq!(collect(&conn, &Pattern::Any, StatusFlag::OnlySpent, SortDirection::Asc).len(), 1);
        assert_eq!(collect(&conn, &Pattern::Any, StatusFlag::OnlyUnspent, SortDirection::Asc).len(), 1);
        assert_eq!(collect(&conn, &Pattern::Any, StatusFlag::Any, SortDirection::Asc).len(), 2);

        // marking an unknown reference is a no-op
        let missing = OutputReference { transaction_id: TransactionId([0xaa; 32]), output_index: 5 };
        assert_eq!(mark_spent(&conn, &missing, &spend).unwrap(), 0);
    }

    #[test]
    fn sort_direction_orders_by_creation_slot() {
        let conn = fresh();
        for (slot, transaction) in [(30u64, 3u8), (10, 1), (20, 2)] {
            insert_input(&conn, &input_at(slot, transaction, 0, Value::coins(slot))).unwrap();
        }
        let descending: Vec<u64> =
            collect(&conn, &Pattern::Any, StatusFlag::Any, SortDirection::Desc).iter().map(|i| i.created_at.slot_no).collect();
        assert_eq!(descending, vec![30, 20, 10]);
        let ascending: Vec<u64> =
            collect(&conn, &Pattern::Any, StatusFlag::Any, SortDirection::Asc).iter().map(|i| i.created_at.slot_no).collect();
        assert_eq!(ascending, vec![10, 20, 30]);
    }

    #[test]
    fn asset_patterns_post_filter_on_the_asset_name() {
        let conn = fresh();
        let policy = PolicyId([5; 28]);
        insert_input(&conn, &input_at(10, 1, 0, Value::coins(1).with_asset(policy, AssetName(vec![0xaa]), 1))).unwrap();
        insert_input(&conn, &input_at(20, 2, 0, Value::coins(1).with_asset(policy, AssetName(vec![0xbb]), 1))).unwrap();

        let by_policy = collect(&conn, &Pattern::Policy(policy), StatusFlag::Any, SortDirection::Asc);
        assert_eq!(by_policy.len(), 2);

        let by_asset = collect(
            &conn,
            &Pattern::Asset { policy_id: policy, asset_name: AssetName(vec![0xaa]) },
            StatusFlag::Any,
            SortDirection::Asc,
        );
        assert_eq!(by_asset.len(), 1);
        assert_eq!(by_asset[0].created_at.slot_no, 10);

        // deletion honors the same post-filter
        let deleted =
            delete_matches(&conn, &Pattern::Asset { policy_id: policy, asset_name: AssetName(vec![0xaa]) }, StatusFlag::Any)
                .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(collect(&conn, &Pattern::Policy(policy), StatusFlag::Any, SortDirection::Asc).len(), 1);
    }

    #[test]
    fn gc_prunes_spent_inputs_and_orphans() {
        let conn = fresh();
        let datum = DatumHash([0xd; 32]);
        let mut spent = input_at(10, 1, 0, Value::coins(1).with_asset(PolicyId([5; 28]), AssetName::empty(), 1));
        spent.datum_hash = Some(datum);
        insert_input(&conn, &spent).unwrap();
        insert_binary_data(&conn, &datum, &[0x01, 0x02]).unwrap();
        mark_spent(
            &conn,
            &spent.output_reference,
            &SpentAt { slot_no: 50, header_hash: HeaderHash([50; 32]), transaction_id: TransactionId([2; 32]) },
        )
        .unwrap();

        // still inside the horizon: nothing to prune
        assert_eq!(prune_spent_inputs(&conn, 40).unwrap(), 0);
        assert_eq!(prune_orphan_binary_data(&conn).unwrap(), 0);

        // once the spend fell behind the horizon, the row and its datum go
        assert_eq!(prune_spent_inputs(&conn, 100).unwrap(), 1);
        assert_eq!(prune_orphan_binary_data(&conn).unwrap(), 1);
        assert_eq!(get_binary_data(&conn, &datum).unwrap(), None);
        let orphan_policies: i64 = conn.query_row("SELECT count(*) FROM policies", [], |row| row.get(0)).unwrap();
        assert_eq!(orphan_policies, 0);
    }

    #[test]
    fn scripts_roundtrip_and_orphan_collection() {
        let conn = fresh();
        let hash = ScriptHash([0x5c; 28]);
        let script = Script { language: ScriptLanguage::PlutusV2, bytes: vec![0xde, 0xad] };
        insert_script(&conn, &hash, &script).unwrap();
        assert_eq!(get_script(&conn, &hash).unwrap(), Some(script));
        assert_eq!(prune_orphan_scripts(&conn).unwrap(), 1);
        assert_eq!(get_script(&conn, &hash).unwrap(), None);
    }

    #[test]
    fn patterns_persist_and_reload() {
        let conn = fresh();
        let patterns = [Pattern::Any, Pattern::Policy(PolicyId([3; 28]))];
        for pattern in &patterns {
            insert_pattern(&conn, pattern).unwrap();
            // inserting twice is fine
            insert_pattern(&conn, pattern).unwrap();
        }
        let loaded = list_patterns(&conn).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&Pattern::Any));
        assert_eq!(delete_pattern(&conn, &Pattern::Any).unwrap(), 1);
        assert_eq!(list_patterns(&conn).unwrap().len(), 1);
    }
}
