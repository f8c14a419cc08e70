use crate::model::{SortDirection, StatusFlag};
use crate::pattern::Pattern;
use rusqlite::types::Value as SqlValue;

/// A parameterized WHERE fragment. The translator is total over the pattern
/// variants; every fragment leads with an indexed column so the planner picks
/// the same index for a given variant every time.
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub fn pattern_to_sql(pattern: &Pattern) -> WhereClause {
    match pattern {
        Pattern::Any => WhereClause { sql: "output_reference IS NOT NULL".to_string(), params: vec![] },
        Pattern::ExactAddress(address) => WhereClause {
            sql: "address = ?".to_string(),
            params: vec![SqlValue::Text(address.text().to_string())],
        },
        Pattern::PaymentCredential(credential) => WhereClause {
            sql: "payment_credential = ?".to_string(),
            params: vec![SqlValue::Text(credential.to_string())],
        },
        Pattern::DelegationCredential(credential) => WhereClause {
            sql: "delegation_credential = ?".to_string(),
            params: vec![SqlValue::Text(credential.to_string())],
        },
        Pattern::AddressPair { payment, delegation } => WhereClause {
            sql: "payment_credential = ? AND delegation_credential = ?".to_string(),
            params: vec![SqlValue::Text(payment.to_string()), SqlValue::Text(delegation.to_string())],
        },
        // Asset patterns pre-filter on the policy join table; the asset name
        // is checked in process once the value has been decoded.
        Pattern::Policy(policy_id) | Pattern::Asset { policy_id, .. } => WhereClause {
            sql: "output_reference IN (SELECT output_reference FROM policies WHERE policy_id = ?)".to_string(),
            params: vec![SqlValue::Text(policy_id.to_string())],
        },
        Pattern::Transaction(transaction_id) => {
            let mut lo = transaction_id.0.to_vec();
            lo.extend_from_slice(&[0x00, 0x00]);
            let mut hi = transaction_id.0.to_vec();
            hi.extend_from_slice(&[0xff, 0xff]);
            WhereClause {
                sql: "output_reference >= ? AND output_reference <= ?".to_string(),
                params: vec![SqlValue::Blob(lo), SqlValue::Blob(hi)],
            }
        }
        Pattern::Reference(reference) => WhereClause {
            sql: "output_reference = ?".to_string(),
            params: vec![SqlValue::Blob(reference.to_bytes().to_vec())],
        },
    }
}

pub fn status_flag_to_sql(status: StatusFlag) -> Option<&'static str> {
    match status {
        StatusFlag::Any => None,
        StatusFlag::OnlyUnspent => Some("spent_at_slot_no IS NULL"),
        StatusFlag::OnlySpent => Some("spent_at_slot_no IS NOT NULL"),
    }
}

const INPUT_COLUMNS: &str = "output_reference, address, value, datum_hash, script_hash, \
     created_at_slot_no, created_at_header_hash, spent_at_slot_no, spent_at_header_hash, spent_at_transaction_id";

/// The full SELECT used by `/matches` and by deletion previews.
pub fn build_match_query(pattern: &Pattern, status: StatusFlag, sort: SortDirection) -> (String, Vec<SqlValue>) {
    let WhereClause { sql, params } = pattern_to_sql(pattern);
    let mut query = format!("SELECT {} FROM inputs WHERE {}", INPUT_COLUMNS, sql);
    if let Some(status_sql) = status_flag_to_sql(status) {
        query.push_str(" AND ");
        query.push_str(status_sql);
    }
    query.push_str(" ORDER BY created_at_slot_no ");
    query.push_str(sort.as_sql());
    (query, params)
}

/// The DELETE used by `DELETE /matches/{pattern}`.
pub fn build_match_delete(pattern: &Pattern, status: StatusFlag) -> (String, Vec<SqlValue>) {
    let WhereClause { sql, params } = pattern_to_sql(pattern);
    let mut query = format!("DELETE FROM inputs WHERE {}", sql);
    if let Some(status_sql) = status_flag_to_sql(status) {
        query.push_str(" AND ");
        query.push_str(status_sql);
    }
    (query, params)
}
