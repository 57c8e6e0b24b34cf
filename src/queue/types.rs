use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    LedgerDebit,
    LedgerCredit,
    GenericMutation,
}

impl MutationKind {
    pub fn is_ledger(&self) -> bool {
        matches!(self, MutationKind::LedgerDebit | MutationKind::LedgerCredit)
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MutationKind::LedgerDebit => "ledger_debit",
            MutationKind::LedgerCredit => "ledger_credit",
            MutationKind::GenericMutation => "generic_mutation",
        };
        f.write_str(s)
    }
}

/// Payload of a `LedgerDebit` / `LedgerCredit` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerPayload {
    pub transaction_id: String,
    /// Always positive; the kind carries the sign
    pub amount: i64,
    pub reason: String,
    /// No pending delta backs this entry; the amount is folded into the
    /// confirmed balance once the server accepts it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,
}

impl LedgerPayload {
    /// Signed delta this payload applies to the ledger
    pub fn delta(&self, kind: MutationKind) -> i64 {
        match kind {
            MutationKind::LedgerDebit => -self.amount,
            _ => self.amount,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordOp {
    Upsert,
    Delete,
}

/// Payload of a `GenericMutation` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMutation {
    pub key: String,
    pub op: RecordOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: u64,
    pub kind: MutationKind,
    pub payload: JsonValue,
    pub enqueued_at: u64, // Unix timestamp (ms)
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>, // Unix timestamp (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn ledger_payload(&self) -> SyncResult<LedgerPayload> {
        if !self.kind.is_ledger() {
            return Err(SyncError::Storage(format!(
                "queue entry {} is a {}, not a ledger mutation",
                self.id, self.kind
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn record_mutation(&self) -> SyncResult<RecordMutation> {
        if self.kind != MutationKind::GenericMutation {
            return Err(SyncError::Storage(format!(
                "queue entry {} is a {}, not a record mutation",
                self.id, self.kind
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Ledger transaction this entry settles, if any
    pub fn transaction_id(&self) -> Option<String> {
        self.ledger_payload().ok().map(|p| p.transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(kind: MutationKind, payload: JsonValue) -> QueueEntry {
        QueueEntry {
            id: 1,
            kind,
            payload,
            enqueued_at: 0,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_value(MutationKind::LedgerDebit).unwrap(),
            json!("ledger_debit")
        );
        assert_eq!(MutationKind::GenericMutation.to_string(), "generic_mutation");
        assert!(MutationKind::LedgerCredit.is_ledger());
        assert!(!MutationKind::GenericMutation.is_ledger());
    }

    #[test]
    fn test_ledger_payload_delta_sign() {
        let payload = LedgerPayload {
            transaction_id: "tx".to_string(),
            amount: 15,
            reason: "scan".to_string(),
            deferred: false,
        };
        assert_eq!(payload.delta(MutationKind::LedgerDebit), -15);
        assert_eq!(payload.delta(MutationKind::LedgerCredit), 15);
    }

    #[test]
    fn test_typed_payload_accessors() {
        let debit = entry(
            MutationKind::LedgerDebit,
            json!({"transaction_id": "tx-1", "amount": 10, "reason": "ai"}),
        );
        assert_eq!(debit.transaction_id().as_deref(), Some("tx-1"));
        assert!(debit.record_mutation().is_err());

        let generic = entry(
            MutationKind::GenericMutation,
            json!({"key": "field:9", "op": "delete"}),
        );
        let mutation = generic.record_mutation().unwrap();
        assert_eq!(mutation.op, RecordOp::Delete);
        assert_eq!(mutation.value, None);
        assert_eq!(generic.transaction_id(), None);
    }

    #[test]
    fn test_entry_defaults_when_fields_missing() {
        let parsed: QueueEntry = serde_json::from_value(json!({
            "id": 4,
            "kind": "ledger_credit",
            "payload": {},
            "enqueued_at": 7
        }))
        .unwrap();
        assert_eq!(parsed.attempts, 0);
        assert_eq!(parsed.last_error, None);
    }
}
