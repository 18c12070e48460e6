//! Mutations waiting for remote confirmation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{DailyKey, DailyRecord, ProcedureCall, Profile, Record};

/// Store-assigned outbox id. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutboxId(pub i64);

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queued mutation. The set of operations is closed: every variant carries
/// exactly the arguments needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboxOp {
    UpsertDaily(DailyRecord),
    UpsertProfile(Profile),
    DeleteDaily(DailyKey),
    Call(ProcedureCall),
}

/// Discriminant of [`OutboxOp`], stored in its own column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    UpsertDaily,
    UpsertProfile,
    DeleteDaily,
    Call,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [
        OpKind::UpsertProfile,
        OpKind::UpsertDaily,
        OpKind::Call,
        OpKind::DeleteDaily,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::UpsertDaily => "upsert_daily",
            OpKind::UpsertProfile => "upsert_profile",
            OpKind::DeleteDaily => "delete_daily",
            OpKind::Call => "call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert_daily" => Some(OpKind::UpsertDaily),
            "upsert_profile" => Some(OpKind::UpsertProfile),
            "delete_daily" => Some(OpKind::DeleteDaily),
            "call" => Some(OpKind::Call),
            _ => None,
        }
    }

    /// Replay order across kinds. Upserts go before procedure calls, and
    /// deletes go last so an add is never overtaken by its delete.
    pub fn precedence(&self) -> u8 {
        match self {
            OpKind::UpsertProfile => 0,
            OpKind::UpsertDaily => 1,
            OpKind::Call => 2,
            OpKind::DeleteDaily => 3,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OutboxOp {
    pub fn kind(&self) -> OpKind {
        match self {
            OutboxOp::UpsertDaily(_) => OpKind::UpsertDaily,
            OutboxOp::UpsertProfile(_) => OpKind::UpsertProfile,
            OutboxOp::DeleteDaily(_) => OpKind::DeleteDaily,
            OutboxOp::Call(_) => OpKind::Call,
        }
    }

    /// Cache key of the record this op rewrites. Procedure calls have none.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            OutboxOp::UpsertDaily(record) => Some(record.cache_key()),
            OutboxOp::UpsertProfile(profile) => Some(profile.cache_key()),
            OutboxOp::DeleteDaily(key) => Some(key.cache_key()),
            OutboxOp::Call(_) => None,
        }
    }

    /// The payload alone, as persisted next to the kind column.
    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            OutboxOp::UpsertDaily(record) => serde_json::to_value(record),
            OutboxOp::UpsertProfile(profile) => serde_json::to_value(profile),
            OutboxOp::DeleteDaily(key) => serde_json::to_value(key),
            OutboxOp::Call(call) => serde_json::to_value(call),
        }
    }

    /// Rebuild an op from its persisted kind and payload.
    pub fn from_parts(kind: OpKind, payload: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            OpKind::UpsertDaily => OutboxOp::UpsertDaily(serde_json::from_value(payload)?),
            OpKind::UpsertProfile => OutboxOp::UpsertProfile(serde_json::from_value(payload)?),
            OpKind::DeleteDaily => OutboxOp::DeleteDaily(serde_json::from_value(payload)?),
            OpKind::Call => OutboxOp::Call(serde_json::from_value(payload)?),
        })
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
    pub id: OutboxId,
    pub op: OutboxOp,
    /// Epoch milliseconds at enqueue time.
    pub created_at: i64,
    /// Failed replay attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxItem {
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OpKind::parse("upsert_widget"), None);
    }

    #[test]
    fn test_precedence_puts_deletes_last() {
        let mut kinds = OpKind::ALL.to_vec();
        kinds.sort_by_key(|k| std::cmp::Reverse(k.precedence()));
        assert_eq!(kinds[0], OpKind::DeleteDaily);
        assert!(OpKind::UpsertDaily.precedence() < OpKind::Call.precedence());
    }

    #[test]
    fn test_payload_is_bare_record() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let op = OutboxOp::UpsertDaily(DailyRecord::new("u1", date, 2.0));
        let payload = op.payload().expect("payload");
        assert_eq!(payload["user"], json!("u1"));
        assert!(payload.get("type").is_none());

        let rebuilt = OutboxOp::from_parts(op.kind(), payload).expect("rebuild op");
        assert_eq!(rebuilt, op);
    }

    #[test]
    fn test_cache_key_names_the_rewritten_record() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let delete = OutboxOp::DeleteDaily(DailyKey::new("u1", date));
        assert_eq!(delete.cache_key().as_deref(), Some("daily:u1:2025-01-05"));
        let call = OutboxOp::Call(ProcedureCall::new("recalc", json!({})));
        assert_eq!(call.cache_key(), None);
    }

    #[test]
    fn test_from_parts_rejects_mismatched_payload() {
        let result = OutboxOp::from_parts(OpKind::DeleteDaily, json!({"procedure": "x"}));
        assert!(result.is_err());
    }
}
