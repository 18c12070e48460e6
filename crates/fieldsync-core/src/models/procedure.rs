use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote procedure invocation. Procedures are side-effecting, so queued
/// calls are replayed one at a time and never batched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    pub procedure: String,
    #[serde(default)]
    pub args: Value,
}

impl ProcedureCall {
    pub fn new(procedure: impl Into<String>, args: Value) -> Self {
        Self {
            procedure: procedure.into(),
            args,
        }
    }
}
