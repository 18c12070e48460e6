use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Record;
use crate::store::keys;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// IANA zone name, e.g. `America/Chicago`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            time_zone: None,
            extra: Map::new(),
        }
    }
}

impl Record for Profile {
    fn cache_key(&self) -> String {
        keys::profile(&self.id)
    }

    fn entity_type() -> &'static str {
        "profile"
    }
}
