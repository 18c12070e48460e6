use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Record;
use crate::period::YearMonth;
use crate::store::keys;

/// One day of field-service activity for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    /// Server-assigned id; absent until the backend has confirmed the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub hours: f64,
    /// Remaining columns, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DailyRecord {
    pub fn new(user: impl Into<String>, date: NaiveDate, hours: f64) -> Self {
        Self {
            id: None,
            user: user.into(),
            date,
            hours,
            extra: Map::new(),
        }
    }

    pub fn key(&self) -> DailyKey {
        DailyKey {
            user: self.user.clone(),
            date: self.date,
        }
    }

    pub fn month(&self) -> YearMonth {
        YearMonth::from_date(self.date)
    }
}

impl Record for DailyRecord {
    fn cache_key(&self) -> String {
        keys::daily(&self.user, self.date)
    }

    fn entity_type() -> &'static str {
        "daily_record"
    }
}

/// Identity of a daily record: one row per user per day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DailyKey {
    pub user: String,
    pub date: NaiveDate,
}

impl DailyKey {
    pub fn new(user: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user: user.into(),
            date,
        }
    }

    pub fn cache_key(&self) -> String {
        keys::daily(&self.user, self.date)
    }

    pub fn month(&self) -> YearMonth {
        YearMonth::from_date(self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_daily_record_keeps_unknown_columns() {
        let value = json!({
            "id": "r1",
            "user": "u1",
            "date": "2025-01-05",
            "hours": 2,
            "studies": 1,
            "note": "morning cart"
        });
        let record: DailyRecord = serde_json::from_value(value).expect("parse daily record");
        assert_eq!(record.id.as_deref(), Some("r1"));
        assert_eq!(record.hours, 2.0);
        assert_eq!(record.extra.get("studies"), Some(&json!(1)));

        let back = serde_json::to_value(&record).expect("serialize daily record");
        assert_eq!(back["note"], json!("morning cart"));
        assert_eq!(back["date"], json!("2025-01-05"));
    }

    #[test]
    fn test_daily_record_without_id_omits_it() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 5).expect("valid date");
        let record = DailyRecord::new("u1", date, 2.0);
        let value = serde_json::to_value(&record).expect("serialize daily record");
        assert!(value.get("id").is_none());
        assert_eq!(record.cache_key(), "daily:u1:2025-01-05");
        assert_eq!(record.key().cache_key(), record.cache_key());
        assert_eq!(record.month().to_string(), "2025-01");
    }
}
