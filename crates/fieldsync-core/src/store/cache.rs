use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Cache, StoreError};

/// A stored cache value with the time it was last written.
///
/// `updated_at` is diagnostic only; entries never expire on a clock.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True for a `Null` tombstone ("known empty", as opposed to never fetched).
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.updated_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// Read and decode a cached value. `Ok(None)` for a missing key, a tombstone,
/// or a value that no longer decodes as `T`.
pub fn get_as<T: DeserializeOwned>(cache: &impl Cache, key: &str) -> Result<Option<T>, StoreError> {
    let value = cache.get(key)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => {
            debug!(key, error = %e, "Cached value does not decode, treating as miss");
            Ok(None)
        }
    }
}

pub fn set_as<T: Serialize>(cache: &impl Cache, key: &str, value: &T) -> Result<(), StoreError> {
    let value = serde_json::to_value(value)?;
    cache.set(key, &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry_aged(minutes: i64) -> CacheEntry {
        CacheEntry {
            key: "k".to_string(),
            value: json!([1, 2, 3]),
            updated_at: Utc::now() - Duration::minutes(minutes),
        }
    }

    #[test]
    fn test_age_display_just_now() {
        assert_eq!(entry_aged(0).age_display(), "just now");
        assert_eq!(entry_aged(-5).age_display(), "just now");
    }

    #[test]
    fn test_age_display_rounding() {
        assert_eq!(entry_aged(5).age_display(), "5m ago");
        assert_eq!(entry_aged(95).age_display(), "2h ago");
        assert_eq!(entry_aged(70).age_display(), "1h ago");
        assert_eq!(entry_aged(1440 + 13 * 60).age_display(), "2d ago");
    }

    #[test]
    fn test_tombstone() {
        let mut entry = entry_aged(0);
        assert!(!entry.is_tombstone());
        entry.value = Value::Null;
        assert!(entry.is_tombstone());
    }
}
