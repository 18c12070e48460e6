use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Buffer before expiry after which the token should be renewed (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    /// Bearer token sent to the backend.
    pub token: String,
    pub user_id: String,
    /// IANA zone the user's periods are evaluated in.
    #[serde(default)]
    pub time_zone: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Tokens without an expiry are treated as long-lived.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            time_zone: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() > at).unwrap_or(false)
    }

    /// Check if the session will expire soon and should be renewed
    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .map(|at| Utc::now() > at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES))
            .unwrap_or(false)
    }

    /// Minutes remaining until expiry (for display), if the token expires
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}

/// Supplies the signed-in user to the sync coordinator.
pub trait SessionProvider: Send + Sync {
    /// The current, unexpired session, if any.
    fn current(&self) -> Option<SessionData>;
}

/// Session persisted as JSON in the data directory.
pub struct Session {
    data_dir: PathBuf,
    data: RwLock<Option<SessionData>>,
}

impl Session {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            data: RwLock::new(None),
        }
    }

    /// Load session from disk. Returns false when there is none or it expired.
    pub fn load(&self) -> Result<bool> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let data: SessionData =
            serde_json::from_str(&contents).context("Failed to parse session file")?;

        if data.is_expired() {
            return Ok(false);
        }
        self.set(Some(data));
        Ok(true)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(data) = self.get() {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(&data)?;
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    /// Clear session data and remove the file
    pub fn clear(&self) -> Result<()> {
        self.set(None);
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Replace the in-memory session
    pub fn update(&self, data: SessionData) {
        self.set(Some(data));
    }

    pub fn get(&self) -> Option<SessionData> {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Check if session is valid (exists and not expired)
    pub fn is_valid(&self) -> bool {
        self.get().map(|d| !d.is_expired()).unwrap_or(false)
    }

    fn set(&self, data: Option<SessionData>) {
        match self.data.write() {
            Ok(mut guard) => *guard = data,
            Err(poisoned) => *poisoned.into_inner() = data,
        }
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

impl SessionProvider for Session {
    fn current(&self) -> Option<SessionData> {
        self.get().filter(|d| !d.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(dir.path().to_path_buf());
        let mut data = SessionData::new("jwt", "u1");
        data.time_zone = Some("America/Chicago".to_string());
        session.update(data.clone());
        session.save().unwrap();

        let reloaded = Session::new(dir.path().to_path_buf());
        assert!(reloaded.load().unwrap());
        assert_eq!(reloaded.current(), Some(data));
    }

    #[test]
    fn test_expired_session_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(dir.path().to_path_buf());
        let mut data = SessionData::new("jwt", "u1");
        data.expires_at = Some(Utc::now() - Duration::minutes(1));
        session.update(data);

        assert!(session.current().is_none());
        assert!(!session.is_valid());

        session.save().unwrap();
        let reloaded = Session::new(dir.path().to_path_buf());
        assert!(!reloaded.load().unwrap());
    }

    #[test]
    fn test_refresh_window() {
        let mut data = SessionData::new("jwt", "u1");
        assert!(!data.needs_refresh());
        assert_eq!(data.minutes_until_expiry(), None);

        data.expires_at = Some(Utc::now() + Duration::minutes(3));
        assert!(data.needs_refresh());
        assert!(!data.is_expired());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(dir.path().to_path_buf());
        session.update(SessionData::new("jwt", "u1"));
        session.save().unwrap();
        assert!(dir.path().join(SESSION_FILE).exists());

        session.clear().unwrap();
        assert!(!dir.path().join(SESSION_FILE).exists());
        assert!(session.current().is_none());
    }
}
