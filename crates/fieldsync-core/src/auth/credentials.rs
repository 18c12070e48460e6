use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "fieldsync";

/// Backend API keys in the OS keychain, one entry per backend URL.
pub struct CredentialStore;

impl CredentialStore {
    /// Store the API key for a backend in the OS keychain
    pub fn store_api_key(backend_url: &str, api_key: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, backend_url)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(api_key)
            .context("Failed to store API key in keychain")?;
        Ok(())
    }

    /// Retrieve the API key for a backend, `None` when nothing is stored
    pub fn get_api_key(backend_url: &str) -> Result<Option<String>> {
        let entry = Entry::new(SERVICE_NAME, backend_url)
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(key) => Ok(Some(key)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve API key from keychain"),
        }
    }

    /// Delete the stored API key for a backend. Deleting a missing key is fine.
    pub fn delete(backend_url: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, backend_url)
            .context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete API key from keychain"),
        }
    }
}
