use studio_contracts::credentials::{CredentialStore, Credentials};
use tracing::{info, warn};

pub const SAVE_OK: &str = "API key saved successfully!";
pub const REFRESH_LOADED: &str = "Environment refreshed successfully! API key is loaded.";
pub const REFRESH_MISSING: &str = "Environment refreshed, but no API key found.";

pub fn save_api_key(store: &CredentialStore, api_key: &str) -> String {
    match store.save(api_key) {
        Ok(()) => {
            info!(path = %store.path().display(), "API key saved");
            SAVE_OK.to_string()
        }
        Err(err) => {
            warn!(error = %err, "saving API key failed");
            format!("Error saving API key: {err}")
        }
    }
}

/// Rereads the credentials file. A new snapshot is returned only when the
/// reload itself succeeded; the caller keeps its previous one otherwise.
pub fn refresh_credentials(store: &CredentialStore) -> (String, Option<Credentials>) {
    match store.reload() {
        Ok(credentials) => {
            let status = if credentials.has_api_key() {
                REFRESH_LOADED
            } else {
                REFRESH_MISSING
            };
            info!(source = ?credentials.source(), "credentials refreshed");
            (status.to_string(), Some(credentials))
        }
        Err(err) => {
            warn!(error = %err, "refreshing credentials failed");
            (format!("Error refreshing environment: {err}"), None)
        }
    }
}

pub fn save_and_refresh(store: &CredentialStore, api_key: &str) -> (String, Option<Credentials>) {
    let saved = save_api_key(store, api_key);
    let (refreshed, credentials) = refresh_credentials(store);
    (format!("{saved}\n{refreshed}"), credentials)
}
