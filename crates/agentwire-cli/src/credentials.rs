//! Stored agent credentials
//!
//! `login` writes the agent id and refresh token to
//! `<config_dir>/agentwire/credentials.json`; `chat` reads them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub agent_id: String,
    pub refresh_token: String,
    pub saved_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(agent_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            refresh_token: refresh_token.into(),
            saved_at: Utc::now(),
        }
    }
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store under the platform config directory
    pub fn default_location() -> Result<Self, String> {
        let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(Self::new(dir.join("agentwire").join("credentials.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credentials>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| format!("Failed to read {}: {e}", self.path.display()))?;
        let credentials = serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse {}: {e}", self.path.display()))?;
        Ok(Some(credentials))
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(credentials)
            .map_err(|e| format!("Failed to serialize credentials: {e}"))?;
        fs::write(&self.path, raw)
            .map_err(|e| format!("Failed to write {}: {e}", self.path.display()))?;
        restrict_permissions(&self.path)
    }

    /// Remove stored credentials; `false` if there were none
    pub fn clear(&self) -> Result<bool, String> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .map_err(|e| format!("Failed to remove {}: {e}", self.path.display()))?;
        Ok(true)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| format!("Failed to set permissions on {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("nested").join("credentials.json"));
        assert_eq!(store.load().unwrap(), None);

        let credentials = Credentials::new("agent-1", "refresh-1");
        store.save(&credentials).unwrap();
        assert_eq!(store.load().unwrap(), Some(credentials));

        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
        assert_eq!(store.load().unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store.save(&Credentials::new("a", "r")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();
        assert!(CredentialStore::new(path).load().is_err());
    }
}
