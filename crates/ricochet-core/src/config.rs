//! Persistent configuration.
//!
//! A single JSON document holding the identity key and the contact list.
//! Writers follow `open_write() → mutate → save()`; `save` replaces the
//! file atomically via a temp-file rename. A failed save is logged and the
//! in-memory state stands.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

/// Root of the config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRoot {
    /// The local identity, once generated.
    #[serde(rename = "Identity", default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,
    /// Contacts keyed by stringified contact id.
    #[serde(rename = "Contacts", default)]
    pub contacts: HashMap<String, ContactConfig>,
}

/// Persisted identity material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base64 PKCS#1 DER private key of the hidden service.
    #[serde(rename = "ServiceKey")]
    pub service_key: String,
}

/// One persisted contact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactConfig {
    /// Full onion hostname, `<label>.onion`.
    #[serde(rename = "Hostname")]
    pub hostname: String,
    /// Display nickname.
    #[serde(rename = "Nickname", default)]
    pub nickname: String,
    /// RFC3339 creation time.
    #[serde(rename = "WhenCreated", default)]
    pub when_created: String,
    /// RFC3339 time of the last successful connection.
    #[serde(rename = "LastConnected", default, skip_serializing_if = "String::is_empty")]
    pub last_connected: String,
    /// Outbound contact request state, if any.
    #[serde(rename = "Request", default, skip_serializing_if = "ContactRequestConfig::is_empty")]
    pub request: ContactRequestConfig,
}

/// Persisted outbound contact request state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequestConfig {
    /// Whether a request is outstanding.
    #[serde(rename = "Pending", default)]
    pub pending: bool,
    /// RFC3339 time the peer acknowledged the request as pending.
    #[serde(rename = "WhenDelivered", default, skip_serializing_if = "String::is_empty")]
    pub when_delivered: String,
    /// RFC3339 time the peer rejected the request.
    #[serde(rename = "WhenRejected", default, skip_serializing_if = "String::is_empty")]
    pub when_rejected: String,
    /// Error reported by the peer, if any.
    #[serde(rename = "RemoteError", default, skip_serializing_if = "String::is_empty")]
    pub remote_error: String,
    /// Nickname we introduced ourselves with.
    #[serde(rename = "MyNickname", default, skip_serializing_if = "String::is_empty")]
    pub my_nickname: String,
    /// Greeting text of the request.
    #[serde(rename = "Message", default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ContactRequestConfig {
    /// True when no request state is recorded at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct StoreInner {
    path: Option<PathBuf>,
    doc: Mutex<ConfigRoot>,
}

/// Handle to the shared config document.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    /// Load the document at `path`, or start empty if the file does not
    /// exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Persist(format!("config parse failed: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigRoot::default(),
            Err(e) => return Err(Error::Persist(format!("config read failed: {}", e))),
        };
        Ok(Self {
            inner: Arc::new(StoreInner {
                path: Some(path),
                doc: Mutex::new(doc),
            }),
        })
    }

    /// A store that never touches disk. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: None,
                doc: Mutex::new(ConfigRoot::default()),
            }),
        }
    }

    /// Read from the document.
    pub fn read<R>(&self, f: impl FnOnce(&ConfigRoot) -> R) -> R {
        let guard = match self.inner.doc.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }

    /// Start a write transaction. Holds the document lock until the guard
    /// is dropped; call [`WriteGuard::save`] to persist.
    pub fn open_write(&self) -> WriteGuard<'_> {
        let guard = match self.inner.doc.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        WriteGuard {
            guard,
            path: self.inner.path.as_deref(),
        }
    }
}

/// An open write transaction on the config document.
pub struct WriteGuard<'a> {
    guard: MutexGuard<'a, ConfigRoot>,
    path: Option<&'a Path>,
}

impl Deref for WriteGuard<'_> {
    type Target = ConfigRoot;

    fn deref(&self) -> &ConfigRoot {
        &self.guard
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut ConfigRoot {
        &mut self.guard
    }
}

impl WriteGuard<'_> {
    /// Persist the document with an atomic replace. Failures are logged;
    /// the in-memory document keeps the mutation either way.
    pub fn save(self) {
        let Some(path) = self.path else {
            return;
        };
        if let Err(e) = write_atomically(path, &self.guard) {
            error!(path = %path.display(), error = %e, "config save failed");
        }
    }
}

fn write_atomically(path: &Path, doc: &ConfigRoot) -> Result<()> {
    let json = serde_json::to_vec_pretty(doc)
        .map_err(|e| Error::Persist(format!("config serialize failed: {}", e)))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &json).map_err(|e| Error::Persist(format!("write failed: {}", e)))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::Persist(format!("rename failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ricochet-core-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let path = temp_config_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let store = ConfigStore::load(&path).expect("load empty");
        {
            let mut write = store.open_write();
            write.contacts.insert(
                "0".into(),
                ContactConfig {
                    hostname: "jlq67qzo6s4yp3sp.onion".into(),
                    nickname: "alice".into(),
                    when_created: "2024-01-01T00:00:00Z".into(),
                    ..Default::default()
                },
            );
            write.save();
        }

        let reloaded = ConfigStore::load(&path).expect("reload");
        let contact = reloaded.read(|doc| doc.contacts.get("0").cloned()).expect("contact");
        assert_eq!(contact.hostname, "jlq67qzo6s4yp3sp.onion");
        assert_eq!(contact.nickname, "alice");
        assert!(contact.request.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn request_block_serializes_with_named_fields() {
        let cfg = ContactConfig {
            hostname: "jlq67qzo6s4yp3sp.onion".into(),
            request: ContactRequestConfig {
                pending: true,
                my_nickname: "me".into(),
                message: "hello".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("\"Hostname\""));
        assert!(json.contains("\"Request\""));
        assert!(json.contains("\"Pending\":true"));
        assert!(json.contains("\"MyNickname\":\"me\""));
    }

    #[test]
    fn in_memory_store_discards_save() {
        let store = ConfigStore::in_memory();
        let mut write = store.open_write();
        write.contacts.insert("1".into(), ContactConfig::default());
        write.save();
        assert_eq!(store.read(|doc| doc.contacts.len()), 1);
    }
}
