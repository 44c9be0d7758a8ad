use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::models::{AuthUser, TokenData, TrackedChannel};
use super::query_cache::{QueryCache, QueryKey};
use super::tracked::{parse_channels, validate_channels};

pub const TRACKED_CHANNELS_BLOB: &str = "tracked channels";
pub const AUTH_SESSION_BLOB: &str = "auth session";

/// External key-value storage for whole serialized blobs.
pub trait BlobStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, contents: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One JSON file per key inside a directory.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use `dir` if given, otherwise the OS config directory for this app.
    pub fn open(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => dirs::config_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
                .join("twitch-opticon"),
        };

        info!(data_dir = %dir.display(), "Resolved data directory");
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            info!(data_dir = %dir.display(), "Created data directory");
        }
        Ok(Self::new(dir))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| match c.is_ascii_alphanumeric() {
                true => c,
                false => '_',
            })
            .collect();
        self.dir.join(format!("{}.json", stem))
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match path.exists() {
            true => fs::read_to_string(&path)
                .map(Some)
                .with_context(|| format!("Failed to read {}", path.display())),
            false => Ok(None),
        }
    }

    fn write(&self, key: &str, contents: &str) -> Result<()> {
        let path = self.path_for(key);
        fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, String>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.get(key).map(|blob| blob.value().clone()))
    }

    fn write(&self, key: &str, contents: &str) -> Result<()> {
        self.blobs.insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: Option<TokenData>,
    pub user: Option<AuthUser>,
}

/// Restores the query cache from blobs at startup and writes them back on change.
pub struct Persister {
    store: Arc<dyn BlobStore>,
    cache: Arc<QueryCache>,
    restoring: watch::Sender<bool>,
}

impl Persister {
    pub fn new(store: Arc<dyn BlobStore>, cache: Arc<QueryCache>) -> Self {
        let (restoring, _) = watch::channel(true);
        Self {
            store,
            cache,
            restoring,
        }
    }

    /// True until [`Persister::restore`] completes.
    pub fn restoring(&self) -> watch::Receiver<bool> {
        self.restoring.subscribe()
    }

    pub fn is_restoring(&self) -> bool {
        *self.restoring.borrow()
    }

    pub fn restore(&self) {
        self.restoring.send_replace(true);
        let guard = self.cache.begin_fetch(QueryKey::TrackedChannels);

        let channels = self.read_tracked_channels();
        // A mutation that started meanwhile owns the list now.
        match guard.is_cancelled() {
            true => info!("tracked channel restore superseded by a mutation"),
            false => self.cache.set_data(QueryKey::TrackedChannels, &channels),
        }
        self.cache.finish_fetch(&guard);

        let session = self.read_auth_session();
        if let Some(token) = &session.token {
            self.cache.set_data(QueryKey::Token, token);
        }
        if let Some(user) = &session.user {
            self.cache.set_data(QueryKey::User, user);
        }

        info!(
            tracked = channels.len(),
            has_token = session.token.is_some(),
            "restored persisted state"
        );
        self.restoring.send_replace(false);
    }

    fn read_tracked_channels(&self) -> Vec<TrackedChannel> {
        let blob = match self.store.read(TRACKED_CHANNELS_BLOB) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Vec::new(),
            Err(e) => {
                error!(error = ?e, "Failed to read tracked channels");
                return Vec::new();
            }
        };
        let parsed = serde_json::from_str(&blob)
            .map_err(|e| e.to_string())
            .and_then(parse_channels);
        match parsed {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Discarding invalid tracked channels blob");
                Vec::new()
            }
        }
    }

    fn read_auth_session(&self) -> AuthSession {
        match self.store.read(AUTH_SESSION_BLOB) {
            Ok(Some(blob)) => serde_json::from_str(&blob).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding invalid auth session blob");
                AuthSession::default()
            }),
            Ok(None) => AuthSession::default(),
            Err(e) => {
                error!(error = ?e, "Failed to read auth session");
                AuthSession::default()
            }
        }
    }

    pub fn persist_tracked_channels(&self) {
        let channels: Vec<TrackedChannel> = self
            .cache
            .get_data(&QueryKey::TrackedChannels)
            .unwrap_or_default();
        if let Err(e) = validate_channels(&channels) {
            warn!(error = %e, "Refusing to persist invalid tracked channels");
            return;
        }
        let written = serde_json::to_string(&channels)
            .context("Failed to serialize tracked channels")
            .and_then(|blob| self.store.write(TRACKED_CHANNELS_BLOB, &blob));
        if let Err(e) = written {
            error!(error = ?e, "Failed to persist tracked channels");
        }
    }

    pub fn persist_auth_session(&self) {
        let session = AuthSession {
            token: self.cache.get_data(&QueryKey::Token),
            user: self.cache.get_data(&QueryKey::User),
        };
        let written = match session.token {
            None => self.store.remove(AUTH_SESSION_BLOB),
            Some(_) => serde_json::to_string(&session)
                .context("Failed to serialize auth session")
                .and_then(|blob| self.store.write(AUTH_SESSION_BLOB, &blob)),
        };
        if let Err(e) = written {
            error!(error = ?e, "Failed to persist auth session");
        }
    }

    /// Write blobs whenever their cache keys change, until `shutdown` flips to true.
    pub fn spawn_sync(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let persister = Arc::clone(self);
        let mut tracked_rx = self.cache.subscribe(QueryKey::TrackedChannels);
        let mut token_rx = self.cache.subscribe(QueryKey::Token);
        let mut user_rx = self.cache.subscribe(QueryKey::User);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = tracked_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !persister.is_restoring() {
                            persister.persist_tracked_channels();
                        }
                    }
                    changed = token_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !persister.is_restoring() {
                            persister.persist_auth_session();
                        }
                    }
                    changed = user_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !persister.is_restoring() {
                            persister.persist_auth_session();
                        }
                    }
                }
            }
        })
    }
}
