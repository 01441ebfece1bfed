//! First-run data loading.
//!
//! Bootstrap fills an empty store from bulk export files before normal
//! replication takes over: fetch the manifest(s), download each file into
//! the blob cache with bounded concurrency, then import and delete each
//! cached file. An interrupted run resumes from the blob cache instead of
//! re-downloading; an explicit reinitialization wipes local state first.

use std::sync::{Arc, Mutex};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::collections::{CHARACTERS, DEFINITIONS};
use crate::config::LanguageProfile;
use crate::http::{HttpError, HttpSession};
use crate::store::{DocumentStore, StoreError};

const EXPORTS_MANIFEST: &str = "/api/v1/enrich/exports.json";
const CHARACTER_EXPORTS_MANIFEST: &str = "/api/v1/enrich/hzexports.json";
const CHARACTER_FILE_PREFIX: &str = "hanzi";
const BOOTSTRAP_COMPLETE_KEY: &str = "bootstrap.complete";
const DOWNLOAD_PARALLELISM: usize = 2;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed export manifest: {0}")]
    Manifest(String),

    #[error("export import failed for {file}: {reason}")]
    Import { file: String, reason: String },
}

/// Localizable progress report: a phrase key plus numeric substitutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub key: MessageKey,
    pub args: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    FetchingManifest,
    DownloadingFiles,
    ImportingFiles,
    Ready,
    /// Terminal: local state may be inconsistent, the host must restart.
    RestartRequired,
}

pub type ProgressFn = Arc<dyn Fn(ProgressMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reinitializing,
    FetchingManifest,
    DownloadingFiles,
    ImportingFiles,
    Ready,
}

pub struct BootstrapLoader {
    store: Arc<Mutex<DocumentStore>>,
    http: Arc<HttpSession>,
    lang: LanguageProfile,
    progress: ProgressFn,
    phase: Mutex<Phase>,
}

impl BootstrapLoader {
    pub fn new(
        store: Arc<Mutex<DocumentStore>>,
        http: Arc<HttpSession>,
        lang: LanguageProfile,
        progress: ProgressFn,
    ) -> Self {
        Self {
            store,
            http,
            lang,
            progress,
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("phase lock") = phase;
    }

    fn report(&self, key: MessageKey, args: Vec<i64>) {
        (self.progress)(ProgressMessage { key, args });
    }

    /// Run bootstrap to completion if it has not already completed.
    ///
    /// With `reinitialize` set, all local data is cleared first and the full
    /// download runs again. Otherwise a finished prior run is a no-op and an
    /// interrupted one resumes from the blob cache. On error a terminal
    /// restart signal is reported before the error propagates.
    pub async fn ensure_ready(&self, reinitialize: bool) -> Result<(), BootstrapError> {
        if reinitialize {
            self.set_phase(Phase::Reinitializing);
            tracing::info!("reinitializing: clearing local data");
            let store = self.store.lock().expect("store lock");
            // drop the completion marker first: if this run dies
            // mid-download, the next ordinary startup must bootstrap
            // again instead of reporting ready over an empty store
            store.settings_delete(BOOTSTRAP_COMPLETE_KEY)?;
            store.clear_all_data()?;
        } else {
            let done = {
                let store = self.store.lock().expect("store lock");
                store.settings_get(BOOTSTRAP_COMPLETE_KEY)?.is_some()
            };
            if done {
                self.set_phase(Phase::Ready);
                return Ok(());
            }
        }

        match self.run().await {
            Ok(()) => {
                self.set_phase(Phase::Ready);
                self.report(MessageKey::Ready, vec![]);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "bootstrap failed");
                self.report(MessageKey::RestartRequired, vec![]);
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<(), BootstrapError> {
        self.set_phase(Phase::FetchingManifest);
        self.report(MessageKey::FetchingManifest, vec![]);
        let urls = self.fetch_manifests().await?;

        self.set_phase(Phase::DownloadingFiles);
        self.download_all(&urls).await?;

        self.set_phase(Phase::ImportingFiles);
        self.import_all()?;

        let store = self.store.lock().expect("store lock");
        store.settings_set(BOOTSTRAP_COMPLETE_KEY, "1")?;
        Ok(())
    }

    /// Fetch the export manifest, plus the character manifest for languages
    /// that carry character-level data, and union the file lists.
    async fn fetch_manifests(&self) -> Result<Vec<String>, BootstrapError> {
        let mut urls = parse_manifest(&self.http.fetch_json(EXPORTS_MANIFEST, None, 3).await?)?;
        if self.lang.has_characters {
            let extra = parse_manifest(
                &self
                    .http
                    .fetch_json(CHARACTER_EXPORTS_MANIFEST, None, 3)
                    .await?,
            )?;
            for url in extra {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }

    /// Download every manifest file not already staged, two at a time.
    async fn download_all(&self, urls: &[String]) -> Result<(), BootstrapError> {
        let total = urls.len() as i64;
        let mut done = 0i64;

        let mut pending = Vec::new();
        for url in urls {
            let key = file_key(url);
            let cached = {
                let store = self.store.lock().expect("store lock");
                store.blob_contains(&key)?
            };
            if cached {
                done += 1;
                tracing::debug!(key, "export already staged, skipping download");
            } else {
                pending.push((key, url.clone()));
            }
        }
        self.report(MessageKey::DownloadingFiles, vec![done, total]);

        let mut inflight = FuturesUnordered::new();
        let mut queue = pending.into_iter();
        for _ in 0..DOWNLOAD_PARALLELISM {
            if let Some((key, url)) = queue.next() {
                inflight.push(self.download_one(key, url));
            }
        }
        while let Some(result) = inflight.next().await {
            result?;
            done += 1;
            self.report(MessageKey::DownloadingFiles, vec![done, total]);
            if let Some((key, url)) = queue.next() {
                inflight.push(self.download_one(key, url));
            }
        }
        Ok(())
    }

    async fn download_one(&self, key: String, url: String) -> Result<(), BootstrapError> {
        let bytes = self.http.fetch_bytes(&url, 3).await?;
        let store = self.store.lock().expect("store lock");
        store.blob_put(&key, &bytes)?;
        tracing::debug!(key, size = bytes.len(), "staged export file");
        Ok(())
    }

    /// Import every staged file into its collection and delete it from the
    /// cache, verifying the deletion took.
    fn import_all(&self) -> Result<(), BootstrapError> {
        let keys = {
            let store = self.store.lock().expect("store lock");
            store.blob_keys()?
        };
        let total = keys.len() as i64;
        for (i, key) in keys.iter().enumerate() {
            self.import_one(key)?;
            self.report(MessageKey::ImportingFiles, vec![i as i64 + 1, total]);
        }
        Ok(())
    }

    fn import_one(&self, key: &str) -> Result<(), BootstrapError> {
        let store = self.store.lock().expect("store lock");
        let bytes = store
            .blob_get(key)?
            .ok_or_else(|| BootstrapError::Import {
                file: key.to_string(),
                reason: "staged file vanished".to_string(),
            })?;
        let docs: Vec<Value> =
            serde_json::from_slice(&bytes).map_err(|e| BootstrapError::Import {
                file: key.to_string(),
                reason: e.to_string(),
            })?;

        let collection = target_collection(key);
        // server-assigned timestamps are preserved so replication resumes
        // from where the export left off
        store.apply_remote_batch(collection, &docs)?;
        tracing::info!(key, collection, count = docs.len(), "imported export file");

        store.blob_delete(key)?;
        if store.blob_contains(key)? {
            return Err(StoreError::DataIntegrity(format!(
                "blob {key} still present after delete"
            ))
            .into());
        }
        Ok(())
    }
}

/// Blob-cache key for a manifest URL: its last path segment.
fn file_key(url: &str) -> String {
    url.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// Character exports are named with a reserved prefix; everything else is
/// dictionary data.
fn target_collection(key: &str) -> &'static str {
    if key.starts_with(CHARACTER_FILE_PREFIX) {
        CHARACTERS
    } else {
        DEFINITIONS
    }
}

fn parse_manifest(manifest: &Value) -> Result<Vec<String>, BootstrapError> {
    manifest
        .as_array()
        .ok_or_else(|| BootstrapError::Manifest("expected a JSON array of urls".to_string()))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| BootstrapError::Manifest(format!("non-string entry: {v}")))
        })
        .collect()
}
