//! Durable artifact storage for processed offers.

use std::path::{Path, PathBuf};

use anyhow::Context;
use offerflow_core::{
    env_positive_or, env_required, process_env, ConfigError, EnvLookup, StagingReceiver,
};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerflow-storage";

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub output_dir: PathBuf,
    pub staging_capacity: usize,
}

impl PersistenceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let output_dir = env_required(lookup, "OFFER_PERSISTENCE_PATH")?;
        Ok(Self {
            output_dir: PathBuf::from(output_dir),
            staging_capacity: env_positive_or(lookup, "STAGING_QUEUE_CAPACITY", 10)? as usize,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn offer_file_name(id: Uuid) -> String {
        format!("offer_{id}.json")
    }

    /// Write one processed offer as `offer_<uuid>.json`.
    pub async fn store_offer(&self, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        self.store_named(&Self::offer_file_name(Uuid::new_v4()), bytes)
            .await
    }

    /// Write `bytes` under `file_name` via a temp file and an atomic rename.
    /// Readers never observe a partially written artifact.
    pub async fn store_named(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        let absolute_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing temp artifact file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            file_name: file_name.to_string(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

/// Final consumer of `ProcessedOffers`: one file per message.
///
/// Write failures are logged and the message is dropped; the broker has
/// already been acknowledged at this point.
#[derive(Debug, Clone)]
pub struct PersistenceSink {
    store: ArtifactStore,
}

impl PersistenceSink {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub async fn handle(&self, payload: &[u8]) -> Option<StoredArtifact> {
        match self.store.store_offer(payload).await {
            Ok(artifact) => {
                info!(
                    file = %artifact.file_name,
                    bytes = artifact.byte_size,
                    sha256 = %artifact.content_hash,
                    "processed offer persisted"
                );
                Some(artifact)
            }
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    bytes = payload.len(),
                    "persisting processed offer failed; message dropped"
                );
                None
            }
        }
    }

    pub async fn run(
        &self,
        mut inbox: StagingReceiver<Vec<u8>>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(dir = %self.store.root().display(), "persistence sink started");
        while let Some(payload) = inbox.take_or_cancel(&token).await {
            self.handle(&payload).await;
        }
        info!("persistence sink stopped");
        Ok(())
    }
}
