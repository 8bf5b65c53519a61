use async_std::fs;
use async_std::path::{Path, PathBuf};
use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use thiserror::Error;
use tracing::{info, warn};

use crate::message::{DurableState, Entry};

const BLOB_FILE: &str = "durable_state.pb.bin";
const BLOB_TMP_FILE: &str = "durable_state.pb.bin.tmp";

/// Error raised by a persistence backend. Failures to save are fatal to the
/// replica (see the consensus module); failures to decode a loaded blob are
/// treated as the absence of prior state.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

/// The stable-storage seam. The replica packages its durable fields into a
/// single opaque blob and expects `save` to return only once the write is
/// durable. `load` returns the most recent saved blob, if any.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save(&self, blob: Bytes) -> Result<(), PersistenceError>;
    async fn load(&self) -> Result<Option<Bytes>, PersistenceError>;
}

// Packages the durable triple into its blob form.
pub fn encode_durable_state(term: u64, voted_for: Option<usize>, entries: &[Entry]) -> Bytes {
    let state = DurableState {
        term,
        voted_for: voted_for.map(|v| v as u64),
        entries: entries.to_vec(),
    };
    state.encode_to_vec().into()
}

// Unpacks a previously saved blob. A blob that fails to decode is treated
// as "no prior state" rather than an error.
pub fn decode_durable_state(blob: &Bytes) -> Option<(u64, Option<usize>, Vec<Entry>)> {
    match DurableState::decode(blob.as_ref()) {
        Ok(state) => Some((
            state.term,
            state.voted_for.map(|v| v as usize),
            state.entries,
        )),
        Err(error) => {
            warn!("discarding undecodable durable state: {}", error);
            None
        }
    }
}

// Keeps the blob in memory. Useful for tests, which hold on to the instance
// across a simulated crash to model stable storage surviving a restart.
pub struct MemoryPersister {
    blob: Mutex<Option<Bytes>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self {
            blob: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn save(&self, blob: Bytes) -> Result<(), PersistenceError> {
        *self.blob.lock().await = Some(blob);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Bytes>, PersistenceError> {
        Ok(self.blob.lock().await.clone())
    }
}

// Stores the blob as a file in a directory owned by this instance. Saves
// write to a scratch file first and then rename, so an interrupted save
// leaves the previous blob intact.
pub struct FilePersister {
    directory: String,
}

impl FilePersister {
    pub async fn open(directory: &str) -> Result<Self, PersistenceError> {
        fs::create_dir_all(directory).await.map_err(|e| {
            PersistenceError::new(format!("Failed to create directory {}: {}", directory, e))
        })?;
        info!("Created file persistence backed by directory {}", directory);
        Ok(Self {
            directory: directory.to_string(),
        })
    }

    fn blob_path(&self, filename: &str) -> PathBuf {
        Path::new(self.directory.as_str()).join(filename)
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn save(&self, blob: Bytes) -> Result<(), PersistenceError> {
        let scratch = self.blob_path(BLOB_TMP_FILE);
        let path = self.blob_path(BLOB_FILE);

        fs::write(&scratch, blob.as_ref())
            .await
            .map_err(|e| PersistenceError::new(format!("Failed to write blob: {}", e)))?;
        fs::rename(&scratch, &path)
            .await
            .map_err(|e| PersistenceError::new(format!("Failed to publish blob: {}", e)))
    }

    async fn load(&self) -> Result<Option<Bytes>, PersistenceError> {
        let path = self.blob_path(BLOB_FILE);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::new(format!(
                "Failed to read blob: {}",
                e
            ))),
        }
    }
}
