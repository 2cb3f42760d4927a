//! Bounded offload pool for compression and encryption.
//!
//! Transforms are CPU-bound, so they run on tokio's blocking threads. A
//! semaphore caps how many run at once; callers that cannot get a permit wait,
//! which pushes back on whoever is producing the work.

use std::sync::Arc;

use protocol::{CipherKey, CryptoCodec, TransformError, TransformTask};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared handle to the transform workers.
#[derive(Clone)]
pub struct TransformPool {
    codec: Arc<dyn CryptoCodec>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl TransformPool {
    /// Creates a pool allowing `workers` concurrent transforms.
    pub fn new(codec: Arc<dyn CryptoCodec>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            codec,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Maximum number of concurrent transforms.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of idle worker slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a worker slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransformError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransformError::PoolClosed)
    }

    /// Runs a single task.
    pub async fn run(&self, task: TransformTask) -> Result<Vec<u8>, TransformError> {
        let permit = self.acquire().await?;
        self.execute(permit, move |codec| codec.transform(task)).await
    }

    /// Compress then encrypt.
    pub async fn seal(&self, plaintext: Vec<u8>, key: CipherKey) -> Result<Vec<u8>, TransformError> {
        let permit = self.acquire().await?;
        self.execute(permit, move |codec| codec.seal(plaintext, key))
            .await
    }

    /// Decrypt then decompress.
    pub async fn open(&self, ciphertext: Vec<u8>, key: CipherKey) -> Result<Vec<u8>, TransformError> {
        let permit = self.acquire().await?;
        self.open_permitted(permit, ciphertext, key).await
    }

    /// Decrypt then decompress using a slot the caller already holds.
    pub async fn open_permitted(
        &self,
        permit: OwnedSemaphorePermit,
        ciphertext: Vec<u8>,
        key: CipherKey,
    ) -> Result<Vec<u8>, TransformError> {
        self.execute(permit, move |codec| codec.open(ciphertext, key))
            .await
    }

    /// Rejects all future work. Running transforms finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn execute<F>(&self, permit: OwnedSemaphorePermit, job: F) -> Result<Vec<u8>, TransformError>
    where
        F: FnOnce(&dyn CryptoCodec) -> Result<Vec<u8>, TransformError> + Send + 'static,
    {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(codec.as_ref())
        })
        .await
        .map_err(|e| TransformError::WorkerFailed(e.to_string()))?
    }
}

impl std::fmt::Debug for TransformPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPool")
            .field("workers", &self.workers)
            .field("available", &self.available())
            .finish()
    }
}
