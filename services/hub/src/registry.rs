//! Registry blob sources.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

/// Size of each chunk streamed by `RegistryService/Pull`.
pub const CHUNK_SIZE: usize = 1024;

/// Supplies the registry blob served by `Pull`.
#[async_trait]
pub trait BlobSource: Send + Sync + 'static {
    async fn blob(&self) -> io::Result<Bytes>;
}

/// A blob held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticBlob(Bytes);

impl StaticBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Read a file once, up front.
    pub fn preload(path: &Path) -> io::Result<Self> {
        std::fs::read(path).map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
impl BlobSource for StaticBlob {
    async fn blob(&self) -> io::Result<Bytes> {
        Ok(self.0.clone())
    }
}

/// Split `data` into `CHUNK_SIZE` pieces without copying. An empty blob
/// yields no chunks.
pub fn chunks(data: Bytes) -> impl Iterator<Item = Bytes> {
    // Intentionally no empty trailing chunk, also when the length is a
    // multiple of CHUNK_SIZE.
    let total = data.len();
    (0..total)
        .step_by(CHUNK_SIZE)
        .map(move |start| data.slice(start..(start + CHUNK_SIZE).min(total)))
}
