//! Persistent storage collaborator
//!
//! The core only needs three things from storage: fixed-size ECU records by
//! id, firmware images read in chunks, and optional firmware header records.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::ecu::EcuId;
use crate::error::GatewayError;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Firmware image not found: {0}")]
    ImageNotFound(String),

    #[error("Invalid image name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

/// Storage interface consumed by the registry and firmware sessions
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the persisted record for an ECU, `None` if never written
    async fn read_record(&self, ecu: EcuId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist the record for an ECU
    async fn write_record(&self, ecu: EcuId, record: &[u8]) -> Result<(), StorageError>;

    /// Read firmware bytes starting at `offset` into `buf`
    ///
    /// Returns the number of bytes read; 0 means end of image.
    async fn read_firmware_chunk(
        &self,
        image: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError>;

    /// Read the header record stored alongside an image, if any
    async fn read_firmware_header(&self, image: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

/// In-memory storage for tests and demo setups
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<EcuId, Vec<u8>>>,
    images: RwLock<HashMap<String, Bytes>>,
    headers: RwLock<HashMap<String, Vec<u8>>>,
    unavailable: RwLock<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, name: &str, data: impl Into<Bytes>) {
        self.images.write().insert(name.to_string(), data.into());
    }

    pub fn add_header(&self, name: &str, header: Vec<u8>) {
        self.headers.write().insert(name.to_string(), header);
    }

    /// Raw access to a stored record (for inspection in tests)
    pub fn record(&self, ecu: EcuId) -> Option<Vec<u8>> {
        self.records.read().get(&ecu).cloned()
    }

    /// Overwrite a stored record without validation
    pub fn put_record(&self, ecu: EcuId, bytes: Vec<u8>) {
        self.records.write().insert(ecu, bytes);
    }

    /// Simulate a storage outage; every call fails until cleared
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write() = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), StorageError> {
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(StorageError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_record(&self, ecu: EcuId) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.records.read().get(&ecu).cloned())
    }

    async fn write_record(&self, ecu: EcuId, record: &[u8]) -> Result<(), StorageError> {
        self.check()?;
        self.records.write().insert(ecu, record.to_vec());
        Ok(())
    }

    async fn read_firmware_chunk(
        &self,
        image: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        self.check()?;
        let images = self.images.read();
        let data = images
            .get(image)
            .ok_or_else(|| StorageError::ImageNotFound(image.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn read_firmware_header(&self, image: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.headers.read().get(image).cloned())
    }
}

/// Directory-backed storage
///
/// ```text
/// <root>/records/ecu-007.rec     one fixed-size record per ECU
/// <root>/firmware/<name>.bin     flat firmware image
/// <root>/firmware/<name>.hdr     optional header record
/// ```
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, ecu: EcuId) -> PathBuf {
        self.root.join("records").join(format!("ecu-{:03}.rec", ecu.0))
    }

    fn image_path(&self, image: &str, ext: &str) -> Result<PathBuf, StorageError> {
        if image.is_empty() || image.contains(['/', '\\']) || image.starts_with('.') {
            return Err(StorageError::InvalidName(image.to_string()));
        }
        Ok(self.root.join("firmware").join(format!("{}.{}", image, ext)))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_record(&self, ecu: EcuId) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.record_path(ecu)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, ecu: EcuId, record: &[u8]) -> Result<(), StorageError> {
        let path = self.record_path(ecu);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, record).await?;
        Ok(())
    }

    async fn read_firmware_chunk(
        &self,
        image: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let path = self.image_path(image, "bin")?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ImageNotFound(image.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;

        // A single read may return short; fill the buffer until EOF
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn read_firmware_header(&self, image: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.image_path(image, "hdr")?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_chunks_until_exhausted() {
        let storage = MemoryStorage::new();
        storage.add_image("fw", vec![7u8; 100]);

        let mut buf = [0u8; 48];
        assert_eq!(storage.read_firmware_chunk("fw", 0, &mut buf).await.unwrap(), 48);
        assert_eq!(storage.read_firmware_chunk("fw", 96, &mut buf).await.unwrap(), 4);
        assert_eq!(storage.read_firmware_chunk("fw", 100, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_unavailable() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(Some("card removed"));
        assert!(matches!(
            storage.read_record(EcuId(0)).await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_file_storage_records_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        assert!(storage.read_record(EcuId(1)).await.unwrap().is_none());
        storage.write_record(EcuId(1), &[1, 2, 3]).await.unwrap();
        assert_eq!(storage.read_record(EcuId(1)).await.unwrap(), Some(vec![1, 2, 3]));

        std::fs::create_dir_all(dir.path().join("firmware")).unwrap();
        std::fs::write(dir.path().join("firmware/app.bin"), vec![5u8; 50]).unwrap();
        let mut buf = [0u8; 48];
        assert_eq!(storage.read_firmware_chunk("app", 48, &mut buf).await.unwrap(), 2);
        assert!(storage.read_firmware_header("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let mut buf = [0u8; 4];
        assert!(matches!(
            storage.read_firmware_chunk("../etc", 0, &mut buf).await,
            Err(StorageError::InvalidName(_))
        ));
        for name in ["", ".hidden", "dir\\app"] {
            assert!(matches!(
                storage.read_firmware_chunk(name, 0, &mut buf).await,
                Err(StorageError::InvalidName(_))
            ));
        }
        assert!(matches!(
            storage.read_firmware_chunk("missing", 0, &mut buf).await,
            Err(StorageError::ImageNotFound(_))
        ));
    }
}
