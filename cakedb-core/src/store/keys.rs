//! Device key store
//!
//! A device key is the ordered list of register ids a device reports. It is
//! written once, on first sight of the device, and its length fixes the value
//! width used to decode every block of that device in every segment.

use super::{prefix_transform, BlobStore};
use crate::{CakeError, DeviceId, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

/// Device id → register key mapping, persisted as big-endian i64 arrays
pub struct DeviceKeyStore {
    store: BlobStore,
    widths: RwLock<HashMap<DeviceId, usize>>,
}

impl DeviceKeyStore {
    /// Open the key store under `dir`
    pub fn open(dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: BlobStore::open(dir, tmp_dir, prefix_transform())?,
            widths: RwLock::new(HashMap::new()),
        })
    }

    /// Check whether a key was registered for the device
    pub fn has(&self, device: DeviceId) -> bool {
        self.widths.read().contains_key(&device) || self.store.has(&device.to_string())
    }

    /// Register a device key; the first write wins
    ///
    /// Returns `false` when a key already existed and was left untouched.
    pub fn write(&self, device: DeviceId, key: &[i64]) -> Result<bool> {
        if self.has(device) {
            return Ok(false);
        }

        let mut buf = BytesMut::with_capacity(key.len() * 8);
        for register in key {
            buf.put_i64(*register);
        }
        self.store.write(&device.to_string(), &buf)?;
        self.widths.write().insert(device, key.len());
        Ok(true)
    }

    /// Read a device's register key
    pub fn read(&self, device: DeviceId) -> Result<Vec<i64>> {
        let data = self.store.read(&device.to_string()).map_err(|e| match e {
            CakeError::BlobNotFound(_) => CakeError::KeyNotFound(device),
            other => other,
        })?;
        if data.len() % 8 != 0 {
            return Err(CakeError::CorruptKey {
                device,
                len: data.len(),
            });
        }

        let mut cursor = &data[..];
        let mut key = Vec::with_capacity(data.len() / 8);
        while cursor.has_remaining() {
            key.push(cursor.get_i64());
        }
        self.widths.write().insert(device, key.len());
        Ok(key)
    }

    /// Number of values each record of the device carries
    pub fn width(&self, device: DeviceId) -> Result<usize> {
        if let Some(width) = self.widths.read().get(&device) {
            return Ok(*width);
        }
        self.read(device).map(|key| key.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let keys = DeviceKeyStore::open(temp_dir.path().join("key"), temp_dir.path().join("tmp")).unwrap();

        assert!(!keys.has(1234));
        assert!(keys.write(1234, &[1, 2, 3, 4, 5]).unwrap());
        assert!(!keys.write(1234, &[9]).unwrap());

        assert!(keys.has(1234));
        assert_eq!(keys.read(1234).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(keys.width(1234).unwrap(), 5);
        assert!(temp_dir.path().join("key/12/1234").is_file());
    }

    #[test]
    fn test_reopen_reads_persisted_key() {
        let temp_dir = TempDir::new().unwrap();
        let key_dir = temp_dir.path().join("key");
        let tmp_dir = temp_dir.path().join("tmp");
        {
            let keys = DeviceKeyStore::open(&key_dir, &tmp_dir).unwrap();
            keys.write(7, &[-1, 40001]).unwrap();
        }

        let keys = DeviceKeyStore::open(&key_dir, &tmp_dir).unwrap();
        assert!(keys.has(7));
        assert_eq!(keys.width(7).unwrap(), 2);
        assert_eq!(keys.read(7).unwrap(), vec![-1, 40001]);
        assert_eq!(std::fs::read(key_dir.join("07/7")).unwrap().len(), 16);
    }

    #[test]
    fn test_missing_and_corrupt_keys() {
        let temp_dir = TempDir::new().unwrap();
        let key_dir = temp_dir.path().join("key");
        let keys = DeviceKeyStore::open(&key_dir, temp_dir.path().join("tmp")).unwrap();

        let err = keys.width(42).unwrap_err();
        assert!(matches!(err, CakeError::KeyNotFound(42)));
        assert!(err.is_not_found());

        std::fs::create_dir_all(key_dir.join("04")).unwrap();
        std::fs::write(key_dir.join("04/42"), [0u8; 5]).unwrap();
        let err = keys.read(42).unwrap_err();
        assert!(matches!(err, CakeError::CorruptKey { device: 42, len: 5 }));
    }
}
