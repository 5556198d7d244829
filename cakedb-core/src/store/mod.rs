//! Flat-file blob store
//!
//! Each blob is one file whose name is its key. A caller-supplied transform
//! turns the key into the directories the file is nested under, so large key
//! populations stay spread over many small directories. Writes go through a
//! temp file and a rename, so a blob is either fully present or absent.

mod keys;

pub use keys::DeviceKeyStore;

use crate::{CakeError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps a key to the directory components it is stored under
pub type Transform = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Segment keys `{duration}_{shard}_{created}` live under `{duration}/{shard}/`
pub fn segment_transform() -> Transform {
    Arc::new(|key: &str| key.split('_').take(2).map(str::to_string).collect())
}

/// Short keys are grouped by their first two characters
pub fn prefix_transform() -> Transform {
    Arc::new(|key: &str| match (key.get(..2), key.get(..1)) {
        (Some(head), _) if key.len() > 2 => vec![head.to_string()],
        (_, Some(first)) => vec![format!("0{}", first)],
        _ => Vec::new(),
    })
}

/// Content-keyed file storage rooted at a base directory
pub struct BlobStore {
    base: PathBuf,
    tmp_dir: PathBuf,
    transform: Transform,
}

impl BlobStore {
    /// Open (creating if needed) a store at `base`, staging writes in `tmp_dir`
    ///
    /// `tmp_dir` must be on the same filesystem as `base` for imports to be
    /// atomic renames.
    pub fn open(base: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>, transform: Transform) -> Result<Self> {
        let base = base.into();
        let tmp_dir = tmp_dir.into();
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            base,
            tmp_dir,
            transform,
        })
    }

    /// Base directory of the store
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory for staging files before import
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Physical path of a key
    pub fn path(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        for part in (self.transform)(key) {
            path.push(part);
        }
        path.push(key);
        path
    }

    /// Check whether a key is stored
    pub fn has(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    /// On-disk size of a stored key
    pub fn size(&self, key: &str) -> Result<u64> {
        let meta = fs::metadata(self.path(key)).map_err(|e| self.not_found(key, e))?;
        Ok(meta.len())
    }

    /// Read a whole blob into memory
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path(key)).map_err(|e| self.not_found(key, e))
    }

    /// Open a blob for streaming reads
    pub fn read_stream(&self, key: &str) -> Result<BufReader<File>> {
        let file = File::open(self.path(key)).map_err(|e| self.not_found(key, e))?;
        Ok(BufReader::new(file))
    }

    /// Store `data` under `key`, replacing any previous value atomically
    pub fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".write-")
            .tempfile_in(&self.tmp_dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        let path = tmp.into_temp_path();
        self.import(&path, key, true)
    }

    /// Make a local file visible under `key`
    ///
    /// With `move_file` the source is renamed into place; otherwise it is
    /// copied next to the destination first and then renamed, so readers
    /// never observe a partially written blob.
    pub fn import(&self, src: &Path, key: &str, move_file: bool) -> Result<()> {
        let dst = self.path(key);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }

        if move_file {
            match fs::rename(src, &dst) {
                Ok(()) => {
                    debug!(key, "imported blob by rename");
                    return Ok(());
                }
                Err(e) => {
                    debug!(key, error = %e, "rename failed, falling back to copy");
                }
            }
        }

        let parent = dst.parent().unwrap_or(self.base.as_path());
        let staged = tempfile::Builder::new()
            .prefix(".import-")
            .tempfile_in(parent)?;
        fs::copy(src, staged.path())?;
        staged.as_file().sync_all()?;
        staged.persist(&dst).map_err(|e| e.error)?;

        if move_file {
            fs::remove_file(src)?;
        }
        Ok(())
    }

    /// Remove a key, pruning shard directories left empty
    pub fn erase(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        fs::remove_file(&path).map_err(|e| self.not_found(key, e))?;

        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.base || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Lazily enumerate stored keys starting with `prefix`
    pub fn keys(&self, prefix: &str) -> Keys {
        let stack = match fs::read_dir(&self.base) {
            Ok(dir) => vec![dir],
            Err(e) => {
                warn!(base = ?self.base, error = %e, "failed to list blob store");
                Vec::new()
            }
        };
        Keys {
            stack,
            prefix: prefix.to_string(),
        }
    }

    fn not_found(&self, key: &str, err: io::Error) -> CakeError {
        if err.kind() == io::ErrorKind::NotFound {
            CakeError::BlobNotFound(key.to_string())
        } else {
            CakeError::Io(err)
        }
    }
}

/// Depth-first walk over the store's directory tree
pub struct Keys {
    stack: Vec<fs::ReadDir>,
    prefix: String,
}

impl Iterator for Keys {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let dir = self.stack.last_mut()?;
            let entry = match dir.next() {
                None => {
                    self.stack.pop();
                    continue;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
                Some(Ok(entry)) => entry,
            };

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                match fs::read_dir(entry.path()) {
                    Ok(sub) => self.stack.push(sub),
                    Err(e) => warn!(path = ?entry.path(), error = %e, "failed to descend"),
                }
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            // staged temp files
            if name.starts_with('.') {
                continue;
            }
            if name.starts_with(&self.prefix) {
                return Some(name);
            }
        }
    }
}
