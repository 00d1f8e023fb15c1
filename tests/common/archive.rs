//! In-memory archive with fault injection.
//!
//! Mirrors the local-directory archive's contract while keeping every file
//! in a shared map, so two nodes in one test can publish and catch up
//! against the same archive. Faults reproduce the interesting failure
//! surfaces: absent files, truncated gzip streams, and content whose hash
//! no longer matches its name.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};

use chronicle::archive::{Archive, ArchiveError};
use chronicle::hash::Hash256;
use chronicle::history::{decode_header_file, encode_header_file, gunzip_bytes, gzip_bytes};

/// Condition of one synthetic archive file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    ContentsOk,
    FileNotUploaded,
    CorruptedZippedFile,
    HashMismatch,
}

#[derive(Default)]
struct Inner {
    files: FxHashMap<String, Vec<u8>>,
    dirs: FxHashSet<String>,
    faults: FxHashMap<String, FileState>,
    put_log: Vec<String>,
    fail_puts: bool,
}

/// Shared in-memory archive; clones view the same contents.
#[derive(Clone)]
pub struct MemoryArchive {
    name: String,
    writable: bool,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writable: true,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// A read-only handle onto the same contents.
    pub fn read_only_view(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writable: false,
            inner: self.inner.clone(),
        }
    }

    pub fn set_fault(&self, remote: &str, state: FileState) {
        self.inner
            .lock()
            .unwrap()
            .faults
            .insert(remote.to_string(), state);
    }

    /// Make every subsequent put fail hard (non-transient).
    pub fn fail_puts(&self, fail: bool) {
        self.inner.lock().unwrap().fail_puts = fail;
    }

    pub fn has_file(&self, remote: &str) -> bool {
        self.inner.lock().unwrap().files.contains_key(remote)
    }

    pub fn file_bytes(&self, remote: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(remote).cloned()
    }

    pub fn replace_file(&self, remote: &str, bytes: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(remote.to_string(), bytes);
    }

    /// Every put so far, in order.
    pub fn put_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().put_log.clone()
    }

    /// The gunzipped content hash of a hosted bucket file.
    pub fn hosted_bucket_hash(&self, remote: &str) -> Option<Hash256> {
        let bytes = self.file_bytes(remote)?;
        Some(Hash256::of(&gunzip_bytes(&bytes).ok()?))
    }
}

/// Rewrite one entry of a hosted header file so its hash no longer matches
/// its contents; chain verification over that checkpoint must fail.
pub fn tamper_header_file(archive: &MemoryArchive, remote: &str) {
    let bytes = archive.file_bytes(remote).expect("file hosted");
    let mut headers = decode_header_file(&bytes).expect("file decodes");
    let middle = headers.len() / 2;
    headers[middle].hash = Hash256::of(b"tampered");
    archive.replace_file(remote, encode_header_file(&headers).expect("re-encodes"));
}

#[async_trait]
impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ArchiveError> {
        let bytes = {
            let inner = self.inner.lock().unwrap();
            match inner.faults.get(remote).copied() {
                Some(FileState::FileNotUploaded) => {
                    return Err(ArchiveError::NotFound {
                        path: remote.to_string(),
                    });
                }
                fault => {
                    let Some(bytes) = inner.files.get(remote) else {
                        return Err(ArchiveError::NotFound {
                            path: remote.to_string(),
                        });
                    };
                    match fault {
                        Some(FileState::CorruptedZippedFile) => {
                            bytes[..bytes.len() / 2].to_vec()
                        }
                        Some(FileState::HashMismatch) => {
                            let mut payload =
                                gunzip_bytes(bytes).map_err(|e| ArchiveError::Io {
                                    message: e.to_string(),
                                })?;
                            if let Some(byte) = payload.first_mut() {
                                *byte ^= 0xff;
                            }
                            gzip_bytes(&payload).map_err(|e| ArchiveError::Io {
                                message: e.to_string(),
                            })?
                        }
                        _ => bytes.clone(),
                    }
                }
            }
        };
        tokio::fs::write(local, bytes)
            .await
            .map_err(|e| ArchiveError::Io {
                message: e.to_string(),
            })
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ArchiveError> {
        if !self.writable {
            return Err(ArchiveError::ReadOnly {
                name: self.name.clone(),
            });
        }
        let bytes = tokio::fs::read(local).await.map_err(|e| ArchiveError::Io {
            message: e.to_string(),
        })?;
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_puts {
            return Err(ArchiveError::Unavailable {
                name: self.name.clone(),
                message: "injected put failure".to_string(),
            });
        }
        let parent = chronicle::archive::remote_dir(remote);
        if !parent.is_empty() && !inner.dirs.contains(parent) {
            return Err(ArchiveError::Unavailable {
                name: self.name.clone(),
                message: format!("missing remote directory {parent}"),
            });
        }
        inner.files.insert(remote.to_string(), bytes);
        inner.put_log.push(remote.to_string());
        Ok(())
    }

    async fn mkdir(&self, remote: &str) -> Result<(), ArchiveError> {
        if !self.writable {
            return Err(ArchiveError::ReadOnly {
                name: self.name.clone(),
            });
        }
        self.inner
            .lock()
            .unwrap()
            .dirs
            .insert(remote.to_string());
        Ok(())
    }
}
