//! Storage backend.
//!
//! The original `DBATS`-backed storage backend (`timeseries_backend_dbats.h`)
//! is external and opaque — no DBATS binding exists here. This backend is a
//! minimal, self-contained stand-in: a flat append-only binary log
//! (`key_len:u16 | key | time:u32 | value:u64` per record) written under a
//! configured directory, one file per channel. It exists so the framework
//! has a fourth concrete backend to dispatch through and test against, not
//! as a faithful reimplementation of DBATS.

use super::{Backend, BackendId, FlushEntry};
use crate::error::BackendError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub struct StorageBackend {
    dir: Option<PathBuf>,
    channel: String,
    file: Option<BufWriter<File>>,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend {
    pub fn new() -> Self {
        StorageBackend {
            dir: None,
            channel: "default".to_string(),
            file: None,
        }
    }

    fn write_record(&mut self, key: &str, value: u64, time: u32) -> Result<(), BackendError> {
        let key_bytes = key.as_bytes();
        if key_bytes.len() > u16::MAX as usize {
            return Err(BackendError::Resource("key too long for storage record".into()));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BackendError::Config("storage backend not initialized".into()))?;
        file.write_all(&(key_bytes.len() as u16).to_be_bytes())
            .and_then(|_| file.write_all(key_bytes))
            .and_then(|_| file.write_all(&time.to_be_bytes()))
            .and_then(|_| file.write_all(&value.to_be_bytes()))
            .map_err(|e| BackendError::Resource(e.to_string()))
    }
}

impl Backend for StorageBackend {
    fn id(&self) -> BackendId {
        BackendId::Storage
    }

    fn name(&self) -> &'static str {
        "storage"
    }

    fn init(&mut self, argv: &[String]) -> Result<(), BackendError> {
        let mut i = 0;
        while i < argv.len() {
            match argv[i].as_str() {
                "-d" => {
                    i += 1;
                    self.dir = Some(PathBuf::from(
                        argv.get(i)
                            .ok_or_else(|| BackendError::Config("-d requires a directory".into()))?,
                    ));
                }
                "-c" => {
                    i += 1;
                    self.channel = argv
                        .get(i)
                        .ok_or_else(|| BackendError::Config("-c requires a channel".into()))?
                        .clone();
                }
                other => return Err(BackendError::Config(format!("unknown option {other:?}"))),
            }
            i += 1;
        }

        let dir = self
            .dir
            .clone()
            .ok_or_else(|| BackendError::Config("-d is required".into()))?;
        std::fs::create_dir_all(&dir).map_err(|e| BackendError::Resource(e.to_string()))?;
        let path = dir.join(format!("{}.tsk", self.channel));
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BackendError::Resource(e.to_string()))?;
        self.file = Some(BufWriter::new(f));
        Ok(())
    }

    fn free(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
        }
        self.file = None;
    }

    fn kp_flush(&mut self, entries: &[FlushEntry<'_>], time: u32) -> Result<(), BackendError> {
        for e in entries {
            self.write_record(e.key, e.value, time)?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| BackendError::Config("storage backend not initialized".into()))?
            .flush()
            .map_err(|e| BackendError::Resource(e.to_string()))
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<(), BackendError> {
        self.write_record(key, value, time)?;
        self.file
            .as_mut()
            .ok_or_else(|| BackendError::Config("storage backend not initialized".into()))?
            .flush()
            .map_err(|e| BackendError::Resource(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_append_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = StorageBackend::new();
        b.init(&["-d".into(), dir.path().to_string_lossy().into_owned(), "-c".into(), "ch".into()])
            .unwrap();
        b.set_single("a.b", 7, 100).unwrap();
        b.free();

        let path = dir.path().join("ch.tsk");
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 2 + 3 + 4 + 8);
        assert_eq!(u16::from_be_bytes([raw[0], raw[1]]), 3);
        assert_eq!(&raw[2..5], b"a.b");
    }

    #[test]
    fn requires_directory_option() {
        let mut b = StorageBackend::new();
        assert!(b.init(&[]).is_err());
    }
}
