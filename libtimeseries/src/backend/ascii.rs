//! Text backend: writes `<key> <value> <time>\n` lines to a file or stdout,
//! with optional gzip compression.
//!
//! Grounded on `timeseries_backend_ascii.c`'s `-f`/`-c` option handling and
//! on `wandio`'s suffix-based compression auto-detection, which this crate
//! replaces with `flate2` (the pack carries no `wandio` binding; gzip via
//! `flate2` is the closest real crate for the same concern).

use super::{Backend, BackendId, FlushEntry};
use crate::error::BackendError;
use crate::wire::encode_text;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

enum Sink {
    Stdout(io::Stdout),
    Plain(BufWriter<File>),
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

pub struct AsciiBackend {
    sink: Option<Sink>,
    path: Option<PathBuf>,
    scratch: Vec<u8>,
}

impl Default for AsciiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AsciiBackend {
    pub fn new() -> Self {
        AsciiBackend {
            sink: None,
            path: None,
            scratch: vec![0u8; 4096],
        }
    }

    fn write_line(&mut self, key: &str, value: u64, time: u32) -> Result<(), BackendError> {
        loop {
            match encode_text(&mut self.scratch, key, value, time) {
                Ok(n) => {
                    let sink = self
                        .sink
                        .as_mut()
                        .ok_or_else(|| BackendError::Config("ascii backend not initialized".into()))?;
                    sink.write_all(&self.scratch[..n])
                        .map_err(|e| BackendError::Resource(e.to_string()))?;
                    return Ok(());
                }
                Err(_) => {
                    let new_len = self.scratch.len() * 2;
                    self.scratch.resize(new_len, 0);
                }
            }
        }
    }
}

impl Backend for AsciiBackend {
    fn id(&self) -> BackendId {
        BackendId::Ascii
    }

    fn name(&self) -> &'static str {
        "ascii"
    }

    fn init(&mut self, argv: &[String]) -> Result<(), BackendError> {
        let mut file: Option<PathBuf> = None;
        let mut compress = false;

        let mut i = 0;
        while i < argv.len() {
            match argv[i].as_str() {
                "-f" => {
                    i += 1;
                    let v = argv
                        .get(i)
                        .ok_or_else(|| BackendError::Config("-f requires a path".into()))?;
                    file = Some(PathBuf::from(v));
                }
                "-c" => {
                    i += 1;
                    let v = argv
                        .get(i)
                        .ok_or_else(|| BackendError::Config("-c requires a level".into()))?;
                    compress = v.parse::<u32>().map(|lvl| lvl > 0).unwrap_or(false);
                }
                other => return Err(BackendError::Config(format!("unknown option {other:?}"))),
            }
            i += 1;
        }

        // gzip auto-detected from the filename suffix, falling back to the
        // explicit -c flag when writing to stdout (no suffix to sniff).
        let suffix_gzip = file
            .as_ref()
            .and_then(|p| p.extension())
            .map(|ext| ext == "gz")
            .unwrap_or(false);
        let want_gzip = compress || suffix_gzip;

        self.sink = Some(match &file {
            None => Sink::Stdout(io::stdout()),
            Some(path) => {
                let f = File::create(path).map_err(|e| BackendError::Resource(e.to_string()))?;
                let w = BufWriter::new(f);
                if want_gzip {
                    Sink::Gzip(flate2::write::GzEncoder::new(w, flate2::Compression::default()))
                } else {
                    Sink::Plain(w)
                }
            }
        });
        self.path = file;
        Ok(())
    }

    fn free(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
        self.sink = None;
    }

    fn kp_flush(&mut self, entries: &[FlushEntry<'_>], time: u32) -> Result<(), BackendError> {
        for e in entries {
            self.write_line(e.key, e.value, time)?;
        }
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| BackendError::Config("ascii backend not initialized".into()))?;
        sink.flush().map_err(|e| BackendError::Transport(e.to_string()))
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<(), BackendError> {
        self.write_line(key, value, time)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush().map_err(|e| BackendError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn resolve_key(&mut self, key: &str) -> Result<Vec<u8>, BackendError> {
        // the text backend has no native id space; the key itself is the id.
        Ok(key.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_plain_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut b = AsciiBackend::new();
        b.init(&["-f".into(), path.to_string_lossy().into_owned()]).unwrap();
        b.kp_flush(
            &[FlushEntry {
                key: "a.b",
                value: 42,
                backend_key: None,
            }],
            1_700_000_000,
        )
        .unwrap();
        b.free();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a.b 42 1700000000\n");
    }

    #[test]
    fn gzip_suffix_auto_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt.gz");
        let mut b = AsciiBackend::new();
        b.init(&["-f".into(), path.to_string_lossy().into_owned()]).unwrap();
        b.kp_flush(
            &[FlushEntry {
                key: "a.b",
                value: 1,
                backend_key: None,
            }],
            1,
        )
        .unwrap();
        b.free();

        let raw = std::fs::read(&path).unwrap();
        // gzip magic bytes
        assert_eq!(&raw[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn rejects_unknown_option() {
        let mut b = AsciiBackend::new();
        assert!(b.init(&["-x".into()]).is_err());
    }
}
