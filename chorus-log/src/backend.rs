//! Durable storage for the mutation log.
//!
//! The same [`MutationLog`](crate::MutationLog) code runs on top of:
//! - [`FileBackend`]: one JSON-lines file per source, append + fsync
//! - [`MemoryBackend`]: nothing persisted, for tests and throwaway peers

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chorus_core::SourceId;

use crate::entry::LogEntry;
use crate::error::{io_err, LogError};

/// Persistence primitives the log needs. Calls for one source are already
/// serialized by the log's per-source lock.
pub trait LogBackend: Send + Sync + fmt::Debug {
    /// Every persisted entry, any order. Called once at open.
    fn load(&self) -> Result<Vec<LogEntry>, LogError>;

    /// Durably append one entry. Must not return before the entry survives a crash.
    fn append(&self, entry: &LogEntry) -> Result<(), LogError>;

    /// Replace everything stored for `source` with `entries` (compaction).
    fn rewrite(&self, source: &SourceId, entries: &[LogEntry]) -> Result<(), LogError>;
}

// -- memory backend --

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl LogBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<LogEntry>, LogError> {
        Ok(Vec::new())
    }

    fn append(&self, _entry: &LogEntry) -> Result<(), LogError> {
        Ok(())
    }

    fn rewrite(&self, _source: &SourceId, _entries: &[LogEntry]) -> Result<(), LogError> {
        Ok(())
    }
}

// -- file backend --

/// `<dir>/<source>.jsonl`, one [`LogEntry`] per line.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `source`'s entries.
    ///
    /// Bytes outside `[A-Za-z0-9_.-]` are written as `%xx`, so distinct ids
    /// always map to distinct files and none can escape the log directory.
    pub fn path_for(&self, source: &SourceId) -> PathBuf {
        let mut name = String::with_capacity(source.as_str().len());
        for b in source.as_str().bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.') {
                name.push(char::from(b));
            } else {
                name.push_str(&format!("%{b:02x}"));
            }
        }
        if name.is_empty() {
            name.push('%');
        }
        self.dir.join(format!("{name}.jsonl"))
    }

    /// Parse one source file. An unterminated last line is a crash
    /// mid-append: it is dropped (or newline-terminated, if it is whole) on
    /// disk so the next append starts on a fresh line.
    fn load_file(path: &Path) -> Result<Vec<LogEntry>, LogError> {
        let contents = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let mut entries = Vec::new();
        let mut offset = 0u64;
        for (idx, chunk) in contents.split_inclusive('\n').enumerate() {
            let terminated = chunk.ends_with('\n');
            let line = chunk.trim_end();
            if !line.is_empty() {
                match LogEntry::from_line(line) {
                    Ok(entry) => {
                        if !terminated {
                            terminate_tail(path)?;
                        }
                        entries.push(entry);
                    }
                    Err(err) if !terminated => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "dropping torn tail write in mutation log",
                        );
                        truncate_at(path, offset)?;
                    }
                    Err(source) => {
                        return Err(LogError::Corrupt {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            source,
                        })
                    }
                }
            }
            offset += chunk.len() as u64;
        }
        Ok(entries)
    }
}

fn truncate_at(path: &Path, len: u64) -> Result<(), LogError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.set_len(len).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))
}

fn terminate_tail(path: &Path) -> Result<(), LogError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.write_all(b"\n").map_err(|e| io_err(path, e))?;
    file.sync_data().map_err(|e| io_err(path, e))
}

impl LogBackend for FileBackend {
    fn load(&self) -> Result<Vec<LogEntry>, LogError> {
        let mut all = Vec::new();
        let read = fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let mut paths: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
            .collect();
        paths.sort();
        for path in paths {
            all.extend(Self::load_file(&path)?);
        }
        Ok(all)
    }

    fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let path = self.path_for(&entry.source);
        let mut line = entry.to_line()?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| io_err(&path, e))?;
        file.sync_data().map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    fn rewrite(&self, source: &SourceId, entries: &[LogEntry]) -> Result<(), LogError> {
        let path = self.path_for(source);
        let mut body = String::new();
        for entry in entries {
            body.push_str(&entry.to_line()?);
            body.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            file.write_all(body.as_bytes()).map_err(|e| io_err(&tmp, e))?;
            file.sync_all().map_err(|e| io_err(&tmp, e))?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(())
    }
}
