//! File-backed evaluator store.
//!
//! Layout under the store directory:
//!
//! ```text
//! evaluator-<name>.json            full history, pretty JSON
//! evaluator-<name>.journal.jsonl   calls appended since the last save
//! ```
//!
//! Journal lines carry the call's sequence number so entries already folded
//! into the document are skipped on load.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{EvaluatorStore, validate_name};
use crate::tracker::{EvaluatorCall, EvaluatorData};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    seq: usize,
    call: EvaluatorCall,
}

/// Evaluator histories stored as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileEvaluatorStore {
    dir: PathBuf,
}

impl FileEvaluatorStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Open the store in the default state directory.
    pub fn open_default() -> Result<Self> {
        Self::open(sia_paths::evaluators_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the history document for `name`.
    pub fn document_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("evaluator-{name}.json"))
    }

    /// Path of the append journal for `name`.
    pub fn journal_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("evaluator-{name}.journal.jsonl"))
    }

    fn read_document(&self, name: &str) -> Result<Option<EvaluatorData>> {
        let path = self.document_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let data: EvaluatorData =
            serde_json::from_str(&content).map_err(|e| Error::schema(&path, e))?;

        if data.name != name {
            return Err(Error::schema(
                &path,
                format!("document names evaluator '{}', expected '{name}'", data.name),
            ));
        }
        for (index, call) in data.calls.iter().enumerate() {
            call.validate()
                .map_err(|e| Error::schema(&path, format!("call {index}: {e}")))?;
        }
        Ok(Some(data))
    }

    fn read_journal(&self, name: &str) -> Result<Option<Vec<JournalEntry>>> {
        let path = self.journal_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();

        let mut entries = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    entry.call.validate().map_err(|e| {
                        Error::schema(&path, format!("line {}: {e}", index + 1))
                    })?;
                    entries.push(entry);
                }
                // Torn final write: the append never returned, so the call was never acknowledged.
                Err(e) if !complete && index == lines.len() - 1 => {
                    warn!(path = %path.display(), error = %e, "ignoring torn journal tail");
                }
                Err(e) => {
                    return Err(Error::schema(&path, format!("line {}: {e}", index + 1)));
                }
            }
        }
        Ok(Some(entries))
    }
}

impl EvaluatorStore for FileEvaluatorStore {
    fn load(&self, name: &str) -> Result<Option<EvaluatorData>> {
        validate_name(name)?;

        let document = self.read_document(name)?;
        let journal = self.read_journal(name)?;
        if document.is_none() && journal.is_none() {
            return Ok(None);
        }

        let mut data = document.unwrap_or_else(|| EvaluatorData::new(name));
        let compacted = data.calls.len();
        for entry in journal.unwrap_or_default() {
            if entry.seq < data.calls.len() {
                continue;
            }
            if entry.seq > data.calls.len() {
                return Err(Error::schema(
                    self.journal_path(name),
                    format!(
                        "journal skips from call {} to call {}",
                        data.calls.len(),
                        entry.seq
                    ),
                ));
            }
            data.calls.push(entry.call);
        }

        debug!(
            evaluator = name,
            calls = data.calls.len(),
            replayed = data.calls.len() - compacted,
            "loaded evaluator history"
        );
        Ok(Some(data))
    }

    fn append(&self, name: &str, seq: usize, call: &EvaluatorCall) -> Result<()> {
        validate_name(name)?;
        let path = self.journal_path(name);

        let mut line = serde_json::to_string(&JournalEntry {
            seq,
            call: call.clone(),
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        truncate_torn_tail(&mut file, &path)?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        file.sync_data().map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    fn save(&self, data: &EvaluatorData) -> Result<()> {
        validate_name(&data.name)?;
        let path = self.document_path(&data.name);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(data)?;
        {
            let mut file = fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| Error::io(&tmp, e))?;
            file.sync_all().map_err(|e| Error::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;

        let journal = self.journal_path(&data.name);
        match fs::remove_file(&journal) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&journal, e)),
        }

        debug!(evaluator = %data.name, calls = data.calls.len(), path = %path.display(), "saved evaluator history");
        Ok(())
    }
}

/// Cut a journal back to its last complete line.
///
/// A crash mid-append leaves bytes without a trailing newline; appending after
/// them would fuse the next entry into an unparseable line.
fn truncate_torn_tail(file: &mut File, path: &Path) -> Result<()> {
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| Error::io(path, e))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut content))
        .map_err(|e| Error::io(path, e))?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |at| at as u64 + 1);
    file.set_len(keep).map_err(|e| Error::io(path, e))?;
    warn!(path = %path.display(), dropped = len - keep, "truncated torn journal tail");
    Ok(())
}
