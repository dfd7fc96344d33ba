use crate::error::ExiferError;
use crate::exifer::Exifer;
use crate::tags::Tag;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    Read,
    Write,
}

impl BatchMode {
    fn as_str(self) -> &'static str {
        match self {
            BatchMode::Read => "read",
            BatchMode::Write => "write",
        }
    }
}

/// File-centric metadata reader/writer with optional batching.
///
/// Each `Tagger` is bound to a single file. In immediate mode every `read`
/// or `write` is one round trip; inside a `begin()`/`end()` batch the
/// operations buffer up and flush as a single combined round trip. A batch
/// is either all reads or all writes; mixing is rejected.
///
/// ```no_run
/// # use exifer::{Exifer, ExiferError, KeyValueTag, HistoryTag, Tagger};
/// # fn main() -> Result<(), ExiferError> {
/// let exifer = Exifer::new();
/// let mut tagger = Tagger::new(&exifer, "scan_0001.tiff");
///
/// tagger.begin()?;
/// tagger.write(KeyValueTag::with_value("XMP-xmpMM:DocumentID", "doc-1"))?;
/// tagger.write(HistoryTag {
///     action: Some("created".into()),
///     software_agent: Some("archive-keeper 1.0".into()),
///     ..Default::default()
/// })?;
/// tagger.end()?; // one round trip
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Tagger<'a> {
    exifer: &'a Exifer,
    file_path: PathBuf,
    batch: bool,
    mode: Option<BatchMode>,
    buffer: Vec<Tag>,
}

impl<'a> Tagger<'a> {
    pub fn new(exifer: &'a Exifer, file_path: impl AsRef<Path>) -> Self {
        Self {
            exifer,
            file_path: file_path.as_ref().to_path_buf(),
            batch: false,
            mode: None,
            buffer: Vec::new(),
        }
    }

    /// The file this tagger is bound to.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Enters batch mode. Subsequent reads/writes buffer until [`end`].
    ///
    /// [`end`]: Tagger::end
    pub fn begin(&mut self) -> Result<(), ExiferError> {
        if self.batch {
            return Err(ExiferError::BatchMisuse(
                "already in batch mode, call end() first".into(),
            ));
        }
        self.batch = true;
        self.mode = None;
        self.buffer.clear();
        Ok(())
    }

    /// Reads a tag value now, or buffers the tag when a batch is active
    /// (returning `Ok(None)` until [`end`](Tagger::end) delivers the result).
    pub fn read(&mut self, tag: impl Into<Tag>) -> Result<Option<Value>, ExiferError> {
        let tag = tag.into();
        if self.batch {
            self.set_mode(BatchMode::Read)?;
            self.buffer.push(tag);
            return Ok(None);
        }
        let raw = self.exifer.read(&self.file_path, &tag.read_tags())?;
        Ok(Some(tag.parse(&raw)))
    }

    /// Writes a tag value now, or buffers the tag when a batch is active.
    pub fn write(&mut self, tag: impl Into<Tag>) -> Result<(), ExiferError> {
        let tag = tag.into();
        if self.batch {
            self.set_mode(BatchMode::Write)?;
            self.buffer.push(tag);
            return Ok(());
        }
        let pairs = collect_write_args(std::slice::from_ref(&tag));
        self.exifer.write(&self.file_path, &pairs)
    }

    /// Flushes the batch as one round trip and leaves batch mode.
    ///
    /// Read batches return a `result_key → value` map; write batches return
    /// `None`. A round-trip failure aborts the whole batch, but state resets
    /// either way, so the session stays usable for another attempt.
    pub fn end(&mut self) -> Result<Option<HashMap<String, Value>>, ExiferError> {
        if !self.batch {
            return Err(ExiferError::BatchMisuse(
                "not in batch mode, call begin() first".into(),
            ));
        }
        let mode = self.mode.take();
        let buffer = std::mem::take(&mut self.buffer);
        self.batch = false;

        match mode {
            None => Ok(None),
            Some(BatchMode::Read) => self.flush_read(&buffer).map(Some),
            Some(BatchMode::Write) => self.flush_write(&buffer).map(|_| None),
        }
    }

    fn set_mode(&mut self, mode: BatchMode) -> Result<(), ExiferError> {
        match self.mode {
            None => {
                self.mode = Some(mode);
                Ok(())
            }
            Some(current) if current == mode => Ok(()),
            Some(current) => Err(ExiferError::BatchMisuse(format!(
                "cannot mix read and write in a single batch (batch is '{}', attempted '{}')",
                current.as_str(),
                mode.as_str()
            ))),
        }
    }

    fn flush_read(&self, buffer: &[Tag]) -> Result<HashMap<String, Value>, ExiferError> {
        let raw = self
            .exifer
            .read(&self.file_path, &collect_read_tags(buffer))?;

        let mut result = HashMap::new();
        for tag in buffer {
            result.insert(tag.result_key().to_string(), tag.parse(&raw));
        }
        Ok(result)
    }

    fn flush_write(&self, buffer: &[Tag]) -> Result<(), ExiferError> {
        self.exifer
            .write(&self.file_path, &collect_write_args(buffer))
    }
}

/// Union of all requested worker names, de-duplicated in first-seen order.
pub(crate) fn collect_read_tags(tags: &[Tag]) -> Vec<String> {
    let mut all_tags: Vec<String> = Vec::new();
    for tag in tags {
        for name in tag.read_tags() {
            if !all_tags.contains(&name) {
                all_tags.push(name);
            }
        }
    }
    all_tags
}

/// Merges `write_args()` from all tags, preserving buffer order.
///
/// Repeated names coalesce into an ordered list so the write later emits one
/// repeated wire argument per element instead of overwriting.
pub(crate) fn collect_write_args(tags: &[Tag]) -> Vec<(String, Value)> {
    let mut pairs: Vec<(String, Value)> = Vec::new();
    for tag in tags {
        for (name, value) in tag.write_args() {
            match pairs.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, Value::Array(items))) => items.push(value),
                Some(entry) => {
                    let prior = std::mem::replace(&mut entry.1, Value::Null);
                    entry.1 = Value::Array(vec![prior, value]);
                }
                None => pairs.push((name, value)),
            }
        }
    }
    pairs
}
