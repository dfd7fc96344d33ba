use crate::error::ExiferError;
use crate::exifer::Exifer;
use crate::tagger::Tagger;
use crate::tags::{parse_history, HistoryEntry, HistoryTag, Tag};
use std::path::Path;

/// Standard `xmpMM` history action vocabulary.
pub mod actions {
    pub const CONVERTED: &str = "converted";
    pub const COPIED: &str = "copied";
    pub const CREATED: &str = "created";
    pub const CROPPED: &str = "cropped";
    pub const EDITED: &str = "edited";
    pub const FILTERED: &str = "filtered";
    pub const FORMATTED: &str = "formatted";
    pub const VERSION_UPDATED: &str = "version_updated";
    pub const PRINTED: &str = "printed";
    pub const PUBLISHED: &str = "published";
    pub const MANAGED: &str = "managed";
    pub const PRODUCED: &str = "produced";
    pub const RESIZED: &str = "resized";
    pub const SAVED: &str = "saved";
}

/// Append-only operation log stored in `XMP-xmpMM:History`.
///
/// Thin convenience over [`Tagger`] + [`HistoryTag`] for workflows that only
/// need "record what happened" and "show me what happened". Writes append;
/// existing entries are never rewritten.
#[derive(Debug)]
pub struct Historian<'a> {
    exifer: &'a Exifer,
}

impl<'a> Historian<'a> {
    pub fn new(exifer: &'a Exifer) -> Self {
        Self { exifer }
    }

    /// Appends one history entry in a single round trip.
    pub fn append(&self, file_path: &Path, entry: HistoryTag) -> Result<(), ExiferError> {
        let mut tagger = Tagger::new(self.exifer, file_path);
        tagger.write(Tag::History(entry))
    }

    /// Reads the full history in append order.
    pub fn read(&self, file_path: &Path) -> Result<Vec<HistoryEntry>, ExiferError> {
        let tag = Tag::History(HistoryTag::default());
        let raw = self.exifer.read(file_path, &tag.read_tags())?;
        Ok(parse_history(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Supervisor;
    use crate::utils::test_helpers::{write_stub_worker, StubBehavior};
    use std::sync::Arc;

    #[test]
    fn reads_records_through_the_flattened_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let response = concat!(
            r#"[{"SourceFile":"a.tif","#,
            r#""XMP-xmpMM:HistoryAction":["created","edited"],"#,
            r#""XMP-xmpMM:HistoryWhen":["T1","T2"],"#,
            r#""XMP-xmpMM:HistoryChanged":["","metadata"]}]"#
        );
        let stub = write_stub_worker(dir.path(), "worker", response, StubBehavior::Normal);
        let exifer = Exifer::new()
            .with_executable(stub.to_str().unwrap())
            .with_supervisor(Arc::new(Supervisor::new()));

        let history = Historian::new(&exifer).read(Path::new("a.tif")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action.as_deref(), Some(actions::CREATED));
        assert_eq!(history[1].changed.as_deref(), Some("metadata"));
    }
}
