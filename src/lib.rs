//! # exifer
//!
//! A batched metadata I/O engine on top of ExifTool's stay-open protocol.
//!
//! The engine keeps one long-lived worker process per executable name and
//! drives it over the line-oriented request/response protocol, so many
//! metadata operations reuse a single process instead of paying the startup
//! cost per call. Crashed or timed-out workers are replaced transparently on
//! the next call, and values that cannot cross the line protocol (embedded
//! line breaks) are rerouted through a one-off invocation with temp-file
//! redirection. Callers never see which path served them.
//!
//! Logical metadata units are described by [`Tag`] descriptors (scalar
//! [`KeyValueTag`]s and structured [`HistoryTag`]s) and executed through a
//! per-file [`Tagger`] session that can fold many operations into one round
//! trip.
//!
//! ## Basic usage
//!
//! ```no_run
//! use exifer::{Exifer, ExiferError, HistoryTag, KeyValueTag, Tagger};
//!
//! fn main() -> Result<(), ExiferError> {
//!     let exifer = Exifer::new();
//!     let mut tagger = Tagger::new(&exifer, "scan_0001.tiff");
//!
//!     // Immediate mode: one round trip per call.
//!     let title = tagger.read(KeyValueTag::new("XMP-dc:Title"))?;
//!     println!("title: {:?}", title);
//!
//!     // Batch mode: many logical operations, one round trip.
//!     tagger.begin()?;
//!     tagger.write(KeyValueTag::with_value("XMP-dc:Title", "Box 12, print 4"))?;
//!     tagger.write(HistoryTag {
//!         action: Some("created".into()),
//!         when: Some(chrono::Utc::now().fixed_offset()),
//!         software_agent: Some("archive-keeper 1.0".into()),
//!         ..Default::default()
//!     })?;
//!     tagger.end()?;
//!
//!     // At application exit.
//!     exifer::shutdown_global();
//!     Ok(())
//! }
//! ```
//!
//! ## Batched reads
//!
//! ```no_run
//! use exifer::{Exifer, ExiferError, HistoryTag, KeyValueTag, Tagger, TAG_HISTORY};
//!
//! fn main() -> Result<(), ExiferError> {
//!     let exifer = Exifer::new();
//!     let mut tagger = Tagger::new(&exifer, "scan_0001.tiff");
//!
//!     tagger.begin()?;
//!     tagger.read(KeyValueTag::new("XMP-xmpMM:DocumentID"))?;
//!     tagger.read(HistoryTag::default())?;
//!     let result = tagger.end()?.unwrap_or_default();
//!
//!     let doc_id = result.get("XMP-xmpMM:DocumentID");
//!     let history = result.get(TAG_HISTORY);
//!     println!("{doc_id:?} {history:?}");
//!     Ok(())
//! }
//! ```

mod error;
mod exifer;
mod executors;
mod historian;
mod supervisor;
mod tagger;
mod tags;
mod utils;

pub use error::ExiferError;
pub use exifer::Exifer;
pub use historian::{actions, Historian};
pub use supervisor::{shutdown_global, Supervisor};
pub use tagger::Tagger;
pub use tags::{parse_history, HistoryEntry, HistoryTag, KeyValueTag, Tag, TAG_HISTORY};
