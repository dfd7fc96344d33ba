use crate::error::ExiferError;
use crate::executors::single;
use crate::supervisor::Supervisor;
use crate::utils::value_to_clean_string;
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The engine facade: reads and writes metadata on one file per round trip,
/// with transparent worker lifecycle management.
///
/// Every call goes through the persistent stay-open channel of the configured
/// executable, falling back to a one-off invocation when the worker dies
/// mid-call or a value cannot cross the line protocol. Callers never see
/// which path served them.
///
/// An `Exifer` is cheap to clone and is shared by reference across
/// [`Tagger`](crate::Tagger) sessions.
#[derive(Debug, Clone)]
pub struct Exifer {
    supervisor: Option<Arc<Supervisor>>,
    executable: String,
    timeout: Duration,
}

impl Default for Exifer {
    fn default() -> Self {
        Self::new()
    }
}

impl Exifer {
    /// Engine over the process-wide supervisor and the `exiftool` executable.
    pub fn new() -> Self {
        Self {
            supervisor: None,
            executable: "exiftool".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a different worker executable (name or path).
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Round-trip deadline. On expiry the worker is killed and the current
    /// call fails; the next call respawns transparently.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use an isolated supervisor instead of the process-wide one.
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Reads the requested tags, returning a map keyed by `Group1:Name`.
    ///
    /// Bookkeeping keys the worker adds (`SourceFile`, the `ExifTool` group)
    /// are filtered out, so tags absent from the file are genuinely absent
    /// from the map.
    pub fn read(
        &self,
        file_path: &Path,
        tags: &[String],
    ) -> Result<Map<String, Value>, ExiferError> {
        let mut args: Vec<String> = vec!["-json".into(), "-G1".into()];
        args.extend(tags.iter().map(|tag| format!("-{tag}")));
        args.push(file_path.to_string_lossy().into_owned());

        let output = self.run(&args, false)?;
        let value: Value = serde_json::from_str(&output)?;

        let unexpected = || ExiferError::UnexpectedFormat {
            file: file_path.to_string_lossy().into_owned(),
            args: args.join(" "),
        };
        let first = match value {
            Value::Array(mut items) if !items.is_empty() => items.remove(0),
            _ => return Err(unexpected()),
        };
        let object = match first {
            Value::Object(object) => object,
            _ => return Err(unexpected()),
        };

        Ok(object
            .into_iter()
            .filter(|(key, _)| key != "SourceFile" && !key.starts_with("ExifTool"))
            .collect())
    }

    /// Reads tags and deserializes the filtered response object into `T`.
    pub fn read_typed<T: DeserializeOwned>(
        &self,
        file_path: &Path,
        tags: &[String],
    ) -> Result<T, ExiferError> {
        let raw = self.read(file_path, tags)?;
        serde_path_to_error::deserialize(Value::Object(raw)).map_err(ExiferError::from)
    }

    /// Writes `(name, value)` pairs in one round trip.
    ///
    /// Array values expand to one repeated wire argument per element, in list
    /// order; null values are skipped. Any value embedding a line break
    /// reroutes the whole write through the one-off executor's redirection
    /// form, since it could never cross the line protocol inline.
    pub fn write(&self, file_path: &Path, pairs: &[(String, Value)]) -> Result<(), ExiferError> {
        let args = build_write_args(file_path, pairs);
        let multiline = args.iter().any(|arg| arg.contains('\n'));
        self.run(&args, multiline)?;
        Ok(())
    }

    /// One protocol round trip.
    ///
    /// `force_one_off` skips the persistent channel entirely. A desync on the
    /// persistent path gets exactly one fallback attempt through the one-off
    /// executor, which re-sends the full operation; timeouts, startup
    /// failures and worker-reported errors surface as-is.
    fn run(&self, args: &[String], force_one_off: bool) -> Result<String, ExiferError> {
        if force_one_off {
            return single::execute_rewriting_multiline(&self.executable, args, self.timeout);
        }

        match self
            .supervisor()
            .execute(&self.executable, args, self.timeout)
        {
            Err(ExiferError::ProcessTerminated { executable, stderr }) => {
                warn!("persistent worker '{executable}' desynced, retrying one-off. stderr={stderr}");
                single::execute(&self.executable, args, self.timeout)
            }
            other => other,
        }
    }

    fn supervisor(&self) -> &Supervisor {
        match &self.supervisor {
            Some(supervisor) => supervisor,
            None => Supervisor::global(),
        }
    }
}

/// Renders the wire argument list for a write: `-overwrite_original`, one
/// `-name=value` argument per pair, and the target path last. Array values
/// expand to one argument per element in list order; null values are skipped.
fn build_write_args(file_path: &Path, pairs: &[(String, Value)]) -> Vec<String> {
    let mut args: Vec<String> = vec!["-overwrite_original".into()];
    for (name, value) in pairs {
        match value {
            Value::Null => continue,
            Value::Array(items) => {
                for item in items {
                    args.push(format!("-{}={}", name, value_to_clean_string(item)));
                }
            }
            other => args.push(format!("-{}={}", name, value_to_clean_string(other))),
        }
    }
    args.push(file_path.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_helpers::{
        exiftool_available, minimal_tiff, write_stub_worker, StubBehavior,
    };
    use serde_json::json;

    fn isolated(executable: &str) -> Exifer {
        Exifer::new()
            .with_executable(executable)
            .with_supervisor(Arc::new(Supervisor::new()))
    }

    #[test]
    fn read_filters_bookkeeping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let response = r#"[{"SourceFile":"a.tif","ExifTool:ExifToolVersion":12.5,"XMP-dc:Title":"hello"}]"#;
        let stub = write_stub_worker(dir.path(), "worker", response, StubBehavior::Normal);
        let exifer = isolated(stub.to_str().unwrap());

        let raw = exifer
            .read(Path::new("a.tif"), &["XMP-dc:Title".to_string()])
            .unwrap();
        assert_eq!(raw.get("XMP-dc:Title"), Some(&json!("hello")));
        assert!(!raw.contains_key("SourceFile"));
        assert!(!raw.contains_key("ExifTool:ExifToolVersion"));
    }

    #[test]
    fn write_args_expand_arrays_and_skip_nulls() {
        let pairs = vec![
            ("XMP-dc:Creator".to_string(), json!(["a", "b"])),
            ("XMP-dc:Title".to_string(), json!(null)),
            ("XMP-dc:Source".to_string(), json!("s")),
        ];
        let args = build_write_args(Path::new("a.tif"), &pairs);
        assert_eq!(
            args,
            vec![
                "-overwrite_original".to_string(),
                "-XMP-dc:Creator=a".into(),
                "-XMP-dc:Creator=b".into(),
                "-XMP-dc:Source=s".into(),
                "a.tif".into(),
            ]
        );
    }

    #[test]
    fn read_of_a_malformed_response_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", "not json", StubBehavior::Normal);
        let exifer = isolated(stub.to_str().unwrap());

        let result = exifer.read(Path::new("a.tif"), &["XMP-dc:Title".to_string()]);
        assert!(matches!(result, Err(ExiferError::Json(_))));
    }

    #[test]
    fn mid_call_death_falls_back_to_the_one_off_path() {
        let dir = tempfile::tempdir().unwrap();
        let response = r#"[{"SourceFile":"a.tif","XMP-dc:Title":"recovered"}]"#;
        let stub = write_stub_worker(dir.path(), "worker", response, StubBehavior::CrashOnExecute);
        let exifer = isolated(stub.to_str().unwrap());

        // The stay-open attempt dies without a sentinel; the one-off retry
        // re-sends the full operation and must succeed without the caller
        // ever seeing the crash.
        let raw = exifer
            .read(Path::new("a.tif"), &["XMP-dc:Title".to_string()])
            .unwrap();
        assert_eq!(raw.get("XMP-dc:Title"), Some(&json!("recovered")));
    }

    #[test]
    fn typed_reads_deserialize_the_response() {
        #[derive(serde::Deserialize)]
        struct Ids {
            #[serde(rename = "XMP-xmpMM:DocumentID")]
            document_id: String,
            #[serde(rename = "XMP-xmpMM:InstanceID")]
            instance_id: Option<String>,
        }

        let dir = tempfile::tempdir().unwrap();
        let response = r#"[{"SourceFile":"a.tif","XMP-xmpMM:DocumentID":"doc-1"}]"#;
        let stub = write_stub_worker(dir.path(), "worker", response, StubBehavior::Normal);
        let exifer = isolated(stub.to_str().unwrap());

        let ids: Ids = exifer
            .read_typed(
                Path::new("a.tif"),
                &[
                    "XMP-xmpMM:DocumentID".to_string(),
                    "XMP-xmpMM:InstanceID".to_string(),
                ],
            )
            .unwrap();
        assert_eq!(ids.document_id, "doc-1");
        assert_eq!(ids.instance_id, None);
    }

    // --- Integration against a real exiftool binary, skipped when absent ---

    fn scratch_image(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("sample.tiff");
        std::fs::write(&path, minimal_tiff()).unwrap();
        path
    }

    #[test]
    fn scalar_value_round_trips() {
        if !exiftool_available() {
            eprintln!("exiftool not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let image = scratch_image(dir.path());
        let exifer = Exifer::new().with_supervisor(Arc::new(Supervisor::new()));

        exifer
            .write(
                &image,
                &[("XMP-dc:Title".to_string(), json!("hello world"))],
            )
            .unwrap();
        let raw = exifer.read(&image, &["XMP-dc:Title".to_string()]).unwrap();
        assert_eq!(raw.get("XMP-dc:Title"), Some(&json!("hello world")));
    }

    #[test]
    fn multiline_value_round_trips_through_redirection() {
        if !exiftool_available() {
            eprintln!("exiftool not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let image = scratch_image(dir.path());
        let exifer = Exifer::new().with_supervisor(Arc::new(Supervisor::new()));

        let value = "line one\nline two";
        exifer
            .write(&image, &[("XMP-dc:Description".to_string(), json!(value))])
            .unwrap();
        let raw = exifer
            .read(&image, &["XMP-dc:Description".to_string()])
            .unwrap();
        assert_eq!(raw.get("XMP-dc:Description"), Some(&json!(value)));
    }
}
