use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::value_to_clean_string;

/// Structured history container tag.
pub const TAG_HISTORY: &str = "XMP-xmpMM:History";

const TAG_HISTORY_ACTION: &str = "XMP-xmpMM:HistoryAction";
const TAG_HISTORY_WHEN: &str = "XMP-xmpMM:HistoryWhen";
const TAG_HISTORY_SOFTWARE_AGENT: &str = "XMP-xmpMM:HistorySoftwareAgent";
const TAG_HISTORY_CHANGED: &str = "XMP-xmpMM:HistoryChanged";
const TAG_HISTORY_PARAMETERS: &str = "XMP-xmpMM:HistoryParameters";
const TAG_HISTORY_INSTANCE_ID: &str = "XMP-xmpMM:HistoryInstanceID";

/// Flattened parallel-array tags the worker substitutes for the structured
/// container on reads.
const HISTORY_FLATTENED_TAGS: [&str; 6] = [
    TAG_HISTORY_ACTION,
    TAG_HISTORY_WHEN,
    TAG_HISTORY_SOFTWARE_AGENT,
    TAG_HISTORY_CHANGED,
    TAG_HISTORY_PARAMETERS,
    TAG_HISTORY_INSTANCE_ID,
];

/// Descriptor that tells [`Tagger`](crate::Tagger) how one logical metadata
/// unit maps to wire operations and back.
///
/// A closed set: scalar key/value pairs and structured history entries. All
/// serialisation and parsing logic lives here; the session layer stays
/// format-agnostic.
#[derive(Debug, Clone)]
pub enum Tag {
    KeyValue(KeyValueTag),
    History(HistoryTag),
}

impl Tag {
    /// Key under which the parsed value appears in a batch-read result.
    pub fn result_key(&self) -> &str {
        match self {
            Tag::KeyValue(tag) => &tag.name,
            Tag::History(_) => TAG_HISTORY,
        }
    }

    /// Worker tag names to request when reading.
    pub fn read_tags(&self) -> Vec<String> {
        match self {
            Tag::KeyValue(tag) => vec![tag.name.clone()],
            Tag::History(_) => HISTORY_FLATTENED_TAGS
                .iter()
                .map(|tag| tag.to_string())
                .collect(),
        }
    }

    /// Extracts this tag's value from a raw response map.
    pub fn parse(&self, raw: &Map<String, Value>) -> Value {
        match self {
            Tag::KeyValue(tag) => raw.get(&tag.name).cloned().unwrap_or(Value::Null),
            Tag::History(_) => {
                serde_json::to_value(parse_history(raw)).unwrap_or(Value::Null)
            }
        }
    }

    /// `(name, value)` pairs for a write round trip.
    pub fn write_args(&self) -> Vec<(String, Value)> {
        match self {
            Tag::KeyValue(tag) => vec![(
                tag.name.clone(),
                tag.value.clone().unwrap_or(Value::Null),
            )],
            Tag::History(tag) => vec![(
                format!("{TAG_HISTORY}+"),
                Value::String(tag.to_struct_literal()),
            )],
        }
    }
}

/// Simple scalar tag: one worker name, one value.
///
/// For reading, create with just the name; for writing, supply the value too.
#[derive(Debug, Clone)]
pub struct KeyValueTag {
    pub(crate) name: String,
    pub(crate) value: Option<Value>,
}

impl KeyValueTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl From<KeyValueTag> for Tag {
    fn from(tag: KeyValueTag) -> Self {
        Tag::KeyValue(tag)
    }
}

/// Structured entry for [`TAG_HISTORY`].
///
/// With no fields set the tag reads the whole history; with fields populated
/// it appends exactly one entry.
#[derive(Debug, Clone, Default)]
pub struct HistoryTag {
    pub action: Option<String>,
    pub when: Option<DateTime<FixedOffset>>,
    pub software_agent: Option<String>,
    pub instance_id: Option<String>,
    pub changed: Option<String>,
    pub parameters: Option<String>,
}

impl HistoryTag {
    /// Renders the present fields as the worker's struct literal, in the
    /// canonical field order. Absent fields contribute nothing, not an empty
    /// `field=` token.
    fn to_struct_literal(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(action) = &self.action {
            parts.push(format!("action={action}"));
        }
        if let Some(when) = &self.when {
            parts.push(format!(
                "when={}",
                when.to_rfc3339_opts(SecondsFormat::Millis, false)
            ));
        }
        if let Some(agent) = &self.software_agent {
            parts.push(format!("softwareAgent={agent}"));
        }
        if let Some(id) = &self.instance_id {
            parts.push(format!("instanceID={id}"));
        }
        if let Some(changed) = &self.changed {
            parts.push(format!("changed={changed}"));
        }
        if let Some(parameters) = &self.parameters {
            parts.push(format!("parameters={parameters}"));
        }
        format!("{{{}}}", parts.join(","))
    }
}

impl From<HistoryTag> for Tag {
    fn from(tag: HistoryTag) -> Self {
        Tag::History(tag)
    }
}

/// One parsed history record. Fields the file lacks stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(rename = "softwareAgent", skip_serializing_if = "Option::is_none")]
    pub software_agent: Option<String>,
    #[serde(rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

impl HistoryEntry {
    fn is_empty(&self) -> bool {
        self.action.is_none()
            && self.when.is_none()
            && self.software_agent.is_none()
            && self.instance_id.is_none()
            && self.changed.is_none()
            && self.parameters.is_none()
    }
}

/// Zips the worker's flattened parallel arrays back into records by index.
///
/// The arrays may be ragged; a record simply omits fields whose array ran
/// out, and all-empty records are dropped. Append order is preserved.
pub fn parse_history(raw: &Map<String, Value>) -> Vec<HistoryEntry> {
    let actions = coerce_array(raw.get(TAG_HISTORY_ACTION));
    let whens = coerce_array(raw.get(TAG_HISTORY_WHEN));
    let agents = coerce_array(raw.get(TAG_HISTORY_SOFTWARE_AGENT));
    let changeds = coerce_array(raw.get(TAG_HISTORY_CHANGED));
    let parameters = coerce_array(raw.get(TAG_HISTORY_PARAMETERS));
    let instance_ids = coerce_array(raw.get(TAG_HISTORY_INSTANCE_ID));

    let max_len = [
        actions.len(),
        whens.len(),
        agents.len(),
        changeds.len(),
        parameters.len(),
        instance_ids.len(),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let mut history = Vec::with_capacity(max_len);
    for i in 0..max_len {
        let entry = HistoryEntry {
            action: field_at(&actions, i),
            when: field_at(&whens, i),
            software_agent: field_at(&agents, i),
            instance_id: field_at(&instance_ids, i),
            changed: field_at(&changeds, i),
            parameters: field_at(&parameters, i),
        };
        if !entry.is_empty() {
            history.push(entry);
        }
    }
    history
}

/// The worker collapses a single entry to a bare scalar; missing or null
/// means no entries at all.
fn coerce_array(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn field_at(values: &[Value], index: usize) -> Option<String> {
    values.get(index).map(value_to_clean_string)
}
