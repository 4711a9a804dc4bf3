//! Recorded device I/O and the JSON emulation document.
//!
//! A document is a JSON object with one array per backend tag
//! (`"UsbDevices"`, ...). Each array holds device records:
//!
//! ```json
//! { "UsbDevices": [ {
//!     "Type": "UsbDevice",
//!     "BackendId": "usb:001-004",
//!     "Created": "2024-03-01T10:00:00Z",
//!     "Flags": ["updatable"],
//!     "Events": [ { "Request": "GetStatus", "Response": "AAE=" } ]
//! } ] }
//! ```
//!
//! Response bytes are base64 encoded. An event whose `Metadata` carries
//! an `Error` kind replays as that error.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::{Device, DeviceFlags, DeviceKind};
use crate::error::{Error, ErrorKind, Result};

const META_ERROR: &str = "Error";
const META_MESSAGE: &str = "Message";

/// One recorded request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceEvent {
    pub request: String,
    #[serde(with = "base64_bytes", default)]
    pub response: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl DeviceEvent {
    pub fn new(request: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// An event that replays as a failure of `kind`.
    pub fn failure(request: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_ERROR.to_string(), kind.as_str().to_string());
        metadata.insert(META_MESSAGE.to_string(), message.into());
        Self {
            request: request.into(),
            response: Vec::new(),
            metadata,
        }
    }

    fn recorded_error(&self) -> Result<Option<Error>> {
        let Some(kind) = self.metadata.get(META_ERROR) else {
            return Ok(None);
        };
        let kind: ErrorKind = kind.parse()?;
        let message = self
            .metadata
            .get(META_MESSAGE)
            .cloned()
            .unwrap_or_else(|| format!("recorded failure for {}", self.request));
        Ok(Some(Error::from_kind(kind, message)))
    }
}

/// Ordered I/O history of one device.
///
/// Replacing a device's log swaps the whole value; logs are never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    created_at: DateTime<Utc>,
    events: Vec<DeviceEvent>,
    cursor: usize,
}

impl EventLog {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            events: Vec::new(),
            cursor: 0,
        }
    }

    pub fn from_events(created_at: DateTime<Utc>, events: Vec<DeviceEvent>) -> Self {
        Self {
            created_at,
            events,
            cursor: 0,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn push(&mut self, event: DeviceEvent) {
        self.events.push(event);
    }

    /// Append a successful exchange.
    pub fn record(&mut self, request: impl Into<String>, response: &[u8]) {
        self.push(DeviceEvent::new(request, response));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceEvent> {
        self.events.iter()
    }

    /// Events not yet consumed by [`EventLog::replay`].
    pub fn remaining(&self) -> usize {
        self.events.len() - self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Answer `request` from the next recorded event.
    ///
    /// The request must match the recording exactly; replaying past the
    /// end is `NotFound`. A recorded failure is returned as the error.
    pub fn replay(&mut self, request: &str) -> Result<Vec<u8>> {
        let Some(event) = self.events.get(self.cursor) else {
            return Err(Error::NotFound(format!(
                "no recorded event for {request} (log has {} events)",
                self.events.len()
            )));
        };
        if event.request != request {
            return Err(Error::InvalidData(format!(
                "event {} expected {}, got {request}",
                self.cursor, event.request
            )));
        }
        self.cursor += 1;
        match event.recorded_error()? {
            Some(err) => Err(err),
            None => Ok(event.response.clone()),
        }
    }
}

/// Serialised form of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceRecord {
    #[serde(rename = "Type")]
    pub type_name: String,
    pub backend_id: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_delay_ms: Option<u64>,
    #[serde(default)]
    pub events: Vec<DeviceEvent>,
}

impl DeviceRecord {
    pub fn from_device(device: &Device) -> Self {
        Self {
            type_name: device.type_name().to_string(),
            backend_id: device.backend_id().to_string(),
            created: device.created_at(),
            flags: device.flags().to_names(),
            physical_id: device.physical_id().map(str::to_string),
            version: device.version().map(str::to_string),
            remove_delay_ms: device.remove_delay().map(|d| d.as_millis() as u64),
            events: device.events().iter().cloned().collect(),
        }
    }

    /// Build a transient device of `kind` from this record.
    pub fn to_device(&self, kind: DeviceKind) -> Result<Device> {
        if self.backend_id.is_empty() {
            return Err(Error::InvalidData("device record without BackendId".into()));
        }
        let flags = DeviceFlags::from_names(self.flags.as_slice())?;
        let mut device = Device::new(&self.backend_id, kind)
            .with_created_at(self.created)
            .with_type_name(&self.type_name)
            .with_flags(flags)
            .with_events(EventLog::from_events(self.created, self.events.clone()));
        if let Some(id) = &self.physical_id {
            device = device.with_physical_id(id);
        }
        if let Some(version) = &self.version {
            device = device.with_version(version);
        }
        if let Some(ms) = self.remove_delay_ms {
            device = device.with_remove_delay(Duration::from_millis(ms));
        }
        Ok(device)
    }
}

/// A whole emulation file, possibly covering several backends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmulationDocument {
    root: Map<String, Value>,
}

impl EmulationDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(root) => Ok(Self { root }),
            other => Err(Error::InvalidData(format!(
                "emulation document must be an object, found {}",
                json_type(&other)
            ))),
        }
    }

    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Records stored under `tag`; `None` if the tag is absent.
    pub fn records(&self, tag: &str) -> Result<Option<Vec<DeviceRecord>>> {
        let Some(value) = self.root.get(tag) else {
            return Ok(None);
        };
        if !value.is_array() {
            return Err(Error::InvalidData(format!(
                "{tag} must be an array, found {}",
                json_type(value)
            )));
        }
        let records = Vec::<DeviceRecord>::deserialize(value)
            .map_err(|e| Error::InvalidData(format!("{tag}: {e}")))?;
        Ok(Some(records))
    }

    /// Replace everything stored under `tag`.
    pub fn set_records(&mut self, tag: &str, records: &[DeviceRecord]) -> Result<()> {
        let value = serde_json::to_value(records)
            .map_err(|e| Error::Internal(format!("cannot serialize {tag}: {e}")))?;
        self.root.insert(tag.to_string(), value);
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.root)
            .map_err(|e| Error::Internal(format!("cannot serialize emulation: {e}")))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
