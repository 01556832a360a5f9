// File: tabsync/src/realtime.rs
// Purpose: Realtime change notifications, decoded at the boundary into typed events

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::broadcast;

use crate::error::SyncError;

/// Rows arrive in the record's own camelCase or as snake_case table columns
const DEVICE_ID_FIELDS: [&str; 2] = ["deviceId", "device_id"];
const ID_FIELD: &str = "id";

/// Kind of row change reported by the realtime transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawEventKind {
    Insert,
    Update,
    Delete,
}

/// Loosely-typed notification exactly as the transport delivers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: RawEventKind,
    #[serde(default)]
    pub new: Option<Map<String, JsonValue>>,
    #[serde(default)]
    pub old: Option<Map<String, JsonValue>>,
}

/// One side of a change: the identifying fields plus the full row
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub group_id: Option<String>,
    pub device_id: Option<String>,
    pub data: Map<String, JsonValue>,
}

impl From<Map<String, JsonValue>> for ChangeRecord {
    fn from(data: Map<String, JsonValue>) -> Self {
        let field = |name: &str| {
            data.get(name)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let group_id = field(ID_FIELD);
        let device_id = DEVICE_ID_FIELDS.iter().find_map(|name| field(*name));

        Self {
            group_id,
            device_id,
            data,
        }
    }
}

/// Typed change notification
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(ChangeRecord),
    Update {
        old: Option<ChangeRecord>,
        new: ChangeRecord,
    },
    Delete(ChangeRecord),
}

impl ChangeEvent {
    /// The record that describes the write: the new row, or the old row for deletes
    pub fn source_record(&self) -> &ChangeRecord {
        match self {
            ChangeEvent::Insert(new) | ChangeEvent::Update { new, .. } => new,
            ChangeEvent::Delete(old) => old,
        }
    }

    /// Device that made the write, if the payload carries one
    pub fn origin_device_id(&self) -> Option<&str> {
        self.source_record().device_id.as_deref()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.source_record().group_id.as_deref()
    }

    pub fn kind(&self) -> RawEventKind {
        match self {
            ChangeEvent::Insert(_) => RawEventKind::Insert,
            ChangeEvent::Update { .. } => RawEventKind::Update,
            ChangeEvent::Delete(_) => RawEventKind::Delete,
        }
    }
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = SyncError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        let missing = |side: &str| {
            SyncError::InvalidEvent(format!("{:?} event without `{}` record", kind, side))
        };

        match kind {
            RawEventKind::Insert => {
                let new = raw.new.ok_or_else(|| missing("new"))?;
                Ok(ChangeEvent::Insert(new.into()))
            }
            RawEventKind::Update => {
                let new = raw.new.ok_or_else(|| missing("new"))?;
                Ok(ChangeEvent::Update {
                    old: raw.old.map(ChangeRecord::from),
                    new: new.into(),
                })
            }
            RawEventKind::Delete => {
                let old = raw.old.ok_or_else(|| missing("old"))?;
                Ok(ChangeEvent::Delete(old.into()))
            }
        }
    }
}

/// Broadcast source of raw change events
///
/// Transports (websocket, LISTEN/NOTIFY, polling) push what they receive into
/// the hub; consumers subscribe and decode.
pub struct RealtimeHub {
    broadcast_tx: broadcast::Sender<RawChangeEvent>,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self { broadcast_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawChangeEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Get a clone of the broadcast sender for transport tasks
    pub fn sender(&self) -> broadcast::Sender<RawChangeEvent> {
        self.broadcast_tx.clone()
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: RawChangeEvent) -> usize {
        self.broadcast_tx.send(event).unwrap_or(0)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(1000)
    }
}
