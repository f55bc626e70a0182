//! JSON representation of the atom feeds served by the HTTP API,
//! and their conversion into the crate event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{EventData, Position, RecordedEvent, ResolvedEvent, LINK_EVENT_TYPE};
use crate::store::PersistentSubscriptionEvent;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Feed {
    #[serde(default)]
    pub head_of_stream: bool,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Feed {
    fn link(&self, relation: &str) -> Option<&str> {
        find_link(&self.links, relation)
    }

    /// Position encoded in the link with the specified relation, for `$all` feeds.
    pub fn position(&self, relation: &str) -> Option<Position> {
        let uri = self.link(relation)?;
        uri.split('/').find_map(Position::from_hex)
    }

    pub fn has_link(&self, relation: &str) -> bool {
        self.link(relation).is_some()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Link {
    pub uri: String,
    pub relation: String,
}

fn find_link<'a>(links: &'a [Link], relation: &str) -> Option<&'a str> {
    links
        .iter()
        .find(|link| link.relation == relation)
        .map(|link| link.uri.as_str())
}

/// A feed entry, as returned with `embed=body`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Entry {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_number: i64,
    pub stream_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "metaData")]
    pub metadata: Value,
    #[serde(default, rename = "linkMetaData")]
    pub link_metadata: Value,
    #[serde(default)]
    pub is_json: bool,
    pub position_event_number: Option<i64>,
    pub position_stream_id: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Entry {
    /// Number of the entry in the stream that has been read, which
    /// differs from `event_number` for resolved links.
    pub fn original_event_number(&self) -> i64 {
        self.position_event_number.unwrap_or(self.event_number)
    }

    fn is_resolved_link(&self) -> bool {
        match (&self.position_stream_id, self.position_event_number) {
            (Some(stream), Some(number)) => {
                stream != &self.stream_id || number != self.event_number
            },
            _ => false,
        }
    }

    fn ack_id(&self) -> Option<Uuid> {
        let uri = find_link(&self.links, "ack")?;
        uri.rsplit('/').next()?.parse().ok()
    }

    pub fn into_resolved(self) -> ResolvedEvent {
        if !self.is_resolved_link() {
            return ResolvedEvent::new(self.into_recorded());
        }

        let link = RecordedEvent {
            stream_id: self.position_stream_id.clone().unwrap_or_default(),
            event_number: self.original_event_number(),
            // The feed does not expose link ids, apart from the ack link of competing feeds.
            event_id: self.ack_id().unwrap_or_else(Uuid::nil),
            event_type: LINK_EVENT_TYPE.to_owned(),
            is_json: false,
            data: format!("{}@{}", self.event_number, self.stream_id).into_bytes(),
            metadata: payload(&self.link_metadata),
            created: self.updated,
        };

        ResolvedEvent::resolved_link(link, Some(self.into_recorded()))
    }

    fn into_recorded(self) -> RecordedEvent {
        RecordedEvent {
            data: payload(&self.data),
            metadata: payload(&self.metadata),
            stream_id: self.stream_id,
            event_number: self.event_number,
            event_id: self.event_id,
            event_type: self.event_type,
            is_json: self.is_json,
            created: self.updated,
        }
    }

    pub fn into_persistent(self) -> PersistentSubscriptionEvent {
        PersistentSubscriptionEvent {
            retry_count: self.retry_count.unwrap_or_default(),
            event: self.into_resolved(),
        }
    }
}

/// A single event, as returned by `GET /streams/{stream}/{number}`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventEntry {
    pub content: Option<EventContent>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventContent {
    pub event_stream_id: String,
    pub event_number: i64,
    pub event_type: String,
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl EventEntry {
    pub fn into_recorded(self) -> Result<RecordedEvent> {
        let content = self
            .content
            .ok_or_else(|| Error::InvalidResponse("event entry without content".into()))?;

        Ok(RecordedEvent {
            is_json: content.data.is_object() || content.data.is_array(),
            data: payload(&content.data),
            metadata: payload(&content.metadata),
            stream_id: content.event_stream_id,
            event_number: content.event_number,
            event_id: content.event_id.unwrap_or_else(Uuid::nil),
            event_type: content.event_type,
            created: self.updated,
        })
    }
}

fn payload(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::String(text) => text.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// An event in the `application/vnd.eventstore.events+json` format used for writes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl TryFrom<&EventData> for WriteEvent {
    type Error = Error;

    fn try_from(event: &EventData) -> Result<Self> {
        if !event.is_json {
            return Err(Error::InvalidArgument(format!(
                "event '{}' has a binary payload, which can only be appended on its own",
                event.event_id
            )));
        }

        let metadata = if event.metadata.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&event.metadata)?
        };

        Ok(Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            data: serde_json::from_slice(&event.data)?,
            metadata,
        })
    }
}
