//! Stream metadata, stored by the server in the `$$<stream>` metastream.

use serde::{Deserialize, Deserializer, Serialize};

/// Event type of metadata events.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Returns the name of the metastream for `stream`.
pub fn metastream_of(stream: &str) -> String {
    format!("$${stream}")
}

/// Access control list of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAcl {
    /// Roles allowed to read the stream.
    #[serde(rename = "$r", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub read_roles: Vec<String>,

    /// Roles allowed to write to the stream.
    #[serde(rename = "$w", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub write_roles: Vec<String>,

    /// Roles allowed to delete the stream.
    #[serde(rename = "$d", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub delete_roles: Vec<String>,

    /// Roles allowed to read the stream metadata.
    #[serde(rename = "$mr", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub meta_read_roles: Vec<String>,

    /// Roles allowed to write the stream metadata.
    #[serde(rename = "$mw", default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub meta_write_roles: Vec<String>,
}

/// Metadata of a stream: retention policy, caching, ACLs and custom properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Maximum number of events kept in the stream.
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,

    /// Maximum age of the events kept in the stream, in seconds.
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,

    /// Events with a lower number are considered deleted.
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,

    /// Cache control for the stream head, in seconds.
    #[serde(rename = "$cacheControl", default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<u64>,

    /// Access control list.
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,

    /// Any user-defined property.
    #[serde(flatten)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

/// Result of reading the metadata of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadataResult {
    /// The stream the metadata belongs to.
    pub stream: String,
    /// Whether the stream has been deleted.
    pub is_stream_deleted: bool,
    /// Version of the metastream, -1 if no metadata has been written yet.
    pub meta_stream_version: i64,
    /// The metadata itself, empty when none has been written.
    pub metadata: StreamMetadata,
}

impl StreamMetadataResult {
    pub(crate) fn empty(stream: &str, is_stream_deleted: bool) -> Self {
        Self {
            stream: stream.to_owned(),
            is_stream_deleted,
            meta_stream_version: -1,
            metadata: StreamMetadata::default(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(role) => vec![role],
        OneOrMany::Many(roles) => roles,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_uses_server_property_names() {
        let metadata: StreamMetadata = serde_json::from_str(
            r#"{"$maxCount": 10, "$tb": 3, "$acl": {"$r": "$all", "$w": ["ops", "admin"]}, "owner": "billing"}"#,
        )
        .expect("metadata should deserialize");

        assert_eq!(Some(10), metadata.max_count);
        assert_eq!(Some(3), metadata.truncate_before);

        let acl = metadata.acl.clone().expect("acl should be present");
        assert_eq!(vec!["$all".to_owned()], acl.read_roles);
        assert_eq!(vec!["ops".to_owned(), "admin".to_owned()], acl.write_roles);
        assert_eq!(Some(&serde_json::json!("billing")), metadata.custom.get("owner"));

        let encoded = serde_json::to_value(&metadata).expect("metadata should serialize");
        assert_eq!(serde_json::json!(10), encoded["$maxCount"]);
        assert!(encoded.get("$maxAge").is_none());
    }

    #[test]
    fn metastream_name() {
        assert_eq!("$$orders", metastream_of("orders"));
    }
}
