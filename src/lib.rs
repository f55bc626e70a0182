//! Client for the EventStore HTTP API.
//!
//! The crate exposes:
//!
//! * the Store API ([`store`]): reads, appends, deletes, stream metadata and
//!   persistent subscription groups, implemented over HTTP by [`http::Client`]
//!   and in memory by [`inmemory::InMemory`];
//! * subscriptions built on top of any Store API implementation
//!   ([`subscription`]): volatile, catch-up and persistent.
//!
//! ```no_run
//! use eventstore_http::http::Client;
//! use eventstore_http::settings::Settings;
//! use eventstore_http::store::Writer;
//! use eventstore_http::{EventData, ExpectedVersion};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Settings::from_env()?)?;
//! let event = EventData::json("OrderPlaced", &serde_json::json!({ "id": "o-1" }))?;
//!
//! client
//!     .append_to_stream("orders-o-1", ExpectedVersion::NoStream, vec![event])
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code, trivial_casts)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod event;
pub mod http;
pub mod inmemory;
pub mod metadata;
pub mod settings;
pub mod store;
pub mod subscription;
pub mod tracing;
pub mod version;

pub use crate::error::{Error, Result};
pub use crate::event::{
    EventData, Position, RecordedEvent, ResolvedEvent, SliceReadStatus, STREAM_END, STREAM_START,
};
pub use crate::store::{ReadOptions, Store};
pub use crate::subscription::{DropData, SubscribeExt, SubscriptionDropReason};
pub use crate::version::ExpectedVersion;
