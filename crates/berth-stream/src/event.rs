//! Lifecycle events and their parse-time normalization.
//!
//! The daemon has emitted two shapes over time:
//!
//! - legacy: `{"status":"start","id":"abc","from":"img","time":1}`
//! - actor-style: `{"Action":"start","Type":"container","Actor":{"ID":"abc","Attributes":{"image":"img"}},...}`
//!
//! Newer daemons often send both field sets at once. Each line is parsed
//! once into [`Event`], whose `status`/`id`/`from` are filled from
//! whichever shape supplied them; nothing downstream inspects the raw
//! shape again.

use std::collections::BTreeMap;

use berth_common::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalized lifecycle notification.
///
/// Immutable once parsed; the monitor shares one instance between all
/// matching subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event kind, e.g. `create`, `start`, `die`.
    pub status: String,
    /// Subject identifier (container or image ID).
    pub id: String,
    /// Originating image, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Object type (`container`, `image`, `network`, ...), when sent.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Nanoseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_nano: Option<i64>,
    /// Actor attributes (labels, image, name, exit code, ...).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Fields not interpreted by the parser, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Parses one line of the event stream.
    ///
    /// Lines that do not start with `{` (blank keep-alives, stray text)
    /// yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a decode error if a `{`-prefixed line is not a valid event
    /// object.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if !line.starts_with('{') {
            return Ok(None);
        }
        let wire: WireEvent = serde_json::from_str(line)?;
        Ok(Some(wire.normalize()))
    }

    /// Returns the event time, preferring nanosecond precision.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.time_nano.map_or_else(
            || self.time.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            |nanos| Some(DateTime::from_timestamp_nanos(nanos)),
        )
    }

    /// Returns the container name attribute, if the daemon sent one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").map(String::as_str)
    }
}

/// Both wire shapes, as they may appear together on one line.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default, rename = "Action")]
    action: Option<String>,
    #[serde(default, rename = "Type")]
    kind: Option<String>,
    #[serde(default, rename = "Actor")]
    actor: Option<WireActor>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default, rename = "timeNano")]
    time_nano: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireActor {
    #[serde(default, rename = "ID")]
    id: Option<String>,
    #[serde(default, rename = "Attributes")]
    attributes: BTreeMap<String, String>,
}

impl WireEvent {
    fn normalize(self) -> Event {
        let actor = self.actor.unwrap_or_default();
        let from = self
            .from
            .filter(|f| !f.is_empty())
            .or_else(|| actor.attributes.get("image").cloned());
        Event {
            status: non_empty(self.status).or(self.action).unwrap_or_default(),
            id: non_empty(self.id).or(actor.id).unwrap_or_default(),
            from,
            kind: self.kind,
            time: self.time,
            time_nano: self.time_nano,
            attributes: actor.attributes,
            extra: self.extra,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
