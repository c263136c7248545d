use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

pub const USERS_NODE: &str = "Users";
pub const EVENTS_NODE: &str = "Events";
pub const FIELD_DESCRIPTION: &str = "Description";
pub const FIELD_START_TIME: &str = "Start Time";
pub const FIELD_END_TIME: &str = "End Time";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user-created record. `name` is the storage key, so two events with the
/// same name are the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub description: String,
    pub start_time: String,
    pub end_time: String,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            start_time: start_time.into(),
            end_time: end_time.into(),
        }
    }

    /// Field map written under `Users/{uid}/Events/{name}`.
    pub fn fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FIELD_DESCRIPTION.to_string(), self.description.clone()),
            (FIELD_START_TIME.to_string(), self.start_time.clone()),
            (FIELD_END_TIME.to_string(), self.end_time.clone()),
        ])
    }

    /// Rebuilds an event from a stored branch. Missing fields read as empty
    /// strings; non-leaf children are ignored.
    pub fn from_node(name: impl Into<String>, node: &Node) -> Option<Self> {
        let Node::Branch(children) = node else {
            return None;
        };
        let field = |key: &str| {
            children
                .get(key)
                .and_then(Node::as_value)
                .unwrap_or_default()
                .to_string()
        };
        Some(Self {
            name: name.into(),
            description: field(FIELD_DESCRIPTION),
            start_time: field(FIELD_START_TIME),
            end_time: field(FIELD_END_TIME),
        })
    }
}

/// Slash-free address of a node in the hierarchical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn user_events(user_id: &UserId) -> Self {
        Self::new([USERS_NODE, user_id.as_str(), EVENTS_NODE])
    }

    pub fn user_event(user_id: &UserId, event_name: &str) -> Self {
        Self::user_events(user_id).child(event_name)
    }

    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Snapshot of a subtree. Branch children enumerate in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Value(String),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        Node::Branch(
            fields
                .into_iter()
                .map(|(key, value)| (key, Node::Value(value)))
                .collect(),
        )
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Node::Value(value) => Some(value),
            Node::Branch(_) => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Value(_) => None,
            Node::Branch(children) => Some(children),
        }
    }

    pub fn get(&self, path: &StorePath) -> Option<&Node> {
        let mut current = self;
        for segment in path.segments() {
            current = current.children()?.get(segment)?;
        }
        Some(current)
    }

    /// Converts a realtime-database JSON document. `null` and empty objects
    /// are absent nodes; non-string scalars keep their JSON text.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) => Some(Node::Value(text)),
            serde_json::Value::Object(map) => {
                let children: BTreeMap<String, Node> = map
                    .into_iter()
                    .filter_map(|(key, value)| Node::from_json(value).map(|node| (key, node)))
                    .collect();
                if children.is_empty() {
                    None
                } else {
                    Some(Node::Branch(children))
                }
            }
            serde_json::Value::Array(items) => {
                let children: BTreeMap<String, Node> = items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, value)| {
                        Node::from_json(value).map(|node| (index.to_string(), node))
                    })
                    .collect();
                if children.is_empty() {
                    None
                } else {
                    Some(Node::Branch(children))
                }
            }
            other => Some(Node::Value(other.to_string())),
        }
    }
}
