use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Queue of user-script invocations appended by the control panel.
pub const SCRIPTS_QUEUE_ID: &str = "scripts_queue";
/// Queue of control-surface requests appended by the control panel.
pub const OBS_COMMANDS_ID: &str = "obs_commands";
/// Mirror of the control surface's current scene list and items.
pub const OBS_ID: &str = "obs";

pub const QUEUE_FIELD: &str = "queue";

fn is_false(value: &bool) -> bool {
    !*value
}

/// A JSON document as held by the store. Reserved keys use the `_` prefix,
/// everything else lives in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            fields: Map::new(),
        }
    }

    /// Empty queue document, as recreated on every server start.
    pub fn empty_queue(id: impl Into<String>) -> Self {
        Self::new(id).with_field(QUEUE_FIELD, Value::Array(Vec::new()))
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Items currently in the `queue` field. A missing or non-array field reads as empty.
    pub fn queue(&self) -> &[Value] {
        match self.fields.get(QUEUE_FIELD) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub fn set_queue(&mut self, items: Vec<Value>) {
        self.fields
            .insert(QUEUE_FIELD.to_string(), Value::Array(items));
    }
}

/// One entry of `scripts_queue.queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCall {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty_params")]
    pub params: Vec<Value>,
}

fn null_as_empty_params<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One entry of `obs_commands.queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

impl ControlCommand {
    /// Request payload sent to the surface; absent data becomes `{}`.
    pub fn request_data(&self) -> Value {
        match &self.request_data {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(data) => data.clone(),
        }
    }
}
