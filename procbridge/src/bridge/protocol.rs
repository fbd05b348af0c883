//! Wire protocol types for bridge-worker communication.
//!
//! One JSON object per line in each direction:
//! - **Request** (stdin): `{"id": ..., <payload fields>}`
//! - **Response** (stdout): `{"id": ..., <result fields>}` or `{"id": ..., "error": "..."}`

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation identifier attached to a request and echoed in its response.
///
/// UUID v4 so a value is never reused within the lifetime of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Course outline request understood by the topic worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRequest {
    pub main_topic: String,
    /// Kept as a string on the wire; the worker parses it.
    pub num_topics: String,
    #[serde(default)]
    pub subtopics: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TopicRequest {
    pub fn new(main_topic: impl Into<String>, num_topics: usize) -> Self {
        Self {
            main_topic: main_topic.into(),
            num_topics: num_topics.to_string(),
            subtopics: Vec::new(),
            kind: "default".to_string(),
        }
    }

    pub fn with_subtopics<I, S>(mut self, subtopics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subtopics = subtopics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// Message from bridge to worker.
///
/// Payload fields are flattened next to `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: RequestId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RequestMessage {
    /// Build a request from any payload that serializes to a JSON object.
    pub fn from_payload<P: Serialize + ?Sized>(
        id: RequestId,
        payload: &P,
    ) -> Result<Self, PayloadError> {
        match serde_json::to_value(payload).map_err(|e| PayloadError(e.to_string()))? {
            Value::Object(mut fields) => {
                // The correlation id always wins over a payload field of the same name.
                fields.remove("id");
                Ok(Self { id, fields })
            }
            other => Err(PayloadError(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode the payload fields into a typed request.
    pub fn payload<T: de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

/// Outcome carried by a response line.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(Value),
    Error(String),
}

/// Message from worker to bridge.
///
/// `{"id", "result": X}` carries `X`; `{"id", "error": "..."}` carries a worker
/// failure; any other shape carries every field except `id` as an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: RequestId,
    pub body: ResponseBody,
}

impl ResponseMessage {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id,
            body: ResponseBody::Result(result),
        }
    }

    pub fn error(id: RequestId, error: impl Into<String>) -> Self {
        Self {
            id,
            body: ResponseBody::Error(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.body {
            ResponseBody::Result(v) => Ok(v),
            ResponseBody::Error(e) => Err(e),
        }
    }

    fn from_object(mut fields: Map<String, Value>) -> Result<Self, String> {
        let id = match fields.remove("id") {
            Some(Value::String(s)) => {
                RequestId::parse(&s).map_err(|e| format!("invalid id {s:?}: {e}"))?
            }
            Some(other) => return Err(format!("id must be a string, got {}", json_kind(&other))),
            None => return Err("missing id".to_string()),
        };

        if let Some(Value::String(_)) = fields.get("error")
            && let Some(Value::String(error)) = fields.remove("error")
        {
            return Ok(Self::error(id, error));
        }

        if fields.len() == 1
            && let Some(result) = fields.remove("result")
        {
            return Ok(Self::result(id, result));
        }

        Ok(Self::result(id, Value::Object(fields)))
    }
}

impl Serialize for ResponseMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        match &self.body {
            ResponseBody::Result(result) => map.serialize_entry("result", result)?,
            ResponseBody::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResponseMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_object(fields).map_err(de::Error::custom)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
