//! Envelope definitions for NodeLink.
//!
//! Every frame carries exactly one [`Envelope`], serialized as MessagePack with
//! named fields:
//!
//! ```text
//! {"Request":  {"id": 17, "q": "Ping", ...}}
//! {"Response": {"id": 17, ...}}
//! ```
//!
//! The `id` is the correlation key. All other fields belong to the node's
//! message schema and are carried as an open map of MessagePack values.

use std::collections::BTreeMap;

use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the correlation field inside a request or response.
pub const ID_FIELD: &str = "id";

/// Name of the query field used by the node's built-in requests.
pub const QUERY_FIELD: &str = "q";

/// Open payload of a request or response.
pub type Fields = BTreeMap<String, Value>;

/// Correlation identifier linking a request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Returns the raw numeric value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RequestId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A request sent to (or received from) a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation identifier.
    pub id: RequestId,
    /// Message fields other than `id`.
    #[serde(flatten)]
    pub fields: Fields,
}

impl Request {
    /// Creates a request, dropping any `id` key from `fields`.
    pub fn new(id: RequestId, mut fields: Fields) -> Self {
        fields.remove(ID_FIELD);
        Self { id, fields }
    }

    /// The node's ping request: `{"q": "Ping"}`.
    pub fn ping_fields() -> Fields {
        query_fields("Ping")
    }
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation identifier of the request this answers.
    pub id: RequestId,
    /// Message fields other than `id`.
    #[serde(flatten)]
    pub fields: Fields,
}

impl Response {
    /// Creates a response, dropping any `id` key from `fields`.
    pub fn new(id: RequestId, mut fields: Fields) -> Self {
        fields.remove(ID_FIELD);
        Self { id, fields }
    }

    /// Returns a field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// The unit carried by one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

impl Envelope {
    /// Correlation identifier of the wrapped message.
    pub fn id(&self) -> RequestId {
        match self {
            Envelope::Request(request) => request.id,
            Envelope::Response(response) => response.id,
        }
    }

    /// Returns true for `Response` envelopes.
    pub fn is_response(&self) -> bool {
        matches!(self, Envelope::Response(_))
    }

    /// Fields of the wrapped message.
    pub fn fields(&self) -> &Fields {
        match self {
            Envelope::Request(request) => &request.fields,
            Envelope::Response(response) => &response.fields,
        }
    }

    /// Serialize the envelope to MessagePack bytes (named fields).
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Builds `{"q": query}`.
pub fn query_fields(query: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(QUERY_FIELD.to_string(), Value::from(query));
    fields
}
