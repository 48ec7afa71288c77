//! Records exchanged between client and server.
//!
//! Field names and enum strings here are the wire contract. Operations and
//! responses carry an untyped JSON payload on the wire; [`Operation`] and
//! [`ServerEvent`] decode that payload exactly once, at the edge, so the rest
//! of the crate only ever sees typed values.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{OperationError, RejectedOperation, UnknownOperationType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
}

impl Identity {
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub nickname: String,
}

impl Conversation {
    /// A reference to a conversation known only by nickname. The server
    /// resolves it against its registry.
    pub fn named(nickname: impl Into<String>) -> Self {
        Self {
            id: Uuid::nil(),
            nickname: nickname.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation: Conversation,
    pub sender: Identity,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    AboutMe,
    Create,
    Subscribe,
    Message,
    List,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::AboutMe => "aboutme",
            OperationType::Create => "create",
            OperationType::Subscribe => "subscribe",
            OperationType::Message => "message",
            OperationType::List => "list",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = UnknownOperationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aboutme" => Ok(OperationType::AboutMe),
            "create" => Ok(OperationType::Create),
            "subscribe" => Ok(OperationType::Subscribe),
            "message" => Ok(OperationType::Message),
            "list" => Ok(OperationType::List),
            other => Err(UnknownOperationType(other.to_string())),
        }
    }
}

/// Payload of `create` and `subscribe`. Peers may send a whole
/// [`Conversation`]; only the nickname matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ConversationRequest {
    #[serde(default)]
    nickname: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OperationFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Value,
}

/// A client request, decoded from its wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create { nickname: String },
    Subscribe { nickname: String },
    Message(Message),
    List,
    /// Any `type` this server does not serve, kept verbatim.
    Unknown(String),
}

impl Operation {
    pub fn kind(&self) -> Option<OperationType> {
        match self {
            Operation::Create { .. } => Some(OperationType::Create),
            Operation::Subscribe { .. } => Some(OperationType::Subscribe),
            Operation::Message(_) => Some(OperationType::Message),
            Operation::List => Some(OperationType::List),
            Operation::Unknown(_) => None,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, RejectedOperation> {
        let OperationFrame { kind, message } = serde_json::from_slice(frame)
            .map_err(OperationError::malformed("operation"))
            .map_err(RejectedOperation::untyped)?;

        let parsed = kind.parse::<OperationType>().ok();
        let operation = match parsed {
            Some(OperationType::Create) => {
                conversation_request(message).map(|request| Operation::Create {
                    nickname: request.nickname,
                })
            }
            Some(OperationType::Subscribe) => {
                conversation_request(message).map(|request| Operation::Subscribe {
                    nickname: request.nickname,
                })
            }
            Some(OperationType::Message) => serde_json::from_value(message)
                .map(Operation::Message)
                .map_err(OperationError::malformed("message")),
            Some(OperationType::List) => Ok(Operation::List),
            // The handshake is a bare identity frame, so a typed `aboutme`
            // after it is as foreign as any other unknown type.
            Some(OperationType::AboutMe) | None => Ok(Operation::Unknown(kind)),
        };

        operation.map_err(|error| RejectedOperation {
            kind: parsed,
            error,
        })
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let (kind, message) = match self {
            Operation::Create { nickname } | Operation::Subscribe { nickname } => (
                self.kind().map(OperationType::as_str).unwrap_or_default(),
                serde_json::to_value(ConversationRequest {
                    nickname: nickname.clone(),
                })?,
            ),
            Operation::Message(message) => ("message", serde_json::to_value(message)?),
            Operation::List => ("list", empty_payload()),
            Operation::Unknown(kind) => (kind.as_str(), empty_payload()),
        };

        serde_json::to_vec(&OperationFrame {
            kind: kind.to_string(),
            message,
        })
    }
}

fn conversation_request(message: Value) -> Result<ConversationRequest, OperationError> {
    if message.is_null() {
        return Ok(ConversationRequest::default());
    }
    serde_json::from_value(message).map_err(OperationError::malformed("conversation"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Server-to-client envelope, used both for replies and for pushed messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, deserialize_with = "lenient_operation_type")]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub message: Value,
}

impl Response {
    pub fn ok(operation_type: Option<OperationType>, payload: Value) -> Self {
        Self {
            status: Status::Ok,
            operation_type,
            error: None,
            message: payload,
        }
    }

    pub fn ok_empty(operation_type: Option<OperationType>) -> Self {
        Self::ok(operation_type, empty_payload())
    }

    pub fn ok_with<T>(operation_type: OperationType, payload: &T) -> Result<Self, OperationError>
    where
        T: Serialize,
    {
        let payload = serde_json::to_value(payload).map_err(OperationError::Internal)?;
        Ok(Self::ok(Some(operation_type), payload))
    }

    pub fn error(operation_type: Option<OperationType>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            operation_type,
            error: Some(ErrorBody {
                message: message.into(),
            }),
            message: empty_payload(),
        }
    }

    pub fn payload<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.message)
    }

    pub fn has_payload(&self) -> bool {
        match &self.message {
            Value::Null => false,
            Value::Object(fields) => !fields.is_empty(),
            _ => true,
        }
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

// Older peers send `""` for "no operation"; anything unrecognised is simply
// not attributed to an operation.
fn lenient_operation_type<'de, D>(deserializer: D) -> Result<Option<OperationType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|kind| kind.parse().ok()))
}

/// What the client makes of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Welcome(Identity),
    Created(Conversation),
    Subscribed(Conversation),
    Conversations(Vec<Conversation>),
    Delivered(Message),
    /// A successful reply with nothing to show.
    Acknowledged(Option<OperationType>),
    Failed {
        operation: Option<OperationType>,
        message: String,
    },
}

impl TryFrom<Response> for ServerEvent {
    type Error = serde_json::Error;

    fn try_from(response: Response) -> Result<Self, Self::Error> {
        if response.status == Status::Error {
            let message = response
                .error
                .map(|error| error.message)
                .unwrap_or_else(|| "unspecified error".to_string());
            return Ok(ServerEvent::Failed {
                operation: response.operation_type,
                message,
            });
        }

        let event = match response.operation_type {
            Some(OperationType::AboutMe) => ServerEvent::Welcome(response.payload()?),
            Some(OperationType::Create) => ServerEvent::Created(response.payload()?),
            Some(OperationType::Subscribe) => ServerEvent::Subscribed(response.payload()?),
            Some(OperationType::List) => ServerEvent::Conversations(response.payload()?),
            Some(OperationType::Message) if response.has_payload() => {
                ServerEvent::Delivered(response.payload()?)
            }
            kind => ServerEvent::Acknowledged(kind),
        };

        Ok(event)
    }
}
