use super::SessionError;
use crate::entity::EntityStateMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Free-form subscription options, compared structurally
pub type SubscriptionOptions = Map<String, Value>;

/// Message topics understood by session ports
///
/// `context.*` topics are legacy aliases of the matching `entity.*` topics;
/// providers bind the same handler to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "entity.subscribe")]
    EntitySubscribe,
    #[serde(rename = "context.subscribe")]
    ContextSubscribe,
    #[serde(rename = "entity.unsubscribe")]
    EntityUnsubscribe,
    #[serde(rename = "context.unsubscribe")]
    ContextUnsubscribe,
    #[serde(rename = "entity.subscribed")]
    EntitySubscribed,
    #[serde(rename = "entity.unsubscribed")]
    EntityUnsubscribed,
    #[serde(rename = "entity.frame")]
    EntityFrame,
}

impl Topic {
    /// Topics a subscribe request may arrive on
    pub const SUBSCRIBE: [Topic; 2] = [Topic::EntitySubscribe, Topic::ContextSubscribe];

    /// Topics an unsubscribe message may arrive on
    pub const UNSUBSCRIBE: [Topic; 2] = [Topic::EntityUnsubscribe, Topic::ContextUnsubscribe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::EntitySubscribe => "entity.subscribe",
            Topic::ContextSubscribe => "context.subscribe",
            Topic::EntityUnsubscribe => "entity.unsubscribe",
            Topic::ContextUnsubscribe => "context.unsubscribe",
            Topic::EntitySubscribed => "entity.subscribed",
            Topic::EntityUnsubscribed => "entity.unsubscribed",
            Topic::EntityFrame => "entity.frame",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity.subscribe" => Ok(Topic::EntitySubscribe),
            "context.subscribe" => Ok(Topic::ContextSubscribe),
            "entity.unsubscribe" => Ok(Topic::EntityUnsubscribe),
            "context.unsubscribe" => Ok(Topic::ContextUnsubscribe),
            "entity.subscribed" => Ok(Topic::EntitySubscribed),
            "entity.unsubscribed" => Ok(Topic::EntityUnsubscribed),
            "entity.frame" => Ok(Topic::EntityFrame),
            other => Err(format!("unknown topic '{}'", other)),
        }
    }
}

/// Consumer → Provider: subscribe to entity updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SubscriptionOptions>,
}

/// Consumer → Provider: unsubscribe from entity updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub id: String,
}

/// Provider → Consumer: a subscription became active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribedNotice {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SubscriptionOptions>,
}

/// Provider → Consumer: a subscription ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribedNotice {
    pub id: String,
}

/// Provider → Consumer: entity states for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStateMessage {
    pub time: DateTime<Utc>,
    pub entities: EntityStateMap,
}

/// Unit of transport between two session ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request {
        id: u64,
        topic: Topic,
        payload: Value,
    },
    Response {
        id: u64,
        result: Result<Value, SessionError>,
    },
    Message {
        topic: Topic,
        payload: Value,
    },
}
