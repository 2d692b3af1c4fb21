//! Wire protocol
//!
//! Every message is an envelope `{"src", "dest", "body"}` written as one JSON object per line.
//! The body is kept as raw JSON on the envelope so that routing (by `msg_id`/`in_reply_to`)
//! never depends on the body being well-formed; typed decoding happens in the handlers.
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FloodcastError, Result};
use crate::node::NodeId;

/// Correlation identifier assigned by the sender of a request
pub type MsgId = u64;

/// Opaque value flooded through the cluster
pub type BroadcastValue = u64;

/// Transport-level envelope
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Value,
}

/// Typed message bodies
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Broadcast {
        message: BroadcastValue,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<BroadcastValue>,
    },
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Error {
        code: u32,
        text: String,
    },
}

impl Payload {
    /// Every `type` tag this protocol defines
    pub const KINDS: [&'static str; 9] = [
        "init",
        "init_ok",
        "broadcast",
        "broadcast_ok",
        "read",
        "read_ok",
        "topology",
        "topology_ok",
        "error",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Error { .. } => "error",
        }
    }

    pub fn error(err: &FloodcastError) -> Self {
        Payload::Error {
            code: err.error_code(),
            text: err.to_string(),
        }
    }
}

impl Message {
    /// Build an envelope, stamping the correlation fields into the body
    pub fn new(
        src: NodeId,
        dest: NodeId,
        payload: &Payload,
        msg_id: Option<MsgId>,
        in_reply_to: Option<MsgId>,
    ) -> Result<Self> {
        let mut body = serde_json::to_value(payload)?;
        if let Value::Object(fields) = &mut body {
            if let Some(id) = msg_id {
                fields.insert("msg_id".to_string(), Value::from(id));
            }
            if let Some(id) = in_reply_to {
                fields.insert("in_reply_to".to_string(), Value::from(id));
            }
        }
        Ok(Self { src, dest, body })
    }

    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The body's `type` tag, if present
    pub fn kind(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn msg_id(&self) -> Option<MsgId> {
        self.body.get("msg_id").and_then(Value::as_u64)
    }

    pub fn in_reply_to(&self) -> Option<MsgId> {
        self.body.get("in_reply_to").and_then(Value::as_u64)
    }

    /// Decode the body into a typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.body)?)
    }

    /// Decode into a `Payload`, telling unknown kinds apart from malformed bodies
    pub fn payload(&self) -> Result<Payload> {
        self.decode::<Payload>().map_err(|e| match self.kind() {
            Some(kind) if !Payload::KINDS.contains(&kind) => {
                FloodcastError::NotSupported(kind.to_string())
            }
            None => FloodcastError::Protocol("message body has no type".to_string()),
            _ => e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast_request() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"broadcast","message":1000,"msg_id":3}}"#;
        let msg = Message::parse(line).unwrap();

        assert_eq!(msg.src, NodeId::from("c1"));
        assert_eq!(msg.kind(), Some("broadcast"));
        assert_eq!(msg.msg_id(), Some(3));
        assert_eq!(msg.in_reply_to(), None);
        assert_eq!(msg.payload().unwrap(), Payload::Broadcast { message: 1000 });
    }

    #[test]
    fn test_reply_carries_correlation_fields() {
        let msg = Message::new(
            "n1".into(),
            "c1".into(),
            &Payload::BroadcastOk,
            Some(7),
            Some(3),
        )
        .unwrap();

        assert_eq!(
            msg.body,
            serde_json::json!({"type": "broadcast_ok", "msg_id": 7, "in_reply_to": 3})
        );
        // Correlation fields do not get in the way of typed decoding
        assert_eq!(msg.payload().unwrap(), Payload::BroadcastOk);
    }

    #[test]
    fn test_topology_body() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"topology","msg_id":1,
            "topology":{"n1":["n2","n3"],"n2":["n1"],"n3":["n1"]}}}"#;
        let msg = Message::parse(line).unwrap();

        match msg.payload().unwrap() {
            Payload::Topology { topology } => {
                assert_eq!(topology.len(), 3);
                assert_eq!(topology[&NodeId::from("n1")].len(), 2);
            }
            other => panic!("Wrong payload type: {:?}", other),
        }
    }

    #[test]
    fn test_read_ok_serialization() {
        let msg = Message::new(
            "n1".into(),
            "c1".into(),
            &Payload::ReadOk {
                messages: vec![1, 8, 72],
            },
            None,
            Some(4),
        )
        .unwrap();
        let line = msg.to_line().unwrap();

        assert!(line.contains(r#""type":"read_ok""#));
        assert!(line.contains(r#""messages":[1,8,72]"#));
        assert!(!line.contains("msg_id"));
    }

    #[test]
    fn test_unknown_kind_is_not_supported() {
        let msg = Message::parse(r#"{"src":"c1","dest":"n1","body":{"type":"cas","msg_id":1}}"#)
            .unwrap();
        assert!(matches!(
            msg.payload(),
            Err(FloodcastError::NotSupported(kind)) if kind == "cas"
        ));
    }

    #[test]
    fn test_malformed_body_is_serialization_error() {
        let msg = Message::parse(
            r#"{"src":"c1","dest":"n1","body":{"type":"broadcast","message":"five"}}"#,
        )
        .unwrap();
        assert!(matches!(
            msg.payload(),
            Err(FloodcastError::Serialization(_))
        ));

        let untyped =
            Message::parse(r#"{"src":"c1","dest":"n1","body":{"message":5}}"#).unwrap();
        assert!(matches!(untyped.payload(), Err(FloodcastError::Protocol(_))));
    }
}
