//! Wire packets.
//!
//! `data` is deliberately untyped: the system routes packets, it does not
//! inspect them, and event families do not share a schema.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Message coming from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: String,
    pub receiver: String,
    pub event_name: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl Packet {
    /// Inbound packets need an id and an event name; anything else is the
    /// handler's business.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.event_name.is_empty()
    }
}

/// Message going out from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutPacket {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub event_name: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl OutPacket {
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && !self.sender.is_empty()
            && !self.receiver.is_empty()
            && !self.event_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn packet_round_trip_preserves_all_fields() {
        let packet = Packet {
            id: "m1".to_owned(),
            receiver: "alice".to_owned(),
            event_name: "chat".to_owned(),
            data: json!({"text": "hi", "attachments": [1, 2]}),
        };

        let encoded = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn out_packet_round_trip_preserves_all_fields() {
        let packet = OutPacket {
            id: "m1".to_owned(),
            sender: "bob".to_owned(),
            receiver: "alice".to_owned(),
            event_name: "chat".to_owned(),
            data: json!("hi"),
        };

        let encoded = serde_json::to_string(&packet).unwrap();
        assert!(encoded.contains("\"sender\":\"bob\""));
        assert!(encoded.contains("\"receiver\":\"alice\""));

        let decoded: OutPacket = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn missing_data_field_decodes_as_null() {
        let packet: Packet =
            serde_json::from_str(r#"{"id":"m1","receiver":"a","event_name":"chat"}"#).unwrap();
        assert_eq!(packet.data, JsonValue::Null);
        assert!(packet.is_valid());
    }

    #[test]
    fn validation_requires_the_addressing_fields() {
        let mut packet = Packet {
            id: "m1".to_owned(),
            receiver: String::new(),
            event_name: "chat".to_owned(),
            data: JsonValue::Null,
        };
        // Inbound packets may omit the receiver.
        assert!(packet.is_valid());
        packet.id.clear();
        assert!(!packet.is_valid());

        let outgoing = OutPacket {
            id: "m1".to_owned(),
            sender: "bob".to_owned(),
            receiver: String::new(),
            event_name: "chat".to_owned(),
            data: JsonValue::Null,
        };
        assert!(!outgoing.is_valid());
    }
}
