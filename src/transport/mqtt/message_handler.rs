//! Routing of raw MQTT events
//!
//! Pure mapping from `rumqttc` events to what the event-loop driver does
//! with them.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged {
                    session_present: ack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    filters: suback.return_codes.len(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged { session_present: bool },
    MessageReceived { topic: String, payload: Bytes },
    /// Broker closed the session
    Disconnected,
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_connack_routes_to_acknowledged() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                session_present: false
            }
        );
    }

    #[test]
    fn test_publish_routes_to_message() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: Bytes::from("SiteWhere/system/dev-1"),
            pkid: 7,
            payload: Bytes::from_static(&[0x02, 0x08, 0x00]),
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "SiteWhere/system/dev-1".to_string(),
                payload: Bytes::from_static(&[0x02, 0x08, 0x00]),
            }
        );
    }

    #[test]
    fn test_disconnect_routes_to_disconnected() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }
}
