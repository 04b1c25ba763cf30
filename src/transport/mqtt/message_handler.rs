//! Pure classification of `rumqttc` events
//!
//! The client's poll task only acts on [`EventRoute`] values; everything
//! IoT Hub specific about topics and payloads is decided here.

use super::connection::TopicBuilder;
use crate::transport::{InboundMessage, MethodRequest};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use serde_json::Value;
use std::collections::HashMap;
use url::form_urlencoded;

/// What the poll task should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck with a success code
    ConnectionAccepted,
    /// ConnAck with a failure code
    ConnectionRefused(String),
    /// Cloud-to-device message
    CloudMessage(InboundMessage),
    /// Direct-method request
    MethodInvoked(MethodRequest),
    /// A QoS 1 publish left with this packet id
    PublishSent(u16),
    /// The broker acknowledged this packet id
    PublishAcknowledged(u16),
    /// SubAck; `false` if any filter was rejected
    SubscriptionConfirmed { accepted: bool },
    /// Broker-initiated disconnect
    Disconnected,
    /// Our own disconnect went out
    DisconnectSent,
    /// Publish on a topic nothing subscribed to
    Unrouted(String),
    /// Pings and the like
    Other,
}

/// Pure routing decisions for IoT Hub MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event, topics: &TopicBuilder) -> EventRoute {
        match event {
            Event::Incoming(packet) => Self::route_incoming(packet, topics),
            Event::Outgoing(Outgoing::Publish(pkid)) if *pkid != 0 => EventRoute::PublishSent(*pkid),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::Other,
        }
    }

    fn route_incoming(packet: &Packet, topics: &TopicBuilder) -> EventRoute {
        match packet {
            Packet::ConnAck(connack) => match connack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAccepted,
                code => EventRoute::ConnectionRefused(format!("{code:?}")),
            },
            Packet::Publish(publish) => {
                Self::route_publish(&publish.topic, &publish.payload, topics)
            }
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged(puback.pkid),
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                accepted: suback
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            },
            Packet::Disconnect => EventRoute::Disconnected,
            _ => EventRoute::Other,
        }
    }

    /// Classify an inbound publish by topic
    pub fn route_publish(topic: &str, payload: &[u8], topics: &TopicBuilder) -> EventRoute {
        if let Some(request) = Self::parse_method_request(topic, payload) {
            return EventRoute::MethodInvoked(request);
        }
        if let Some(properties) = topic.strip_prefix(&topics.c2d_prefix()) {
            return EventRoute::CloudMessage(InboundMessage {
                payload: payload.to_vec(),
                properties: Self::parse_property_bag(properties),
            });
        }
        EventRoute::Unrouted(topic.to_string())
    }

    /// Parse `$iothub/methods/POST/{name}/?$rid={rid}`
    pub fn parse_method_request(topic: &str, payload: &[u8]) -> Option<MethodRequest> {
        let rest = topic.strip_prefix(TopicBuilder::METHODS_PREFIX)?;
        let (name, query) = rest.split_once("/?")?;
        if name.is_empty() {
            return None;
        }
        let request_id = form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "$rid")
            .map(|(_, value)| value.into_owned())?;

        Some(MethodRequest {
            name: name.to_string(),
            request_id,
            payload: Self::parse_method_payload(payload),
        })
    }

    /// Method bodies are JSON; an empty body is `null` and anything else
    /// unparsable is kept as a string
    pub fn parse_method_payload(payload: &[u8]) -> Value {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Value::Null;
        }
        serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
    }

    /// Decode a url-encoded `k=v&k2=v2` property bag
    pub fn parse_property_bag(bag: &str) -> HashMap<String, String> {
        form_urlencoded::parse(bag.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }
}
