use std::fmt;

use bytes::Bytes;
use serde::de::{Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::errors::RouteError;

const NULL_PAYLOAD: &[u8] = b"null";

/// Wire shape of an inbound message. Only `channel` is interpreted; the
/// payload stays a raw JSON fragment so it is never re-validated here.
struct WireEnvelope<'de> {
    channel: String,
    payload: Option<&'de RawValue>,
}

impl<'de> Deserialize<'de> for WireEnvelope<'de> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(WireVisitor)
    }
}

struct WireVisitor;

impl<'de> Visitor<'de> for WireVisitor {
    type Value = WireEnvelope<'de>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object with a string `channel` field")
    }

    // Repeated keys overwrite: the last `channel` / `payload` wins.
    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut channel = None;
        let mut payload = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "channel" => channel = Some(map.next_value::<String>()?),
                "payload" => payload = Some(map.next_value::<&'de RawValue>()?),
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        let channel = channel.ok_or_else(|| serde::de::Error::missing_field("channel"))?;
        Ok(WireEnvelope { channel, payload })
    }
}

/// A decoded `{channel, payload}` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    /// Exact JSON text of the `payload` field (`null` when absent).
    pub payload: Bytes,
}

impl Envelope {
    /// Decode the first JSON value of one inbound message. Anything after
    /// it is ignored, as are unknown top-level fields.
    pub fn decode(raw: &[u8]) -> Result<Self, RouteError> {
        let wire = serde_json::Deserializer::from_slice(raw)
            .into_iter::<WireEnvelope<'_>>()
            .next()
            .ok_or(RouteError::Empty)??;
        let payload = match wire.payload {
            Some(raw) => Bytes::copy_from_slice(raw.get().as_bytes()),
            None => Bytes::from_static(NULL_PAYLOAD),
        };
        Ok(Self {
            channel: wire.channel,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string_payload_verbatim() {
        let env = Envelope::decode(br#"{"channel":"dp","payload":"hi"}"#).unwrap();
        assert_eq!(env.channel, "dp");
        assert_eq!(env.payload, Bytes::from_static(b"\"hi\""));
    }

    #[test]
    fn nested_payload_is_forwarded_unmodified() {
        let env = Envelope::decode(br#"{"channel":"dp","payload":{"a": [1, 2,  3]}}"#).unwrap();
        assert_eq!(env.payload, Bytes::from_static(br#"{"a": [1, 2,  3]}"#));
    }

    #[test]
    fn missing_or_null_payload_becomes_null() {
        let missing = Envelope::decode(br#"{"channel":"dp"}"#).unwrap();
        assert_eq!(missing.payload, Bytes::from_static(b"null"));
        let null = Envelope::decode(br#"{"channel":"dp","payload":null}"#).unwrap();
        assert_eq!(null.payload, Bytes::from_static(b"null"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let env =
            Envelope::decode(br#"{"id":7,"channel":"x","payload":1,"extra":{"k":"v"}}"#).unwrap();
        assert_eq!(env.channel, "x");
        assert_eq!(env.payload, Bytes::from_static(b"1"));
    }

    #[test]
    fn repeated_keys_keep_last_value() {
        let env =
            Envelope::decode(br#"{"channel":"x","payload":1,"channel":"dp","payload":[2]}"#)
                .unwrap();
        assert_eq!(env.channel, "dp");
        assert_eq!(env.payload, Bytes::from_static(b"[2]"));
    }

    #[test]
    fn only_first_value_is_read() {
        let env = Envelope::decode(br#"{"channel":"dp","payload":3}{"#).unwrap();
        assert_eq!(env.channel, "dp");
        assert_eq!(env.payload, Bytes::from_static(b"3"));

        let env = Envelope::decode(br#" {"channel":"a"} {"channel":"b"}"#).unwrap();
        assert_eq!(env.channel, "a");
    }

    #[test]
    fn empty_channel_is_valid() {
        let env = Envelope::decode(br#"{"channel":"","payload":true}"#).unwrap();
        assert_eq!(env.channel, "");
    }

    #[test]
    fn missing_channel_is_rejected() {
        let err = Envelope::decode(br#"{"payload":1}"#).unwrap_err();
        assert!(matches!(err, RouteError::Decode(_)));
    }

    #[test]
    fn non_string_channel_is_rejected() {
        assert!(Envelope::decode(br#"{"channel":5,"payload":1}"#).is_err());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(Envelope::decode(b"[1,2]").is_err());
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"channel":"dp","payload":"#).is_err());
    }

    #[test]
    fn empty_message_is_rejected() {
        assert!(matches!(Envelope::decode(b""), Err(RouteError::Empty)));
        assert!(matches!(Envelope::decode(b" \n\t"), Err(RouteError::Empty)));
    }
}
