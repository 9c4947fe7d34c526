// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope wire codec.
//!
//! The core only depends on [`EnvelopeCodec`]. [`JsonCodec`] is the default
//! implementation:
//!
//! ```text
//! {"read":   {"interval": 1.0, "objects": [{"id": "n1", "infoItems": [{"name": "temp"}]}]}}
//! {"write":  {"objects": [{"id": "n1", "infoItems": [{"name": "temp", "values": [{"text": "21.5"}]}]}]}}
//! {"cancel": {"requestIds": ["REQ0000001"]}}
//! {"response": {"results": [{"returnCode": 200, "requestId": "REQ0000001"}]}}
//! {}
//! ```

use crate::error::CodecError;
use crate::protocol::{CancelRequest, Envelope, Object, ReadRequest, Response, WriteRequest};
use serde::{Deserialize, Serialize};

/// Converts envelopes and data payloads to bytes and back.
pub trait EnvelopeCodec: Send + Sync {
    /// Decode one inbound envelope.
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;

    /// Encode one outbound envelope.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;

    /// Decode a bare data payload.
    fn decode_objects(&self, bytes: &[u8]) -> Result<Vec<Object>, CodecError>;

    /// Encode a bare data payload.
    fn encode_objects(&self, objects: &[Object]) -> Result<Vec<u8>, CodecError>;

    /// MIME type of the encoded bytes.
    fn content_type(&self) -> &'static str;
}

/// Inbound wire shape: every section optional, at most one may be set.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EnvelopeWire {
    #[serde(default)]
    read: Option<ReadRequest>,
    #[serde(default)]
    write: Option<WriteRequest>,
    #[serde(default)]
    cancel: Option<CancelRequest>,
    #[serde(default)]
    response: Option<Response>,
}

/// Outbound wire shape (borrowed, so encoding never clones payloads).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    read: Option<&'a ReadRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write: Option<&'a WriteRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel: Option<&'a CancelRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a Response>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ObjectsWire {
    #[serde(default)]
    objects: Vec<Object>,
}

#[derive(Serialize)]
struct ObjectsRef<'a> {
    objects: &'a [Object],
}

/// JSON envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        let wire: EnvelopeWire = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Decode(format!("Invalid JSON: {}", e)))?;

        let present = [
            wire.read.is_some(),
            wire.write.is_some(),
            wire.cancel.is_some(),
            wire.response.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if present > 1 {
            return Err(CodecError::Decode(
                "envelope carries more than one of read/write/cancel/response".into(),
            ));
        }

        if let Some(read) = wire.read {
            read.checked_period().map_err(CodecError::Decode)?;
            return Ok(Envelope::Read(read));
        }
        if let Some(write) = wire.write {
            return Ok(Envelope::Write(write));
        }
        if let Some(cancel) = wire.cancel {
            return Ok(Envelope::Cancel(cancel));
        }
        if let Some(response) = wire.response {
            return Ok(Envelope::Response(response));
        }
        Ok(Envelope::Empty)
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let mut wire = EnvelopeRef {
            read: None,
            write: None,
            cancel: None,
            response: None,
        };
        match envelope {
            Envelope::Read(r) => wire.read = Some(r),
            Envelope::Write(w) => wire.write = Some(w),
            Envelope::Cancel(c) => wire.cancel = Some(c),
            Envelope::Response(r) => wire.response = Some(r),
            Envelope::Empty => {}
        }
        serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_objects(&self, bytes: &[u8]) -> Result<Vec<Object>, CodecError> {
        let wire: ObjectsWire = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Decode(format!("Invalid JSON: {}", e)))?;
        Ok(wire.objects)
    }

    fn encode_objects(&self, objects: &[Object]) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&ObjectsRef { objects }).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InfoItem, RequestResult, ReturnCode, Value};

    #[test]
    fn parse_subscribe_read() {
        let json = br#"{"read": {"interval": 2, "objects": [{"id": "n1", "infoItems": [{"name": "temp"}]}]}}"#;
        match JsonCodec.decode(json).unwrap() {
            Envelope::Read(read) => {
                assert_eq!(read.interval, Some(2.0));
                assert_eq!(read.objects[0].id, "n1");
                assert_eq!(read.objects[0].item_names(), vec!["temp"]);
                assert!(read.request_ids.is_empty());
            }
            other => panic!("Expected Read, got {:?}", other),
        }
    }

    #[test]
    fn parse_write() {
        let json = br#"{"write": {"objects": [{"id": "n1", "infoItems": [{"name": "temp", "values": [{"text": "21.5", "timestamp": 1700000000}]}]}]}}"#;
        match JsonCodec.decode(json).unwrap() {
            Envelope::Write(write) => {
                let item = &write.objects[0].info_items[0];
                assert_eq!(item.values[0], Value::at("21.5", 1_700_000_000));
            }
            other => panic!("Expected Write, got {:?}", other),
        }
    }

    #[test]
    fn parse_cancel() {
        let json = br#"{"cancel": {"requestIds": ["REQ0000001", "REQ0000002"]}}"#;
        match JsonCodec.decode(json).unwrap() {
            Envelope::Cancel(cancel) => assert_eq!(cancel.request_ids.len(), 2),
            other => panic!("Expected Cancel, got {:?}", other),
        }
    }

    #[test]
    fn parse_empty_envelope() {
        assert_eq!(JsonCodec.decode(b"{}").unwrap(), Envelope::Empty);
    }

    #[test]
    fn reject_multiple_sections() {
        let json = br#"{"cancel": {"requestIds": []}, "write": {"objects": []}}"#;
        assert!(matches!(
            JsonCodec.decode(json),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn reject_malformed_bytes() {
        assert!(JsonCodec.decode(b"\xff\xfe<not json>").is_err());
        assert!(JsonCodec.decode(br#"{"subscribe": {}}"#).is_err());
        assert!(JsonCodec.decode(br#"{"read": {"interval": -1}}"#).is_err());
    }

    #[test]
    fn reject_out_of_range_interval() {
        let huge = br#"{"read":{"interval":1e20,"objects":[{"id":"n1"}]}}"#;
        assert!(matches!(JsonCodec.decode(huge), Err(CodecError::Decode(_))));

        let tiny = br#"{"read":{"interval":1e-12,"objects":[{"id":"n1"}]}}"#;
        assert!(matches!(JsonCodec.decode(tiny), Err(CodecError::Decode(_))));

        let zero = br#"{"read":{"interval":0,"objects":[{"id":"n1"}]}}"#;
        assert!(matches!(JsonCodec.decode(zero), Ok(Envelope::Read(_))));
    }

    #[test]
    fn encode_response_envelope() {
        let objects = vec![Object::new("n1").with_item(InfoItem::new("temp").with_value(Value::at("20", 5)))];
        let response = Response::single(
            RequestResult::success()
                .with_request_id("REQ0000003")
                .with_objects(objects),
        );

        let bytes = JsonCodec.encode(&Envelope::Response(response)).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(r#"{"response":"#));
        assert!(!text.contains("\"read\""));

        match JsonCodec.decode(&bytes).unwrap() {
            Envelope::Response(r) => {
                assert_eq!(r.primary_code(), ReturnCode::Success);
                assert_eq!(r.results[0].request_id.as_deref(), Some("REQ0000003"));
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn objects_payload() {
        let bytes = JsonCodec
            .encode_objects(&[Object::new("n1"), Object::new("n2")])
            .unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            r#"{"objects":[{"id":"n1"},{"id":"n2"}]}"#
        );

        let objects = JsonCodec.decode_objects(&bytes).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].id, "n2");
    }
}
