// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway data model and envelope types.
//!
//! Two layers live here:
//!
//! - the store's own model ([`MeasurementKey`], [`DataPoint`], [`Update`])
//! - the envelope protocol ([`Envelope`], [`Response`], [`Object`] payloads)
//!
//! The envelope is a tagged union: exactly one of Read / Write / Cancel /
//! Response is active, or the envelope is [`Envelope::Empty`]. The codec picks
//! the variant once; nothing downstream re-inspects optional sections.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// (node, measurement) pair identifying one data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeasurementKey {
    pub node: String,
    pub measurement: String,
}

impl MeasurementKey {
    pub fn new(node: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            measurement: measurement.into(),
        }
    }
}

/// Latest sample of a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// Measurement name within the node
    pub measurement: String,
    /// Value as text (numeric values are carried as their text form)
    pub value: String,
    /// Unix seconds; values below 1 are replaced with "now" on write
    pub timestamp: i64,
}

impl DataPoint {
    /// Data point without a timestamp (stamped by the store).
    pub fn new(measurement: impl Into<String>, value: impl Into<String>) -> Self {
        Self::at(measurement, value, 0)
    }

    /// Data point with an explicit timestamp.
    pub fn at(measurement: impl Into<String>, value: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// One published value as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub node: String,
    pub measurement: String,
    pub value: String,
    pub timestamp: i64,
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Data payload
// ---------------------------------------------------------------------------

/// A node and the info items (measurements) carried for it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Object {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info_items: Vec<InfoItem>,
}

impl Object {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            info_items: Vec::new(),
        }
    }

    /// Builder: append an info item.
    pub fn with_item(mut self, item: InfoItem) -> Self {
        self.info_items.push(item);
        self
    }

    /// Names of the info items, in payload order.
    pub fn item_names(&self) -> Vec<String> {
        self.info_items.iter().map(|i| i.name.clone()).collect()
    }
}

/// A named measurement with zero or more values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InfoItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl InfoItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    /// Builder: append a value.
    pub fn with_value(mut self, value: Value) -> Self {
        self.values.push(value);
        self
    }
}

/// A value with an optional unix-seconds timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Value {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Value {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn at(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            timestamp: Some(timestamp),
        }
    }
}

/// Group a batch of updates into objects.
///
/// Nodes, items and values keep first-appearance order, so several updates of
/// one key become several values of one item, oldest first.
pub fn batch_to_objects(updates: Vec<Update>) -> Vec<Object> {
    let mut objects: Vec<Object> = Vec::new();

    for update in updates {
        let obj_idx = match objects.iter().position(|o| o.id == update.node) {
            Some(i) => i,
            None => {
                objects.push(Object::new(update.node.clone()));
                objects.len() - 1
            }
        };
        let object = &mut objects[obj_idx];

        let item_idx = match object
            .info_items
            .iter()
            .position(|i| i.name == update.measurement)
        {
            Some(i) => i,
            None => {
                object.info_items.push(InfoItem::new(update.measurement.clone()));
                object.info_items.len() - 1
            }
        };

        object.info_items[item_idx]
            .values
            .push(Value::at(update.value, update.timestamp));
    }

    objects
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Shortest accepted periodic delivery interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Read request: subscribe to described objects, or poll existing request ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadRequest {
    /// Delivery period in seconds; absent or 0 means no periodic delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<Object>,
}

impl ReadRequest {
    /// Validated delivery interval.
    ///
    /// `Ok(None)` when no periodic delivery was asked for (absent or 0).
    /// Negative, non-finite, sub-millisecond and out-of-range intervals are
    /// errors.
    pub fn checked_period(&self) -> Result<Option<Duration>, String> {
        let secs = match self.interval {
            None => return Ok(None),
            Some(secs) if secs == 0.0 => return Ok(None),
            Some(secs) => secs,
        };
        let period = Duration::try_from_secs_f64(secs)
            .map_err(|_| format!("invalid interval: {}", secs))?;
        if period < MIN_INTERVAL {
            return Err(format!(
                "interval {} is below the {} ms minimum",
                secs,
                MIN_INTERVAL.as_millis()
            ));
        }
        Ok(Some(period))
    }

    /// Periodic delivery interval, if one was requested and is valid.
    pub fn period(&self) -> Option<Duration> {
        self.checked_period().ok().flatten()
    }
}

/// Write request: latest values per node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteRequest {
    #[serde(default)]
    pub objects: Vec<Object>,
}

/// Cancel request: request ids to tear down.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CancelRequest {
    #[serde(default)]
    pub request_ids: Vec<String>,
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ReturnCode {
    Success,
    BadRequest,
    NotFound,
    InternalError,
}

impl ReturnCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::InternalError => 500,
        }
    }
}

impl From<ReturnCode> for u16 {
    fn from(rc: ReturnCode) -> Self {
        rc.code()
    }
}

impl TryFrom<u16> for ReturnCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Success),
            400 => Ok(Self::BadRequest),
            404 => Ok(Self::NotFound),
            500 => Ok(Self::InternalError),
            other => Err(format!("unknown return code {}", other)),
        }
    }
}

/// Outcome of one request (or one request id / node within a request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestResult {
    pub return_code: ReturnCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<Object>>,
}

impl RequestResult {
    fn with_code(return_code: ReturnCode) -> Self {
        Self {
            return_code,
            description: None,
            request_id: None,
            objects: None,
        }
    }

    pub fn success() -> Self {
        Self::with_code(ReturnCode::Success)
    }

    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::with_code(ReturnCode::BadRequest).with_description(description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::with_code(ReturnCode::NotFound).with_description(description)
    }

    pub fn internal_error(description: impl Into<String>) -> Self {
        Self::with_code(ReturnCode::InternalError).with_description(description)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_objects(mut self, objects: Vec<Object>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn is_success(&self) -> bool {
        self.return_code == ReturnCode::Success
    }
}

/// Response envelope body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Response {
    #[serde(default)]
    pub results: Vec<RequestResult>,
}

impl Response {
    pub fn single(result: RequestResult) -> Self {
        Self {
            results: vec![result],
        }
    }

    pub fn from_results(results: Vec<RequestResult>) -> Self {
        Self { results }
    }

    /// Return code of the first result (success for an empty response).
    pub fn primary_code(&self) -> ReturnCode {
        self.results
            .first()
            .map(|r| r.return_code)
            .unwrap_or(ReturnCode::Success)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Read(ReadRequest),
    Write(WriteRequest),
    Cancel(CancelRequest),
    Response(Response),
    /// No section present; acknowledged with success.
    Empty,
}

impl Envelope {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::Cancel(_) => "cancel",
            Self::Response(_) => "response",
            Self::Empty => "empty",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(node: &str, m: &str, v: &str, ts: i64) -> Update {
        Update {
            node: node.into(),
            measurement: m.into(),
            value: v.into(),
            timestamp: ts,
        }
    }

    #[test]
    fn test_batch_groups_by_node_and_item() {
        let batch = vec![
            update("n1", "temp", "20", 1),
            update("n2", "hum", "40", 2),
            update("n1", "temp", "21", 3),
            update("n1", "hum", "50", 4),
        ];

        let objects = batch_to_objects(batch);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].id, "n1");
        assert_eq!(objects[0].item_names(), vec!["temp", "hum"]);
        assert_eq!(
            objects[0].info_items[0].values,
            vec![Value::at("20", 1), Value::at("21", 3)]
        );
        assert_eq!(objects[1].id, "n2");
    }

    #[test]
    fn test_empty_batch() {
        assert!(batch_to_objects(Vec::new()).is_empty());
    }

    #[test]
    fn test_read_period() {
        let mut req = ReadRequest::default();
        assert_eq!(req.period(), None);

        req.interval = Some(0.0);
        assert_eq!(req.period(), None);

        req.interval = Some(1.5);
        assert_eq!(req.period(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_read_period_out_of_range() {
        let mut req = ReadRequest::default();
        for bad in [1e20, -1.0, f64::NAN, f64::INFINITY, 1e-12, 0.0005] {
            req.interval = Some(bad);
            assert!(req.checked_period().is_err(), "interval {} accepted", bad);
            assert_eq!(req.period(), None);
        }

        req.interval = Some(0.001);
        assert_eq!(req.checked_period(), Ok(Some(MIN_INTERVAL)));
    }

    #[test]
    fn test_return_code_serialization() {
        let result = RequestResult::not_found("gone").with_request_id("REQ0000007");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"returnCode\":404"));
        assert!(json.contains("REQ0000007"));

        let parsed: RequestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.return_code, ReturnCode::NotFound);
    }

    #[test]
    fn test_unknown_return_code_rejected() {
        let json = r#"{"returnCode": 418}"#;
        assert!(serde_json::from_str::<RequestResult>(json).is_err());
    }
}
