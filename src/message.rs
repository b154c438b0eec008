//! Defines the wire envelopes exchanged with the backend and their JSON encoding.
//!
//! Outbound requests are `{"function": name, "params": [...]}`. Inbound responses carry a
//! `result` and optionally `success` and `error`. With tagged correlation both directions
//! also carry a numeric `id`.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::*;

/// An outbound call: the function name and its ordered arguments.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub function: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// An inbound reply to a single call.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// `None` when the field is absent; an explicit `null` is `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A decoded inbound frame. The id is read separately so that a reply can still be
/// attributed to its call when the rest of the envelope is unusable.
#[derive(Debug)]
pub struct Inbound {
    pub id: Option<u64>,
    pub response: Result<Response>,
}

impl Request {
    /// Creates an untagged request.
    pub fn new(function: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: None,
            function: function.into(),
            params,
        }
    }

    /// Returns the request tagged with a correlation id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Serializes the request to its JSON text form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a request from JSON text. Used by backends and test peers.
    pub fn decode(text: &str) -> Result<Self> {
        match serde_json::from_str(text)? {
            Value::Object(map) => Ok(serde_json::from_value(Value::Object(map))?),
            _ => Err(RpcError::Protocol("request is not a JSON object".into())),
        }
    }
}

impl Response {
    /// Creates a successful response.
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// Creates a failure response in the `{"result": null, "success": false, "error": ...}`
    /// shape.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: Some(Value::Null),
            success: Some(false),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Returns the response tagged with a correlation id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Serializes the response to its JSON text form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interprets the envelope: `success == false` or a present `error` is a remote
    /// failure, otherwise the `result` field is the call's value.
    pub fn into_result(self) -> Result<Value> {
        if self.success == Some(false) || self.error.is_some() {
            return Err(RpcError::Remote(RemoteError {
                message: self
                    .error
                    .unwrap_or_else(|| "remote call failed".to_string()),
                result: self.result.unwrap_or(Value::Null),
            }));
        }
        self.result
            .ok_or_else(|| RpcError::MalformedResponse("missing result field".into()))
    }
}

impl Inbound {
    /// Decodes an inbound text frame. Never fails outright: problems are reported through
    /// `response`.
    pub fn decode(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return Self {
                    id: None,
                    response: Err(RpcError::MalformedResponse(e.to_string())),
                }
            }
        };
        let Value::Object(map) = value else {
            return Self {
                id: None,
                response: Err(RpcError::MalformedResponse(
                    "response is not a JSON object".into(),
                )),
            };
        };
        let id = map.get("id").and_then(Value::as_u64);
        let response = serde_json::from_value::<Response>(Value::Object(map))
            .map_err(|e| RpcError::MalformedResponse(e.to_string()));
        Self { id, response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new("echo", vec![json!(1), json!(2), json!(3)]);
        assert_eq!(
            request.encode().unwrap(),
            r#"{"function":"echo","params":[1,2,3]}"#
        );

        let tagged = Request::new("get_notes", vec![]).with_id(7);
        let value: Value = serde_json::from_str(&tagged.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"id": 7, "function": "get_notes", "params": []}));
    }

    #[test]
    fn test_request_decode() {
        let request = Request::decode(r#"{"function":"add_note"}"#).unwrap();
        assert_eq!(request, Request::new("add_note", vec![]));
        assert!(Request::decode(r#"["add_note", []]"#).is_err());
        assert!(Request::decode("not json").is_err());
    }

    #[test]
    fn test_response_results() {
        let ok = Inbound::decode(r#"{"result":[1,2,3]}"#);
        assert_eq!(ok.id, None);
        assert_eq!(ok.response.unwrap().into_result().unwrap(), json!([1, 2, 3]));

        let null = Inbound::decode(r#"{"result":null}"#);
        assert_eq!(null.response.unwrap().into_result().unwrap(), Value::Null);

        let tagged = Inbound::decode(r#"{"id":4,"result":"x","success":true}"#);
        assert_eq!(tagged.id, Some(4));
        assert_eq!(tagged.response.unwrap().into_result().unwrap(), json!("x"));
    }

    #[test]
    fn test_response_failures() {
        let failed = Inbound::decode(r#"{"result":null,"success":false,"error":"bad input"}"#)
            .response
            .unwrap()
            .into_result();
        match failed {
            Err(RpcError::Remote(RemoteError { message, result })) => {
                assert_eq!(message, "bad input");
                assert_eq!(result, Value::Null);
            }
            other => panic!("Expected remote error, got {:?}", other),
        }

        let error_only = Inbound::decode(r#"{"error":"boom"}"#).response.unwrap();
        assert!(matches!(error_only.into_result(), Err(RpcError::Remote(_))));

        let unsuccessful = Inbound::decode(r#"{"result":1,"success":false}"#).response.unwrap();
        match unsuccessful.into_result() {
            Err(RpcError::Remote(err)) => assert_eq!(err.result, json!(1)),
            other => panic!("Expected remote error, got {:?}", other),
        }

        let empty = Inbound::decode("{}").response.unwrap();
        assert!(matches!(
            empty.into_result(),
            Err(RpcError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_malformed_frames() {
        for text in ["", "{", "[1,2,3]", "42", r#""result""#] {
            let inbound = Inbound::decode(text);
            assert_eq!(inbound.id, None);
            assert!(matches!(
                inbound.response,
                Err(RpcError::MalformedResponse(_))
            ));
        }

        // The id survives even when the rest of the envelope does not parse.
        let bad_shape = Inbound::decode(r#"{"id":9,"success":"yes"}"#);
        assert_eq!(bad_shape.id, Some(9));
        assert!(bad_shape.response.is_err());
    }

    #[test]
    fn test_failure_constructor_encodes_expected_shape() {
        let text = Response::failure("bad input").encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"result": null, "success": false, "error": "bad input"})
        );
    }
}
