//! The wire message shape of the simulator protocol.
//!
//! Every frame on the channel is a JSON array `[kind, id, payload]`
//! with `kind` 0 (request), 1 (success) or 2 (failure). A request
//! payload is `[method, args, kwargs]`; a success payload is the
//! method's return value; a failure payload is a human-readable string.
//! Framing (a 4-byte big-endian length prefix) is the transport
//! layer's concern, not this module's.

use serde_json::{Map, Value, json};

/// Message kind tag: request.
pub const KIND_REQUEST: u64 = 0;
/// Message kind tag: successful reply.
pub const KIND_SUCCESS: u64 = 1;
/// Message kind tag: failed reply.
pub const KIND_FAILURE: u64 = 2;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A method invocation, in either direction.
    Request {
        /// Correlation ID chosen by the requesting side.
        id: u64,
        /// The method to invoke.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: Map<String, Value>,
    },
    /// The reply to the request with the same ID.
    Success {
        /// Correlation ID of the request this answers.
        id: u64,
        /// The return value.
        payload: Value,
    },
    /// The failure reply to the request with the same ID.
    Failure {
        /// Correlation ID of the request this answers.
        id: u64,
        /// Human-readable description of what went wrong.
        message: String,
    },
}

impl Frame {
    /// The correlation ID.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request { id, .. } | Frame::Success { id, .. } | Frame::Failure { id, .. } => {
                *id
            }
        }
    }

    /// Encode into the `[kind, id, payload]` wire value.
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Request {
                id,
                method,
                args,
                kwargs,
            } => json!([KIND_REQUEST, id, [method, args, kwargs]]),
            Frame::Success { id, payload } => json!([KIND_SUCCESS, id, payload]),
            Frame::Failure { id, message } => json!([KIND_FAILURE, id, message]),
        }
    }

    /// Decode a wire value. Returns a short reason when the frame does
    /// not follow the protocol.
    pub fn from_value(value: Value) -> Result<Frame, String> {
        let Value::Array(parts) = value else {
            return Err("frame is not an array".into());
        };
        let [kind, id, payload] = <[Value; 3]>::try_from(parts)
            .map_err(|parts| format!("frame has {} elements, expected 3", parts.len()))?;
        let kind = kind.as_u64().ok_or("frame kind is not an integer")?;
        let id = id.as_u64().ok_or("frame id is not an integer")?;
        match kind {
            KIND_REQUEST => {
                let Value::Array(call) = payload else {
                    return Err("request payload is not an array".into());
                };
                let [method, args, kwargs] = <[Value; 3]>::try_from(call)
                    .map_err(|_| "request payload must be [method, args, kwargs]".to_owned())?;
                let Value::String(method) = method else {
                    return Err("request method is not a string".into());
                };
                let Value::Array(args) = args else {
                    return Err("request args are not an array".into());
                };
                let Value::Object(kwargs) = kwargs else {
                    return Err("request kwargs are not an object".into());
                };
                Ok(Frame::Request {
                    id,
                    method,
                    args,
                    kwargs,
                })
            }
            KIND_SUCCESS => Ok(Frame::Success { id, payload }),
            KIND_FAILURE => Ok(Frame::Failure {
                id,
                message: match payload {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            }),
            other => Err(format!("unknown frame kind {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let frame = Frame::Request {
            id: 7,
            method: "step".into(),
            args: vec![json!(3), json!({}), json!(10)],
            kwargs: Map::new(),
        };
        let back = Frame::from_value(frame.to_value()).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn wire_shape_is_positional() {
        let frame = Frame::Success {
            id: 1,
            payload: json!({"eid": {"attr": 4}}),
        };
        assert_eq!(frame.to_value(), json!([1, 1, {"eid": {"attr": 4}}]));
    }

    #[test]
    fn failure_payload_is_a_string() {
        let back = Frame::from_value(json!([2, 9, "boom"])).unwrap();
        assert_eq!(
            back,
            Frame::Failure {
                id: 9,
                message: "boom".into()
            }
        );
    }

    #[test]
    fn malformed_frames_are_reported() {
        assert!(Frame::from_value(json!({"not": "array"})).is_err());
        assert!(Frame::from_value(json!([0, 1])).is_err());
        assert!(Frame::from_value(json!([5, 1, "x"])).is_err());
        assert!(Frame::from_value(json!([0, 1, ["m", "notargs", {}]])).is_err());
    }
}
