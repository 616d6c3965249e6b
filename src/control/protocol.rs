//! Control-channel message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method answered by a live agent.
pub const PING: &str = "ping";

/// Reply a live agent sends to [`PING`].
pub const PONG: &str = "pong";

/// Subject an agent listens on.
#[must_use]
pub fn agent_subject(agent_id: &str) -> String {
    format!("agent.{agent_id}")
}

/// A request addressed to an agent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Request {
    /// Method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Subject the reply is published on.
    #[serde(default)]
    pub reply_to: String,
}

impl Request {
    /// Builds a liveness request.
    #[must_use]
    pub fn ping(reply_to: impl Into<String>) -> Self {
        Self {
            method: PING.to_owned(),
            arguments: Vec::new(),
            reply_to: reply_to.into(),
        }
    }
}

/// Failure detail carried by [`Response::Exception`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ExceptionBody {
    /// Human-readable reason.
    pub message: String,
}

/// An agent's reply: `{"value":...}` or `{"exception":{"message":...}}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    /// Successful result.
    Value(Value),
    /// Handler failure.
    Exception(ExceptionBody),
}

impl Response {
    /// The reply expected for [`PING`].
    #[must_use]
    pub fn pong() -> Self {
        Self::Value(Value::String(PONG.to_owned()))
    }

    /// Builds an exception reply.
    #[must_use]
    pub fn exception(message: impl Into<String>) -> Self {
        Self::Exception(ExceptionBody {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn ping_request_has_wire_shape() {
        let json = serde_json::to_value(Request::ping("director.987-654-321"))
            .unwrap_or_else(|err| panic!("serialise: {err}"));
        assert_eq!(
            json,
            serde_json::json!({"method":"ping","arguments":[],"reply_to":"director.987-654-321"})
        );
    }

    #[rstest]
    #[case(Response::pong(), r#"{"value":"pong"}"#)]
    #[case(Response::exception("boom"), r#"{"exception":{"message":"boom"}}"#)]
    fn responses_serialise_externally_tagged(#[case] response: Response, #[case] expected: &str) {
        let text = serde_json::to_string(&response).unwrap_or_else(|err| panic!("serialise: {err}"));
        assert_eq!(text, expected);
    }

    #[rstest]
    fn request_tolerates_missing_optional_fields() {
        let request: Request = serde_json::from_str(r#"{"method":"ping"}"#)
            .unwrap_or_else(|err| panic!("parse: {err}"));
        assert!(request.arguments.is_empty());
        assert!(request.reply_to.is_empty());
    }
}
