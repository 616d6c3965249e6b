//! Request dispatch.

use super::protocol::{PING, Request, Response};

/// Answers control-channel requests.
pub trait Handler: Send + Sync {
    /// Produces the reply for `request`.
    fn handle(&self, request: &Request) -> Response;
}

/// Handler for the methods an agent answers on its own subject.
#[derive(Clone, Copy, Debug, Default)]
pub struct AgentHandler;

impl Handler for AgentHandler {
    fn handle(&self, request: &Request) -> Response {
        match request.method.as_str() {
            PING => Response::pong(),
            other => Response::exception(format!("unknown message {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_yields_pong() {
        assert_eq!(AgentHandler.handle(&Request::ping("r")), Response::pong());
    }

    #[test]
    fn unknown_method_yields_exception() {
        let request = Request {
            method: String::from("apply"),
            ..Request::ping("r")
        };
        assert_eq!(
            AgentHandler.handle(&request),
            Response::exception("unknown message apply")
        );
    }
}
