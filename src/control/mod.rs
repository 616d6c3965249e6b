//! Control channel between the director and the agent.
//!
//! Requests and responses are JSON objects carried over a subject-based
//! publish/subscribe bus. The agent listens on `agent.<id>` and answers on
//! the subject named by each request's `reply_to`.

pub mod bus;
pub mod handler;
pub mod listener;
pub mod liveness;
pub mod protocol;
pub mod tcp;

use thiserror::Error;

pub use bus::{BusFuture, MemoryBus, Message, MessageBus, Subscription};
pub use handler::{AgentHandler, Handler};
pub use listener::AgentListener;
pub use liveness::{LivenessCheck, LivenessError, LivenessReport, LivenessTiming};
pub use protocol::{Request, Response, agent_subject};
pub use tcp::{BusServer, TcpBus};

/// Errors raised by bus transports.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BusError {
    /// The broker could not be reached or bound.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Broker address.
        address: String,
        /// Socket error.
        message: String,
    },
    /// Reading or writing the connection failed.
    #[error("bus i/o failed: {message}")]
    Io {
        /// Socket error.
        message: String,
    },
    /// A frame or payload could not be encoded.
    #[error("malformed bus frame: {message}")]
    Protocol {
        /// Encoding error.
        message: String,
    },
    /// Nothing arrived on a subscription in time.
    #[error("no message on {subject} within {waited_ms}ms")]
    Timeout {
        /// Subscribed subject.
        subject: String,
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// The connection closed under a subscription.
    #[error("bus connection closed")]
    Closed,
}
