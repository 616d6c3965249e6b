//! Agent side of the control channel.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::BusError;
use super::bus::{MessageBus, Subscription};
use super::handler::Handler;
use super::protocol::{Request, Response, agent_subject};

/// Answers requests published on `agent.<id>`.
#[derive(Clone)]
pub struct AgentListener {
    agent_id: String,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for AgentListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentListener")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl AgentListener {
    /// Creates a listener for `agent_id`.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            agent_id: agent_id.into(),
            handler,
        }
    }

    /// Subject requests arrive on.
    #[must_use]
    pub fn subject(&self) -> String {
        agent_subject(&self.agent_id)
    }

    /// Subscribes to the agent subject.
    ///
    /// # Errors
    ///
    /// Returns the bus error when subscribing fails.
    pub async fn listen<B: MessageBus + ?Sized>(&self, bus: &B) -> Result<Subscription, BusError> {
        let subject = self.subject();
        let subscription = bus.subscribe(&subject).await?;
        info!(subject = %subject, "listening for control requests");
        Ok(subscription)
    }

    /// Replies to every request on `subscription` until the bus closes.
    ///
    /// # Errors
    ///
    /// Returns the bus error when a reply cannot be published.
    pub async fn serve<B: MessageBus + ?Sized>(
        &self,
        bus: &B,
        mut subscription: Subscription,
    ) -> Result<(), BusError> {
        while let Some(message) = subscription.next().await {
            let request: Request = match serde_json::from_slice(&message.payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "discarding malformed control request");
                    continue;
                }
            };
            if request.reply_to.is_empty() {
                warn!(method = %request.method, "control request without reply_to");
                continue;
            }
            let response: Response = self.handler.handle(&request);
            let payload = serde_json::to_vec(&response).map_err(|err| BusError::Protocol {
                message: err.to_string(),
            })?;
            bus.publish(&request.reply_to, payload).await?;
            debug!(method = %request.method, reply_to = %request.reply_to, "answered control request");
        }
        Ok(())
    }

    /// Subscribes and serves until the bus closes.
    ///
    /// # Errors
    ///
    /// Returns the bus error when subscribing or replying fails.
    pub async fn run<B: MessageBus + ?Sized>(&self, bus: &B) -> Result<(), BusError> {
        let subscription = self.listen(bus).await?;
        self.serve(bus, subscription).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::control::bus::MemoryBus;
    use crate::control::handler::AgentHandler;

    #[tokio::test]
    async fn replies_on_reply_to_subject() {
        let bus = Arc::new(MemoryBus::new());
        let listener = AgentListener::new("123", Arc::new(AgentHandler));
        let subscription = listener
            .listen(bus.as_ref())
            .await
            .unwrap_or_else(|err| panic!("listen: {err}"));
        let serving_bus = Arc::clone(&bus);
        let server = tokio::spawn(async move { listener.serve(serving_bus.as_ref(), subscription).await });

        let mut replies = bus
            .subscribe("director.1")
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        let request = serde_json::to_vec(&Request::ping("director.1"))
            .unwrap_or_else(|err| panic!("encode: {err}"));
        bus.publish("agent.123", request)
            .await
            .unwrap_or_else(|err| panic!("publish: {err}"));

        let reply = replies
            .next_timeout(Duration::from_secs(1))
            .await
            .unwrap_or_else(|err| panic!("reply: {err}"));
        server.abort();
        assert_eq!(reply.payload, br#"{"value":"pong"}"#.to_vec());
    }
}
