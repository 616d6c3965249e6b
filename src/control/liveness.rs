//! End-to-end liveness probe.
//!
//! Each attempt connects, subscribes to a fresh reply subject, publishes a
//! ping to `agent.<id>` and waits for `{"value":"pong"}`. Failed attempts
//! are retried at a fixed interval until the observation window closes; an
//! attempt still in flight when the window closes is abandoned.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::BusError;
use super::bus::MessageBus;
use super::protocol::{Request, agent_subject};
use super::tcp::TcpBus;

/// The only reply accepted as proof of life, byte for byte.
pub const PONG_REPLY: &[u8] = br#"{"value":"pong"}"#;

/// Timing for [`LivenessCheck`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LivenessTiming {
    /// Overall observation window.
    pub window: Duration,
    /// Delay between attempts.
    pub interval: Duration,
    /// Wait for a reply within one attempt.
    pub reply_timeout: Duration,
}

impl Default for LivenessTiming {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// Successful probe outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LivenessReport {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Time from the first attempt to the pong.
    pub elapsed: Duration,
}

/// The agent did not answer within the window.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LivenessError {
    /// No attempt observed the expected reply.
    #[error("agent did not answer ping after {attempts} attempts: {last_observation}")]
    NoPong {
        /// Attempts made.
        attempts: u32,
        /// What the final attempt saw instead.
        last_observation: String,
    },
}

/// Probe that pings one agent over the control channel.
#[derive(Clone, Debug)]
pub struct LivenessCheck {
    agent_id: String,
    timing: LivenessTiming,
}

impl LivenessCheck {
    /// Creates a check for `agent_id`.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, timing: LivenessTiming) -> Self {
        Self {
            agent_id: agent_id.into(),
            timing,
        }
    }

    /// Runs the check against the broker at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`LivenessError::NoPong`] when the window elapses.
    pub async fn run_tcp(&self, address: &str) -> Result<LivenessReport, LivenessError> {
        self.run(|| TcpBus::connect(address)).await
    }

    /// Runs the check, opening a fresh connection through `connect` for
    /// every attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LivenessError::NoPong`] when the window elapses.
    pub async fn run<B, C, Fut>(&self, connect: C) -> Result<LivenessReport, LivenessError>
    where
        B: MessageBus,
        C: Fn() -> Fut,
        Fut: Future<Output = Result<B, BusError>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let remaining = self.timing.window.saturating_sub(started.elapsed());
            let outcome = tokio::time::timeout(remaining, self.attempt(&connect))
                .await
                .unwrap_or_else(|_| {
                    Err(format!(
                        "attempt still pending when the {}ms window closed",
                        self.timing.window.as_millis()
                    ))
                });
            let observation = match outcome {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    info!(agent_id = %self.agent_id, attempts, ?elapsed, "agent answered ping");
                    return Ok(LivenessReport { attempts, elapsed });
                }
                Err(observation) => observation,
            };
            debug!(attempt = attempts, %observation, "ping attempt failed");
            if started.elapsed().saturating_add(self.timing.interval) >= self.timing.window {
                return Err(LivenessError::NoPong {
                    attempts,
                    last_observation: observation,
                });
            }
            tokio::time::sleep(self.timing.interval).await;
        }
    }

    async fn attempt<B, C, Fut>(&self, connect: &C) -> Result<(), String>
    where
        B: MessageBus,
        C: Fn() -> Fut,
        Fut: Future<Output = Result<B, BusError>>,
    {
        let bus = connect().await.map_err(|err| err.to_string())?;
        let reply_to = format!("director.{}", Uuid::new_v4());
        let mut replies = bus
            .subscribe(&reply_to)
            .await
            .map_err(|err| err.to_string())?;
        let request = serde_json::to_vec(&Request::ping(reply_to.as_str()))
            .map_err(|err| err.to_string())?;
        bus.publish(&agent_subject(&self.agent_id), request)
            .await
            .map_err(|err| err.to_string())?;
        let reply = replies
            .next_timeout(self.timing.reply_timeout)
            .await
            .map_err(|err| err.to_string())?;
        if reply.payload == PONG_REPLY {
            Ok(())
        } else {
            Err(format!(
                "unexpected reply {}",
                String::from_utf8_lossy(&reply.payload)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::control::bus::MemoryBus;
    use crate::control::handler::AgentHandler;
    use crate::control::listener::AgentListener;
    use crate::control::protocol::Response;

    fn fast() -> LivenessTiming {
        LivenessTiming {
            window: Duration::from_millis(300),
            interval: Duration::from_millis(20),
            reply_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn live_agent_answers_first_attempt() {
        let bus = Arc::new(MemoryBus::new());
        let listener = AgentListener::new("abc", Arc::new(AgentHandler));
        let subscription = listener
            .listen(bus.as_ref())
            .await
            .unwrap_or_else(|err| panic!("listen: {err}"));
        let serving = Arc::clone(&bus);
        let server = tokio::spawn(async move { listener.serve(serving.as_ref(), subscription).await });

        let shared = MemoryBus::clone(&bus);
        let report = LivenessCheck::new("abc", fast())
            .run(|| {
                let bus = shared.clone();
                async move { Ok::<_, BusError>(bus) }
            })
            .await
            .unwrap_or_else(|err| panic!("liveness: {err}"));
        server.abort();
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn silent_agent_fails_after_window() {
        let shared = MemoryBus::new();
        let err = LivenessCheck::new("abc", fast())
            .run(|| {
                let bus = shared.clone();
                async move { Ok::<_, BusError>(bus) }
            })
            .await
            .expect_err("nobody answers");
        let LivenessError::NoPong { attempts, last_observation } = err;
        assert!(attempts > 1, "expected retries, got {attempts}");
        assert!(last_observation.contains("no message"), "{last_observation}");
    }

    #[tokio::test]
    async fn unreachable_broker_is_retried() {
        let err = LivenessCheck::new("abc", fast())
            .run(|| async {
                Err::<MemoryBus, _>(BusError::Connect {
                    address: String::from("127.0.0.1:1"),
                    message: String::from("refused"),
                })
            })
            .await
            .expect_err("broker is down");
        let LivenessError::NoPong { attempts, last_observation } = err;
        assert!(attempts > 1);
        assert!(last_observation.contains("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn hung_connect_is_cut_off_at_window() {
        let timing = fast();
        let outcome = tokio::time::timeout(
            timing.window.saturating_add(Duration::from_millis(500)),
            LivenessCheck::new("abc", timing)
                .run(std::future::pending::<Result<MemoryBus, BusError>>),
        )
        .await
        .unwrap_or_else(|_| panic!("liveness outlived its window"));
        let LivenessError::NoPong { attempts, last_observation } =
            outcome.expect_err("connect never completes");
        assert_eq!(attempts, 1);
        assert!(last_observation.contains("300ms window"), "{last_observation}");
    }

    async fn answer_with(bus: MemoryBus, reply: &'static [u8]) -> tokio::task::JoinHandle<()> {
        let mut requests = bus
            .subscribe(&agent_subject("abc"))
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        tokio::spawn(async move {
            while let Some(message) = requests.next().await {
                let request: Request = serde_json::from_slice(&message.payload)
                    .unwrap_or_else(|err| panic!("request: {err}"));
                bus.publish(&request.reply_to, reply.to_vec())
                    .await
                    .unwrap_or_else(|err| panic!("reply: {err}"));
            }
        })
    }

    #[tokio::test]
    async fn reformatted_pong_is_not_accepted() {
        let shared = MemoryBus::new();
        let responder = answer_with(shared.clone(), br#"{ "value": "pong" }"#).await;

        let err = LivenessCheck::new("abc", fast())
            .run(|| {
                let bus = shared.clone();
                async move { Ok::<_, BusError>(bus) }
            })
            .await
            .expect_err("only the exact reply counts");
        responder.abort();
        let LivenessError::NoPong { last_observation, .. } = err;
        assert!(last_observation.contains("unexpected reply"), "{last_observation}");
    }

    #[tokio::test]
    async fn exact_pong_is_accepted() {
        let shared = MemoryBus::new();
        let responder = answer_with(shared.clone(), PONG_REPLY).await;

        let report = LivenessCheck::new("abc", fast())
            .run(|| {
                let bus = shared.clone();
                async move { Ok::<_, BusError>(bus) }
            })
            .await
            .unwrap_or_else(|err| panic!("liveness: {err}"));
        responder.abort();
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn agent_pong_serialises_to_the_accepted_reply() {
        let encoded =
            serde_json::to_vec(&Response::pong()).unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(encoded, PONG_REPLY);
    }
}
