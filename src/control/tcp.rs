//! Newline-delimited JSON broker and client.
//!
//! Every frame is one JSON object per line, tagged by `op`:
//!
//! - `{"op":"sub","subject":"agent.x"}` registers interest.
//! - `{"op":"pub","subject":"agent.x","payload":"..."}` publishes.
//! - `{"op":"msg","subject":"agent.x","payload":"..."}` is a delivery from
//!   the broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::BusError;
use super::bus::{BusFuture, Message, MessageBus, Subscribers, Subscription, dispatch, register};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame {
    Sub { subject: String },
    Pub { subject: String, payload: String },
    Msg { subject: String, payload: String },
}

fn encode(frame: &Frame) -> Result<String, BusError> {
    let mut line = serde_json::to_string(frame).map_err(|err| BusError::Protocol {
        message: err.to_string(),
    })?;
    line.push('\n');
    Ok(line)
}

fn io_error(err: &std::io::Error) -> BusError {
    BusError::Io {
        message: err.to_string(),
    }
}

/// Upper bound on establishing a client connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Routes = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>>>;

/// Broker routing published frames to subscribed connections.
#[derive(Debug)]
pub struct BusServer {
    listener: TcpListener,
    routes: Routes,
}

impl BusServer {
    /// Binds the broker to `address` (`127.0.0.1:0` picks a free port).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connect`] when the address cannot be bound.
    pub async fn bind(address: &str) -> Result<Self, BusError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| BusError::Connect {
                address: address.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Self {
            listener,
            routes: Routes::default(),
        })
    }

    /// Address the broker accepts connections on.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] when the socket address is unavailable.
    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        self.listener.local_addr().map_err(|err| io_error(&err))
    }

    /// Accepts connections until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] when accepting fails.
    pub async fn serve(self) -> Result<(), BusError> {
        let mut next_id: u64 = 0;
        loop {
            let (stream, peer) = self.listener.accept().await.map_err(|err| io_error(&err))?;
            next_id = next_id.wrapping_add(1);
            debug!(%peer, connection = next_id, "bus client connected");
            tokio::spawn(serve_connection(stream, next_id, Arc::clone(&self.routes)));
        }
    }

    /// Runs [`Self::serve`] on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<(), BusError>> {
        tokio::spawn(self.serve())
    }
}

async fn serve_connection(stream: TcpStream, id: u64, routes: Routes) {
    let (read, mut write) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = queue.recv().await {
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => route_frame(&line, id, &outbound, &routes).await,
            Ok(None) => break,
            Err(err) => {
                debug!(connection = id, error = %err, "bus client read failed");
                break;
            }
        }
    }

    let mut table = routes.lock().await;
    for senders in table.values_mut() {
        senders.retain(|(owner, _)| *owner != id);
    }
    table.retain(|_, senders| !senders.is_empty());
    drop(table);
    writer.abort();
    debug!(connection = id, "bus client disconnected");
}

async fn route_frame(line: &str, id: u64, outbound: &mpsc::UnboundedSender<String>, routes: &Routes) {
    let frame = match serde_json::from_str::<Frame>(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(connection = id, error = %err, "discarding malformed bus frame");
            return;
        }
    };
    match frame {
        Frame::Sub { subject } => {
            routes
                .lock()
                .await
                .entry(subject)
                .or_default()
                .push((id, outbound.clone()));
        }
        Frame::Pub { subject, payload } => {
            let Ok(delivery) = encode(&Frame::Msg {
                subject: subject.clone(),
                payload,
            }) else {
                return;
            };
            let mut table = routes.lock().await;
            if let Some(senders) = table.get_mut(&subject) {
                senders.retain(|(_, sender)| sender.send(delivery.clone()).is_ok());
            }
        }
        Frame::Msg { .. } => {
            warn!(connection = id, "clients may not send msg frames");
        }
    }
}

/// Client connection to a [`BusServer`].
#[derive(Debug)]
pub struct TcpBus {
    writer: Mutex<OwnedWriteHalf>,
    subscribers: Subscribers,
    reader: JoinHandle<()>,
}

impl TcpBus {
    /// Connects to the broker at `address`, giving up after
    /// [`CONNECT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connect`] when the broker is unreachable.
    pub async fn connect(address: &str) -> Result<Self, BusError> {
        Self::connect_within(address, CONNECT_TIMEOUT).await
    }

    /// Connects to the broker at `address`, giving up after `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connect`] when the broker is unreachable or the
    /// handshake does not finish in time.
    pub async fn connect_within(address: &str, limit: Duration) -> Result<Self, BusError> {
        let connect_error = |message: String| BusError::Connect {
            address: address.to_owned(),
            message,
        };
        let stream = tokio::time::timeout(limit, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error(format!("timed out after {}ms", limit.as_millis())))?
            .map_err(|err| connect_error(err.to_string()))?;
        let (read, write) = stream.into_split();
        let subscribers = Subscribers::default();
        let inbound = Arc::clone(&subscribers);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Msg { subject, payload }) => {
                        dispatch(
                            &inbound,
                            Message {
                                subject,
                                payload: payload.into_bytes(),
                            },
                        )
                        .await;
                    }
                    Ok(_) => debug!("ignoring non-delivery frame from broker"),
                    Err(err) => warn!(error = %err, "discarding malformed broker frame"),
                }
            }
            inbound.lock().await.clear();
        });
        Ok(Self {
            writer: Mutex::new(write),
            subscribers,
            reader,
        })
    }

    async fn send(&self, frame: &Frame) -> Result<(), BusError> {
        let line = encode(frame)?;
        self.writer
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .map_err(|err| io_error(&err))
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl MessageBus for TcpBus {
    fn subscribe<'a>(&'a self, subject: &'a str) -> BusFuture<'a, Subscription> {
        Box::pin(async move {
            let subscription = register(&self.subscribers, subject).await;
            self.send(&Frame::Sub {
                subject: subject.to_owned(),
            })
            .await?;
            Ok(subscription)
        })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let text = String::from_utf8(payload).map_err(|err| BusError::Protocol {
                message: err.to_string(),
            })?;
            self.send(&Frame::Pub {
                subject: subject.to_owned(),
                payload: text,
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn frames_use_op_tag() {
        let line = encode(&Frame::Sub {
            subject: String::from("agent.a"),
        })
        .unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(line, "{\"op\":\"sub\",\"subject\":\"agent.a\"}\n");
    }

    #[tokio::test]
    async fn connect_gives_up_within_limit() {
        let started = Instant::now();
        let err = TcpBus::connect_within("10.255.255.1:4222", Duration::from_millis(100))
            .await
            .expect_err("address is not routable");
        assert!(matches!(err, BusError::Connect { ref address, .. } if address == "10.255.255.1:4222"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn broker_routes_between_clients() {
        let server = BusServer::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let address = server
            .local_addr()
            .unwrap_or_else(|err| panic!("addr: {err}"))
            .to_string();
        let broker = server.spawn();

        let receiver = TcpBus::connect(&address)
            .await
            .unwrap_or_else(|err| panic!("connect: {err}"));
        let mut subscription = receiver
            .subscribe("agent.a")
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        let sender = TcpBus::connect(&address)
            .await
            .unwrap_or_else(|err| panic!("connect: {err}"));

        let mut delivered = None;
        for _ in 0..50 {
            sender
                .publish("agent.a", b"{\"n\":1}".to_vec())
                .await
                .unwrap_or_else(|err| panic!("publish: {err}"));
            if let Ok(message) = subscription.next_timeout(Duration::from_millis(100)).await {
                delivered = Some(message);
                break;
            }
        }
        broker.abort();

        let message = delivered.unwrap_or_else(|| panic!("message never delivered"));
        assert_eq!(message.subject, "agent.a");
        assert_eq!(message.payload, b"{\"n\":1}".to_vec());
    }
}
