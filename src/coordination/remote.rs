//! Broker Client
//!
//! `LockService` and `PubSub` over a TCP connection to the coordination
//! broker. Lock requests and publishes each reuse their own cached
//! connection, so a backlog of publishes never delays a lease renewal.
//! The request timeout covers waiting for the connection as well as the
//! exchange. A failed or abandoned request drops its connection and the
//! next request reconnects. Subscriptions own a dedicated connection and
//! resubscribe after it breaks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::protocol::{read_message, write_message, Message};
use super::{ttl_millis, LockService, PubSub, Subscription};
use crate::error::{Error, Result};

/// Delay before a broken subscription reconnects
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Client for the coordination broker
pub struct RemoteCoordinator {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    resubscribe_delay: Duration,
    /// Cached connection for lease requests and pings
    lock_conn: Mutex<Option<TcpStream>>,
    /// Cached connection for publishes
    publish_conn: Mutex<Option<TcpStream>>,
}

impl RemoteCoordinator {
    /// Create a new client. No connection is made until the first request.
    pub fn new(address: String, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
            request_timeout,
            resubscribe_delay: RESUBSCRIBE_DELAY,
            lock_conn: Mutex::new(None),
            publish_conn: Mutex::new(None),
        }
    }

    /// Override the delay between subscription reconnects
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Broker address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Round-trip a ping to the broker
    pub async fn ping(&self) -> Result<()> {
        match self.request(&self.lock_conn, Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request over the connection cached in `slot` and wait for
    /// its response, all within the request timeout
    async fn request(&self, slot: &Mutex<Option<TcpStream>>, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, async {
            let mut conn = slot.lock().await;
            // Out of the slot for the exchange; a cancelled exchange drops it
            let mut stream = match conn.take() {
                Some(stream) => stream,
                None => connect(&self.address, self.connect_timeout).await?,
            };
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            let response = read_message(&mut reader).await?;
            *conn = Some(stream);
            Ok::<_, Error>(response)
        })
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionTimeout(self.address.clone())),
        };

        match response {
            Message::Error { message } => Err(Error::LockService(message)),
            response => Ok(response),
        }
    }

    async fn lock_request(&self, message: Message) -> Result<bool> {
        match self.request(&self.lock_conn, message).await? {
            Message::LockResponse { granted } => Ok(granted),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(message: Message) -> Error {
    Error::UnexpectedResponse(message.type_name().to_string())
}

/// Connect to an address
async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}

/// Open a subscription stream and forward deliveries until it breaks
async fn pump_subscription(
    address: &str,
    channel: &str,
    connect_timeout: Duration,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let stream = connect(address, connect_timeout).await?;
    let (mut reader, mut writer) = stream.into_split();

    write_message(
        &mut writer,
        &Message::Subscribe {
            channel: channel.to_string(),
        },
    )
    .await?;

    match read_message(&mut reader).await? {
        Message::Subscribed { .. } => {
            tracing::info!("Subscribed to {} via {}", channel, address);
        }
        other => return Err(unexpected(other)),
    }

    loop {
        let message = tokio::select! {
            message = read_message(&mut reader) => message?,
            _ = tx.closed() => return Ok(()),
        };

        match message {
            Message::Delivery { payload, .. } => {
                if tx.send(payload).await.is_err() {
                    return Ok(());
                }
            }
            other => {
                tracing::warn!("Ignoring {} on subscription stream", other.type_name());
            }
        }
    }
}

#[async_trait]
impl LockService for RemoteCoordinator {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.lock_request(Message::Acquire {
            key: key.to_string(),
            token: token.to_string(),
            ttl_ms: ttl_millis(ttl),
        })
        .await
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.lock_request(Message::Extend {
            key: key.to_string(),
            token: token.to_string(),
            ttl_ms: ttl_millis(ttl),
        })
        .await
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        self.lock_request(Message::Release {
            key: key.to_string(),
            token: token.to_string(),
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl PubSub for RemoteCoordinator {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        match self
            .request(
                &self.publish_conn,
                Message::Publish {
                    channel: channel.to_string(),
                    payload,
                },
            )
            .await?
        {
            Message::Published { receivers } => Ok(receivers),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(super::hub::SUBSCRIBER_QUEUE);
        let address = self.address.clone();
        let channel = channel.to_string();
        let connect_timeout = self.connect_timeout;
        let delay = self.resubscribe_delay;

        tokio::spawn(async move {
            loop {
                match pump_subscription(&address, &channel, connect_timeout, &tx).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(
                            "Subscription to {} lost: {}; retrying in {:?}",
                            channel,
                            e,
                            delay
                        );
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => break,
                }
            }
            tracing::debug!("Subscription task for {} stopped", channel);
        });

        Ok(Subscription::new(rx))
    }
}
