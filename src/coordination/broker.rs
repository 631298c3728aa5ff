//! Coordination Broker
//!
//! TCP service shared by a fleet of nodes: hosts the lease table and
//! the channel hub. Connections are request/response until a client
//! sends `Subscribe`, after which the connection only carries
//! deliveries for that channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::protocol::{read_message, write_message, Message};
use super::{ChannelHub, LeaseTable};
use crate::error::{Error, Result};

/// How often expired leases are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared broker state
#[derive(Debug, Default)]
struct BrokerState {
    leases: Mutex<LeaseTable>,
    hub: ChannelHub,
}

/// Coordination broker server
pub struct BrokerServer {
    /// Bind address
    bind_address: String,
    state: Arc<BrokerState>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl BrokerServer {
    /// Create a new broker
    pub fn new(bind_address: String) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            state: Arc::new(BrokerState::default()),
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Coordination broker listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut purge = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, state, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = purge.tick() => {
                    let purged = self.state.leases.lock().await.purge_expired(Instant::now());
                    if purged > 0 {
                        tracing::debug!("Purged {} expired leases", purged);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordination broker stopped");
        Ok(())
    }

    /// Stop the broker and every open connection
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    state: Arc<BrokerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown.changed() => return Ok(()),
        };

        let message = match message {
            Ok(message) => message,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

        let response = match message {
            Message::Acquire { key, token, ttl_ms } => {
                let granted = state.leases.lock().await.acquire(
                    &key,
                    &token,
                    Duration::from_millis(ttl_ms),
                    Instant::now(),
                );
                if granted {
                    tracing::debug!("Lease {} granted to {}", key, peer_addr);
                }
                Message::LockResponse { granted }
            }
            Message::Extend { key, token, ttl_ms } => {
                let granted = state.leases.lock().await.extend(
                    &key,
                    &token,
                    Duration::from_millis(ttl_ms),
                    Instant::now(),
                );
                Message::LockResponse { granted }
            }
            Message::Release { key, token } => {
                let granted = state.leases.lock().await.release(&key, &token);
                if granted {
                    tracing::debug!("Lease {} released by {}", key, peer_addr);
                }
                Message::LockResponse { granted }
            }
            Message::Publish { channel, payload } => {
                let receivers = state.hub.publish(&channel, &payload).await;
                Message::Published { receivers }
            }
            Message::Subscribe { channel } => {
                write_message(&mut writer, &Message::Subscribed { channel: channel.clone() }).await?;
                tracing::info!("{} subscribed to {}", peer_addr, channel);

                let mut subscription = state.hub.subscribe(&channel).await;
                loop {
                    tokio::select! {
                        delivery = subscription.next() => {
                            let Some(payload) = delivery else { return Ok(()) };
                            let msg = Message::Delivery { channel: channel.clone(), payload };
                            write_message(&mut writer, &msg).await?;
                        }
                        // Subscribers never send again; any read result ends the stream
                        _ = read_message(&mut reader) => {
                            tracing::debug!("{} unsubscribed from {}", peer_addr, channel);
                            return Ok(());
                        }
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
            Message::Ping => Message::Pong,
            other => Message::Error {
                message: format!("unexpected {} request", other.type_name()),
            },
        };

        write_message(&mut writer, &response).await?;
    }
}
