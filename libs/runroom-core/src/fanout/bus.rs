use crate::error::FanoutError;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use runroom_common::redis as keys;
use runroom_common::types::Envelope;
use tokio::sync::broadcast;
use tracing::warn;

pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// Broadcast channel shared by every instance.
///
/// Delivery is at-least-once; envelopes from one publisher to one room
/// arrive in publish order.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanoutError>;

    /// Stream of every envelope published from now on, for all rooms.
    /// The subscription is live once this returns.
    async fn subscribe(&self) -> Result<EnvelopeStream, FanoutError>;
}

/// In-process bus. Several routers sharing one `LocalBus` behave like
/// instances sharing Redis.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanoutError> {
        // No subscribers is not an error; there is simply nobody to deliver to
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, FanoutError> {
        let rx = self.tx.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Redis pub/sub bus, one channel per room (`runroom:room:{room}`).
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(client: &redis::Client) -> Result<Self, FanoutError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client: client.clone(),
            conn,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanoutError> {
        let mut conn = self.conn.clone();
        keys::publish_envelope(&mut conn, envelope).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, FanoutError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.psubscribe(keys::ROOM_CHANNEL_PATTERN).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable bus message");
                    return None;
                }
            };
            let envelope = match keys::decode_envelope(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Malformed envelope on bus");
                    return None;
                }
            };
            if keys::room_from_channel(msg.get_channel_name()) != Some(envelope.room.as_str()) {
                warn!(
                    channel = msg.get_channel_name(),
                    room = %envelope.room,
                    "Envelope room does not match its channel"
                );
                return None;
            }
            Some(envelope)
        });

        Ok(stream.boxed())
    }
}
