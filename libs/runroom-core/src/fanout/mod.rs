//! Fanout Router - cluster-wide room delivery
//!
//! Every instance runs one router. Publishing goes to the shared [`Bus`];
//! a background pump feeds everything the bus delivers into the local
//! [`RoomRegistry`], which hands it to the connections joined to the room.
//! The publishing instance receives its own envelopes through the bus like
//! everyone else, so local and remote members see the same order.

mod bus;
mod registry;

pub use bus::{Bus, EnvelopeStream, LocalBus, RedisBus};
pub use registry::{ConnectionId, RoomRegistry};

use crate::error::FanoutError;
use crate::events::EventSink;
use async_trait::async_trait;
use futures_util::StreamExt;
use runroom_common::types::{ClientFrame, Envelope, SessionEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event names clients may not publish themselves
const RESERVED_EVENTS: [&str; 2] = [SessionEvent::COMMAND, SessionEvent::OUTPUT];

pub struct FanoutRouter {
    instance_id: String,
    origin: String,
    registry: Arc<RoomRegistry>,
    bus: Arc<dyn Bus>,
    seq: AtomicU64,
    outbound_buffer: usize,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl FanoutRouter {
    /// Subscribe to the bus and start delivering. The subscription is live
    /// when this returns, so nothing published afterwards is missed.
    pub async fn start(
        instance_id: impl Into<String>,
        bus: Arc<dyn Bus>,
        outbound_buffer: usize,
    ) -> Result<Arc<Self>, FanoutError> {
        let instance_id = instance_id.into();
        // `seq` restarts with the process, so the origin has to as well
        let origin = format!("{}:{}", instance_id, Uuid::new_v4());
        let registry = Arc::new(RoomRegistry::new());
        let shutdown = CancellationToken::new();
        let stream = bus.subscribe().await?;

        let pump = tokio::spawn(pump(
            stream,
            bus.clone(),
            registry.clone(),
            shutdown.clone(),
        ));

        info!(instance_id = %instance_id, origin = %origin, "Fanout router started");

        Ok(Arc::new(Self {
            instance_id,
            origin,
            registry,
            bus,
            seq: AtomicU64::new(0),
            outbound_buffer,
            shutdown,
            pump: Mutex::new(Some(pump)),
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Origin stamped on every envelope this router publishes
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Register a new client connection on this instance
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Arc<Envelope>>) {
        let (id, rx) = self.registry.register(self.outbound_buffer);
        debug!(connection_id = %id, "Connection registered");
        (id, rx)
    }

    pub fn join(&self, connection: &ConnectionId, room: &str) -> bool {
        let joined = self.registry.join(connection, room);
        if joined {
            debug!(connection_id = %connection, room = %room, "Joined room");
        }
        joined
    }

    pub fn leave(&self, connection: &ConnectionId, room: &str) {
        self.registry.leave(connection, room);
    }

    /// Implicit leave-all on disconnect
    pub fn disconnect(&self, connection: &ConnectionId) {
        let rooms = self.registry.leave_all(connection);
        debug!(connection_id = %connection, rooms = rooms.len(), "Connection closed");
    }

    /// Publish to every connection joined to `room`, on any instance
    pub async fn publish(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), FanoutError> {
        let envelope = Envelope {
            room: room.to_string(),
            event: event.to_string(),
            payload,
            origin: self.origin.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
        };
        self.bus.publish(&envelope).await
    }

    /// Apply one frame received from a client connection
    pub async fn handle_frame(
        &self,
        connection: &ConnectionId,
        frame: ClientFrame,
    ) -> Result<(), FanoutError> {
        match frame {
            ClientFrame::Join { room } => {
                self.join(connection, &room);
                Ok(())
            }
            ClientFrame::Leave { room } => {
                self.leave(connection, &room);
                Ok(())
            }
            ClientFrame::Publish {
                room,
                event,
                payload,
            } => {
                if RESERVED_EVENTS.contains(&event.as_str()) {
                    return Err(FanoutError::ReservedEvent(event));
                }
                self.publish(&room, &event, payload).await
            }
        }
    }

    /// Stop the pump. Connections stay registered but receive nothing more.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!(error = %e, "Fanout pump panicked");
            }
        }
        info!(instance_id = %self.instance_id, "Fanout router stopped");
    }
}

#[async_trait]
impl EventSink for FanoutRouter {
    async fn emit(&self, event: SessionEvent) {
        let payload = match event.payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode session event");
                return;
            }
        };
        if let Err(e) = self.publish(event.session_id(), event.name(), payload).await {
            error!(
                session_id = %event.session_id(),
                event = event.name(),
                error = %e,
                "Failed to publish session event"
            );
        }
    }
}

/// Move envelopes from the bus into the registry, resubscribing when the
/// bus stream ends (connection loss) until shutdown.
async fn pump(
    mut stream: EnvelopeStream,
    bus: Arc<dyn Bus>,
    registry: Arc<RoomRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(envelope) => {
                    registry.deliver(envelope);
                }
                None => break,
            }
        }

        warn!("Bus subscription ended, resubscribing");
        stream = loop {
            match bus.subscribe().await {
                Ok(stream) => break stream,
                Err(e) => {
                    error!(error = %e, "Failed to resubscribe to bus");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv(rx: &mut mpsc::Receiver<Arc<Envelope>>) -> Arc<Envelope> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_joined_connection_on_other_instance() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let node_a = FanoutRouter::start("a", bus.clone(), 16).await.unwrap();
        let node_b = FanoutRouter::start("b", bus.clone(), 16).await.unwrap();

        let (joined, mut joined_rx) = node_b.connect();
        let (_idle, mut idle_rx) = node_b.connect();
        node_b.join(&joined, "s1");

        node_a
            .publish("s1", "output", serde_json::json!({ "output": "hi" }))
            .await
            .unwrap();

        let envelope = recv(&mut joined_rx).await;
        assert_eq!(envelope.room, "s1");
        assert_eq!(envelope.origin, node_a.origin());
        assert!(envelope.origin.starts_with("a:"));
        assert_eq!(envelope.payload["output"], "hi");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(idle_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_frames() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("a", bus, 16).await.unwrap();
        let (conn, mut rx) = router.connect();

        router
            .handle_frame(&conn, ClientFrame::Join { room: "s1".into() })
            .await
            .unwrap();
        router
            .handle_frame(
                &conn,
                ClientFrame::Publish {
                    room: "s1".into(),
                    event: "cursor".into(),
                    payload: serde_json::json!({ "line": 3 }),
                },
            )
            .await
            .unwrap();

        let envelope = recv(&mut rx).await;
        assert_eq!(envelope.event, "cursor");
        assert_eq!(envelope.payload["line"], 3);

        router
            .handle_frame(&conn, ClientFrame::Leave { room: "s1".into() })
            .await
            .unwrap();
        assert_eq!(router.registry().member_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_reserved_events_rejected() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("a", bus, 16).await.unwrap();
        let (conn, _rx) = router.connect();

        let err = router
            .handle_frame(
                &conn,
                ClientFrame::Publish {
                    room: "s1".into(),
                    event: "command".into(),
                    payload: serde_json::Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::ReservedEvent(_)));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("a", bus, 16).await.unwrap();
        let (conn, _rx) = router.connect();
        router.join(&conn, "s1");
        router.join(&conn, "s2");

        router.disconnect(&conn);

        assert_eq!(router.registry().member_count("s1"), 0);
        assert_eq!(router.registry().member_count("s2"), 0);
        assert_eq!(router.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_session_events_keep_publish_order() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("a", bus, 64).await.unwrap();
        let (conn, mut rx) = router.connect();
        router.join(&conn, "s1");

        router.emit(SessionEvent::start("s1")).await;
        for i in 0..10 {
            router
                .emit(SessionEvent::output(
                    "s1",
                    runroom_common::types::StreamKind::Stdout,
                    i.to_string(),
                ))
                .await;
        }
        router.emit(SessionEvent::end("s1")).await;

        assert_eq!(recv(&mut rx).await.payload["command"], "start");
        for i in 0..10 {
            assert_eq!(recv(&mut rx).await.payload["output"], i.to_string());
        }
        assert_eq!(recv(&mut rx).await.payload["command"], "end");
    }

    #[tokio::test]
    async fn test_restarted_instance_with_same_id_is_delivered() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let api = FanoutRouter::start("api", bus.clone(), 16).await.unwrap();
        let (conn, mut rx) = api.connect();
        api.join(&conn, "s1");

        let worker = FanoutRouter::start("worker-1", bus.clone(), 16).await.unwrap();
        worker.publish("s1", "note", serde_json::json!(1)).await.unwrap();
        assert_eq!(recv(&mut rx).await.payload, serde_json::json!(1));
        worker.shutdown().await;

        // Same instance id, sequence numbers start over
        let restarted = FanoutRouter::start("worker-1", bus, 16).await.unwrap();
        assert_ne!(restarted.origin(), worker.origin());
        restarted.publish("s1", "note", serde_json::json!(2)).await.unwrap();
        assert_eq!(recv(&mut rx).await.payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("a", bus, 16).await.unwrap();
        let (conn, mut rx) = router.connect();
        router.join(&conn, "s1");

        router.shutdown().await;
        router
            .publish("s1", "note", serde_json::Value::Null)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
