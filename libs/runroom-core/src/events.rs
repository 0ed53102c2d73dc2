use async_trait::async_trait;
use runroom_common::types::SessionEvent;
use std::sync::Arc;

/// Destination for everything an execution reports.
///
/// Emitting never fails from the caller's point of view: delivery problems
/// are infrastructure faults and are logged by the implementation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SessionEvent);
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn emit(&self, event: SessionEvent) {
        (**self).emit(event).await
    }
}
