use crate::error::QueueError;
use crate::queue::{Admission, JobQueue};
use runroom_common::types::ExecutionRequest;
use tracing::debug;

/// Boundary between a client's run request and the job queue.
///
/// Accepting means "queued for asynchronous processing"; output only ever
/// reaches the client through its session room.
#[derive(Clone)]
pub struct Intake {
    queue: JobQueue,
}

impl Intake {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub async fn handle_run_request(
        &self,
        code: impl Into<String>,
        language: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Admission, QueueError> {
        let request = ExecutionRequest::new(session_id, language, code);
        debug!(
            session_id = %request.session_id,
            language = %request.language,
            "Run request received"
        );
        self.queue.submit(request).await
    }
}
