//! Execution Runner - streams one program run into its session room
//!
//! **Contract:**
//! - `command:start` is emitted before anything else
//! - every chunk read from stdout/stderr becomes one `output` event, as soon
//!   as it is read (no line buffering, no waiting for exit)
//! - `command:end` is emitted exactly once, after the artifact is gone
//!
//! **Exit paths** (each releases the artifact in the same place):
//! unsupported language, empty code, artifact write failure, spawn failure,
//! process exit, timeout, cancellation.

use crate::artifact::Artifact;
use crate::error::RunError;
use crate::events::EventSink;
use crate::languages::{LanguageConfig, LanguageConfigManager};
use runroom_common::types::{ExecutionRequest, SessionEvent, StreamKind};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read size for process pipes
const CHUNK_SIZE: usize = 8 * 1024;

/// How long pipes are still read after the interpreter exits. Anything it
/// left running in the background is killed once this runs out.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Environment variable carrying the language tag into the interpreter
pub const LANGUAGE_ENV: &str = "RUNROOM_LANGUAGE";

/// How a run that got as far as spawning a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Process exited on its own; `None` when killed by a signal
    Exited { code: Option<i32> },
    /// Killed after exceeding the maximum active duration
    TimedOut,
    /// Killed because the job's cancellation token fired
    Cancelled,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct Runner {
    languages: Arc<LanguageConfigManager>,
    work_dir: PathBuf,
}

impl Runner {
    pub fn new(languages: Arc<LanguageConfigManager>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            languages,
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run `request` to completion, reporting everything through `sink`.
    ///
    /// Errors are also reported to the session as an output line before
    /// `command:end`; the returned value is for the caller's bookkeeping.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        max_active: Option<Duration>,
    ) -> Result<RunOutcome, RunError> {
        let session_id = request.session_id.clone();
        sink.emit(SessionEvent::start(&session_id)).await;

        let result = self.execute(&request, sink, cancel, max_active).await;

        match &result {
            Ok(RunOutcome::TimedOut) => {
                let limit = max_active.unwrap_or_default();
                sink.emit(SessionEvent::output(
                    &session_id,
                    StreamKind::Stderr,
                    format!("[Execution timed out after {:?}]", limit),
                ))
                .await;
            }
            Ok(RunOutcome::Cancelled) => {
                sink.emit(SessionEvent::output(
                    &session_id,
                    StreamKind::Stderr,
                    "[Execution cancelled]",
                ))
                .await;
            }
            Ok(RunOutcome::Exited { .. }) => {}
            Err(e) => {
                sink.emit(SessionEvent::output(&session_id, StreamKind::Stderr, e.to_string()))
                    .await;
            }
        }

        sink.emit(SessionEvent::end(&session_id)).await;
        result
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        max_active: Option<Duration>,
    ) -> Result<RunOutcome, RunError> {
        let Some(language) = self.languages.get_config(&request.language) else {
            return Err(RunError::UnsupportedLanguage(request.language.clone()));
        };
        if request.code.is_empty() {
            return Err(RunError::EmptyCode);
        }

        let artifact = Artifact::create(&self.work_dir, language.extension(), &request.code)
            .await
            .map_err(RunError::ArtifactIo)?;

        let outcome = self
            .spawn_and_stream(&artifact, language, request, sink, cancel, max_active)
            .await;

        if let Err(e) = artifact.release().await {
            warn!(
                session_id = %request.session_id,
                error = %e,
                "Failed to remove artifact"
            );
        }

        outcome
    }

    async fn spawn_and_stream(
        &self,
        artifact: &Artifact,
        language: &LanguageConfig,
        request: &ExecutionRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        max_active: Option<Duration>,
    ) -> Result<RunOutcome, RunError> {
        let (program, args) = language
            .execution
            .command_line(artifact.path(), &request.language);

        debug!(
            session_id = %request.session_id,
            program = %program,
            args = ?args,
            "Spawning interpreter"
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env(LANGUAGE_ENV, &request.language)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so whatever the program spawns dies with it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        let start_time = Instant::now();
        let group = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let session_id = request.session_id.as_str();

        let deadline = async {
            match max_active {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let streams = async {
            tokio::join!(
                forward(stdout, StreamKind::Stdout, session_id, sink),
                forward(stderr, StreamKind::Stderr, session_id, sink),
            );
        };
        tokio::pin!(streams);
        let mut streams_done = false;

        let stop = loop {
            tokio::select! {
                _ = &mut streams, if !streams_done => streams_done = true,
                status = child.wait() => break Stop::Exited(status),
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = &mut deadline => break Stop::TimedOut,
            }
        };

        let outcome = match stop {
            Stop::Exited(Ok(status)) => RunOutcome::Exited {
                code: status.code(),
            },
            Stop::Exited(Err(e)) => {
                // Waiting failed; the process state is unknown, so make sure it is gone
                warn!(session_id = %session_id, error = %e, "Failed to wait for interpreter");
                kill(&mut child, group, session_id).await;
                RunOutcome::Exited { code: None }
            }
            Stop::TimedOut => {
                warn!(
                    session_id = %session_id,
                    limit_ms = max_active.map(|d| d.as_millis() as u64).unwrap_or_default(),
                    "Execution timed out - killing interpreter"
                );
                kill(&mut child, group, session_id).await;
                RunOutcome::TimedOut
            }
            Stop::Cancelled => {
                info!(session_id = %session_id, "Execution cancelled - killing interpreter");
                kill(&mut child, group, session_id).await;
                RunOutcome::Cancelled
            }
        };

        // Flush what is already in the pipes. A background process may still
        // hold them open, so this is bounded and the group is killed after.
        if !streams_done
            && tokio::time::timeout(DRAIN_GRACE, &mut streams).await.is_err()
        {
            debug!(session_id = %session_id, "Pipes still open after exit, dropping them");
        }
        if let Some(group) = group {
            kill_group(group, session_id);
        }

        info!(
            session_id = %session_id,
            outcome = ?outcome,
            execution_ms = start_time.elapsed().as_millis() as u64,
            "Interpreter finished"
        );

        Ok(outcome)
    }
}

/// Kill the interpreter's whole group, then reap the interpreter itself
async fn kill(child: &mut tokio::process::Child, group: Option<u32>, session_id: &str) {
    if let Some(group) = group {
        kill_group(group, session_id);
    }
    if let Err(e) = child.kill().await {
        warn!(session_id = %session_id, error = %e, "Failed to kill interpreter");
    }
}

#[cfg(unix)]
fn kill_group(group: u32, session_id: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(group as i32), Signal::SIGKILL) {
        // Nothing left in the group
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: u32, _session_id: &str) {}

/// Pump one pipe into the sink. Each emit is awaited before the next read,
/// which is what keeps per-stream order intact downstream.
async fn forward<R>(reader: Option<R>, stream: StreamKind, session_id: &str, sink: &dyn EventSink)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut decoder = Utf8Chunker::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    sink.emit(SessionEvent::output(session_id, stream, text)).await;
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, stream = %stream, error = %e, "Pipe read failed");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        sink.emit(SessionEvent::output(session_id, stream, rest)).await;
    }
}

/// Turns raw pipe chunks into text without splitting multi-byte characters.
///
/// An incomplete UTF-8 sequence at the end of a chunk is held back until the
/// next chunk arrives; genuinely invalid bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_suffix_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence (0..=3)
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            // Input ended mid-character
            Err(e) if e.error_len().is_none() => return rest.len() - e.valid_up_to(),
            // Invalid bytes are lossy-replaced later; look past them
            Err(e) => rest = &rest[e.valid_up_to() + e.error_len().unwrap_or(1)..],
        }
    }
}
