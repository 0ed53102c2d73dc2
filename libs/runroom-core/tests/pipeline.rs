// End-to-end pipeline: intake -> queue -> runner -> fanout -> client connection,
// with two routers sharing one in-process bus standing in for two instances.

use runroom_common::types::Envelope;
use runroom_core::languages::LanguageConfig;
use runroom_core::{
    Admission, Bus, FanoutRouter, Intake, JobQueue, LanguageConfigManager, LocalBus,
    MemoryJobStore, QueueConfig, Rejection, Runner,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Cluster {
    root: TempDir,
    work_path: std::path::PathBuf,
    store: Arc<MemoryJobStore>,
    worker_node: Arc<FanoutRouter>,
    client_node: Arc<FanoutRouter>,
    intake: Intake,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Cluster {
    async fn start(config: QueueConfig, spawn_workers: bool) -> Self {
        let work_dir = TempDir::new().unwrap();
        let work_path = work_dir.path().join("codes");

        let mut languages = LanguageConfigManager::builtin();
        languages.insert(LanguageConfig::new("shell", "sh", &[], "sh"));
        let runner = Arc::new(Runner::new(Arc::new(languages), &work_path));

        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let worker_node = FanoutRouter::start("worker-node", bus.clone(), 256).await.unwrap();
        let client_node = FanoutRouter::start("client-node", bus, 256).await.unwrap();

        let store = Arc::new(MemoryJobStore::new());
        let queue = JobQueue::new(store.clone(), runner, worker_node.clone(), config);
        let shutdown = CancellationToken::new();
        let workers = if spawn_workers {
            queue.spawn_workers(shutdown.clone())
        } else {
            Vec::new()
        };

        Self {
            root: work_dir,
            work_path,
            store,
            worker_node,
            client_node,
            intake: Intake::new(queue),
            shutdown,
            workers,
        }
    }

    /// A client on the other instance, joined to `room`
    fn watch(&self, room: &str) -> mpsc::Receiver<Arc<Envelope>> {
        let (conn, rx) = self.client_node.connect();
        assert!(self.client_node.join(&conn, room));
        rx
    }

    async fn wait_until_idle(&self) {
        for _ in 0..200 {
            if self.store.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never drained");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            worker.await.unwrap();
        }
        self.worker_node.shutdown().await;
        self.client_node.shutdown().await;
    }
}

fn fast_config(worker_count: usize) -> QueueConfig {
    QueueConfig {
        worker_count,
        max_active: Some(Duration::from_secs(10)),
        claim_timeout: Duration::from_millis(100),
    }
}

/// Everything delivered to one connection up to and including `command:end`
async fn collect_run(rx: &mut mpsc::Receiver<Arc<Envelope>>) -> Vec<Arc<Envelope>> {
    let mut received = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("connection closed");
        let done = envelope.event == "command" && envelope.payload["command"] == "end";
        received.push(envelope);
        if done {
            return received;
        }
    }
}

fn outputs(events: &[Arc<Envelope>], stream: &str) -> String {
    events
        .iter()
        .filter(|e| e.event == "output" && e.payload["stream"] == stream)
        .filter_map(|e| e.payload["output"].as_str())
        .collect()
}

fn count_commands(events: &[Arc<Envelope>], command: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event == "command" && e.payload["command"] == command)
        .count()
}

fn artifact_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_output_reaches_client_on_other_instance() {
    let cluster = Cluster::start(fast_config(1), true).await;
    let mut rx = cluster.watch("s1");
    let (_bystander, mut bystander_rx) = cluster.client_node.connect();

    let admission = cluster
        .intake
        .handle_run_request("echo A\necho B\necho oops >&2", "shell", "s1")
        .await
        .unwrap();
    assert!(matches!(admission, Admission::Accepted { .. }));

    let events = collect_run(&mut rx).await;

    assert_eq!(events.first().unwrap().payload["command"], "start");
    assert_eq!(count_commands(&events, "start"), 1);
    assert_eq!(count_commands(&events, "end"), 1);
    assert_eq!(outputs(&events, "stdout"), "A\nB\n");
    assert_eq!(outputs(&events, "stderr"), "oops\n");
    assert!(events.iter().all(|e| e.room == "s1"));
    assert!(events.iter().all(|e| e.origin.starts_with("worker-node:")));
    assert_eq!(events.first().unwrap().payload["sessionId"], "s1");
    assert_eq!(artifact_count(&cluster.work_path), 0);
    assert!(bystander_rx.try_recv().is_err());

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_unsupported_language_single_output() {
    let cluster = Cluster::start(fast_config(1), true).await;
    let mut rx = cluster.watch("s1");

    cluster
        .intake
        .handle_run_request("puts 1", "ruby", "s1")
        .await
        .unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].payload["command"], "start");
    assert_eq!(events[1].event, "output");
    assert_eq!(events[1].payload["output"], "Language is not supported");
    assert_eq!(events[2].payload["command"], "end");
    // The work directory is only created when an artifact is written
    assert!(!cluster.work_path.exists());

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_empty_code_single_output() {
    let cluster = Cluster::start(fast_config(1), true).await;
    let mut rx = cluster.watch("s1");

    cluster.intake.handle_run_request("", "shell", "s1").await.unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[1].payload["output"], "No code provided");
    assert!(!cluster.work_path.exists());

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_duplicate_rejected_while_queued() {
    let cluster = Cluster::start(fast_config(1), false).await;

    let first = cluster.intake.handle_run_request("echo 1", "shell", "s1").await.unwrap();
    let second = cluster.intake.handle_run_request("echo 2", "shell", "s1").await.unwrap();
    let other = cluster.intake.handle_run_request("echo 3", "shell", "s2").await.unwrap();

    assert!(matches!(first, Admission::Accepted { .. }));
    assert_eq!(
        second,
        Admission::Rejected(Rejection::DuplicateInFlight {
            session_id: "s1".into()
        })
    );
    assert!(matches!(other, Admission::Accepted { .. }));
    assert_eq!(cluster.store.len(), 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_duplicate_rejected_while_active_then_accepted() {
    let cluster = Cluster::start(fast_config(1), true).await;
    let mut rx = cluster.watch("s1");

    cluster
        .intake
        .handle_run_request("sleep 0.5\necho done", "shell", "s1")
        .await
        .unwrap();

    // Wait for the job to become active
    let start = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(start.payload["command"], "start");

    let while_active = cluster.intake.handle_run_request("echo again", "shell", "s1").await.unwrap();
    assert!(matches!(while_active, Admission::Rejected(_)));

    let rest = collect_run(&mut rx).await;
    assert_eq!(outputs(&rest, "stdout"), "done\n");
    cluster.wait_until_idle().await;

    let after = cluster.intake.handle_run_request("echo again", "shell", "s1").await.unwrap();
    assert!(matches!(after, Admission::Accepted { .. }));
    let events = collect_run(&mut rx).await;
    assert_eq!(outputs(&events, "stdout"), "again\n");

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_runaway_process_times_out() {
    let config = QueueConfig {
        max_active: Some(Duration::from_millis(300)),
        ..fast_config(1)
    };
    let cluster = Cluster::start(config, true).await;
    let mut rx = cluster.watch("s1");

    cluster
        .intake
        .handle_run_request("echo begin\nsleep 30", "shell", "s1")
        .await
        .unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(outputs(&events, "stdout"), "begin\n");
    assert!(outputs(&events, "stderr").contains("timed out"));
    assert_eq!(count_commands(&events, "end"), 1);
    assert_eq!(artifact_count(&cluster.work_path), 0);

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_workers_run_sessions_concurrently() {
    let cluster = Cluster::start(fast_config(2), true).await;
    assert_eq!(cluster.workers.len(), 2);
    let mut rx_a = cluster.watch("a");
    let mut rx_b = cluster.watch("b");

    // Each session waits for the other's marker file, so this only finishes
    // when both processes are alive at the same time
    let dir = cluster.root.path().display().to_string();
    let script = |mine: &str, theirs: &str| {
        format!(
            "touch {dir}/{mine}\ni=0\nwhile [ ! -f {dir}/{theirs} ] && [ $i -lt 50 ]; do sleep 0.1; i=$((i+1)); done\n[ -f {dir}/{theirs} ] && echo met"
        )
    };

    cluster.intake.handle_run_request(script("a", "b"), "shell", "a").await.unwrap();
    cluster.intake.handle_run_request(script("b", "a"), "shell", "b").await.unwrap();

    let (events_a, events_b) = tokio::join!(collect_run(&mut rx_a), collect_run(&mut rx_b));
    assert_eq!(outputs(&events_a, "stdout"), "met\n");
    assert_eq!(outputs(&events_b, "stdout"), "met\n");

    cluster.wait_until_idle().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_job_and_still_ends() {
    let cluster = Cluster::start(fast_config(1), true).await;
    let mut rx = cluster.watch("s1");

    cluster
        .intake
        .handle_run_request("sleep 30", "shell", "s1")
        .await
        .unwrap();
    let start = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(start.payload["command"], "start");

    cluster.shutdown.cancel();
    let rest = collect_run(&mut rx).await;
    assert!(outputs(&rest, "stderr").contains("cancelled"));
    assert_eq!(artifact_count(&cluster.work_path), 0);

    cluster.wait_until_idle().await;
    cluster.stop().await;
}
