//! End-to-end scenarios over the in-memory broker: a console and a
//! worker wired through the full stack, exercising task dispatch, the
//! help protocol, and reconnection recovery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use agent_fleet::connection::{ConnectionManager, RecoveryFn};
use agent_fleet::console::Console;
use agent_fleet::error::Result;
use agent_fleet::protocol::{ExecState, HelpQuestion, TaskAssignment};
use agent_fleet::state::{EventKind, HelpStatus};
use agent_fleet::subjects;
use agent_fleet::testing::MemoryBroker;
use agent_fleet::worker::{Engine, EngineEvent, EngineSession, WorkerIdentity, WorkerRuntime};

/// Plays back a fixed event script and records decision resolutions.
struct ScriptedEngine {
    script: Mutex<VecDeque<EngineEvent>>,
    resolutions: Arc<Mutex<Vec<Option<Vec<Vec<String>>>>>>,
}

impl ScriptedEngine {
    fn new(events: Vec<EngineEvent>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(events.into()),
            resolutions: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

struct ScriptedSession {
    events: VecDeque<EngineEvent>,
    resolutions: Arc<Mutex<Vec<Option<Vec<Vec<String>>>>>>,
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn start(&self, _assignment: &TaskAssignment) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(ScriptedSession {
            events: std::mem::take(&mut *self.script.lock()),
            resolutions: self.resolutions.clone(),
        }))
    }
}

#[async_trait]
impl EngineSession for ScriptedSession {
    async fn next_event(&mut self) -> Result<Option<EngineEvent>> {
        Ok(self.events.pop_front())
    }

    async fn resolve_decision(&mut self, answers: Option<Vec<Vec<String>>>) -> Result<()> {
        self.resolutions.lock().push(answers);
        Ok(())
    }

    async fn close(&mut self) {}
}

fn noop_recovery() -> Arc<RecoveryFn> {
    Arc::new(|_conn| Box::pin(async { Ok(()) }))
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn start_console(broker: Arc<MemoryBroker>) -> Console {
    let console = Console::new(broker, "operator", ms(10), ms(200));
    console.connect().await.unwrap();
    console
}

async fn start_worker(
    broker: Arc<MemoryBroker>,
    agent_id: &str,
    engine: Arc<dyn Engine>,
    help_timeout: Duration,
) -> (Arc<WorkerRuntime>, watch::Sender<bool>) {
    let manager = ConnectionManager::new(broker, ms(10), ms(200));
    manager.connect(noop_recovery());
    manager.wait_connected().await.unwrap();

    let worker = Arc::new(
        WorkerRuntime::new(
            manager,
            WorkerIdentity {
                agent_id: agent_id.into(),
                capabilities: vec!["test".into()],
                display: None,
            },
            engine,
        )
        .with_help_timeout(help_timeout),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    worker.start(shutdown_rx).await.unwrap();
    (worker, shutdown_tx)
}

/// Poll `check` every 10ms until it passes or a 2s deadline expires.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn task_runs_to_a_single_terminal_and_agent_returns_idle() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine = ScriptedEngine::new(vec![
        EngineEvent::Progress(json!({"step": 1})),
        EngineEvent::Progress(json!({"step": 2})),
        EngineEvent::Progress(json!({"step": 3})),
        EngineEvent::Done(Some(json!("finished"))),
    ]);
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, ms(100)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;

    let submission = console
        .submit_task("w1", "run the suite", Default::default())
        .await
        .unwrap();
    assert!(submission.accepted);

    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskComplete)
    })
    .await;

    let events = console.events(None);
    let assigned = events.iter().filter(|e| e.kind == EventKind::TaskAssigned).count();
    let messages = events.iter().filter(|e| e.kind == EventKind::Message).count();
    let terminals = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskComplete | EventKind::TaskError))
        .count();
    assert_eq!(assigned, 1);
    assert_eq!(messages, 3);
    assert_eq!(terminals, 1);

    eventually(|| {
        console
            .agents()
            .iter()
            .any(|a| a.id == "w1" && a.state == ExecState::Idle)
    })
    .await;
}

#[tokio::test]
async fn engine_fault_surfaces_as_error_terminal() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    // Script ends without a Done event.
    let engine = ScriptedEngine::new(vec![EngineEvent::Progress(json!("partial"))]);
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, ms(100)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;
    console
        .submit_task("w1", "doomed", Default::default())
        .await
        .unwrap();

    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskError)
    })
    .await;
    let terminals = console
        .events(None)
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskComplete | EventKind::TaskError))
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn operator_answer_reaches_the_blocked_engine() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine = ScriptedEngine::new(vec![
        EngineEvent::Decision {
            questions: vec![HelpQuestion {
                header: "Permission".into(),
                prompt: "Overwrite config?".into(),
                options: vec!["Yes".into(), "No".into()],
                multi_select: false,
            }],
        },
        EngineEvent::Done(None),
    ]);
    let resolutions = engine.resolutions.clone();
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, Duration::from_secs(5)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;
    console
        .submit_task("w1", "needs a human", Default::default())
        .await
        .unwrap();

    eventually(|| !console.pending_help().is_empty()).await;
    let request_id = console.pending_help()[0].request_id.clone();
    console
        .respond_help(&request_id, vec![vec!["Yes".into()]])
        .await
        .unwrap();

    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskComplete)
    })
    .await;
    assert_eq!(
        resolutions.lock().as_slice(),
        &[Some(vec![vec!["Yes".to_string()]])]
    );
    // The mirror shows who resolved it.
    let entry = console
        .help_requests()
        .into_iter()
        .find(|h| h.request_id == request_id)
        .unwrap();
    assert_eq!(entry.answered_by.as_deref(), Some("operator"));
}

#[tokio::test]
async fn unanswered_help_times_out_and_the_task_still_finishes() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine = ScriptedEngine::new(vec![
        EngineEvent::Decision {
            questions: vec![HelpQuestion {
                header: "h".into(),
                prompt: "p".into(),
                options: vec![],
                multi_select: false,
            }],
        },
        EngineEvent::Done(None),
    ]);
    let resolutions = engine.resolutions.clone();
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, ms(100)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;
    console
        .submit_task("w1", "nobody home", Default::default())
        .await
        .unwrap();

    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskComplete)
    })
    .await;
    assert_eq!(resolutions.lock().as_slice(), &[None]);
    // The worker's timeout record closes the mirror entry too.
    eventually(|| {
        console
            .help_requests()
            .iter()
            .any(|h| h.status == HelpStatus::Timeout)
    })
    .await;
    assert!(console.pending_help().is_empty());
    // The roster is untouched by the timeout.
    assert!(console.agents().iter().any(|a| a.id == "w1"));
}

#[tokio::test]
async fn dismissal_unblocks_the_worker_without_an_answer() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine = ScriptedEngine::new(vec![
        EngineEvent::Decision {
            questions: vec![HelpQuestion {
                header: "h".into(),
                prompt: "p".into(),
                options: vec![],
                multi_select: false,
            }],
        },
        EngineEvent::Done(None),
    ]);
    let resolutions = engine.resolutions.clone();
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, Duration::from_secs(5)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;
    console
        .submit_task("w1", "about to be dismissed", Default::default())
        .await
        .unwrap();

    eventually(|| !console.pending_help().is_empty()).await;
    let results = console.dismiss_all_help().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());

    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskComplete)
    })
    .await;
    assert_eq!(resolutions.lock().as_slice(), &[None]);
    assert!(console.pending_help().is_empty());
}

#[tokio::test]
async fn reconnect_rebuilds_the_timeline_from_the_durable_log() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine = ScriptedEngine::new(vec![
        EngineEvent::Progress(json!(1)),
        EngineEvent::Done(None),
    ]);
    let (_worker, _shutdown) = start_worker(broker.clone(), "w1", engine, ms(100)).await;

    eventually(|| console.agents().iter().any(|a| a.id == "w1")).await;
    console
        .submit_task("w1", "before the outage", Default::default())
        .await
        .unwrap();
    eventually(|| {
        console
            .events(None)
            .iter()
            .any(|e| e.kind == EventKind::TaskComplete)
    })
    .await;
    let durable_entries = broker.log_len(subjects::TASK_LOG);
    assert!(durable_entries >= 3);

    broker.drop_connections();
    // The manager reconnects on its own, clears the cache, and replays.
    eventually(|| {
        let events = console.events(None);
        events.iter().any(|e| e.kind == EventKind::TaskComplete)
            && events
                .iter()
                .any(|e| e.kind == EventKind::SystemNote)
    })
    .await;

    let events = console.events(None);
    let assigned = events.iter().filter(|e| e.kind == EventKind::TaskAssigned).count();
    let terminals = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskComplete | EventKind::TaskError))
        .count();
    // Replay reproduces the full history exactly once, no gaps.
    assert_eq!(assigned, 1);
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn events_can_be_filtered_per_agent() {
    let broker = Arc::new(MemoryBroker::new());
    let console = start_console(broker.clone()).await;
    let engine_a = ScriptedEngine::new(vec![EngineEvent::Done(None)]);
    let engine_b = ScriptedEngine::new(vec![EngineEvent::Done(None)]);
    let (_wa, _sa) = start_worker(broker.clone(), "alpha", engine_a, ms(100)).await;
    let (_wb, _sb) = start_worker(broker.clone(), "beta", engine_b, ms(100)).await;

    eventually(|| console.agents().len() == 2).await;
    console
        .submit_task("alpha", "a", Default::default())
        .await
        .unwrap();
    console
        .submit_task("beta", "b", Default::default())
        .await
        .unwrap();

    eventually(|| {
        console
            .events(None)
            .iter()
            .filter(|e| e.kind == EventKind::TaskComplete)
            .count()
            == 2
    })
    .await;

    let alpha_events = console.events(Some("alpha"));
    assert!(!alpha_events.is_empty());
    assert!(alpha_events
        .iter()
        .all(|e| e.agent_id.as_deref() == Some("alpha")));
}
