use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use session_broker_core::{
    Diagnostic, DiagnosticLog, EventKind, OperationContext, SessionStorage,
    config::SummaryConfig,
    traits::{GenerationError, GenerationRequest, TextGenerator},
};
use session_broker_executor::CommandExecutor;
use session_broker_session::{SessionManager, Summarizer, storage::FsStorage};
use tempfile::TempDir;
use tokio::sync::Notify;

struct AlwaysFails;

#[async_trait]
impl TextGenerator for AlwaysFails {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable("connection refused".into()))
    }
}

struct Echoes;

#[async_trait]
impl TextGenerator for Echoes {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let events = request.prompt.matches("EVENT ").count();
        Ok(format!(
            "```json\n{}\n```",
            json!({ "summary": "Repository at /work", "progress": format!("{events} events") })
        ))
    }
}

/// Holds its first call open until released, so tool calls can land while a
/// summary is in flight.
#[derive(Default)]
struct Gated {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for Gated {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let events = request.prompt.matches("EVENT ").count();
        Ok(json!({ "summary": format!("call {call}"), "progress": format!("{events} events") }).to_string())
    }
}

struct Fixture {
    root: TempDir,
    work: TempDir,
    manager: SessionManager<FsStorage>,
}

async fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::open(root.path()).await.unwrap());
    let manager = SessionManager::new(storage, CommandExecutor::new())
        .with_start_directory(work.path().canonicalize().unwrap());
    Fixture {
        root,
        work,
        manager,
    }
}

fn ctx(task: &str) -> OperationContext {
    OperationContext::new(task)
}

fn canonical(path: &Path) -> std::path::PathBuf {
    path.canonicalize().unwrap()
}

#[tokio::test]
async fn event_count_matches_completed_operations() {
    let f = fixture().await;
    let id = f.manager.create("count", "count things").await.unwrap().id;
    std::fs::create_dir(f.work.path().join("src")).unwrap();

    f.manager.cd(id, ctx("look"), "src").await.unwrap();
    f.manager
        .write(id, ctx("write"), "main.txt", "fn main() {}", false)
        .await
        .unwrap();
    f.manager.read(id, ctx("read"), "main.txt").await.unwrap();
    f.manager.read(id, ctx("read"), "missing.txt").await.unwrap_err();
    f.manager.record_user_request(id, "make it work").await.unwrap();
    f.manager.add_learning(id, ctx("learn"), "uses plain text").await.unwrap();

    let session = f.manager.current().await.unwrap();
    let events = f.manager.storage().events(id).await.unwrap();
    assert_eq!(session.event_count, 6);
    assert_eq!(events.len(), 6);

    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        [
            EventKind::Cd,
            EventKind::Write,
            EventKind::Read,
            EventKind::Read,
            EventKind::UserRequest,
            EventKind::Learning,
        ]
    );
    assert!(!events[3].succeeded());
}

#[tokio::test]
async fn concurrent_operations_on_one_session_are_all_counted() {
    let f = fixture().await;
    let id = f.manager.create("busy", "many writers").await.unwrap().id;
    let manager = Arc::new(f.manager);

    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .record_event(
                        id,
                        EventKind::Learning,
                        OperationContext::default(),
                        json!({ "learning": n }),
                        json!({ "success": true }),
                        0.0,
                    )
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(manager.current().await.unwrap().event_count, 16);
    assert_eq!(manager.storage().events(id).await.unwrap().len(), 16);
}

#[tokio::test]
async fn deleted_sessions_move_aside_and_free_the_name() {
    let f = fixture().await;
    let first = f.manager.create("reuse", "first").await.unwrap();
    f.manager.record_user_request(first.id, "hello").await.unwrap();

    assert!(f.manager.create("reuse", "again").await.is_err());
    let deleted = f.manager.delete("reuse").await.unwrap();
    assert!(deleted.is_deleted());
    assert!(f.manager.current().await.is_err());
    assert!(f.manager.open(&first.id.to_string()).await.is_err());

    let second = f.manager.create("reuse", "second").await.unwrap();
    assert_ne!(first.id, second.id);

    let listed = f.manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_active);
    assert_eq!(listed[0].session.id, second.id);
}

#[cfg(unix)]
#[tokio::test]
async fn run_follows_directory_changes_and_reports_exit_codes() {
    let f = fixture().await;
    let id = f.manager.create("shell", "run things").await.unwrap().id;
    std::fs::create_dir(f.work.path().join("build")).unwrap();

    let outcome = f
        .manager
        .run(id, ctx("configure"), "cd build && exit 1", None, None)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(1));

    let session = f.manager.current().await.unwrap();
    assert_eq!(session.current_directory, canonical(&f.work.path().join("build")));

    let pwd = f
        .manager
        .run(id, ctx("check"), "pwd -P", None, None)
        .await
        .unwrap();
    assert_eq!(pwd.stdout.trim(), session.current_directory.to_string_lossy());
}

#[cfg(unix)]
#[tokio::test]
async fn timed_out_run_is_recorded_and_reported() {
    let f = fixture().await;
    let id = f.manager.create("slow", "wait").await.unwrap().id;

    let err = f
        .manager
        .run(id, ctx("wait"), "sleep 5", Some(0.1), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), session_broker_core::ErrorKind::Timeout);

    let events = f.manager.storage().events(id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outputs["killed"], true);
    assert_eq!(events[0].error_text(), Some("timeout"));
}

#[tokio::test]
async fn failing_summarizer_never_affects_operations() {
    let mut f = fixture().await;
    let worker = f.manager.enable_summaries(
        Summarizer::new(Arc::new(AlwaysFails), "m"),
        &SummaryConfig::default(),
    );
    let handle = worker.spawn();

    let session = f.manager.create("steady", "keep going").await.unwrap();
    for n in 0..3 {
        f.manager
            .add_learning(session.id, ctx("learn"), &format!("fact {n}"))
            .await
            .unwrap();
    }

    let storage = Arc::clone(f.manager.storage());
    drop(f.manager);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let stored = storage.get(session.id).await.unwrap().unwrap();
    assert_eq!(stored.summary, session.summary);
    assert_eq!(stored.event_count, 3);
    assert_eq!(storage.events(session.id).await.unwrap().len(), 3);

    let errors = storage
        .diagnostics(session.id, DiagnosticLog::Errors)
        .await
        .unwrap();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|r| matches!(r, Diagnostic::SummaryFailed { .. })));
    let calls = storage
        .diagnostics(session.id, DiagnosticLog::LlmInteractions)
        .await
        .unwrap();
    assert_eq!(calls.len(), errors.len());

    let dir = f.root.path().join("sessions").join(session.id.to_string());
    assert!(dir.join("errors.jsonl").is_file());
    assert!(dir.join("llm.jsonl").is_file());
}

#[tokio::test]
async fn events_recorded_during_a_summary_survive_its_write_back() {
    let mut f = fixture().await;
    let generator = Arc::new(Gated::default());
    let worker = f.manager.enable_summaries(
        Summarizer::new(generator.clone(), "m"),
        &SummaryConfig::default(),
    );
    let handle = worker.spawn();

    let session = f.manager.create("race", "overlap").await.unwrap();
    f.manager.record_user_request(session.id, "start").await.unwrap();
    generator.entered.notified().await;

    f.manager.add_learning(session.id, ctx("learn"), "one").await.unwrap();
    f.manager.add_learning(session.id, ctx("learn"), "two").await.unwrap();
    let storage = Arc::clone(f.manager.storage());
    let mid = storage.get(session.id).await.unwrap().unwrap();
    assert_eq!(mid.event_count, 3);
    assert_eq!(mid.summary, session.summary);

    generator.release.notify_one();
    drop(f.manager);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let stored = storage.get(session.id).await.unwrap().unwrap();
    assert_eq!(stored.event_count, 3);
    assert_eq!(storage.events(session.id).await.unwrap().len(), 3);
    assert_eq!(stored.summary, "call 2");
    assert_eq!(stored.progress, "2 events");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn working_summarizer_updates_summary_and_progress() {
    let mut f = fixture().await;
    let worker = f.manager.enable_summaries(
        Summarizer::new(Arc::new(Echoes), "m"),
        &SummaryConfig::default(),
    );
    let handle = worker.spawn();

    let session = f.manager.create("notes", "take notes").await.unwrap();
    f.manager.record_user_request(session.id, "summarize me").await.unwrap();

    let storage = Arc::clone(f.manager.storage());
    drop(f.manager);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let stored = storage.get(session.id).await.unwrap().unwrap();
    assert_eq!(stored.summary, "Repository at /work");
    assert_eq!(stored.progress, "1 events");
    assert_eq!(stored.event_count, 1);
}
