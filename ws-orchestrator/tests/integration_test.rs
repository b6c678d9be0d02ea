//! Integration tests for the ws-orchestrator stores
//!
//! Covers the job ledger's ordering, monotonic state rule and claim
//! semantics, and the workspace store's tombstone handling.

use std::collections::HashMap;
use std::time::Duration;

use ws_core::{GitRepository, Workspace};
use ws_orchestrator::test_utils::create_test_db;
use ws_orchestrator::{
    GitStatus, Job, JobAction, JobFilter, JobState, JobStore, OrchestratorError, ResourceType,
    WorkspaceMetadata, WorkspaceMetadataStore, WorkspaceStore,
};

fn workspace(id: &str, name: &str) -> Workspace {
    Workspace {
        id: id.to_string(),
        name: name.to_string(),
        image: "ubuntu:22.04".into(),
        user: "ws".into(),
        repository: GitRepository {
            url: "https://github.com/acme/widget".into(),
            ..Default::default()
        },
        target_id: "t1".into(),
        api_key: format!("key-{}", id),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_job_save_and_find_latest() {
    let jobs = JobStore::new(create_test_db().await);

    let create = Job::new("w1", ResourceType::Workspace, JobAction::Create, None);
    let start = Job::new("w1", ResourceType::Workspace, JobAction::Start, None);
    jobs.save(&create).await.unwrap();
    jobs.save(&start).await.unwrap();

    let latest = jobs.find(&JobFilter::resource("w1")).await.unwrap();
    assert_eq!(latest.id, start.id);

    let all = jobs.list(&JobFilter::resource("w1")).await.unwrap();
    assert_eq!(
        all.iter().map(|j| j.action).collect::<Vec<_>>(),
        vec![JobAction::Start, JobAction::Create]
    );

    let creates = jobs
        .list(&JobFilter::resource("w1").action(JobAction::Create))
        .await
        .unwrap();
    assert_eq!(creates.len(), 1);
}

#[tokio::test]
async fn test_job_find_missing() {
    let jobs = JobStore::new(create_test_db().await);

    let err = jobs.find(&JobFilter::resource("nope")).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::JobNotFound(_)));
}

#[tokio::test]
async fn test_job_filter_by_state() {
    let jobs = JobStore::new(create_test_db().await);
    let a = Job::new("w1", ResourceType::Workspace, JobAction::Create, None);
    let b = Job::new("w2", ResourceType::Workspace, JobAction::Create, None);
    jobs.save(&a).await.unwrap();
    jobs.save(&b).await.unwrap();
    jobs.complete(&a.id, None).await.unwrap();

    let pending = jobs
        .list(&JobFilter::default().states(&[JobState::Pending]))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b.id);

    let none = jobs.list(&JobFilter::default().states(&[])).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_job_state_never_regresses() {
    let jobs = JobStore::new(create_test_db().await);
    let mut job = Job::new("w1", ResourceType::Workspace, JobAction::Create, None);
    jobs.save(&job).await.unwrap();

    job.state = JobState::Running;
    jobs.save(&job).await.unwrap();

    job.state = JobState::Pending;
    let err = jobs.save(&job).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));

    jobs.complete(&job.id, Some("clone failed".into())).await.unwrap();
    let err = jobs.complete(&job.id, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));

    let stored = jobs
        .find(&JobFilter {
            id: Some(job.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.state, JobState::Error);
    assert_eq!(stored.error.as_deref(), Some("clone failed"));
}

fn by_id(id: &str) -> JobFilter {
    JobFilter {
        id: Some(id.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_finished_job_cannot_be_rewritten() {
    let jobs = JobStore::new(create_test_db().await);
    let mut job = Job::new("w1", ResourceType::Workspace, JobAction::Create, Some("runner-a".into()));
    job.state = JobState::Error;
    job.error = Some("clone failed".into());
    jobs.save(&job).await.unwrap();

    // Retrying the same write is harmless.
    jobs.save(&job).await.unwrap();

    let mut rewritten = job.clone();
    rewritten.error = Some("rewritten later".into());
    rewritten.runner_id = Some("other-runner".into());
    let err = jobs.save(&rewritten).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));

    let stored = jobs.find(&by_id(&job.id)).await.unwrap();
    assert_eq!(stored.error.as_deref(), Some("clone failed"));
    assert_eq!(stored.runner_id.as_deref(), Some("runner-a"));
}

#[tokio::test]
async fn test_abandon_runner_fails_only_its_running_jobs() {
    let jobs = JobStore::new(create_test_db().await);
    let mine = Job::new("w1", ResourceType::Workspace, JobAction::Create, Some("runner-a".into()));
    let theirs = Job::new("w2", ResourceType::Workspace, JobAction::Create, Some("runner-b".into()));
    let queued = Job::new("w1", ResourceType::Workspace, JobAction::Start, Some("runner-a".into()));
    for job in [&mine, &theirs, &queued] {
        jobs.save(job).await.unwrap();
    }
    assert!(jobs.claim(&mine.id, "runner-a").await.unwrap());
    assert!(jobs.claim(&theirs.id, "runner-b").await.unwrap());

    assert_eq!(jobs.abandon_runner("runner-a").await.unwrap(), 1);

    let abandoned = jobs.find(&by_id(&mine.id)).await.unwrap();
    assert_eq!(abandoned.state, JobState::Error);
    assert!(abandoned.error.unwrap().contains("runner runner-a restarted"));
    assert_eq!(jobs.find(&by_id(&theirs.id)).await.unwrap().state, JobState::Running);
    assert_eq!(jobs.find(&by_id(&queued.id)).await.unwrap().state, JobState::Pending);

    // The workspace is no longer blocked.
    assert!(jobs.claim(&queued.id, "runner-a").await.unwrap());
}

#[tokio::test]
async fn test_expire_running_respects_lease_and_heartbeat() {
    let jobs = JobStore::new(create_test_db().await);
    let stale = Job::new("w1", ResourceType::Workspace, JobAction::Create, None);
    let pending = Job::new("w2", ResourceType::Workspace, JobAction::Create, None);
    let finished = Job::new("w3", ResourceType::Workspace, JobAction::Create, None);
    for job in [&stale, &pending, &finished] {
        jobs.save(job).await.unwrap();
    }
    assert!(jobs.claim(&stale.id, "runner-a").await.unwrap());
    jobs.complete(&finished.id, None).await.unwrap();

    assert_eq!(jobs.expire_running(Duration::from_secs(600)).await.unwrap(), 0);
    assert_eq!(jobs.heartbeat("runner-a").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(jobs.expire_running(Duration::from_millis(5)).await.unwrap(), 1);

    let expired = jobs.find(&by_id(&stale.id)).await.unwrap();
    assert_eq!(expired.state, JobState::Error);
    assert!(expired.error.unwrap().starts_with("expired"));
    assert_eq!(jobs.find(&by_id(&pending.id)).await.unwrap().state, JobState::Pending);
    let done = jobs.find(&by_id(&finished.id)).await.unwrap();
    assert_eq!(done.state, JobState::Success);
    assert!(done.error.is_none());
}

#[tokio::test]
async fn test_claim_has_single_winner() {
    let jobs = JobStore::new(create_test_db().await);
    let job = Job::new("w1", ResourceType::Workspace, JobAction::Create, None);
    jobs.save(&job).await.unwrap();

    let (a, b) = tokio::join!(jobs.claim(&job.id, "runner-a"), jobs.claim(&job.id, "runner-b"));
    let winners = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1);

    let claimed = jobs.find(&JobFilter::resource("w1")).await.unwrap();
    assert_eq!(claimed.state, JobState::Running);
    assert!(claimed.runner_id.is_some());
}

#[tokio::test]
async fn test_claim_respects_runner_and_resource() {
    let jobs = JobStore::new(create_test_db().await);
    let mine = Job::new("w1", ResourceType::Workspace, JobAction::Start, Some("runner-a".into()));
    jobs.save(&mine).await.unwrap();
    assert!(!jobs.claim(&mine.id, "runner-b").await.unwrap());
    assert!(jobs.claim(&mine.id, "runner-a").await.unwrap());

    // A second job for the same workspace waits for the first to finish.
    let next = Job::new("w1", ResourceType::Workspace, JobAction::Stop, None);
    jobs.save(&next).await.unwrap();
    assert!(!jobs.claim(&next.id, "runner-a").await.unwrap());

    jobs.complete(&mine.id, None).await.unwrap();
    assert!(jobs.claim(&next.id, "runner-a").await.unwrap());
}

#[tokio::test]
async fn test_store_soft_delete_and_purge() {
    let store = WorkspaceStore::new(create_test_db().await);
    store.insert(&workspace("w1", "alpha")).await.unwrap();

    let err = store.insert(&workspace("w2", "alpha")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyExists(name) if name == "alpha"));

    store.mark_deleted("w1").await.unwrap();
    assert!(matches!(
        store.find("w1", false).await.unwrap_err(),
        OrchestratorError::Deleted(_)
    ));
    assert!(store.find("w1", true).await.unwrap().deleted);
    assert!(store.list(false).await.unwrap().is_empty());
    assert_eq!(store.list(true).await.unwrap().len(), 1);

    // The tombstone no longer reserves the name.
    store.insert(&workspace("w2", "alpha")).await.unwrap();
    let by_name = store.find("alpha", false).await.unwrap();
    assert_eq!(by_name.workspace.id, "w2");

    store.purge("w1").await.unwrap();
    assert!(matches!(
        store.find("w1", true).await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_store_round_trips_workspace_fields() {
    let store = WorkspaceStore::new(create_test_db().await);
    let mut ws = workspace("w1", "alpha");
    ws.env_vars = HashMap::from([("FOO".to_string(), "bar".to_string())]);
    ws.build_config = Some(Default::default());
    ws.git_provider_config_id = Some("github".into());
    store.insert(&ws).await.unwrap();

    let found = store.find("w1", false).await.unwrap();

    assert_eq!(found.workspace, ws);
    assert!(!found.deleted);
}

#[tokio::test]
async fn test_metadata_upsert() {
    let pool = create_test_db().await;
    let store = WorkspaceMetadataStore::new(pool);
    assert!(store.find("w1").await.unwrap().is_none());

    store
        .save(
            "w1",
            &WorkspaceMetadata {
                uptime: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let saved = store
        .save(
            "w1",
            &WorkspaceMetadata {
                uptime: 20,
                git_status: Some(GitStatus {
                    current_branch: "main".into(),
                    ..Default::default()
                }),
                updated_at: None,
            },
        )
        .await
        .unwrap();
    assert!(saved.updated_at.is_some());

    let found = store.find("w1").await.unwrap().unwrap();
    assert_eq!(found.uptime, 20);
    assert_eq!(found.git_status.unwrap().current_branch, "main");
}
