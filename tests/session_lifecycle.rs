mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use analysis_orchestrator::error::SessionError;
use analysis_orchestrator::sandbox::{ContainerStatus, SandboxError};
use analysis_orchestrator::session::{Owner, SessionStatus};

use common::TestEnv;

#[tokio::test]
async fn test_concurrent_creates_get_disjoint_ports() {
    let env = TestEnv::new();
    let registry = Arc::new(env.session_registry().await);

    let creates = (0..8).map(|i| {
        let registry = Arc::clone(&registry);
        async move { registry.create_session(Owner::new(format!("user{i}@x.com"))).await }
    });
    let results = futures::future::join_all(creates).await;

    let mut ports = HashSet::new();
    for result in results {
        let (session_id, _) = result.unwrap();
        let session = registry.get(&session_id).await.unwrap();
        assert!((5100..=5999).contains(&session.container_port));
        assert!(ports.insert(session.container_port), "port handed out twice");
    }
    assert_eq!(registry.list().await.len(), 8);
    assert_eq!(env.runtime.running_count(), 8);
}

#[tokio::test]
async fn test_created_session_is_live_with_mounts() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (session_id, container_id) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let session = registry.get_session_container(&session_id).await.unwrap();

    assert_eq!(session.container_id, container_id);
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.container_ip.is_some());
    assert!(session.input_dir.is_dir());
    assert!(session.output_dir.is_dir());

    let spec = env.runtime.launched().pop().unwrap();
    assert_eq!(spec.host_port, session.container_port);
    assert_eq!(spec.container_port, 5001);
    assert!(spec.name.starts_with("session-"));
    assert_eq!(
        spec.binds(),
        vec![
            format!(
                "{}:/app/execution_layer/input_data:ro",
                session.input_dir.display()
            ),
            format!(
                "{}:/app/execution_layer/output_data:rw",
                session.output_dir.display()
            ),
        ]
    );

    // Persisted on every mutation.
    let snapshot = std::fs::read_to_string(env.config.storage.sessions_file()).unwrap();
    assert!(snapshot.contains(&session_id));
}

#[tokio::test]
async fn test_donor_input_migrates_and_donor_is_deleted() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (donor_id, donor_container) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let donor = registry.get(&donor_id).await.unwrap();
    std::fs::write(donor.input_dir.join("f.pkl"), b"pickled").unwrap();

    let (session_id, _) = registry.create_session(Owner::new("A@X.com")).await.unwrap();
    let session = registry.get(&session_id).await.unwrap();

    assert_eq!(
        std::fs::read(session.input_dir.join("f.pkl")).unwrap(),
        b"pickled".to_vec()
    );
    assert!(registry.get(&donor_id).await.is_none());
    assert!(!env.runtime.exists(&donor_container));
    assert!(!donor.input_dir.exists());
    assert!(registry.has_input_data(&session_id));
}

#[tokio::test]
async fn test_empty_newer_session_is_skipped_as_donor() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (older_id, _) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (newer_id, _) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let older = registry.get(&older_id).await.unwrap();
    std::fs::write(older.input_dir.join("f.pkl"), b"older").unwrap();

    let (session_id, _) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let session = registry.get(&session_id).await.unwrap();

    assert_eq!(
        std::fs::read(session.input_dir.join("f.pkl")).unwrap(),
        b"older".to_vec()
    );
    assert!(registry.get(&older_id).await.is_none());
    assert!(registry.get(&newer_id).await.is_some());
}

#[tokio::test]
async fn test_sessions_without_owner_never_donate() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (first_id, _) = registry.create_session(Owner::anonymous()).await.unwrap();
    let first = registry.get(&first_id).await.unwrap();
    std::fs::write(first.input_dir.join("data.csv"), "a,b\n").unwrap();

    let (second_id, _) = registry.create_session(Owner::anonymous()).await.unwrap();
    let second = registry.get(&second_id).await.unwrap();

    assert!(!second.input_dir.join("data.csv").exists());
    assert!(registry.get(&first_id).await.is_some());
    assert!(registry.has_input_data(&first_id));
    assert!(!registry.has_input_data(&second_id));
}

#[tokio::test]
async fn test_other_owners_session_is_not_a_donor() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (first_id, _) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let first = registry.get(&first_id).await.unwrap();
    std::fs::write(first.input_dir.join("f.pkl"), b"x").unwrap();

    let (second_id, _) = registry.create_session(Owner::new("b@x.com")).await.unwrap();
    assert!(!registry.has_input_data(&second_id));
    assert!(registry.get(&first_id).await.is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_input_and_removes_output() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (session_id, container_id) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let session = registry.get(&session_id).await.unwrap();
    std::fs::write(session.input_dir.join("f.pkl"), b"x").unwrap();
    std::fs::write(session.output_dir.join("scratch.txt"), b"x").unwrap();

    assert!(registry.cleanup_session(&session_id).await.unwrap());

    let row = registry.get(&session_id).await.unwrap();
    assert_eq!(row.status, SessionStatus::Cleaned);
    assert!(!env.runtime.exists(&container_id));
    assert!(!session.output_dir.exists());
    assert!(session.input_dir.join("f.pkl").exists());
    assert!(registry.get_session_container(&session_id).await.is_none());

    // Idempotent.
    assert!(!registry.cleanup_session(&session_id).await.unwrap());
    assert!(!registry.cleanup_session("no-such-session").await.unwrap());
}

#[tokio::test]
async fn test_cleanup_tolerates_missing_container() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (session_id, container_id) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    env.runtime.remove_externally(&container_id);

    assert!(registry.cleanup_session(&session_id).await.unwrap());
    assert_eq!(
        registry.get(&session_id).await.unwrap().status,
        SessionStatus::Cleaned
    );
}

#[tokio::test]
async fn test_dead_container_makes_session_inactive() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (stopped_id, stopped_container) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let (removed_id, removed_container) = registry.create_session(Owner::new("b@x.com")).await.unwrap();
    env.runtime.stop_externally(&stopped_container);
    env.runtime.remove_externally(&removed_container);

    assert!(registry.get_session_container(&stopped_id).await.is_none());
    assert!(registry.get_session_container(&removed_id).await.is_none());
    assert_eq!(
        registry.get(&stopped_id).await.unwrap().status,
        SessionStatus::Inactive
    );
    assert_eq!(
        registry.get(&removed_id).await.unwrap().status,
        SessionStatus::Inactive
    );

    // Inactive sessions are not restarted on request.
    assert!(!registry.restart_session(&stopped_id).await.unwrap());
}

#[tokio::test]
async fn test_restart_live_session() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (session_id, container_id) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    assert!(registry.restart_session(&session_id).await.unwrap());
    assert_eq!(env.runtime.status_of(&container_id), Some(ContainerStatus::Running));
    assert!(!registry.restart_session("unknown").await.unwrap());
}

#[tokio::test]
async fn test_recovery_revives_or_drops_sessions() {
    let env = TestEnv::new();
    let (healthy, stopped, removed, stuck, cleaned) = {
        let registry = env.session_registry().await;
        let healthy = registry.create_session(Owner::new("a@x.com")).await.unwrap();
        let stopped = registry.create_session(Owner::new("b@x.com")).await.unwrap();
        let removed = registry.create_session(Owner::new("c@x.com")).await.unwrap();
        let stuck = registry.create_session(Owner::new("d@x.com")).await.unwrap();
        let cleaned = registry.create_session(Owner::new("e@x.com")).await.unwrap();
        registry.cleanup_session(&cleaned.0).await.unwrap();
        (healthy, stopped, removed, stuck, cleaned)
    };

    env.runtime.stop_externally(&stopped.1);
    env.runtime.remove_externally(&removed.1);
    env.runtime.stop_externally(&stuck.1);
    env.runtime.refuse_start(&stuck.1);

    let registry = env.session_registry().await;
    let mut recovered: Vec<String> = registry
        .list()
        .await
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    recovered.sort();
    let mut expected = vec![healthy.0.clone(), stopped.0.clone()];
    expected.sort();
    assert_eq!(recovered, expected);

    assert_eq!(env.runtime.status_of(&stopped.1), Some(ContainerStatus::Running));
    for session in registry.list().await {
        assert_eq!(session.status, SessionStatus::Active);
    }
    assert!(registry.get(&cleaned.0).await.is_none());
}

#[tokio::test]
async fn test_failed_launch_leaves_nothing_behind() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    env.runtime.fail_next_launch();
    let err = registry.create_session(Owner::new("a@x.com")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Sandbox(SandboxError::ContainerLaunchFailed { .. })
    ));
    assert!(registry.list().await.is_empty());

    let input_root = env.config.storage.data_dir().join("input_data");
    let leftovers = std::fs::read_dir(&input_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    // The reserved port went back to the pool.
    registry.create_session(Owner::new("a@x.com")).await.unwrap();
}

#[tokio::test]
async fn test_port_exhaustion() {
    let port = common::free_port();
    let env = TestEnv::with_single_port(port);
    let registry = env.session_registry().await;

    registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let err = registry.create_session(Owner::new("b@x.com")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Sandbox(SandboxError::PortExhausted { .. })
    ));
}

#[tokio::test]
async fn test_cleanup_inactive_sweeps_old_sessions_once() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    registry.create_session(Owner::new("a@x.com")).await.unwrap();
    registry.create_session(Owner::new("b@x.com")).await.unwrap();

    assert_eq!(registry.cleanup_inactive(Duration::from_secs(3600)).await, 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(registry.cleanup_inactive(Duration::ZERO).await, 2);
    assert_eq!(registry.cleanup_inactive(Duration::ZERO).await, 0);
    assert_eq!(env.runtime.running_count(), 0);
}

#[tokio::test]
async fn test_session_status_and_ownership() {
    let env = TestEnv::new();
    let registry = env.session_registry().await;

    let (session_id, container_id) = registry.create_session(Owner::new("a@x.com")).await.unwrap();
    let report = registry.session_status(&session_id).await.unwrap();
    assert_eq!(report.container_id, container_id);
    assert_eq!(report.status, SessionStatus::Active);
    assert!(report.uptime_secs >= 0);

    assert!(registry.check_ownership(&session_id, "A@x.com").await);
    assert!(!registry.check_ownership(&session_id, "b@x.com").await);
    assert!(registry.session_status("missing").await.is_none());
    assert!(!registry.has_input_data("../../etc"));
}
