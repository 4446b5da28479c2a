//! Session and sandbox lifecycle tests against the in-memory runtime.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{Failures, events, harness, harness_with};
use sandterm::container::{LABEL_ENVIRONMENT, LABEL_USER, validate_container_name};
use sandterm::session::{
    CreateSessionRequest, IdleReaper, SessionError, SessionState, VolumeResolver,
};

fn request(environment: &str, shell: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        environment: environment.to_string(),
        shell: shell.to_string(),
        cols: 80,
        rows: 24,
    }
}

#[tokio::test]
async fn test_create_session_registers_running_sandbox() {
    let h = harness();
    let (tx, _rx) = events();

    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "zsh"), tx)
        .await
        .expect("create session");

    assert_eq!((session.cols, session.rows), (80, 24));
    assert_eq!(session.user_id, "u1");
    assert_eq!(session.container_name, format!("sandterm-{}", session.session_id));

    let stored = h.engine.registry().get(&session.session_id).unwrap();
    assert!(!stored.container_id.is_empty());
    assert!(h.runtime.is_running(&stored.container_id));

    let spec = h.runtime.spec(&stored.container_id).unwrap();
    assert_eq!(spec.labels.get(LABEL_USER).map(String::as_str), Some("u1"));
    assert_eq!(
        spec.labels.get(LABEL_ENVIRONMENT).map(String::as_str),
        Some("default")
    );
    assert_eq!(spec.image, "sandterm/base:latest");
    assert!(spec.tty && spec.open_stdin && spec.auto_remove);
    assert_eq!(spec.network_mode.as_deref(), Some("none"));
    assert_eq!(spec.env.get("SANDTERM_USER").map(String::as_str), Some("u1"));
    assert_eq!(
        spec.env.get("SANDTERM_SESSION"),
        Some(&session.session_id)
    );
    assert_eq!(spec.volumes.len(), 1);
    assert_eq!(spec.volumes[0].volume, session.volume_name);
    assert_eq!(spec.workdir.as_deref(), Some("/home/sandbox"));
    assert!(spec.limits.memory_bytes.is_some());
    assert!(spec.limits.pids_limit.is_some());

    assert_eq!(
        h.runtime.exec_commands(&stored.container_id),
        vec![vec!["zsh".to_string(), "-l".to_string()]]
    );
    let exec_id = stored.exec_id.clone().expect("exec recorded");
    assert_eq!(h.runtime.state().resizes, vec![(exec_id, 24, 80)]);

    assert!(h.engine.bridge().is_attached(&session.session_id));
    assert!(h.engine.telemetry().is_observing(&stored.container_id));
}

#[tokio::test]
async fn test_concurrent_creates_share_volume() {
    let h = harness();
    let (tx_a, _rx_a) = events();
    let (tx_b, _rx_b) = events();
    let sessions = h.engine.sessions();

    let (a, b) = tokio::join!(
        sessions.create_session("u1", request("default", "bash"), tx_a),
        sessions.create_session("u1", request("default", "bash"), tx_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.volume_name, b.volume_name);
    assert_eq!(a.volume_name, VolumeResolver::volume_name("u1", "default"));
    assert_ne!(a.container_id, b.container_id);
    assert_ne!(a.session_id, b.session_id);

    let state = h.runtime.state();
    assert_eq!(state.volumes.len(), 1);
    assert_eq!(state.volume_create_calls, 2);
}

#[tokio::test]
async fn test_create_failure_registers_nothing() {
    let h = harness();
    h.runtime.set_failures(Failures {
        create_container: true,
        ..Failures::default()
    });

    let (tx, _rx) = events();
    let err = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::SandboxCreation { .. }));
    assert_eq!(err.code(), "SANDBOX_CREATION_FAILED");
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_start_failure_removes_container() {
    let h = harness();
    h.runtime.set_failures(Failures {
        start_container: true,
        ..Failures::default()
    });

    let (tx, _rx) = events();
    let err = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::SandboxCreation { .. }));
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.runtime.state().removed.len(), 1);
}

#[tokio::test]
async fn test_volume_failure_is_reported() {
    let h = harness();
    h.runtime.set_failures(Failures {
        create_volume: true,
        ..Failures::default()
    });

    let (tx, _rx) = events();
    let err = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Volume { .. }));
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_unknown_environment_is_rejected() {
    let h = harness();
    let (tx, _rx) = events();

    let err = h
        .engine
        .sessions()
        .create_session("u1", request("gpu", "bash"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(h.runtime.state().volume_create_calls, 0);
}

#[tokio::test]
async fn test_attach_failure_stops_container() {
    let h = harness();
    h.runtime.set_failures(Failures {
        create_exec: true,
        ..Failures::default()
    });

    let (tx, _rx) = events();
    let err = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Attach { .. }));
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.runtime.state().stopped.len(), 1);
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_terminate_removes_session_even_when_stop_fails() {
    let h = harness();
    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    h.runtime.set_failures(Failures {
        stop_container: true,
        ..Failures::default()
    });

    let stopped = h.engine.manager().terminate_sandbox(&session.session_id).await;
    assert!(!stopped);
    assert!(h.engine.registry().get(&session.session_id).is_none());

    // A second termination finds nothing.
    assert!(!h.engine.manager().terminate_sandbox(&session.session_id).await);
}

#[tokio::test]
async fn test_close_session_tears_everything_down() {
    let h = harness();
    let (tx, mut rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    assert!(h.engine.sessions().close_session(&session.session_id).await);

    assert!(h.engine.registry().is_empty());
    assert!(!h.engine.bridge().is_attached(&session.session_id));
    assert!(!h.engine.telemetry().is_observing(&session.container_id));
    assert!(!h.runtime.is_running(&session.container_id));

    // Relaying stopped before the sandbox went away, so no close event.
    assert!(rx.recv().await.is_none());

    assert!(!h.engine.sessions().close_session(&session.session_id).await);
}

#[tokio::test]
async fn test_idle_session_is_reaped_after_threshold() {
    let h = harness_with(|c| c.sandbox.idle_timeout = Duration::from_secs(1));
    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    assert_eq!(h.engine.manager().cleanup_idle().await, 0);

    h.clock.advance(ChronoDuration::seconds(2));
    assert_eq!(h.engine.manager().cleanup_idle().await, 1);

    assert!(h.engine.registry().get(&session.session_id).is_none());
    assert!(h.runtime.state().stopped.contains(&session.container_id));
    assert!(!h.runtime.is_running(&session.container_id));
}

#[tokio::test]
async fn test_cleanup_spares_recently_active_sessions() {
    let h = harness_with(|c| c.sandbox.idle_timeout = Duration::from_secs(60));
    let sessions = h.engine.sessions();
    let (tx_a, _rx_a) = events();
    let (tx_b, _rx_b) = events();
    let idle = sessions
        .create_session("u1", request("default", "bash"), tx_a)
        .await
        .unwrap();
    let busy = sessions
        .create_session("u2", request("default", "bash"), tx_b)
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::seconds(50));
    assert!(sessions.send_input(&busy.session_id, b"ls\n").await);
    h.clock.advance(ChronoDuration::seconds(20));

    let reaper = IdleReaper::new(h.engine.manager().clone(), Duration::from_secs(300));
    assert_eq!(reaper.run_once().await, 1);

    assert!(h.engine.registry().get(&idle.session_id).is_none());
    assert!(h.engine.registry().get(&busy.session_id).is_some());
    assert!(h.runtime.is_running(&busy.container_id));
}

#[tokio::test]
async fn test_cleanup_continues_past_failed_stops() {
    let h = harness_with(|c| c.sandbox.idle_timeout = Duration::from_secs(1));
    let sessions = h.engine.sessions();
    for user in ["u1", "u2", "u3"] {
        let (tx, _rx) = events();
        sessions
            .create_session(user, request("default", "bash"), tx)
            .await
            .unwrap();
    }

    h.runtime.set_failures(Failures {
        stop_container: true,
        ..Failures::default()
    });
    h.clock.advance(ChronoDuration::seconds(5));

    assert_eq!(h.engine.manager().cleanup_idle().await, 3);
    assert!(h.engine.registry().is_empty());
}

#[tokio::test]
async fn test_hung_stops_do_not_hold_up_the_sweep() {
    let h = harness_with(|c| c.sandbox.idle_timeout = Duration::from_secs(1));
    let sessions = h.engine.sessions();
    let mut created = Vec::new();
    for user in ["u1", "u2", "u3"] {
        let (tx, _rx) = events();
        created.push(
            sessions
                .create_session(user, request("default", "bash"), tx)
                .await
                .unwrap(),
        );
    }

    // Two stops never finish on their own.
    let hung: Vec<String> = created[..2].iter().map(|s| s.container_id.clone()).collect();
    h.runtime.set_failures(Failures {
        stop_delays: hung
            .iter()
            .map(|id| (id.clone(), Duration::from_secs(3600)))
            .collect::<HashMap<_, _>>(),
        ..Failures::default()
    });
    h.clock.advance(ChronoDuration::seconds(5));

    tokio::time::pause();
    let started = tokio::time::Instant::now();
    assert_eq!(h.engine.manager().cleanup_idle().await, 3);
    let elapsed = started.elapsed();

    // One stop timeout overall, not one per hung container.
    let stop_timeout = h.engine.manager().config().stop_timeout();
    assert!(elapsed >= stop_timeout, "{elapsed:?}");
    assert!(elapsed < stop_timeout * 2, "{elapsed:?}");

    assert!(h.engine.registry().is_empty());
    let stopped = h.runtime.state().stopped.clone();
    assert!(stopped.contains(&created[2].container_id));
    assert!(hung.iter().all(|id| !stopped.contains(id)));
}

#[tokio::test]
async fn test_expired_session_is_reaped_despite_activity() {
    let h = harness_with(|c| {
        c.sandbox.idle_timeout = Duration::from_secs(30 * 60);
        c.sandbox.max_lifetime = Duration::from_secs(65 * 60);
    });
    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    for _ in 0..3 {
        h.clock.advance(ChronoDuration::minutes(20));
        assert!(h.engine.sessions().keepalive(&session.session_id));
        assert_eq!(h.engine.manager().cleanup_idle().await, 0);
    }

    h.clock.advance(ChronoDuration::minutes(6));
    assert_eq!(h.engine.manager().cleanup_idle().await, 1);
    assert!(h.engine.registry().is_empty());
}

#[tokio::test]
async fn test_discovery_partitions_tracked_and_orphaned() {
    let h = harness();
    let orphan = h.runtime.insert_orphan("ghost", "u9");
    // Neither of these follows the sandbox convention.
    h.runtime.insert_container("postgres", &[]);
    h.runtime
        .insert_container("sandterm-half", &[("sandterm.managed", "true")]);

    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    let discovery = h.engine.manager().discover_sandboxes().await.unwrap();
    assert_eq!(discovery.tracked.len(), 1);
    assert_eq!(discovery.tracked[0].id, session.container_id);
    assert_eq!(discovery.orphaned.len(), 1);
    assert_eq!(discovery.orphaned[0].id, orphan);
    assert_eq!(discovery.orphaned[0].user(), Some("u9"));
}

#[tokio::test]
async fn test_terminate_orphan_refuses_tracked_containers() {
    let h = harness();
    let orphan = h.runtime.insert_orphan("ghost", "u9");
    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();
    let manager = h.engine.manager();

    let err = manager
        .terminate_orphan(&session.container_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert!(h.runtime.is_running(&session.container_id));

    let record = manager.terminate_orphan("sandterm-ghost").await.unwrap();
    assert_eq!(record.id, orphan);
    assert!(!h.runtime.is_running(&orphan));

    let err = manager.terminate_orphan(&orphan).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    let discovery = manager.discover_sandboxes().await.unwrap();
    assert!(discovery.orphaned.is_empty());
}

#[tokio::test]
async fn test_discovery_listing_is_cached_and_invalidated() {
    let h = harness_with(|c| c.sandbox.discovery_ttl = Duration::from_secs(60));
    let manager = h.engine.manager();

    let results = futures::future::join_all((0..5).map(|_| manager.discover_sandboxes())).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.runtime.state().list_calls, 1);

    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();

    let discovery = manager.discover_sandboxes().await.unwrap();
    assert_eq!(h.runtime.state().list_calls, 2);
    assert_eq!(discovery.tracked[0].id, session.container_id);
}

#[tokio::test]
async fn test_session_limit_per_user() {
    let h = harness_with(|c| c.sandbox.max_sessions_per_user = 2);
    let sessions = h.engine.sessions();

    let mut created = Vec::new();
    for _ in 0..2 {
        let (tx, _rx) = events();
        created.push(
            sessions
                .create_session("u1", request("default", "bash"), tx)
                .await
                .unwrap(),
        );
    }

    let (tx, _rx) = events();
    let err = sessions
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::LimitReached { limit: 2, .. }));

    let (tx, _rx) = events();
    assert!(
        sessions
            .create_session("u2", request("default", "bash"), tx)
            .await
            .is_ok()
    );

    assert!(sessions.close_session(&created[0].session_id).await);
    let (tx, _rx) = events();
    assert!(
        sessions
            .create_session("u1", request("default", "bash"), tx)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_shutdown_terminates_all_sessions() {
    let h = harness();
    for user in ["u1", "u2"] {
        let (tx, _rx) = events();
        h.engine
            .sessions()
            .create_session(user, request("python", "bash"), tx)
            .await
            .unwrap();
    }
    h.engine.start_background_tasks();

    assert_eq!(h.engine.shutdown().await, 2);
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.engine.telemetry().subscription_count(), 0);
}

#[tokio::test]
async fn test_long_user_id_gets_valid_volume() {
    let h = harness();
    let user = "u".repeat(200);
    let (tx, _rx) = events();

    let session = h
        .engine
        .sessions()
        .create_session(&user, request("default", "bash"), tx)
        .await
        .expect("create session");

    assert!(validate_container_name(&session.volume_name).is_ok());
    assert!(h.runtime.state().volumes.contains_key(&session.volume_name));
    let spec = h.runtime.spec(&session.container_id).unwrap();
    assert_eq!(spec.volumes[0].volume, session.volume_name);
}

#[tokio::test]
async fn test_provisioning_moves_through_requested_and_creating() {
    let h = harness();
    let manager = h.engine.manager();

    let guard = manager.begin_provisioning("s1");
    assert_eq!(manager.provisioning_state("s1"), Some(SessionState::Requested));
    assert!(manager.is_tracked("s1"));

    assert!(!guard.advance(SessionState::Running));
    assert!(guard.advance(SessionState::Creating));
    assert_eq!(manager.provisioning_state("s1"), Some(SessionState::Creating));
    assert!(!guard.advance(SessionState::Requested));

    drop(guard);
    assert_eq!(manager.provisioning_state("s1"), None);
    assert!(!manager.is_tracked("s1"));

    // A finished create leaves only the registered session behind.
    let (tx, _rx) = events();
    let session = h
        .engine
        .sessions()
        .create_session("u1", request("default", "bash"), tx)
        .await
        .unwrap();
    assert_eq!(manager.provisioning_state(&session.session_id), None);
    assert!(manager.is_tracked(&session.session_id));
}
