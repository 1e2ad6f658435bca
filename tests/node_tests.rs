//! Node liveness and protocol validation tests.
//!
//! Covers heartbeat loss, stale and unrelated messages, protocol violations
//! and the rehab cycle.
//!
//! Run with: cargo test --test node_tests


use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use test_harness::{
    nodes, outcomes, test_server, wait_for_job, wait_for_liveness, wait_for_status, Behavior,
    FakeNode,
};
use uuid::Uuid;

use pushy_lite::node::{Disposition, Liveness, MessageKind, NodeMessage};
use pushy_lite::scheduler::{JobOptions, JobStatus};
use pushy_lite::transport::ServerCommand;
use pushy_lite::PushyError;

#[tokio::test(start_paused = true)]
async fn test_node_goes_offline_and_back_online() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;
    let _fiona = FakeNode::start(&server, "FIONA").await;
    assert_eq!(server.online_node_count().await, 2);

    donkey.kill();
    assert!(wait_for_liveness(&server, "DONKEY", Liveness::Offline, Duration::from_secs(6)).await);
    assert_eq!(server.online_node_count().await, 1);
    let record = server.get_node_state("DONKEY").await.unwrap();
    assert!(!record.is_available());

    donkey.revive();
    assert!(wait_for_liveness(&server, "DONKEY", Liveness::Online, Duration::from_secs(2)).await);
    let back = server.get_node_state("DONKEY").await.unwrap();
    assert!(back.changed_at > record.changed_at);
    assert_eq!(server.online_node_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_node_state_is_not_found() {
    let server = test_server();
    let err = server.get_node_state("FARQUAD").await.unwrap_err();
    assert!(matches!(err, PushyError::NodeNotFound(name) if name == "FARQUAD"));
}

#[tokio::test(start_paused = true)]
async fn test_node_states_listed_by_name() {
    let server = test_server();
    let _fiona = FakeNode::start(&server, "FIONA").await;
    let _donkey = FakeNode::start(&server, "DONKEY").await;
    server.register_node("FARQUAD").await;

    let states: Vec<_> = server
        .list_node_states()
        .await
        .into_iter()
        .map(|r| (r.name, r.liveness))
        .collect();
    assert_eq!(
        states,
        vec![
            ("DONKEY".to_string(), Liveness::Online),
            ("FARQUAD".to_string(), Liveness::New),
            ("FIONA".to_string(), Liveness::Online),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_heartbeat_is_dropped() {
    let server = test_server();
    let sent_at = server.clock().now() - ChronoDuration::seconds(1000);
    let disposition = server
        .receive(NodeMessage::new(
            "DONKEY",
            sent_at,
            MessageKind::Heartbeat { incarnation: None },
        ))
        .await;

    assert_eq!(disposition, Disposition::Stale);
    assert!(server.get_node_state("DONKEY").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stale_message_has_no_effect_on_running_job() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;

    let job_id = server
        .create_job("sleep 5", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, job_id, JobStatus::Running, Duration::from_secs(1)).await;

    let sent_at = server.clock().now() - ChronoDuration::seconds(1000);
    let disposition = server
        .receive(NodeMessage::new("DONKEY", sent_at, MessageKind::NackCommit { job_id }))
        .await;
    assert_eq!(disposition, Disposition::Stale);

    let job = wait_for_job(&server, job_id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(outcomes(&job), json!({"succeeded": ["DONKEY"]}));
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Online
    );
    assert_eq!(donkey.aborts_for(job_id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_old_but_fresh_violation_crashes_node_and_enters_rehab() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;

    let job_id = server
        .create_job("sleep 30", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, job_id, JobStatus::Running, Duration::from_secs(1)).await;

    let sent_at = server.clock().now() - ChronoDuration::seconds(100);
    let disposition = server
        .receive(NodeMessage::new("DONKEY", sent_at, MessageKind::NackCommit { job_id }))
        .await;
    assert_eq!(disposition, Disposition::Violation);

    let job = server.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(outcomes(&job), json!({"crashed": ["DONKEY"]}));

    let record = server.get_node_state("DONKEY").await.unwrap();
    assert_eq!(record.liveness, Liveness::Rehab);
    assert_eq!(record.rehab_job, Some(job_id));
    assert!(record.rehab_until.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(donkey.aborts_for(job_id), 1);
    assert!(donkey.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_node_in_rehab_is_excluded_then_votable_again() {
    let server = test_server();
    let _donkey = FakeNode::start(&server, "DONKEY").await;

    let first = server
        .create_job("sleep 30", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, first, JobStatus::Running, Duration::from_secs(1)).await;
    server.nack_commit(first, "DONKEY").await;
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Rehab
    );

    // Excluded from commits while in rehab.
    let excluded = server
        .create_job("sleep 1", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    let job = server.get_job(excluded).await.unwrap();
    assert_eq!(job.status, JobStatus::QuorumFailed);
    assert_eq!(outcomes(&job), json!({"unavailable": ["DONKEY"]}));

    // Messages about other jobs are ignored during rehab.
    assert_eq!(
        server.ack_commit(Uuid::new_v4(), "DONKEY").await,
        Disposition::Ignored
    );

    assert!(wait_for_liveness(&server, "DONKEY", Liveness::Online, Duration::from_secs(11)).await);
    let record = server.get_node_state("DONKEY").await.unwrap();
    assert!(record.rehab_until.is_none());

    let again = server
        .create_job("sleep 1", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&server, again).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(outcomes(&job), json!({"succeeded": ["DONKEY"]}));
}

#[tokio::test(start_paused = true)]
async fn test_rehab_ends_offline_when_heartbeats_stop() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;

    let job_id = server
        .create_job("sleep 30", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, job_id, JobStatus::Running, Duration::from_secs(1)).await;
    server.ready(job_id, "DONKEY").await;
    donkey.kill();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Rehab
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Offline
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_vote_after_commit_is_violation() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;
    let _fiona = FakeNode::start_with(
        &server,
        "FIONA",
        Behavior {
            no_ack: true,
            ..Default::default()
        },
    )
    .await;

    let job_id = server
        .create_job("sleep 1", nodes(&["DONKEY", "FIONA"]), JobOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server.nack_commit(job_id, "DONKEY").await,
        Disposition::Violation
    );

    let job = wait_for_job(&server, job_id).await;
    assert_eq!(job.status, JobStatus::QuorumFailed);
    assert_eq!(
        outcomes(&job),
        json!({"nacked": ["DONKEY"], "unavailable": ["FIONA"]})
    );
    assert_eq!(donkey.aborts_for(job_id), 1);
    assert!(donkey.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_ready_during_voting_is_violation() {
    let server = test_server();
    let _donkey = FakeNode::start_with(
        &server,
        "DONKEY",
        Behavior {
            no_ack: true,
            ..Default::default()
        },
    )
    .await;

    let job_id = server
        .create_job("sleep 1", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(server.ready(job_id, "DONKEY").await, Disposition::Violation);

    let job = server.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::QuorumFailed);
    assert_eq!(outcomes(&job), json!({"nacked": ["DONKEY"]}));
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Rehab
    );
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_job_messages_are_dropped() {
    let server = test_server();
    let donkey = FakeNode::start(&server, "DONKEY").await;
    let unknown = Uuid::new_v4();

    assert_eq!(server.ack_commit(unknown, "DONKEY").await, Disposition::Unrelated);
    assert_eq!(server.aborted(unknown, "DONKEY").await, Disposition::Unrelated);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = server.get_node_state("DONKEY").await.unwrap();
    assert_eq!(record.liveness, Liveness::Online);
    assert!(donkey.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_message_for_another_nodes_job_is_unrelated() {
    let server = test_server();
    let _donkey = FakeNode::start(&server, "DONKEY").await;
    let _fiona = FakeNode::start(&server, "FIONA").await;

    let job_id = server
        .create_job("sleep 5", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, job_id, JobStatus::Running, Duration::from_secs(1)).await;

    assert_eq!(server.nack_commit(job_id, "FIONA").await, Disposition::Unrelated);
    let job = wait_for_job(&server, job_id).await;
    assert_eq!(outcomes(&job), json!({"succeeded": ["DONKEY"]}));
}

#[tokio::test(start_paused = true)]
async fn test_aborted_while_running_crashes_without_rehab() {
    let server = test_server();
    let _donkey = FakeNode::start(&server, "DONKEY").await;

    let job_id = server
        .create_job("sleep 30", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    wait_for_status(&server, job_id, JobStatus::Running, Duration::from_secs(1)).await;

    assert_eq!(server.aborted(job_id, "DONKEY").await, Disposition::Accepted);
    let job = server.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(outcomes(&job), json!({"crashed": ["DONKEY"]}));
    assert_eq!(
        server.get_node_state("DONKEY").await.unwrap().liveness,
        Liveness::Online
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_before_job_creation_does_not_fail_the_job() {
    let server = test_server();
    let mut commands = server.transport().connect("DONKEY");
    server.heartbeat("DONKEY", Some(Uuid::new_v4())).await;
    server.heartbeat("DONKEY", Some(Uuid::new_v4())).await;

    let job_id = server
        .create_job("sleep 1", nodes(&["DONKEY"]), JobOptions::default())
        .await
        .unwrap();
    let commit = commands.recv().await.unwrap();
    assert!(matches!(commit, ServerCommand::Commit { job_id: id, .. } if id == job_id));

    // Give the node-down forwarder a chance to run.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let job = server.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Voting);
    assert_eq!(outcomes(&job), json!({"new": ["DONKEY"]}));

    assert_eq!(server.ack_commit(job_id, "DONKEY").await, Disposition::Accepted);
    assert_eq!(server.get_job(job_id).await.unwrap().status, JobStatus::Running);
}
