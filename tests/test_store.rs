//! Conformance suite run against every coordination store backend.

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use swarmdag::core::config::{StoreBackend, StoreConfig};
use swarmdag::storage::{open_store, Write};
use swarmdag::{
    Agent, AgentStatus, Channel, CoordinationStore, Embodiment, MemoryStore, Notification,
    SharedStateFact, SledStore, Subtask, SubtaskStatus, SwarmError, Task, TaskStatus,
};

async fn conditional_commit(store: &dyn CoordinationStore) {
    let task = Task::new("t1", "tidy up");
    store.commit(vec![Write::Task(task.clone())]).await.unwrap();

    // Revision 0 means "must not exist yet"
    let again = store.commit(vec![Write::Task(task)]).await;
    assert!(matches!(again, Err(SwarmError::StoreConflict { .. })));

    let stored = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(stored.revision, 1);

    let mut planned = stored.clone();
    planned.status = TaskStatus::Planning;
    store.commit(vec![Write::Task(planned)]).await.unwrap();

    // A stale copy loses, and nothing else in its batch is written
    let mut stale = stored;
    stale.status = TaskStatus::Failed;
    let extra = Subtask::new("t1", "s0", "step", "grasp_object", json!({}));
    let result = store
        .commit(vec![Write::Subtask(extra), Write::Task(stale)])
        .await;
    assert!(result.unwrap_err().is_conflict());
    assert!(store.get_subtask("t1:s0").await.unwrap().is_none());

    let current = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Planning);
    assert_eq!(current.revision, 2);
}

async fn assignment_race(store: &dyn CoordinationStore) {
    let mut subtask = Subtask::new("t2", "pick", "pick", "grasp_object", json!({}));
    subtask.status = SubtaskStatus::Ready;
    let a = Agent::new("a", Embodiment::SingleArm, ["grasp_object"]);
    let b = Agent::new("b", Embodiment::DualArm, ["grasp_object"]);
    store
        .commit(vec![Write::Subtask(subtask), Write::Agent(a), Write::Agent(b)])
        .await
        .unwrap();

    let ready = store.get_subtask("t2:pick").await.unwrap().unwrap();
    let claim = |agent_id: &str, agent: Agent| {
        let mut assigned = ready.clone();
        assigned.status = SubtaskStatus::Assigned;
        assigned.assigned_agent = Some(agent_id.to_string());
        let mut busy = agent;
        busy.status = AgentStatus::Busy;
        vec![Write::Subtask(assigned), Write::Agent(busy)]
    };
    let a = store.get_agent("a").await.unwrap().unwrap();
    let b = store.get_agent("b").await.unwrap().unwrap();

    store.commit(claim("a", a)).await.unwrap();
    assert!(store.commit(claim("b", b)).await.is_err());

    let subtask = store.get_subtask("t2:pick").await.unwrap().unwrap();
    assert_eq!(subtask.assigned_agent.as_deref(), Some("a"));
    let b = store.get_agent("b").await.unwrap().unwrap();
    assert_eq!(b.status, AgentStatus::Idle);
}

async fn queries(store: &dyn CoordinationStore) {
    let mut task = Task::new("t3", "sort");
    let first = Subtask::new("t3", "a", "a", "grasp_object", json!({}));
    let mut second = Subtask::new("t3", "b", "b", "grasp_object", json!({}));
    second.assigned_agent = Some("robot".to_string());
    second.status = SubtaskStatus::Running;
    let other = Subtask::new("t30", "a", "a", "grasp_object", json!({}));
    task.subtask_ids = vec![first.id.clone(), second.id.clone()];
    store
        .commit(vec![
            Write::Task(task),
            Write::Task(Task::new("t30", "other")),
            Write::Subtask(first),
            Write::Subtask(second),
            Write::Subtask(other),
        ])
        .await
        .unwrap();

    let ids: Vec<_> = store
        .subtasks_of("t3")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["t3:a".to_string(), "t3:b".to_string()]);

    let held = store.assigned_to("robot").await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].id, "t3:b");
    assert!(store.get_task("missing").await.unwrap().is_none());
}

async fn facts_last_writer_wins(store: &dyn CoordinationStore) {
    let mut older = SharedStateFact::new("apple", json!({"on": "table"}), "robot_1");
    older.timestamp = Utc::now() - ChronoDuration::seconds(5);
    let newer = SharedStateFact::new("apple", json!({"held_by": "robot_2"}), "robot_2");

    store.put_fact(newer.clone()).await.unwrap();
    store.put_fact(older).await.unwrap();

    let stored = store.get_fact("apple").await.unwrap().unwrap();
    assert_eq!(stored.writer, "robot_2");
    assert_eq!(stored.value, json!({"held_by": "robot_2"}));

    store
        .put_fact(SharedStateFact::new("robot_1.position", json!("dock"), "robot_1"))
        .await
        .unwrap();
    let snapshot = store.world_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["robot_1.position"].value, json!("dock"));
    assert_eq!(snapshot["apple"].writer, "robot_2");
    assert_eq!(snapshot["apple"].timestamp, newer.timestamp);
}

async fn notifications(store: &dyn CoordinationStore) {
    let mut inbox = store.subscribe(&Channel::Agent("a".to_string())).await.unwrap();
    let mut other = store.subscribe(&Channel::Agent("b".to_string())).await.unwrap();
    let notification = Notification::Assigned {
        subtask_id: "t:s".to_string(),
        agent_id: "a".to_string(),
    };
    store
        .publish(&Channel::Agent("a".to_string()), notification.clone())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap();
    assert_eq!(received, Some(notification));
    let nothing = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
    assert!(nothing.is_err());
}

async fn conformance(store: Arc<dyn CoordinationStore>) {
    conditional_commit(store.as_ref()).await;
    assignment_race(store.as_ref()).await;
    queries(store.as_ref()).await;
    facts_last_writer_wins(store.as_ref()).await;
    notifications(store.as_ref()).await;
}

/// In-process backend
#[tokio::test]
async fn test_memory_store_conformance() {
    conformance(Arc::new(MemoryStore::new("test"))).await;
}

/// Persistent backend
#[tokio::test]
async fn test_sled_store_conformance() {
    let dir = tempfile::tempdir().unwrap();
    conformance(Arc::new(SledStore::open(dir.path(), "test", 64).unwrap())).await;
}

/// Records written through the sled backend survive a reopen
#[tokio::test]
async fn test_sled_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = SledStore::open(dir.path(), "swarm", 64).unwrap();
        let mut task = Task::new("persisted", "stack the blocks");
        task.status = TaskStatus::Executing;
        store.commit(vec![Write::Task(task)]).await.unwrap();
        store
            .put_fact(SharedStateFact::new("block", json!("red"), "scene"))
            .await
            .unwrap();
        store.flush().await.unwrap();
    }

    let config = StoreConfig {
        backend: StoreBackend::Sled,
        path: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let store = open_store(&config).await.unwrap();
    let task = store.get_task("persisted").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Executing);
    assert_eq!(task.revision, 1);
    assert_eq!(store.get_fact("block").await.unwrap().unwrap().value, json!("red"));
}

/// Namespaces partition one sled database
#[tokio::test]
async fn test_sled_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let left = SledStore::from_db(db.clone(), "left", 16).unwrap();
    let right = SledStore::from_db(db, "right", 16).unwrap();

    left.commit(vec![Write::Task(Task::new("t1", "left side"))])
        .await
        .unwrap();
    assert!(right.get_task("t1").await.unwrap().is_none());
    assert_eq!(left.tasks().await.unwrap().len(), 1);
}
