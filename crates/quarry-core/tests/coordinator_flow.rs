//! Distributed query lifecycle over the API service: data load, submission,
//! embedded and long-poll workers, result collation.

use quarry_core::api::{ApiService, ColumnPayload, Request, SchemaPayload};
use quarry_core::{
    execute_fragment, Coordinator, Engine, LocalWorker, QueryStatus, TaskResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (tempfile::TempDir, Arc<Engine>) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path().join("store")).unwrap());
    (dir, engine)
}

fn load_events() -> Request {
    let rows = vec![
        json!({"user_id": 42, "value": 10.5, "country": "BR"}),
        json!({"user_id": 7, "value": 8.1, "country": "US"}),
    ]
    .into_iter()
    .map(|v| v.as_object().unwrap().clone())
    .collect();
    Request::DataLoad {
        table: "events".into(),
        schema: Some(SchemaPayload {
            columns: vec![
                ColumnPayload { name: "user_id".into(), data_type: "INT".into() },
                ColumnPayload { name: "value".into(), data_type: "FLOAT".into() },
                ColumnPayload { name: "country".into(), data_type: "STRING".into() },
            ],
        }),
        rows,
        partition_id: Some("p1".into()),
    }
}

async fn wait_for_terminal(coordinator: &Coordinator, id: &str) -> QueryStatus {
    for _ in 0..200 {
        let status = coordinator.query_status(id).unwrap();
        if matches!(status, QueryStatus::Success | QueryStatus::Failed) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("query {id} never finished");
}

#[tokio::test]
async fn embedded_worker_executes_scan_fragments() {
    let (_dir, engine) = engine();
    let coordinator = Arc::new(Coordinator::new());
    let worker_engine = engine.clone();
    coordinator.register(Arc::new(LocalWorker::new("embedded-1", move |task| {
        execute_fragment(&worker_engine, &task.fragment, "embedded-1", &task.task_id)
    })));
    let service = Arc::new(ApiService::new(engine, coordinator.clone()));

    let response = service.handle(load_events()).await;
    assert_eq!(response.status, 201, "{:?}", response.error);

    let response = service
        .handle(Request::Query { sql: "SELECT * FROM events".into() })
        .await;
    assert_eq!(response.status, 202);
    let id = response.body["id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&coordinator, &id).await;
    assert_eq!(status, QueryStatus::Success);
    let results = coordinator.query_results(&id).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rows, 2);
}

#[tokio::test]
async fn failing_worker_marks_query_failed() {
    let (_dir, engine) = engine();
    let coordinator = Arc::new(Coordinator::new());
    coordinator.register(Arc::new(LocalWorker::new("w-err", |task| {
        TaskResult::failed(&task.task_id, "", "simulated")
    })));
    let service = Arc::new(ApiService::new(engine, coordinator.clone()));
    service.handle(load_events()).await;

    let response = service
        .handle(Request::Query { sql: "SELECT * FROM events".into() })
        .await;
    let id = response.body["id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&coordinator, &id).await;
    assert_eq!(status, QueryStatus::Failed);
    let error = coordinator.query_error(&id).unwrap().unwrap();
    assert!(error.contains("simulated"));
}

#[tokio::test]
async fn long_poll_worker_completes_query() {
    let (_dir, engine) = engine();
    let coordinator = Arc::new(Coordinator::new());
    let service = Arc::new(ApiService::new(engine.clone(), coordinator.clone()));
    service.handle(load_events()).await;

    let registration = service.worker_register(Some("remote-1".into())).unwrap();

    // Worker loop: poll once, execute, deliver.
    let worker = {
        let service = Arc::clone(&service);
        let engine = engine.clone();
        let id = registration.id.clone();
        let secret = registration.secret.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                let task = service.worker_poll(&id, Some(&secret)).await.unwrap();
                let Some(task) = task else { continue };
                let result = execute_fragment(&engine, &task.fragment, &id, &task.task_id);
                service.worker_result(&id, Some(&secret), result).unwrap();
                return;
            }
            panic!("worker never received a task");
        })
    };

    let response = service
        .handle(Request::Query { sql: "SELECT * FROM events".into() })
        .await;
    assert_eq!(response.status, 202, "{:?}", response.error);
    let id = response.body["id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&coordinator, &id).await;
    worker.await.unwrap();
    assert_eq!(status, QueryStatus::Success);
    let results = coordinator.query_results(&id).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rows, 2);
    assert_eq!(results[0].worker_id, "remote-1");
}

#[tokio::test]
async fn status_is_stable_once_terminal() {
    let (_dir, engine) = engine();
    let coordinator = Arc::new(Coordinator::new());
    let worker_engine = engine.clone();
    coordinator.register(Arc::new(LocalWorker::new("embedded-1", move |task| {
        execute_fragment(&worker_engine, &task.fragment, "embedded-1", &task.task_id)
    })));
    let service = Arc::new(ApiService::new(engine, coordinator.clone()));
    service.handle(load_events()).await;

    let response = service
        .handle(Request::Query { sql: "SELECT * FROM events".into() })
        .await;
    let id = response.body["id"].as_str().unwrap().to_string();
    let status = wait_for_terminal(&coordinator, &id).await;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(coordinator.query_status(&id).unwrap(), status);
    }
}
