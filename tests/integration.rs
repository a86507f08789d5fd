use std::{
    collections::HashSet,
    ops::Deref,
    sync::{Arc, Mutex},
    time::Duration,
};

use relayq::{
    config::Config,
    consumer::Consumer,
    error::Error,
    message::{now, DeadLetter, Message, MessageState},
    processor::{ProcessorError, ProcessorRegistry},
    service::Service,
};
use serde_json::json;
use sqlx::Acquire;
use tempfile::TempDir;

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> TmpService {
    setup_with(|config| config).await
}

async fn setup_with(adjust: impl FnOnce(Config) -> Config) -> TmpService {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let tmpdir = tempfile::tempdir().unwrap();

    let config = adjust(Config {
        db_path: Some(tmpdir.path().join("relayq.db").to_string_lossy().to_string()),
        staging_dir: tmpdir.path().join("staging").to_string_lossy().to_string(),
        ..Config::default()
    });

    TmpService {
        svc: Service::connect_with(config).await.unwrap(),
        tmpdir,
    }
}

fn message(id: &str, priority: i64) -> Message {
    Message::builder()
        .id(id)
        .priority(priority)
        .payload_type("test")
        .payload(json!({ "id": id }))
        .build()
}

async fn claim(service: &Service, worker_id: &str) -> relayq::error::Result<Vec<Message>> {
    let mut conn = service.db().acquire().await.unwrap();

    Message::claim_batch(
        conn.acquire().await.unwrap(),
        service.config(),
        worker_id,
        now(),
    )
    .await
}

async fn live_row(service: &Service, id: &str) -> Option<Message> {
    let mut conn = service.db().acquire().await.unwrap();

    Message::get(conn.acquire().await.unwrap(), id)
        .await
        .unwrap()
}

async fn dead_letter(service: &Service, id: &str) -> Option<DeadLetter> {
    let mut conn = service.db().acquire().await.unwrap();

    DeadLetter::get(conn.acquire().await.unwrap(), id)
        .await
        .unwrap()
}

async fn live_count(service: &Service) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM task_queue")
        .fetch_one(service.db())
        .await
        .unwrap()
}

#[tokio::test]
async fn claim_transitions_to_processing_and_tags_worker() {
    let service = setup().await;

    service.enqueue(&message("m-1", 0)).await.unwrap();
    service.enqueue(&message("m-2", 0)).await.unwrap();

    let batch = claim(&service, "worker-1").await.unwrap();

    assert_eq!(batch.len(), 2);
    for claimed in &batch {
        assert_eq!(claimed.state, MessageState::Processing);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    }

    // Everything is already claimed, so a second poll finds nothing.
    assert!(matches!(
        claim(&service, "worker-2").await,
        Err(Error::EmptyQueue)
    ));
}

#[tokio::test]
async fn expired_messages_are_never_claimed() {
    let service = setup().await;

    let mut expired = message("m-expired", 0);
    expired.expiration = Some(now() - 10);

    service.enqueue(&expired).await.unwrap();

    assert!(matches!(
        claim(&service, "worker-1").await,
        Err(Error::EmptyQueue)
    ));

    let row = live_row(&service, "m-expired").await.unwrap();
    assert_eq!(row.state, MessageState::Created);
}

#[tokio::test]
async fn scheduled_message_becomes_eligible_at_its_timestamp() {
    let service = setup().await;

    let scheduled = Message::builder()
        .id("m-later")
        .payload_type("test")
        .payload(json!({}))
        .scheduled(now() + 3600)
        .build();
    assert_eq!(scheduled.state, MessageState::Scheduled);

    service.enqueue(&scheduled).await.unwrap();

    assert!(matches!(
        claim(&service, "worker-1").await,
        Err(Error::EmptyQueue)
    ));

    sqlx::query("UPDATE task_queue SET scheduled = $1 WHERE message_id = $2")
        .bind(now() - 1)
        .bind(&scheduled.id)
        .execute(service.db())
        .await
        .unwrap();

    let batch = claim(&service, "worker-1").await.unwrap();
    assert_eq!(batch[0].id, "m-later");
}

#[tokio::test]
async fn retry_backoff_gates_reclaiming() {
    let service = setup().await;

    service.enqueue(&message("m-retry", 0)).await.unwrap();
    sqlx::query(
        "UPDATE task_queue SET state = $1, retry_counter = 1, updated = $2 \
         WHERE message_id = $3",
    )
    .bind(MessageState::Retry)
    .bind(now())
    .bind("m-retry")
    .execute(service.db())
    .await
    .unwrap();

    // Inside the backoff window.
    assert!(matches!(
        claim(&service, "worker-1").await,
        Err(Error::EmptyQueue)
    ));

    let elapsed = now() - service.config().retry_interval_secs as i64;
    sqlx::query("UPDATE task_queue SET updated = $1 WHERE message_id = $2")
        .bind(elapsed)
        .bind("m-retry")
        .execute(service.db())
        .await
        .unwrap();

    let batch = claim(&service, "worker-1").await.unwrap();
    assert_eq!(batch[0].id, "m-retry");
    assert_eq!(batch[0].state, MessageState::Processing);
}

#[tokio::test]
async fn reconcile_partitions_requeue_drop_and_archive() {
    let service = setup().await;

    service.enqueue(&message("m-ok", 0)).await.unwrap();
    service.enqueue(&message("m-again", 1)).await.unwrap();
    service.enqueue(&message("m-dead", 2)).await.unwrap();

    let batch = claim(&service, "worker-1").await.unwrap();
    assert_eq!(batch.len(), 3);

    let outcomes: Vec<Message> = batch
        .into_iter()
        .map(|mut outcome| {
            match outcome.id.as_str() {
                "m-ok" => outcome.state = MessageState::Processed,
                "m-again" => {
                    outcome.state = MessageState::Retry;
                    outcome.retry_counter += 1;
                    outcome.failed_processors.0.push("tester".to_owned());
                }
                "m-dead" => {
                    outcome.state = MessageState::FatalFailure;
                    outcome.failed_processors.0.push("tester".to_owned());
                }
                other => panic!("unexpected message {other}"),
            }
            outcome
        })
        .collect();

    let consumer = Consumer::new(service.svc.clone(), ProcessorRegistry::new());
    consumer.reconcile(outcomes).await.unwrap();

    // RETRY stays live, rewritten in place.
    let requeued = live_row(&service, "m-again").await.unwrap();
    assert_eq!(requeued.state, MessageState::Retry);
    assert_eq!(requeued.retry_counter, 1);
    assert_eq!(requeued.failed_processors.0, vec!["tester"]);

    // PROCESSED vanishes without a trace.
    assert!(live_row(&service, "m-ok").await.is_none());
    assert!(dead_letter(&service, "m-ok").await.is_none());

    // FATAL_FAILURE is archived with its payload intact.
    assert!(live_row(&service, "m-dead").await.is_none());
    let archived = dead_letter(&service, "m-dead").await.unwrap();
    assert_eq!(archived.state, MessageState::FatalFailure);
    assert_eq!(archived.payload.0, json!({ "id": "m-dead" }));
    assert_eq!(archived.worker_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn recovery_claim_only_returns_recovery_rows() {
    let service = setup().await;

    service.enqueue(&message("m-live", 0)).await.unwrap();
    service.enqueue(&message("m-abandoned", 0)).await.unwrap();

    // Simulate the external liveness sweep reclassifying a stale claim.
    sqlx::query("UPDATE task_queue SET state = $1 WHERE message_id = $2")
        .bind(MessageState::Recovery)
        .bind("m-abandoned")
        .execute(service.db())
        .await
        .unwrap();

    // The primary claim sees only the eligible row.
    let batch = claim(&service, "worker-1").await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, "m-live");

    // With nothing eligible left, the recovery claim picks up the rest.
    let batch = claim(&service, "worker-2").await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, "m-abandoned");
    assert_eq!(batch[0].state, MessageState::Processing);
    assert_eq!(batch[0].worker_id.as_deref(), Some("worker-2"));

    assert!(matches!(
        claim(&service, "worker-3").await,
        Err(Error::EmptyQueue)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_partition_the_eligible_set() {
    let service = setup_with(|mut config| {
        config.batch_size = 5;
        config
    })
    .await;

    let messages: Vec<Message> = (0..30).map(|n| message(&format!("m-{n}"), n)).collect();
    service.enqueue_batch(&messages).await.unwrap();

    let mut handles = Vec::new();

    for worker in 0..3 {
        let service = service.svc.clone();

        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{worker}");
            let mut claimed = Vec::new();

            loop {
                let mut conn = service.db().acquire().await.unwrap();
                let result = Message::claim_batch(
                    conn.acquire().await.unwrap(),
                    service.config(),
                    &worker_id,
                    now(),
                )
                .await;

                match result {
                    Ok(batch) => claimed.extend(batch.into_iter().map(|m| m.id)),
                    Err(Error::EmptyQueue) => break claimed,
                    Err(other) => panic!("claim failed: {other}"),
                }
            }
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.unwrap());
    }

    // No message id was handed to two workers.
    let unique: HashSet<&String> = all_claimed.iter().collect();
    assert_eq!(all_claimed.len(), 30);
    assert_eq!(unique.len(), 30);
}

#[tokio::test]
async fn overflow_round_trip() {
    let service = setup().await;
    let overflow = service.overflow();

    let staged = message("m-staged", 0);
    overflow.load(&staged).await.unwrap();

    let path = overflow.dir().join("m-staged.json");
    assert!(path.exists());

    let replayed = overflow.offload().await.unwrap();
    assert_eq!(replayed, 1);
    assert!(!path.exists());

    let row = live_row(&service, "m-staged").await.unwrap();
    assert_eq!(row.id, staged.id);
    assert_eq!(row.state, staged.state);
    assert_eq!(row.payload.0, staged.payload.0);
    assert_eq!(row.created, staged.created);
    assert_eq!(row.updated, staged.updated);
}

#[tokio::test]
async fn overflow_failed_insert_leaves_the_staged_file() {
    let service = setup().await;
    let overflow = service.overflow();

    // The same id already lives in the store; replay must hit the primary
    // key and leave the file for the next attempt.
    let duplicate = message("m-dup", 0);
    service.enqueue(&duplicate).await.unwrap();
    overflow.load(&duplicate).await.unwrap();

    let replayed = overflow.offload().await.unwrap();
    assert_eq!(replayed, 0);
    assert!(overflow.dir().join("m-dup.json").exists());
    assert_eq!(live_count(&service).await, 1);
}

#[tokio::test]
async fn overflow_load_batch_stages_every_message() {
    let service = setup().await;
    let overflow = service.overflow();

    let batch = vec![message("m-s1", 0), message("m-s2", 0)];
    overflow.load_batch(&batch).await.unwrap();

    assert_eq!(overflow.offload().await.unwrap(), 2);
    assert_eq!(live_count(&service).await, 2);
}

#[tokio::test]
async fn enqueue_or_stage_falls_back_to_the_overflow_buffer() {
    let service = setup().await;
    let overflow = service.overflow();

    // Closing the pool simulates an unreachable store.
    service.db().close().await;

    service
        .enqueue_or_stage(&message("m-offline", 0))
        .await
        .unwrap();

    assert!(overflow.dir().join("m-offline.json").exists());
}

#[tokio::test]
async fn dispatch_follows_priority_order_end_to_end() {
    // One message per release interval keeps the observed order exact.
    let service = setup_with(|mut config| {
        config.concurrency = Some(1);
        config.throttle_ms = 10;
        config
    })
    .await;

    service.enqueue(&message("m-c", 3)).await.unwrap();
    service.enqueue(&message("m-a", 1)).await.unwrap();
    service.enqueue(&message("m-b", 2)).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);

    let mut registry = ProcessorRegistry::new();
    registry.register("test", "recorder", move |msg: Message| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(msg.priority);
            Ok(())
        }
    });

    let consumer = Consumer::new(service.svc.clone(), registry);

    assert!(matches!(
        consumer.run("worker-1").await,
        Err(Error::EmptyQueue)
    ));

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(live_count(&service).await, 0);
    assert!(dead_letter(&service, "m-a").await.is_none());
}

#[tokio::test]
async fn exhausted_retries_end_up_in_the_dead_letters() {
    let service = setup_with(|mut config| {
        config.max_retries = 2;
        config.retry_interval_secs = 0;
        config
    })
    .await;

    service.enqueue(&message("m-flaky", 0)).await.unwrap();

    let mut registry = ProcessorRegistry::new();
    registry.register("test", "flaky", |_msg: Message| async {
        Err(ProcessorError::retryable("downstream unavailable"))
    });

    let consumer = Consumer::new(service.svc.clone(), registry);

    assert!(matches!(
        consumer.run("worker-1").await,
        Err(Error::EmptyQueue)
    ));

    assert!(live_row(&service, "m-flaky").await.is_none());

    let archived = dead_letter(&service, "m-flaky").await.unwrap();
    assert_eq!(archived.state, MessageState::RetriesExhausted);
    assert_eq!(archived.retry_counter, 2);
    assert_eq!(archived.failed_processors.0, vec!["flaky", "flaky"]);
}

#[tokio::test]
async fn wake_channel_drives_the_drain_cycle() {
    let service = setup().await;

    let mut registry = ProcessorRegistry::new();
    registry.register("test", "sink", |_msg: Message| async { Ok(()) });

    let consumer = Arc::new(Consumer::new(service.svc.clone(), registry));

    let running = Arc::clone(&consumer);
    let handle = tokio::spawn(async move { running.start("worker-1").await });

    service.enqueue(&message("m-wake", 0)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while live_count(&service).await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue never drained"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    consumer.unsubscribe();
    handle.await.unwrap();
}

#[tokio::test]
async fn in_memory_service_migrates_and_serves_the_whole_pool() {
    let service = Service::connect().await.unwrap();

    service.enqueue(&message("m-mem-1", 0)).await.unwrap();
    service.enqueue(&message("m-mem-2", 1)).await.unwrap();

    let batch = claim(&service, "worker-1").await.unwrap();

    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|m| m.state == MessageState::Processing));
    assert_eq!(live_count(&service).await, 2);
}
