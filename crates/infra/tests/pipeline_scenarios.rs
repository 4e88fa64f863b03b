//! End-to-end scenarios on the in-memory broker, cache and stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use orpheon_core::{JobId, Priority, SourceFile, Stage, UserId};
use orpheon_infra::progress::keys;
use orpheon_infra::{
    ConsumerConfig, DeliveryOutcome, InMemoryBlobStore, InMemoryCache, InMemoryRecordStore,
    JobConsumer, PipelineError, PipelineOrchestrator, ProgressStore, Publisher, ResultFiles,
    RetryPolicy, StaticReferenceFetcher, SubmissionStep, SubmitRequest, UploadedFile,
};
use orpheon_infra::processor::{ScriptedOutcome, ScriptedProcessor};
use orpheon_messaging::topology::{EXCHANGE, FAILED_QUEUE, MAIN_QUEUE, RETRY_QUEUE, ROUTING_NEW};
use orpheon_messaging::{
    Broker, DeliveryStream, InMemoryBroker, JobMessage, JobPayload, OutgoingMessage, Topology,
};

const RETRY_DELAY: Duration = Duration::from_millis(25);

struct Harness {
    broker: InMemoryBroker,
    cache: InMemoryCache,
    blobs: InMemoryBlobStore,
    orchestrator: PipelineOrchestrator,
}

async fn harness() -> Harness {
    let broker = InMemoryBroker::new();
    broker
        .declare(&Topology::with_retry_delay(RETRY_DELAY))
        .await
        .unwrap();
    let cache = InMemoryCache::new();
    let blobs = InMemoryBlobStore::new();

    let orchestrator = PipelineOrchestrator::new(
        Arc::new(InMemoryRecordStore::new()),
        ProgressStore::new(Arc::new(cache.clone())),
        Publisher::new(Arc::new(broker.clone())),
        Arc::new(blobs.clone()),
        Arc::new(StaticReferenceFetcher::new(b"reference".to_vec())),
    );

    Harness {
        broker,
        cache,
        blobs,
        orchestrator,
    }
}

fn consumer(broker: &InMemoryBroker, processor: Arc<ScriptedProcessor>, max_retries: u32) -> JobConsumer {
    JobConsumer::new(
        Arc::new(broker.clone()),
        processor,
        ConsumerConfig::default()
            .with_name("scenario")
            .with_processor_timeout(Duration::from_millis(100))
            .with_retry_policy(RetryPolicy::new(max_retries)),
    )
}

fn submission(owner: UserId) -> SubmitRequest {
    SubmitRequest {
        owner,
        submitted_at: Utc::now(),
        voice: SourceFile {
            filename: "chorus.wav".to_string(),
            bytes: vec![3; 64],
            duration_secs: 95.0,
            bitrate: 1411,
        },
        instrument: Some(SourceFile {
            filename: "backing.mp3".to_string(),
            bytes: vec![4; 32],
            duration_secs: 95.0,
            bitrate: 320,
        }),
        reference_url: "https://youtu.be/dQw4w9WgXcQ".to_string(),
        priority: Priority::High,
        is_denoise: true,
        is_autotune: true,
    }
}

fn results() -> ResultFiles {
    let file = |name: &str| UploadedFile {
        filename: name.to_string(),
        bytes: vec![5; 16],
    };
    ResultFiles {
        standard: file("standard.wav"),
        dynamic: file("dynamic.wav"),
        smooth: file("smooth.wav"),
    }
}

fn payload() -> JobPayload {
    JobPayload {
        voice_file_url: "memory://b/voice.wav".into(),
        instrument_file_url: None,
        reference_file_url: "memory://b/reference.mp3".into(),
        is_denoise: false,
        is_autotune: false,
    }
}

/// Pull deliveries off the main queue and hand them to `consumer` until one
/// reaches a terminal outcome. Returns the retry count of every delivery seen
/// and the final outcome.
async fn drive(broker: &InMemoryBroker, consumer: &JobConsumer) -> (Vec<u32>, DeliveryOutcome) {
    let mut stream = broker.consume(MAIN_QUEUE, "driver", 1).await.unwrap();
    let mut seen = Vec::new();
    loop {
        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("next delivery within 2s")
            .expect("stream open")
            .expect("delivery ok");
        let message = JobMessage::decode(&delivery.body).unwrap();
        seen.push(message.retry_count);

        let outcome = consumer.handle(delivery).await.unwrap();
        if matches!(outcome, DeliveryOutcome::Acked | DeliveryOutcome::DeadLettered) {
            stream.cancel().await.unwrap();
            return (seen, outcome);
        }
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn j1_two_failures_then_success_then_results() {
    let h = harness().await;
    let processor = Arc::new(ScriptedProcessor::failing_then_accepting(2));
    let consumer = consumer(&h.broker, processor.clone(), 3);

    let submitted = h.orchestrator.submit(submission(UserId::new())).await.unwrap();
    let id = submitted.job_id;
    assert_eq!(h.orchestrator.get(id).await.unwrap().stage, Some(Stage::PENDING));

    let (seen, outcome) = drive(&h.broker, &consumer).await;

    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(outcome, DeliveryOutcome::Acked);
    // Failed attempts never touch the stage.
    assert_eq!(h.orchestrator.progress().get_stage(id).await, Some(Stage::PENDING));
    assert_eq!(processor.call_count(), 3);
    assert!(processor.calls().iter().all(|c| c.job_id == id && c.is_autotune));
    assert_eq!(consumer.stats().retried, 2);

    let view = h.orchestrator.update_result(id, results()).await.unwrap();
    assert_eq!(view.stage, Some(Stage::COMPLETE));
    assert!(view.record.has_all_results());

    let fetched = h.orchestrator.get(id).await.unwrap();
    assert_eq!(fetched.stage, Some(Stage::COMPLETE));
    assert_eq!(h.broker.queue_depth(FAILED_QUEUE), 0);
    assert_eq!(h.broker.queue_depth(RETRY_QUEUE), 0);
}

#[tokio::test]
async fn j2_exhausted_retries_land_in_failed_queue() {
    let h = harness().await;
    let processor = Arc::new(ScriptedProcessor::new([], ScriptedOutcome::Unreachable));
    let handle = consumer(&h.broker, processor.clone(), 3).spawn();

    let id = h.orchestrator.submit(submission(UserId::new())).await.unwrap().job_id;

    let broker = h.broker.clone();
    eventually("dead-lettered job", move || broker.queue_depth(FAILED_QUEUE) == 1).await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(processor.call_count(), 4);
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.dead_lettered, 1);

    let failed = JobMessage::decode(&h.broker.peek(FAILED_QUEUE)[0]).unwrap();
    assert_eq!(failed.job_id, id);
    assert_eq!(failed.retry_count, 3);

    assert_eq!(h.orchestrator.get(id).await.unwrap().stage, Some(Stage::PENDING));
}

#[tokio::test]
async fn success_on_last_allowed_attempt_is_not_retried() {
    let h = harness().await;
    let processor = Arc::new(ScriptedProcessor::failing_then_accepting(3));
    let consumer = consumer(&h.broker, processor.clone(), 3);

    let publisher = Publisher::new(Arc::new(h.broker.clone()));
    publisher
        .publish(JobId::from_uuid(uuid::Uuid::from_u128(11)), Priority::Normal, payload())
        .await
        .unwrap();

    let (seen, outcome) = drive(&h.broker, &consumer).await;

    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_eq!(outcome, DeliveryOutcome::Acked);
    assert_eq!(processor.call_count(), 4);

    tokio::time::sleep(RETRY_DELAY * 4).await;
    assert_eq!(h.broker.queue_depth(MAIN_QUEUE), 0);
    assert_eq!(h.broker.queue_depth(RETRY_QUEUE), 0);
    assert_eq!(h.broker.queue_depth(FAILED_QUEUE), 0);
}

#[tokio::test]
async fn malformed_message_never_reaches_processor() {
    let h = harness().await;
    let processor = Arc::new(ScriptedProcessor::accepting());
    let handle = consumer(&h.broker, processor.clone(), 3).spawn();

    h.broker
        .publish(
            EXCHANGE,
            ROUTING_NEW,
            OutgoingMessage {
                body: b"not json".to_vec(),
                properties: Default::default(),
            },
        )
        .await
        .unwrap();

    let broker = h.broker.clone();
    eventually("dead-lettered garbage", move || broker.queue_depth(FAILED_QUEUE) == 1).await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(processor.call_count(), 0);
    assert_eq!(stats.malformed, 1);
    assert_eq!(h.broker.peek(FAILED_QUEUE), vec![b"not json".to_vec()]);
}

#[tokio::test]
async fn publish_then_dequeue_yields_same_payload() {
    let h = harness().await;
    let publisher = Publisher::new(Arc::new(h.broker.clone()));
    let id = JobId::from_uuid(uuid::Uuid::from_u128(12));

    let sent = publisher.publish(id, Priority::High, payload()).await.unwrap();

    let mut stream = h.broker.consume(MAIN_QUEUE, "reader", 1).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.properties.priority, Priority::High.message_priority());

    let received = JobMessage::decode(&delivery.body).unwrap();
    assert_eq!(received, sent);
    assert_eq!(received.retry_count, 0);
    assert_eq!(received.payload, payload());
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn completed_job_reads_stage_five_after_cache_eviction() {
    let h = harness().await;
    let id = h.orchestrator.submit(submission(UserId::new())).await.unwrap().job_id;
    h.orchestrator.update_result(id, results()).await.unwrap();

    h.cache.evict(&keys::stage(id));
    h.cache.evict(&keys::detail(id));
    assert_eq!(h.orchestrator.progress().get_stage(id).await, None);

    assert_eq!(h.orchestrator.get(id).await.unwrap().stage, Some(Stage::COMPLETE));
}

#[tokio::test]
async fn broker_outage_leaves_record_pending_but_undispatched() {
    let h = harness().await;
    let request = submission(UserId::new());
    let id = JobId::derive(request.owner, request.submitted_at, &request.voice.filename);
    h.broker.disconnect();

    let err = h.orchestrator.submit(request.clone()).await.unwrap_err();
    let PipelineError::SubmissionFailed { step, report, source } = err else {
        panic!("expected SubmissionFailed, got {err:?}");
    };
    assert_eq!(step, SubmissionStep::Publish);
    assert!(matches!(*source, PipelineError::Publish(ref e) if e.is_unavailable()));
    assert!(report.is_completed(SubmissionStep::UploadArtifacts));
    assert!(h.blobs.is_empty());

    h.broker.reconnect();
    let view = h.orchestrator.get(id).await.unwrap();
    assert!(!view.record.has_all_results());
    assert_eq!(view.stage, None);
    assert_eq!(h.broker.queue_depth(MAIN_QUEUE), 0);

    assert!(matches!(
        h.orchestrator.submit(request).await,
        Err(PipelineError::Duplicate(dup)) if dup == id
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn retry_counts_climb_by_one_until_success_or_ceiling(failures in 0usize..6, max_retries in 0u32..4) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (seen, outcome, calls) = rt.block_on(async {
            let broker = InMemoryBroker::new();
            broker
                .declare(&Topology::with_retry_delay(Duration::from_millis(5)))
                .await
                .unwrap();
            let processor = Arc::new(ScriptedProcessor::failing_then_accepting(failures));
            let consumer = consumer(&broker, processor.clone(), max_retries);
            Publisher::new(Arc::new(broker.clone()))
                .publish(JobId::from_uuid(uuid::Uuid::from_u128(13)), Priority::Normal, payload())
                .await
                .unwrap();

            let (seen, outcome) = drive(&broker, &consumer).await;
            (seen, outcome, processor.call_count())
        });

        let expected: Vec<u32> = (0..seen.len() as u32).collect();
        prop_assert_eq!(&seen, &expected);
        prop_assert!(seen.iter().all(|c| *c <= max_retries));
        prop_assert_eq!(calls, seen.len());

        if failures as u32 <= max_retries {
            prop_assert_eq!(outcome, DeliveryOutcome::Acked);
            prop_assert_eq!(seen.len(), failures + 1);
        } else {
            prop_assert_eq!(outcome, DeliveryOutcome::DeadLettered);
            prop_assert_eq!(seen.len() as u32, max_retries + 1);
        }
    }
}
