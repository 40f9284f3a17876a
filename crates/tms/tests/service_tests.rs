//! Background service lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tms::db::cursor_repo;
use tms::ingest::{IngestPhase, IngestSettings, IngestionService};

const LONG_INTERVAL: Duration = Duration::from_secs(3600);

async fn wait_for_cycles(service: &IngestionService, cycles: u64) {
    for _ in 0..500 {
        if service.status().cycles_completed >= cycles {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} cycles, saw {}",
        cycles,
        service.status().cycles_completed
    );
}

fn service_for(harness: &Harness, settings: IngestSettings) -> IngestionService {
    IngestionService::new(Arc::new(harness.ingestor(settings)), LONG_INTERVAL)
}

#[tokio::test]
async fn test_start_runs_first_cycle_immediately() {
    let harness = Harness::new(FakeMailbox::with_messages(&[1, 2]));
    let service = service_for(&harness, test_settings());

    assert!(service.start());
    wait_for_cycles(&service, 1).await;

    let status = service.status();
    assert!(status.running);
    assert_eq!(status.uid_max, 2);
    assert_eq!(status.last_summary.unwrap().tickets_created, 2);
    assert!(status.last_cycle_at.is_some());

    assert!(service.stop(Duration::from_secs(5)).await);
    let status = service.status();
    assert!(!status.running);
    assert_eq!(status.phase, IngestPhase::Stopped);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let harness = Harness::new(FakeMailbox::new());
    let service = service_for(&harness, test_settings());

    assert!(service.start());
    assert!(!service.start());
    assert!(service.stop(Duration::from_secs(5)).await);

    // Restartable after a stop.
    assert!(service.start());
    assert!(service.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_stop_without_start() {
    let harness = Harness::new(FakeMailbox::new());
    let service = service_for(&harness, test_settings());

    assert!(service.stop(Duration::from_secs(1)).await);
    assert!(!service.status().running);
}

#[tokio::test]
async fn test_request_cycle_wakes_the_loop() {
    let harness = Harness::new(FakeMailbox::with_messages(&[1]));
    let service = service_for(&harness, test_settings());

    service.start();
    wait_for_cycles(&service, 1).await;

    harness.mailbox.add(2, numbered_complaint(2));
    service.request_cycle();
    wait_for_cycles(&service, 2).await;

    assert_eq!(harness.store.count().unwrap(), 2);
    assert_eq!(service.status().uid_max, 2);
    service.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_trigger_without_background_loop() {
    let harness = Harness::new(FakeMailbox::with_messages(&[3]));
    let service = service_for(&harness, test_settings());

    let summary = service.trigger().await;

    assert_eq!(summary.tickets_created, 1);
    let status = service.status();
    assert!(!status.running);
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.last_summary, Some(summary));
}

#[tokio::test]
async fn test_concurrent_triggers_are_serialized() {
    let harness = Harness::new(FakeMailbox::with_messages(&[1, 2, 3]));
    let service = service_for(&harness, test_settings());

    let (a, b) = tokio::join!(service.trigger(), service.trigger());

    assert_eq!(a.tickets_created + b.tickets_created, 3);
    assert_eq!(a.tickets_existing + b.tickets_existing, 0);
    assert_eq!(harness.mailbox.fetched(), vec![1, 2, 3]);
    assert_eq!(harness.store.count().unwrap(), 3);
}

#[tokio::test]
async fn test_stop_abandons_hanging_analysis() {
    let harness = Harness::new(FakeMailbox::with_messages(&[1]));
    let settings = IngestSettings {
        analysis_timeout: LONG_INTERVAL,
        ..test_settings()
    };
    let ingestor = harness
        .ingestor(settings)
        .with_analyzer(Arc::new(FakeClassifier::new(Verdict::Hang)));
    let service = IngestionService::new(Arc::new(ingestor), LONG_INTERVAL);

    service.start();
    for _ in 0..500 {
        if harness.store.count().unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The cycle gives up on the analysis instead of being aborted.
    assert!(service.stop(Duration::from_secs(5)).await);
    let status = service.status();
    assert!(!status.running);
    assert_eq!(status.phase, IngestPhase::Stopped);
    assert_eq!(status.uid_max, 1);
    assert_eq!(harness.mailbox.closed(), harness.mailbox.opened());
    assert_eq!(harness.store.count().unwrap(), 1);
}

#[tokio::test]
async fn test_stop_aborts_stalled_fetch_and_keeps_cursor() {
    let harness = Harness::new(FakeMailbox::with_messages(&[1, 2]));
    harness.mailbox.stall_fetch(2);
    let settings = IngestSettings {
        persist_cursor: true,
        ..test_settings()
    };
    let ingestor = harness.ingestor(settings).with_cursor_store(harness.db.clone());
    let service = IngestionService::new(Arc::new(ingestor), LONG_INTERVAL);

    service.start();
    for _ in 0..500 {
        if harness.mailbox.fetched().contains(&2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!service.stop(Duration::from_millis(100)).await);
    let status = service.status();
    assert!(!status.running);
    assert_eq!(status.phase, IngestPhase::Stopped);

    // UID 1 was ingested before the stall; the stored cursor reflects it.
    assert_eq!(harness.store.count().unwrap(), 1);
    let row = cursor_repo::find(&harness.db, "INBOX").unwrap().unwrap();
    assert_eq!(row.uid_max, 1);
}
