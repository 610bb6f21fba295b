//! End-to-end transfers through the engine API over loopback peers
//!
//! Covers partial failure isolation, single-recipient transfers,
//! cancellation, pinned identities, on-disk destinations, and progress
//! reporting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferry_core::bandwidth::Pacer;
use ferry_core::loopback::PeerBehavior;
use ferry_core::{
    FerryConfig, FerryError, FileSource, GroupStatus, ReceivedData, RecipientId, RecipientStatus,
};
use ferry_crypto::identity::IdentityKeypair;
use ferry_integration_tests::{loopback_engine, pattern};
use ferry_transport::ChunkSizingConfig;
use ferry_transport::simulated::LinkProfile;

/// Small chunks so a modest file spans many frames.
fn small_chunks() -> FerryConfig {
    let mut config = FerryConfig::default();
    config.transport.sizing = ChunkSizingConfig {
        min_chunk: 4 * 1024,
        initial_chunk: 16 * 1024,
        max_chunk: 32 * 1024,
        ..ChunkSizingConfig::default()
    };
    config
}

async fn wait_for(handle: &ferry_core::TransferHandle) -> ferry_core::GroupOutcome {
    tokio::time::timeout(Duration::from_secs(60), handle.wait())
        .await
        .expect("transfer did not finish")
}

// ============================================================================
// Group transfers
// ============================================================================

#[tokio::test]
async fn test_one_failing_recipient_is_isolated() {
    let mut behaviors = vec![PeerBehavior::accepting(); 5];
    behaviors[3] = PeerBehavior::failing_after(8);
    let mut config = small_chunks();
    config.transfer.receipt_timeout_secs = 5;
    let (engine, connector, recipients) = loopback_engine(config, LinkProfile::ideal(), behaviors);

    let data = pattern(1024 * 1024);
    let handle = engine
        .create_group_transfer(recipients, FileSource::from_bytes("bulk.bin", data.clone()))
        .await
        .unwrap();
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Partial);
    assert_eq!(outcome.succeeded.len(), 4);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].recipient, RecipientId::new("r3"));
    assert!(!outcome.succeeded.contains(&RecipientId::new("r3")));

    for i in [0, 1, 2, 4] {
        let id = RecipientId::new(format!("r{i}"));
        let file = connector.received(&id).await.unwrap().unwrap();
        assert_eq!(file.size, data.len() as u64);
        assert_eq!(file.hash, *blake3_digest(&data).as_bytes());
        match file.data {
            ReceivedData::Memory(bytes) => assert_eq!(bytes, data),
            ReceivedData::Disk(path) => panic!("unexpected file at {}", path.display()),
        }
        assert_eq!(
            handle.session(&id).unwrap().status(),
            RecipientStatus::Completed
        );
    }
    let r3 = RecipientId::new("r3");
    assert!(connector.received(&r3).await.unwrap().is_err());
    assert_eq!(
        handle.session(&r3).unwrap().status(),
        RecipientStatus::Failed
    );

    let progress = handle.progress();
    assert_eq!(progress.completed, 4);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.active, 0);
}

#[tokio::test]
async fn test_all_declining_is_a_failed_group() {
    let behaviors = vec![PeerBehavior::declining("no space"); 3];
    let (engine, _connector, recipients) =
        loopback_engine(FerryConfig::default(), LinkProfile::ideal(), behaviors);

    let handle = engine
        .create_group_transfer(recipients, FileSource::from_bytes("f", vec![1u8; 4096]))
        .await
        .unwrap();
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Failed);
    assert!(outcome.succeeded.is_empty());
    assert_eq!(outcome.failed.len(), 3);
    for failure in &outcome.failed {
        assert!(matches!(&failure.error, FerryError::KeyExchange(m) if m.contains("no space")));
    }
}

#[tokio::test]
async fn test_lossy_links_still_deliver() {
    let behaviors = vec![PeerBehavior::accepting(); 3];
    let profile = LinkProfile::lossy(0.05, Duration::from_millis(2));
    let mut config = small_chunks();
    config.transport.ack_timeout_ms = 100;
    config.transport.max_send_retries = 50;
    let (engine, connector, recipients) = loopback_engine(config, profile, behaviors);

    let data = pattern(256 * 1024);
    let source = FileSource::from_bytes("lossy.bin", data.clone());
    let handle = engine
        .create_group_transfer(recipients, source)
        .await
        .unwrap();
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Completed, "{outcome:?}");
    for i in 0..3 {
        let file = connector
            .received(&RecipientId::new(format!("r{i}")))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(file.data, ReceivedData::Memory(ref bytes) if *bytes == data));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_and_failing_recipients_do_not_hold_back_the_rest() {
    let mut config = small_chunks();
    config.transfer.receipt_timeout_secs = 5;
    config.transport.ack_timeout_ms = 5_000;
    let data = pattern(512 * 1024);

    // Baseline: the same file to one recipient on its own.
    let (solo, _solo_connector, solo_recipients) = loopback_engine(
        config.clone(),
        LinkProfile::ideal(),
        vec![PeerBehavior::accepting()],
    );
    let started = Instant::now();
    let source = FileSource::from_bytes("mixed.bin", data.clone());
    let handle = solo
        .create_group_transfer(solo_recipients, source)
        .await
        .unwrap();
    assert_eq!(wait_for(&handle).await.status, GroupStatus::Completed);
    let baseline = started.elapsed();

    let slow = LinkProfile {
        latency: Duration::from_millis(250),
        ..LinkProfile::ideal()
    };
    let mut behaviors = vec![PeerBehavior::accepting(); 5];
    behaviors[1] = PeerBehavior::accepting().over_link(slow);
    behaviors[3] = PeerBehavior::failing_after(8);
    let (engine, connector, recipients) = loopback_engine(config, LinkProfile::ideal(), behaviors);
    let ids: Vec<RecipientId> = recipients.iter().map(|r| r.id.clone()).collect();

    let started = Instant::now();
    let source = FileSource::from_bytes("mixed.bin", data.clone());
    let handle = engine
        .create_group_transfer(recipients, source)
        .await
        .unwrap();
    let mut finished: HashMap<RecipientId, Duration> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let over = handle.outcome().is_some();
            for id in &ids {
                let done = handle
                    .session(id)
                    .is_some_and(|s| s.status() == RecipientStatus::Completed);
                if done && !finished.contains_key(id) {
                    finished.insert(id.clone(), started.elapsed());
                }
            }
            if over {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("transfer did not finish");
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Partial, "{outcome:?}");
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].recipient, ids[3]);

    let slow_done = finished[&ids[1]];
    for i in [0, 2, 4] {
        let id = &ids[i];
        let done = finished[id];
        assert!(done < slow_done, "{id} waited for the slow recipient");
        assert!(
            done <= baseline * 4 + Duration::from_millis(250),
            "{id} took {done:?} against a solo baseline of {baseline:?}"
        );

        let session = handle.session(id).unwrap();
        assert_eq!(session.status(), RecipientStatus::Completed);
        assert!(session.failure().is_none());
        let file = connector.received(id).await.unwrap().unwrap();
        assert_eq!(file.hash, *blake3_digest(&data).as_bytes());
    }
    assert!(outcome.succeeded.contains(&ids[1]));
    let file = connector.received(&ids[1]).await.unwrap().unwrap();
    assert_eq!(file.hash, *blake3_digest(&data).as_bytes());
}

#[tokio::test]
async fn test_group_beyond_registry_capacity_is_rejected() {
    let mut config = FerryConfig::default();
    config.transfer.registry_capacity = 2;
    let (engine, connector, recipients) = loopback_engine(
        config,
        LinkProfile::ideal(),
        vec![PeerBehavior::accepting(); 3],
    );

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine.create_group_transfer(recipients, FileSource::from_bytes("f", pattern(4096))),
    )
    .await
    .expect("oversized group stalled")
    .unwrap_err();

    assert!(matches!(err, FerryError::Validation(ref m) if m.contains("registry")));
    assert!(engine.registry().is_empty());
    for i in 0..3 {
        let id = RecipientId::new(format!("r{i}"));
        assert!(connector.received(&id).await.is_none());
    }
}

// ============================================================================
// Single transfers
// ============================================================================

#[tokio::test]
async fn test_single_transfer_completes() {
    let (engine, connector, mut recipients) = loopback_engine(
        FerryConfig::default(),
        LinkProfile::lan(),
        vec![PeerBehavior::accepting()],
    );
    let recipient = recipients.remove(0);
    let id = recipient.id.clone();

    let source = FileSource::from_bytes("notes.txt", pattern(70_000));
    let handle = engine
        .create_single_transfer(recipient, source)
        .await
        .unwrap();
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Completed);
    assert_eq!(outcome.succeeded, vec![id.clone()]);
    assert_eq!(connector.cancel_notices(&id), 0);
    let file = connector.received(&id).await.unwrap().unwrap();
    assert_eq!(file.name, "notes.txt");
    assert_eq!(file.size, 70_000);
}

#[tokio::test]
async fn test_empty_file_is_rejected_up_front() {
    let (engine, _connector, recipients) = loopback_engine(
        FerryConfig::default(),
        LinkProfile::ideal(),
        vec![PeerBehavior::accepting()],
    );
    let err = engine
        .create_group_transfer(recipients, FileSource::from_bytes("empty", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::Validation(_)));
    assert!(engine.registry().is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_mid_transfer_terminates_sessions() {
    let mut config = small_chunks();
    config.transfer.bandwidth_limit_bps = 256 * 1024;
    let (engine, connector, recipients) = loopback_engine(
        config,
        LinkProfile::ideal(),
        vec![PeerBehavior::accepting(); 2],
    );

    let source = FileSource::from_bytes("slow.bin", pattern(2 * 1024 * 1024));
    let handle = engine
        .create_group_transfer(recipients, source.clone())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while handle.progress().percent <= 0.0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transfer never made progress");

    handle.cancel();
    let outcome = wait_for(&handle).await;
    assert_eq!(outcome.status, GroupStatus::Failed);
    assert_eq!(outcome.failed.len(), 2);
    for failure in &outcome.failed {
        assert!(matches!(
            failure.error,
            FerryError::Cancelled(_) | FerryError::SessionTerminated
        ));
    }

    for i in 0..2 {
        let id = RecipientId::new(format!("r{i}"));
        let session = handle.session(&id).unwrap();
        assert_eq!(session.status(), RecipientStatus::Cancelled);
        assert!(matches!(
            session.rekey().await,
            Err(FerryError::SessionTerminated)
        ));
        assert!(matches!(
            session.run(&source, &mut Pacer::unlimited()).await,
            Err(FerryError::SessionTerminated)
        ));
        assert!(connector.received(&id).await.unwrap().is_err());
    }

    // Group cancellation notices go out on the signaling path.
    tokio::time::timeout(Duration::from_secs(5), async {
        while (0..2).any(|i| connector.cancel_notices(&RecipientId::new(format!("r{i}"))) == 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cancel notices were not delivered");
}

// ============================================================================
// Identities
// ============================================================================

#[tokio::test]
async fn test_pinned_identities_and_mismatch() {
    let sender = Arc::new(IdentityKeypair::generate());
    let good = Arc::new(IdentityKeypair::generate());
    let impostor = Arc::new(IdentityKeypair::generate());

    let behaviors = vec![
        PeerBehavior::accepting()
            .with_identity(Arc::clone(&good))
            .expecting_sender(sender.public_key()),
        PeerBehavior::accepting()
            .with_identity(Arc::clone(&impostor))
            .expecting_sender(sender.public_key()),
    ];
    let (engine, connector, recipients) =
        loopback_engine(FerryConfig::default(), LinkProfile::ideal(), behaviors);
    let engine = engine.with_identity(Arc::clone(&sender));

    // Both descriptors pin the honest key; the second peer signs with another.
    let recipients: Vec<_> = recipients
        .into_iter()
        .map(|r| r.with_identity(good.public_key()))
        .collect();

    let source = FileSource::from_bytes("id.txt", vec![5u8; 10_000]);
    let handle = engine
        .create_group_transfer(recipients, source)
        .await
        .unwrap();
    let outcome = wait_for(&handle).await;

    assert_eq!(outcome.status, GroupStatus::Partial);
    assert_eq!(outcome.succeeded, vec![RecipientId::new("r0")]);
    assert_eq!(outcome.failed[0].recipient, RecipientId::new("r1"));
    let r0 = RecipientId::new("r0");
    assert!(connector.received(&r0).await.unwrap().is_ok());
}

// ============================================================================
// Destinations
// ============================================================================

#[tokio::test]
async fn test_directory_destination_sanitizes_names() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, connector, recipients) = loopback_engine(
        FerryConfig::default(),
        LinkProfile::ideal(),
        vec![PeerBehavior::accepting().into_directory(dir.path())],
    );
    let id = recipients[0].id.clone();
    let data = pattern(50_000);

    for expected in ["escape.txt", "escape (1).txt"] {
        let handle = engine
            .create_single_transfer(
                recipients[0].clone(),
                FileSource::from_bytes("../../escape.txt", data.clone()),
            )
            .await
            .unwrap();
        assert_eq!(wait_for(&handle).await.status, GroupStatus::Completed);

        let file = connector.received(&id).await.unwrap().unwrap();
        let ReceivedData::Disk(path) = file.data else {
            panic!("expected a file on disk");
        };
        assert_eq!(path, dir.path().join(expected));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    }
}

// ============================================================================
// Progress reporting
// ============================================================================

#[tokio::test]
async fn test_progress_and_completion_callbacks() {
    let mut config = small_chunks();
    config.transfer.progress_min_interval_ms = 1;
    let (engine, _connector, recipients) = loopback_engine(
        config,
        LinkProfile::lan(),
        vec![PeerBehavior::accepting(); 3],
    );

    let source = FileSource::from_bytes("p.bin", pattern(512 * 1024));
    let handle = engine
        .create_group_transfer(recipients, source)
        .await
        .unwrap();

    let percents = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&percents);
    handle.on_progress(move |p| sink.lock().unwrap().push(p.percent));
    let completions = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&completions);
    handle.on_complete(move |_| *counter.lock().unwrap() += 1);

    let outcome = wait_for(&handle).await;
    assert_eq!(outcome.status, GroupStatus::Completed);
    assert!((handle.progress().percent - 100.0).abs() < 1e-9);

    let percents = percents.lock().unwrap().clone();
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));

    // Late subscribers see the outcome once.
    let late = Arc::new(Mutex::new(Vec::new()));
    let late_sink = Arc::clone(&late);
    handle.on_complete(move |o| late_sink.lock().unwrap().push(o.status));
    assert_eq!(*late.lock().unwrap(), vec![GroupStatus::Completed]);
    assert_eq!(*completions.lock().unwrap(), 1);
}

fn blake3_digest(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}
