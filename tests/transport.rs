//! Parallel channel transport over simulated substrates
//!
//! Ordering across channels, backpressure hysteresis, and recovery from
//! loss and channel failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_integration_tests::{collector, pattern};
use ferry_transport::frame::Frame;
use ferry_transport::simulated::{LinkProfile, duplex, duplex_manual};
use ferry_transport::{Channel, ChannelId, ParallelTransport, TransportConfig, TransportError};

fn quick_config() -> TransportConfig {
    TransportConfig {
        ack_timeout_ms: 50,
        max_send_retries: 50,
        ..TransportConfig::default()
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_scrambled_arrival_is_delivered_in_order() {
    let (a, b) = duplex_manual(3);
    let sender = ParallelTransport::new(a.dyn_channels(), TransportConfig::default()).unwrap();
    let receiver = ParallelTransport::new(b.dyn_channels(), TransportConfig::default()).unwrap();
    let received = collector(&receiver);

    for i in 0..5u8 {
        sender.send_chunk(&[i; 16]).await.unwrap();
    }

    let mut frames: BTreeMap<u64, (ChannelId, Vec<u8>)> = BTreeMap::new();
    for ch in &a.channels {
        for msg in ch.take_queued() {
            let sequence = Frame::decode(&msg).unwrap().sequence;
            frames.insert(sequence, (ch.id(), msg));
        }
    }
    let sequences: Vec<u64> = frames.keys().copied().collect();
    assert_eq!(sequences.len(), 5);

    for index in [2, 0, 4, 1, 3] {
        let (channel, msg) = &frames[&sequences[index]];
        receiver.handle_inbound(*channel, msg).await.unwrap();
        if index == 2 {
            assert!(received.lock().unwrap().is_empty());
        }
    }

    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 16]).collect();
    assert_eq!(*received.lock().unwrap(), expected);

    // Feed the receiver's acknowledgements back; nothing is left in flight.
    for ch in &b.channels {
        for msg in ch.take_queued() {
            sender.handle_inbound(ch.id(), &msg).await.unwrap();
        }
    }
    assert_eq!(sender.unacked(), 0);
    sender.flush().await.unwrap();
}

#[tokio::test]
async fn test_scrambled_file_chunks_reassemble_to_source() {
    let (a, b) = duplex_manual(3);
    let sender = ParallelTransport::new(a.dyn_channels(), TransportConfig::default()).unwrap();
    let receiver = ParallelTransport::new(b.dyn_channels(), TransportConfig::default()).unwrap();
    let received = collector(&receiver);

    let source = pattern(48 * 1024 + 300);
    let chunks: Vec<&[u8]> = source.chunks(1024).collect();
    for chunk in &chunks {
        sender.send_chunk(chunk).await.unwrap();
    }

    let mut frames: BTreeMap<u64, (ChannelId, Vec<u8>)> = BTreeMap::new();
    for ch in &a.channels {
        for msg in ch.take_queued() {
            let sequence = Frame::decode(&msg).unwrap().sequence;
            frames.insert(sequence, (ch.id(), msg));
        }
    }
    let sequences: Vec<u64> = frames.keys().copied().collect();
    let n = sequences.len();
    assert_eq!(n, chunks.len());

    // 17 is coprime with 49, so this visits every frame once, far out of order.
    for step in 0..n {
        let (channel, msg) = &frames[&sequences[(step * 17 + 5) % n]];
        receiver.handle_inbound(*channel, msg).await.unwrap();
    }

    let reassembled: Vec<u8> = received.lock().unwrap().concat();
    assert_eq!(reassembled.len(), source.len());
    assert_eq!(blake3::hash(&reassembled), blake3::hash(&source));
}

#[tokio::test]
async fn test_jittered_channels_preserve_order() {
    let (a, b) = duplex(4, LinkProfile::lossy(0.0, Duration::from_millis(8)));
    let sender = Arc::new(ParallelTransport::new(a.dyn_channels(), quick_config()).unwrap());
    let receiver = Arc::new(ParallelTransport::new(b.dyn_channels(), quick_config()).unwrap());
    sender.attach_inbox(a.inbox);
    receiver.attach_inbox(b.inbox);
    let received = collector(&receiver);

    for i in 0..200u32 {
        sender.send_chunk(&i.to_be_bytes()).await.unwrap();
    }
    sender.flush().await.unwrap();

    let got = received.lock().unwrap().clone();
    let expected: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(got, expected);
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_backpressure_resumes_only_below_low_watermark() {
    let (a, _b) = duplex_manual(2);
    let config = TransportConfig {
        high_watermark: 1000,
        low_watermark: 200,
        drain_timeout_ms: 5_000,
        ..TransportConfig::default()
    };
    let sender = Arc::new(ParallelTransport::new(a.dyn_channels(), config).unwrap());

    for _ in 0..4 {
        sender.send_chunk(&[7; 600]).await.unwrap();
    }
    assert_eq!(a.channels[0].queued(), 2);
    assert_eq!(a.channels[1].queued(), 2);

    let blocked = Arc::clone(&sender);
    let task = tokio::spawn(async move { blocked.send_chunk(b"next").await });

    // One frame drained: still above the low watermark, so the channel stays paused.
    assert_eq!(a.channels[0].release(1), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    assert_eq!(a.channels[0].release(1), 1);
    let sequence = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(sequence, 4);
    assert_eq!(a.channels[0].queued(), 1);
    assert_eq!(sender.pause_counts(), vec![1, 1]);
    assert_eq!(sender.stats().backpressure_waits, 1);
}

#[tokio::test]
async fn test_undrained_channels_surface_timeout() {
    let (a, _b) = duplex_manual(2);
    let config = TransportConfig {
        high_watermark: 1000,
        low_watermark: 200,
        drain_timeout_ms: 100,
        ..TransportConfig::default()
    };
    let sender = ParallelTransport::new(a.dyn_channels(), config).unwrap();
    sender.send_chunk(&[0; 1500]).await.unwrap();
    sender.send_chunk(&[0; 1500]).await.unwrap();
    assert!(matches!(
        sender.send_chunk(b"stuck").await,
        Err(TransportError::SendTimeout { .. })
    ));
    assert!(!sender.is_closed());
}

// ============================================================================
// Loss and failure
// ============================================================================

#[tokio::test]
async fn test_recovers_from_random_loss() {
    let (a, b) = duplex(3, LinkProfile::lossy(0.1, Duration::from_millis(2)));
    let sender = Arc::new(ParallelTransport::new(a.dyn_channels(), quick_config()).unwrap());
    let receiver = Arc::new(ParallelTransport::new(b.dyn_channels(), quick_config()).unwrap());
    sender.attach_inbox(a.inbox);
    receiver.attach_inbox(b.inbox);
    let received = collector(&receiver);

    for i in 0..120u8 {
        sender.send_chunk(&[i; 1024]).await.unwrap();
    }
    sender.flush().await.unwrap();

    let got = received.lock().unwrap().clone();
    assert_eq!(got.len(), 120);
    for (i, payload) in got.iter().enumerate() {
        assert_eq!(payload, &vec![i as u8; 1024]);
    }
    assert!(sender.stats().retransmissions > 0);
}

#[tokio::test]
async fn test_survives_channel_failure_mid_stream() {
    let (a, b) = duplex(3, LinkProfile::ideal());
    let sender = Arc::new(ParallelTransport::new(a.dyn_channels(), quick_config()).unwrap());
    let receiver = Arc::new(ParallelTransport::new(b.dyn_channels(), quick_config()).unwrap());
    sender.attach_inbox(a.inbox);
    receiver.attach_inbox(b.inbox);
    let received = collector(&receiver);

    for i in 0..30u8 {
        sender.send_chunk(&[i; 64]).await.unwrap();
    }
    a.channels[1].fail();
    for i in 30..60u8 {
        sender.send_chunk(&[i; 64]).await.unwrap();
    }
    sender.flush().await.unwrap();

    assert_eq!(sender.live_channels(), 2);
    let got = received.lock().unwrap().clone();
    let expected: Vec<Vec<u8>> = (0..60u8).map(|i| vec![i; 64]).collect();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_losing_every_channel_is_reported() {
    let (a, _b) = duplex_manual(3);
    let sender = ParallelTransport::new(a.dyn_channels(), quick_config()).unwrap();
    sender.send_chunk(b"before").await.unwrap();
    for ch in &a.channels {
        ch.fail();
    }
    assert_eq!(sender.live_channels(), 0);
    assert_eq!(
        sender.send_chunk(b"after").await,
        Err(TransportError::AllChannelsFailed(3))
    );
}
