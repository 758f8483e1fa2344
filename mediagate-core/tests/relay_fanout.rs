mod common;

use std::time::Duration;

use common::{video, Harness};
use mediagate_core::{
    config::RetentionPolicy,
    output::{AttachOptions, FrameConsumer, OutputSession},
    GatewayError, Protocol,
};

async fn frames_consumer(harness: &Harness, stream: &mediagate_core::registry::StreamHandle, protocol: Protocol) -> FrameConsumer {
    match harness
        .outputs
        .attach(stream, protocol, AttachOptions::new(4096))
        .await
        .unwrap()
    {
        OutputSession::Frames(consumer) => consumer,
        _ => panic!("{protocol} should hand out frames"),
    }
}

#[tokio::test]
async fn test_slow_webrtc_viewer_does_not_disturb_others() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(dir.path(), RetentionPolicy::default());
    let stream = harness.stream("cam1");

    // never read: overruns after four frames
    let slow_options = AttachOptions {
        resync_on_overrun: false,
        ..AttachOptions::new(4)
    };
    let mut webrtc = FrameConsumer::attach(&stream, Protocol::WebRtc, &slow_options).unwrap();
    let mut rtmp = frames_consumer(&harness, &stream, Protocol::Rtmp).await;
    let OutputSession::Hls(hls) = harness
        .outputs
        .attach(&stream, Protocol::Hls, AttachOptions::new(4096))
        .await
        .unwrap()
    else {
        panic!("expected an HLS session");
    };

    // 12 seconds, one keyframe per second
    for ts in (0..12_000).step_by(40) {
        stream.bus().publish(video(ts, ts % 1000 == 0));
    }

    let mut received = Vec::new();
    while received.len() < 300 {
        let frame = tokio::time::timeout(Duration::from_secs(5), rtmp.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.push(frame.seq);
    }
    assert!(received.windows(2).all(|w| w[1] == w[0] + 1), "rtmp saw frames out of order");
    assert_eq!(rtmp.resyncs(), 0);

    let playlist = hls.playlist(Duration::from_secs(5)).await.unwrap();
    assert!(playlist.contains("#EXTINF"));

    let mut drained = 0;
    let overrun = loop {
        match webrtc.recv().await {
            Ok(Some(_)) => drained += 1,
            Ok(None) => panic!("stream did not end"),
            Err(e) => break e,
        }
    };
    assert!(matches!(overrun, GatewayError::Overrun(_)));
    assert!(drained <= 4);
    assert!(stream.bus().stats().overruns >= 1);
    assert!(!stream.is_closed());
}

#[tokio::test]
async fn test_late_viewers_start_on_a_keyframe() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(dir.path(), RetentionPolicy::default());
    let stream = harness.stream("cam1");
    for ts in (0..1000).step_by(40) {
        stream.bus().publish(video(ts, ts == 0));
    }

    // joins mid-GOP without the cached GOP: waits for the next keyframe
    let live_only = AttachOptions {
        replay_gop: false,
        ..AttachOptions::new(64)
    };
    let mut late = FrameConsumer::attach(&stream, Protocol::Rtsp, &live_only).unwrap();
    // joins with the cached GOP: starts on the keyframe already seen
    let mut replayed = frames_consumer(&harness, &stream, Protocol::Rtmp).await;

    stream.bus().publish(video(1000, false));
    stream.bus().publish(video(1040, true));
    stream.bus().publish(video(1080, false));

    let first = late.recv().await.unwrap().unwrap();
    assert!(first.keyframe);
    assert_eq!(first.dts_ms, 1040);
    assert_eq!(late.recv().await.unwrap().unwrap().dts_ms, 1080);

    let first = replayed.recv().await.unwrap().unwrap();
    assert!(first.keyframe);
    assert_eq!(first.dts_ms, 0);
}

#[tokio::test]
async fn test_streams_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(dir.path(), RetentionPolicy::default());
    let one = harness.stream("one");
    let two = harness.stream("two");
    let mut on_one = frames_consumer(&harness, &one, Protocol::Rtmp).await;
    let mut on_two = frames_consumer(&harness, &two, Protocol::Rtmp).await;

    one.bus().publish(video(0, true));
    two.bus().publish(video(500, true));
    harness.registry.release(two.key(), true).unwrap();
    one.bus().publish(video(40, false));

    assert_eq!(on_two.recv().await.unwrap().unwrap().dts_ms, 500);
    assert!(on_two.recv().await.unwrap().is_none());

    assert_eq!(on_one.recv().await.unwrap().unwrap().dts_ms, 0);
    assert_eq!(on_one.recv().await.unwrap().unwrap().dts_ms, 40);
    assert!(!one.is_closed());
    assert_eq!(harness.registry.list_active().len(), 1);
}
