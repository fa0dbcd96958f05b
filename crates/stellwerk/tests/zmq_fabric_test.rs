//! ZeroMQ fabric round-trip over localhost TCP.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use stellwerk::{ContextId, Fabric, Lane, Transport, WireFrame, ZmqFabric};

const SETTLE: Duration = Duration::from_millis(200);

#[tokio::test]
async fn frames_cross_units_over_tcp() {
    let base = Transport::tcp("127.0.0.1", 15800);

    let unit0 = ZmqFabric::connect(&base, 0, 2).await.unwrap();
    let unit1 = ZmqFabric::connect(&base, 1, 2).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let mut inbox = unit1.inbox(ContextId::Node, Lane::Control);

    let frame = WireFrame {
        ctx: ContextId::Node,
        lane: Lane::Control,
        tag: 2,
        src: 0,
        correlation: Uuid::new_v4(),
        sent_at: Utc::now(),
        payload: vec![0xab, 0xcd],
    };
    let correlation = frame.correlation;
    unit0.deliver(1, frame).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(3), inbox.recv())
        .await
        .expect("timed out waiting for frame")
        .unwrap();

    assert_eq!(got.ctx, ContextId::Node);
    assert_eq!(got.lane, Lane::Control);
    assert_eq!(got.tag, 2);
    assert_eq!(got.src, 0);
    assert_eq!(got.correlation, correlation);
    assert_eq!(got.payload, vec![0xab, 0xcd]);
}

#[tokio::test]
async fn lanes_demultiplex_per_unit() {
    let base = Transport::tcp("127.0.0.1", 15810);

    let unit0 = ZmqFabric::connect(&base, 0, 2).await.unwrap();
    let unit1 = ZmqFabric::connect(&base, 1, 2).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let mut ctrl = unit1.inbox(ContextId::Node, Lane::Control);
    let mut group = unit1.inbox(ContextId::Group(4), Lane::Group);

    for (ctx, lane, tag) in [
        (ContextId::Node, Lane::Control, 1),
        (ContextId::Group(4), Lane::Group, 9),
    ] {
        unit0
            .deliver(
                1,
                WireFrame {
                    ctx,
                    lane,
                    tag,
                    src: 0,
                    correlation: Uuid::new_v4(),
                    sent_at: Utc::now(),
                    payload: vec![],
                },
            )
            .unwrap();
    }

    let ctrl_frame = tokio::time::timeout(Duration::from_secs(3), ctrl.recv())
        .await
        .expect("control frame timed out")
        .unwrap();
    let group_frame = tokio::time::timeout(Duration::from_secs(3), group.recv())
        .await
        .expect("group frame timed out")
        .unwrap();

    assert_eq!(ctrl_frame.tag, 1);
    assert_eq!(group_frame.tag, 9);
    assert_eq!(group_frame.ctx, ContextId::Group(4));
}
