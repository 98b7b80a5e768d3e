//! End-to-end protocol behavior over the in-process fabric.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use ffr_common::{ContextToken, NodeId};
use ffr_transport::{
    GraphRegistry, MemoryFabric, MessageSender, MessageSink, OutboundMessage, ReceivedMessage,
    ReceiverService, TransportRegistry, meta,
};

struct CollectingSink {
    received: Mutex<Vec<ReceivedMessage>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> Vec<ReceivedMessage> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let received = self.received.lock().expect("sink poisoned");
                if received.len() >= count {
                    return received.clone();
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {count} messages"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl MessageSink for CollectingSink {
    fn deliver(&self, msg: ReceivedMessage) -> ffr_common::Result<()> {
        self.received.lock().expect("sink poisoned").push(msg);
        Ok(())
    }
}

fn sample_batch(start: i64, rows: i64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from((start..start + rows).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                (start..start + rows)
                    .map(|v| if v % 7 == 0 { None } else { Some(format!("row-{v}")) })
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .expect("batch")
}

fn metadata(token: u32, route: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(meta::CONTEXT_TOKEN.to_string(), token.to_string());
    out.insert(meta::ROUTE.to_string(), route.to_string());
    out
}

#[test]
fn multi_frame_message_roundtrips_byte_for_byte() {
    let fabrics = MemoryFabric::cluster(2);
    let graphs = GraphRegistry::new();
    let sink = CollectingSink::new();
    graphs.register(ContextToken(42), sink.clone());

    let service = ReceiverService::start(
        fabrics[1].clone(),
        graphs.clone(),
        Duration::from_secs(5),
    )
    .expect("service");

    let sender = MessageSender::new(
        fabrics[0].clone(),
        TransportRegistry::new(),
        Duration::from_secs(5),
    )
    .with_max_frame_bytes(128);

    let batch = sample_batch(0, 500);
    sender
        .send(
            &[NodeId(1)],
            &OutboundMessage {
                metadata: metadata(42, "partition_3"),
                batch: Some(batch.clone()),
            },
        )
        .expect("send");

    let received = sink.wait_for(1, Duration::from_secs(5));
    assert_eq!(received[0].from, NodeId(0));
    assert_eq!(received[0].route(), "partition_3");
    assert_eq!(received[0].batches.len(), 1);
    assert_eq!(received[0].batches[0], batch);

    service.stop();
}

#[test]
fn control_message_without_frames_is_delivered() {
    let fabrics = MemoryFabric::cluster(2);
    let graphs = GraphRegistry::new();
    let sink = CollectingSink::new();
    graphs.register(ContextToken(7), sink.clone());

    let service = ReceiverService::start(
        fabrics[0].clone(),
        graphs.clone(),
        Duration::from_secs(5),
    )
    .expect("service");

    let sender = MessageSender::new(
        fabrics[1].clone(),
        TransportRegistry::new(),
        Duration::from_secs(5),
    );

    let mut md = metadata(7, "num_rows_9");
    md.insert(meta::NUM_ROWS.to_string(), "12345".to_string());
    sender
        .send(
            &[NodeId(0)],
            &OutboundMessage {
                metadata: md,
                batch: None,
            },
        )
        .expect("send");

    let received = sink.wait_for(1, Duration::from_secs(5));
    assert!(received[0].batches.is_empty());
    assert_eq!(
        received[0].metadata.get(meta::NUM_ROWS).map(String::as_str),
        Some("12345")
    );

    service.stop();
}

#[test]
fn messages_to_one_peer_complete_in_order() {
    let fabrics = MemoryFabric::cluster(2);
    let graphs = GraphRegistry::new();
    let sink = CollectingSink::new();
    graphs.register(ContextToken(9), sink.clone());

    let service = ReceiverService::start(
        fabrics[1].clone(),
        graphs.clone(),
        Duration::from_secs(5),
    )
    .expect("service");

    let sender = MessageSender::new(
        fabrics[0].clone(),
        TransportRegistry::new(),
        Duration::from_secs(5),
    )
    .with_max_frame_bytes(64);

    for i in 0..4 {
        sender
            .send(
                &[NodeId(1)],
                &OutboundMessage {
                    metadata: metadata(9, &format!("seq_{i}")),
                    batch: Some(sample_batch(i * 100, 50)),
                },
            )
            .expect("send");
    }

    let received = sink.wait_for(4, Duration::from_secs(5));
    let routes: Vec<_> = received.iter().map(|m| m.route().to_string()).collect();
    assert_eq!(routes, vec!["seq_0", "seq_1", "seq_2", "seq_3"]);

    service.stop();
}

#[test]
fn broadcast_reaches_every_destination() {
    let fabrics = MemoryFabric::cluster(3);
    let sinks = vec![CollectingSink::new(), CollectingSink::new()];

    // One registry per receiving node, each holding that node's sink for the
    // shared query token.
    let graphs1 = GraphRegistry::new();
    graphs1.register(ContextToken(5), sinks[0].clone());
    let graphs2 = GraphRegistry::new();
    graphs2.register(ContextToken(5), sinks[1].clone());

    let service1 =
        ReceiverService::start(fabrics[1].clone(), graphs1, Duration::from_secs(5)).expect("svc");
    let service2 =
        ReceiverService::start(fabrics[2].clone(), graphs2, Duration::from_secs(5)).expect("svc");

    let sender = MessageSender::new(
        fabrics[0].clone(),
        TransportRegistry::new(),
        Duration::from_secs(5),
    );

    let batch = sample_batch(0, 10);
    sender
        .send(
            &[NodeId(1), NodeId(2)],
            &OutboundMessage {
                metadata: metadata(5, "pivots_2"),
                batch: Some(batch.clone()),
            },
        )
        .expect("broadcast");

    for sink in &sinks {
        let received = sink.wait_for(1, Duration::from_secs(5));
        assert_eq!(received[0].batches[0], batch);
    }

    service1.stop();
    service2.stop();
}
