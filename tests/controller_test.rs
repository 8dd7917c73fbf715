//! Controller + runtime behavior over the in-memory broker: job
//! finalization, idempotent dedup, requeue of malformed payloads, and
//! inactivity reaping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use gamestream::{
    receive_frame, send_frame, BrokerDelivery, BrokerExchange, BrokerQueue, CodecError,
    Controller, Deserializer, EofToken, EofValidator, Handler, HandlerError, HandlerFactory,
    IdempotencyId, InMemoryBroker, JobId, MessageKind, NodeProtocol, Partitionable,
    RequiredTokens, RingMessage, Serializable, Serializer, TokenName, TransportMessage,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct TestRecord {
    key: String,
    value: u32,
}

impl Serializable for TestRecord {
    fn serialize(&self) -> Vec<u8> {
        Serializer::new()
            .write_string(&self.key)
            .write_u32(self.value)
            .into_bytes()
    }
}

impl Partitionable for TestRecord {
    fn partition_key(&self) -> String {
        self.key.clone()
    }
}

fn decode_record(payload: &[u8]) -> Result<TestRecord, CodecError> {
    let mut d = Deserializer::new(payload);
    Ok(TestRecord {
        key: d.read_string()?,
        value: d.read_u32()?,
    })
}

/// Counters shared between a test and every handler its factory builds.
#[derive(Default)]
struct Probe {
    factory_calls: AtomicUsize,
    handled: AtomicUsize,
    shutdowns: Mutex<Vec<bool>>,
}

/// Forwards every record downstream unchanged; optionally emits the running
/// total as a final-stage record.
struct ForwardingHandler {
    probe: Arc<Probe>,
    emit_total: bool,
    total: u32,
}

#[async_trait]
impl Handler for ForwardingHandler {
    async fn handle(
        &mut self,
        payload: &[u8],
    ) -> Result<Option<Box<dyn Partitionable + Send>>, HandlerError> {
        let record = decode_record(payload)?;
        self.probe.handled.fetch_add(1, Ordering::SeqCst);
        self.total += record.value;
        Ok(Some(Box::new(record)))
    }

    fn next_stage(
        &mut self,
    ) -> (
        mpsc::Receiver<Box<dyn Partitionable + Send>>,
        mpsc::Receiver<HandlerError>,
    ) {
        let (tx, rx) = mpsc::channel::<Box<dyn Partitionable + Send>>(8);
        let (_err_tx, err_rx) = mpsc::channel(8);
        if self.emit_total {
            let _ = tx.try_send(Box::new(TestRecord {
                key: "total".to_string(),
                value: self.total,
            }));
        }
        drop(tx);
        (rx, err_rx)
    }

    async fn shutdown(&mut self, delete: bool) -> Result<(), HandlerError> {
        self.probe.shutdowns.lock().unwrap().push(delete);
        Ok(())
    }
}

fn make_factory(probe: Arc<Probe>, emit_total: bool) -> HandlerFactory {
    Box::new(move |_job: JobId| {
        probe.factory_calls.fetch_add(1, Ordering::SeqCst);
        let handler = ForwardingHandler {
            probe: Arc::clone(&probe),
            emit_total,
            total: 0,
        };
        let validator = RequiredTokens::new(
            [(TokenName::Game, 1)],
            EofToken::new(TokenName::Partition(1), 1),
        );
        Ok((
            Box::new(handler) as Box<dyn Handler>,
            Box::new(validator) as Box<dyn EofValidator>,
        ))
    })
}

struct Stage {
    broker: InMemoryBroker,
    ingress: Arc<dyn BrokerExchange>,
    observe: mpsc::Receiver<Box<dyn BrokerDelivery>>,
    inputs: Vec<Arc<dyn BrokerQueue>>,
    outputs: Vec<Arc<dyn BrokerExchange>>,
}

async fn stage(partitions: u32) -> Stage {
    let broker = InMemoryBroker::new();
    broker.declare_exchange("ingress");
    broker.declare_exchange("downstream");
    broker.declare_queue("stage_in");
    broker.declare_queue("observe");
    broker.bind("stage_in", "ingress", "1").unwrap();
    for key in 1..=partitions {
        broker.bind("observe", "downstream", &key.to_string()).unwrap();
    }

    let inputs = vec![broker.queue("stage_in").unwrap()];
    let outputs = vec![broker.exchange("downstream").unwrap()];
    let observe = broker.queue("observe").unwrap().consume().await.unwrap();
    let ingress = broker.exchange("ingress").unwrap();
    Stage {
        broker,
        ingress,
        observe,
        inputs,
        outputs,
    }
}

async fn publish(
    ingress: &Arc<dyn BrokerExchange>,
    job: JobId,
    seq: u32,
    kind: MessageKind,
    payload: Vec<u8>,
) {
    let msg = TransportMessage::new(job, IdempotencyId::new("upstream", seq), kind, payload);
    ingress.publish("1", &msg.marshal()).await.unwrap();
}

async fn next_downstream(
    observe: &mut mpsc::Receiver<Box<dyn BrokerDelivery>>,
) -> TransportMessage {
    let delivery = tokio::time::timeout(WAIT, observe.recv())
        .await
        .expect("timed out waiting for a downstream message")
        .expect("observe queue closed");
    let message = TransportMessage::unmarshal(delivery.body()).unwrap();
    delivery.ack().await.unwrap();
    message
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn job_finalization_emits_data_then_one_eof() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-test",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(Arc::clone(&probe), false),
        "0",
    )
    .await
    .unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    let job = Uuid::new_v4();
    for (seq, key, value) in [(1, "a", 1), (2, "b", 2), (3, "c", 3)] {
        let record = TestRecord {
            key: key.to_string(),
            value,
        };
        publish(&s.ingress, job, seq, MessageKind::Data, record.serialize()).await;
    }
    publish(
        &s.ingress,
        job,
        4,
        MessageKind::Control,
        EofToken::new(TokenName::Game, 1).serialize(),
    )
    .await;

    // Three data emissions, in ingest order, then exactly one EOF broadcast.
    let mut sequences = Vec::new();
    for expected_key in ["a", "b", "c"] {
        let msg = next_downstream(&mut s.observe).await;
        assert_eq!(msg.kind, MessageKind::Data);
        assert_eq!(msg.job_id, job);
        assert_eq!(msg.idem_id.origin, "stage-test");
        sequences.push(msg.idem_id.sequence);
        assert_eq!(decode_record(&msg.payload).unwrap().key, expected_key);
    }
    let eof = next_downstream(&mut s.observe).await;
    assert!(eof.is_eof());
    let token = EofToken::deserialize(&mut Deserializer::new(&eof.payload)).unwrap();
    assert_eq!(token, EofToken::new(TokenName::Partition(1), 1));
    sequences.push(eof.idem_id.sequence);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    // The runtime left the registry: the same job now builds a new handler.
    let record = TestRecord {
        key: "late".to_string(),
        value: 9,
    };
    publish(&s.ingress, job, 5, MessageKind::Data, record.serialize()).await;
    wait_until(|| probe.factory_calls.load(Ordering::SeqCst) == 2).await;

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    // First runtime finished (delete), second was interrupted by shutdown.
    assert_eq!(*probe.shutdowns.lock().unwrap(), vec![true, false]);
    // Upstream deliveries all acked once their downstream effect published.
    assert!(s.broker.acked() >= 5);
}

#[tokio::test]
async fn final_stage_records_precede_the_eof_broadcast() {
    let mut s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-agg",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(Arc::clone(&probe), true),
        "0",
    )
    .await
    .unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    let job = Uuid::new_v4();
    for (seq, value) in [(1, 10), (2, 5)] {
        let record = TestRecord {
            key: format!("k{}", seq),
            value,
        };
        publish(&s.ingress, job, seq, MessageKind::Data, record.serialize()).await;
    }
    publish(
        &s.ingress,
        job,
        3,
        MessageKind::Control,
        EofToken::new(TokenName::Game, 1).serialize(),
    )
    .await;

    let mut messages = Vec::new();
    for _ in 0..4 {
        messages.push(next_downstream(&mut s.observe).await);
    }

    // Two forwarded records, the aggregate, then the EOF - nothing after it.
    assert!(messages[..3].iter().all(|m| m.kind == MessageKind::Data));
    let total = decode_record(&messages[2].payload).unwrap();
    assert_eq!(total, TestRecord { key: "total".to_string(), value: 15 });
    assert!(messages[3].is_eof());

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_sequences_never_reach_the_handler() {
    let mut s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-dedup",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(Arc::clone(&probe), false),
        "0",
    )
    .await
    .unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    let job = Uuid::new_v4();
    let record = TestRecord {
        key: "dup".to_string(),
        value: 7,
    };
    publish(&s.ingress, job, 1, MessageKind::Data, record.serialize()).await;
    publish(&s.ingress, job, 1, MessageKind::Data, record.serialize()).await; // redelivery
    publish(&s.ingress, job, 2, MessageKind::Data, record.serialize()).await;

    let first = next_downstream(&mut s.observe).await;
    let second = next_downstream(&mut s.observe).await;
    assert_eq!(first.kind, MessageKind::Data);
    assert_eq!(second.kind, MessageKind::Data);

    // The duplicate was acked and dropped, not processed.
    wait_until(|| probe.handled.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(s.observe.try_recv().is_err());
    assert_eq!(probe.handled.load(Ordering::SeqCst), 2);

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_deliveries_are_requeued() {
    let mut s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-requeue",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(Arc::clone(&probe), false),
        "0",
    )
    .await
    .unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    s.ingress.publish("1", b"definitely not a frame").await.unwrap();

    let broker = s.broker.clone();
    wait_until(move || broker.requeued() >= 1).await;
    assert_eq!(probe.factory_calls.load(Ordering::SeqCst), 0);

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn reaper_closes_idle_runtimes_without_deleting_state() {
    let mut s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-reap",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(Arc::clone(&probe), false),
        "0",
    )
    .await
    .unwrap()
    .with_reaper_period(Duration::from_millis(50));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    let job = Uuid::new_v4();
    let record = TestRecord {
        key: "idle".to_string(),
        value: 1,
    };
    publish(&s.ingress, job, 1, MessageKind::Data, record.serialize()).await;
    let _ = next_downstream(&mut s.observe).await;

    // Three idle sweeps close the runtime; its state survives.
    let watch = Arc::clone(&probe);
    wait_until(move || watch.shutdowns.lock().unwrap().as_slice() == [false]).await;

    // A later message for the same job starts over with a fresh handler.
    publish(&s.ingress, job, 2, MessageKind::Data, record.serialize()).await;
    let watch = Arc::clone(&probe);
    wait_until(move || watch.factory_calls.load(Ordering::SeqCst) == 2).await;

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn manager_listener_answers_healthchecks() {
    let s = stage(1).await;
    let probe = Arc::new(Probe::default());

    let controller = Controller::new(
        "stage-manager",
        s.inputs.clone(),
        s.outputs.clone(),
        Arc::new(NodeProtocol::new(1)),
        make_factory(probe, false),
        "0",
    )
    .await
    .unwrap();
    let port = controller.manager_addr().unwrap().port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(controller.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));

    let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    for _ in 0..3 {
        send_frame(&mut conn, &RingMessage::HealthCheck).await.unwrap();
        let reply = tokio::time::timeout(WAIT, receive_frame(&mut conn))
            .await
            .expect("no reply in time")
            .unwrap();
        assert_eq!(reply, RingMessage::Alive);
    }
    drop(conn);

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}
