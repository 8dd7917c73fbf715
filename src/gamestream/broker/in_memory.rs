use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::gamestream::config::ArchitectureConfig;

use super::{BrokerDelivery, BrokerError, BrokerExchange, BrokerQueue};

const QUEUE_CAPACITY: usize = 256;

#[derive(Default)]
struct Counters {
    acked: AtomicUsize,
    requeued: AtomicUsize,
    discarded: AtomicUsize,
}

struct Binding {
    routing_key: String,
    queue: String,
}

struct QueueState {
    tx: mpsc::Sender<Box<dyn BrokerDelivery>>,
    rx: Option<mpsc::Receiver<Box<dyn BrokerDelivery>>>,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
}

/// Broker running entirely in process memory.
///
/// Direct-exchange semantics: a published message is copied into every queue
/// whose binding matches the routing key exactly; unmatched messages are
/// dropped. Nack-with-requeue feeds the message back into its queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            inner: Arc::new(Mutex::new(Inner::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Declares every exchange, queue, and binding of an architecture file.
    pub fn declare_architecture(&self, config: &ArchitectureConfig) -> Result<(), BrokerError> {
        for exchange in &config.exchanges {
            self.declare_exchange(&exchange.name);
        }
        for queue in &config.queues {
            self.declare_queue(&queue.name);
            for binding in &queue.bindings {
                self.bind(&queue.name, &binding.exchange, &binding.routing_key)?;
            }
        }
        Ok(())
    }

    /// Declares an exchange. Redeclaration is a no-op, as with a durable
    /// AMQP exchange.
    pub fn declare_exchange(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.exchanges.entry(name.to_string()).or_default();
    }

    /// Declares a queue. Redeclaration is a no-op.
    pub fn declare_queue(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            QueueState { tx, rx: Some(rx) }
        });
    }

    pub fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(queue.to_string()));
        }
        let bindings = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(exchange.to_string()))?;
        bindings.push(Binding {
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    /// Handle to a declared queue.
    pub fn queue(&self, name: &str) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        let inner = self.inner.lock().unwrap();
        if !inner.queues.contains_key(name) {
            return Err(BrokerError::NotFound(name.to_string()));
        }
        Ok(Arc::new(InMemoryQueue {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    /// Handle to a declared exchange.
    pub fn exchange(&self, name: &str) -> Result<Arc<dyn BrokerExchange>, BrokerError> {
        let inner = self.inner.lock().unwrap();
        if !inner.exchanges.contains_key(name) {
            return Err(BrokerError::NotFound(name.to_string()));
        }
        Ok(Arc::new(InMemoryExchange {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
            counters: Arc::clone(&self.counters),
        }))
    }

    pub fn acked(&self) -> usize {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.counters.requeued.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.counters.discarded.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        InMemoryBroker::new()
    }
}

struct InMemoryQueue {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl BrokerQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self) -> Result<mpsc::Receiver<Box<dyn BrokerDelivery>>, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| BrokerError::NotFound(self.name.clone()))?;
        state
            .rx
            .take()
            .ok_or_else(|| BrokerError::AlreadyConsumed(self.name.clone()))
    }
}

struct InMemoryExchange {
    name: String,
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BrokerExchange for InMemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        // Snapshot matching senders outside the lock before awaiting.
        let targets: Vec<mpsc::Sender<Box<dyn BrokerDelivery>>> = {
            let inner = self.inner.lock().unwrap();
            let bindings = inner
                .exchanges
                .get(&self.name)
                .ok_or_else(|| BrokerError::NotFound(self.name.clone()))?;
            bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .filter_map(|b| inner.queues.get(&b.queue).map(|q| q.tx.clone()))
                .collect()
        };

        for tx in targets {
            let delivery = Box::new(InMemoryDelivery {
                body: payload.to_vec(),
                queue_tx: tx.clone(),
                counters: Arc::clone(&self.counters),
            });
            tx.send(delivery)
                .await
                .map_err(|_| BrokerError::Transport("queue channel closed".to_string()))?;
        }
        Ok(())
    }
}

struct InMemoryDelivery {
    body: Vec<u8>,
    queue_tx: mpsc::Sender<Box<dyn BrokerDelivery>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BrokerDelivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>) -> Result<(), BrokerError> {
        self.counters.requeued.fetch_add(1, Ordering::SeqCst);
        let redelivery = Box::new(InMemoryDelivery {
            body: self.body.clone(),
            queue_tx: self.queue_tx.clone(),
            counters: Arc::clone(&self.counters),
        });
        self.queue_tx
            .send(redelivery)
            .await
            .map_err(|_| BrokerError::Transport("queue channel closed".to_string()))
    }

    async fn nack_discard(self: Box<Self>) -> Result<(), BrokerError> {
        self.counters.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_exact_key() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("games");
        broker.declare_queue("part1");
        broker.declare_queue("part2");
        broker.bind("part1", "games", "1").unwrap();
        broker.bind("part2", "games", "2").unwrap();

        let ex = broker.exchange("games").unwrap();
        ex.publish("1", b"for one").await.unwrap();
        ex.publish("2", b"for two").await.unwrap();
        ex.publish("9", b"dropped").await.unwrap();

        let mut rx1 = broker.queue("part1").unwrap().consume().await.unwrap();
        let mut rx2 = broker.queue("part2").unwrap().consume().await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().body(), b"for one");
        assert_eq!(rx2.recv().await.unwrap().body(), b"for two");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("ex");
        broker.declare_queue("q");
        broker.bind("q", "ex", "1").unwrap();

        broker.exchange("ex").unwrap().publish("1", b"m").await.unwrap();
        let mut rx = broker.queue("q").unwrap().consume().await.unwrap();

        let first = rx.recv().await.unwrap();
        first.nack_requeue().await.unwrap();
        let again = rx.recv().await.unwrap();
        assert_eq!(again.body(), b"m");
        again.ack().await.unwrap();

        assert_eq!(broker.requeued(), 1);
        assert_eq!(broker.acked(), 1);
    }

    #[tokio::test]
    async fn wires_an_architecture_file() {
        let config = ArchitectureConfig::parse(
            r#"
exchanges:
  - name: games
queues:
  - name: games_p1
    bindings:
      - exchange: games
        routingKey: "1"
partitions: 1
worker:
  port: "0"
"#,
        )
        .unwrap();

        let broker = InMemoryBroker::new();
        broker.declare_architecture(&config).unwrap();
        broker.exchange("games").unwrap().publish("1", b"g").await.unwrap();

        let mut rx = broker.queue("games_p1").unwrap().consume().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body(), b"g");
    }

    #[tokio::test]
    async fn queue_feeds_one_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let q = broker.queue("q").unwrap();
        let _rx = q.consume().await.unwrap();
        assert!(matches!(
            q.consume().await,
            Err(BrokerError::AlreadyConsumed(_))
        ));
    }
}
