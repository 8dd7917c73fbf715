use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::gamestream::broker::BrokerDelivery;
use crate::gamestream::codec::Deserializer;
use crate::gamestream::protocol::{
    EofToken, EofValidator, JobId, MessageKind, Partitionable, Serializable, TokenName,
    TransportMessage,
};
use crate::gamestream::state::IdempotencyStore;

use super::{Handler, HandlerError};

/// Inactivity sweeps a runtime survives before the reaper closes it. Two
/// passes of leeway, gone at the third.
pub(crate) const REAPER_MARK_LIMIT: u32 = 3;

/// Where the forwarder should send a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routing {
    /// One partition, chosen by hashing the key.
    Unicast { key: String },
    /// Every partition.
    Broadcast,
}

/// One message queued on the controller's shared outbox.
pub(crate) struct MessageToSend {
    pub routing: Routing,
    pub job_id: JobId,
    pub kind: MessageKind,
    pub body: Vec<u8>,
    /// Broker delivery to acknowledge once the message is published.
    pub ack: Option<Box<dyn BrokerDelivery>>,
    pub callback: Option<Box<dyn FnOnce() + Send>>,
}

/// One delivery routed from a queue into a runtime's inbox.
pub(crate) struct MessageFromQueue {
    pub delivery: Box<dyn BrokerDelivery>,
    pub message: TransportMessage,
}

/// Controller-side handle to a spawned runtime.
pub(crate) struct RuntimeHandle {
    /// `None` once the controller closed the inbox (reaper or shutdown).
    pub tx: Option<mpsc::Sender<MessageFromQueue>>,
    pub mark: Arc<AtomicU32>,
}

enum Outcome {
    /// Validator fired and the EOF broadcast is queued.
    Finished,
    /// Inbox closed before the job completed.
    Interrupted,
    /// The handler reported a terminal error.
    Failed,
}

/// Per-job task: applies idempotency, feeds the handler, accounts EOF
/// tokens, and drains the final stage when the validator fires.
pub(crate) struct HandlerRuntime {
    controller_name: String,
    job_id: JobId,
    handler: Box<dyn Handler>,
    validator: Box<dyn EofValidator>,
    eof_counts: HashMap<TokenName, u32>,
    last_ids: IdempotencyStore,
    inbox: mpsc::Receiver<MessageFromQueue>,
    outbox: mpsc::Sender<MessageToSend>,
    mark: Arc<AtomicU32>,
    finish_tx: mpsc::Sender<JobId>,
}

impl HandlerRuntime {
    /// Spawns the runtime task and returns the controller's handle to it.
    pub fn spawn(
        controller_name: String,
        job_id: JobId,
        handler: Box<dyn Handler>,
        validator: Box<dyn EofValidator>,
        outbox: mpsc::Sender<MessageToSend>,
        finish_tx: mpsc::Sender<JobId>,
        inbox_capacity: usize,
    ) -> RuntimeHandle {
        let (tx, rx) = mpsc::channel(inbox_capacity);
        let mark = Arc::new(AtomicU32::new(0));

        let runtime = HandlerRuntime {
            controller_name,
            job_id,
            handler,
            validator,
            eof_counts: HashMap::new(),
            last_ids: IdempotencyStore::new(),
            inbox: rx,
            outbox,
            mark: Arc::clone(&mark),
            finish_tx,
        };
        tokio::spawn(runtime.run());

        RuntimeHandle {
            tx: Some(tx),
            mark,
        }
    }

    async fn run(mut self) {
        let outcome = self.ingest_loop().await;

        let delete = matches!(outcome, Outcome::Finished);
        if let Err(e) = self.handler.shutdown(delete).await {
            error!(
                "Handler shutdown failed for {} - {}: {}",
                self.controller_name, self.job_id, e
            );
        }
        debug!(
            "Runtime done for {} - {} (delete={})",
            self.controller_name, self.job_id, delete
        );

        // Registry removal; a send failure only means the controller is
        // already gone.
        let _ = self.finish_tx.send(self.job_id).await;
    }

    async fn ingest_loop(&mut self) -> Outcome {
        while let Some(MessageFromQueue { delivery, message }) = self.inbox.recv().await {
            self.mark.store(0, Ordering::SeqCst);

            if self.last_ids.is_duplicate(&message.idem_id) {
                debug!(
                    "Dropping duplicate {} for job {}",
                    message.idem_id, self.job_id
                );
                if let Err(e) = delivery.ack().await {
                    error!("Failed to ack duplicate: {}", e);
                }
                continue;
            }
            self.last_ids.update(&message.idem_id);

            let outcome = if message.is_eof() {
                self.ingest_control(delivery, &message).await
            } else {
                self.ingest_data(delivery, &message).await
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
        Outcome::Interrupted
    }

    /// Handles one EOF token; returns the final outcome once the validator
    /// fires.
    async fn ingest_control(
        &mut self,
        delivery: Box<dyn BrokerDelivery>,
        message: &TransportMessage,
    ) -> Option<Outcome> {
        let token = match EofToken::deserialize(&mut Deserializer::new(&message.payload)) {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    "Discarding undecodable EOF token for job {}: {}",
                    self.job_id, e
                );
                if let Err(e) = delivery.nack_discard().await {
                    error!("Failed to discard: {}", e);
                }
                return None;
            }
        };

        *self.eof_counts.entry(token.name).or_insert(0) += token.count;

        match self.validator.finish(&self.eof_counts) {
            Some(eof_message) => match self.drain(eof_message, delivery).await {
                Ok(()) => Some(Outcome::Finished),
                Err(e) => {
                    error!("Final stage failed for job {}: {}", self.job_id, e);
                    Some(Outcome::Failed)
                }
            },
            None => {
                if let Err(e) = delivery.ack().await {
                    error!("Failed to ack EOF token: {}", e);
                }
                None
            }
        }
    }

    /// Handles one data payload; returns an outcome only on terminal errors.
    async fn ingest_data(
        &mut self,
        delivery: Box<dyn BrokerDelivery>,
        message: &TransportMessage,
    ) -> Option<Outcome> {
        match self.handler.handle(&message.payload).await {
            Ok(Some(record)) => {
                let send = MessageToSend {
                    routing: Routing::Unicast {
                        key: record.partition_key(),
                    },
                    job_id: self.job_id,
                    kind: MessageKind::Data,
                    body: record.serialize(),
                    ack: Some(delivery),
                    callback: None,
                };
                if self.outbox.send(send).await.is_err() {
                    warn!("Outbox closed while job {} was active", self.job_id);
                    return Some(Outcome::Interrupted);
                }
                None
            }
            Ok(None) => {
                // Filtered out; nothing goes downstream.
                if let Err(e) = delivery.ack().await {
                    error!("Failed to ack filtered record: {}", e);
                }
                None
            }
            Err(e) => {
                error!(
                    "Handler error for {} - {}: {}",
                    self.controller_name, self.job_id, e
                );
                // Terminal for the job: abandon the record rather than
                // looping it through redelivery.
                if let Err(e) = delivery.nack_discard().await {
                    error!("Failed to discard poisoned record: {}", e);
                }
                Some(Outcome::Failed)
            }
        }
    }

    /// Streams the handler's final results downstream, then broadcasts the
    /// validator's EOF exactly once, carrying the control delivery so it is
    /// acknowledged only after the broadcast is published.
    async fn drain(
        &mut self,
        eof_message: EofToken,
        delivery: Box<dyn BrokerDelivery>,
    ) -> Result<(), HandlerError> {
        let (mut records, mut errors) = self.handler.next_stage();
        let mut errors_open = true;

        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => {
                        self.mark.store(0, Ordering::SeqCst);
                        let send = MessageToSend {
                            routing: Routing::Unicast { key: record.partition_key() },
                            job_id: self.job_id,
                            kind: MessageKind::Data,
                            body: record.serialize(),
                            ack: None,
                            callback: None,
                        };
                        if self.outbox.send(send).await.is_err() {
                            return Err(HandlerError::Failed(
                                "outbox closed during final stage".to_string(),
                            ));
                        }
                    }
                    None => break,
                },
                err = errors.recv(), if errors_open => match err {
                    Some(e) => return Err(e),
                    None => errors_open = false,
                },
            }
        }

        let send = MessageToSend {
            routing: Routing::Broadcast,
            job_id: self.job_id,
            kind: MessageKind::Control,
            body: eof_message.serialize(),
            ack: Some(delivery),
            callback: None,
        };
        self.outbox
            .send(send)
            .await
            .map_err(|_| HandlerError::Failed("outbox closed before EOF broadcast".to_string()))
    }
}
