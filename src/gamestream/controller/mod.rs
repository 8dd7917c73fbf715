//! Worker controller: multi-queue dispatch into per-job handler runtimes
//!
//! One controller owns a stage's input queues and output exchanges. A
//! dispatcher event loop unmarshals deliveries and routes them into per-job
//! runtimes (created lazily, reaped when idle); a forwarder task publishes
//! everything the runtimes emit, stamping the controller's origin and a
//! monotonic sequence so downstream stages can deduplicate; a manager
//! listener answers the fleet ring's healthchecks.

mod handler;
mod runtime;

pub use handler::{Handler, HandlerError, HandlerFactory};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::gamestream::broker::{BrokerDelivery, BrokerError, BrokerExchange, BrokerQueue};
use crate::gamestream::protocol::{JobId, Protocol};
use crate::gamestream::ring::{receive_frame, send_frame, RingMessage};
use crate::gamestream::server::shutdown_signal;
use crate::gamestream::state::IdempotencyId;

use runtime::{
    HandlerRuntime, MessageFromQueue, MessageToSend, Routing, RuntimeHandle, REAPER_MARK_LIMIT,
};

/// Bound for the outbox, finish, merged-input, and runtime inbox channels.
const CHANNEL_CAPACITY: usize = 50;

const REAPER_PERIOD: Duration = Duration::from_secs(30);
const MANAGER_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ControllerError {
    Broker(BrokerError),
    Io(std::io::Error),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Broker(e) => write!(f, "controller broker failure: {}", e),
            ControllerError::Io(e) => write!(f, "controller I/O failure: {}", e),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::Broker(e) => Some(e),
            ControllerError::Io(e) => Some(e),
        }
    }
}

impl From<BrokerError> for ControllerError {
    fn from(e: BrokerError) -> Self {
        ControllerError::Broker(e)
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Io(e)
    }
}

/// One worker stage.
pub struct Controller {
    name: String,
    inputs: Vec<Arc<dyn BrokerQueue>>,
    outputs: Vec<Arc<dyn BrokerExchange>>,
    protocol: Arc<dyn Protocol>,
    factory: HandlerFactory,
    listener: TcpListener,
    reaper_period: Duration,
}

impl Controller {
    /// Creates the controller and binds its manager listener on
    /// `manager_port`. The name must be stable across restarts: it is the
    /// origin every downstream consumer deduplicates against.
    pub async fn new(
        name: impl Into<String>,
        inputs: Vec<Arc<dyn BrokerQueue>>,
        outputs: Vec<Arc<dyn BrokerExchange>>,
        protocol: Arc<dyn Protocol>,
        factory: HandlerFactory,
        manager_port: &str,
    ) -> Result<Self, ControllerError> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", manager_port)).await?;
        info!("Worker listening on port {}", manager_port);

        Ok(Controller {
            name: name.into(),
            inputs,
            outputs,
            protocol,
            factory,
            listener,
            reaper_period: REAPER_PERIOD,
        })
    }

    /// Address of the manager listener.
    pub fn manager_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Overrides the 30 s inactivity sweep interval.
    pub fn with_reaper_period(mut self, period: Duration) -> Self {
        self.reaper_period = period;
        self
    }

    /// Runs until SIGTERM/SIGINT.
    pub async fn run(self) -> Result<(), ControllerError> {
        self.run_with_shutdown(async {
            shutdown_signal().await;
        })
        .await
    }

    /// Runs until `shutdown` resolves, then drains cooperatively: runtimes
    /// finish, the forwarder publishes everything pending, and the manager
    /// listener closes.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ControllerError> {
        let Controller {
            name,
            inputs,
            outputs,
            protocol,
            factory,
            listener,
            reaper_period,
        } = self;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let manager_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            shutdown.await;
            let _ = shutdown_tx.send(());
        });

        let (outbox_tx, outbox_rx) = mpsc::channel::<MessageToSend>(CHANNEL_CAPACITY);
        let (finish_tx, mut finish_rx) = mpsc::channel::<JobId>(CHANNEL_CAPACITY);

        let forwarder = tokio::spawn(forward_task(
            outbox_rx,
            outputs,
            Arc::clone(&protocol),
            name.clone(),
        ));
        let manager = tokio::spawn(manager_listener_task(
            listener,
            manager_shutdown,
            name.clone(),
        ));

        // One pump per input queue into a merged channel; order within a
        // queue is preserved, cross-queue order is not promised.
        let (merged_tx, mut merged_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut pumps = Vec::with_capacity(inputs.len());
        for queue in &inputs {
            let mut deliveries = queue.consume().await?;
            let tx = merged_tx.clone();
            let queue_name = queue.name().to_string();
            pumps.push(tokio::spawn(async move {
                while let Some(delivery) = deliveries.recv().await {
                    if tx.send((queue_name.clone(), delivery)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(merged_tx);

        let mut registry: HashMap<JobId, RuntimeHandle> = HashMap::new();
        let mut reaper = tokio::time::interval_at(Instant::now() + reaper_period, reaper_period);
        let mut shutting_down = false;
        let mut inputs_open = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv(), if !shutting_down => {
                    debug!("Received shutdown signal in controller");
                    shutting_down = true;
                    close_all(&mut registry);
                    if registry.is_empty() {
                        break;
                    }
                }

                incoming = merged_rx.recv(), if inputs_open && !shutting_down => match incoming {
                    Some((queue_name, delivery)) => {
                        dispatch(
                            &name,
                            &queue_name,
                            delivery,
                            protocol.as_ref(),
                            &factory,
                            &mut registry,
                            &outbox_tx,
                            &finish_tx,
                        )
                        .await;
                    }
                    None => {
                        // All queues are needed; one closing ends the stage.
                        info!("Input queues closed, exiting main loop");
                        inputs_open = false;
                        shutting_down = true;
                        close_all(&mut registry);
                        if registry.is_empty() {
                            break;
                        }
                    }
                },

                finished = finish_rx.recv() => if let Some(job_id) = finished {
                    debug!("Action: Removing Handler from List {} - {}", name, job_id);
                    registry.remove(&job_id);
                    if shutting_down && registry.is_empty() {
                        break;
                    }
                },

                _ = reaper.tick(), if !shutting_down => {
                    for (job_id, handle) in registry.iter_mut() {
                        let mark = handle.mark.fetch_add(1, Ordering::SeqCst) + 1;
                        if mark >= REAPER_MARK_LIMIT && handle.tx.is_some() {
                            info!("Action: Closing inactive handler {} - {}", name, job_id);
                            handle.tx = None;
                        }
                    }
                }
            }
        }

        // Every runtime has signalled finish; closing the outbox ends the
        // forwarder once it has drained.
        drop(outbox_tx);
        drop(finish_rx);
        for pump in &pumps {
            pump.abort();
        }

        let forward_result = forwarder
            .await
            .unwrap_or_else(|e| Err(BrokerError::Transport(e.to_string())));
        let _ = manager.await;

        debug!("Finalized main loop for controller {}", name);
        forward_result.map_err(ControllerError::Broker)
    }
}

fn close_all(registry: &mut HashMap<JobId, RuntimeHandle>) {
    for handle in registry.values_mut() {
        handle.tx = None;
    }
}

/// Routes one delivery into its job's runtime, creating the runtime on first
/// sight of the job.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    controller_name: &str,
    queue_name: &str,
    delivery: Box<dyn BrokerDelivery>,
    protocol: &dyn Protocol,
    factory: &HandlerFactory,
    registry: &mut HashMap<JobId, RuntimeHandle>,
    outbox_tx: &mpsc::Sender<MessageToSend>,
    finish_tx: &mpsc::Sender<JobId>,
) {
    let message = match protocol.unmarshal(delivery.body()) {
        Ok(message) => message,
        Err(e) => {
            error!("Error while parsing the Queue {} message: {}", queue_name, e);
            if let Err(e) = delivery.nack_requeue().await {
                error!("Failed to requeue malformed delivery: {}", e);
            }
            return;
        }
    };

    let job_id = message.job_id;
    let handle = match registry.entry(job_id) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(slot) => match factory(job_id) {
            Ok((handler, validator)) => slot.insert(HandlerRuntime::spawn(
                controller_name.to_string(),
                job_id,
                handler,
                validator,
                outbox_tx.clone(),
                finish_tx.clone(),
                CHANNEL_CAPACITY,
            )),
            Err(e) => {
                error!(
                    "Error while getting a handler for Queue {}, JobID: {} Error: {}",
                    queue_name, job_id, e
                );
                if let Err(e) = delivery.nack_requeue().await {
                    error!("Failed to requeue delivery: {}", e);
                }
                return;
            }
        },
    };

    match &handle.tx {
        Some(tx) => {
            if let Err(returned) = tx.send(MessageFromQueue { delivery, message }).await {
                // The runtime ended on its own (terminal handler error); the
                // broker will redeliver to a fresh one.
                let MessageFromQueue { delivery, .. } = returned.0;
                if let Err(e) = delivery.nack_requeue().await {
                    error!("Failed to requeue delivery: {}", e);
                }
            }
        }
        None => {
            // Inbox already closed by the reaper; redelivery recreates the
            // runtime once this entry is gone.
            if let Err(e) = delivery.nack_requeue().await {
                error!("Failed to requeue delivery: {}", e);
            }
        }
    }
}

/// Drains the shared outbox: marshals with the controller origin and a
/// monotonic sequence, publishes to every output exchange, then acks the
/// deferred delivery. Publish failures are fatal: the broker is mandatory.
async fn forward_task(
    mut outbox_rx: mpsc::Receiver<MessageToSend>,
    outputs: Vec<Arc<dyn BrokerExchange>>,
    protocol: Arc<dyn Protocol>,
    origin: String,
) -> Result<(), BrokerError> {
    let mut sequence: u32 = 0;

    while let Some(send) = outbox_rx.recv().await {
        sequence += 1;
        let idem_id = IdempotencyId::new(origin.clone(), sequence);
        let raw = protocol.marshal(send.job_id, &idem_id, send.kind, &send.body);

        let routing_keys = match &send.routing {
            Routing::Unicast { key } => vec![protocol.route(key)],
            Routing::Broadcast => protocol.broadcast(),
        };

        for key in &routing_keys {
            for exchange in &outputs {
                exchange.publish(key, &raw).await?;
            }
        }

        if let Some(delivery) = send.ack {
            delivery.ack().await?;
        }
        if let Some(callback) = send.callback {
            callback();
        }
    }

    debug!("Sent all pending messages");
    Ok(())
}

/// Accepts one manager connection at a time and answers its healthchecks.
async fn manager_listener_task(
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
    controller_name: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Manager connected to {} from {}", controller_name, peer);
                    if serve_manager(stream, &mut shutdown, &controller_name).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Action: Accept connection | Result: Error | Error: {}", e);
                    break;
                }
            }
        }
    }
    debug!(
        "Finish listening for manager messages for controller {}",
        controller_name
    );
}

/// Serves one manager connection until it errors or shutdown is requested.
/// Returns true when the listener should stop entirely.
async fn serve_manager(
    mut stream: TcpStream,
    shutdown: &mut broadcast::Receiver<()>,
    controller_name: &str,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return true,
            received = receive_frame(&mut stream) => match received {
                Ok(message) if message.is_health_check() => {
                    if let Err(e) = send_frame(&mut stream, &RingMessage::Alive).await {
                        error!(
                            "Error sending ALV to manager for controller {}: {}",
                            controller_name, e
                        );
                        tokio::time::sleep(MANAGER_BACKOFF).await;
                        return false;
                    }
                }
                Ok(message) => {
                    error!(
                        "Expecting HealthCheck message from manager but received {}",
                        message
                    );
                }
                Err(e) => {
                    error!(
                        "Error receiving manager messages for controller {}: {}",
                        controller_name, e
                    );
                    tokio::time::sleep(MANAGER_BACKOFF).await;
                    return false;
                }
            }
        }
    }
}
