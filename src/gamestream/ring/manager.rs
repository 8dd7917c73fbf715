use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant};

use super::{receive_frame, send_frame, RingError, RingMessage};

const HEALTHCHECK_PERIOD: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const MISS_THRESHOLD: u32 = 3;

/// Another node of the management ring.
#[derive(Debug, Clone)]
pub struct RingPeer {
    pub id: u32,
    pub addr: String,
}

/// One fleet-management node.
///
/// Peers form a unidirectional ring ordered by id. A node that suspects the
/// leader is gone sends `ELE|<own id>` to its successor; ids only grow while
/// an election circulates, so the highest id comes back to its owner, which
/// announces itself with `COO`. The leader then healthchecks every peer and
/// every worker's manager port.
pub struct RingManager {
    listener: TcpListener,
    node: Node,
    healthcheck_period: Duration,
}

impl RingManager {
    /// Builds a node from an already-bound listener. `peers` may include the
    /// node itself; it is filtered out and the rest ordered by id.
    pub fn new(id: u32, listener: TcpListener, peers: Vec<RingPeer>, workers: Vec<String>) -> Self {
        let mut ring: Vec<RingPeer> = peers.into_iter().filter(|p| p.id != id).collect();
        ring.sort_by_key(|p| p.id);

        let (leader_tx, _) = watch::channel(None);
        RingManager {
            listener,
            node: Node {
                id,
                ring,
                workers,
                leader_tx,
                participating: false,
                last_leader_contact: Instant::now(),
                worker_conns: HashMap::new(),
                worker_misses: HashMap::new(),
                reply_timeout: REPLY_TIMEOUT,
                miss_threshold: MISS_THRESHOLD,
            },
            healthcheck_period: HEALTHCHECK_PERIOD,
        }
    }

    /// Binds `addr` and builds the node.
    pub async fn bind(
        id: u32,
        addr: &str,
        peers: Vec<RingPeer>,
        workers: Vec<String>,
    ) -> Result<Self, RingError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RingManager::new(id, listener, peers, workers))
    }

    /// Overrides the default healthcheck timing.
    pub fn with_timing(mut self, period: Duration, reply_timeout: Duration, misses: u32) -> Self {
        self.healthcheck_period = period;
        self.node.reply_timeout = reply_timeout;
        self.node.miss_threshold = misses;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Observes the currently-known leader id.
    pub fn leader_watch(&self) -> watch::Receiver<Option<u32>> {
        self.node.leader_tx.subscribe()
    }

    /// Runs the node until `shutdown` resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> Result<(), RingError> {
        let RingManager {
            listener,
            mut node,
            healthcheck_period,
        } = self;

        // First tick after one full period: gives the fleet a moment to come
        // up before anyone cries election.
        let mut ticker = interval_at(
            Instant::now() + healthcheck_period,
            healthcheck_period,
        );
        node.last_leader_contact = Instant::now();

        tokio::pin!(shutdown);
        info!("Ring node {} up", node.id);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => node.serve_connection(stream).await,
                    Err(e) => {
                        error!("Ring node {} accept failed: {}", node.id, e);
                        return Err(RingError::Io(e));
                    }
                },

                _ = ticker.tick() => {
                    if node.is_leader() {
                        node.leader_sweep().await;
                    } else {
                        node.detect(healthcheck_period).await;
                    }
                }
            }
        }

        debug!("Ring node {} shutting down", node.id);
        Ok(())
    }
}

struct Node {
    id: u32,
    /// Every other node, ordered by id.
    ring: Vec<RingPeer>,
    /// Worker manager ports the leader healthchecks.
    workers: Vec<String>,
    leader_tx: watch::Sender<Option<u32>>,
    participating: bool,
    last_leader_contact: Instant,
    worker_conns: HashMap<String, TcpStream>,
    worker_misses: HashMap<String, u32>,
    reply_timeout: Duration,
    miss_threshold: u32,
}

impl Node {
    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow() == Some(self.id)
    }

    fn set_leader(&mut self, id: u32) {
        self.participating = false;
        self.last_leader_contact = Instant::now();
        self.leader_tx.send_replace(Some(id));
    }

    /// Ring successors of this node: peers with greater id first, wrapping
    /// around to the smallest. A dead successor is skipped by trying the
    /// next one.
    fn successors(&self) -> impl Iterator<Item = &RingPeer> {
        let split = self.ring.iter().position(|p| p.id > self.id);
        let (before, after) = match split {
            Some(i) => self.ring.split_at(i),
            None => self.ring.split_at(self.ring.len()),
        };
        after.iter().chain(before.iter())
    }

    /// Serves one inbound connection until it goes idle or closes.
    async fn serve_connection(&mut self, mut stream: TcpStream) {
        loop {
            let message = match timeout(self.reply_timeout, receive_frame(&mut stream)).await {
                Ok(Ok(message)) => message,
                Ok(Err(RingError::Io(_))) => return,
                Ok(Err(e)) => {
                    warn!("Ring node {} received garbage: {}", self.id, e);
                    return;
                }
                Err(_) => return, // idle
            };

            match message {
                RingMessage::Election(candidate) => self.on_election(candidate).await,
                RingMessage::Coordinator(elected) => {
                    self.on_coordinator(elected).await;
                    return;
                }
                RingMessage::HealthCheck => {
                    self.last_leader_contact = Instant::now();
                    if send_frame(&mut stream, &RingMessage::Alive).await.is_err() {
                        return;
                    }
                }
                RingMessage::Alive => {
                    // Replies only make sense on connections we initiated.
                    debug!("Ring node {} ignoring stray ALV", self.id);
                }
            }
        }
    }

    async fn on_election(&mut self, candidate: u32) {
        if candidate == self.id {
            // Our id survived the whole circle: elected.
            info!("Node {} elected coordinator", self.id);
            self.set_leader(self.id);
            self.forward(&RingMessage::Coordinator(self.id)).await;
        } else if candidate > self.id {
            self.participating = true;
            self.forward(&RingMessage::Election(candidate)).await;
        } else if !self.participating {
            self.participating = true;
            self.forward(&RingMessage::Election(self.id)).await;
        }
        // A smaller candidate while already participating is swallowed.
    }

    async fn on_coordinator(&mut self, elected: u32) {
        if elected == self.id {
            // Announcement completed the circle.
            return;
        }
        info!("Node {} accepts {} as coordinator", self.id, elected);
        self.set_leader(elected);
        self.forward(&RingMessage::Coordinator(elected)).await;
    }

    /// Sends one message to the first reachable successor. Returns whether
    /// anyone took it.
    async fn forward(&mut self, message: &RingMessage) -> bool {
        for peer in self.successors() {
            match timeout(self.reply_timeout, TcpStream::connect(&peer.addr)).await {
                Ok(Ok(mut stream)) => {
                    if send_frame(&mut stream, message).await.is_ok() {
                        return true;
                    }
                    warn!(
                        "Ring node {} failed sending {} to node {}",
                        self.id, message, peer.id
                    );
                }
                _ => {
                    debug!(
                        "Ring node {} skipping unreachable successor {}",
                        self.id, peer.id
                    );
                }
            }
        }
        false
    }

    /// Suspected-leader-loss path for non-leaders.
    async fn detect(&mut self, period: Duration) {
        let known = *self.leader_tx.borrow();
        let silence = self.last_leader_contact.elapsed();
        let limit = period * self.miss_threshold;

        let suspect = match known {
            None => true,
            Some(id) if id == self.id => false,
            Some(_) => silence > limit,
        };
        if !suspect {
            return;
        }

        if known.is_some() {
            warn!(
                "Node {} lost contact with leader for {:?}; starting election",
                self.id, silence
            );
        } else {
            info!("Node {} has no leader; starting election", self.id);
        }

        self.participating = true;
        if !self.forward(&RingMessage::Election(self.id)).await {
            // Nobody else is reachable: a ring of one leads itself.
            info!("Node {} found no reachable peers; assuming leadership", self.id);
            self.set_leader(self.id);
        }
    }

    /// Leader duties: healthcheck every peer and every worker.
    async fn leader_sweep(&mut self) {
        for peer in self.ring.clone() {
            if !self.ping_peer(&peer).await {
                warn!("Leader {}: peer {} missed healthcheck", self.id, peer.id);
            }
        }

        for addr in self.workers.clone() {
            let alive = self.ping_worker(&addr).await;
            let misses = self.worker_misses.entry(addr.clone()).or_insert(0);
            if alive {
                *misses = 0;
            } else {
                *misses += 1;
                if *misses >= self.miss_threshold {
                    error!(
                        "Leader {}: worker {} missed {} healthchecks, declaring dead",
                        self.id, addr, misses
                    );
                    *misses = 0;
                }
            }
        }
    }

    /// One-shot healthcheck of a ring peer.
    async fn ping_peer(&self, peer: &RingPeer) -> bool {
        let connect = timeout(self.reply_timeout, TcpStream::connect(&peer.addr)).await;
        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            _ => return false,
        };
        if send_frame(&mut stream, &RingMessage::HealthCheck).await.is_err() {
            return false;
        }
        matches!(
            timeout(self.reply_timeout, receive_frame(&mut stream)).await,
            Ok(Ok(RingMessage::Alive))
        )
    }

    /// Healthcheck over the persistent connection to one worker's manager
    /// port, reconnecting if needed.
    async fn ping_worker(&mut self, addr: &str) -> bool {
        let reply_timeout = self.reply_timeout;
        let stream = match self.worker_conns.entry(addr.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                match timeout(reply_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => slot.insert(stream),
                    _ => return false,
                }
            }
        };
        if send_frame(stream, &RingMessage::HealthCheck).await.is_err() {
            self.worker_conns.remove(addr);
            return false;
        }
        match timeout(reply_timeout, receive_frame(stream)).await {
            Ok(Ok(RingMessage::Alive)) => true,
            _ => {
                self.worker_conns.remove(addr);
                false
            }
        }
    }
}
