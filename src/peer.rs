//! # Peer Node
//!
//! The peer-side node: one actor owns the neighbor table, message log,
//! liveness trackers, and in-flight corroboration rounds; everything else
//! feeds it commands. Connection readers, the two periodic timers (gossip
//! origination, neighbor pings), corroboration probes, and the bootstrap
//! sequence all serialize through the actor, which is how the shared-state
//! rules of the protocol are kept without a single lock in sight.
//!
//! ## Startup phases
//!
//! 1. Bind the listener (inbound acceptance runs from here on).
//! 2. Register with a random majority of seeds; union the `PEER_LIST`s.
//!    No answer → back off with doubling delay and retry.
//! 3. Degree-probe the union, then draw up to the outbound cap by
//!    preferential attachment and open the long-lived neighbor links.
//!
//! ## Frame flow on a neighbor link
//!
//! `GOSSIP` floods with dedup, `PING`/`PONG` drive the failure detector,
//! `DEG_QUERY`/`DEG_REPLY` refresh degree hints, and `DEAD_NODE` doubles as
//! corroboration query and confirmation (see `liveness`).

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::codec::Frame;
use crate::config::SeedDirectory;
use crate::eventlog::{unix_now, EventLog};
use crate::gossip::{
    payload_for, MessageLog, Originator, GOSSIP_INTERVAL, MAX_ORIGINATED, MESSAGE_LOG_CAP,
};
use crate::identity::NodeId;
use crate::liveness::{
    CorroborationRound, Health, Verdict, CORROBORATION_WINDOW, MISSED_PING_LIMIT, PING_INTERVAL,
    TEST_PING_TIMEOUT,
};
use crate::topology::{select_attachments, union_peer_lists, Direction, NeighborTable, ATTACH_CAP};
use crate::transport::{
    self, read_frame, write_frame, Link, LinkEvent, CONNECT_TIMEOUT, REQUEST_TIMEOUT,
};

/// Tunables a peer runs with. Defaults are the reference deployment values;
/// tests shorten the timers.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Directory the event file is written into.
    pub log_dir: PathBuf,
    pub gossip_interval: Duration,
    pub max_originated: u64,
    pub ping_interval: Duration,
    pub missed_ping_limit: u32,
    pub corroboration_window: Duration,
    pub test_ping_timeout: Duration,
    pub attach_cap: usize,
    pub message_log_cap: usize,
    /// Deadline for one registration exchange (covers consensus latency).
    pub register_timeout: Duration,
    pub register_attempts: u32,
    /// Initial retry delay after a fully unanswered registration round.
    pub register_backoff: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            gossip_interval: GOSSIP_INTERVAL,
            max_originated: MAX_ORIGINATED,
            ping_interval: PING_INTERVAL,
            missed_ping_limit: MISSED_PING_LIMIT,
            corroboration_window: CORROBORATION_WINDOW,
            test_ping_timeout: TEST_PING_TIMEOUT,
            attach_cap: ATTACH_CAP,
            message_log_cap: MESSAGE_LOG_CAP,
            register_timeout: Duration::from_secs(10),
            register_attempts: 3,
            register_backoff: Duration::from_secs(1),
            probe_timeout: REQUEST_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Point-in-time view of a peer's state, for telemetry and tests.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub id: NodeId,
    pub neighbors: Vec<(NodeId, Direction)>,
    pub outbound: usize,
    pub messages_seen: usize,
    pub originated: u64,
    pub dead: Vec<NodeId>,
    pub registered: bool,
}

enum PeerCommand {
    Link(LinkEvent),
    InboundAttach {
        peer: NodeId,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
    OutboundAttach {
        peer: NodeId,
        degree_hint: u32,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
    Degree {
        reply: oneshot::Sender<u32>,
    },
    ShortGossip {
        frame: Frame,
    },
    /// Our test ping on behalf of `requester`'s suspicion finished.
    Corroborated {
        requester: NodeId,
        target: NodeId,
        query_ts: u64,
        alive: bool,
    },
    CorroborationDeadline {
        target: NodeId,
        nonce: u64,
    },
    /// Reopening the link to a corroborated-alive neighbor did not work.
    ReattachFailed {
        peer: NodeId,
    },
    Registered {
        success: bool,
    },
    Snapshot {
        reply: oneshot::Sender<PeerSnapshot>,
    },
    Quit,
}

/// Handle to a running peer.
pub struct PeerNode {
    id: NodeId,
    cmd_tx: mpsc::Sender<PeerCommand>,
    accept_loop: JoinHandle<()>,
}

impl PeerNode {
    pub async fn start(
        directory: SeedDirectory,
        bind_ip: IpAddr,
        listen_port: u16,
    ) -> Result<Self> {
        Self::start_with_config(directory, bind_ip, listen_port, PeerConfig::default()).await
    }

    pub async fn start_with_config(
        directory: SeedDirectory,
        bind_ip: IpAddr,
        listen_port: u16,
        config: PeerConfig,
    ) -> Result<Self> {
        let id = NodeId::new(bind_ip, listen_port);

        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .with_context(|| format!("binding peer listener on port {listen_port}"))?;

        let eventlog = Arc::new(
            EventLog::for_peer(&config.log_dir, listen_port)
                .context("opening peer event file")?,
        );
        eventlog.record("LISTENING", &id.to_string());
        info!(peer = %id, "peer listening");

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);

        // Link readers speak LinkEvent; forward them into the command stream.
        let (link_tx, mut link_rx) = mpsc::channel::<LinkEvent>(1024);
        {
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = link_rx.recv().await {
                    if cmd_tx.send(PeerCommand::Link(event)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let actor = PeerActor::new(
            id,
            directory.clone(),
            config.clone(),
            eventlog.clone(),
            cmd_tx.clone(),
            link_tx,
        );
        tokio::spawn(actor.run(cmd_rx));

        let accept_loop = {
            let cmd_tx = cmd_tx.clone();
            let cfg = config.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            trace!(%remote, "peer accepted connection");
                            let cmd_tx = cmd_tx.clone();
                            let cfg = cfg.clone();
                            tokio::spawn(async move {
                                handle_inbound(stream, id, cmd_tx, cfg).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "peer accept failed");
                        }
                    }
                }
            })
        };

        bootstrap(id, &directory, &config, &cmd_tx, &eventlog).await;

        Ok(Self {
            id,
            cmd_tx,
            accept_loop,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub async fn degree(&self) -> u32 {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PeerCommand::Degree { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Option<PeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Snapshot { reply: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop accepting first, then the actor; dropping the actor drops every
    /// link and aborts its reader/writer tasks.
    pub async fn shutdown(&self) {
        self.accept_loop.abort();
        let _ = self.cmd_tx.send(PeerCommand::Quit).await;
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Registration, degree probing, and preferential attachment. Failures are
/// never fatal: a peer that finds nobody runs with zero neighbors until
/// inbound attachments arrive.
async fn bootstrap(
    id: NodeId,
    directory: &SeedDirectory,
    config: &PeerConfig,
    cmd_tx: &mpsc::Sender<PeerCommand>,
    eventlog: &Arc<EventLog>,
) {
    // Phase 1: register with a random majority subset of the seeds.
    let mut lists: Vec<Vec<NodeId>> = Vec::new();
    let mut backoff = config.register_backoff;
    for attempt in 1..=config.register_attempts {
        let mut contacted = directory.seeds().to_vec();
        contacted.shuffle(&mut thread_rng());
        contacted.truncate(directory.majority());

        let mut handles = Vec::new();
        for seed in contacted {
            let deadline = config.register_timeout;
            handles.push(tokio::spawn(async move {
                transport::request(seed.socket_addr(), &Frame::Register { peer: id }, deadline)
                    .await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(Frame::PeerList { peers })) => lists.push(peers),
                Ok(Ok(other)) => {
                    warn!(kind = other.kind(), "unexpected registration reply");
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "seed did not answer registration");
                }
                Err(_) => {}
            }
        }
        if !lists.is_empty() {
            break;
        }
        warn!(attempt, delay = ?backoff, "no seed confirmed registration, backing off");
        sleep(backoff).await;
        backoff *= 2;
    }

    let registered = !lists.is_empty();
    let _ = cmd_tx
        .send(PeerCommand::Registered {
            success: registered,
        })
        .await;
    if registered {
        eventlog.record("REGISTERED", &format!("{} list(s)", lists.len()));
    } else {
        warn!(peer = %id, "registration failed, continuing unregistered");
    }

    let union = union_peer_lists(lists, id);
    if union.is_empty() {
        debug!(peer = %id, "no candidates, waiting for inbound attachments");
        return;
    }

    // Phase 2: degree probe. Unreachable candidates drop out of this round.
    let mut handles = Vec::new();
    for candidate in union {
        let deadline = config.probe_timeout;
        handles.push(tokio::spawn(async move {
            let reply =
                transport::request(candidate.socket_addr(), &Frame::DegQuery, deadline).await;
            (candidate, reply)
        }));
    }
    let mut candidates: Vec<(NodeId, u32)> = Vec::new();
    for handle in handles {
        if let Ok((candidate, reply)) = handle.await {
            match reply {
                Ok(Frame::DegReply { degree }) => candidates.push((candidate, degree)),
                Ok(other) => {
                    warn!(%candidate, kind = other.kind(), "unexpected degree reply");
                }
                Err(e) => {
                    debug!(%candidate, error = %e, "candidate unreachable, excluded");
                }
            }
        }
    }

    // Phase 3: weighted draw, weight degree + 1, without replacement.
    let picked = select_attachments(&candidates, config.attach_cap, &mut thread_rng());
    let picked_line = picked
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    eventlog.record("NEIGHBORS", &picked_line);
    info!(peer = %id, selected = %picked_line, "preferential attachment selection");

    // Phase 4: open the long-lived links.
    for target in picked {
        match attach_outbound(id, target, config.connect_timeout).await {
            Ok((degree_hint, reader, writer)) => {
                let _ = cmd_tx
                    .send(PeerCommand::OutboundAttach {
                        peer: target,
                        degree_hint,
                        reader,
                        writer,
                    })
                    .await;
            }
            Err(e) => {
                warn!(%target, error = %e, "attach failed");
            }
        }
    }
}

/// Open a neighbor connection: send `CONNECT`, wait for the `DEG_REPLY`
/// acknowledgement, hand the stream halves back for link registration.
async fn attach_outbound(
    id: NodeId,
    target: NodeId,
    deadline: Duration,
) -> Result<(u32, BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let exchange = async {
        let stream = TcpStream::connect(target.socket_addr())
            .await
            .with_context(|| format!("connect to {target}"))?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, &Frame::Connect { peer: id })
            .await
            .context("send CONNECT")?;
        let mut reader = BufReader::new(read_half);
        match read_frame(&mut reader).await.context("read CONNECT ack")? {
            Some(Frame::DegReply { degree }) => Ok((degree, reader, write_half)),
            Some(other) => bail!("unexpected CONNECT ack {}", other.kind()),
            None => bail!("{target} closed during attach"),
        }
    };
    timeout(deadline, exchange)
        .await
        .with_context(|| format!("attach to {target} timed out"))?
}

/// Short test ping used by corroboration: fresh connection, one exchange.
async fn test_ping(target: NodeId, deadline: Duration) -> bool {
    let nonce: u64 = rand::random();
    matches!(
        transport::request(target.socket_addr(), &Frame::Ping { nonce }, deadline).await,
        Ok(Frame::Pong { nonce: echoed }) if echoed == nonce
    )
}

/// One inbound connection: classify by first frame. Probes and test pings
/// are answered in place; `CONNECT` promotes the stream to a neighbor link.
async fn handle_inbound(
    stream: TcpStream,
    id: NodeId,
    cmd_tx: mpsc::Sender<PeerCommand>,
    cfg: PeerConfig,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let frame = match timeout(cfg.probe_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return,
    };

    match frame {
        Frame::DegQuery => {
            let (tx, rx) = oneshot::channel();
            if cmd_tx
                .send(PeerCommand::Degree { reply: tx })
                .await
                .is_err()
            {
                return;
            }
            if let Ok(degree) = rx.await {
                let _ = write_frame(&mut write_half, &Frame::DegReply { degree }).await;
            }
        }
        Frame::Connect { peer } => {
            let _ = cmd_tx
                .send(PeerCommand::InboundAttach {
                    peer,
                    reader,
                    writer: write_half,
                })
                .await;
        }
        Frame::Ping { nonce } => {
            let _ = write_frame(&mut write_half, &Frame::Pong { nonce }).await;
        }
        Frame::Gossip { .. } => {
            let _ = cmd_tx.send(PeerCommand::ShortGossip { frame }).await;
        }
        Frame::DeadNode {
            dead, timestamp, ..
        } => {
            // Suspicion query outside a link: probe and answer right here.
            let reply = if test_ping(dead, cfg.test_ping_timeout).await {
                Frame::Pong { nonce: timestamp }
            } else {
                Frame::DeadNode {
                    dead,
                    reporter: id,
                    timestamp: unix_now(),
                }
            };
            let _ = write_frame(&mut write_half, &reply).await;
        }
        other => {
            warn!(kind = other.kind(), "dropping frame a peer does not handle");
        }
    }
}

// ============================================================================
// Peer actor
// ============================================================================

enum Flow {
    Continue,
    Quit,
}

struct PeerActor {
    id: NodeId,
    directory: SeedDirectory,
    config: PeerConfig,
    eventlog: Arc<EventLog>,
    cmd_tx: mpsc::Sender<PeerCommand>,
    link_tx: mpsc::Sender<LinkEvent>,
    neighbors: NeighborTable,
    links: HashMap<NodeId, Link>,
    log: MessageLog,
    origin: Originator,
    rounds: HashMap<NodeId, CorroborationRound>,
    /// Neighbors with a reopen attempt in flight; the detector leaves them
    /// alone until the attempt resolves.
    reconnecting: BTreeSet<NodeId>,
    dead: BTreeSet<NodeId>,
    registered: bool,
}

impl PeerActor {
    fn new(
        id: NodeId,
        directory: SeedDirectory,
        config: PeerConfig,
        eventlog: Arc<EventLog>,
        cmd_tx: mpsc::Sender<PeerCommand>,
        link_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let log = MessageLog::new(config.message_log_cap);
        let origin = Originator::new(config.max_originated);
        Self {
            id,
            directory,
            config,
            eventlog,
            cmd_tx,
            link_tx,
            neighbors: NeighborTable::new(),
            links: HashMap::new(),
            log,
            origin,
            rounds: HashMap::new(),
            reconnecting: BTreeSet::new(),
            dead: BTreeSet::new(),
            registered: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PeerCommand>) {
        // Both timers start one full period out, matching the reference
        // behavior of quiet startup.
        let start = Instant::now();
        let mut gossip_timer = interval_at(start + self.config.gossip_interval, self.config.gossip_interval);
        let mut ping_timer = interval_at(start + self.config.ping_interval, self.config.ping_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Flow::Quit = self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = gossip_timer.tick() => {
                    self.originate();
                }
                _ = ping_timer.tick() => {
                    self.ping_round();
                }
            }
        }
        debug!(peer = %self.id, "peer actor quitting");
    }

    fn handle_command(&mut self, cmd: PeerCommand) -> Flow {
        match cmd {
            PeerCommand::Link(LinkEvent::Frame(from, frame)) => {
                self.handle_link_frame(from, frame);
            }
            PeerCommand::Link(LinkEvent::Closed(peer)) => {
                self.handle_link_closed(peer);
            }
            PeerCommand::InboundAttach {
                peer,
                reader,
                writer,
            } => {
                self.attach(peer, Direction::Inbound, 0, reader, writer);
            }
            PeerCommand::OutboundAttach {
                peer,
                degree_hint,
                reader,
                writer,
            } => {
                self.attach(peer, Direction::Outbound, degree_hint, reader, writer);
            }
            PeerCommand::Degree { reply } => {
                let _ = reply.send(self.neighbors.degree() as u32);
            }
            PeerCommand::ShortGossip { frame } => {
                if let Frame::Gossip {
                    originator,
                    seq_no,
                    timestamp,
                    payload,
                } = frame
                {
                    self.receive_gossip(None, originator, seq_no, timestamp, payload);
                }
            }
            PeerCommand::Corroborated {
                requester,
                target,
                query_ts,
                alive,
            } => {
                let reply = if alive {
                    Frame::Pong { nonce: query_ts }
                } else {
                    Frame::DeadNode {
                        dead: target,
                        reporter: self.id,
                        timestamp: unix_now(),
                    }
                };
                if let Some(link) = self.links.get(&requester) {
                    link.enqueue(reply);
                }
            }
            PeerCommand::CorroborationDeadline { target, nonce } => {
                let expired = self
                    .rounds
                    .get(&target)
                    .map(|round| round.nonce() == nonce)
                    .unwrap_or(false);
                if expired {
                    let verdict = self.rounds[&target].expire();
                    self.resolve_verdict(target, verdict);
                }
            }
            PeerCommand::ReattachFailed { peer } => {
                self.reconnecting.remove(&peer);
                // The neighbor answers its other neighbors but not us:
                // close out our side and let the seeds arbitrate through
                // the remove quorum.
                if !self.links.contains_key(&peer) && self.neighbors.contains(&peer) {
                    warn!(%peer, "could not reopen link, condemning");
                    self.condemn(peer);
                }
            }
            PeerCommand::Registered { success } => {
                self.registered = success;
            }
            PeerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PeerCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id,
            neighbors: self
                .neighbors
                .iter()
                .map(|(id, n)| (*id, n.direction))
                .collect(),
            outbound: self.neighbors.outbound_count(),
            messages_seen: self.log.len(),
            originated: self.origin.originated(),
            dead: self.dead.iter().copied().collect(),
            registered: self.registered,
        }
    }

    // ========================================================================
    // Attachment
    // ========================================================================

    fn attach(
        &mut self,
        peer: NodeId,
        direction: Direction,
        degree_hint: u32,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) {
        if peer == self.id {
            warn!("refusing self-attachment");
            return;
        }
        self.reconnecting.remove(&peer);
        if self.links.contains_key(&peer) {
            debug!(%peer, "duplicate attach, keeping existing link");
            return;
        }

        // A fresh connection instance lifts the old terminal verdict; the
        // peer got here through a new registration.
        self.dead.remove(&peer);
        self.neighbors.remove(&peer);
        self.neighbors
            .insert(peer, direction, degree_hint, self.config.missed_ping_limit);

        let link = Link::spawn(peer, reader, writer, self.link_tx.clone());
        if direction == Direction::Inbound {
            // CONNECT acknowledgement doubles as our degree report.
            link.enqueue(Frame::DegReply {
                degree: self.neighbors.degree() as u32,
            });
            self.eventlog.record("ACCEPT", &peer.to_string());
        } else {
            self.eventlog
                .record("ATTACH", &format!("{peer} degree_hint={degree_hint}"));
        }
        self.links.insert(peer, link);
        info!(peer = %self.id, neighbor = %peer, ?direction, "neighbor attached");
    }

    fn handle_link_closed(&mut self, peer: NodeId) {
        if self.links.remove(&peer).is_none() {
            return;
        }
        debug!(%peer, "neighbor link closed");
        // Keep the table entry: the detector drives it to SUSPECT, and
        // corroboration then decides between reopening the link and the
        // DEAD escalation.
        let suspect = self
            .neighbors
            .get_mut(&peer)
            .map(|n| n.tracker.record_miss() == Some(Health::Suspect))
            .unwrap_or(false);
        if suspect {
            self.eventlog.record("SUSPECT", &peer.to_string());
            self.start_corroboration(peer);
        }
    }

    // ========================================================================
    // Link frames
    // ========================================================================

    fn handle_link_frame(&mut self, from: NodeId, frame: Frame) {
        match frame {
            Frame::Gossip {
                originator,
                seq_no,
                timestamp,
                payload,
            } => {
                self.receive_gossip(Some(from), originator, seq_no, timestamp, payload);
            }
            Frame::Ping { nonce } => {
                if let Some(link) = self.links.get(&from) {
                    link.enqueue(Frame::Pong { nonce });
                }
            }
            Frame::Pong { nonce } => {
                self.handle_pong(from, nonce);
            }
            Frame::DeadNode {
                dead, timestamp, ..
            } => {
                self.handle_dead_node(from, dead, timestamp);
            }
            Frame::DegQuery => {
                if let Some(link) = self.links.get(&from) {
                    link.enqueue(Frame::DegReply {
                        degree: self.neighbors.degree() as u32,
                    });
                }
            }
            Frame::DegReply { degree } => {
                if let Some(neighbor) = self.neighbors.get_mut(&from) {
                    neighbor.degree_hint = degree;
                }
            }
            other => {
                warn!(%from, kind = other.kind(), "dropping frame a neighbor link does not carry");
            }
        }
    }

    fn handle_pong(&mut self, from: NodeId, nonce: u64) {
        if let Some(neighbor) = self.neighbors.get_mut(&from) {
            if neighbor.tracker.pong(nonce) {
                return;
            }
        }
        // Not a ping answer: maybe an "alive" verdict for a round whose
        // query timestamp this nonce echoes.
        let mut decided = None;
        for (target, round) in self.rounds.iter_mut() {
            if round.nonce() == nonce && round.is_awaiting(&from) {
                if let Some(verdict) = round.record(from, false) {
                    decided = Some((*target, verdict));
                }
                break;
            }
        }
        match decided {
            Some((target, verdict)) => self.resolve_verdict(target, verdict),
            None => trace!(%from, nonce, "stale pong"),
        }
    }

    fn handle_dead_node(&mut self, from: NodeId, target: NodeId, timestamp: u64) {
        // A confirmation for our own round takes precedence over treating
        // the frame as a fresh query.
        let mut round_reply = false;
        let mut verdict = None;
        if let Some(round) = self.rounds.get_mut(&target) {
            if round.is_awaiting(&from) {
                round_reply = true;
                verdict = round.record(from, true);
            }
        }
        if round_reply {
            if let Some(verdict) = verdict {
                self.resolve_verdict(target, verdict);
            }
            return;
        }

        // A neighbor suspects `target` and wants our view: test-ping it off
        // the actor and answer once the probe resolves.
        debug!(%from, %target, "corroboration query received");
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.test_ping_timeout;
        tokio::spawn(async move {
            let alive = test_ping(target, deadline).await;
            let _ = cmd_tx
                .send(PeerCommand::Corroborated {
                    requester: from,
                    target,
                    query_ts: timestamp,
                    alive,
                })
                .await;
        });
    }

    // ========================================================================
    // Gossip
    // ========================================================================

    fn receive_gossip(
        &mut self,
        from: Option<NodeId>,
        originator: NodeId,
        seq_no: u64,
        timestamp: u64,
        payload: String,
    ) {
        if self.log.observe(&payload, unix_now(), originator).is_none() {
            trace!(%originator, seq_no, "duplicate gossip dropped");
            return;
        }
        let via = from
            .map(|f| f.to_string())
            .unwrap_or_else(|| "direct".to_string());
        self.eventlog.record("RECEIVE", &format!("{payload} via {via}"));
        self.forward(
            Frame::Gossip {
                originator,
                seq_no,
                timestamp,
                payload,
            },
            from,
        );
    }

    fn originate(&mut self) {
        let Some(seq_no) = self.origin.next() else {
            return;
        };
        let timestamp = unix_now();
        let payload = payload_for(timestamp, self.id, seq_no);
        self.log.observe(&payload, timestamp, self.id);
        self.eventlog.record("GENERATE", &payload);
        debug!(peer = %self.id, seq_no, "originating gossip");
        self.forward(
            Frame::Gossip {
                originator: self.id,
                seq_no,
                timestamp,
                payload,
            },
            None,
        );
    }

    /// Best-effort fan-out to every linked neighbor except `except`. A full
    /// queue drops that copy only; the digest stays recorded.
    fn forward(&self, frame: Frame, except: Option<NodeId>) {
        for (peer, link) in &self.links {
            if Some(*peer) == except {
                continue;
            }
            if !link.enqueue(frame.clone()) {
                debug!(%peer, "gossip forward dropped on full queue");
            }
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    fn ping_round(&mut self) {
        let mut suspects = Vec::new();
        let mut misses = Vec::new();

        for id in self.neighbors.ids() {
            if self.reconnecting.contains(&id) {
                continue;
            }
            let linked = self.links.contains_key(&id);
            let Some(neighbor) = self.neighbors.get_mut(&id) else {
                continue;
            };
            if neighbor.tracker.state() == Health::Dead {
                continue;
            }
            let before = neighbor.tracker.missed();
            let transition = if linked {
                let nonce: u64 = rand::random();
                let transition = neighbor.tracker.tick(nonce);
                if let Some(link) = self.links.get(&id) {
                    link.enqueue(Frame::Ping { nonce });
                }
                transition
            } else {
                neighbor.tracker.record_miss()
            };
            let after = neighbor.tracker.missed();
            if after > before {
                misses.push((id, after));
            }
            if transition == Some(Health::Suspect) {
                suspects.push(id);
            }
        }

        for (id, missed) in misses {
            self.eventlog
                .record("PING_MISS", &format!("{id} missed={missed}"));
        }
        for id in suspects {
            self.eventlog.record("SUSPECT", &id.to_string());
            info!(peer = %self.id, suspect = %id, "neighbor suspect, corroborating");
            self.start_corroboration(id);
        }
    }

    fn start_corroboration(&mut self, target: NodeId) {
        if self.rounds.contains_key(&target)
            || self.reconnecting.contains(&target)
            || self.dead.contains(&target)
        {
            return;
        }
        let others: BTreeSet<NodeId> = self
            .neighbors
            .others_alive(&target)
            .into_iter()
            .filter(|o| self.links.contains_key(o))
            .collect();

        if others.is_empty() {
            // Nobody to ask: local evidence decides.
            self.resolve_verdict(target, Verdict::Dead);
            return;
        }

        let nonce = unix_now();
        let query = Frame::DeadNode {
            dead: target,
            reporter: self.id,
            timestamp: nonce,
        };
        for other in &others {
            if let Some(link) = self.links.get(other) {
                link.enqueue(query.clone());
            }
        }
        self.rounds
            .insert(target, CorroborationRound::new(target, nonce, others));

        let cmd_tx = self.cmd_tx.clone();
        let window = self.config.corroboration_window;
        tokio::spawn(async move {
            sleep(window).await;
            let _ = cmd_tx
                .send(PeerCommand::CorroborationDeadline { target, nonce })
                .await;
        });
    }

    fn resolve_verdict(&mut self, target: NodeId, verdict: Verdict) {
        self.rounds.remove(&target);
        match verdict {
            Verdict::Alive => {
                if let Some(neighbor) = self.neighbors.get_mut(&target) {
                    neighbor.tracker.corroboration_alive();
                }
                if self.neighbors.contains(&target) && !self.links.contains_key(&target) {
                    // The target answers its other neighbors; only our
                    // connection is gone. A neighbor entry without a link
                    // can never produce a PONG again, so reopen it.
                    self.reattach(target);
                } else {
                    debug!(%target, "corroboration cleared the suspect");
                }
            }
            Verdict::Dead => {
                if self.dead.contains(&target) {
                    return;
                }
                // A direct answer during the window outranks the quorum.
                if let Some(neighbor) = self.neighbors.get_mut(&target) {
                    if neighbor.tracker.state() == Health::Healthy {
                        debug!(%target, "suspect recovered during corroboration");
                        return;
                    }
                }
                self.condemn(target);
            }
        }
    }

    /// Reopen the link to a neighbor corroboration found alive. One attempt
    /// per verdict; a failed attempt condemns the neighbor instead of
    /// cycling it through SUSPECT with no link forever.
    fn reattach(&mut self, target: NodeId) {
        if !self.reconnecting.insert(target) {
            return;
        }
        info!(peer = %self.id, %target, "reopening link to live neighbor");
        let id = self.id;
        let deadline = self.config.connect_timeout;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            match attach_outbound(id, target, deadline).await {
                Ok((degree_hint, reader, writer)) => {
                    let _ = cmd_tx
                        .send(PeerCommand::OutboundAttach {
                            peer: target,
                            degree_hint,
                            reader,
                            writer,
                        })
                        .await;
                }
                Err(e) => {
                    debug!(%target, error = %e, "reattach failed");
                    let _ = cmd_tx.send(PeerCommand::ReattachFailed { peer: target }).await;
                }
            }
        });
    }

    /// Terminal transition: close and remove the neighbor, record the
    /// verdict, and report it to every seed.
    fn condemn(&mut self, target: NodeId) {
        if self.dead.contains(&target) {
            return;
        }
        if let Some(neighbor) = self.neighbors.get_mut(&target) {
            neighbor.tracker.mark_dead();
        }
        self.neighbors.remove(&target);
        self.links.remove(&target);
        self.dead.insert(target);
        self.eventlog.record("CONFIRM_DEAD", &target.to_string());
        info!(peer = %self.id, %target, "neighbor confirmed dead");
        self.escalate(target);
    }

    /// Report the confirmed death to every configured seed, once per
    /// transition.
    fn escalate(&self, target: NodeId) {
        self.eventlog.record("ESCALATE", &target.to_string());
        let report = Frame::DeadNode {
            dead: target,
            reporter: self.id,
            timestamp: unix_now(),
        };
        for seed in self.directory.seeds() {
            let seed = *seed;
            let report = report.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    transport::send(seed.socket_addr(), &report, REQUEST_TIMEOUT).await
                {
                    debug!(%seed, error = %e, "dead-node report failed");
                }
            });
        }
    }
}
