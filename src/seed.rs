//! # Seed Node
//!
//! A seed coordinator: listener, per-connection frame handling, and the
//! ledger actor that owns all consensus state. The actor processes commands
//! sequentially; network round-trips (proposals to other seeds, commit
//! notifications) run in spawned tasks that feed results back as commands.
//!
//! Registration replies are deferred: a registrant's connection handler
//! parks on a oneshot that the actor fulfills with the `PEER_LIST` once the
//! ADD commits. A proposal that cannot reach majority fulfills nothing; the
//! peer times out, backs off, and retries.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::config::SeedDirectory;
use crate::eventlog::EventLog;
use crate::identity::NodeId;
use crate::ledger::{AddVote, Ledger, RemoveReport};
use crate::transport::{self, read_frame, write_frame, REQUEST_TIMEOUT};

/// Tunables a seed runs with. Defaults match the reference deployment;
/// tests shorten the waits.
#[derive(Clone, Debug)]
pub struct SeedConfig {
    /// Directory the event file is written into.
    pub log_dir: PathBuf,
    /// Deadline for one seed-to-seed exchange.
    pub request_timeout: Duration,
    /// How long a registrant's connection waits for the ADD to commit.
    pub register_wait: Duration,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            request_timeout: REQUEST_TIMEOUT,
            register_wait: Duration::from_secs(10),
        }
    }
}

enum SeedCommand {
    Register {
        peer: NodeId,
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    ProposeAdd {
        peer: NodeId,
        proposer: NodeId,
        reply: oneshot::Sender<Frame>,
    },
    VoteAdd {
        peer: NodeId,
        voter: NodeId,
    },
    CommitAdd {
        peer: NodeId,
    },
    DeadNode {
        dead: NodeId,
        reporter: NodeId,
    },
    ProposeRemove {
        peer: NodeId,
    },
    LivePeers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    Quit,
}

/// Handle to a running seed.
pub struct SeedNode {
    id: NodeId,
    cmd_tx: mpsc::Sender<SeedCommand>,
    listener: JoinHandle<()>,
}

impl SeedNode {
    /// Bind the listen socket and spawn the ledger actor and accept loop.
    pub async fn start(directory: SeedDirectory, listen_port: u16) -> Result<Self> {
        Self::start_with_config(directory, listen_port, SeedConfig::default()).await
    }

    pub async fn start_with_config(
        directory: SeedDirectory,
        listen_port: u16,
        config: SeedConfig,
    ) -> Result<Self> {
        let id = match directory.entry_for_port(listen_port) {
            Some(entry) => entry,
            None => {
                warn!(
                    port = listen_port,
                    "listen port not in seed directory, advertising loopback"
                );
                NodeId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port)
            }
        };

        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .with_context(|| format!("binding seed listener on port {listen_port}"))?;

        let eventlog = Arc::new(
            EventLog::for_seed(&config.log_dir, listen_port)
                .context("opening seed event file")?,
        );
        eventlog.record("LISTENING", &id.to_string());
        info!(seed = %id, "seed listening");

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = SeedActor {
            id,
            directory,
            config: config.clone(),
            eventlog: eventlog.clone(),
            waiting: HashMap::new(),
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        let accept_tx = cmd_tx.clone();
        let accept_cfg = config;
        let listener = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "seed accepted connection");
                        let cmd_tx = accept_tx.clone();
                        let cfg = accept_cfg.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, cmd_tx, cfg).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "seed accept failed");
                    }
                }
            }
        });

        Ok(Self {
            id,
            cmd_tx,
            listener,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Snapshot of this seed's live-peer set.
    pub async fn live_peers(&self) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SeedCommand::LivePeers { reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop accepting, then stop the actor.
    pub async fn shutdown(&self) {
        self.listener.abort();
        let _ = self.cmd_tx.send(SeedCommand::Quit).await;
    }
}

/// One short-lived inbound connection: read a single frame and dispatch.
async fn handle_connection(stream: TcpStream, cmd_tx: mpsc::Sender<SeedCommand>, cfg: SeedConfig) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let frame = match timeout(cfg.request_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return,
    };

    match frame {
        Frame::Register { peer } => {
            let (tx, rx) = oneshot::channel();
            if cmd_tx
                .send(SeedCommand::Register { peer, reply: tx })
                .await
                .is_err()
            {
                return;
            }
            match timeout(cfg.register_wait, rx).await {
                Ok(Ok(peers)) => {
                    if let Err(e) = write_frame(&mut write_half, &Frame::PeerList { peers }).await {
                        debug!(%peer, error = %e, "failed to deliver PEER_LIST");
                    }
                }
                _ => {
                    // Stalled proposal: close without a PEER_LIST, the peer
                    // backs off and retries.
                    debug!(%peer, "registration did not commit in time");
                }
            }
        }
        Frame::ProposeAdd { peer, proposer } => {
            let (tx, rx) = oneshot::channel();
            if cmd_tx
                .send(SeedCommand::ProposeAdd {
                    peer,
                    proposer,
                    reply: tx,
                })
                .await
                .is_err()
            {
                return;
            }
            if let Ok(reply) = rx.await {
                let _ = write_frame(&mut write_half, &reply).await;
            }
        }
        Frame::CommitAdd { peer } => {
            let _ = cmd_tx.send(SeedCommand::CommitAdd { peer }).await;
        }
        Frame::DeadNode { dead, reporter, .. } => {
            let _ = cmd_tx.send(SeedCommand::DeadNode { dead, reporter }).await;
        }
        Frame::ProposeRemove { peer, .. } => {
            let _ = cmd_tx.send(SeedCommand::ProposeRemove { peer }).await;
        }
        other => {
            // VOTE_ADD lands here too: it travels only as the reply on the
            // connection the PROPOSE_ADD went out on, so one opening a
            // fresh connection is unsolicited.
            warn!(kind = other.kind(), "dropping frame a seed does not handle");
        }
    }
}

struct SeedActor {
    id: NodeId,
    directory: SeedDirectory,
    config: SeedConfig,
    eventlog: Arc<EventLog>,
    waiting: HashMap<NodeId, Vec<oneshot::Sender<Vec<NodeId>>>>,
    cmd_tx: mpsc::Sender<SeedCommand>,
}

impl SeedActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SeedCommand>) {
        let mut ledger = Ledger::new(self.directory.len());
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SeedCommand::Register { peer, reply } => {
                    self.handle_register(&mut ledger, peer, reply);
                }
                SeedCommand::ProposeAdd {
                    peer,
                    proposer,
                    reply,
                } => {
                    self.eventlog
                        .record("PROPOSE", &format!("{peer} from {proposer}"));
                    let frame = if ledger.is_live(&peer) {
                        Frame::CommitAdd { peer }
                    } else {
                        self.eventlog.record("VOTE", &format!("{peer} by {}", self.id));
                        Frame::VoteAdd {
                            peer,
                            voter: self.id,
                        }
                    };
                    let _ = reply.send(frame);
                }
                SeedCommand::VoteAdd { peer, voter } => {
                    self.handle_vote(&mut ledger, peer, voter);
                }
                SeedCommand::CommitAdd { peer } => {
                    if ledger.apply_commit_add(peer) {
                        self.eventlog.record("COMMIT_ADD", &peer.to_string());
                        info!(%peer, "commit notification applied");
                    }
                    self.fulfill_waiting(&ledger, peer);
                }
                SeedCommand::DeadNode { dead, reporter } => {
                    self.eventlog
                        .record("DEAD_REPORT", &format!("{dead} from {reporter}"));
                    let reporter_is_seed = self.directory.contains(&reporter);
                    match ledger.record_dead_report(dead, reporter, reporter_is_seed) {
                        RemoveReport::Committed => self.finish_commit_remove(dead),
                        RemoveReport::Pending(count) => {
                            debug!(%dead, count, needed = ledger.majority(), "remove pending");
                        }
                        RemoveReport::Unauthorized => {}
                    }
                }
                SeedCommand::ProposeRemove { peer } => {
                    if ledger.apply_commit_remove(peer) {
                        self.eventlog.record("COMMIT_REMOVE", &peer.to_string());
                        info!(%peer, "removed by commit notification");
                    }
                }
                SeedCommand::LivePeers { reply } => {
                    let _ = reply.send(ledger.live_peers());
                }
                SeedCommand::Quit => {
                    debug!(seed = %self.id, "seed actor quitting");
                    break;
                }
            }
        }
    }

    fn handle_register(
        &mut self,
        ledger: &mut Ledger,
        peer: NodeId,
        reply: oneshot::Sender<Vec<NodeId>>,
    ) {
        self.eventlog.record("REGISTER", &peer.to_string());
        match ledger.record_add_vote(peer, self.id) {
            AddVote::AlreadyLive => {
                // Idempotent re-registration: answer with the current list.
                let _ = reply.send(ledger.peer_list_excluding(peer));
            }
            AddVote::Committed => {
                self.waiting.entry(peer).or_default().push(reply);
                self.finish_commit_add(ledger, peer);
            }
            AddVote::Pending(votes) => {
                self.waiting.entry(peer).or_default().push(reply);
                self.eventlog.record("PROPOSE", &format!("{peer} from {}", self.id));
                debug!(%peer, votes, needed = ledger.majority(), "proposing ADD");
                self.broadcast_proposal(peer);
            }
        }
    }

    fn handle_vote(&mut self, ledger: &mut Ledger, peer: NodeId, voter: NodeId) {
        if ledger.is_live(&peer) {
            return;
        }
        if !ledger.has_pending_add(&peer) {
            warn!(%peer, %voter, "dropping vote for unknown proposal");
            return;
        }
        self.eventlog.record("VOTE", &format!("{peer} from {voter}"));
        if ledger.record_add_vote(peer, voter) == AddVote::Committed {
            self.finish_commit_add(ledger, peer);
        }
    }

    /// Ask every other seed to vote on `peer`. Replies come back as
    /// commands; unreachable seeds are skipped.
    fn broadcast_proposal(&self, peer: NodeId) {
        let frame = Frame::ProposeAdd {
            peer,
            proposer: self.id,
        };
        for other in self.directory.others(self.id) {
            let frame = frame.clone();
            let cmd_tx = self.cmd_tx.clone();
            let deadline = self.config.request_timeout;
            tokio::spawn(async move {
                match transport::request(other.socket_addr(), &frame, deadline).await {
                    Ok(Frame::VoteAdd { peer, voter }) => {
                        let _ = cmd_tx.send(SeedCommand::VoteAdd { peer, voter }).await;
                    }
                    Ok(Frame::CommitAdd { peer }) => {
                        let _ = cmd_tx.send(SeedCommand::CommitAdd { peer }).await;
                    }
                    Ok(other_frame) => {
                        warn!(kind = other_frame.kind(), "unexpected proposal reply");
                    }
                    Err(e) => {
                        debug!(seed = %other, error = %e, "seed unreachable for proposal");
                    }
                }
            });
        }
    }

    fn finish_commit_add(&mut self, ledger: &Ledger, peer: NodeId) {
        self.eventlog.record("COMMIT_ADD", &peer.to_string());
        info!(%peer, "consensus reached, peer added");
        let frame = Frame::CommitAdd { peer };
        for other in self.directory.others(self.id) {
            let frame = frame.clone();
            let deadline = self.config.request_timeout;
            tokio::spawn(async move {
                if let Err(e) = transport::send(other.socket_addr(), &frame, deadline).await {
                    debug!(seed = %other, error = %e, "commit notification failed");
                }
            });
        }
        self.fulfill_waiting(ledger, peer);
    }

    fn finish_commit_remove(&self, dead: NodeId) {
        self.eventlog.record("COMMIT_REMOVE", &dead.to_string());
        info!(%dead, "remove consensus reached, peer dropped");
        let frame = Frame::ProposeRemove {
            peer: dead,
            proposer: self.id,
        };
        for other in self.directory.others(self.id) {
            let frame = frame.clone();
            let deadline = self.config.request_timeout;
            tokio::spawn(async move {
                if let Err(e) = transport::send(other.socket_addr(), &frame, deadline).await {
                    debug!(seed = %other, error = %e, "remove notification failed");
                }
            });
        }
    }

    fn fulfill_waiting(&mut self, ledger: &Ledger, peer: NodeId) {
        if let Some(registrants) = self.waiting.remove(&peer) {
            let peers = ledger.peer_list_excluding(peer);
            for reply in registrants {
                let _ = reply.send(peers.clone());
            }
        }
    }
}
