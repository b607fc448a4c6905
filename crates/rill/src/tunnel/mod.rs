//! Node-to-node links and the typed tunnels multiplexed over them.
//!
//! A link is one framed TCP connection to a peer; tunnels ride on top of it,
//! one per [`TunnelType`]. Requests carry a monotonically increasing message
//! id and park a oneshot sender in the pending table; the matching reply (or
//! the link going down) resolves it exactly once.

use crate::errors::{ResponseStatus, RuntimeError};
use crate::id::NodeId;
use crate::proto::{Frame, Payload, ReplyBody, TunnelType};
use crate::Result;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

mod link;
pub use link::{handshake_and_spawn, open_outbound};

/// Writer half of an established link. Frames pushed into `tx` are encoded
/// and written by the link's writer task.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub peer: NodeId,
    pub rt_uri: String,
    pub tx: mpsc::UnboundedSender<Frame>,
}

impl LinkHandle {
    fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// We sent `TunnelOpen` and are waiting for the reply.
    Requested,
    Up,
}

#[derive(Debug)]
struct Tunnel {
    id: Uuid,
    state: TunnelState,
}

/// Emitted when a tunnel transitions up or down. Down is emitted at most
/// once per established tunnel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TunnelEvent {
    Up {
        peer: NodeId,
        tunnel_type: TunnelType,
    },
    Down {
        peer: NodeId,
        tunnel_type: TunnelType,
        reason: String,
    },
}

struct Pending {
    peer: NodeId,
    tunnel_type: TunnelType,
    tx: oneshot::Sender<(ResponseStatus, ReplyBody)>,
}

/// Reply side of a tunnel request.
pub type RequestReceiver = oneshot::Receiver<(ResponseStatus, ReplyBody)>;

pub struct TunnelManager {
    node_id: NodeId,
    links: HashMap<NodeId, LinkHandle>,
    tunnels: HashMap<(NodeId, TunnelType), Tunnel>,
    pending: HashMap<u64, Pending>,
    next_msg_id: u64,
}

impl TunnelManager {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            links: HashMap::new(),
            tunnels: HashMap::new(),
            pending: HashMap::new(),
            next_msg_id: 1,
        }
    }

    pub fn link(&self, peer: &NodeId) -> Option<&LinkHandle> {
        self.links.get(peer)
    }

    pub fn has_link(&self, peer: &NodeId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.links.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Install a fresh link. If a link to the same peer already exists the
    /// old one is torn down first so its tunnels report Down before the
    /// replacement is visible.
    pub fn link_up(&mut self, link: LinkHandle) -> Vec<TunnelEvent> {
        let mut events = Vec::new();
        if self.links.contains_key(&link.peer) {
            debug!("replacing existing link to {}", link.peer);
            events = self.link_down(&link.peer, "link replaced");
        }
        self.links.insert(link.peer, link);
        events
    }

    /// Drop the link and every tunnel on it. All requests pending on the
    /// peer resolve with SERVICE_UNAVAILABLE.
    pub fn link_down(&mut self, peer: &NodeId, reason: &str) -> Vec<TunnelEvent> {
        self.links.remove(peer);
        let mut events = Vec::new();
        let gone: Vec<(NodeId, TunnelType)> = self
            .tunnels
            .keys()
            .filter(|(p, _)| p == peer)
            .copied()
            .collect();
        for key in gone {
            if let Some(tunnel) = self.tunnels.remove(&key) {
                if tunnel.state == TunnelState::Up {
                    events.push(TunnelEvent::Down {
                        peer: key.0,
                        tunnel_type: key.1,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        self.fail_pending(peer, None);
        events
    }

    /// Request a tunnel of the given type over an existing link. Idempotent
    /// while a tunnel is requested or up.
    pub fn open_tunnel(&mut self, peer: NodeId, tunnel_type: TunnelType) -> Result<()> {
        let link = self
            .links
            .get(&peer)
            .ok_or(RuntimeError::TunnelDown(peer))?;
        if self.tunnels.contains_key(&(peer, tunnel_type)) {
            return Ok(());
        }
        let tunnel_id = Uuid::new_v4();
        if !link.send(Frame::TunnelOpen {
            tunnel_id,
            tunnel_type,
        }) {
            return Err(RuntimeError::TunnelDown(peer));
        }
        self.tunnels.insert(
            (peer, tunnel_type),
            Tunnel {
                id: tunnel_id,
                state: TunnelState::Requested,
            },
        );
        debug!("requested {} tunnel to {}", tunnel_type, peer);
        Ok(())
    }

    pub fn is_up(&self, peer: &NodeId, tunnel_type: TunnelType) -> bool {
        matches!(
            self.tunnels.get(&(*peer, tunnel_type)),
            Some(t) if t.state == TunnelState::Up
        )
    }

    /// Peer asked to open a tunnel. Always accepted; if we raced it with our
    /// own open the tunnel simply comes up on both sides.
    pub fn handle_open(
        &mut self,
        peer: NodeId,
        tunnel_id: Uuid,
        tunnel_type: TunnelType,
    ) -> Vec<TunnelEvent> {
        let Some(link) = self.links.get(&peer) else {
            warn!("tunnel open from {} without a link", peer);
            return Vec::new();
        };
        link.send(Frame::TunnelOpenReply {
            tunnel_type,
            ok: true,
            reason: None,
        });
        match self.tunnels.get_mut(&(peer, tunnel_type)) {
            Some(tunnel) if tunnel.state == TunnelState::Up => Vec::new(),
            Some(tunnel) => {
                tunnel.state = TunnelState::Up;
                vec![TunnelEvent::Up { peer, tunnel_type }]
            }
            None => {
                self.tunnels.insert(
                    (peer, tunnel_type),
                    Tunnel {
                        id: tunnel_id,
                        state: TunnelState::Up,
                    },
                );
                vec![TunnelEvent::Up { peer, tunnel_type }]
            }
        }
    }

    pub fn handle_open_reply(
        &mut self,
        peer: NodeId,
        tunnel_type: TunnelType,
        ok: bool,
        reason: Option<String>,
    ) -> Vec<TunnelEvent> {
        match self.tunnels.get_mut(&(peer, tunnel_type)) {
            Some(tunnel) if tunnel.state == TunnelState::Requested => {
                if ok {
                    tunnel.state = TunnelState::Up;
                    debug!("{} tunnel to {} is up ({})", tunnel_type, peer, tunnel.id);
                    vec![TunnelEvent::Up { peer, tunnel_type }]
                } else {
                    self.tunnels.remove(&(peer, tunnel_type));
                    self.fail_pending(&peer, Some(tunnel_type));
                    warn!(
                        "{} tunnel to {} rejected: {}",
                        tunnel_type,
                        peer,
                        reason.as_deref().unwrap_or("unspecified")
                    );
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn handle_close(&mut self, peer: NodeId, tunnel_type: TunnelType) -> Vec<TunnelEvent> {
        let Some(tunnel) = self.tunnels.remove(&(peer, tunnel_type)) else {
            return Vec::new();
        };
        self.fail_pending(&peer, Some(tunnel_type));
        if tunnel.state == TunnelState::Up {
            vec![TunnelEvent::Down {
                peer,
                tunnel_type,
                reason: "closed by peer".to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    /// True while a tunnel is requested or up. A Requested tunnel already
    /// accepts requests: frames are ordered on the link, so the peer sees
    /// our TunnelOpen before anything sent after it.
    pub fn is_usable(&self, peer: &NodeId, tunnel_type: TunnelType) -> bool {
        self.tunnels.contains_key(&(*peer, tunnel_type))
    }

    /// Send a request over a tunnel. The returned receiver always resolves:
    /// with the peer's reply, or with SERVICE_UNAVAILABLE if the tunnel is
    /// not usable now or goes down before the reply arrives.
    pub fn request(
        &mut self,
        peer: NodeId,
        tunnel_type: TunnelType,
        payload: Payload,
    ) -> RequestReceiver {
        let (tx, rx) = oneshot::channel();
        if !self.is_usable(&peer, tunnel_type) {
            let _ = tx.send((ResponseStatus::ServiceUnavailable, ReplyBody::None));
            return rx;
        }
        let Some(link) = self.links.get(&peer) else {
            let _ = tx.send((ResponseStatus::ServiceUnavailable, ReplyBody::None));
            return rx;
        };
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        if !link.send(Frame::Request {
            tunnel_type,
            msg_id,
            payload,
        }) {
            let _ = tx.send((ResponseStatus::ServiceUnavailable, ReplyBody::None));
            return rx;
        }
        self.pending.insert(
            msg_id,
            Pending {
                peer,
                tunnel_type,
                tx,
            },
        );
        rx
    }

    /// Resolve the continuation parked under `msg_id`. Replies with no
    /// pending entry (late, duplicate, or forged) are dropped.
    pub fn handle_reply(
        &mut self,
        peer: NodeId,
        msg_id: u64,
        status: ResponseStatus,
        body: ReplyBody,
    ) {
        match self.pending.get(&msg_id) {
            Some(p) if p.peer == peer => {
                if let Some(pending) = self.pending.remove(&msg_id) {
                    let _ = pending.tx.send((status, body));
                }
            }
            Some(_) => warn!("reply #{} from {} does not match its request", msg_id, peer),
            None => debug!("dropping reply #{} from {} with no pending request", msg_id, peer),
        }
    }

    /// Answer a peer's request.
    pub fn reply(&mut self, peer: &NodeId, msg_id: u64, status: ResponseStatus, body: ReplyBody) {
        match self.links.get(peer) {
            Some(link) => {
                if !link.send(Frame::Reply {
                    msg_id,
                    status,
                    body,
                }) {
                    debug!("link to {} gone before reply #{}", peer, msg_id);
                }
            }
            None => debug!("no link to {} for reply #{}", peer, msg_id),
        }
    }

    /// Tear down every link and tunnel, telling peers first. Used at
    /// shutdown.
    pub fn close_all(&mut self) -> Vec<TunnelEvent> {
        let mut events = Vec::new();
        for ((peer, tunnel_type), tunnel) in self.tunnels.drain() {
            if let Some(link) = self.links.get(&peer) {
                link.send(Frame::TunnelClose { tunnel_type });
            }
            if tunnel.state == TunnelState::Up {
                events.push(TunnelEvent::Down {
                    peer,
                    tunnel_type,
                    reason: "node shutdown".to_string(),
                });
            }
        }
        self.links.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending
                .tx
                .send((ResponseStatus::ServiceUnavailable, ReplyBody::None));
        }
        events
    }

    fn fail_pending(&mut self, peer: &NodeId, tunnel_type: Option<TunnelType>) {
        let doomed: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == *peer && tunnel_type.map_or(true, |t| p.tunnel_type == t))
            .map(|(id, _)| *id)
            .collect();
        for msg_id in doomed {
            if let Some(pending) = self.pending.remove(&msg_id) {
                let _ = pending
                    .tx
                    .send((ResponseStatus::ServiceUnavailable, ReplyBody::None));
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOp;

    fn fake_link(peer: NodeId) -> (LinkHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LinkHandle {
                peer,
                rt_uri: "rill://127.0.0.1:5000".to_string(),
                tx,
            },
            rx,
        )
    }

    fn up_tunnel(
        mgr: &mut TunnelManager,
        peer: NodeId,
    ) -> mpsc::UnboundedReceiver<Frame> {
        let (link, rx) = fake_link(peer);
        mgr.link_up(link);
        mgr.open_tunnel(peer, TunnelType::Registry).unwrap();
        let events = mgr.handle_open_reply(peer, TunnelType::Registry, true, None);
        assert_eq!(events.len(), 1);
        rx
    }

    #[test]
    fn test_open_tunnel_without_link_fails() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let err = mgr
            .open_tunnel(NodeId::generate(), TunnelType::Proto)
            .unwrap_err();
        assert_eq!(err.status(), ResponseStatus::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_request_reply_resolves_continuation() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let mut frames = up_tunnel(&mut mgr, peer);

        let rx = mgr.request(
            peer,
            TunnelType::Registry,
            Payload::Registry(RegistryOp::Get {
                key: "node-x".to_string(),
            }),
        );
        // TunnelOpen then the request.
        frames.recv().await.unwrap();
        let Frame::Request { msg_id, .. } = frames.recv().await.unwrap() else {
            panic!("expected request frame");
        };
        mgr.handle_reply(peer, msg_id, ResponseStatus::Ok, ReplyBody::None);
        let (status, _) = rx.await.unwrap();
        assert_eq!(status, ResponseStatus::Ok);
    }

    #[tokio::test]
    async fn test_request_on_down_tunnel_resolves_unavailable() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let (link, _frames) = fake_link(peer);
        mgr.link_up(link);
        // Link is up but no tunnel was ever opened.
        let rx = mgr.request(
            peer,
            TunnelType::Proto,
            Payload::Registry(RegistryOp::Get {
                key: "k".to_string(),
            }),
        );
        let (status, _) = rx.await.unwrap();
        assert_eq!(status, ResponseStatus::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_link_down_fails_all_pending() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let _frames = up_tunnel(&mut mgr, peer);

        let rx1 = mgr.request(
            peer,
            TunnelType::Registry,
            Payload::Registry(RegistryOp::Get {
                key: "a".to_string(),
            }),
        );
        let rx2 = mgr.request(
            peer,
            TunnelType::Registry,
            Payload::Registry(RegistryOp::Get {
                key: "b".to_string(),
            }),
        );
        let events = mgr.link_down(&peer, "connection reset");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TunnelEvent::Down { .. }));

        let (s1, _) = rx1.await.unwrap();
        let (s2, _) = rx2.await.unwrap();
        assert_eq!(s1, ResponseStatus::ServiceUnavailable);
        assert_eq!(s2, ResponseStatus::ServiceUnavailable);
    }

    #[test]
    fn test_down_event_emitted_once() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let _frames = up_tunnel(&mut mgr, peer);

        let first = mgr.link_down(&peer, "reset");
        assert_eq!(first.len(), 1);
        let second = mgr.link_down(&peer, "reset");
        assert!(second.is_empty());
    }

    #[test]
    fn test_simultaneous_open_comes_up_once() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let (link, _frames) = fake_link(peer);
        mgr.link_up(link);
        // We initiate, then the peer's own open arrives before our reply.
        mgr.open_tunnel(peer, TunnelType::Proto).unwrap();
        let ev1 = mgr.handle_open(peer, Uuid::new_v4(), TunnelType::Proto);
        assert_eq!(ev1.len(), 1);
        // Our open reply afterwards must not produce a second Up.
        let ev2 = mgr.handle_open_reply(peer, TunnelType::Proto, true, None);
        assert!(ev2.is_empty());
        assert!(mgr.is_up(&peer, TunnelType::Proto));
    }

    #[test]
    fn test_unknown_reply_is_dropped() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let _frames = up_tunnel(&mut mgr, peer);
        // Must not panic or disturb state.
        mgr.handle_reply(peer, 999, ResponseStatus::Ok, ReplyBody::None);
        assert!(mgr.is_up(&peer, TunnelType::Registry));
    }

    #[tokio::test]
    async fn test_reply_from_wrong_peer_is_ignored() {
        let mut mgr = TunnelManager::new(NodeId::generate());
        let peer = NodeId::generate();
        let other = NodeId::generate();
        let mut frames = up_tunnel(&mut mgr, peer);

        let rx = mgr.request(
            peer,
            TunnelType::Registry,
            Payload::Registry(RegistryOp::Get {
                key: "a".to_string(),
            }),
        );
        frames.recv().await.unwrap();
        let Frame::Request { msg_id, .. } = frames.recv().await.unwrap() else {
            panic!("expected request frame");
        };
        mgr.handle_reply(other, msg_id, ResponseStatus::Ok, ReplyBody::None);
        // Still pending; the right peer can resolve it.
        mgr.handle_reply(peer, msg_id, ResponseStatus::Ok, ReplyBody::None);
        let (status, _) = rx.await.unwrap();
        assert_eq!(status, ResponseStatus::Ok);
    }
}
