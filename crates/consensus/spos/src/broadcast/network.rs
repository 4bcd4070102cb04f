//! Peer-to-peer messenger seam and an in-process network

use super::InterceptorsContainer;
use alloy_primitives::Bytes;
use core::fmt::Debug;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, Span};

/// Topic based publisher
pub trait Messenger: Send + Sync + Debug {
    /// Peer id of this node
    fn id(&self) -> Bytes;

    /// Publish `payload` on `topic` under this node's peer id
    fn broadcast(&self, topic: &str, payload: Vec<u8>);

    /// Publish `payload` on `topic` under the peer id of a hosted key
    fn broadcast_using_private_key(&self, topic: &str, payload: Vec<u8>, pid: &[u8]);
}

#[derive(Debug)]
struct Peer {
    interceptors: Arc<InterceptorsContainer>,
    online: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    peers: HashMap<Bytes, Peer>,
    published: HashMap<String, usize>,
}

/// Network delivering every publication synchronously to all other online peers
#[derive(Debug)]
pub struct LocalNetwork {
    state: RwLock<NetworkState>,
    span: Span,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self { state: RwLock::default(), span: Span::none() }
    }
}

impl LocalNetwork {
    /// Empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Empty network logging under `span`
    pub fn with_span(span: Span) -> Arc<Self> {
        Arc::new(Self { state: RwLock::default(), span })
    }

    /// Connect a peer and return its messenger
    pub fn join(
        self: &Arc<Self>,
        pid: Bytes,
        interceptors: Arc<InterceptorsContainer>,
    ) -> Arc<LocalMessenger> {
        self.state.write().peers.insert(pid.clone(), Peer { interceptors, online: true });
        Arc::new(LocalMessenger { network: Arc::clone(self), pid })
    }

    /// Take a peer off or back on the network
    pub fn set_online(&self, pid: &[u8], online: bool) {
        if let Some(peer) = self.state.write().peers.get_mut(&Bytes::copy_from_slice(pid)) {
            peer.online = online;
        }
    }

    /// Publications seen on topics starting with `prefix`
    pub fn published_on(&self, prefix: &str) -> usize {
        self.state
            .read()
            .published
            .iter()
            .filter(|(topic, _)| topic.starts_with(prefix))
            .map(|(_, count)| count)
            .sum()
    }

    fn publish(&self, topic: &str, payload: &[u8], from: &[u8], sender: &[u8]) {
        let targets: Vec<Arc<InterceptorsContainer>> = {
            let mut state = self.state.write();
            let online = |pid: &[u8]| {
                state.peers.get(&Bytes::copy_from_slice(pid)).is_some_and(|peer| peer.online)
            };
            if !online(sender) {
                trace!(parent: &self.span, topic, "Sender offline, publication dropped");
                return;
            }
            *state.published.entry(topic.to_string()).or_default() += 1;
            state
                .peers
                .iter()
                .filter(|(pid, peer)| {
                    peer.online && pid.as_ref() != sender && pid.as_ref() != from
                })
                .map(|(_, peer)| Arc::clone(&peer.interceptors))
                .collect()
        };

        for interceptors in targets {
            if let Err(err) = interceptors.process(topic, payload, from) {
                trace!(parent: &self.span, topic, %err, "Publication rejected by peer");
            }
        }
    }
}

/// Messenger of one peer on a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalMessenger {
    network: Arc<LocalNetwork>,
    pid: Bytes,
}

impl Messenger for LocalMessenger {
    fn id(&self) -> Bytes {
        self.pid.clone()
    }

    fn broadcast(&self, topic: &str, payload: Vec<u8>) {
        self.network.publish(topic, &payload, &self.pid, &self.pid);
    }

    fn broadcast_using_private_key(&self, topic: &str, payload: Vec<u8>, pid: &[u8]) {
        self.network.publish(topic, &payload, pid, &self.pid);
    }
}
