// PayChan: Lightning-style payment channel daemon core
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Process-wide daemon state, passed explicitly to every handler.

use std::collections::HashMap;

use bitcoin::secp256k1::{All, Secp256k1};
use p2p::NodeId;

use crate::channel::Peer;
use crate::router::{ConnId, NodeGraph};

/// Policy bounds applied to peer proposals. Populated by the configuration
/// loader; the defaults are the values used when nothing is configured.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Maximum relative locktime accepted from a peer, in seconds
    pub rel_locktime_max: u32,

    /// Maximum anchor depth a peer may require
    pub anchor_confirms_max: u32,

    /// Minimum commitment fee accepted from a peer, in satoshis
    pub commitment_fee_min: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rel_locktime_max: 86400,
            anchor_confirms_max: 10,
            commitment_fee_min: 546,
        }
    }
}

/// A payment routed through the graph: the directly connected peer to hand
/// the HTLC to, the total fee and the connection path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoutedPayment {
    /// The directly connected first hop
    pub peer: NodeId,

    /// Total fee on top of the requested amount, in millisatoshi
    pub fee: i64,

    /// Connections from the local node to the destination
    pub hops: Vec<ConnId>,
}

/// The shared daemon state: configuration, crypto context, node graph and
/// the peer list.
pub struct DaemonState {
    /// Local node identity
    pub id: NodeId,

    /// Policy configuration
    pub config: Config,

    /// Secp256k1 signing/verification context
    pub secp: Secp256k1<All>,

    /// The gossiped channel graph
    pub nodes: NodeGraph,

    /// Channel peers by node identity
    pub peers: HashMap<NodeId, Peer>,

    /// Test mode: never fail HTLCs which cannot be routed onwards
    pub dev_never_routefail: bool,
}

impl DaemonState {
    pub fn new(id: NodeId, config: Config) -> DaemonState {
        DaemonState {
            id,
            config,
            secp: Secp256k1::new(),
            nodes: NodeGraph::default(),
            peers: HashMap::new(),
            dev_never_routefail: false,
        }
    }

    pub fn find_peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn find_peer_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id, peer);
    }

    /// Answers the HTLC-add path query: the least-cost route to `to` able
    /// to deliver `msatoshi`, requiring a connected peer at the first hop.
    /// `None` means "no route".
    pub fn route_payment(
        &mut self,
        to: &NodeId,
        msatoshi: u64,
        riskfactor: f64,
    ) -> Option<RoutedPayment> {
        let local = self.id;
        let route = self.nodes.find_route(&local, to, msatoshi, riskfactor)?;
        let first = self
            .nodes
            .connection(*route.hops.first()?)
            .expect("routes reference live connections");

        if self.find_peer(&first.dst).is_none() {
            error!("No peer {}?", first.dst);
            return None;
        }

        Some(RoutedPayment {
            peer: first.dst,
            fee: route.fee,
            hops: route.hops,
        })
    }
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::{PublicKey, SecretKey};
    use p2p::AnchorOffer;

    use super::*;
    use crate::channel::PeerSecrets;

    fn node_id(seed: u8) -> NodeId {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        NodeId::from(PublicKey::from_secret_key(&secp, &sk))
    }

    fn peer(dstate: &DaemonState, seed: u8) -> Peer {
        let secrets = PeerSecrets::with(
            SecretKey::from_slice(&[seed; 32]).unwrap(),
            SecretKey::from_slice(&[seed + 1; 32]).unwrap(),
            [seed + 2; 32],
        );
        Peer::new(
            node_id(seed),
            &dstate.secp,
            secrets,
            AnchorOffer::WillCreateAnchor,
            3600,
            1,
            10_000,
        )
    }

    #[test]
    fn route_payment_requires_connected_peer() {
        let mut dstate = DaemonState::new(node_id(1), Config::default());
        dstate
            .nodes
            .add_connection(&node_id(1), &node_id(2), 10, 10, 5, 0);
        dstate
            .nodes
            .add_connection(&node_id(2), &node_id(3), 10, 10, 5, 0);

        // A route exists in the graph, but node 2 is not a peer.
        assert!(dstate.route_payment(&node_id(3), 100_000, 1.0).is_none());

        let first_hop = peer(&dstate, 2);
        dstate.add_peer(first_hop);
        let routed = dstate.route_payment(&node_id(3), 100_000, 1.0).unwrap();
        assert_eq!(routed.peer, node_id(2));
        assert_eq!(routed.hops.len(), 2);
    }

    #[test]
    fn route_payment_unknown_destination_is_no_route() {
        let mut dstate = DaemonState::new(node_id(1), Config::default());
        assert!(dstate.route_payment(&node_id(9), 1, 1.0).is_none());
    }
}
