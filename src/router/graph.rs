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

//! The directed channel multigraph. Connections are owned by a central
//! arena; each node keeps index lists into it, so destroying an edge
//! detaches it from both endpoints in one operation.

use std::collections::HashMap;

use p2p::NodeId;

/// Index of a connection in the central arena.
pub type ConnId = usize;

/// Hard cap on path length.
pub const ROUTING_MAX_HOPS: usize = 20;

/// Too big to reach, but adding two of them does not overflow signed 64-bit.
pub const INFINITE: i64 = 0x3FFF_FFFF_FFFF_FFFF;

/// Per-node, per-path-length scratch entry of the routing search.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Bfg {
    /// Amount that must be sent through this node, in millisatoshi
    pub total: i64,

    /// Accumulated risk premium
    pub risk: u64,

    /// Edge towards the destination chosen at this path length
    pub prev: Option<ConnId>,
}

impl Default for Bfg {
    fn default() -> Self {
        Bfg {
            total: INFINITE,
            risk: 0,
            prev: None,
        }
    }
}

/// A node of the channel graph.
pub struct Node {
    /// Node identity
    pub id: NodeId,

    /// Advertised hostname, if any
    pub hostname: Option<String>,

    /// Advertised port; zero when unknown
    pub port: u16,

    pub(super) in_edges: Vec<ConnId>,
    pub(super) out_edges: Vec<ConnId>,
    pub(super) bfg: [Bfg; ROUTING_MAX_HOPS + 1],
}

impl Node {
    fn new(id: NodeId) -> Node {
        Node {
            id,
            hostname: None,
            port: 0,
            in_edges: vec![],
            out_edges: vec![],
            bfg: [Bfg::default(); ROUTING_MAX_HOPS + 1],
        }
    }
}

/// A directed edge with its fee and delay metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display("{src} -> {dst}")]
pub struct NodeConnection {
    /// Source node
    pub src: NodeId,

    /// Destination node
    pub dst: NodeId,

    /// Base fee, in millisatoshi
    pub base_fee: u32,

    /// Proportional fee, in millisatoshi per million
    pub proportional_fee: i32,

    /// Blocks the HTLC is delayed when traversing this edge
    pub delay: u32,

    /// Minimum remaining timeout the edge demands, in blocks
    pub min_blocks: u32,
}

/// The channel graph owned by the routing engine.
#[derive(Default)]
pub struct NodeGraph {
    pub(super) nodes: HashMap<NodeId, Node>,
    pub(super) conns: Vec<Option<NodeConnection>>,
}

impl NodeGraph {
    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All known nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn connection(&self, id: ConnId) -> Option<&NodeConnection> {
        self.conns.get(id).and_then(Option::as_ref)
    }

    /// Outgoing connections of `node`.
    pub fn out_connections<'a>(
        &'a self,
        node: &'a Node,
    ) -> impl Iterator<Item = &'a NodeConnection> + 'a {
        node.out_edges.iter().filter_map(move |id| self.connection(*id))
    }

    fn new_node(&mut self, id: NodeId) -> &mut Node {
        debug!("Creating new node {}", id);
        self.nodes.entry(id).or_insert_with(|| Node::new(id))
    }

    /// Creates the node or updates its advertised address.
    pub fn add_node(
        &mut self,
        id: &NodeId,
        hostname: Option<String>,
        port: u16,
    ) -> &mut Node {
        let node = if self.nodes.contains_key(id) {
            debug!("Update existing node {}", id);
            self.nodes.get_mut(id).expect("presence checked above")
        } else {
            self.new_node(*id)
        };
        node.hostname = hostname;
        node.port = port;
        node
    }

    fn get_or_make_connection(
        &mut self,
        from: &NodeId,
        to: &NodeId,
    ) -> ConnId {
        if !self.nodes.contains_key(from) {
            self.new_node(*from);
        }
        if !self.nodes.contains_key(to) {
            self.new_node(*to);
        }

        for conn_id in &self.nodes[to].in_edges {
            let conn = self.conns[*conn_id]
                .expect("edge lists only reference live connections");
            if conn.src == *from {
                debug!("Updating existing route from {} to {}", from, to);
                return *conn_id;
            }
        }

        debug!("Creating new route from {} to {}", from, to);
        let conn_id = self.conns.len();
        self.conns.push(Some(NodeConnection {
            src: *from,
            dst: *to,
            base_fee: 0,
            proportional_fee: 0,
            delay: 0,
            min_blocks: 0,
        }));
        self.nodes
            .get_mut(to)
            .expect("created above")
            .in_edges
            .push(conn_id);
        self.nodes
            .get_mut(from)
            .expect("created above")
            .out_edges
            .push(conn_id);
        conn_id
    }

    /// Upserts the edge identified by `(from, to)`, updating its metadata in
    /// place when it already exists.
    pub fn add_connection(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        base_fee: u32,
        proportional_fee: i32,
        delay: u32,
        min_blocks: u32,
    ) -> ConnId {
        let conn_id = self.get_or_make_connection(from, to);
        let conn = self.conns[conn_id]
            .as_mut()
            .expect("upserted connection is live");
        conn.base_fee = base_fee;
        conn.proportional_fee = proportional_fee;
        conn.delay = delay;
        conn.min_blocks = min_blocks;
        conn_id
    }

    /// Detaches and destroys the `(src, dst)` edge, if present.
    pub fn remove_connection(&mut self, src: &NodeId, dst: &NodeId) {
        debug!("Removing route from {} to {}", src, dst);
        if !self.nodes.contains_key(src) || !self.nodes.contains_key(dst) {
            debug!("Not found: src or dst unknown");
            return;
        }

        let found = self.nodes[src].out_edges.iter().copied().find(|id| {
            self.conns[*id]
                .expect("edge lists only reference live connections")
                .dst
                == *dst
        });
        match found {
            Some(conn_id) => self.destroy_connection(conn_id),
            None => debug!("No route matched"),
        }
    }

    /// Destroys a node together with all its edges. Each destruction
    /// removes itself from the node's lists, so they are drained from the
    /// front.
    pub fn remove_node(&mut self, id: &NodeId) {
        if !self.nodes.contains_key(id) {
            return;
        }
        while let Some(conn_id) = self.nodes[id].in_edges.first().copied() {
            self.destroy_connection(conn_id);
        }
        while let Some(conn_id) = self.nodes[id].out_edges.first().copied() {
            self.destroy_connection(conn_id);
        }
        self.nodes.remove(id);
    }

    /// Central edge destruction: removes the id from each endpoint list
    /// exactly once and frees the arena slot.
    fn destroy_connection(&mut self, conn_id: ConnId) {
        let conn = self.conns[conn_id]
            .take()
            .expect("destroying a connection twice");

        let removed_in = remove_conn_from_list(
            &mut self
                .nodes
                .get_mut(&conn.dst)
                .expect("endpoints outlive their edges")
                .in_edges,
            conn_id,
        );
        let removed_out = remove_conn_from_list(
            &mut self
                .nodes
                .get_mut(&conn.src)
                .expect("endpoints outlive their edges")
                .out_edges,
            conn_id,
        );
        if !removed_in || !removed_out {
            panic!("Connection not found in array?!");
        }
    }
}

fn remove_conn_from_list(list: &mut Vec<ConnId>, conn_id: ConnId) -> bool {
    match list.iter().position(|id| *id == conn_id) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
pub(super) mod test {
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    use super::*;

    pub fn node_id(seed: u8) -> NodeId {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        NodeId::from(PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn add_node_upserts() {
        let mut graph = NodeGraph::default();
        graph.add_node(&node_id(1), Some("node.example".into()), 9735);
        graph.add_node(&node_id(1), Some("elsewhere.example".into()), 9999);

        assert_eq!(graph.nodes().count(), 1);
        let node = graph.get_node(&node_id(1)).unwrap();
        assert_eq!(node.hostname.as_deref(), Some("elsewhere.example"));
        assert_eq!(node.port, 9999);
    }

    #[test]
    fn add_connection_upserts_by_ordered_pair() {
        let mut graph = NodeGraph::default();
        let first = graph.add_connection(&node_id(1), &node_id(2), 10, 20, 6, 3);
        let second =
            graph.add_connection(&node_id(1), &node_id(2), 99, 88, 7, 4);
        assert_eq!(first, second);

        let conn = graph.connection(second).unwrap();
        assert_eq!(conn.base_fee, 99);
        assert_eq!(conn.proportional_fee, 88);
        assert_eq!(conn.delay, 7);
        assert_eq!(conn.min_blocks, 4);

        // The reverse direction is a distinct edge.
        let reverse =
            graph.add_connection(&node_id(2), &node_id(1), 1, 1, 1, 1);
        assert_ne!(reverse, first);
        assert_eq!(graph.get_node(&node_id(1)).unwrap().out_edges.len(), 1);
        assert_eq!(graph.get_node(&node_id(1)).unwrap().in_edges.len(), 1);
    }

    #[test]
    fn remove_connection_detaches_both_sides() {
        let mut graph = NodeGraph::default();
        let conn_id = graph.add_connection(&node_id(1), &node_id(2), 1, 1, 1, 1);
        graph.remove_connection(&node_id(1), &node_id(2));

        assert!(graph.connection(conn_id).is_none());
        assert!(graph.get_node(&node_id(1)).unwrap().out_edges.is_empty());
        assert!(graph.get_node(&node_id(2)).unwrap().in_edges.is_empty());

        // Removing again is a no-op.
        graph.remove_connection(&node_id(1), &node_id(2));
    }

    #[test]
    fn remove_node_destroys_all_edges() {
        let mut graph = NodeGraph::default();
        graph.add_connection(&node_id(1), &node_id(2), 1, 1, 1, 1);
        graph.add_connection(&node_id(2), &node_id(3), 1, 1, 1, 1);
        graph.add_connection(&node_id(3), &node_id(2), 1, 1, 1, 1);

        graph.remove_node(&node_id(2));

        assert!(graph.get_node(&node_id(2)).is_none());
        assert!(graph.get_node(&node_id(1)).unwrap().out_edges.is_empty());
        assert!(graph.get_node(&node_id(3)).unwrap().in_edges.is_empty());
        assert!(graph.get_node(&node_id(3)).unwrap().out_edges.is_empty());
        assert_eq!(graph.conns.iter().flatten().count(), 0);
    }
}
