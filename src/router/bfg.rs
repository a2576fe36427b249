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

//! Bellman-Ford-Gibson: a length-indexed Bellman-Ford variant.
//!
//! Fees depend on the amount passing through an edge, so the search runs
//! backwards from the payment destination: the total at a node is the amount
//! that must be *sent* from there for the requested amount to arrive.

use p2p::NodeId;

use super::graph::{Bfg, ConnId, NodeConnection, NodeGraph};
use super::{INFINITE, ROUTING_MAX_HOPS};

/// 365.25 * 24 * 60 / 10, assuming 10-minute blocks.
pub const BLOCKS_PER_YEAR: u64 = 52596;

/// Fee for `msatoshi` traversing `c`, saturating to [`INFINITE`] when the
/// proportional part would overflow signed 64-bit.
pub fn connection_fee(c: &NodeConnection, msatoshi: i64) -> i64 {
    let fee = match (c.proportional_fee as i64).checked_mul(msatoshi) {
        Some(product) => product / 1_000_000,
        None => return INFINITE,
    };
    c.base_fee as i64 + fee
}

/// Risk premium of passing `amount` through an edge delaying it by `delay`
/// blocks. The constant term biases the search towards shorter routes, all
/// things equal.
fn risk_fee(amount: i64, delay: u32, riskfactor: f64) -> u64 {
    // If fees are so negative we're making money, ignore risk.
    if amount < 0 {
        return 1;
    }
    (1.0 + amount as f64 * delay as f64 * riskfactor
        / BLOCKS_PER_YEAR as f64
        / 10_000.0) as u64
}

/// A route returned by [`NodeGraph::find_route`]: the ordered connections
/// from the local node to the destination and the total fee on top of the
/// requested amount.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FoundRoute {
    /// Fee in millisatoshi that the requested amount must be topped up by
    pub fee: i64,

    /// Connections from the local node towards the destination
    pub hops: Vec<ConnId>,
}

impl NodeGraph {
    fn clear_bfg(&mut self) {
        for node in self.nodes.values_mut() {
            for entry in node.bfg.iter_mut() {
                *entry = Bfg::default();
            }
        }
    }

    /// Relaxes one incoming edge of `node_id` across every path length.
    fn bfg_one_edge(
        &mut self,
        node_id: NodeId,
        conn_id: ConnId,
        riskfactor: f64,
    ) {
        let conn = self.conns[conn_id]
            .expect("edge lists only reference live connections");
        debug_assert_eq!(conn.dst, node_id);

        let bfg = self.nodes[&node_id].bfg;
        let src = self
            .nodes
            .get_mut(&conn.src)
            .expect("endpoints outlive their edges");

        for h in 0..ROUTING_MAX_HOPS {
            if bfg[h].total >= INFINITE {
                continue;
            }
            let fee = connection_fee(&conn, bfg[h].total);
            let risk = bfg[h].risk
                + risk_fee(bfg[h].total + fee, conn.delay, riskfactor);
            if bfg[h].total + fee + (risk as i64)
                < src.bfg[h + 1].total + (src.bfg[h + 1].risk as i64)
            {
                src.bfg[h + 1] = Bfg {
                    total: bfg[h].total + fee,
                    risk,
                    prev: Some(conn_id),
                };
            }
        }
    }

    /// Finds the minimum cost-plus-risk route from `local` to `to` able to
    /// deliver `msatoshi` at the destination. Returns `None` when the
    /// destination is unknown or unreachable within [`ROUTING_MAX_HOPS`].
    pub fn find_route(
        &mut self,
        local: &NodeId,
        to: &NodeId,
        msatoshi: u64,
        riskfactor: f64,
    ) -> Option<FoundRoute> {
        if self.nodes.get(to).is_none() {
            info!("find_route: cannot find {}", to);
            return None;
        }

        self.clear_bfg();

        // Seed the backwards search at the payment destination.
        self.nodes
            .get_mut(to)
            .expect("presence checked above")
            .bfg[0] = Bfg {
            total: msatoshi as i64,
            risk: 0,
            prev: None,
        };

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for run in 0..ROUTING_MAX_HOPS {
            trace!("Run {}", run);
            for id in &ids {
                let in_edges = self.nodes[id].in_edges.clone();
                for conn_id in in_edges {
                    self.bfg_one_edge(*id, conn_id, riskfactor);
                }
            }
        }

        let local_node = self.nodes.get(local)?;
        let mut best = 0;
        for h in 1..=ROUTING_MAX_HOPS {
            // Strict comparison keeps the first-found shorter route on ties.
            if local_node.bfg[h].total < local_node.bfg[best].total {
                best = h;
            }
        }

        if local_node.bfg[best].total >= INFINITE {
            info!("find_route: No route to {}", to);
            return None;
        }

        let fee = local_node.bfg[best].total - msatoshi as i64;
        let mut hops = Vec::with_capacity(best);
        let mut cursor = *local;
        for remaining in (1..=best).rev() {
            let conn_id = self.nodes[&cursor].bfg[remaining]
                .prev
                .expect("finite totals always record their edge");
            hops.push(conn_id);
            cursor = self.conns[conn_id]
                .expect("edge lists only reference live connections")
                .dst;
        }
        debug_assert_eq!(cursor, *to);

        info!(
            "find_route: {} hop(s) to {}, fee {} msat",
            hops.len(),
            to,
            fee
        );
        Some(FoundRoute { fee, hops })
    }
}

#[cfg(test)]
mod test {
    use super::super::graph::test::node_id;
    use super::*;

    #[test]
    fn fee_is_base_plus_proportional() {
        let conn = NodeConnection {
            src: node_id(1),
            dst: node_id(2),
            base_fee: 1000,
            proportional_fee: 1000,
            delay: 10,
            min_blocks: 0,
        };
        assert_eq!(connection_fee(&conn, 1_000_000), 2000);
    }

    #[test]
    fn fee_saturates_to_infinite_on_overflow() {
        let conn = NodeConnection {
            src: node_id(1),
            dst: node_id(2),
            base_fee: 0,
            proportional_fee: i32::MAX,
            delay: 0,
            min_blocks: 0,
        };
        assert_eq!(connection_fee(&conn, i64::MAX / 1000), INFINITE);
    }

    #[test]
    fn negative_amount_risk_is_one() {
        assert_eq!(risk_fee(-1, 100, 100.0), 1);
        assert_eq!(risk_fee(-1_000_000, 0, 0.0), 1);
    }

    fn two_hop_graph() -> NodeGraph {
        let mut graph = NodeGraph::default();
        graph.add_connection(&node_id(1), &node_id(2), 1000, 1000, 10, 0);
        graph.add_connection(&node_id(2), &node_id(3), 2000, 2000, 20, 0);
        graph
    }

    #[test]
    fn routes_through_intermediate_node() {
        let mut graph = two_hop_graph();
        let route = graph
            .find_route(&node_id(1), &node_id(3), 1_000_000, 1.0)
            .unwrap();

        // fee(B->C) over the requested amount is 4000; A->B then carries
        // 1_004_000 for a fee of 2004.
        assert_eq!(route.hops.len(), 2);
        assert_eq!(route.fee, 6004);

        let first = graph.connection(route.hops[0]).unwrap();
        assert_eq!(first.src, node_id(1));
        assert_eq!(first.dst, node_id(2));
        let second = graph.connection(route.hops[1]).unwrap();
        assert_eq!(second.dst, node_id(3));
    }

    #[test]
    fn no_route_after_edge_removal() {
        let mut graph = two_hop_graph();
        graph.remove_connection(&node_id(2), &node_id(3));
        assert!(graph
            .find_route(&node_id(1), &node_id(3), 1_000_000, 1.0)
            .is_none());
    }

    #[test]
    fn no_route_to_unknown_destination() {
        let mut graph = two_hop_graph();
        assert!(graph
            .find_route(&node_id(1), &node_id(9), 1_000_000, 1.0)
            .is_none());
    }

    #[test]
    fn ties_prefer_fewer_hops() {
        let mut graph = NodeGraph::default();
        // Free direct edge and an equally free two-hop detour.
        graph.add_connection(&node_id(1), &node_id(3), 0, 0, 0, 0);
        graph.add_connection(&node_id(1), &node_id(2), 0, 0, 0, 0);
        graph.add_connection(&node_id(2), &node_id(3), 0, 0, 0, 0);

        let route = graph
            .find_route(&node_id(1), &node_id(3), 1_000_000, 1.0)
            .unwrap();
        assert_eq!(route.hops.len(), 1);
        assert_eq!(route.fee, 0);
    }

    #[test]
    fn risk_steers_away_from_long_delays() {
        let mut graph = NodeGraph::default();
        // Same fees, hugely different delays.
        graph.add_connection(&node_id(1), &node_id(2), 10, 0, 1_000_000, 0);
        graph.add_connection(&node_id(1), &node_id(4), 10, 0, 1, 0);
        graph.add_connection(&node_id(2), &node_id(3), 0, 0, 0, 0);
        graph.add_connection(&node_id(4), &node_id(3), 0, 0, 0, 0);

        let route = graph
            .find_route(&node_id(1), &node_id(3), 1_000_000_000, 1.0)
            .unwrap();
        let first = graph.connection(route.hops[0]).unwrap();
        assert_eq!(first.dst, node_id(4));
    }
}
