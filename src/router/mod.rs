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

//! Network routing engine: the gossiped channel graph and the
//! Bellman-Ford-Gibson least-cost path search over it.

mod bfg;
mod graph;

pub use bfg::{connection_fee, FoundRoute, BLOCKS_PER_YEAR};
pub use graph::{
    Bfg, ConnId, Node, NodeConnection, NodeGraph, INFINITE, ROUTING_MAX_HOPS,
};
