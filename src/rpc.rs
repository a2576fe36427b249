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

//! Core-side data models and operations of the JSON-RPC / CLI surface.
//! Transport and JSON framing belong to the embedding daemon.

use std::str::FromStr;

use p2p::NodeId;
use serde::{Deserialize, Serialize};

use crate::daemon::DaemonState;

/// One channel of the `getchannels` reply.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub from: String,
    pub to: String,
    pub base_fee: u32,
    pub proportional_fee: i32,
}

/// Reply of the `getchannels` command.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GetChannelsReply {
    pub channels: Vec<ChannelEntry>,
}

/// One node of the `getnodes` reply.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    pub nodeid: String,
    pub port: u16,
    pub hostname: Option<String>,
}

/// Reply of the `getnodes` command.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GetNodesReply {
    pub nodes: Vec<NodeEntry>,
}

/// `getchannels`: every known channel with its fee parameters.
pub fn get_channels(dstate: &DaemonState) -> GetChannelsReply {
    let mut channels = vec![];
    for node in dstate.nodes.nodes() {
        for conn in dstate.nodes.out_connections(node) {
            channels.push(ChannelEntry {
                from: node.id.to_string(),
                to: conn.dst.to_string(),
                base_fee: conn.base_fee,
                proportional_fee: conn.proportional_fee,
            });
        }
    }
    GetChannelsReply { channels }
}

/// `getnodes`: every known node; the hostname is absent until the node
/// advertised an address.
pub fn get_nodes(dstate: &DaemonState) -> GetNodesReply {
    let nodes = dstate
        .nodes
        .nodes()
        .map(|node| NodeEntry {
            nodeid: node.id.to_string(),
            port: node.port,
            hostname: if node.port == 0 {
                None
            } else {
                node.hostname.clone()
            },
        })
        .collect();
    GetNodesReply { nodes }
}

/// `dev-add-route`: inserts or updates a graph edge.
pub fn add_route(
    dstate: &mut DaemonState,
    src: &NodeId,
    dst: &NodeId,
    base: u32,
    var: i32,
    delay: u32,
    minblocks: u32,
) {
    dstate
        .nodes
        .add_connection(src, dst, base, var, delay, minblocks);
}

/// `dev-routefail`: toggles failing HTLCs that cannot be routed onwards.
pub fn dev_routefail(dstate: &mut DaemonState, enable: bool) {
    debug!(
        "dev-routefail: routefail {}",
        if enable { "enabled" } else { "disabled" }
    );
    dstate.dev_never_routefail = !enable;
}

/// Failures of the `dev-add-route` CLI string form.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum AddRouteError {
    /// Bad src pubkey
    BadSrcPubkey,

    /// Bad dst pubkey
    BadDstPubkey,

    /// Bad base/var/delay/minblocks
    BadNumber,

    /// Data after minblocks
    TrailingData,
}

/// Parses the CLI string form `src/dst/base/var/delay/minblocks` and inserts
/// the edge. Numbers are decimal; trailing text is rejected.
pub fn opt_add_route(
    arg: &str,
    dstate: &mut DaemonState,
) -> Result<(), AddRouteError> {
    let mut parts = arg.split('/');

    let src = parts
        .next()
        .and_then(|part| NodeId::from_str(part).ok())
        .ok_or(AddRouteError::BadSrcPubkey)?;
    let dst = parts
        .next()
        .and_then(|part| NodeId::from_str(part).ok())
        .ok_or(AddRouteError::BadDstPubkey)?;

    let mut number = || -> Result<u32, AddRouteError> {
        parts
            .next()
            .and_then(|part| u32::from_str(part).ok())
            .ok_or(AddRouteError::BadNumber)
    };
    let base = number()?;
    let var = number()? as i32;
    let delay = number()?;
    let minblocks = number()?;

    if parts.next().is_some() {
        return Err(AddRouteError::TrailingData);
    }

    add_route(dstate, &src, &dst, base, var, delay, minblocks);
    Ok(())
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    use super::*;
    use crate::daemon::Config;

    fn node_id(seed: u8) -> NodeId {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        NodeId::from(PublicKey::from_secret_key(&secp, &sk))
    }

    fn dstate() -> DaemonState {
        DaemonState::new(node_id(1), Config::default())
    }

    #[test]
    fn opt_add_route_inserts_edge() {
        let mut dstate = dstate();
        let arg = format!("{}/{}/1000/2000/10/3", node_id(2), node_id(3));
        opt_add_route(&arg, &mut dstate).unwrap();

        let reply = get_channels(&dstate);
        assert_eq!(reply.channels.len(), 1);
        assert_eq!(reply.channels[0].from, node_id(2).to_string());
        assert_eq!(reply.channels[0].to, node_id(3).to_string());
        assert_eq!(reply.channels[0].base_fee, 1000);
        assert_eq!(reply.channels[0].proportional_fee, 2000);
    }

    #[test]
    fn opt_add_route_rejects_malformed_input() {
        let mut dstate = dstate();
        assert_eq!(
            opt_add_route("nonsense/also-bad/1/2/3/4", &mut dstate),
            Err(AddRouteError::BadSrcPubkey)
        );
        assert_eq!(
            opt_add_route(
                &format!("{}/not-a-key/1/2/3/4", node_id(2)),
                &mut dstate
            ),
            Err(AddRouteError::BadDstPubkey)
        );
        assert_eq!(
            opt_add_route(
                &format!("{}/{}/1/x/3/4", node_id(2), node_id(3)),
                &mut dstate
            ),
            Err(AddRouteError::BadNumber)
        );
        assert_eq!(
            opt_add_route(
                &format!("{}/{}/1/2/3", node_id(2), node_id(3)),
                &mut dstate
            ),
            Err(AddRouteError::BadNumber)
        );
        assert_eq!(
            opt_add_route(
                &format!("{}/{}/1/2/3/4/extra", node_id(2), node_id(3)),
                &mut dstate
            ),
            Err(AddRouteError::TrailingData)
        );
        assert_eq!(AddRouteError::TrailingData.to_string(), "Data after minblocks");
    }

    #[test]
    fn get_nodes_reports_address_only_when_known() {
        let mut dstate = dstate();
        dstate
            .nodes
            .add_node(&node_id(2), Some("node.example".into()), 9735);
        dstate.nodes.add_node(&node_id(3), None, 0);

        let reply = get_nodes(&dstate);
        assert_eq!(reply.nodes.len(), 2);
        let known = reply
            .nodes
            .iter()
            .find(|node| node.nodeid == node_id(2).to_string())
            .unwrap();
        assert_eq!(known.hostname.as_deref(), Some("node.example"));
        assert_eq!(known.port, 9735);

        let unknown = reply
            .nodes
            .iter()
            .find(|node| node.nodeid == node_id(3).to_string())
            .unwrap();
        assert_eq!(unknown.hostname, None);

        // `hostname` serializes to JSON null for address-less nodes.
        let json = serde_json::to_value(&reply).unwrap();
        let entry = json["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|value| value["nodeid"] == node_id(3).to_string())
            .unwrap();
        assert!(entry["hostname"].is_null());
    }

    #[test]
    fn get_channels_serializes_to_expected_shape() {
        let mut dstate = dstate();
        add_route(&mut dstate, &node_id(2), &node_id(3), 7, 8, 9, 10);

        let json = serde_json::to_value(get_channels(&dstate)).unwrap();
        let channel = &json["channels"][0];
        assert_eq!(channel["from"], node_id(2).to_string());
        assert_eq!(channel["to"], node_id(3).to_string());
        assert_eq!(channel["base_fee"], 7);
        assert_eq!(channel["proportional_fee"], 8);
    }

    #[test]
    fn dev_routefail_toggles_flag() {
        let mut dstate = dstate();
        assert!(!dstate.dev_never_routefail);
        dev_routefail(&mut dstate, false);
        assert!(dstate.dev_never_routefail);
        dev_routefail(&mut dstate, true);
        assert!(!dstate.dev_never_routefail);
    }
}
