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

//! Per-peer channel protocol: balance accounting, revocation secrets,
//! commitment transaction construction and the packet state machine.

mod commit_tx;
mod funding;
mod peer;
mod script;
mod secrets;

pub use commit_tx::{make_close_tx, make_commit_txs, Anchor, CommitKeys};
pub use funding::{
    commit_fee, funding_delta, funding_fail_htlc, funding_fulfill_htlc,
    ChannelHtlc, ChannelOneside, ChannelState,
};
pub use peer::{
    HtlcProgress, HtlcStage, Peer, ProtocolError, SideParams, StateName,
};
pub use script::{check_tx_sig, find_p2sh_out, sign_tx_input, ScriptGenerators};
pub use secrets::PeerSecrets;
