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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]

#[macro_use]
extern crate amplify;
#[allow(unused_imports)]
#[macro_use]
extern crate lightning_encoding;

mod messages;
mod types;

pub use messages::{
    Authenticate, CloseShutdown, CloseSignature, Error, OpenAnchor,
    OpenChannel, OpenCommitSig, OpenComplete, Pkt, Reconnect, UpdateAccept,
    UpdateAddHtlc, UpdateCommit, UpdateComplete, UpdateFailHtlc,
    UpdateFulfillHtlc, UpdateRevocation, UpdateSignature,
};
pub use types::{AnchorOffer, Locktime, NodeId};
