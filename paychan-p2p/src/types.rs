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

use std::io;

use bitcoin::secp256k1::PublicKey;
use lightning_encoding::{
    strategies, LightningDecode, LightningEncode, Strategy,
};

/// Node identity: a 33-byte compressed public key. Equality and hashing
/// operate on the raw key bytes.
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    From,
)]
#[display(inner)]
#[wrapper(FromStr)]
pub struct NodeId(PublicKey);

impl NodeId {
    /// Returns the underlying secp256k1 public key
    #[inline]
    pub fn as_pubkey(&self) -> &PublicKey {
        &self.0
    }
}

impl Strategy for NodeId {
    type Strategy = strategies::AsWrapped;
}

/// Who funds the channel anchor. The two sides of a channel must always
/// disagree on this value.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum AnchorOffer {
    /// The sender will create and fund the anchor transaction
    #[display("WILL_CREATE_ANCHOR")]
    WillCreateAnchor,

    /// The sender expects the peer to create the anchor transaction
    #[display("WONT_CREATE_ANCHOR")]
    WontCreateAnchor,
}

impl LightningEncode for AnchorOffer {
    fn lightning_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        let tag: u8 = match self {
            AnchorOffer::WillCreateAnchor => 0,
            AnchorOffer::WontCreateAnchor => 1,
        };
        tag.lightning_encode(e)
    }
}

impl LightningDecode for AnchorOffer {
    fn lightning_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        match u8::lightning_decode(d)? {
            0 => Ok(AnchorOffer::WillCreateAnchor),
            1 => Ok(AnchorOffer::WontCreateAnchor),
            wrong => Err(lightning_encoding::Error::EnumValueNotKnown(
                "AnchorOffer",
                wrong as usize,
            )),
        }
    }
}

/// Tagged union of the two locktime interpretations used on the wire.
///
/// Relative locktimes (channel delays) and absolute locktimes (HTLC expiries)
/// share this representation; which interpretation applies is determined by
/// the field carrying the value.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Locktime {
    /// Time-based locktime, in seconds
    #[display("{0} seconds")]
    Seconds(u32),

    /// Height-based locktime, in blocks
    #[display("{0} blocks")]
    Blocks(u32),
}

impl Locktime {
    /// Returns the inner value if the locktime is expressed in seconds
    #[inline]
    pub fn seconds(self) -> Option<u32> {
        match self {
            Locktime::Seconds(secs) => Some(secs),
            Locktime::Blocks(_) => None,
        }
    }
}

impl LightningEncode for Locktime {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        Ok(match self {
            Locktime::Seconds(secs) => {
                0u8.lightning_encode(&mut e)? + secs.lightning_encode(&mut e)?
            }
            Locktime::Blocks(blocks) => {
                1u8.lightning_encode(&mut e)?
                    + blocks.lightning_encode(&mut e)?
            }
        })
    }
}

impl LightningDecode for Locktime {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        match u8::lightning_decode(&mut d)? {
            0 => Ok(Locktime::Seconds(u32::lightning_decode(&mut d)?)),
            1 => Ok(Locktime::Blocks(u32::lightning_decode(&mut d)?)),
            wrong => Err(lightning_encoding::Error::EnumValueNotKnown(
                "Locktime",
                wrong as usize,
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn node_id_equality_is_key_bytes() {
        let id1 = NodeId::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let id2 = NodeId::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn locktime_roundtrip() {
        for lt in [Locktime::Seconds(3600), Locktime::Blocks(144)] {
            let mut data = vec![];
            lt.lightning_encode(&mut data).unwrap();
            assert_eq!(Locktime::lightning_decode(&data[..]).unwrap(), lt);
        }
    }

    #[test]
    fn anchor_offer_roundtrip() {
        for offer in
            [AnchorOffer::WillCreateAnchor, AnchorOffer::WontCreateAnchor]
        {
            let mut data = vec![];
            offer.lightning_encode(&mut data).unwrap();
            assert_eq!(
                AnchorOffer::lightning_decode(&data[..]).unwrap(),
                offer
            );
        }
    }
}
