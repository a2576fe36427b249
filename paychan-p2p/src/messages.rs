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

use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{PublicKey, Signature};
use bitcoin::{Script, Txid};
use lightning_encoding::{LightningDecode, LightningEncode};

use crate::{AnchorOffer, Locktime, NodeId};

/// Transport-level authentication of the connecting node.
///
/// Processed by the transport layer before any channel packet; carried in the
/// union for completeness of the wire enumeration.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("auth({node_id})")]
pub struct Authenticate {
    /// Identity the sender claims on this connection
    pub node_id: NodeId,

    /// Signature over the session key proving the identity
    pub session_sig: Signature,
}

/// Resumption request after a transport reconnect.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("reconnect({ack})")]
pub struct Reconnect {
    /// Number of packets the sender has processed from us so far
    pub ack: u64,
}

/// Proposal of a new channel, exchanged by both sides.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("open({commitment_fee}, {anch}, {min_depth}, ...)")]
pub struct OpenChannel {
    /// Hash of the sender's first revocation preimage
    pub revocation_hash: sha256::Hash,

    /// Key the sender will use on the 2-of-2 anchor input
    pub commit_key: PublicKey,

    /// Key the sender's settlement outputs pay to
    pub final_key: PublicKey,

    /// Delay the peer's to-self outputs must mature for
    pub delay: Locktime,

    /// Commitment transaction fee proposed by the sender, in satoshis
    pub commitment_fee: u64,

    /// Which side creates and funds the anchor
    pub anch: AnchorOffer,

    /// Anchor confirmations the sender requires before the channel is live
    pub min_depth: u32,
}

/// Anchor announcement sent by the funding side, carrying its signature over
/// the non-funder's initial commitment transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("open_anchor({txid}:{output_index}, {amount})")]
pub struct OpenAnchor {
    /// Anchor transaction id
    pub txid: Txid,

    /// Output of the anchor transaction carrying the channel funds
    pub output_index: u32,

    /// Value of the anchor output, in satoshis
    pub amount: u64,

    /// Funder's signature over the peer's initial commitment transaction
    pub commit_sig: Signature,
}

/// Non-funder's signature over the funder's initial commitment transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("open_commit_sig(...)")]
pub struct OpenCommitSig {
    /// Signature over the peer's initial commitment transaction
    pub sig: Signature,
}

/// Notice that the sender has seen the anchor reach its required depth.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Default)]
#[display("open_complete()")]
pub struct OpenComplete {}

impl LightningEncode for OpenComplete {
    fn lightning_encode<E: io::Write>(
        &self,
        _e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        Ok(0)
    }
}

impl LightningDecode for OpenComplete {
    fn lightning_decode<D: io::Read>(
        _d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        Ok(OpenComplete {})
    }
}

/// Proposal of a new HTLC escrowed by the sender.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_add_htlc({amount_msat}, {expiry}, ...)")]
pub struct UpdateAddHtlc {
    /// Hash of the sender's next revocation preimage
    pub revocation_hash: sha256::Hash,

    /// Amount placed into escrow, in millisatoshi
    pub amount_msat: u64,

    /// Hash whose preimage releases the escrow to the recipient
    pub r_hash: sha256::Hash,

    /// Absolute expiry after which the escrow returns to the sender
    pub expiry: Locktime,
}

/// Redemption of an HTLC by revealing its preimage. The HTLC is identified
/// by the preimage itself.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_fulfill_htlc(...)")]
pub struct UpdateFulfillHtlc {
    /// Hash of the sender's next revocation preimage
    pub revocation_hash: sha256::Hash,

    /// Preimage of the HTLC being redeemed
    pub r: sha256::Hash,
}

/// Return of an HTLC to its offerer, identified by its hash.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_fail_htlc(...)")]
pub struct UpdateFailHtlc {
    /// Hash of the sender's next revocation preimage
    pub revocation_hash: sha256::Hash,

    /// Hash identifying the failed HTLC
    pub r_hash: sha256::Hash,
}

/// Commitment signature message of the successor protocol generation.
///
/// Wire-defined only: the state machine has no handler for it.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_commit(...)")]
pub struct UpdateCommit {
    /// Signature over the peer's new commitment transaction
    pub sig: Signature,
}

/// Revocation message of the successor protocol generation.
///
/// Wire-defined only: the state machine has no handler for it.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_revocation(...)")]
pub struct UpdateRevocation {
    /// Preimage of the revoked commitment's revocation hash
    pub revocation_preimage: sha256::Hash,
}

/// Acceptance of a proposed update: the responder's signature over the
/// proposer's new commitment plus the responder's next revocation hash.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_accept(...)")]
pub struct UpdateAccept {
    /// Signature over the peer's new commitment transaction
    pub sig: Signature,

    /// Hash of the sender's next revocation preimage
    pub revocation_hash: sha256::Hash,
}

/// Proposer's counter-signature plus disclosure of the preimage retiring its
/// previous commitment.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_signature(...)")]
pub struct UpdateSignature {
    /// Signature over the peer's new commitment transaction
    pub sig: Signature,

    /// Preimage retiring the sender's previous commitment
    pub revocation_preimage: sha256::Hash,
}

/// Responder's final disclosure of the preimage retiring its previous
/// commitment; completes the update.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_complete(...)")]
pub struct UpdateComplete {
    /// Preimage retiring the sender's previous commitment
    pub revocation_preimage: sha256::Hash,
}

/// Announcement of intent to close the channel cooperatively.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("close_shutdown(...)")]
pub struct CloseShutdown {
    /// Script the sender's settlement output must pay to
    pub script_pubkey: Script,
}

/// Signature over the mutual close transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("close_signature({close_fee}, ...)")]
pub struct CloseSignature {
    /// Fee of the close transaction, in satoshis
    pub close_fee: u64,

    /// Signature over the mutual close transaction
    pub sig: Signature,
}

/// Report of a protocol failure. After sending or receiving this packet the
/// channel is abandoned.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("error({problem})")]
pub struct Error {
    /// Human-readable description of the failure
    pub problem: String,
}

/// The packet union: every message of the peer protocol, discriminated on the
/// wire by its `pkt_case` tag.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display(inner)]
#[non_exhaustive]
pub enum Pkt {
    /// Transport authentication (tag 50)
    Auth(Authenticate),

    /// Transport resumption (tag 51)
    Reconnect(Reconnect),

    /// Channel proposal (tag 20)
    Open(OpenChannel),

    /// Anchor announcement with initial signature (tag 21)
    OpenAnchor(OpenAnchor),

    /// Initial commitment signature from the non-funder (tag 22)
    OpenCommitSig(OpenCommitSig),

    /// Anchor depth reached (tag 23)
    OpenComplete(OpenComplete),

    /// HTLC proposal (tag 2)
    UpdateAddHtlc(UpdateAddHtlc),

    /// HTLC redemption (tag 3)
    UpdateFulfillHtlc(UpdateFulfillHtlc),

    /// HTLC failure (tag 4)
    UpdateFailHtlc(UpdateFailHtlc),

    /// Successor-generation commitment signature (tag 5)
    UpdateCommit(UpdateCommit),

    /// Successor-generation revocation (tag 6)
    UpdateRevocation(UpdateRevocation),

    /// Update acceptance (tag 7)
    UpdateAccept(UpdateAccept),

    /// Update counter-signature with revocation preimage (tag 8)
    UpdateSignature(UpdateSignature),

    /// Update completion with revocation preimage (tag 9)
    UpdateComplete(UpdateComplete),

    /// Cooperative close intent (tag 30)
    CloseShutdown(CloseShutdown),

    /// Mutual close signature (tag 31)
    CloseSignature(CloseSignature),

    /// Protocol failure report (tag 40)
    Error(Error),
}

impl Pkt {
    /// Wire discriminator of the packet
    pub fn pkt_case(&self) -> u16 {
        match self {
            Pkt::UpdateAddHtlc(_) => 2,
            Pkt::UpdateFulfillHtlc(_) => 3,
            Pkt::UpdateFailHtlc(_) => 4,
            Pkt::UpdateCommit(_) => 5,
            Pkt::UpdateRevocation(_) => 6,
            Pkt::UpdateAccept(_) => 7,
            Pkt::UpdateSignature(_) => 8,
            Pkt::UpdateComplete(_) => 9,
            Pkt::Open(_) => 20,
            Pkt::OpenAnchor(_) => 21,
            Pkt::OpenCommitSig(_) => 22,
            Pkt::OpenComplete(_) => 23,
            Pkt::CloseShutdown(_) => 30,
            Pkt::CloseSignature(_) => 31,
            Pkt::Error(_) => 40,
            Pkt::Auth(_) => 50,
            Pkt::Reconnect(_) => 51,
        }
    }

    /// Stable lowercase name of the packet kind, used in logs and error
    /// messages
    pub fn name(&self) -> &'static str {
        match self {
            Pkt::UpdateAddHtlc(_) => "update_add_htlc",
            Pkt::UpdateFulfillHtlc(_) => "update_fulfill_htlc",
            Pkt::UpdateFailHtlc(_) => "update_fail_htlc",
            Pkt::UpdateCommit(_) => "update_commit",
            Pkt::UpdateRevocation(_) => "update_revocation",
            Pkt::UpdateAccept(_) => "update_accept",
            Pkt::UpdateSignature(_) => "update_signature",
            Pkt::UpdateComplete(_) => "update_complete",
            Pkt::Open(_) => "open",
            Pkt::OpenAnchor(_) => "open_anchor",
            Pkt::OpenCommitSig(_) => "open_commit_sig",
            Pkt::OpenComplete(_) => "open_complete",
            Pkt::CloseShutdown(_) => "close_shutdown",
            Pkt::CloseSignature(_) => "close_signature",
            Pkt::Error(_) => "error",
            Pkt::Auth(_) => "auth",
            Pkt::Reconnect(_) => "reconnect",
        }
    }
}

impl LightningEncode for Pkt {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        let mut len = self.pkt_case().lightning_encode(&mut e)?;
        len += match self {
            Pkt::Auth(msg) => msg.lightning_encode(&mut e)?,
            Pkt::Reconnect(msg) => msg.lightning_encode(&mut e)?,
            Pkt::Open(msg) => msg.lightning_encode(&mut e)?,
            Pkt::OpenAnchor(msg) => msg.lightning_encode(&mut e)?,
            Pkt::OpenCommitSig(msg) => msg.lightning_encode(&mut e)?,
            Pkt::OpenComplete(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateAddHtlc(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateFulfillHtlc(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateFailHtlc(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateCommit(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateRevocation(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateAccept(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateSignature(msg) => msg.lightning_encode(&mut e)?,
            Pkt::UpdateComplete(msg) => msg.lightning_encode(&mut e)?,
            Pkt::CloseShutdown(msg) => msg.lightning_encode(&mut e)?,
            Pkt::CloseSignature(msg) => msg.lightning_encode(&mut e)?,
            Pkt::Error(msg) => msg.lightning_encode(&mut e)?,
        };
        Ok(len)
    }
}

impl LightningDecode for Pkt {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        Ok(match u16::lightning_decode(&mut d)? {
            2 => Pkt::UpdateAddHtlc(UpdateAddHtlc::lightning_decode(&mut d)?),
            3 => Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc::lightning_decode(
                &mut d,
            )?),
            4 => Pkt::UpdateFailHtlc(UpdateFailHtlc::lightning_decode(&mut d)?),
            5 => Pkt::UpdateCommit(UpdateCommit::lightning_decode(&mut d)?),
            6 => Pkt::UpdateRevocation(UpdateRevocation::lightning_decode(
                &mut d,
            )?),
            7 => Pkt::UpdateAccept(UpdateAccept::lightning_decode(&mut d)?),
            8 => Pkt::UpdateSignature(UpdateSignature::lightning_decode(
                &mut d,
            )?),
            9 => Pkt::UpdateComplete(UpdateComplete::lightning_decode(&mut d)?),
            20 => Pkt::Open(OpenChannel::lightning_decode(&mut d)?),
            21 => Pkt::OpenAnchor(OpenAnchor::lightning_decode(&mut d)?),
            22 => Pkt::OpenCommitSig(OpenCommitSig::lightning_decode(&mut d)?),
            23 => Pkt::OpenComplete(OpenComplete::lightning_decode(&mut d)?),
            30 => Pkt::CloseShutdown(CloseShutdown::lightning_decode(&mut d)?),
            31 => Pkt::CloseSignature(CloseSignature::lightning_decode(
                &mut d,
            )?),
            40 => Pkt::Error(Error::lightning_decode(&mut d)?),
            50 => Pkt::Auth(Authenticate::lightning_decode(&mut d)?),
            51 => Pkt::Reconnect(Reconnect::lightning_decode(&mut d)?),
            wrong => {
                return Err(lightning_encoding::Error::EnumValueNotKnown(
                    "Pkt",
                    wrong as usize,
                ))
            }
        })
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    use super::*;

    fn test_sig() -> Signature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let msg = Message::from_slice(&[0x22; 32]).unwrap();
        secp.sign(&msg, &sk)
    }

    fn test_key(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn all_packets() -> Vec<Pkt> {
        let hash = sha256::Hash::hash(b"test");
        let sig = test_sig();
        vec![
            Pkt::Auth(Authenticate {
                node_id: NodeId::from(test_key(1)),
                session_sig: sig,
            }),
            Pkt::Reconnect(Reconnect { ack: 42 }),
            Pkt::Open(OpenChannel {
                revocation_hash: hash,
                commit_key: test_key(2),
                final_key: test_key(3),
                delay: Locktime::Seconds(3600),
                commitment_fee: 10000,
                anch: AnchorOffer::WillCreateAnchor,
                min_depth: 1,
            }),
            Pkt::OpenAnchor(OpenAnchor {
                txid: Txid::hash(b"anchor"),
                output_index: 0,
                amount: 1_000_000,
                commit_sig: sig,
            }),
            Pkt::OpenCommitSig(OpenCommitSig { sig }),
            Pkt::OpenComplete(OpenComplete {}),
            Pkt::UpdateAddHtlc(UpdateAddHtlc {
                revocation_hash: hash,
                amount_msat: 500_000,
                r_hash: sha256::Hash::hash(b"r"),
                expiry: Locktime::Seconds(1_500_000_000),
            }),
            Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc {
                revocation_hash: hash,
                r: sha256::Hash::hash(b"preimage"),
            }),
            Pkt::UpdateFailHtlc(UpdateFailHtlc {
                revocation_hash: hash,
                r_hash: sha256::Hash::hash(b"r"),
            }),
            Pkt::UpdateCommit(UpdateCommit { sig }),
            Pkt::UpdateRevocation(UpdateRevocation {
                revocation_preimage: hash,
            }),
            Pkt::UpdateAccept(UpdateAccept {
                sig,
                revocation_hash: hash,
            }),
            Pkt::UpdateSignature(UpdateSignature {
                sig,
                revocation_preimage: hash,
            }),
            Pkt::UpdateComplete(UpdateComplete {
                revocation_preimage: hash,
            }),
            Pkt::CloseShutdown(CloseShutdown {
                script_pubkey: Script::new(),
            }),
            Pkt::CloseSignature(CloseSignature {
                close_fee: 20000,
                sig,
            }),
            Pkt::Error(Error {
                problem: "Only one side can offer anchor".to_string(),
            }),
        ]
    }

    #[test]
    fn pkt_roundtrip() {
        for pkt in all_packets() {
            let mut data = vec![];
            pkt.lightning_encode(&mut data).unwrap();
            let decoded = Pkt::lightning_decode(&data[..]).unwrap();
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn pkt_case_matches_wire_assignment() {
        let cases: Vec<u16> =
            all_packets().iter().map(Pkt::pkt_case).collect();
        assert_eq!(cases, vec![
            50, 51, 20, 21, 22, 23, 2, 3, 4, 5, 6, 7, 8, 9, 30, 31, 40
        ]);
    }

    #[test]
    fn pkt_names_are_distinct() {
        let packets = all_packets();
        for (i, a) in packets.iter().enumerate() {
            for b in packets.iter().skip(i + 1) {
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
