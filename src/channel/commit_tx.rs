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

//! Deterministic construction of the commitment transaction pair and of the
//! mutual close transaction, all spending the 2-of-2 anchor output.

use bitcoin::hashes::sha256;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Script, Transaction, TxIn, TxOut, Txid};

use super::funding::ChannelState;
use super::script::ScriptGenerators;

/// The confirmed anchor backing the channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display("{txid}:{output_index} ({satoshis} sat)")]
pub struct Anchor {
    /// Anchor transaction id
    pub txid: Txid,

    /// Output index of the channel funds
    pub output_index: u32,

    /// Value of the anchor output, in satoshis
    pub satoshis: u64,
}

impl Anchor {
    /// The outpoint every commitment transaction spends.
    #[inline]
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.output_index,
        }
    }
}

/// Per-side parameters consumed by the commitment builder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommitKeys {
    /// Settlement key of this side
    pub final_key: PublicKey,

    /// Relative delay this side demands of the peer's to-self output, in
    /// seconds
    pub delay: u32,
}

fn anchor_input(anchor: &Anchor) -> TxIn {
    TxIn {
        previous_output: anchor.outpoint(),
        script_sig: Script::new(),
        sequence: 0xFFFFFFFF,
        witness: vec![],
    }
}

/// Builds one commitment transaction from the owner's point of view
/// (`cstate.a` is the owner's side). The owner's to-self output and offered
/// HTLCs are guarded by `revocation_hash` and delayed by `self_delay`.
fn create_commit_tx(
    anchor: &Anchor,
    self_final: &PublicKey,
    other_final: &PublicKey,
    self_delay: u32,
    revocation_hash: &sha256::Hash,
    cstate: &ChannelState,
) -> Transaction {
    let mut output = vec![];

    if cstate.a.pay_msat / 1000 > 0 {
        output.push(TxOut::secret_or_delay(
            cstate.a.pay_msat / 1000,
            self_final,
            self_delay,
            other_final,
            revocation_hash,
        ));
    }
    if cstate.b.pay_msat / 1000 > 0 {
        output.push(TxOut::redeem_single(cstate.b.pay_msat / 1000, other_final));
    }
    for htlc in &cstate.a.htlcs {
        output.push(TxOut::htlc_offered(
            htlc.msatoshis / 1000,
            self_final,
            other_final,
            htlc.expiry,
            self_delay,
            revocation_hash,
            &htlc.rhash,
        ));
    }
    for htlc in &cstate.b.htlcs {
        output.push(TxOut::htlc_received(
            htlc.msatoshis / 1000,
            self_final,
            other_final,
            htlc.expiry,
            self_delay,
            revocation_hash,
            &htlc.rhash,
        ));
    }

    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![anchor_input(anchor)],
        output,
    }
}

/// Builds the commitment transaction pair for the current balance state:
/// ours guarded by `our_revocation_hash`, theirs (over the inverted state)
/// by `their_revocation_hash`. Output identities and ordering are fully
/// determined by `cstate`.
pub fn make_commit_txs(
    anchor: &Anchor,
    us: &CommitKeys,
    them: &CommitKeys,
    our_revocation_hash: &sha256::Hash,
    their_revocation_hash: &sha256::Hash,
    cstate: &ChannelState,
) -> (Transaction, Transaction) {
    // Each side's to-self output matures over the delay the *peer* demanded.
    let our_commit = create_commit_tx(
        anchor,
        &us.final_key,
        &them.final_key,
        them.delay,
        our_revocation_hash,
        cstate,
    );

    let mut inverted = cstate.clone();
    inverted.invert();
    let their_commit = create_commit_tx(
        anchor,
        &them.final_key,
        &us.final_key,
        us.delay,
        their_revocation_hash,
        &inverted,
    );

    (our_commit, their_commit)
}

/// Builds the mutual close transaction: one plain output per side paying its
/// current balance, the funder's output first so both sides derive the same
/// transaction. The commitment fee stays with the anchor input.
pub fn make_close_tx(
    anchor: &Anchor,
    our_script: &Script,
    their_script: &Script,
    we_are_funder: bool,
    cstate: &ChannelState,
) -> Transaction {
    let ours = TxOut {
        value: cstate.a.pay_msat / 1000,
        script_pubkey: our_script.clone(),
    };
    let theirs = TxOut {
        value: cstate.b.pay_msat / 1000,
        script_pubkey: their_script.clone(),
    };

    let ordered = if we_are_funder {
        vec![ours, theirs]
    } else {
        vec![theirs, ours]
    };

    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![anchor_input(anchor)],
        output: ordered.into_iter().filter(|out| out.value > 0).collect(),
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::super::funding::funding_delta;
    use super::*;

    fn key(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[seed; 32]).unwrap(),
        )
    }

    fn anchor() -> Anchor {
        Anchor {
            txid: Txid::hash(b"anchor"),
            output_index: 1,
            satoshis: 1000,
        }
    }

    fn sides() -> (CommitKeys, CommitKeys) {
        (
            CommitKeys {
                final_key: key(0x61),
                delay: 3600,
            },
            CommitKeys {
                final_key: key(0x62),
                delay: 7200,
            },
        )
    }

    #[test]
    fn commit_pair_is_deterministic() {
        let (us, them) = sides();
        let cstate = ChannelState::initial_funding(true, 1000, 100).unwrap();
        let ours_hash = sha256::Hash::hash(b"ours");
        let theirs_hash = sha256::Hash::hash(b"theirs");

        let pair1 =
            make_commit_txs(&anchor(), &us, &them, &ours_hash, &theirs_hash, &cstate);
        let pair2 =
            make_commit_txs(&anchor(), &us, &them, &ours_hash, &theirs_hash, &cstate);
        assert_eq!(pair1, pair2);
    }

    #[test]
    fn commit_outputs_follow_cstate() {
        let (us, them) = sides();
        let mut cstate = ChannelState::initial_funding(true, 1000, 100).unwrap();
        assert!(funding_delta(
            true,
            1000,
            0,
            300_000,
            &mut cstate.a,
            &mut cstate.b
        ));
        cstate
            .a
            .add_htlc(300_000, 1_500_000_000, sha256::Hash::hash(b"r"));

        let (ours, theirs) = make_commit_txs(
            &anchor(),
            &us,
            &them,
            &sha256::Hash::hash(b"ours"),
            &sha256::Hash::hash(b"theirs"),
            &cstate,
        );

        // Our side pays 600 sat to self and escrows 300 sat; their payout is
        // zero and thus omitted.
        assert_eq!(ours.output.len(), 2);
        assert_eq!(ours.output[0].value, 600);
        assert_eq!(ours.output[1].value, 300);
        assert_eq!(ours.input[0].previous_output, anchor().outpoint());

        // The peer's commitment is built over the inverted state.
        assert_eq!(theirs.output.len(), 2);
        assert_eq!(theirs.output[0].value, 600);
        assert_eq!(theirs.output[1].value, 300);
        assert_ne!(ours.output[0].script_pubkey, theirs.output[0].script_pubkey);
    }

    #[test]
    fn commit_outputs_conserve_anchor_minus_fee() {
        let (us, them) = sides();
        let cstate = ChannelState::initial_funding(true, 1000, 100).unwrap();
        let (ours, _) = make_commit_txs(
            &anchor(),
            &us,
            &them,
            &sha256::Hash::hash(b"a"),
            &sha256::Hash::hash(b"b"),
            &cstate,
        );
        let total: u64 = ours.output.iter().map(|out| out.value).sum();
        assert_eq!(total, anchor().satoshis - 100);
    }

    #[test]
    fn close_tx_orders_funder_first() {
        let (us, them) = sides();
        let mut cstate = ChannelState::initial_funding(true, 1000, 100).unwrap();
        assert!(funding_delta(
            true,
            1000,
            -200_000,
            0,
            &mut cstate.a,
            &mut cstate.b
        ));

        let our_script = Script::redeem_single(0, &us.final_key).to_p2sh();
        let their_script = Script::redeem_single(0, &them.final_key).to_p2sh();

        let close =
            make_close_tx(&anchor(), &our_script, &their_script, true, &cstate);
        assert_eq!(close.output[0].script_pubkey, our_script);
        assert_eq!(close.output[0].value, 700);
        assert_eq!(close.output[1].script_pubkey, their_script);
        assert_eq!(close.output[1].value, 200);

        // The peer builds the identical transaction from its own view.
        let mut mirrored = cstate.clone();
        mirrored.invert();
        let close_theirs = make_close_tx(
            &anchor(),
            &their_script,
            &our_script,
            false,
            &mirrored,
        );
        assert_eq!(close, close_theirs);
    }
}
