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

//! Script construction for anchor and commitment outputs, plus transaction
//! signing helpers over the 2-of-2 anchor input.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey, Signature};
use bitcoin::{Script, SigHashType, Transaction, TxOut};

fn bitcoin_key(key: &PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey {
        compressed: true,
        key: *key,
    }
}

pub trait ScriptGenerators {
    /// 2-of-2 multisig between the two commitment keys, backing the anchor
    /// output. Key order is canonicalized so both sides derive the same
    /// script.
    fn redeem_2of2(amount: u64, ours: &PublicKey, theirs: &PublicKey) -> Self;

    /// Plain single-key settlement.
    fn redeem_single(amount: u64, key: &PublicKey) -> Self;

    /// Revocable to-self output: spendable by `instant_key` with the
    /// revocation preimage, or by `delayed_key` after `delay` seconds.
    fn secret_or_delay(
        amount: u64,
        delayed_key: &PublicKey,
        delay: u32,
        instant_key: &PublicKey,
        revocation_hash: &sha256::Hash,
    ) -> Self;

    /// HTLC offered by the owner of the commitment transaction.
    ///
    /// The recipient claims with the R preimage (or the revocation
    /// preimage); after the absolute expiry and the channel delay the funds
    /// return to the owner.
    fn htlc_offered(
        amount: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self;

    /// HTLC received by the owner of the commitment transaction.
    ///
    /// The owner claims with the R preimage after the channel delay; the
    /// peer reclaims after the absolute expiry or with the revocation
    /// preimage.
    fn htlc_received(
        amount: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self;
}

impl ScriptGenerators for Script {
    fn redeem_2of2(_: u64, ours: &PublicKey, theirs: &PublicKey) -> Self {
        let (first, second) = if ours.serialize() <= theirs.serialize() {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        script::Builder::new()
            .push_int(2)
            .push_key(&bitcoin_key(first))
            .push_key(&bitcoin_key(second))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    fn redeem_single(_: u64, key: &PublicKey) -> Self {
        script::Builder::new()
            .push_key(&bitcoin_key(key))
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    fn secret_or_delay(
        _: u64,
        delayed_key: &PublicKey,
        delay: u32,
        instant_key: &PublicKey,
        revocation_hash: &sha256::Hash,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_SHA256)
            .push_slice(&revocation_hash[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_key(&bitcoin_key(instant_key))
            .push_opcode(OP_ELSE)
            .push_int(delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin_key(delayed_key))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    fn htlc_offered(
        _: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self {
        // R preimage or revocation preimage pays the peer; expiry plus the
        // channel delay returns the escrow to us.
        script::Builder::new()
            .push_opcode(OP_SHA256)
            .push_opcode(OP_DUP)
            .push_slice(&rhash[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_SWAP)
            .push_slice(&revocation_hash[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_ADD)
            .push_opcode(OP_IF)
            .push_key(&bitcoin_key(theirkey))
            .push_opcode(OP_ELSE)
            .push_int(abs_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_int(delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin_key(ourkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    fn htlc_received(
        _: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_SHA256)
            .push_opcode(OP_DUP)
            .push_slice(&rhash[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_int(delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin_key(ourkey))
            .push_opcode(OP_ELSE)
            .push_slice(&revocation_hash[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOTIF)
            .push_int(abs_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_ENDIF)
            .push_key(&bitcoin_key(theirkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }
}

impl ScriptGenerators for TxOut {
    #[inline]
    fn redeem_2of2(amount: u64, ours: &PublicKey, theirs: &PublicKey) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::redeem_2of2(amount, ours, theirs).to_p2sh(),
        }
    }

    #[inline]
    fn redeem_single(amount: u64, key: &PublicKey) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::redeem_single(amount, key).to_p2sh(),
        }
    }

    #[inline]
    fn secret_or_delay(
        amount: u64,
        delayed_key: &PublicKey,
        delay: u32,
        instant_key: &PublicKey,
        revocation_hash: &sha256::Hash,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::secret_or_delay(
                amount,
                delayed_key,
                delay,
                instant_key,
                revocation_hash,
            )
            .to_p2sh(),
        }
    }

    #[inline]
    fn htlc_offered(
        amount: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::htlc_offered(
                amount,
                ourkey,
                theirkey,
                abs_expiry,
                delay,
                revocation_hash,
                rhash,
            )
            .to_p2sh(),
        }
    }

    #[inline]
    fn htlc_received(
        amount: u64,
        ourkey: &PublicKey,
        theirkey: &PublicKey,
        abs_expiry: u32,
        delay: u32,
        revocation_hash: &sha256::Hash,
        rhash: &sha256::Hash,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::htlc_received(
                amount,
                ourkey,
                theirkey,
                abs_expiry,
                delay,
                revocation_hash,
                rhash,
            )
            .to_p2sh(),
        }
    }
}

/// Signs the legacy P2SH sighash of `tx` input `input_index` under
/// `redeemscript` with SIGHASH_ALL.
pub fn sign_tx_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    redeemscript: &Script,
    key: &SecretKey,
) -> Signature {
    let sighash =
        tx.signature_hash(input_index, redeemscript, SigHashType::All.as_u32());
    let msg = Message::from_slice(&sighash[..])
        .expect("sighash is always 32 bytes");
    secp.sign(&msg, key)
}

/// Verifies `sig` over the legacy P2SH sighash of `tx` input `input_index`
/// under `redeemscript` against `key`.
pub fn check_tx_sig(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    redeemscript: &Script,
    key: &PublicKey,
    sig: &Signature,
) -> bool {
    let sighash =
        tx.signature_hash(input_index, redeemscript, SigHashType::All.as_u32());
    let msg = match Message::from_slice(&sighash[..]) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    secp.verify(&msg, sig, key).is_ok()
}

/// Locates the output of `tx` paying to the P2SH of `redeemscript`.
pub fn find_p2sh_out(tx: &Transaction, redeemscript: &Script) -> Option<u32> {
    let script_pubkey = redeemscript.to_p2sh();
    tx.output
        .iter()
        .position(|out| out.script_pubkey == script_pubkey)
        .map(|index| index as u32)
}

#[cfg(test)]
mod test {
    use bitcoin::{OutPoint, TxIn};

    use super::*;

    fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    fn dummy_tx(out: TxOut) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: Script::new(),
                sequence: 0xFFFFFFFF,
                witness: vec![],
            }],
            output: vec![out],
        }
    }

    #[test]
    fn redeem_2of2_is_symmetric() {
        let (_, key1) = keypair(0x31);
        let (_, key2) = keypair(0x32);
        assert_eq!(
            Script::redeem_2of2(0, &key1, &key2),
            Script::redeem_2of2(0, &key2, &key1)
        );
    }

    #[test]
    fn sign_then_check_verifies() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(0x41);
        let (_, other) = keypair(0x42);
        let redeem = Script::redeem_2of2(0, &pk, &other);
        let tx = dummy_tx(TxOut::redeem_single(1000, &pk));

        let sig = sign_tx_input(&secp, &tx, 0, &redeem, &sk);
        assert!(check_tx_sig(&secp, &tx, 0, &redeem, &pk, &sig));
        assert!(!check_tx_sig(&secp, &tx, 0, &redeem, &other, &sig));
    }

    #[test]
    fn find_p2sh_out_locates_output() {
        let (_, key1) = keypair(0x51);
        let (_, key2) = keypair(0x52);
        let redeem = Script::redeem_2of2(0, &key1, &key2);
        let tx = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![],
            output: vec![
                TxOut::redeem_single(500, &key1),
                TxOut::redeem_2of2(700, &key1, &key2),
            ],
        };
        assert_eq!(find_p2sh_out(&tx, &redeem), Some(1));

        let unrelated = Script::redeem_single(0, &key2);
        assert_eq!(find_p2sh_out(&tx, &unrelated), None);
    }
}
