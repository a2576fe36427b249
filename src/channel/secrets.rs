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

//! Per-peer secret material: the channel keys and the deterministic
//! revocation preimage chain.

use bitcoin::hashes::{sha256, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};

/// Secret material owned by one peer relationship.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerSecrets {
    commit: SecretKey,
    finalkey: SecretKey,
    revocation_seed: [u8; 32],
}

impl PeerSecrets {
    /// Assembles the peer secrets from externally generated key material.
    /// Key generation itself belongs to the embedding daemon.
    pub fn with(
        commit: SecretKey,
        finalkey: SecretKey,
        revocation_seed: [u8; 32],
    ) -> PeerSecrets {
        PeerSecrets {
            commit,
            finalkey,
            revocation_seed,
        }
    }

    /// Public key for the 2-of-2 anchor input.
    pub fn commit_pubkey(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.commit)
    }

    /// Public key for settlement outputs.
    pub fn final_pubkey(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.finalkey)
    }

    /// Secret key signing commitment transactions.
    pub fn commit_key(&self) -> &SecretKey {
        &self.commit
    }

    /// Preimage of the revocation hash for commitment `index`.
    ///
    /// The chain is deterministic in the seed; a preimage must only be
    /// disclosed once the commitment it retires has been replaced by a
    /// signed successor.
    pub fn revocation_preimage(&self, index: u64) -> sha256::Hash {
        let mut engine =
            HmacEngine::<sha256::Hash>::new(&self.revocation_seed[..]);
        engine.input(&index.to_le_bytes());
        let hmac = Hmac::<sha256::Hash>::from_engine(engine);
        sha256::Hash::from_inner(hmac.into_inner())
    }

    /// Revocation hash for commitment `index`: the SHA-256 of its preimage.
    pub fn revocation_hash(&self, index: u64) -> sha256::Hash {
        sha256::Hash::hash(&self.revocation_preimage(index)[..])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn secrets() -> PeerSecrets {
        PeerSecrets::with(
            SecretKey::from_slice(&[0x21; 32]).unwrap(),
            SecretKey::from_slice(&[0x22; 32]).unwrap(),
            [0x23; 32],
        )
    }

    #[test]
    fn preimage_hashes_to_revocation_hash() {
        let secrets = secrets();
        for index in 0..16u64 {
            let preimage = secrets.revocation_preimage(index);
            assert_eq!(
                sha256::Hash::hash(&preimage[..]),
                secrets.revocation_hash(index)
            );
        }
    }

    #[test]
    fn preimages_are_deterministic_and_distinct() {
        let secrets = secrets();
        assert_eq!(
            secrets.revocation_preimage(7),
            secrets.revocation_preimage(7)
        );
        assert_ne!(
            secrets.revocation_preimage(7),
            secrets.revocation_preimage(8)
        );

        let other = PeerSecrets::with(
            SecretKey::from_slice(&[0x21; 32]).unwrap(),
            SecretKey::from_slice(&[0x22; 32]).unwrap(),
            [0x42; 32],
        );
        assert_ne!(
            secrets.revocation_preimage(0),
            other.revocation_preimage(0)
        );
    }
}
