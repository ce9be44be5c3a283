//! Provably-fair seed derivation and crash-point computation.
//!
//! ## Commit-reveal flow
//!
//! 1. **Derive** - the seed for chain index `n` is derived from a master
//!    secret: `seed[n] = HMAC_SHA256(master_secret, ascii(n))`
//! 2. **Commit** - `SHA256(seed[n])` is persisted and published before any
//!    round consumes index `n`
//! 3. **Reveal** - the seed is disclosed when its round crashes
//! 4. **Verify** - anyone can check `SHA256(reveal) == commit` and recompute
//!    the crash point from the reveal
//!
//! ## Determinism
//!
//! The crash point is a pure function of the seed (and an optional client
//! seed, empty by default): take the first 13 hex characters of
//! `HMAC_SHA256(seed, client_seed)` as a 52-bit integer `H`, let
//! `E = 2^52`, and truncate `(100·E − H)/(E − H)` to integer hundredths,
//! clamped to at least `1.00`. This is the widely used 52-bit crash
//! distribution (~1% house edge, about half of all rounds bust under
//! `2.00×`). Any party holding the reveal reproduces the exact multiplier
//! at which the round ended.

use crashline_types::Multiplier;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length of seeds and seed hashes in bytes.
pub const SEED_LEN: usize = 32;

const CRASH_SPACE: u64 = 1 << 52;

/// Compute the public commitment for a seed.
pub fn seed_hash(seed: &[u8; SEED_LEN]) -> [u8; SEED_LEN] {
    let digest = Sha256::digest(seed);
    digest.into()
}

/// Verify that a commitment matches a revealed seed.
pub fn verify_commitment(commit: &[u8; SEED_LEN], seed: &[u8; SEED_LEN]) -> bool {
    seed_hash(seed) == *commit
}

/// Derive the crash multiplier for a seed.
///
/// `client_seed` is the empty octet string unless a client-contributed
/// entropy extension is wired in.
pub fn derive_crash_point(seed: &[u8; SEED_LEN], client_seed: &[u8]) -> Multiplier {
    let mut mac = HmacSha256::new_from_slice(seed).expect("hmac accepts any key length");
    mac.update(client_seed);
    let digest = mac.finalize().into_bytes();

    // First 13 hex characters of the digest = its top 52 bits.
    let mut h: u64 = 0;
    for byte in &digest[..6] {
        h = (h << 8) | *byte as u64;
    }
    let h = (h << 4) | (digest[6] >> 4) as u64;

    if CRASH_SPACE <= h {
        return Multiplier::ONE;
    }

    let numerator = 100u128 * CRASH_SPACE as u128 - h as u128;
    let hundredths = numerator / (CRASH_SPACE - h) as u128;
    let hundredths = u64::try_from(hundredths).unwrap_or(u64::MAX);
    Multiplier::from_hundredths(hundredths.max(100))
}

/// Deterministic seed chain keyed by a master secret.
///
/// Restarting the process with the same secret reproduces every seed, so
/// commitments persisted before a restart remain redeemable.
#[derive(Clone)]
pub struct SeedChain {
    master_secret: Vec<u8>,
}

impl SeedChain {
    pub fn new(master_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    /// Recover the seed for a chain index: `HMAC_SHA256(master, ascii(idx))`.
    pub fn seed_for(&self, idx: i64) -> [u8; SEED_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.master_secret)
            .expect("hmac accepts any key length");
        mac.update(idx.to_string().as_bytes());
        mac.finalize().into_bytes().into()
    }
}

/// A fresh random seed for degraded operation without a master secret.
/// Commitments made from these cannot be re-derived after a restart.
pub fn ephemeral_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_round_trip() {
        let chain = SeedChain::new(b"test master secret".to_vec());
        for idx in 0..50 {
            let seed = chain.seed_for(idx);
            let commit = seed_hash(&seed);
            assert!(verify_commitment(&commit, &seed), "idx {idx}");
        }
    }

    #[test]
    fn tampered_seed_fails_verification() {
        let seed = SeedChain::new(b"secret".to_vec()).seed_for(1);
        let commit = seed_hash(&seed);
        let mut tampered = seed;
        tampered[0] ^= 0xff;
        assert!(!verify_commitment(&commit, &tampered));
    }

    #[test]
    fn chain_is_deterministic_and_index_sensitive() {
        let a = SeedChain::new(b"secret".to_vec());
        let b = SeedChain::new(b"secret".to_vec());
        assert_eq!(a.seed_for(7), b.seed_for(7));
        assert_ne!(a.seed_for(7), a.seed_for(8));

        let other = SeedChain::new(b"other secret".to_vec());
        assert_ne!(a.seed_for(7), other.seed_for(7));
    }

    #[test]
    fn crash_point_is_deterministic() {
        let seed = [7u8; SEED_LEN];
        assert_eq!(
            derive_crash_point(&seed, b""),
            derive_crash_point(&seed, b"")
        );
        assert_ne!(
            derive_crash_point(&seed, b""),
            derive_crash_point(&seed, b"client")
        );
    }

    #[test]
    fn crash_point_never_below_one() {
        let chain = SeedChain::new(b"floor check".to_vec());
        for idx in 0..2000 {
            let seed = chain.seed_for(idx);
            let crash = derive_crash_point(&seed, b"");
            assert!(crash >= Multiplier::ONE, "idx {idx} gave {crash}");
        }
    }

    #[test]
    fn crash_distribution_is_house_shaped() {
        // Roughly half of all rounds bust below 2.00x under the 52-bit
        // derivation; sanity-check the shape over a large sample.
        let chain = SeedChain::new(b"distribution".to_vec());
        let mut below_two = 0usize;
        let total = 5000usize;
        for idx in 0..total {
            let seed = chain.seed_for(idx as i64);
            if derive_crash_point(&seed, b"").hundredths() < 200 {
                below_two += 1;
            }
        }
        let ratio = below_two as f64 / total as f64;
        assert!(
            (0.40..=0.60).contains(&ratio),
            "unexpected bust ratio {ratio}"
        );
    }

    #[test]
    fn ephemeral_seeds_are_unique() {
        let a = ephemeral_seed();
        let b = ephemeral_seed();
        assert_ne!(a, b);
    }
}
