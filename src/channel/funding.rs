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

//! Channel balance engine: pure accounting over the two-sided funding state.
//!
//! Every transition preserves the total number of millisatoshis locked in the
//! channel; a violation is a programming error and aborts the process.

use bitcoin::hashes::sha256;

/// A single hash-locked escrow entry funded by one side of the channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
#[display("htlc({msatoshis}, {expiry}, {rhash})")]
pub struct ChannelHtlc {
    /// Escrowed amount, in millisatoshi
    pub msatoshis: u64,

    /// Absolute expiry, in seconds since epoch
    pub expiry: u32,

    /// Hash whose preimage releases the escrow to the other side
    pub rhash: sha256::Hash,
}

/// One side of the channel funding state.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ChannelOneside {
    /// Unconditional payout to this side, in millisatoshi
    pub pay_msat: u64,

    /// Commitment fee share owed by this side, in millisatoshi
    pub fee_msat: u64,

    /// Escrow entries funded by this side, in the order they were added
    pub htlcs: Vec<ChannelHtlc>,
}

impl ChannelOneside {
    /// Total funds attributable to this side: payout, fee share and every
    /// escrowed HTLC.
    pub fn total_funds(&self) -> u64 {
        self.pay_msat
            + self.fee_msat
            + self.htlcs.iter().map(|h| h.msatoshis).sum::<u64>()
    }

    /// Appends an escrow entry funded by this side.
    pub fn add_htlc(&mut self, msatoshis: u64, expiry: u32, rhash: sha256::Hash) {
        self.htlcs.push(ChannelHtlc {
            msatoshis,
            expiry,
            rhash,
        });
    }

    /// Finds the index of the HTLC locked to `rhash`, if any.
    pub fn find_htlc(&self, rhash: &sha256::Hash) -> Option<usize> {
        self.htlcs.iter().position(|h| h.rhash == *rhash)
    }
}

/// The channel balance state: our side `a` and the peer's side `b`.
///
/// The peer holds the mirror image; [`ChannelState::invert`] converts between
/// the two views.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ChannelState {
    /// Our side of the channel
    pub a: ChannelOneside,

    /// The peer's side of the channel
    pub b: ChannelOneside,
}

impl ChannelState {
    /// Allocates the initial funding state. All funds and the whole
    /// commitment fee go to side `a` if `am_funder`, otherwise to side `b`.
    ///
    /// Returns `None` if the funder cannot cover the fee.
    pub fn initial_funding(
        am_funder: bool,
        anchor_satoshis: u64,
        fee_satoshis: u64,
    ) -> Option<ChannelState> {
        if fee_satoshis > anchor_satoshis {
            return None;
        }

        let mut state = ChannelState::default();
        state.a.pay_msat = (anchor_satoshis - fee_satoshis) * 1000;
        state.a.fee_msat = fee_satoshis * 1000;

        if !am_funder {
            state.invert();
        }
        Some(state)
    }

    /// Swaps the two sides, yielding the counter-party's view.
    pub fn invert(&mut self) {
        std::mem::swap(&mut self.a, &mut self.b);
    }

    /// Total funds locked in the channel across both sides.
    pub fn total(&self) -> u64 {
        self.a.total_funds() + self.b.total_funds()
    }
}

/// The commitment fee both sides settle on: the greater of the two proposals.
/// The funding side pays it.
#[inline]
pub fn commit_fee(us: u64, them: u64) -> u64 {
    us.max(them)
}

/// Moves funds between the two sides.
///
/// `delta_a_msat` is credited to side `a` and debited from side `b`;
/// `htlc_msat` is debited from side `a` towards escrow (the caller appends
/// the corresponding [`ChannelHtlc`] entry afterwards). Fee shares are
/// recomputed so that the funding side carries the whole commitment fee.
///
/// Returns `false` without mutating anything if any resulting balance would
/// be negative.
pub fn funding_delta(
    a_is_funder: bool,
    anchor_satoshis: u64,
    delta_a_msat: i64,
    htlc_msat: i64,
    a: &mut ChannelOneside,
    b: &mut ChannelOneside,
) -> bool {
    debug_assert_eq!(
        a.total_funds() + b.total_funds(),
        anchor_satoshis * 1000,
    );

    let fee = (a.fee_msat + b.fee_msat) as i64;
    let mut total_a = (a.pay_msat + a.fee_msat) as i64;
    let mut total_b = (b.pay_msat + b.fee_msat) as i64;

    total_a += delta_a_msat;
    total_b -= delta_a_msat;
    total_a -= htlc_msat;

    let (fee_a, fee_b) = if a_is_funder { (fee, 0) } else { (0, fee) };
    if total_a < fee_a || total_b < fee_b {
        return false;
    }

    a.pay_msat = (total_a - fee_a) as u64;
    a.fee_msat = fee_a as u64;
    b.pay_msat = (total_b - fee_b) as u64;
    b.fee_msat = fee_b as u64;
    true
}

/// Resolves the HTLC at `index` on `owner` in favour of the other side: the
/// escrowed amount becomes part of `beneficiary`'s payout.
pub fn funding_fulfill_htlc(
    owner: &mut ChannelOneside,
    beneficiary: &mut ChannelOneside,
    index: usize,
) {
    let htlc = owner.htlcs.remove(index);
    beneficiary.pay_msat += htlc.msatoshis;
}

/// Returns the HTLC at `index` to the side which funded it.
pub fn funding_fail_htlc(owner: &mut ChannelOneside, index: usize) {
    let htlc = owner.htlcs.remove(index);
    owner.pay_msat += htlc.msatoshis;
}
