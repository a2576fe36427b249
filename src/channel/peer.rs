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

//! The per-peer channel protocol state machine.
//!
//! Inbound packets and local commands are validated against the current
//! state, produce outbound packets and advance the channel. Any protocol
//! failure emits a single `error` packet and abandons the channel; a broken
//! fund-conservation invariant aborts the process.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, Signature};
use bitcoin::{Script, Transaction};
use p2p::{
    AnchorOffer, CloseShutdown, CloseSignature, Locktime, NodeId, OpenAnchor,
    OpenChannel, OpenCommitSig, OpenComplete, Pkt, UpdateAccept,
    UpdateAddHtlc, UpdateComplete, UpdateFailHtlc, UpdateFulfillHtlc,
    UpdateSignature,
};

use super::commit_tx::{make_close_tx, make_commit_txs, Anchor, CommitKeys};
use super::funding::{
    commit_fee, funding_delta, funding_fail_htlc, funding_fulfill_htlc,
    ChannelState,
};
use super::script::{
    check_tx_sig, find_p2sh_out, sign_tx_input, ScriptGenerators,
};
use super::secrets::PeerSecrets;
use crate::daemon::Config;

/// Channel lifecycle: states of the peer protocol state machine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum StateName {
    /// Peer created, no packets exchanged yet
    #[display("INIT")]
    Init,

    /// Our `open` is out; waiting for the peer's
    #[display("OPEN_WAIT_FOR_OPEN")]
    OpenWaitForOpen,

    /// Non-funder waiting for the funder's `open_anchor`
    #[display("OPEN_WAIT_FOR_ANCHOR")]
    OpenWaitForAnchor,

    /// Funder waiting for the wallet to hand over the anchor transaction
    #[display("OPEN_WAIT_FOR_ANCHOR_CREATE")]
    OpenWaitForAnchorCreate,

    /// Funder waiting for the non-funder's `open_commit_sig`
    #[display("OPEN_WAIT_FOR_COMMIT_SIG")]
    OpenWaitForCommitSig,

    /// Waiting for the anchor to reach the required depth on both sides
    #[display("OPEN_WAITING_ANCHOR_CONF")]
    OpenWaitingAnchorConf,

    /// Channel live, no update in flight
    #[display("NORMAL")]
    Normal,

    /// We proposed an update; waiting for `update_accept`
    #[display("WAIT_FOR_HTLC_ACCEPT")]
    WaitForHtlcAccept,

    /// Peer proposed an update; we accepted and wait for `update_signature`
    #[display("WAIT_FOR_UPDATE_SIG")]
    WaitForUpdateSig,

    /// We counter-signed; waiting for the peer's `update_complete`
    #[display("WAIT_FOR_UPDATE_COMPLETE")]
    WaitForUpdateComplete,

    /// Cooperative close in progress
    #[display("CLOSING")]
    Closing,

    /// Channel settled
    #[display("CLOSED")]
    Closed,

    /// Protocol failure; channel abandoned
    #[display("ERROR")]
    Error,
}

/// Peer protocol failures. The rendered message is the observable `problem`
/// string carried by the outbound `error` packet.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ProtocolError {
    /// Delay in blocks not accepted
    DelayInBlocks,

    /// Delay too great
    DelayTooGreat,

    /// min_depth too great
    MinDepthTooGreat,

    /// Commitment fee too low
    CommitmentFeeTooLow,

    /// Only one side can offer anchor
    OneSideAnchor,

    /// Insufficient funds for fee
    InsufficientFundsForFee,

    /// Anchor transaction does not fund the channel
    BadAnchor,

    /// Bad signature
    BadSignature,

    /// Bad revocation preimage
    BadRevocationPreimage,

    /// Invalid HTLC expiry
    InvalidHtlcExpiry,

    /// Cannot afford {0} milli-satoshis
    CannotAfford(u64),

    /// Unknown HTLC
    UnknownHtlc,

    /// Another update is already in flight
    UpdateInFlight,

    /// Channel is not ready for updates
    ChannelNotReady,

    /// Cannot close with HTLCs in flight
    CloseWithHtlcsInFlight,

    /// Unexpected packet {0}
    UnexpectedPacket(&'static str),
}

/// What a staged update does to the balance state once installed.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum HtlcStage {
    /// A new escrow entry
    #[display("add({msatoshis} msat, expiry {expiry}, {rhash})")]
    Add {
        msatoshis: u64,
        rhash: sha256::Hash,
        expiry: u32,
    },

    /// Redemption of an escrow entry by its preimage
    #[display("fulfill({r})")]
    Fulfill { r: sha256::Hash },

    /// Return of an escrow entry to its offerer
    #[display("fail({rhash})")]
    Fail { rhash: sha256::Hash },
}

/// The single in-flight update: the proposed balance state, the commitment
/// pair built over it and the revocation hashes replacing the current ones.
/// Installed all-or-nothing once every verification passed.
#[derive(Clone, Debug)]
pub struct HtlcProgress {
    pub stage: HtlcStage,
    pub cstate: ChannelState,
    pub our_revocation_hash: sha256::Hash,
    pub their_revocation_hash: Option<sha256::Hash>,
    pub our_commit: Option<Transaction>,
    pub their_commit: Option<Transaction>,
}

/// The symmetric per-side channel record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SideParams {
    /// Key on the 2-of-2 anchor input
    pub commit_key: PublicKey,

    /// Key settlement outputs pay to
    pub final_key: PublicKey,

    /// Hash of this side's current revocation preimage
    pub revocation_hash: sha256::Hash,

    /// Relative delay this side demands of the peer, in seconds
    pub locktime: u32,

    /// Anchor confirmations this side requires
    pub mindepth: u32,

    /// Commitment fee this side proposed, in satoshis
    pub commit_fee: u64,

    /// Which side funds the anchor
    pub offer_anchor: AnchorOffer,

    /// This side's current commitment transaction
    pub commit: Option<Transaction>,
}

/// A peer relationship carrying at most one channel.
pub struct Peer {
    /// Peer node identity
    pub id: NodeId,

    /// Current protocol state
    pub state: StateName,

    /// Our side of the channel
    pub us: SideParams,

    /// The peer's side, populated from its `open` packet
    pub them: Option<SideParams>,

    /// The confirmed anchor outpoint
    pub anchor: Option<Anchor>,

    /// Current balance state
    pub cstate: Option<ChannelState>,

    /// The single in-flight update, if any
    pub current_htlc: Option<HtlcProgress>,

    /// Number of completed updates; index of the current commitment
    pub num_htlcs: u64,

    secrets: PeerSecrets,
    anchor_redeemscript: Option<Script>,
    their_prev_revocation_hash: Option<sha256::Hash>,
    anchor_depth_ok: bool,
    sent_open_complete: bool,
    recv_open_complete: bool,
    our_close_script: Option<Script>,
    their_close_script: Option<Script>,
}

impl Peer {
    /// Creates the peer record with our side of the prospective channel.
    pub fn new(
        id: NodeId,
        secp: &Secp256k1<All>,
        secrets: PeerSecrets,
        offer_anchor: AnchorOffer,
        locktime: u32,
        mindepth: u32,
        commit_fee: u64,
    ) -> Peer {
        let us = SideParams {
            commit_key: secrets.commit_pubkey(secp),
            final_key: secrets.final_pubkey(secp),
            revocation_hash: secrets.revocation_hash(0),
            locktime,
            mindepth,
            commit_fee,
            offer_anchor,
            commit: None,
        };
        Peer {
            id,
            state: StateName::Init,
            us,
            them: None,
            anchor: None,
            cstate: None,
            current_htlc: None,
            num_htlcs: 0,
            secrets,
            anchor_redeemscript: None,
            their_prev_revocation_hash: None,
            anchor_depth_ok: false,
            sent_open_complete: false,
            recv_open_complete: false,
            our_close_script: None,
            their_close_script: None,
        }
    }

    /// The 2-of-2 anchor redeem script, known once `open` was exchanged.
    pub fn anchor_redeemscript(&self) -> Option<&Script> {
        self.anchor_redeemscript.as_ref()
    }

    fn them(&self) -> &SideParams {
        self.them
            .as_ref()
            .expect("peer parameters are set after open")
    }

    fn redeemscript(&self) -> Script {
        self.anchor_redeemscript
            .clone()
            .expect("anchor redeemscript is built on open")
    }

    fn us_is_funder(&self) -> bool {
        self.us.offer_anchor == AnchorOffer::WillCreateAnchor
    }

    fn commit_keys(&self) -> (CommitKeys, CommitKeys) {
        let them = self.them();
        (
            CommitKeys {
                final_key: self.us.final_key,
                delay: self.us.locktime,
            },
            CommitKeys {
                final_key: them.final_key,
                delay: them.locktime,
            },
        )
    }

    fn anchor(&self) -> Anchor {
        self.anchor.expect("anchor is recorded before commitments")
    }

    fn cstate(&self) -> &ChannelState {
        self.cstate
            .as_ref()
            .expect("channel state exists once the channel is funded")
    }

    fn require_normal_idle(&self) -> Result<(), ProtocolError> {
        if self.current_htlc.is_some() {
            return Err(ProtocolError::UpdateInFlight);
        }
        if self.state != StateName::Normal {
            return Err(ProtocolError::ChannelNotReady);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local commands

    /// Starts the open handshake, producing our `open` packet.
    pub fn open_channel(&mut self) -> Result<Pkt, ProtocolError> {
        if self.state != StateName::Init {
            return Err(ProtocolError::ChannelNotReady);
        }
        self.state = StateName::OpenWaitForOpen;
        Ok(Pkt::Open(OpenChannel {
            revocation_hash: self.us.revocation_hash,
            commit_key: self.us.commit_key,
            final_key: self.us.final_key,
            delay: Locktime::Seconds(self.us.locktime),
            commitment_fee: self.us.commit_fee,
            anch: self.us.offer_anchor,
            min_depth: self.us.mindepth,
        }))
    }

    /// Funder only: the wallet created the anchor transaction. Records the
    /// outpoint, builds the initial state and commitment pair, and produces
    /// `open_anchor` carrying our signature over the peer's commitment.
    pub fn anchor_created(
        &mut self,
        secp: &Secp256k1<All>,
        tx: &Transaction,
    ) -> Result<Pkt, ProtocolError> {
        if self.state != StateName::OpenWaitForAnchorCreate {
            return Err(ProtocolError::ChannelNotReady);
        }
        let redeemscript = self.redeemscript();
        let output_index = find_p2sh_out(tx, &redeemscript)
            .ok_or(ProtocolError::BadAnchor)?;
        let anchor = Anchor {
            txid: tx.txid(),
            output_index,
            satoshis: tx.output[output_index as usize].value,
        };

        let fee = commit_fee(self.us.commit_fee, self.them().commit_fee);
        let cstate =
            ChannelState::initial_funding(true, anchor.satoshis, fee)
                .ok_or(ProtocolError::InsufficientFundsForFee)?;

        let (us_keys, them_keys) = self.commit_keys();
        let (our_commit, their_commit) = make_commit_txs(
            &anchor,
            &us_keys,
            &them_keys,
            &self.us.revocation_hash,
            &self.them().revocation_hash,
            &cstate,
        );

        let commit_sig = sign_tx_input(
            secp,
            &their_commit,
            0,
            &redeemscript,
            self.secrets.commit_key(),
        );

        self.anchor = Some(anchor);
        self.cstate = Some(cstate);
        self.us.commit = Some(our_commit);
        if let Some(them) = self.them.as_mut() {
            them.commit = Some(their_commit);
        }
        self.state = StateName::OpenWaitForCommitSig;

        Ok(Pkt::OpenAnchor(OpenAnchor {
            txid: anchor.txid,
            output_index: anchor.output_index,
            amount: anchor.satoshis,
            commit_sig,
        }))
    }

    /// The chain watcher observed the anchor at the required depth.
    pub fn anchor_confirmed(&mut self) -> Option<Pkt> {
        if self.state != StateName::OpenWaitingAnchorConf {
            return None;
        }
        self.anchor_depth_ok = true;
        let out = if self.sent_open_complete {
            None
        } else {
            self.sent_open_complete = true;
            Some(Pkt::OpenComplete(OpenComplete {}))
        };
        self.maybe_channel_live();
        out
    }

    /// Proposes a new HTLC escrowed from our side.
    pub fn add_htlc(
        &mut self,
        msatoshis: u64,
        expiry: u32,
        rhash: sha256::Hash,
    ) -> Result<Pkt, ProtocolError> {
        self.require_normal_idle()?;
        if expiry < 500_000_000 {
            return Err(ProtocolError::InvalidHtlcExpiry);
        }

        let mut cstate = self.cstate().clone();
        if !funding_delta(
            self.us_is_funder(),
            self.anchor().satoshis,
            0,
            msatoshis as i64,
            &mut cstate.a,
            &mut cstate.b,
        ) {
            return Err(ProtocolError::CannotAfford(msatoshis));
        }
        cstate.a.add_htlc(msatoshis, expiry, rhash);

        let revocation_hash = self.stage_our_update(
            HtlcStage::Add {
                msatoshis,
                rhash,
                expiry,
            },
            cstate,
        );
        Ok(Pkt::UpdateAddHtlc(UpdateAddHtlc {
            revocation_hash,
            amount_msat: msatoshis,
            r_hash: rhash,
            expiry: Locktime::Seconds(expiry),
        }))
    }

    /// Redeems an HTLC the peer escrowed towards us by revealing `r`.
    pub fn fulfill_htlc(
        &mut self,
        r: sha256::Hash,
    ) -> Result<Pkt, ProtocolError> {
        self.require_normal_idle()?;
        let rhash = sha256::Hash::hash(&r[..]);
        let index = self
            .cstate()
            .b
            .find_htlc(&rhash)
            .ok_or(ProtocolError::UnknownHtlc)?;

        let mut cstate = self.cstate().clone();
        funding_fulfill_htlc(&mut cstate.b, &mut cstate.a, index);

        let revocation_hash =
            self.stage_our_update(HtlcStage::Fulfill { r }, cstate);
        Ok(Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc {
            revocation_hash,
            r,
        }))
    }

    /// Returns an HTLC the peer escrowed towards us back to the peer.
    pub fn fail_htlc(
        &mut self,
        rhash: sha256::Hash,
    ) -> Result<Pkt, ProtocolError> {
        self.require_normal_idle()?;
        let index = self
            .cstate()
            .b
            .find_htlc(&rhash)
            .ok_or(ProtocolError::UnknownHtlc)?;

        let mut cstate = self.cstate().clone();
        funding_fail_htlc(&mut cstate.b, index);

        let revocation_hash =
            self.stage_our_update(HtlcStage::Fail { rhash }, cstate);
        Ok(Pkt::UpdateFailHtlc(UpdateFailHtlc {
            revocation_hash,
            r_hash: rhash,
        }))
    }

    /// Initiates a cooperative close.
    pub fn close(&mut self) -> Result<Pkt, ProtocolError> {
        self.require_normal_idle()?;
        let cstate = self.cstate();
        if !cstate.a.htlcs.is_empty() || !cstate.b.htlcs.is_empty() {
            return Err(ProtocolError::CloseWithHtlcsInFlight);
        }
        let script = Script::redeem_single(0, &self.us.final_key).to_p2sh();
        self.our_close_script = Some(script.clone());
        self.state = StateName::Closing;
        Ok(Pkt::CloseShutdown(CloseShutdown {
            script_pubkey: script,
        }))
    }

    fn stage_our_update(
        &mut self,
        stage: HtlcStage,
        cstate: ChannelState,
    ) -> sha256::Hash {
        debug!("peer {}: proposing {}", self.id, stage);
        let our_revocation_hash =
            self.secrets.revocation_hash(self.num_htlcs + 1);
        self.current_htlc = Some(HtlcProgress {
            stage,
            cstate,
            our_revocation_hash,
            their_revocation_hash: None,
            our_commit: None,
            their_commit: None,
        });
        self.state = StateName::WaitForHtlcAccept;
        our_revocation_hash
    }

    // ------------------------------------------------------------------
    // Inbound dispatch

    /// Classifies and processes one inbound packet against the current
    /// state. Returns the packets to send in reply; on a protocol error the
    /// reply is a single `error` packet and the channel is abandoned.
    pub fn process_pkt(
        &mut self,
        cfg: &Config,
        secp: &Secp256k1<All>,
        pkt: &Pkt,
    ) -> Vec<Pkt> {
        if let Pkt::Error(err) = pkt {
            error!("peer {} reported: {}", self.id, err.problem);
            self.current_htlc = None;
            self.state = StateName::Error;
            return vec![];
        }

        debug!("peer {}: {} in state {}", self.id, pkt.name(), self.state);
        let result = match (self.state, pkt) {
            (StateName::OpenWaitForOpen, Pkt::Open(open)) => {
                self.accept_pkt_open(cfg, open)
            }
            (StateName::OpenWaitForAnchor, Pkt::OpenAnchor(anchor)) => {
                self.accept_pkt_anchor(secp, anchor)
            }
            (StateName::OpenWaitForCommitSig, Pkt::OpenCommitSig(sig)) => {
                self.accept_pkt_open_commit_sig(secp, sig)
            }
            (StateName::OpenWaitingAnchorConf, Pkt::OpenComplete(_)) => {
                self.accept_pkt_open_complete()
            }
            (StateName::Normal, Pkt::UpdateAddHtlc(update)) => {
                self.accept_pkt_htlc_update(secp, update)
            }
            (StateName::Normal, Pkt::UpdateFulfillHtlc(update)) => {
                self.accept_pkt_htlc_fulfill(secp, update)
            }
            (StateName::Normal, Pkt::UpdateFailHtlc(update)) => {
                self.accept_pkt_htlc_fail(secp, update)
            }
            (StateName::WaitForHtlcAccept, Pkt::UpdateAccept(accept)) => {
                self.accept_pkt_update_accept(secp, accept)
            }
            (StateName::WaitForUpdateSig, Pkt::UpdateSignature(sig)) => {
                self.accept_pkt_update_signature(secp, sig)
            }
            (StateName::WaitForUpdateComplete, Pkt::UpdateComplete(done)) => {
                self.accept_pkt_update_complete(done)
            }
            (StateName::Normal, Pkt::CloseShutdown(close))
            | (StateName::Closing, Pkt::CloseShutdown(close)) => {
                self.accept_pkt_close_shutdown(secp, close)
            }
            (StateName::Closing, Pkt::CloseSignature(close)) => {
                self.accept_pkt_close_signature(secp, close)
            }
            _ => Err(ProtocolError::UnexpectedPacket(pkt.name())),
        };

        match result {
            Ok(out) => out,
            Err(problem) => {
                error!("peer {}: {}", self.id, problem);
                self.current_htlc = None;
                self.state = StateName::Error;
                vec![Pkt::Error(p2p::Error {
                    problem: problem.to_string(),
                })]
            }
        }
    }

    fn accept_pkt_open(
        &mut self,
        cfg: &Config,
        open: &OpenChannel,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let delay = match open.delay {
            Locktime::Seconds(secs) => secs,
            Locktime::Blocks(_) => return Err(ProtocolError::DelayInBlocks),
        };
        if delay > cfg.rel_locktime_max {
            return Err(ProtocolError::DelayTooGreat);
        }
        if open.min_depth > cfg.anchor_confirms_max {
            return Err(ProtocolError::MinDepthTooGreat);
        }
        if open.commitment_fee < cfg.commitment_fee_min {
            return Err(ProtocolError::CommitmentFeeTooLow);
        }
        if open.anch == self.us.offer_anchor {
            return Err(ProtocolError::OneSideAnchor);
        }

        self.them = Some(SideParams {
            commit_key: open.commit_key,
            final_key: open.final_key,
            revocation_hash: open.revocation_hash,
            locktime: delay,
            mindepth: open.min_depth,
            commit_fee: open.commitment_fee,
            offer_anchor: open.anch,
            commit: None,
        });
        self.anchor_redeemscript = Some(Script::redeem_2of2(
            0,
            &self.us.commit_key,
            &open.commit_key,
        ));

        self.state = if self.us_is_funder() {
            StateName::OpenWaitForAnchorCreate
        } else {
            StateName::OpenWaitForAnchor
        };
        Ok(vec![])
    }

    fn accept_pkt_anchor(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &OpenAnchor,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        assert!(!self.us_is_funder(), "only the funder announces an anchor");

        let anchor = Anchor {
            txid: pkt.txid,
            output_index: pkt.output_index,
            satoshis: pkt.amount,
        };

        // The funder's view of the state, inverted to ours.
        let fee = commit_fee(self.them().commit_fee, self.us.commit_fee);
        let mut cstate =
            ChannelState::initial_funding(true, anchor.satoshis, fee)
                .ok_or(ProtocolError::InsufficientFundsForFee)?;
        cstate.invert();

        let (us_keys, them_keys) = self.commit_keys();
        let (our_commit, their_commit) = make_commit_txs(
            &anchor,
            &us_keys,
            &them_keys,
            &self.us.revocation_hash,
            &self.them().revocation_hash,
            &cstate,
        );

        let redeemscript = self.redeemscript();
        if !check_tx_sig(
            secp,
            &our_commit,
            0,
            &redeemscript,
            &self.them().commit_key,
            &pkt.commit_sig,
        ) {
            return Err(ProtocolError::BadSignature);
        }

        let sig = sign_tx_input(
            secp,
            &their_commit,
            0,
            &redeemscript,
            self.secrets.commit_key(),
        );

        self.anchor = Some(anchor);
        self.cstate = Some(cstate);
        self.us.commit = Some(our_commit);
        if let Some(them) = self.them.as_mut() {
            them.commit = Some(their_commit);
        }
        self.state = StateName::OpenWaitingAnchorConf;

        Ok(vec![Pkt::OpenCommitSig(OpenCommitSig { sig })])
    }

    fn accept_pkt_open_commit_sig(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &OpenCommitSig,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let our_commit = self
            .us
            .commit
            .clone()
            .expect("funder builds commitments before open_anchor");
        if !check_tx_sig(
            secp,
            &our_commit,
            0,
            &self.redeemscript(),
            &self.them().commit_key,
            &pkt.sig,
        ) {
            return Err(ProtocolError::BadSignature);
        }
        self.state = StateName::OpenWaitingAnchorConf;
        Ok(vec![])
    }

    fn accept_pkt_open_complete(&mut self) -> Result<Vec<Pkt>, ProtocolError> {
        self.recv_open_complete = true;
        let out = if self.anchor_depth_ok && !self.sent_open_complete {
            self.sent_open_complete = true;
            vec![Pkt::OpenComplete(OpenComplete {})]
        } else {
            vec![]
        };
        self.maybe_channel_live();
        Ok(out)
    }

    fn maybe_channel_live(&mut self) {
        if self.anchor_depth_ok
            && self.sent_open_complete
            && self.recv_open_complete
        {
            info!("peer {}: channel live", self.id);
            self.state = StateName::Normal;
        }
    }

    fn accept_pkt_htlc_update(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &UpdateAddHtlc,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let expiry = pkt
            .expiry
            .seconds()
            .filter(|secs| *secs >= 500_000_000)
            .ok_or(ProtocolError::InvalidHtlcExpiry)?;

        // The peer funds the escrow from its own side.
        let mut cstate = self.cstate().clone();
        if !funding_delta(
            !self.us_is_funder(),
            self.anchor().satoshis,
            0,
            pkt.amount_msat as i64,
            &mut cstate.b,
            &mut cstate.a,
        ) {
            return Err(ProtocolError::CannotAfford(pkt.amount_msat));
        }
        cstate.b.add_htlc(pkt.amount_msat, expiry, pkt.r_hash);

        self.stage_their_update(
            secp,
            HtlcStage::Add {
                msatoshis: pkt.amount_msat,
                rhash: pkt.r_hash,
                expiry,
            },
            pkt.revocation_hash,
            cstate,
        )
    }

    fn accept_pkt_htlc_fulfill(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &UpdateFulfillHtlc,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        // The peer redeems an HTLC we offered.
        let rhash = sha256::Hash::hash(&pkt.r[..]);
        let index = self
            .cstate()
            .a
            .find_htlc(&rhash)
            .ok_or(ProtocolError::UnknownHtlc)?;

        let mut cstate = self.cstate().clone();
        funding_fulfill_htlc(&mut cstate.a, &mut cstate.b, index);

        self.stage_their_update(
            secp,
            HtlcStage::Fulfill { r: pkt.r },
            pkt.revocation_hash,
            cstate,
        )
    }

    fn accept_pkt_htlc_fail(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &UpdateFailHtlc,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        // The peer returns an HTLC we offered.
        let index = self
            .cstate()
            .a
            .find_htlc(&pkt.r_hash)
            .ok_or(ProtocolError::UnknownHtlc)?;

        let mut cstate = self.cstate().clone();
        funding_fail_htlc(&mut cstate.a, index);

        self.stage_their_update(
            secp,
            HtlcStage::Fail { rhash: pkt.r_hash },
            pkt.revocation_hash,
            cstate,
        )
    }

    /// Shared acceptance leg of every peer-initiated update: build the new
    /// commitment pair, sign theirs and stage the whole update for the
    /// `update_signature`/`update_complete` exchange.
    fn stage_their_update(
        &mut self,
        secp: &Secp256k1<All>,
        stage: HtlcStage,
        their_revocation_hash: sha256::Hash,
        cstate: ChannelState,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        debug!("peer {}: accepting {}", self.id, stage);
        let our_revocation_hash =
            self.secrets.revocation_hash(self.num_htlcs + 1);

        let (us_keys, them_keys) = self.commit_keys();
        let (our_commit, their_commit) = make_commit_txs(
            &self.anchor(),
            &us_keys,
            &them_keys,
            &our_revocation_hash,
            &their_revocation_hash,
            &cstate,
        );

        let sig = sign_tx_input(
            secp,
            &their_commit,
            0,
            &self.redeemscript(),
            self.secrets.commit_key(),
        );

        self.current_htlc = Some(HtlcProgress {
            stage,
            cstate,
            our_revocation_hash,
            their_revocation_hash: Some(their_revocation_hash),
            our_commit: Some(our_commit),
            their_commit: Some(their_commit),
        });
        self.state = StateName::WaitForUpdateSig;

        Ok(vec![Pkt::UpdateAccept(UpdateAccept {
            sig,
            revocation_hash: our_revocation_hash,
        })])
    }

    fn accept_pkt_update_accept(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &UpdateAccept,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let cur = self
            .current_htlc
            .clone()
            .expect("an update is in flight while waiting for acceptance");

        let (us_keys, them_keys) = self.commit_keys();
        let (our_commit, their_commit) = make_commit_txs(
            &self.anchor(),
            &us_keys,
            &them_keys,
            &cur.our_revocation_hash,
            &pkt.revocation_hash,
            &cur.cstate,
        );

        let redeemscript = self.redeemscript();
        if !check_tx_sig(
            secp,
            &our_commit,
            0,
            &redeemscript,
            &self.them().commit_key,
            &pkt.sig,
        ) {
            return Err(ProtocolError::BadSignature);
        }

        self.update_to_new_htlcs(HtlcProgress {
            their_revocation_hash: Some(pkt.revocation_hash),
            our_commit: Some(our_commit),
            their_commit: Some(their_commit.clone()),
            ..cur
        });

        // Counter-sign and disclose the preimage retiring our previous
        // commitment; only now is disclosure safe.
        let sig = sign_tx_input(
            secp,
            &their_commit,
            0,
            &redeemscript,
            self.secrets.commit_key(),
        );
        let revocation_preimage =
            self.secrets.revocation_preimage(self.num_htlcs - 1);
        self.state = StateName::WaitForUpdateComplete;

        Ok(vec![Pkt::UpdateSignature(UpdateSignature {
            sig,
            revocation_preimage,
        })])
    }

    fn accept_pkt_update_signature(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &UpdateSignature,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let cur = self
            .current_htlc
            .clone()
            .expect("an update is in flight while waiting for its signature");
        let our_commit = cur
            .our_commit
            .clone()
            .expect("staged updates carry both commitments");

        // Verify signature and preimage before any mutation.
        if !check_tx_sig(
            secp,
            &our_commit,
            0,
            &self.redeemscript(),
            &self.them().commit_key,
            &pkt.sig,
        ) {
            return Err(ProtocolError::BadSignature);
        }
        if sha256::Hash::hash(&pkt.revocation_preimage[..])
            != self.them().revocation_hash
        {
            return Err(ProtocolError::BadRevocationPreimage);
        }

        self.update_to_new_htlcs(cur);

        let revocation_preimage =
            self.secrets.revocation_preimage(self.num_htlcs - 1);
        self.state = StateName::Normal;

        Ok(vec![Pkt::UpdateComplete(UpdateComplete {
            revocation_preimage,
        })])
    }

    fn accept_pkt_update_complete(
        &mut self,
        pkt: &UpdateComplete,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let prev = self
            .their_prev_revocation_hash
            .expect("a completed update retires a previous commitment");
        if sha256::Hash::hash(&pkt.revocation_preimage[..]) != prev {
            return Err(ProtocolError::BadRevocationPreimage);
        }
        self.state = StateName::Normal;
        Ok(vec![])
    }

    /// Atomically replaces the balance state, both commitments and both
    /// revocation hashes. Asserts fund conservation: a violation is a
    /// programming error, not a peer fault.
    fn update_to_new_htlcs(&mut self, cur: HtlcProgress) {
        let old = self.cstate();
        if old.total() != cur.cstate.total() {
            panic!(
                "Illegal funding transition from {}/{} (total {}) to {}/{} (total {})",
                old.a.pay_msat,
                old.a.fee_msat,
                old.total(),
                cur.cstate.a.pay_msat,
                cur.cstate.a.fee_msat,
                cur.cstate.total(),
            );
        }

        self.cstate = Some(cur.cstate);
        self.us.commit = Some(
            cur.our_commit
                .expect("commitments are built before installation"),
        );
        self.us.revocation_hash = cur.our_revocation_hash;
        let them = self
            .them
            .as_mut()
            .expect("peer parameters are set after open");
        self.their_prev_revocation_hash = Some(them.revocation_hash);
        them.commit = Some(
            cur.their_commit
                .expect("commitments are built before installation"),
        );
        them.revocation_hash = cur
            .their_revocation_hash
            .expect("peer revocation hash is known before installation");
        self.num_htlcs += 1;
        self.current_htlc = None;
    }

    fn accept_pkt_close_shutdown(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &CloseShutdown,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        if self.current_htlc.is_some() {
            return Err(ProtocolError::CloseWithHtlcsInFlight);
        }
        {
            let cstate = self.cstate();
            if !cstate.a.htlcs.is_empty() || !cstate.b.htlcs.is_empty() {
                return Err(ProtocolError::CloseWithHtlcsInFlight);
            }
        }

        self.their_close_script = Some(pkt.script_pubkey.clone());

        let mut out = vec![];
        if self.our_close_script.is_none() {
            let script =
                Script::redeem_single(0, &self.us.final_key).to_p2sh();
            self.our_close_script = Some(script.clone());
            out.push(Pkt::CloseShutdown(CloseShutdown {
                script_pubkey: script,
            }));
        }
        out.push(self.close_signature(secp));
        self.state = StateName::Closing;
        Ok(out)
    }

    fn accept_pkt_close_signature(
        &mut self,
        secp: &Secp256k1<All>,
        pkt: &CloseSignature,
    ) -> Result<Vec<Pkt>, ProtocolError> {
        let their_script = self
            .their_close_script
            .clone()
            .ok_or(ProtocolError::UnexpectedPacket("close_signature"))?;
        let our_script = self
            .our_close_script
            .clone()
            .expect("our close script is set when entering CLOSING");

        let close_tx = make_close_tx(
            &self.anchor(),
            &our_script,
            &their_script,
            self.us_is_funder(),
            self.cstate(),
        );
        if !check_tx_sig(
            secp,
            &close_tx,
            0,
            &self.redeemscript(),
            &self.them().commit_key,
            &pkt.sig,
        ) {
            return Err(ProtocolError::BadSignature);
        }

        info!("peer {}: channel closed", self.id);
        self.state = StateName::Closed;
        Ok(vec![])
    }

    fn close_signature(&self, secp: &Secp256k1<All>) -> Pkt {
        let close_tx = make_close_tx(
            &self.anchor(),
            self.our_close_script
                .as_ref()
                .expect("our close script is set before signing the close"),
            self.their_close_script
                .as_ref()
                .expect("peer close script is recorded from close_shutdown"),
            self.us_is_funder(),
            self.cstate(),
        );
        let sig = sign_tx_input(
            secp,
            &close_tx,
            0,
            &self.redeemscript(),
            self.secrets.commit_key(),
        );
        let cstate = self.cstate();
        Pkt::CloseSignature(CloseSignature {
            close_fee: (cstate.a.fee_msat + cstate.b.fee_msat) / 1000,
            sig,
        })
    }

    /// Signature over the peer's current commitment under our commit key.
    pub fn sign_their_commit(&self, secp: &Secp256k1<All>) -> Signature {
        let their_commit = self
            .them()
            .commit
            .as_ref()
            .expect("peer commitment exists once the channel is funded");
        sign_tx_input(
            secp,
            their_commit,
            0,
            &self.redeemscript(),
            self.secrets.commit_key(),
        )
    }
}
