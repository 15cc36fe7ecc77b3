//! Command handler contracts: one function per AT command, per §4.E.
//!
//! Handlers only ever do one of three things: reply immediately, forward a request to the
//! Telephony collaborator (whose eventual response is translated into `OK`/`ERROR` by
//! [`telephony_reply`]), or do both (update local state immediately *and* forward). None of
//! them perform I/O themselves — the [`crate::gateway`] event loop sends whatever bytes or
//! requests a handler produces.

use crate::{
    ag::AgState,
    dispatch::Command,
    framer,
    peer::{Gain, PeerSession},
    slc::SlcCheckpoint,
    telephony::{CmeError, Request},
    transport::{ag_features, both_support_three_way},
};

/// What the gateway event loop must do after a handler runs.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Bytes to write to the peer's RFCOMM channel immediately, if any.
    pub reply: Option<Vec<u8>>,
    /// A request to submit to the Telephony collaborator, if any. Its eventual response is
    /// translated into an AT reply by [`telephony_reply`].
    pub forward: Option<Request>,
    /// SLC-completion checkpoint to evaluate *after* `reply` has been sent, per §4.F.
    pub slc_checkpoint: Option<SlcCheckpoint>,
}

impl Outcome {
    fn reply(bytes: Vec<u8>) -> Self {
        Self { reply: Some(bytes), ..Default::default() }
    }

    fn forward(request: Request) -> Self {
        Self { forward: Some(request), ..Default::default() }
    }

    fn error() -> Self {
        Self::reply(framer::frame_error())
    }
}

/// Translates a Telephony response into the AT reply a pending forwarded command should
/// produce, honoring `cme_enabled` (§4.E, every forwarding handler's completion contract).
pub fn telephony_reply(result: CmeError, cme_enabled: bool) -> Vec<u8> {
    if result.is_success() {
        framer::frame_ok()
    } else if cme_enabled {
        framer::frame_cme_error(result.0)
    } else {
        framer::frame_error()
    }
}

/// Executes `cmd` against `peer`/`ag`, producing an [`Outcome`] for the gateway to act on.
pub fn handle(cmd: Command, peer: &mut PeerSession, ag: &AgState) -> Outcome {
    match cmd {
        Command::Answer => {
            peer.pending_ring = false;
            Outcome::forward(Request::AnswerCall)
        }
        Command::Dial { number } => Outcome::forward(Request::DialNumber { number }),
        Command::SpeakerGain { value } => handle_gain(peer, value, true),
        Command::MicrophoneGain { value } => handle_gain(peer, value, false),
        Command::Brsf { hf_features } => {
            peer.hf_features = hf_features;
            Outcome::reply(framer::frame_info_then_ok(&format!("+BRSF: {}", ag.ag_features)))
        }
        Command::CindTest => {
            let ranges = ag
                .indicators
                .iter()
                .map(|i| format!("(\"{}\",({},{}))", i.name, i.range.0, i.range.1))
                .collect::<Vec<_>>()
                .join(",");
            Outcome::reply(framer::frame_info_then_ok(&format!("+CIND: {ranges}")))
        }
        Command::CindRead => {
            let values =
                ag.indicators.iter().map(|i| i.value.to_string()).collect::<Vec<_>>().join(",");
            Outcome::reply(framer::frame_info_then_ok(&format!("+CIND: {values}")))
        }
        Command::Cmer { ind, .. } => {
            let on = ind != 0;
            let mut out = Outcome::forward(Request::EventReporting { on });
            out.slc_checkpoint = Some(SlcCheckpoint::AfterCmer);
            out
        }
        Command::ChldTest => {
            let mut out = Outcome::reply(framer::frame_info_then_ok(&format!("+CHLD: ({})", ag.chld)));
            out.slc_checkpoint = Some(SlcCheckpoint::AfterChldTest);
            out
        }
        Command::Chld { action } => Outcome::forward(Request::CallHold { action }),
        Command::Chup => Outcome::forward(Request::TerminateCall),
        Command::Ckpd => {
            peer.pending_ring = false;
            Outcome::forward(Request::KeyPress { keys: "200".to_string() })
        }
        Command::Clip { enabled } => {
            peer.cli_active = enabled;
            Outcome::reply(framer::frame_ok())
        }
        Command::CallWaiting { enabled } => {
            peer.cwa_enabled = enabled;
            Outcome::reply(framer::frame_ok())
        }
        Command::ExtendedErrors { enabled } => {
            peer.cme_enabled = enabled;
            Outcome::reply(framer::frame_ok())
        }
        Command::BtrhSet { value } => Outcome::forward(Request::ResponseAndHold { value }),
        Command::BtrhRead => {
            if ag.rh >= 0 {
                Outcome::reply(framer::frame_info_then_ok(&format!("+BTRH: {}", ag.rh)))
            } else {
                Outcome::reply(framer::frame_ok())
            }
        }
        Command::LastDialed => Outcome::forward(Request::LastDialedNumber),
        Command::Dtmf { tone } => Outcome::forward(Request::TransmitDtmf { tone }),
        Command::SubscriberNumber => Outcome::forward(Request::SubscriberNumber),
        Command::ListCalls => Outcome::forward(Request::ListCurrentCalls),
        Command::OperatorRead => Outcome::forward(Request::OperatorSelection),
        Command::OperatorSet => Outcome::reply(framer::frame_ok()),
        Command::Nrec { enabled } => {
            peer.nrec_req = enabled;
            Outcome::forward(Request::NrAndEc { on: enabled })
        }
    }
}

fn handle_gain(peer: &mut PeerSession, value: i32, speaker: bool) -> Outcome {
    let Some(gain) = Gain::parse(value) else {
        return Outcome::error();
    };
    // Whether this changed anything is left for the gateway to observe by comparing
    // peer.sp_gain/mic_gain before and after `handle` runs; it owns the control-plane
    // handle and is the only place that can emit SpeakerGainChanged/PropertyChanged.
    if speaker {
        peer.sp_gain = gain;
    } else {
        peer.mic_gain = gain;
    }
    Outcome::reply(framer::frame_ok())
}

/// Whether the SLC handshake should complete given the current AG/HF feature masks, to be
/// evaluated at [`SlcCheckpoint::AfterCmer`] (§4.F rule 1).
pub fn slc_completes_after_cmer(ag_features: u32, hf_features: u32) -> bool {
    !both_support_three_way(ag_features, hf_features)
}

/// AG feature mask used in tests exercising the full HFP 1.5 bit range.
pub fn full_ag_feature_mask() -> u32 {
    ag_features::THREE_WAY_CALLING
        | ag_features::EC_ANDOR_NR
        | ag_features::VOICE_RECOGNITION
        | ag_features::INBAND_RINGTONE
        | ag_features::ATTACH_NUMBER_TO_VOICETAG
        | ag_features::REJECT_A_CALL
        | ag_features::ENHANCED_CALL_STATUS
        | ag_features::ENHANCED_CALL_CONTROL
        | ag_features::EXTENDED_ERROR_RESULT_CODES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ag::Indicator, peer::State, Address};

    fn ag_state() -> AgState {
        let mut ag = AgState::default();
        ag.set_ready(
            full_ag_feature_mask(),
            vec![Indicator { name: "service".into(), range: (0, 1), value: 1 }],
            -1,
            "0,1,2,3".into(),
        );
        ag
    }

    #[test]
    fn brsf_replies_with_ag_feature_mask() {
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        let out = handle(Command::Brsf { hf_features: 0 }, &mut peer, &ag);
        assert_eq!(out.reply.unwrap(), framer::frame_info_then_ok("+BRSF: 511"));
        assert_eq!(peer.hf_features, 0);
    }

    #[test]
    fn vgs_out_of_range_is_rejected_without_state_change() {
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        let out = handle(Command::SpeakerGain { value: 99 }, &mut peer, &ag);
        assert_eq!(out.reply.unwrap(), framer::frame_error());
        assert_eq!(peer.sp_gain, Gain::Unknown);
    }

    #[test]
    fn vgs_in_range_updates_gain_and_replies_ok() {
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        peer.state = State::Playing;
        let out = handle(Command::SpeakerGain { value: 7 }, &mut peer, &ag);
        assert_eq!(out.reply.unwrap(), framer::frame_ok());
        assert_eq!(peer.sp_gain, Gain::Level(7));
    }

    #[test]
    fn cmer_forwards_and_arms_slc_checkpoint() {
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        let out = handle(Command::Cmer { mode: 3, ind: 1 }, &mut peer, &ag);
        assert!(matches!(out.forward, Some(Request::EventReporting { on: true })));
        assert_eq!(out.slc_checkpoint, Some(SlcCheckpoint::AfterCmer));
    }

    #[test]
    fn btrh_read_without_active_rh_replies_plain_ok() {
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        let out = handle(Command::BtrhRead, &mut peer, &ag);
        assert_eq!(out.reply.unwrap(), framer::frame_ok());
    }

    #[test]
    fn dial_requires_trailing_semicolon_upstream_in_dispatch() {
        // Parsing lives in `dispatch`; here we only assert the forwarded request shape.
        let ag = ag_state();
        let mut peer = PeerSession::new(Address::any());
        let out = handle(Command::Dial { number: "5551234".into() }, &mut peer, &ag);
        assert!(matches!(out.forward, Some(Request::DialNumber { number }) if number == "5551234"));
    }

    #[test]
    fn slc_completes_after_cmer_only_without_mutual_three_way() {
        assert!(slc_completes_after_cmer(0, 0));
        assert!(!slc_completes_after_cmer(
            ag_features::THREE_WAY_CALLING,
            crate::transport::hf_features::CALL_WAITING_AND_3WAY
        ));
    }
}
