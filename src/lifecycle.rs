//! Connection lifecycle: the five-state machine, transport acquisition and the
//! auto-disconnect timer (§4.G).
//!
//! Transition functions are pure: they mutate a [`PeerSession`] and return the [`Effect`]s
//! the caller (the [`crate::gateway`] event loop) must carry out — submitting transport
//! requests, notifying Telephony, emitting control-plane signals, and arming/cancelling
//! timers. Keeping the side effects as data rather than performing them inline is what
//! makes the state machine itself exhaustively unit-testable without a collaborator in
//! sight.

use crate::{
    control::{Property, Signal},
    peer::{PeerSession, PendingOp, State, Target},
    ErrorKind,
};

/// Duration a session auto-opened on behalf of a consumer is kept alive after the last
/// lock is released, before being forced to DISCONNECTED (§4.G "Auto-disconnect").
pub const AUTO_DISCONNECT: tokio::time::Duration = tokio::time::Duration::from_secs(3);

/// A side effect a lifecycle transition requires the caller to perform.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    /// Emit this control-plane signal.
    Signal(Signal),
    /// Emit this property-changed signal.
    PropertyChanged(Property),
    /// Notify Telephony that the peer reached CONNECTED.
    NotifyTelephonyConnected,
    /// Notify Telephony that the peer left CONNECTED.
    NotifyTelephonyDisconnected,
    /// Submit an SDP search (profile chosen by the caller based on local HFP support).
    SdpSearch,
    /// Connect RFCOMM on the peer's discovered channel.
    ConnectRfcomm,
    /// Close the RFCOMM channel.
    CloseRfcomm,
    /// Connect SCO.
    ConnectSco,
    /// Close SCO.
    CloseSco,
    /// Start the ring cadence now (a `pending_ring` request reached PLAYING).
    StartRing,
    /// Arm the auto-disconnect timer.
    ArmAutoDisconnect,
    /// Cancel the auto-disconnect timer.
    CancelAutoDisconnect,
    /// Resolve the peer's pending operation with this outcome.
    ResolvePending(Result<(), ErrorKind>),
}

/// Requests driving the state machine (§4.G transition diagram).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A control-plane or auto-open caller wants the session at (at least) CONNECTED.
    RequestConnect,
    /// A control-plane or auto-open caller wants the session at PLAYING.
    RequestPlay,
    /// The caller wants the session dropped back to CONNECTED (suspend audio only).
    RequestStop,
    /// A control-plane or consumer request to tear the session down entirely.
    RequestDisconnect,
    /// RFCOMM connect completed successfully.
    RfcommUp,
    /// RFCOMM connect failed, or the open channel errored/hung up.
    RfcommFailed,
    /// SCO connect completed successfully.
    ScoUp,
    /// SCO connect failed, or the open channel errored/hung up.
    ScoFailed,
    /// The auto-disconnect timer fired.
    AutoDisconnectFired,
}

fn transition_to_disconnected(peer: &mut PeerSession, effects: &mut Vec<Effect>) {
    let was_active = peer.state.is_active();
    if matches!(peer.state, State::Playing | State::PlayInProgress) {
        effects.push(Effect::CloseSco);
    }
    effects.push(Effect::CloseRfcomm);
    peer.state = State::Disconnected;
    peer.reset_rfcomm_state();
    peer.rfcomm_channel = None;
    peer.rfcomm_open = false;
    peer.profile = None;
    peer.pending = None;
    effects.push(Effect::Signal(Signal::Disconnected));
    effects.push(Effect::PropertyChanged(Property::Connected(false)));
    if was_active {
        effects.push(Effect::NotifyTelephonyDisconnected);
    }
}

fn enter_connected(peer: &mut PeerSession, effects: &mut Vec<Effect>) {
    let from_playing = peer.state == State::Playing || peer.state == State::PlayInProgress;
    peer.state = State::Connected;
    if from_playing {
        effects.push(Effect::CloseSco);
        effects.push(Effect::Signal(Signal::Stopped));
        effects.push(Effect::PropertyChanged(Property::Playing(false)));
    } else {
        effects.push(Effect::Signal(Signal::Connected));
        effects.push(Effect::PropertyChanged(Property::Connected(true)));
        effects.push(Effect::NotifyTelephonyConnected);
    }
}

fn enter_playing(peer: &mut PeerSession, effects: &mut Vec<Effect>) {
    peer.state = State::Playing;
    effects.push(Effect::Signal(Signal::Playing));
    effects.push(Effect::PropertyChanged(Property::Playing(true)));
    if let Some(v) = peer.sp_gain.value() {
        effects.push(Effect::Signal(Signal::SpeakerGainChanged(v as u16)));
    }
    if let Some(v) = peer.mic_gain.value() {
        effects.push(Effect::Signal(Signal::MicrophoneGainChanged(v as u16)));
    }
    if peer.pending_ring {
        effects.push(Effect::StartRing);
    }
}

fn finish_pending(peer: &mut PeerSession, outcome: Result<(), ErrorKind>, effects: &mut Vec<Effect>) {
    if peer.pending.take().is_some() {
        effects.push(Effect::ResolvePending(outcome));
    }
}

/// Drives `peer` through `event`, returning the effects the caller must perform.
///
/// This is the single entry point into the state machine; every transition in §4.G's
/// diagram is reachable by calling this repeatedly as transport/timer events occur.
pub fn apply(peer: &mut PeerSession, event: Event) -> Vec<Effect> {
    let mut effects = Vec::new();
    match event {
        Event::RequestConnect => match peer.state {
            State::Disconnected => {
                peer.state = State::ConnectInProgress;
                peer.pending = Some(PendingOp::new(Target::Connected));
                if peer.rfcomm_channel.is_none() {
                    effects.push(Effect::SdpSearch);
                } else {
                    effects.push(Effect::ConnectRfcomm);
                }
            }
            State::ConnectInProgress => {
                if let Some(pending) = peer.pending.as_mut() {
                    pending.upgrade(Target::Connected);
                }
            }
            _ => {
                // Already at or beyond CONNECTED: synchronous "already connected" shortcut.
                effects.push(Effect::ResolvePending(Ok(())));
            }
        },
        Event::RequestPlay => match peer.state {
            State::Disconnected => {
                peer.state = State::ConnectInProgress;
                peer.pending = Some(PendingOp::new(Target::Playing));
                if peer.rfcomm_channel.is_none() {
                    effects.push(Effect::SdpSearch);
                } else {
                    effects.push(Effect::ConnectRfcomm);
                }
            }
            State::ConnectInProgress => {
                if let Some(pending) = peer.pending.as_mut() {
                    pending.upgrade(Target::Playing);
                }
            }
            State::Connected => {
                peer.state = State::PlayInProgress;
                peer.pending = Some(PendingOp::new(Target::Playing));
                effects.push(Effect::ConnectSco);
            }
            State::PlayInProgress => {
                if let Some(pending) = peer.pending.as_mut() {
                    pending.upgrade(Target::Playing);
                }
            }
            State::Playing => {
                effects.push(Effect::ResolvePending(Ok(())));
            }
        },
        Event::RequestStop => {
            if matches!(peer.state, State::Playing | State::PlayInProgress) {
                enter_connected(peer, &mut effects);
            }
        }
        Event::RequestDisconnect => {
            if peer.state != State::Disconnected {
                transition_to_disconnected(peer, &mut effects);
            }
        }
        Event::RfcommUp => {
            if peer.state == State::ConnectInProgress {
                peer.rfcomm_open = true;
                effects.push(Effect::CancelAutoDisconnect);
                if peer.is_hsp() {
                    enter_connected(peer, &mut effects);
                    maybe_chain_play(peer, &mut effects);
                }
                // HFP: remains ConnectInProgress until the SLC orchestrator completes it.
            }
        }
        Event::RfcommFailed => {
            if peer.state == State::ConnectInProgress {
                let err = Err(ErrorKind::ConnectionAttemptFailed);
                finish_pending(peer, err, &mut effects);
                transition_to_disconnected(peer, &mut effects);
            }
        }
        Event::ScoUp => {
            if peer.state == State::PlayInProgress {
                enter_playing(peer, &mut effects);
                finish_pending(peer, Ok(()), &mut effects);
            }
        }
        Event::ScoFailed => {
            if matches!(peer.state, State::PlayInProgress | State::Playing) {
                let err = Err(ErrorKind::ConnectionAttemptFailed);
                finish_pending(peer, err, &mut effects);
                enter_connected(peer, &mut effects);
            }
        }
        Event::AutoDisconnectFired => {
            if peer.lock.is_empty() && peer.state != State::Disconnected {
                transition_to_disconnected(peer, &mut effects);
            }
        }
    }
    effects
}

/// Called by the SLC orchestrator once it decides the handshake is complete (§4.F),
/// completing the CONNECTED transition and chaining into SCO if the pending op wants
/// PLAYING.
pub fn complete_slc(peer: &mut PeerSession) -> Vec<Effect> {
    let mut effects = Vec::new();
    if peer.state != State::ConnectInProgress {
        return effects;
    }
    effects.push(Effect::CancelAutoDisconnect);
    enter_connected(peer, &mut effects);
    maybe_chain_play(peer, &mut effects);
    effects
}

fn maybe_chain_play(peer: &mut PeerSession, effects: &mut Vec<Effect>) {
    let wants_play = matches!(peer.pending.as_ref().and_then(|p| p.target()), Some(Target::Playing));
    if wants_play {
        peer.state = State::PlayInProgress;
        effects.push(Effect::ConnectSco);
    } else {
        finish_pending(peer, Ok(()), effects);
    }
}

trait IsHsp {
    fn is_hsp(&self) -> bool;
}

impl IsHsp for PeerSession {
    fn is_hsp(&self) -> bool {
        matches!(self.profile, Some(crate::peer::Profile::Hsp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    fn peer() -> PeerSession {
        PeerSession::new(Address::any())
    }

    #[test]
    fn hsp_connect_goes_straight_to_connected_on_rfcomm_up() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hsp);
        apply(&mut p, Event::RequestConnect);
        assert_eq!(p.state, State::ConnectInProgress);
        let effects = apply(&mut p, Event::RfcommUp);
        assert_eq!(p.state, State::Connected);
        assert!(effects.contains(&Effect::Signal(Signal::Connected)));
        assert!(effects.contains(&Effect::NotifyTelephonyConnected));
    }

    #[test]
    fn hfp_connect_stays_in_progress_until_slc_completes() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hfp);
        apply(&mut p, Event::RequestConnect);
        apply(&mut p, Event::RfcommUp);
        assert_eq!(p.state, State::ConnectInProgress);
        complete_slc(&mut p);
        assert_eq!(p.state, State::Connected);
    }

    #[test]
    fn play_request_chains_sco_after_slc_and_reaches_playing() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hfp);
        apply(&mut p, Event::RequestPlay);
        apply(&mut p, Event::RfcommUp);
        let effects = complete_slc(&mut p);
        assert_eq!(p.state, State::PlayInProgress);
        assert!(effects.contains(&Effect::ConnectSco));
        let effects = apply(&mut p, Event::ScoUp);
        assert_eq!(p.state, State::Playing);
        assert!(effects.contains(&Effect::ResolvePending(Ok(()))));
        assert!(p.pending.is_none());
    }

    #[test]
    fn sco_failure_drops_to_connected_not_disconnected() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hsp);
        apply(&mut p, Event::RequestPlay);
        apply(&mut p, Event::RfcommUp);
        apply(&mut p, Event::RequestPlay);
        assert_eq!(p.state, State::PlayInProgress);
        let effects = apply(&mut p, Event::ScoFailed);
        assert_eq!(p.state, State::Connected);
        assert!(effects.contains(&Effect::ResolvePending(Err(ErrorKind::ConnectionAttemptFailed))));
    }

    #[test]
    fn pending_target_upgrades_connected_to_playing_never_downgrades() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hfp);
        apply(&mut p, Event::RequestConnect);
        apply(&mut p, Event::RequestPlay);
        assert_eq!(p.pending.as_ref().unwrap().target(), Some(Target::Playing));
        apply(&mut p, Event::RequestConnect);
        assert_eq!(p.pending.as_ref().unwrap().target(), Some(Target::Playing));
    }

    #[test]
    fn auto_disconnect_only_fires_when_unlocked() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hsp);
        apply(&mut p, Event::RequestConnect);
        apply(&mut p, Event::RfcommUp);
        p.lock.read = true;
        assert!(apply(&mut p, Event::AutoDisconnectFired).is_empty());
        assert_eq!(p.state, State::Connected);
        p.lock.read = false;
        let effects = apply(&mut p, Event::AutoDisconnectFired);
        assert_eq!(p.state, State::Disconnected);
        assert!(effects.contains(&Effect::NotifyTelephonyDisconnected));
    }

    #[test]
    fn already_connected_request_is_a_synchronous_shortcut() {
        let mut p = peer();
        p.profile = Some(crate::peer::Profile::Hsp);
        apply(&mut p, Event::RequestConnect);
        apply(&mut p, Event::RfcommUp);
        assert_eq!(p.state, State::Connected);
        let effects = apply(&mut p, Event::RequestConnect);
        assert_eq!(effects, vec![Effect::ResolvePending(Ok(()))]);
    }

    #[test]
    fn rfcomm_failure_resolves_pending_and_disconnects() {
        let mut p = peer();
        apply(&mut p, Event::RequestConnect);
        let effects = apply(&mut p, Event::RfcommFailed);
        assert_eq!(p.state, State::Disconnected);
        assert!(effects.contains(&Effect::ResolvePending(Err(ErrorKind::ConnectionAttemptFailed))));
        assert!(effects.contains(&Effect::Signal(Signal::Disconnected)));
    }
}
