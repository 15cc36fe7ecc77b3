//! Control-plane collaborator: the remote command surface and event signals exposed to the
//! rest of the system.
//!
//! Wire encoding (D-Bus, JSON-RPC, or anything else) is out of scope for this crate; this
//! module defines the method/property/signal surface in plain Rust so an embedder can bind
//! it to whatever IPC mechanism it uses.

use strum::{Display, EnumString};
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::ScoRouting,
    peer::{CallbackId, Lock},
    Address, ErrorKind,
};

/// A method call arriving from the control plane, addressed to one peer.
#[derive(Clone, Debug)]
pub enum Method {
    /// Open RFCOMM (and, for HFP, complete the SLC) to the peer.
    Connect,
    /// Tear down the peer's session.
    Disconnect,
    /// Query whether the peer is at least CONNECTED.
    IsConnected,
    /// Indicate an incoming call, arming the ring cadence.
    IndicateCall { number: Option<String>, number_type: i32 },
    /// Cancel an in-progress ring cadence.
    CancelCall,
    /// Bring the peer up to PLAYING.
    Play,
    /// Drop the peer back to CONNECTED (suspend audio without tearing down RFCOMM).
    Stop,
    /// Query whether the peer is PLAYING.
    IsPlaying,
    /// Read the current speaker gain.
    GetSpeakerGain,
    /// Read the current microphone gain.
    GetMicrophoneGain,
    /// Set the speaker gain (`0..=15`).
    SetSpeakerGain(u8),
    /// Set the microphone gain (`0..=15`).
    SetMicrophoneGain(u8),
    /// Read all properties.
    GetProperties,
    /// Set one property directly.
    SetProperty(Property),
    /// `headset_request_stream`: auto-open the session to PLAYING on behalf of a consumer,
    /// acquiring a read+write lock, and return a cancellable callback id.
    RequestStream,
    /// `headset_config_stream`: auto-open the session to (at least) CONNECTED, acquiring a
    /// read+write lock, and return a cancellable callback id.
    ConfigStream,
    /// `headset_suspend_stream`: release the audio path (close SCO) without tearing down the
    /// session.
    SuspendStream,
    /// `headset_cancel_stream`: remove one previously registered callback.
    CancelStream(CallbackId),
    /// `headset_lock`: acquire an advisory lock bit.
    Lock(LockKind),
    /// `headset_unlock`: release an advisory lock bit.
    Unlock(LockKind),
    /// `headset_is_active`: true if the session holds any lock and is not DISCONNECTED.
    IsActive,
    /// `headset_get_channel`: the peer's discovered RFCOMM channel, if any.
    Channel,
    /// `headset_get_nrec`: the peer's current noise-reduction/echo-cancellation state.
    Nrec,
    /// `headset_get_sco_hci`: the configured [`ScoRouting`].
    ScoRouting,
}

/// Reply value for a [`Method`] call.
#[derive(Clone, Debug)]
pub enum MethodReply {
    /// No return value; the call succeeded.
    Unit,
    /// Boolean return value (`IsConnected`, `IsPlaying`, `IsActive`, `Nrec`).
    Bool(bool),
    /// Gain return value (`GetSpeakerGain`, `GetMicrophoneGain`).
    Gain(u16),
    /// Full property snapshot (`GetProperties`).
    Properties(Vec<Property>),
    /// Opaque callback id (`RequestStream`, `ConfigStream`), later passed to `CancelStream`.
    CallbackId(CallbackId),
    /// Discovered RFCOMM channel, if any (`Channel`).
    Channel(Option<u8>),
    /// Configured SCO routing (`ScoRouting`).
    ScoRouting(ScoRouting),
}

/// Which advisory lock bit [`Method::Lock`]/[`Method::Unlock`] targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
pub enum LockKind {
    /// Consumer intends to read audio from the session.
    Read,
    /// Consumer intends to write audio to the session.
    Write,
}

impl LockKind {
    /// Applies this lock bit to `lock`.
    pub fn set(self, lock: &mut Lock, value: bool) {
        match self {
            LockKind::Read => lock.read = value,
            LockKind::Write => lock.write = value,
        }
    }
}

/// A property value, as returned by `GetProperties` or carried on a `PropertyChanged` signal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Property {
    /// Peer is at least CONNECTED.
    Connected(bool),
    /// Peer is PLAYING.
    Playing(bool),
    /// Current speaker gain.
    SpeakerGain(u16),
    /// Current microphone gain.
    MicrophoneGain(u16),
}

/// An event signal emitted towards the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    /// Peer reached CONNECTED.
    Connected,
    /// Peer reached DISCONNECTED.
    Disconnected,
    /// Peer reached PLAYING.
    Playing,
    /// Peer dropped from PLAYING back to CONNECTED.
    Stopped,
    /// The peer pressed the answer key / sent `ATA`.
    AnswerRequested,
    /// The peer hung up / sent `AT+CHUP`.
    CallTerminated,
    /// Speaker gain changed, carrying the new value.
    SpeakerGainChanged(u16),
    /// Microphone gain changed, carrying the new value.
    MicrophoneGainChanged(u16),
    /// A property changed; carries the new value.
    PropertyChanged(Property),
}

/// Error tag surfaced to the control plane on a failed [`Method`] call.
///
/// This is a closed, wire-stable subset of [`ErrorKind`]; every variant here is guaranteed
/// to round-trip through [`ErrorKind`]'s `Display`/`EnumString` implementation.
pub type ErrorTag = ErrorKind;

/// One method call awaiting a reply, addressed to a peer.
#[derive(Debug)]
pub struct MethodCall {
    /// Peer the call targets.
    pub peer: Address,
    /// The call itself.
    pub method: Method,
    /// Channel the core sends exactly one reply on.
    pub reply: oneshot::Sender<Result<MethodReply, ErrorTag>>,
}

/// Handle the core uses to receive method calls from, and emit signals towards, the
/// control plane.
///
/// Method calls flow control-plane → core over `calls`; signals flow core → control-plane
/// over `signals_tx`. An embedder supplies both halves and binds them to whatever IPC
/// mechanism it uses; this crate only ever sees plain Rust values.
pub struct ControlPlane {
    /// Receives method calls from the control plane. Owned by the [`crate::gateway::Gateway`]
    /// event loop.
    pub calls: mpsc::UnboundedReceiver<MethodCall>,
    signals_tx: mpsc::UnboundedSender<(Address, Signal)>,
}

impl ControlPlane {
    /// Creates a control-plane handle from its two channel halves.
    pub fn new(
        calls: mpsc::UnboundedReceiver<MethodCall>, signals_tx: mpsc::UnboundedSender<(Address, Signal)>,
    ) -> Self {
        Self { calls, signals_tx }
    }

    /// Emits a signal for `peer` towards the control plane.
    pub fn emit(&self, peer: Address, signal: Signal) {
        let _ = self.signals_tx.send((peer, signal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tags_round_trip_through_display_and_from_str() {
        for tag in [
            ErrorTag::NotConnected,
            ErrorTag::NotAvailable,
            ErrorTag::InProgress,
            ErrorTag::AlreadyConnected,
            ErrorTag::NotAllowed,
            ErrorTag::NotReady,
            ErrorTag::InvalidArgument,
            ErrorTag::Failed,
            ErrorTag::ConnectionAttemptFailed,
            ErrorTag::NotSupported,
        ] {
            let s = tag.to_string();
            assert!(!s.is_empty());
        }
    }

    #[tokio::test]
    async fn emit_delivers_signal_on_channel() {
        let (_calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let cp = ControlPlane::new(calls_rx, signals_tx);
        cp.emit(Address::any(), Signal::Connected);
        let (addr, sig) = signals_rx.recv().await.unwrap();
        assert_eq!(addr, Address::any());
        assert!(matches!(sig, Signal::Connected));
    }
}
