//! Telephony collaborator: call-control requests, responses and indications.
//!
//! The core never knows whether a call is real; it only forwards requests originating from
//! AT commands and reports whatever the Telephony collaborator indicates back onto the
//! control channel in AT syntax.

use tokio::sync::mpsc;

use crate::{ag::Indicator, Address};

/// 3GPP TS 27.007 `+CME ERROR` code. `0` is reserved by this crate to mean success and is
/// never sent on the wire as `+CME ERROR: 0`; see [`CmeError::NONE`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CmeError(pub u32);

impl CmeError {
    /// Request succeeded; core replies with a plain `OK`.
    pub const NONE: CmeError = CmeError(0);

    /// True if this represents success.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

/// A call-control request forwarded from an AT command to the Telephony collaborator.
///
/// Each variant corresponds to exactly one AT command handler in [`crate::handlers`]; see
/// that module for the wire-level argument validation that happens before a request is
/// ever constructed.
#[derive(Clone, Debug)]
pub enum Request {
    /// `AT+CMER`: enable/disable indicator event reporting.
    EventReporting { on: bool },
    /// `AT+CHLD=<n>` or `AT+CKPD` call-hold action, e.g. `"0"`, `"1"`, `"2"`, `"3"`.
    CallHold { action: String },
    /// `AT+CKPD` raw key-press sequence.
    KeyPress { keys: String },
    /// `ATA`: answer the current incoming call.
    AnswerCall,
    /// `AT+CHUP`: terminate the current call.
    TerminateCall,
    /// `AT+BTRH=<n>`: response-and-hold action.
    ResponseAndHold { value: i32 },
    /// `AT+BLDN`: redial the last dialed number.
    LastDialedNumber,
    /// `ATD<number>;`: dial a number.
    DialNumber { number: String },
    /// `AT+VTS=<ch>`: transmit one DTMF tone.
    TransmitDtmf { tone: char },
    /// `AT+CNUM`: list subscriber numbers.
    SubscriberNumber,
    /// `AT+CLCC`: list current calls.
    ListCurrentCalls,
    /// `AT+COPS?`: query the current network operator.
    OperatorSelection,
    /// `AT+NREC=0`: disable echo cancellation/noise reduction.
    NrAndEc { on: bool },
    /// Fire-and-forget notification that a peer reached CONNECTED, mirroring
    /// `telephony_device_connected` in the original reference AG. Collaborators may ignore
    /// the reply channel for this variant.
    DeviceConnected,
    /// Fire-and-forget notification that a peer left CONNECTED, mirroring
    /// `telephony_device_disconnected`. Collaborators may ignore the reply channel.
    DeviceDisconnected,
}

/// A single call record as reported by `AT+CLCC`.
#[derive(Clone, Debug)]
pub struct CallListEntry {
    /// 1-based call index.
    pub idx: u32,
    /// 0 = mobile originated, 1 = mobile terminated.
    pub direction: u8,
    /// Call status per 3GPP TS 27.007 `+CLCC` (0 = active .. 5 = waiting).
    pub status: u8,
    /// 0 = voice, 1 = data, 2 = fax.
    pub mode: u8,
    /// Whether this call is part of a multi-party conversation.
    pub multiparty: bool,
    /// Remote party number, if presentation is allowed.
    pub number: Option<String>,
    /// Remote party number type, valid only if `number.is_some()`.
    pub number_type: i32,
}

/// Out-of-band signal delivered by the Telephony collaborator at any time, independent of
/// a prior request.
#[derive(Clone, Debug)]
pub enum Indication {
    /// Telephony has initialized; supplies the AG feature mask, indicator table,
    /// response-and-hold default and CHLD descriptor.
    Ready { ag_features: u32, indicators: Vec<Indicator>, rh: i32, chld: String },
    /// One indicator's value changed; `wire_index` is 1-based.
    Event { wire_index: usize, value: i32 },
    /// Response-and-hold state changed.
    ResponseAndHold { value: i32 },
    /// A call is incoming; arms the ring cadence.
    IncomingCall { number: Option<String>, number_type: i32 },
    /// The current call (or ring) has stopped, e.g. the caller hung up before answer.
    CallingStopped,
    /// `+COPS` unsolicited update.
    OperatorSelection { mode: i32, operator: String },
    /// One row of an `AT+CLCC` response being streamed back.
    ListCurrentCall(CallListEntry),
    /// `+CNUM` subscriber number entry.
    SubscriberNumber { number: String, number_type: i32, service: i32 },
    /// `+CCWA` call waiting notification.
    CallWaiting { number: String, number_type: i32 },
}

/// One request awaiting a response, paired with the peer it originated from so the
/// collaborator can address its reply.
#[derive(Debug)]
pub struct RequestEnvelope {
    /// Peer the request originated from.
    pub peer: Address,
    /// The request itself.
    pub request: Request,
    /// Channel the collaborator must send exactly one [`CmeError`] response on.
    pub reply: tokio::sync::oneshot::Sender<CmeError>,
}

/// Handle the core uses to submit requests to, and receive indications from, the Telephony
/// collaborator.
///
/// Requests flow core → collaborator over `requests`; indications flow collaborator → core
/// over a separate channel the collaborator is given at construction time (see
/// [`crate::gateway::Gateway::new`]). This split-channel shape mirrors the
/// `rfcomm::profile::RegisteredProfile` request/response/closed-notification pattern.
#[derive(Debug)]
pub struct Telephony {
    requests_tx: mpsc::UnboundedSender<RequestEnvelope>,
}

impl Telephony {
    /// Wraps a raw request sender, typically the core-facing half returned by the
    /// collaborator's own constructor.
    pub fn new(requests_tx: mpsc::UnboundedSender<RequestEnvelope>) -> Self {
        Self { requests_tx }
    }

    /// Submits `request` on behalf of `peer`, returning a receiver for its eventual
    /// [`CmeError`] response.
    pub fn submit(
        &self, peer: Address, request: Request,
    ) -> tokio::sync::oneshot::Receiver<CmeError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.requests_tx.send(RequestEnvelope { peer, request, reply: reply_tx });
        reply_rx
    }

    /// Fire-and-forget notification that `peer` transitioned to CONNECTED, mirroring
    /// `telephony_device_connected` in the original reference AG.
    pub fn notify_device_connected(&self, peer: Address) {
        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.requests_tx.send(RequestEnvelope { peer, request: Request::DeviceConnected, reply: reply_tx });
    }

    /// Fire-and-forget notification that `peer` left CONNECTED, mirroring
    /// `telephony_device_disconnected` in the original reference AG.
    pub fn notify_device_disconnected(&self, peer: Address) {
        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
        let _ =
            self.requests_tx.send(RequestEnvelope { peer, request: Request::DeviceDisconnected, reply: reply_tx });
    }
}
