//! Per-peer session state: profile, transport handles, pending operations and gains.

use strum::{Display, EnumString};

use crate::Address;

/// Which profile a peer connected under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
pub enum Profile {
    /// Headset Profile.
    Hsp,
    /// Hands-Free Profile.
    Hfp,
}

/// Connection lifecycle state of a peer session.
///
/// See the module-level documentation of [`crate::gateway`] for the full transition diagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
pub enum State {
    /// No transport open.
    Disconnected,
    /// RFCOMM (and, for HFP, the SLC handshake) is being established.
    ConnectInProgress,
    /// RFCOMM/SLC is up; audio is not flowing.
    Connected,
    /// SCO is being established on top of an already-`Connected` session.
    PlayInProgress,
    /// RFCOMM and SCO are both up.
    Playing,
}

impl State {
    /// Ordinal used to express "at least CONNECTED" comparisons (invariant P2 and friends).
    fn rank(self) -> u8 {
        match self {
            State::Disconnected => 0,
            State::ConnectInProgress => 1,
            State::Connected => 2,
            State::PlayInProgress => 3,
            State::Playing => 4,
        }
    }

    /// True if the session counts as a member of the active-peer set (state ≥ CONNECTED).
    pub fn is_active(self) -> bool {
        self.rank() >= State::Connected.rank()
    }
}

/// A target state a [`PendingOp`] is driving the session towards.
///
/// Only `Connected` and `Playing` are valid targets; ordering matters because an
/// in-flight operation's target may be upgraded from `Connected` to `Playing` but never
/// downgraded (invariant P4).
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Target {
    /// Bring the session up to (at least) CONNECTED.
    Connected,
    /// Bring the session up to PLAYING.
    Playing,
}

/// An opaque handle identifying one registered completion callback within a [`PendingOp`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CallbackId(pub(crate) u64);

/// A single outstanding connect/play request, possibly shared by several callers.
///
/// At most one of these exists per peer at a time (invariant P3). Multiple control-plane
/// callers racing to bring up the same peer attach their callback to the same `PendingOp`
/// rather than issuing redundant transport requests; the gateway event loop tracks the
/// actual reply channels keyed by the [`CallbackId`]s minted here (see
/// `Gateway::pending_replies`), since a reply sink is not `Clone`/`Debug` and does not
/// belong in the otherwise-pure lifecycle data model.
#[derive(Debug, Default)]
pub struct PendingOp {
    target: Option<Target>,
    next_id: u64,
}

impl PendingOp {
    /// Starts a new pending operation with the given target.
    pub fn new(target: Target) -> Self {
        Self { target: Some(target), ..Default::default() }
    }

    /// Current target state, if any operation is in flight.
    pub fn target(&self) -> Option<Target> {
        self.target
    }

    /// Upgrades the target to `Playing` if it is currently `Connected`. Never downgrades.
    pub fn upgrade(&mut self, target: Target) {
        match self.target {
            None => self.target = Some(target),
            Some(existing) if target > existing => self.target = Some(target),
            Some(_) => {}
        }
    }

    /// Mints a new completion callback id, to be paired with a reply sink by the caller.
    pub fn add_callback(&mut self) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Advisory locks a consumer may hold on a session to keep its audio path alive without
/// itself driving state transitions (`headset_lock`/`headset_unlock`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Lock {
    /// Consumer intends to read audio from the session.
    pub read: bool,
    /// Consumer intends to write audio to the session.
    pub write: bool,
}

impl Lock {
    /// True if no lock bits are held.
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// A peer's gain setting: unknown until the peer or a control-plane caller sets one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Gain {
    /// No gain has been reported yet.
    Unknown,
    /// A gain value in `0..=15`.
    Level(u8),
}

impl Gain {
    /// Parses a gain value, validating the `0..=15` range (AT+VGS/AT+VGM argument contract).
    pub fn parse(raw: i32) -> Option<Self> {
        if (0..=15).contains(&raw) {
            Some(Gain::Level(raw as u8))
        } else {
            None
        }
    }

    /// Current numeric value, if known.
    pub fn value(&self) -> Option<u8> {
        match self {
            Gain::Unknown => None,
            Gain::Level(v) => Some(*v),
        }
    }
}

/// Fixed-capacity ring buffer backing the AT line framer's unread-byte accumulator.
///
/// Overflow is treated as a fatal session error: a peer exceeding capacity without a
/// `\r` terminator is assumed to be misbehaving (see [`crate::framer`]).
#[derive(Debug)]
pub struct InputBuffer {
    data: Vec<u8>,
    start: usize,
    length: usize,
}

impl InputBuffer {
    /// Minimum buffer capacity mandated by the AT line framer contract.
    pub const MIN_CAPACITY: usize = 1024;

    /// Creates a new buffer with the given capacity (clamped up to [`Self::MIN_CAPACITY`]).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(Self::MIN_CAPACITY);
        Self { data: vec![0u8; capacity], start: 0, length: 0 }
    }

    /// Number of unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Appends bytes, returning `false` if this would overflow capacity.
    #[must_use]
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if self.length + bytes.len() > self.data.len() {
            return false;
        }
        let cap = self.data.len();
        for (i, b) in bytes.iter().enumerate() {
            self.data[(self.start + self.length + i) % cap] = *b;
        }
        self.length += bytes.len();
        true
    }

    /// Consumes and returns all buffered bytes, resetting the buffer.
    pub fn drain_all(&mut self) -> Vec<u8> {
        let cap = self.data.len();
        let mut out = Vec::with_capacity(self.length);
        for i in 0..self.length {
            out.push(self.data[(self.start + i) % cap]);
        }
        self.start = 0;
        self.length = 0;
        out
    }
}

/// A single peer's session record.
#[derive(Debug)]
pub struct PeerSession {
    /// Remote device address.
    pub address: Address,
    /// Profile the peer connected under. Unset until RFCOMM connects.
    pub profile: Option<Profile>,
    /// Lifecycle state.
    pub state: State,
    /// Discovered RFCOMM channel number, `None` until SDP completes.
    pub rfcomm_channel: Option<u8>,
    /// True once the RFCOMM connect has actually completed (set on [`crate::lifecycle::Event::RfcommUp`],
    /// cleared on teardown). Distinct from `state`, which for HFP stays `ConnectInProgress`
    /// while the SLC handshake runs even though the RFCOMM channel itself is already open.
    pub rfcomm_open: bool,
    /// HF feature bitmask received via AT+BRSF.
    pub hf_features: u32,
    /// AT+CLIP reporting enabled.
    pub cli_active: bool,
    /// AT+CMEE reporting enabled.
    pub cme_enabled: bool,
    /// AT+CCWA reporting enabled.
    pub cwa_enabled: bool,
    /// Current noise reduction/echo cancellation state, reset to `true` on RFCOMM teardown.
    pub nrec: bool,
    /// Requested NREC value, pending Telephony confirmation.
    pub nrec_req: bool,
    /// Set when SCO must be (re-)established before the ring cadence can start.
    pub pending_ring: bool,
    /// Session was auto-opened on behalf of a consumer and is eligible for auto-disconnect.
    pub auto_dc: bool,
    /// Speaker gain.
    pub sp_gain: Gain,
    /// Microphone gain.
    pub mic_gain: Gain,
    /// Unread RFCOMM bytes awaiting a `\r` terminator.
    pub input_buffer: InputBuffer,
    /// At most one outstanding connect/play operation.
    pub pending: Option<PendingOp>,
    /// Advisory locks held by upstream consumers.
    pub lock: Lock,
}

impl PeerSession {
    /// Creates a new, disconnected session for `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            profile: None,
            state: State::Disconnected,
            rfcomm_channel: None,
            rfcomm_open: false,
            hf_features: 0,
            cli_active: false,
            cme_enabled: false,
            cwa_enabled: false,
            nrec: true,
            nrec_req: true,
            pending_ring: false,
            auto_dc: false,
            sp_gain: Gain::Unknown,
            mic_gain: Gain::Unknown,
            input_buffer: InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY),
            pending: None,
            lock: Lock::default(),
        }
    }

    /// True if this session is HFP (as opposed to HSP or not-yet-determined).
    pub fn is_hfp(&self) -> bool {
        matches!(self.profile, Some(Profile::Hfp))
    }

    /// Resets RFCOMM-scoped state on control-channel teardown, mirroring
    /// `headset_close_rfcomm` in the original reference AG.
    pub fn reset_rfcomm_state(&mut self) {
        self.nrec = true;
        self.nrec_req = true;
        self.cli_active = false;
        self.cme_enabled = false;
        self.cwa_enabled = false;
        self.hf_features = 0;
        self.pending_ring = false;
        self.input_buffer = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_rank_orders_lifecycle_states() {
        assert!(State::Disconnected.rank() < State::ConnectInProgress.rank());
        assert!(State::Connected.is_active());
        assert!(State::Playing.is_active());
        assert!(!State::ConnectInProgress.is_active());
        assert!(!State::Disconnected.is_active());
    }

    #[test]
    fn pending_op_upgrades_but_never_downgrades() {
        let mut pending = PendingOp::new(Target::Connected);
        pending.upgrade(Target::Playing);
        assert_eq!(pending.target(), Some(Target::Playing));
        pending.upgrade(Target::Connected);
        assert_eq!(pending.target(), Some(Target::Playing));
    }

    #[test]
    fn gain_parse_rejects_out_of_range() {
        assert_eq!(Gain::parse(0), Some(Gain::Level(0)));
        assert_eq!(Gain::parse(15), Some(Gain::Level(15)));
        assert_eq!(Gain::parse(16), None);
        assert_eq!(Gain::parse(-1), None);
    }

    #[test]
    fn input_buffer_rejects_overflow() {
        let mut buf = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
        let huge = vec![b'x'; InputBuffer::MIN_CAPACITY + 1];
        assert!(!buf.push(&huge));
    }

    #[test]
    fn input_buffer_push_and_drain_round_trips() {
        let mut buf = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
        assert!(buf.push(b"AT+BRSF=0\r"));
        assert_eq!(buf.drain_all(), b"AT+BRSF=0\r");
        assert!(buf.is_empty());
    }

    #[test]
    fn reset_rfcomm_state_restores_nrec_default() {
        let mut peer = PeerSession::new(Address::any());
        peer.nrec = false;
        peer.cli_active = true;
        peer.reset_rfcomm_state();
        assert!(peer.nrec);
        assert!(!peer.cli_active);
    }
}
