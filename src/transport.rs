//! Transport collaborator: RFCOMM/SCO channel acquisition and SDP search.
//!
//! This crate does not open Bluetooth sockets or build SDP records itself (see the crate's
//! Non-goals); it defines the shape of the collaborator that does, and the well-known
//! service-class UUIDs and AG/HF feature bitmasks needed to drive it.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{ag::Indicator, peer::Profile, Address, Result, UuidExt};

/// HSP Headset service class UUID (`0x1108`).
pub const HSP_HS_UUID: Uuid = Uuid::from_u128(0x00001108_0000_1000_8000_00805f9b34fb);
/// HSP Audio Gateway service class UUID (`0x1112`).
pub const HSP_AG_UUID: Uuid = Uuid::from_u128(0x00001112_0000_1000_8000_00805f9b34fb);
/// HFP Hands-Free service class UUID (`0x111e`).
pub const HFP_HS_UUID: Uuid = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);
/// HFP Audio Gateway service class UUID (`0x111f`).
pub const HFP_AG_UUID: Uuid = Uuid::from_u128(0x0000111f_0000_1000_8000_00805f9b34fb);

/// AG-side feature bits advertised via `+BRSF` (HFP 1.5 §5.3).
pub mod ag_features {
    /// Three-way calling supported.
    pub const THREE_WAY_CALLING: u32 = 0x001;
    /// Echo cancellation and/or noise reduction supported.
    pub const EC_ANDOR_NR: u32 = 0x002;
    /// Voice recognition activation supported.
    pub const VOICE_RECOGNITION: u32 = 0x004;
    /// In-band ring tone capability.
    pub const INBAND_RINGTONE: u32 = 0x008;
    /// Attach a phone number to a voice tag.
    pub const ATTACH_NUMBER_TO_VOICETAG: u32 = 0x010;
    /// Ability to reject an incoming call.
    pub const REJECT_A_CALL: u32 = 0x020;
    /// Enhanced call status.
    pub const ENHANCED_CALL_STATUS: u32 = 0x040;
    /// Enhanced call control.
    pub const ENHANCED_CALL_CONTROL: u32 = 0x080;
    /// Extended error result codes (`+CME ERROR`).
    pub const EXTENDED_ERROR_RESULT_CODES: u32 = 0x100;
}

/// HF-side feature bits received via `AT+BRSF=<mask>` (HFP 1.5 §5.3), parsing only.
pub mod hf_features {
    /// Echo cancellation and/or noise reduction supported.
    pub const EC_ANDOR_NR: u32 = 0x01;
    /// Call waiting and three-way calling supported.
    pub const CALL_WAITING_AND_3WAY: u32 = 0x02;
    /// CLI presentation supported.
    pub const CLI_PRESENTATION: u32 = 0x04;
    /// Voice recognition activation supported.
    pub const VOICE_RECOGNITION: u32 = 0x08;
    /// Remote volume control supported.
    pub const REMOTE_VOLUME_CONTROL: u32 = 0x10;
    /// Enhanced call status.
    pub const ENHANCED_CALL_STATUS: u32 = 0x20;
    /// Enhanced call control.
    pub const ENHANCED_CALL_CONTROL: u32 = 0x40;
}

/// Both sides supporting three-way calling is the SLC-completion condition checked after
/// the CMER handshake (§4.F of the design notes).
pub fn both_support_three_way(ag_features: u32, hf_features: u32) -> bool {
    ag_features & ag_features::THREE_WAY_CALLING != 0 && hf_features & hf_features::CALL_WAITING_AND_3WAY != 0
}

/// Outcome of an SDP search submitted to the transport collaborator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceRecord {
    /// Which profile the matched record advertises.
    pub profile: Profile,
    /// RFCOMM channel number extracted from the record's access-protocol descriptor.
    pub channel: u8,
}

/// Collaborator that owns Bluetooth socket primitives and SDP record lookups.
///
/// Every method *submits* a request and returns immediately; the outcome is delivered
/// through the supplied `oneshot::Sender`. This mirrors the submit-and-callback idiom used
/// throughout the crate (see [`crate::gateway`] and the `rfcomm::profile` request/response
/// channel pattern it is modeled on) and keeps the core's event loop from ever blocking on
/// a collaborator. Implementors must not call back into the core from within these methods;
/// the reply should be sent from whatever task actually performs the I/O.
pub trait Transport: Send + Sync {
    /// Searches for an HFP or HSP service record on `addr`, returning the RFCOMM channel to
    /// connect to. `want_hfp` is true when local HFP support is enabled and should be
    /// searched first.
    fn sdp_search(&self, addr: Address, want_hfp: bool, reply: oneshot::Sender<Result<ServiceRecord>>);

    /// Opens the RFCOMM control channel to `addr` on `channel`.
    fn connect_rfcomm(&self, addr: Address, channel: u8, reply: oneshot::Sender<Result<()>>);

    /// Closes the RFCOMM control channel to `addr`, if open.
    fn close_rfcomm(&self, addr: Address);

    /// Writes a framed AT response (already wrapped in `\r\n...\r\n`) to `addr`'s RFCOMM
    /// channel.
    fn send(&self, addr: Address, data: Vec<u8>, reply: oneshot::Sender<Result<()>>);

    /// Opens the SCO audio channel to `addr`.
    fn connect_sco(&self, addr: Address, reply: oneshot::Sender<Result<()>>);

    /// Closes the SCO audio channel to `addr`, if open.
    fn close_sco(&self, addr: Address);
}

/// Helper used by the SLC orchestrator / lifecycle machinery to decide whether a freshly
/// discovered record should be treated as HFP or HSP (§4.G transport acquisition).
pub fn profile_for_record(record: &ServiceRecord, hfp_locally_enabled: bool) -> Profile {
    if hfp_locally_enabled {
        record.profile
    } else {
        Profile::Hsp
    }
}

/// Converts a 16-bit Bluetooth service class UUID to its full 128-bit representation, for
/// embedders assembling SDP search patterns (re-exported convenience over [`UuidExt`]).
pub fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u16(v)
}

/// The indicator table a Telephony collaborator typically supplies, useful for tests and
/// example embedders. Not normative: the real table always comes from Telephony's `ready`
/// indication.
pub fn default_indicators() -> Vec<Indicator> {
    vec![
        Indicator { name: "service".into(), range: (0, 1), value: 0 },
        Indicator { name: "call".into(), range: (0, 1), value: 0 },
        Indicator { name: "callsetup".into(), range: (0, 3), value: 0 },
        Indicator { name: "callheld".into(), range: (0, 2), value: 0 },
        Indicator { name: "signal".into(), range: (0, 5), value: 0 },
        Indicator { name: "roam".into(), range: (0, 1), value: 0 },
        Indicator { name: "battchg".into(), range: (0, 5), value: 5 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_uuids_short_form_round_trips() {
        assert_eq!(HFP_AG_UUID.as_u16(), Some(0x111f));
        assert_eq!(HSP_HS_UUID.as_u16(), Some(0x1108));
    }

    #[test]
    fn three_way_requires_both_sides() {
        assert!(both_support_three_way(ag_features::THREE_WAY_CALLING, hf_features::CALL_WAITING_AND_3WAY));
        assert!(!both_support_three_way(0, hf_features::CALL_WAITING_AND_3WAY));
        assert!(!both_support_three_way(ag_features::THREE_WAY_CALLING, 0));
    }

    #[test]
    fn full_ag_feature_mask_matches_nine_bits() {
        let all = ag_features::THREE_WAY_CALLING
            | ag_features::EC_ANDOR_NR
            | ag_features::VOICE_RECOGNITION
            | ag_features::INBAND_RINGTONE
            | ag_features::ATTACH_NUMBER_TO_VOICETAG
            | ag_features::REJECT_A_CALL
            | ag_features::ENHANCED_CALL_STATUS
            | ag_features::ENHANCED_CALL_CONTROL
            | ag_features::EXTENDED_ERROR_RESULT_CODES;
        assert_eq!(all, 0x1FF);
    }
}
