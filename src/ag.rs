//! Process-wide Audio Gateway state: feature mask, indicators, active-peer registry.

use crate::Address;

/// One entry of the CIND indicator table, as supplied by the Telephony collaborator on
/// `ready`.
#[derive(Clone, Debug)]
pub struct Indicator {
    /// Indicator name, e.g. `"service"`, `"call"`, `"callsetup"`.
    pub name: String,
    /// Valid value range, e.g. `(0, 1)`.
    pub range: (i32, i32),
    /// Current value.
    pub value: i32,
}

/// Process-wide Audio Gateway state.
///
/// Owned exclusively by the task running [`crate::gateway::Gateway::run`]; never shared
/// across threads and never wrapped in a `Mutex` (see the crate's concurrency model).
#[derive(Debug)]
pub struct AgState {
    /// Set once the Telephony collaborator has sent its `ready` indication.
    pub telephony_ready: bool,
    /// AG feature bitmask advertised via `+BRSF` (see [`crate::transport::ag_features`]).
    pub ag_features: u32,
    /// Indicator table, ordered; wire index is 1-based.
    pub indicators: Vec<Indicator>,
    /// Current CMER reporting mode. Defaults to 3, the value the original reference AG
    /// always assumed before the first CMER exchange.
    pub er_mode: i32,
    /// Current CMER indicator-activation selector; indications are only broadcast when
    /// this is enabled.
    pub er_ind: bool,
    /// Response-and-hold state; `-1` means inactive.
    pub rh: i32,
    /// Descriptor of supported CHLD actions, reported verbatim in `+CHLD: (...)`.
    pub chld: String,
    /// Currently presented incoming-call number, if any.
    pub incoming_number: Option<String>,
    /// Type of `incoming_number`, per 3GPP TS 27.007 (e.g. 129 = national, 145 = international).
    pub number_type: i32,
    /// Peers currently in a state ≥ CONNECTED, in connection order (invariant P2).
    pub active_peers: Vec<Address>,
}

impl Default for AgState {
    fn default() -> Self {
        Self {
            telephony_ready: false,
            ag_features: 0,
            indicators: Vec::new(),
            er_mode: 3,
            er_ind: false,
            rh: -1,
            chld: String::new(),
            incoming_number: None,
            number_type: 0,
            active_peers: Vec::new(),
        }
    }
}

impl AgState {
    /// Applies the Telephony collaborator's `ready` indication.
    pub fn set_ready(&mut self, features: u32, indicators: Vec<Indicator>, rh: i32, chld: String) {
        self.telephony_ready = true;
        self.ag_features = features;
        self.indicators = indicators;
        self.rh = rh;
        self.chld = chld;
    }

    /// Looks up an indicator's 1-based wire index by name.
    pub fn indicator_index(&self, name: &str) -> Option<usize> {
        self.indicators.iter().position(|i| i.name == name).map(|i| i + 1)
    }

    /// Updates an indicator's value by its 1-based wire index, returning the new value if
    /// the index was valid.
    pub fn set_indicator(&mut self, wire_index: usize, value: i32) -> Option<i32> {
        let slot = self.indicators.get_mut(wire_index.checked_sub(1)?)?;
        slot.value = value;
        Some(value)
    }

    /// Adds a peer to the active set (CONNECTED-entry side effect, invariant P2).
    pub fn mark_active(&mut self, addr: Address) {
        if !self.active_peers.contains(&addr) {
            self.active_peers.push(addr);
        }
    }

    /// Removes a peer from the active set (DISCONNECTED-entry side effect, invariant P2).
    pub fn mark_inactive(&mut self, addr: Address) {
        self.active_peers.retain(|a| *a != addr);
    }

    /// True if at least one peer is active (invariant P5 precondition for an armed ring timer).
    pub fn has_active_peers(&self) -> bool {
        !self.active_peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators() -> Vec<Indicator> {
        vec![
            Indicator { name: "service".into(), range: (0, 1), value: 0 },
            Indicator { name: "call".into(), range: (0, 1), value: 0 },
            Indicator { name: "callsetup".into(), range: (0, 3), value: 0 },
        ]
    }

    #[test]
    fn indicator_index_is_one_based() {
        let mut ag = AgState::default();
        ag.set_ready(0x1ff, indicators(), -1, "0,1,2,3".into());
        assert_eq!(ag.indicator_index("service"), Some(1));
        assert_eq!(ag.indicator_index("callsetup"), Some(3));
        assert_eq!(ag.indicator_index("nope"), None);
    }

    #[test]
    fn set_indicator_updates_value_at_wire_index() {
        let mut ag = AgState::default();
        ag.set_ready(0x1ff, indicators(), -1, "0,1,2,3".into());
        assert_eq!(ag.set_indicator(2, 1), Some(1));
        assert_eq!(ag.indicators[1].value, 1);
        assert_eq!(ag.set_indicator(99, 1), None);
    }

    #[test]
    fn active_peer_set_tracks_membership() {
        let mut ag = AgState::default();
        let a = Address::new([1, 2, 3, 4, 5, 6]);
        assert!(!ag.has_active_peers());
        ag.mark_active(a);
        ag.mark_active(a);
        assert_eq!(ag.active_peers.len(), 1);
        ag.mark_inactive(a);
        assert!(!ag.has_active_peers());
    }

    #[test]
    fn default_er_mode_matches_legacy_assumption() {
        assert_eq!(AgState::default().er_mode, 3);
    }
}
