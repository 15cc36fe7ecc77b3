//! Configuration: the single `General/SCORouting` key.
//!
//! Parsing an actual configuration file is out of scope for this crate; embedders construct
//! [`Config`] programmatically, typically after reading their own config format.

use strum::{Display, EnumString};

/// Where SCO audio is routed, per `General/SCORouting`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Display, EnumString)]
pub enum ScoRouting {
    /// Audio is routed over the HCI transport, under this crate's control. This is the
    /// default.
    #[default]
    Hci,
    /// Audio is routed directly over PCM by the controller; this crate never opens SCO
    /// itself in this mode.
    Pcm,
}

/// Audio gateway configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// `General/SCORouting`.
    pub sco_routing: ScoRouting,
    /// Whether local HFP support is enabled. When `false`, every peer connects as HSP
    /// regardless of which SDP record it exposes (§4.G transport acquisition).
    pub hfp_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { sco_routing: ScoRouting::default(), hfp_enabled: true }
    }
}

impl Config {
    /// When `true`, a control-plane `Play` request must be refused with `NotAvailable`
    /// because SCO is owned by the kernel audio routing rather than this crate (§6).
    pub fn play_unavailable(&self) -> bool {
        matches!(self.sco_routing, ScoRouting::Hci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routing_is_hci() {
        assert_eq!(Config::default().sco_routing, ScoRouting::Hci);
    }

    #[test]
    fn hci_routing_refuses_play() {
        let cfg = Config { sco_routing: ScoRouting::Hci, hfp_enabled: true };
        assert!(cfg.play_unavailable());
        let cfg = Config { sco_routing: ScoRouting::Pcm, hfp_enabled: true };
        assert!(!cfg.play_unavailable());
    }
}
