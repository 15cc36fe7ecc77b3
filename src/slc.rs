//! SLC orchestrator: decides when the HFP feature-exchange handshake is complete.
//!
//! The handshake completes at one of two handler sites (§4.F): right after the `OK` closing
//! `AT+CMER` (if three-way calling is not mutually supported), or right after the `OK`
//! closing `AT+CHLD=?` (if it is). [`crate::handlers::handle`] tags its [`crate::handlers::Outcome`]
//! with the checkpoint that applies; the gateway evaluates it once the reply has been sent.

use crate::{peer::State, transport::both_support_three_way};

/// A point in the AT exchange at which SLC completion must be (re-)evaluated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlcCheckpoint {
    /// Just sent the `OK` closing an `AT+CMER` exchange.
    AfterCmer,
    /// Just sent the `OK` closing an `AT+CHLD=?` query.
    AfterChldTest,
}

/// Evaluates whether SLC should complete at `checkpoint`, given the current lifecycle
/// state and feature masks. Returns `true` iff the peer should transition to CONNECTED.
pub fn should_complete(checkpoint: SlcCheckpoint, state: State, ag_features: u32, hf_features: u32) -> bool {
    if state != State::ConnectInProgress {
        return false;
    }
    match checkpoint {
        SlcCheckpoint::AfterCmer => !both_support_three_way(ag_features, hf_features),
        SlcCheckpoint::AfterChldTest => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ag_features as ag, hf_features as hf};

    #[test]
    fn completes_after_cmer_when_three_way_not_mutual() {
        assert!(should_complete(SlcCheckpoint::AfterCmer, State::ConnectInProgress, 0, 0));
    }

    #[test]
    fn defers_to_chld_when_three_way_is_mutual() {
        assert!(!should_complete(
            SlcCheckpoint::AfterCmer,
            State::ConnectInProgress,
            ag::THREE_WAY_CALLING,
            hf::CALL_WAITING_AND_3WAY
        ));
        assert!(should_complete(
            SlcCheckpoint::AfterChldTest,
            State::ConnectInProgress,
            ag::THREE_WAY_CALLING,
            hf::CALL_WAITING_AND_3WAY
        ));
    }

    #[test]
    fn no_op_once_already_connected() {
        assert!(!should_complete(SlcCheckpoint::AfterCmer, State::Connected, 0, 0));
    }
}
