//! Notification broadcaster: fans out unsolicited AT notifications to filtered subsets of
//! active peers, per §4.H. Stateless beyond the peer table it is handed each call.

use crate::{framer, peer::PeerSession};

/// One fan-out notification originating from a Telephony indication.
#[derive(Clone, Debug)]
pub enum Notification {
    /// `+CIEV: <idx>,<value>`, gated on the peer's `er_ind`/HFP-ness.
    IndicatorEvent { wire_index: usize, value: i32 },
    /// `+BTRH: <value>`, HFP peers only.
    ResponseAndHold { value: i32 },
    /// `+CLCC: ...`, HFP peers only; payload is pre-formatted by the caller.
    ListCurrentCall { line: String },
    /// `+CNUM: ...`, HFP peers only; payload is pre-formatted by the caller.
    SubscriberNumber { line: String },
    /// `+COPS: ...`, HFP peers only; payload is pre-formatted by the caller.
    OperatorSelection { line: String },
    /// `+CCWA: <number>,<type>`, only to peers with call waiting enabled.
    CallWaiting { number: String, number_type: i32 },
    /// One RING tick; `+CLIP` is appended per-peer if the peer has CLI presentation on.
    Ring { number: Option<String>, number_type: i32 },
}

/// Whether `peer` should receive `notification`, per the filter predicates in §4.H.
pub fn applies_to(notification: &Notification, peer: &PeerSession) -> bool {
    match notification {
        Notification::IndicatorEvent { .. } => peer.is_hfp(),
        Notification::ResponseAndHold { .. } => peer.is_hfp(),
        Notification::ListCurrentCall { .. } => peer.is_hfp(),
        Notification::SubscriberNumber { .. } => peer.is_hfp(),
        Notification::OperatorSelection { .. } => peer.is_hfp(),
        Notification::CallWaiting { .. } => peer.is_hfp() && peer.cwa_enabled,
        Notification::Ring { .. } => true,
    }
}

/// Renders the framed bytes to send to `peer` for `notification`, or `None` if filtered out.
///
/// `er_ind` gates [`Notification::IndicatorEvent`] per §4.H ("only when `er_ind` is on").
pub fn render(notification: &Notification, peer: &PeerSession, er_ind: bool) -> Option<Vec<u8>> {
    if !applies_to(notification, peer) {
        return None;
    }
    match notification {
        Notification::IndicatorEvent { wire_index, value } => {
            if !er_ind {
                return None;
            }
            Some(framer::frame_line(&format!("+CIEV: {wire_index},{value}")))
        }
        Notification::ResponseAndHold { value } => Some(framer::frame_line(&format!("+BTRH: {value}"))),
        Notification::ListCurrentCall { line } => Some(framer::frame_line(line)),
        Notification::SubscriberNumber { line } => Some(framer::frame_line(line)),
        Notification::OperatorSelection { line } => Some(framer::frame_line(line)),
        Notification::CallWaiting { number, number_type } => {
            Some(framer::frame_line(&format!("+CCWA: \"{number}\",{number_type}")))
        }
        Notification::Ring { number, number_type } => {
            let mut out = framer::frame_line("RING");
            if peer.is_hfp() && peer.cli_active {
                if let Some(number) = number {
                    out.extend_from_slice(&framer::frame_line(&format!("+CLIP: \"{number}\",{number_type}")));
                }
            }
            Some(out)
        }
    }
}

/// Renders `notification` for every peer in `peers` it applies to, returning
/// `(address, framed bytes)` pairs in `peers`' iteration order.
pub fn fan_out<'a>(
    notification: &Notification, peers: impl Iterator<Item = &'a PeerSession>, er_ind: bool,
) -> Vec<(crate::Address, Vec<u8>)> {
    peers.filter_map(|peer| render(notification, peer, er_ind).map(|bytes| (peer.address, bytes))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peer::Profile, Address};

    fn hfp_peer() -> PeerSession {
        let mut peer = PeerSession::new(Address::any());
        peer.profile = Some(Profile::Hfp);
        peer
    }

    fn hsp_peer() -> PeerSession {
        let mut peer = PeerSession::new(Address::new([1, 1, 1, 1, 1, 1]));
        peer.profile = Some(Profile::Hsp);
        peer
    }

    #[test]
    fn indicator_events_only_go_to_hfp_peers_when_er_ind_on() {
        let hfp = hfp_peer();
        let hsp = hsp_peer();
        let notif = Notification::IndicatorEvent { wire_index: 2, value: 1 };
        assert!(render(&notif, &hfp, true).is_some());
        assert!(render(&notif, &hfp, false).is_none());
        assert!(render(&notif, &hsp, true).is_none());
    }

    #[test]
    fn call_waiting_requires_cwa_enabled() {
        let mut hfp = hfp_peer();
        let notif = Notification::CallWaiting { number: "555".into(), number_type: 129 };
        assert!(render(&notif, &hfp, true).is_none());
        hfp.cwa_enabled = true;
        assert!(render(&notif, &hfp, true).is_some());
    }

    #[test]
    fn ring_reaches_all_peers_but_clip_is_hfp_and_cli_only() {
        let mut hfp = hfp_peer();
        hfp.cli_active = true;
        let hsp = hsp_peer();
        let notif = Notification::Ring { number: Some("555".into()), number_type: 129 };

        let hfp_bytes = render(&notif, &hfp, true).unwrap();
        assert!(hfp_bytes.windows(5).any(|w| w == b"+CLIP"));

        let hsp_bytes = render(&notif, &hsp, true).unwrap();
        assert!(!hsp_bytes.windows(5).any(|w| w == b"+CLIP"));
    }

    #[test]
    fn fan_out_collects_addressed_frames_in_order() {
        let hfp = hfp_peer();
        let hsp = hsp_peer();
        let peers = vec![hfp, hsp];
        let notif = Notification::Ring { number: None, number_type: 0 };
        let out = fan_out(&notif, peers.iter(), true);
        assert_eq!(out.len(), 2);
    }
}
