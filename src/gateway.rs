//! Event loop: wires the lifecycle state machine, AT dispatcher, SLC orchestrator, ring
//! scheduler and notification broadcaster together against the Transport, Telephony and
//! ControlPlane collaborators.
//!
//! Everything here runs on a single task. [`AgState`] and the peer table are owned
//! exclusively by [`Gateway::run`] and mutated only from within it, so none of this needs a
//! `Mutex`. Multiple in-flight collaborator calls are tracked concurrently through
//! `FuturesUnordered`, the same idiom `rfcomm::profile::ProfileHandle` uses for its
//! `ConnectRequest` stream.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Duration, Instant},
};

use crate::{
    ag::AgState,
    broadcast::{self, Notification},
    config::Config,
    control::{ControlPlane, LockKind, Method, MethodCall, MethodReply, Property, Signal},
    dispatch::{self, Command},
    framer, handlers,
    lifecycle::{self, Effect, Event, AUTO_DISCONNECT},
    peer::{CallbackId, Gain, Lock, PeerSession, State, Target},
    ring::RingScheduler,
    slc::{self, SlcCheckpoint},
    telephony::{CallListEntry, CmeError, Indication, Request, Telephony},
    transport::{self, ag_features, ServiceRecord, Transport},
    Address, Error, ErrorKind, InternalErrorKind,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ReplyTx = oneshot::Sender<Result<MethodReply, ErrorKind>>;

/// One chunk of data, or a hangup, arriving from a peer's open RFCOMM channel.
#[derive(Debug)]
pub enum PeerInput {
    /// Raw bytes read off the channel.
    Data(Vec<u8>),
    /// The channel hung up or errored.
    Closed,
}

/// Outcome of a transport request previously submitted through [`Gateway::apply_effects`].
enum TransportEvent {
    Sdp { peer: Address, result: crate::Result<ServiceRecord> },
    RfcommConnected { peer: Address, result: crate::Result<()> },
    ScoConnected { peer: Address, result: crate::Result<()> },
}

/// What a completed Telephony request should do to AG/peer state beyond the AT reply
/// itself. Most requests only need the reply; a handful also mutate state, but only once
/// Telephony confirms the request actually succeeded.
enum TelephonyReplyKind {
    Plain,
    Chup,
    Nrec { enabled: bool },
    EventReporting { on: bool, checkpoint: SlcCheckpoint },
}

struct TelephonyEvent {
    peer: Address,
    cme_enabled: bool,
    kind: TelephonyReplyKind,
    cme: CmeError,
}

/// Fallback CME code (3GPP "unknown") used when a Telephony reply channel is dropped
/// without an answer.
const CHANNEL_CLOSED_CME: CmeError = CmeError(100);

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 60 * 60)
}

fn channel_closed<T>() -> crate::Result<T> {
    Err(Error::new(ErrorKind::Internal(InternalErrorKind::ChannelClosed)))
}

/// Drives every registered peer through the HSP/HFP lifecycle: dispatches AT commands,
/// forwards call-control requests to Telephony, and fans out its indications.
///
/// Construct with [`Gateway::new`], register peers as their RFCOMM channel is discovered
/// (or let an auto-opening control-plane call register them lazily), and run
/// [`Gateway::run`] to completion on a `tokio` runtime.
pub struct Gateway {
    config: Config,
    ag: AgState,
    peers: HashMap<Address, PeerSession>,
    transport: Arc<dyn Transport>,
    telephony: Telephony,
    telephony_indications: mpsc::UnboundedReceiver<Indication>,
    control: ControlPlane,
    ring: RingScheduler,
    peer_input_rx: mpsc::UnboundedReceiver<(Address, PeerInput)>,
    pending_transport: FuturesUnordered<BoxFuture<TransportEvent>>,
    pending_telephony: FuturesUnordered<BoxFuture<TelephonyEvent>>,
    pending_replies: HashMap<Address, Vec<(CallbackId, ReplyTx, MethodReply)>>,
    stream_holds: HashMap<Address, Vec<CallbackId>>,
    next_callback_id: u64,
    dc_timers: HashMap<Address, Instant>,
}

impl Gateway {
    /// Builds a gateway from its collaborators, returning the sender half of the peer-input
    /// channel the caller feeds with bytes read off each peer's RFCOMM socket.
    pub fn new(
        config: Config, transport: Arc<dyn Transport>, telephony: Telephony,
        telephony_indications: mpsc::UnboundedReceiver<Indication>, control: ControlPlane,
    ) -> (Self, mpsc::UnboundedSender<(Address, PeerInput)>) {
        let (peer_input_tx, peer_input_rx) = mpsc::unbounded_channel();
        let gateway = Self {
            config,
            ag: AgState::default(),
            peers: HashMap::new(),
            transport,
            telephony,
            telephony_indications,
            control,
            ring: RingScheduler::new(),
            peer_input_rx,
            pending_transport: FuturesUnordered::new(),
            pending_telephony: FuturesUnordered::new(),
            pending_replies: HashMap::new(),
            stream_holds: HashMap::new(),
            next_callback_id: 0,
            dc_timers: HashMap::new(),
        };
        (gateway, peer_input_tx)
    }

    /// Registers `addr` as a known peer, if it isn't already. Idempotent.
    pub fn register_peer(&mut self, addr: Address) {
        self.peers.entry(addr).or_insert_with(|| PeerSession::new(addr));
    }

    /// Tears `addr` down to DISCONNECTED (if it was anything else) and forgets it.
    pub fn unregister_peer(&mut self, addr: Address) {
        self.drive_event(addr, Event::RequestDisconnect);
        self.peers.remove(&addr);
        self.ag.mark_inactive(addr);
        self.dc_timers.remove(&addr);
        self.stream_holds.remove(&addr);
        self.pending_replies.remove(&addr);
    }

    /// Runs the event loop until the control-plane method channel is closed.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                input = self.peer_input_rx.recv() => {
                    match input {
                        Some((addr, input)) => self.handle_peer_input(addr, input),
                        None => break,
                    }
                }
                call = self.control.calls.recv() => {
                    match call {
                        Some(call) => self.handle_method_call(call),
                        None => break,
                    }
                }
                indication = self.telephony_indications.recv() => {
                    if let Some(indication) = indication {
                        self.handle_telephony_indication(indication);
                    }
                }
                Some(event) = self.pending_transport.next(), if !self.pending_transport.is_empty() => {
                    self.handle_transport_event(event);
                }
                Some(event) = self.pending_telephony.next(), if !self.pending_telephony.is_empty() => {
                    self.handle_telephony_response(event);
                }
                _ = sleep_until(self.ring.deadline().unwrap_or_else(far_future)), if self.ring.deadline().is_some() => {
                    self.fire_ring_tick();
                }
                _ = sleep_until(self.dc_timers.values().copied().min().unwrap_or_else(far_future)), if !self.dc_timers.is_empty() => {
                    self.fire_due_auto_disconnects();
                }
            }
        }
    }

    fn drive_event(&mut self, addr: Address, event: Event) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            let effects = lifecycle::apply(peer, event);
            self.apply_effects(addr, effects);
        }
    }

    fn apply_effects(&mut self, addr: Address, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Signal(signal) => self.control.emit(addr, signal),
                Effect::PropertyChanged(property) => self.control.emit(addr, Signal::PropertyChanged(property)),
                Effect::NotifyTelephonyConnected => {
                    self.ag.mark_active(addr);
                    self.telephony.notify_device_connected(addr);
                }
                Effect::NotifyTelephonyDisconnected => {
                    self.ag.mark_inactive(addr);
                    self.telephony.notify_device_disconnected(addr);
                    if !self.ag.has_active_peers() {
                        self.ring.disarm();
                    }
                }
                Effect::SdpSearch => self.submit_sdp(addr),
                Effect::ConnectRfcomm => self.submit_rfcomm_connect(addr),
                Effect::CloseRfcomm => self.transport.close_rfcomm(addr),
                Effect::ConnectSco => self.submit_sco_connect(addr),
                Effect::CloseSco => self.transport.close_sco(addr),
                Effect::StartRing => self.arm_ring(),
                Effect::ArmAutoDisconnect => {
                    self.dc_timers.insert(addr, Instant::now() + AUTO_DISCONNECT);
                }
                Effect::CancelAutoDisconnect => {
                    self.dc_timers.remove(&addr);
                }
                Effect::ResolvePending(result) => self.resolve_pending(addr, result),
            }
        }
    }

    fn resolve_pending(&mut self, addr: Address, result: Result<(), ErrorKind>) {
        let Some(waiters) = self.pending_replies.remove(&addr) else { return };
        for (_id, reply, template) in waiters {
            let outcome = match &result {
                Ok(()) => Ok(template),
                Err(kind) => Err(kind.clone()),
            };
            let _ = reply.send(outcome);
        }
    }

    /// Attaches `reply` to the peer's in-flight [`lifecycle`] operation, or answers it
    /// immediately if none is in flight (the synchronous "already there" shortcut).
    fn attach_reply(&mut self, addr: Address, reply: ReplyTx, template: MethodReply) {
        let peer = self.peers.get_mut(&addr).expect("peer registered before attach_reply");
        match peer.pending.as_mut() {
            Some(pending) => {
                let id = pending.add_callback();
                self.pending_replies.entry(addr).or_default().push((id, reply, template));
            }
            None => {
                let _ = reply.send(Ok(template));
            }
        }
    }

    fn drive_to_target(&mut self, addr: Address, target: Target) {
        self.register_peer(addr);
        let event = match target {
            Target::Connected => Event::RequestConnect,
            Target::Playing => Event::RequestPlay,
        };
        self.drive_event(addr, event);
    }

    fn stop_target(&mut self, addr: Address) {
        self.drive_event(addr, Event::RequestStop);
    }

    /// `headset_request_stream`/`headset_config_stream`: auto-opens the session and returns
    /// its callback id immediately, decoupled from whether the connect/play bring-up has
    /// actually finished — mirroring the original API, which hands back a watch id while the
    /// transport comes up in the background.
    fn begin_stream(&mut self, addr: Address, target: Target, reply: ReplyTx) {
        if target == Target::Playing && self.config.play_unavailable() {
            let _ = reply.send(Err(ErrorKind::NotAvailable));
            return;
        }
        self.register_peer(addr);
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        {
            let peer = self.peers.get_mut(&addr).unwrap();
            peer.auto_dc = true;
            peer.lock.read = true;
            peer.lock.write = true;
        }
        self.stream_holds.entry(addr).or_default().push(id);
        self.dc_timers.remove(&addr);
        self.drive_to_target(addr, target);
        let _ = reply.send(Ok(MethodReply::CallbackId(id)));
    }

    fn cancel_stream(&mut self, addr: Address, id: CallbackId, reply: ReplyTx) {
        let now_empty = match self.stream_holds.get_mut(&addr) {
            Some(holds) => {
                holds.retain(|held| *held != id);
                holds.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.stream_holds.remove(&addr);
            self.release_auto_open(addr);
        }
        let _ = reply.send(Ok(MethodReply::Unit));
    }

    fn unlock(&mut self, addr: Address, kind: LockKind, reply: ReplyTx) {
        let should_release = match self.peers.get_mut(&addr) {
            Some(peer) => {
                kind.set(&mut peer.lock, false);
                peer.lock.is_empty() && peer.auto_dc
            }
            None => false,
        };
        if should_release {
            self.release_auto_open(addr);
        }
        let _ = reply.send(Ok(MethodReply::Unit));
    }

    /// Releases an auto-opened session's locks. If RFCOMM is actually up, arms the
    /// auto-disconnect timer; otherwise the transport never came up at all and there is
    /// nothing worth keeping alive, so the session is torn down immediately.
    fn release_auto_open(&mut self, addr: Address) {
        let (rfcomm_open, disconnected) = match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.lock = Lock::default();
                peer.auto_dc = false;
                (peer.rfcomm_open, peer.state == State::Disconnected)
            }
            None => return,
        };
        if rfcomm_open {
            self.dc_timers.insert(addr, Instant::now() + AUTO_DISCONNECT);
        } else if !disconnected {
            self.drive_event(addr, Event::RequestDisconnect);
        }
    }

    fn get_gain(&self, addr: Address, speaker: bool, reply: ReplyTx) {
        let result = match self.peers.get(&addr) {
            Some(peer) if peer.state.is_active() => {
                let gain = if speaker { peer.sp_gain } else { peer.mic_gain };
                gain.value().map(|v| MethodReply::Gain(v as u16)).ok_or(ErrorKind::NotConnected)
            }
            _ => Err(ErrorKind::NotConnected),
        };
        let _ = reply.send(result);
    }

    /// `AT+VGS`/`AT+VGM` set from the control plane: unconditionally notifies the peer
    /// regardless of connection state, mirroring the original AG's `hs_set_gain`, and only
    /// emits a signal when the value actually changed.
    fn set_gain(&mut self, addr: Address, speaker: bool, value: u8, reply: ReplyTx) {
        let Some(gain) = Gain::parse(value as i32) else {
            let _ = reply.send(Err(ErrorKind::InvalidArgument));
            return;
        };
        let changed = match self.peers.get_mut(&addr) {
            Some(peer) => {
                let previous = if speaker { peer.sp_gain } else { peer.mic_gain };
                if speaker {
                    peer.sp_gain = gain;
                } else {
                    peer.mic_gain = gain;
                }
                previous != gain
            }
            None => {
                let _ = reply.send(Err(ErrorKind::NotConnected));
                return;
            }
        };
        let letter = if speaker { 'S' } else { 'M' };
        self.fire_send(addr, framer::frame_line(&format!("+VG{letter}={value}")));
        if changed {
            let (signal, property) = if speaker {
                (Signal::SpeakerGainChanged(value as u16), Property::SpeakerGain(value as u16))
            } else {
                (Signal::MicrophoneGainChanged(value as u16), Property::MicrophoneGain(value as u16))
            };
            self.control.emit(addr, signal);
            self.control.emit(addr, Signal::PropertyChanged(property));
        }
        let _ = reply.send(Ok(MethodReply::Unit));
    }

    fn handle_method_call(&mut self, call: MethodCall) {
        let MethodCall { peer: addr, method, reply } = call;
        match method {
            Method::Connect => {
                self.drive_to_target(addr, Target::Connected);
                self.attach_reply(addr, reply, MethodReply::Unit);
            }
            Method::Disconnect => {
                self.drive_event(addr, Event::RequestDisconnect);
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::IsConnected => {
                let connected = self.peers.get(&addr).is_some_and(|p| p.state.is_active());
                let _ = reply.send(Ok(MethodReply::Bool(connected)));
            }
            Method::IndicateCall { number, number_type } => {
                self.start_incoming_call(number, number_type, vec![addr]);
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::CancelCall => {
                self.stop_incoming_call();
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::Play => {
                if self.config.play_unavailable() {
                    let _ = reply.send(Err(ErrorKind::NotAvailable));
                } else {
                    self.drive_to_target(addr, Target::Playing);
                    self.attach_reply(addr, reply, MethodReply::Unit);
                }
            }
            Method::Stop => {
                self.stop_target(addr);
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::IsPlaying => {
                let playing = self.peers.get(&addr).is_some_and(|p| p.state == State::Playing);
                let _ = reply.send(Ok(MethodReply::Bool(playing)));
            }
            Method::GetSpeakerGain => self.get_gain(addr, true, reply),
            Method::GetMicrophoneGain => self.get_gain(addr, false, reply),
            Method::SetSpeakerGain(value) => self.set_gain(addr, true, value, reply),
            Method::SetMicrophoneGain(value) => self.set_gain(addr, false, value, reply),
            Method::GetProperties => {
                let properties = match self.peers.get(&addr) {
                    Some(peer) => {
                        let mut out = vec![
                            Property::Connected(peer.state.is_active()),
                            Property::Playing(peer.state == State::Playing),
                        ];
                        if let Some(v) = peer.sp_gain.value() {
                            out.push(Property::SpeakerGain(v as u16));
                        }
                        if let Some(v) = peer.mic_gain.value() {
                            out.push(Property::MicrophoneGain(v as u16));
                        }
                        out
                    }
                    None => vec![Property::Connected(false), Property::Playing(false)],
                };
                let _ = reply.send(Ok(MethodReply::Properties(properties)));
            }
            Method::SetProperty(property) => match property {
                Property::SpeakerGain(v) => match u8::try_from(v) {
                    Ok(v) => self.set_gain(addr, true, v, reply),
                    Err(_) => {
                        let _ = reply.send(Err(ErrorKind::InvalidArgument));
                    }
                },
                Property::MicrophoneGain(v) => match u8::try_from(v) {
                    Ok(v) => self.set_gain(addr, false, v, reply),
                    Err(_) => {
                        let _ = reply.send(Err(ErrorKind::InvalidArgument));
                    }
                },
                Property::Connected(_) | Property::Playing(_) => {
                    let _ = reply.send(Err(ErrorKind::NotAllowed));
                }
            },
            Method::RequestStream => self.begin_stream(addr, Target::Playing, reply),
            Method::ConfigStream => self.begin_stream(addr, Target::Connected, reply),
            Method::SuspendStream => {
                self.stop_target(addr);
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::CancelStream(id) => self.cancel_stream(addr, id, reply),
            Method::Lock(kind) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    kind.set(&mut peer.lock, true);
                }
                let _ = reply.send(Ok(MethodReply::Unit));
            }
            Method::Unlock(kind) => self.unlock(addr, kind, reply),
            Method::IsActive => {
                let active = self.peers.get(&addr).is_some_and(|p| !p.lock.is_empty());
                let _ = reply.send(Ok(MethodReply::Bool(active)));
            }
            Method::Channel => {
                let channel = self.peers.get(&addr).and_then(|p| p.rfcomm_channel);
                let _ = reply.send(Ok(MethodReply::Channel(channel)));
            }
            Method::Nrec => {
                let nrec = self.peers.get(&addr).map(|p| p.nrec).unwrap_or(true);
                let _ = reply.send(Ok(MethodReply::Bool(nrec)));
            }
            Method::ScoRouting => {
                let _ = reply.send(Ok(MethodReply::ScoRouting(self.config.sco_routing)));
            }
        }
    }

    /// Arms the ring cadence (a no-op if already armed) and, for peers that need in-band
    /// ringtone, kicks off the SCO bring-up that will deliver it once PLAYING is reached.
    fn start_incoming_call(&mut self, number: Option<String>, number_type: i32, inband_targets: Vec<Address>) {
        self.ag.incoming_number = number;
        self.ag.number_type = number_type;
        self.arm_ring();
        let inband = self.ag.ag_features & ag_features::INBAND_RINGTONE != 0;
        if !inband {
            return;
        }
        for addr in inband_targets {
            let should_play = match self.peers.get(&addr) {
                Some(peer) => peer.is_hfp() && peer.state == State::Connected,
                None => false,
            };
            if should_play {
                let peer = self.peers.get_mut(&addr).unwrap();
                peer.pending_ring = true;
                let effects = lifecycle::apply(peer, Event::RequestPlay);
                self.apply_effects(addr, effects);
            }
        }
    }

    /// Arms the ring cadence, firing the first tick immediately. A no-op if already armed
    /// (§4.I: "attempts to arm it while active are no-ops with a debug log").
    fn arm_ring(&mut self) {
        if self.ring.arm(Instant::now()) {
            self.fire_ring_tick();
        } else {
            log::debug!("ring cadence already armed, ignoring re-arm request");
        }
    }

    fn stop_incoming_call(&mut self) {
        self.ag.incoming_number = None;
        self.ring.disarm();
        for peer in self.peers.values_mut() {
            peer.pending_ring = false;
        }
    }

    fn fire_ring_tick(&mut self) {
        let notif = Notification::Ring { number: self.ag.incoming_number.clone(), number_type: self.ag.number_type };
        self.broadcast(&notif);
        self.ring.advance();
    }

    fn broadcast(&mut self, notif: &Notification) {
        let frames = broadcast::fan_out(notif, self.peers.values().filter(|p| p.state.is_active()), self.ag.er_ind);
        for (addr, bytes) in frames {
            self.fire_send(addr, bytes);
        }
    }

    fn maybe_complete_slc(&mut self, addr: Address, checkpoint: SlcCheckpoint) {
        let ready = match self.peers.get(&addr) {
            Some(peer) => slc::should_complete(checkpoint, peer.state, self.ag.ag_features, peer.hf_features),
            None => false,
        };
        if ready {
            let peer = self.peers.get_mut(&addr).unwrap();
            let effects = lifecycle::complete_slc(peer);
            self.apply_effects(addr, effects);
        }
    }

    fn handle_telephony_indication(&mut self, indication: Indication) {
        match indication {
            Indication::Ready { ag_features, indicators, rh, chld } => {
                self.ag.set_ready(ag_features, indicators, rh, chld);
            }
            Indication::Event { wire_index, value } => {
                if self.ag.set_indicator(wire_index, value).is_some() {
                    self.broadcast(&Notification::IndicatorEvent { wire_index, value });
                }
            }
            Indication::ResponseAndHold { value } => {
                self.ag.rh = value;
                self.broadcast(&Notification::ResponseAndHold { value });
            }
            Indication::IncomingCall { number, number_type } => {
                let targets = self.ag.active_peers.clone();
                self.start_incoming_call(number, number_type, targets);
            }
            Indication::CallingStopped => self.stop_incoming_call(),
            Indication::OperatorSelection { mode, operator } => {
                let line = format!("+COPS: {mode},0,\"{operator}\"");
                self.broadcast(&Notification::OperatorSelection { line });
            }
            Indication::ListCurrentCall(entry) => {
                let line = format_clcc(&entry);
                self.broadcast(&Notification::ListCurrentCall { line });
            }
            Indication::SubscriberNumber { number, number_type, service } => {
                let line = format!("+CNUM: ,\"{number}\",{number_type},,{service}");
                self.broadcast(&Notification::SubscriberNumber { line });
            }
            Indication::CallWaiting { number, number_type } => {
                self.broadcast(&Notification::CallWaiting { number, number_type });
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Sdp { peer: addr, result } => match result {
                Ok(record) => {
                    let profile = transport::profile_for_record(&record, self.config.hfp_enabled);
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.profile = Some(profile);
                        peer.rfcomm_channel = Some(record.channel);
                    }
                    self.apply_effects(addr, vec![Effect::ConnectRfcomm]);
                }
                Err(_) => self.drive_event(addr, Event::RfcommFailed),
            },
            TransportEvent::RfcommConnected { peer: addr, result } => {
                self.drive_event(addr, if result.is_ok() { Event::RfcommUp } else { Event::RfcommFailed });
            }
            TransportEvent::ScoConnected { peer: addr, result } => {
                self.drive_event(addr, if result.is_ok() { Event::ScoUp } else { Event::ScoFailed });
            }
        }
    }

    fn handle_peer_input(&mut self, addr: Address, input: PeerInput) {
        match input {
            PeerInput::Data(bytes) => {
                let fed = match self.peers.get_mut(&addr) {
                    Some(peer) => framer::feed(&mut peer.input_buffer, &bytes),
                    None => return,
                };
                match fed {
                    Ok(lines) => {
                        for line in lines {
                            let text = String::from_utf8_lossy(&line).into_owned();
                            self.dispatch_command(addr, &text);
                        }
                    }
                    Err(()) => {
                        log::warn!("{addr}: input buffer overflow, dropping session");
                        self.force_disconnect(addr);
                    }
                }
            }
            PeerInput::Closed => {
                log::debug!("{addr}: RFCOMM channel closed");
                self.force_disconnect(addr);
            }
        }
    }

    fn force_disconnect(&mut self, addr: Address) {
        self.drive_event(addr, Event::RfcommFailed);
        let still_open = self.peers.get(&addr).is_some_and(|p| p.state != State::Disconnected);
        if still_open {
            self.drive_event(addr, Event::RequestDisconnect);
        }
    }

    fn dispatch_command(&mut self, addr: Address, line: &str) {
        log::trace!("{addr} -> {line}");
        let cme_enabled = match self.peers.get(&addr) {
            Some(peer) => peer.cme_enabled,
            None => return,
        };
        let cmd = match dispatch::parse(line) {
            Ok(cmd) => cmd,
            Err(_) => {
                self.fire_send(addr, framer::frame_error());
                return;
            }
        };
        let (outcome, gain_change) = {
            let peer = self.peers.get_mut(&addr).unwrap();
            let before_sp = peer.sp_gain;
            let before_mic = peer.mic_gain;
            let outcome = handlers::handle(cmd.clone(), peer, &self.ag);
            let gain_change = if peer.sp_gain != before_sp {
                peer.sp_gain.value().map(|v| (true, v))
            } else if peer.mic_gain != before_mic {
                peer.mic_gain.value().map(|v| (false, v))
            } else {
                None
            };
            (outcome, gain_change)
        };
        if let Some((speaker, value)) = gain_change {
            let value = value as u16;
            let (signal, property) = if speaker {
                (Signal::SpeakerGainChanged(value), Property::SpeakerGain(value))
            } else {
                (Signal::MicrophoneGainChanged(value), Property::MicrophoneGain(value))
            };
            self.control.emit(addr, signal);
            self.control.emit(addr, Signal::PropertyChanged(property));
        }
        if matches!(cmd, Command::Answer | Command::Ckpd) {
            self.ag.incoming_number = None;
            self.ring.disarm();
            if matches!(cmd, Command::Ckpd) {
                self.control.emit(addr, Signal::AnswerRequested);
            }
        }
        if let Some(bytes) = outcome.reply {
            self.fire_send(addr, bytes);
        }
        if let Some(request) = outcome.forward {
            let kind = match &cmd {
                Command::Chup => TelephonyReplyKind::Chup,
                Command::Nrec { enabled } => TelephonyReplyKind::Nrec { enabled: *enabled },
                Command::Cmer { mode, ind } => {
                    self.ag.er_mode = *mode;
                    TelephonyReplyKind::EventReporting {
                        on: *ind != 0,
                        checkpoint: outcome.slc_checkpoint.expect("CMER outcome always carries a checkpoint"),
                    }
                }
                _ => TelephonyReplyKind::Plain,
            };
            self.forward_to_telephony(addr, request, cme_enabled, kind);
        } else if let Some(checkpoint) = outcome.slc_checkpoint {
            self.maybe_complete_slc(addr, checkpoint);
        }
    }

    fn submit_sdp(&mut self, addr: Address) {
        let (tx, rx) = oneshot::channel();
        self.transport.sdp_search(addr, self.config.hfp_enabled, tx);
        self.pending_transport.push(Box::pin(async move {
            let result = rx.await.unwrap_or_else(|_| channel_closed());
            TransportEvent::Sdp { peer: addr, result }
        }));
    }

    fn submit_rfcomm_connect(&mut self, addr: Address) {
        let Some(channel) = self.peers.get(&addr).and_then(|p| p.rfcomm_channel) else { return };
        let (tx, rx) = oneshot::channel();
        self.transport.connect_rfcomm(addr, channel, tx);
        self.pending_transport.push(Box::pin(async move {
            let result = rx.await.unwrap_or_else(|_| channel_closed());
            TransportEvent::RfcommConnected { peer: addr, result }
        }));
    }

    fn submit_sco_connect(&mut self, addr: Address) {
        let (tx, rx) = oneshot::channel();
        self.transport.connect_sco(addr, tx);
        self.pending_transport.push(Box::pin(async move {
            let result = rx.await.unwrap_or_else(|_| channel_closed());
            TransportEvent::ScoConnected { peer: addr, result }
        }));
    }

    /// Writes a framed response to `addr`'s RFCOMM channel. Fire-and-forget: a send failure
    /// is only logged, since a hung-up peer surfaces separately through `PeerInput::Closed`.
    fn fire_send(&self, addr: Address, data: Vec<u8>) {
        let (tx, rx) = oneshot::channel();
        self.transport.send(addr, data, tx);
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("{addr}: send failed: {err}"),
                Err(_) => log::warn!("{addr}: send reply channel dropped"),
            }
        });
    }

    fn forward_to_telephony(&mut self, addr: Address, request: Request, cme_enabled: bool, kind: TelephonyReplyKind) {
        let reply_rx = self.telephony.submit(addr, request);
        self.pending_telephony.push(Box::pin(async move {
            let cme = reply_rx.await.unwrap_or(CHANNEL_CLOSED_CME);
            TelephonyEvent { peer: addr, cme_enabled, kind, cme }
        }));
    }

    fn handle_telephony_response(&mut self, event: TelephonyEvent) {
        let TelephonyEvent { peer: addr, cme_enabled, kind, cme } = event;
        self.fire_send(addr, handlers::telephony_reply(cme, cme_enabled));
        if !cme.is_success() {
            return;
        }
        match kind {
            TelephonyReplyKind::Plain => {}
            TelephonyReplyKind::Chup => {
                self.ag.incoming_number = None;
                self.ring.disarm();
                self.control.emit(addr, Signal::CallTerminated);
            }
            TelephonyReplyKind::Nrec { enabled } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.nrec = enabled;
                }
            }
            TelephonyReplyKind::EventReporting { on, checkpoint } => {
                self.ag.er_ind = on;
                self.maybe_complete_slc(addr, checkpoint);
            }
        }
    }

    fn fire_due_auto_disconnects(&mut self) {
        let now = Instant::now();
        let due: Vec<Address> =
            self.dc_timers.iter().filter(|(_, &deadline)| deadline <= now).map(|(addr, _)| *addr).collect();
        for addr in due {
            self.dc_timers.remove(&addr);
            self.drive_event(addr, Event::AutoDisconnectFired);
        }
    }
}

fn format_clcc(entry: &CallListEntry) -> String {
    match &entry.number {
        Some(number) => format!(
            "+CLCC: {},{},{},{},{},\"{}\",{}",
            entry.idx, entry.direction, entry.status, entry.mode, entry.multiparty as u8, number, entry.number_type
        ),
        None => format!(
            "+CLCC: {},{},{},{},{}",
            entry.idx, entry.direction, entry.status, entry.mode, entry.multiparty as u8
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{peer::Profile, telephony::RequestEnvelope};

    struct FakeTransport {
        profile: Profile,
        channel: u8,
        sdp_ok: bool,
        rfcomm_ok: bool,
        sco_ok: bool,
        sent: Mutex<Vec<(Address, Vec<u8>)>>,
    }

    impl FakeTransport {
        fn new(profile: Profile) -> Self {
            Self { profile, channel: 1, sdp_ok: true, rfcomm_ok: true, sco_ok: true, sent: Mutex::new(Vec::new()) }
        }
    }

    impl Transport for FakeTransport {
        fn sdp_search(&self, _addr: Address, _want_hfp: bool, reply: oneshot::Sender<crate::Result<ServiceRecord>>) {
            let result = if self.sdp_ok {
                Ok(ServiceRecord { profile: self.profile, channel: self.channel })
            } else {
                Err(Error::new(ErrorKind::ConnectionAttemptFailed))
            };
            let _ = reply.send(result);
        }

        fn connect_rfcomm(&self, _addr: Address, _channel: u8, reply: oneshot::Sender<crate::Result<()>>) {
            let result = if self.rfcomm_ok { Ok(()) } else { Err(Error::new(ErrorKind::ConnectionAttemptFailed)) };
            let _ = reply.send(result);
        }

        fn close_rfcomm(&self, _addr: Address) {}

        fn send(&self, addr: Address, data: Vec<u8>, reply: oneshot::Sender<crate::Result<()>>) {
            self.sent.lock().unwrap().push((addr, data));
            let _ = reply.send(Ok(()));
        }

        fn connect_sco(&self, _addr: Address, reply: oneshot::Sender<crate::Result<()>>) {
            let result = if self.sco_ok { Ok(()) } else { Err(Error::new(ErrorKind::ConnectionAttemptFailed)) };
            let _ = reply.send(result);
        }

        fn close_sco(&self, _addr: Address) {}
    }

    fn test_gateway(
        transport: Arc<FakeTransport>,
    ) -> (Gateway, mpsc::UnboundedReceiver<(Address, Signal)>, mpsc::UnboundedReceiver<RequestEnvelope>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (_calls_tx, calls_rx) = mpsc::unbounded_channel();
        let control = ControlPlane::new(calls_rx, signals_tx);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let telephony = Telephony::new(requests_tx);
        let (_indications_tx, indications_rx) = mpsc::unbounded_channel();
        let (gateway, _input_tx) = Gateway::new(Config::default(), transport, telephony, indications_rx, control);
        (gateway, signals_rx, requests_rx)
    }

    #[tokio::test]
    async fn hsp_connect_completes_through_sdp_and_rfcomm() {
        let transport = Arc::new(FakeTransport::new(Profile::Hsp));
        let (mut gw, mut signals, _telephony_rx) = test_gateway(transport);
        let addr = Address::new([1, 2, 3, 4, 5, 6]);

        let (reply_tx, reply_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::Connect, reply: reply_tx });

        let sdp_event = gw.pending_transport.next().await.unwrap();
        gw.handle_transport_event(sdp_event);
        let rfcomm_event = gw.pending_transport.next().await.unwrap();
        gw.handle_transport_event(rfcomm_event);

        assert_eq!(gw.peers[&addr].state, State::Connected);
        assert!(matches!(reply_rx.await.unwrap(), Ok(MethodReply::Unit)));
        assert_eq!(signals.recv().await.unwrap(), (addr, Signal::Connected));
    }

    #[tokio::test]
    async fn sdp_failure_resolves_pending_with_connection_attempt_failed() {
        let mut transport = FakeTransport::new(Profile::Hsp);
        transport.sdp_ok = false;
        let (mut gw, _signals, _telephony_rx) = test_gateway(Arc::new(transport));
        let addr = Address::new([9, 9, 9, 9, 9, 9]);

        let (reply_tx, reply_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::Connect, reply: reply_tx });
        let event = gw.pending_transport.next().await.unwrap();
        gw.handle_transport_event(event);

        assert_eq!(gw.peers[&addr].state, State::Disconnected);
        assert!(matches!(reply_rx.await.unwrap(), Err(ErrorKind::ConnectionAttemptFailed)));
    }

    #[tokio::test]
    async fn cmer_completes_slc_without_three_way_support() {
        let transport = Arc::new(FakeTransport::new(Profile::Hfp));
        let (mut gw, _signals, mut telephony_rx) = test_gateway(transport);
        let addr = Address::new([2, 2, 2, 2, 2, 2]);
        gw.register_peer(addr);
        {
            let peer = gw.peers.get_mut(&addr).unwrap();
            peer.profile = Some(Profile::Hfp);
            peer.state = State::ConnectInProgress;
            peer.pending = Some(crate::peer::PendingOp::new(Target::Connected));
        }

        gw.dispatch_command(addr, "AT+CMER=3,0,0,1");

        let envelope = telephony_rx.recv().await.unwrap();
        assert!(matches!(envelope.request, Request::EventReporting { on: true }));
        envelope.reply.send(CmeError::NONE).unwrap();

        let event = gw.pending_telephony.next().await.unwrap();
        gw.handle_telephony_response(event);

        assert_eq!(gw.peers[&addr].state, State::Connected);
        assert!(gw.ag.er_ind);
    }

    #[tokio::test]
    async fn cancel_stream_arms_auto_disconnect_once_rfcomm_is_open() {
        let transport = Arc::new(FakeTransport::new(Profile::Hsp));
        let (mut gw, _signals, _telephony_rx) = test_gateway(transport);
        let addr = Address::new([3, 3, 3, 3, 3, 3]);

        let (reply_tx, reply_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::RequestStream, reply: reply_tx });
        let id = match reply_rx.await.unwrap() {
            Ok(MethodReply::CallbackId(id)) => id,
            other => panic!("unexpected reply: {other:?}"),
        };

        for _ in 0..3 {
            let event = gw.pending_transport.next().await.unwrap();
            gw.handle_transport_event(event);
        }
        assert!(gw.peers[&addr].rfcomm_open);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::CancelStream(id), reply: cancel_tx });
        assert!(matches!(cancel_rx.await.unwrap(), Ok(MethodReply::Unit)));
        assert!(gw.dc_timers.contains_key(&addr));
        assert!(gw.peers[&addr].lock.is_empty());
    }

    #[tokio::test]
    async fn incoming_call_indication_arms_ring_and_broadcasts_ring() {
        let transport = Arc::new(FakeTransport::new(Profile::Hfp));
        let (mut gw, _signals, _telephony_rx) = test_gateway(transport.clone());
        let addr = Address::new([4, 4, 4, 4, 4, 4]);
        gw.register_peer(addr);
        {
            let peer = gw.peers.get_mut(&addr).unwrap();
            peer.profile = Some(Profile::Hfp);
            peer.state = State::Connected;
            peer.cli_active = true;
        }
        gw.ag.mark_active(addr);

        gw.handle_telephony_indication(Indication::IncomingCall {
            number: Some("+15551234".to_string()),
            number_type: 129,
        });

        assert!(gw.ring.is_armed());
        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().any(|(a, bytes)| *a == addr && bytes.windows(4).any(|w| w == b"RING")));
    }

    #[tokio::test]
    async fn set_speaker_gain_sends_notification_and_emits_signal_once() {
        let transport = Arc::new(FakeTransport::new(Profile::Hsp));
        let (mut gw, mut signals, _telephony_rx) = test_gateway(transport.clone());
        let addr = Address::new([5, 5, 5, 5, 5, 5]);
        gw.register_peer(addr);

        let (reply_tx, reply_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::SetSpeakerGain(10), reply: reply_tx });
        assert!(matches!(reply_rx.await.unwrap(), Ok(MethodReply::Unit)));

        {
            let sent = transport.sent.lock().unwrap();
            assert!(sent.iter().any(|(a, bytes)| *a == addr && bytes.windows(7).any(|w| w == b"+VGS=10")));
        }
        assert_eq!(signals.recv().await.unwrap(), (addr, Signal::SpeakerGainChanged(10)));

        let (reply_tx, reply_rx) = oneshot::channel();
        gw.handle_method_call(MethodCall { peer: addr, method: Method::SetSpeakerGain(10), reply: reply_tx });
        assert!(matches!(reply_rx.await.unwrap(), Ok(MethodReply::Unit)));
        assert!(signals.try_recv().is_err());
    }
}
