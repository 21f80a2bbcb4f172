//! Session negotiation controller
//!
//! Reconciles three independently timed resources - relay
//! connectivity, local media capture, and peer-link negotiation - into
//! one call lifecycle. Every input funnels through a single event
//! queue and one dispatch function, so each state mutation is a single
//! synchronous step; correctness comes from the state machine
//! rejecting or queuing events in the wrong state, not from locking.
//!
//! Stale async completions are detected with an epoch marker: teardown
//! bumps the epoch, and a media acquisition or link event carrying an
//! old epoch is discarded, releasing whatever it carried.

use super::state::CallState;
use super::CallError;
use crate::media::{CaptureError, MediaCapture, MediaTracks};
use crate::peer::{LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use crate::signaling::channel::{ChannelCommand, ChannelEvent};
use crate::signaling::protocol::{CandidatePayload, RelayMessage, SessionDescription};
use crate::signaling::ChannelState;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Read-only projection of the session for the UI collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Relay connectivity
    pub connected: bool,
    /// Counterpart identity, once discovered
    pub remote_user_id: Option<String>,
    /// Authoritative call lifecycle state
    pub call_state: CallState,
}

/// Handle to a running controller task
pub struct ControllerHandle {
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
    task: tokio::task::JoinHandle<()>,
}

impl ControllerHandle {
    pub fn start_call(&self) {
        let _ = self.event_tx.send(ControllerEvent::StartCall);
    }

    pub fn end_call(&self) {
        let _ = self.event_tx.send(ControllerEvent::EndCall);
    }

    /// Current projection
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch projection changes
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Tear the session down and stop the controller task.
    pub async fn shutdown(self) {
        let _ = self.event_tx.send(ControllerEvent::Shutdown);
        let _ = self.task.await;
    }
}

/// Everything that can drive the state machine
enum ControllerEvent {
    StartCall,
    EndCall,
    Shutdown,
    Channel(ChannelEvent),
    MediaReady { epoch: u64, tracks: MediaTracks },
    MediaFailed { epoch: u64, error: CaptureError },
    Link { epoch: u64, event: LinkEvent },
}

/// Local media acquisition progress, at most one acquisition per session
enum MediaState {
    NotRequested,
    Pending,
    Ready(MediaTracks),
    Failed,
}

impl MediaState {
    fn is_ready(&self) -> bool {
        matches!(self, MediaState::Ready(_))
    }

    fn tracks(&self) -> Option<&MediaTracks> {
        match self {
            MediaState::Ready(tracks) => Some(tracks),
            _ => None,
        }
    }
}

/// A deferred room-join awaiting readiness; queue of one
struct PendingJoin {
    room_id: String,
    user_id: String,
}

/// The session negotiation controller.
///
/// One instance per (room, local user) pair. Sole owner and sole
/// writer of the media tracks and the peer link.
pub struct SessionController<M: MediaCapture, F: PeerLinkFactory> {
    room_id: String,
    local_user_id: String,
    capture: Arc<M>,
    link_factory: Arc<F>,
    channel_tx: mpsc::UnboundedSender<ChannelCommand>,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    snapshot_tx: watch::Sender<CallSnapshot>,

    call_state: CallState,
    channel_state: ChannelState,
    remote_user_id: Option<String>,
    media: MediaState,
    peer_link: Option<Arc<F::Link>>,
    pending_join: Option<PendingJoin>,
    epoch: u64,
}

impl<M: MediaCapture, F: PeerLinkFactory> SessionController<M, F> {
    /// Start a controller task for one room/user pair.
    pub fn spawn(
        room_id: String,
        local_user_id: String,
        capture: Arc<M>,
        link_factory: Arc<F>,
        channel_tx: mpsc::UnboundedSender<ChannelCommand>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> ControllerHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            connected: false,
            remote_user_id: None,
            call_state: CallState::Idle,
        });

        // Channel events join the same queue as everything else so
        // arrival order is preserved end to end.
        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut channel_events = channel_events;
            while let Some(event) = channel_events.recv().await {
                if forward_tx.send(ControllerEvent::Channel(event)).is_err() {
                    break;
                }
            }
        });

        let controller = Self {
            room_id,
            local_user_id,
            capture,
            link_factory,
            channel_tx,
            event_tx: event_tx.clone(),
            snapshot_tx,
            call_state: CallState::Idle,
            channel_state: ChannelState::Disconnected,
            remote_user_id: None,
            media: MediaState::NotRequested,
            peer_link: None,
            pending_join: None,
            epoch: 0,
        };

        let task = tokio::spawn(controller.run(event_rx));

        ControllerHandle {
            event_tx,
            snapshot_rx,
            task,
        }
    }

    async fn run(mut self, mut event_rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        while let Some(event) = event_rx.recv().await {
            let stop = matches!(event, ControllerEvent::Shutdown);
            self.on_event(event).await;
            self.publish();
            if stop {
                break;
            }
        }
    }

    /// The single transition dispatch; every input passes through here.
    async fn on_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::StartCall => self.on_start_call(),
            ControllerEvent::EndCall => self.on_end_call().await,
            ControllerEvent::Shutdown => self.teardown().await,
            ControllerEvent::Channel(ChannelEvent::State(state)) => self.on_channel_state(state),
            ControllerEvent::Channel(ChannelEvent::Message(msg)) => {
                self.on_relay_message(msg).await
            }
            ControllerEvent::MediaReady { epoch, tracks } => self.on_media_ready(epoch, tracks),
            ControllerEvent::MediaFailed { epoch, error } => self.on_media_failed(epoch, error),
            ControllerEvent::Link { epoch, event } => self.on_link_event(epoch, event).await,
        }
    }

    fn publish(&self) {
        let snapshot = CallSnapshot {
            connected: self.channel_state.is_connected(),
            remote_user_id: self.remote_user_id.clone(),
            call_state: self.call_state,
        };
        if *self.snapshot_tx.borrow() != snapshot {
            let _ = self.snapshot_tx.send(snapshot);
        }
    }

    // ---- commands ----

    fn on_start_call(&mut self) {
        if self.call_state.can_start() {
            info!(
                "Starting call in room {} as {}",
                self.room_id, self.local_user_id
            );
            self.call_state = CallState::JoiningChannel;
        } else if self.call_state != CallState::JoiningChannel {
            debug!("start_call ignored in state {}", self.call_state);
            return;
        }
        // A re-entrant start before the join drained falls through and
        // overwrites the pending join, never stacks a second one.

        self.pending_join = Some(PendingJoin {
            room_id: self.room_id.clone(),
            user_id: self.local_user_id.clone(),
        });
        self.request_media();
        let _ = self.channel_tx.send(ChannelCommand::Connect);
        self.maybe_join();
    }

    async fn on_end_call(&mut self) {
        if matches!(self.call_state, CallState::Idle | CallState::Disconnected) {
            debug!("end_call with nothing to release");
            return;
        }

        // Fire-and-forget; the channel drops these when disconnected.
        let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::LeaveRoom {
            room_id: self.room_id.clone(),
            user_id: self.local_user_id.clone(),
        }));
        let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::EndCall {
            room_id: self.room_id.clone(),
            user_id: self.local_user_id.clone(),
        }));

        self.teardown().await;
    }

    // ---- readiness reconciliation ----

    fn request_media(&mut self) {
        match self.media {
            MediaState::NotRequested | MediaState::Failed => {}
            // Pending or Ready: one acquisition per session
            _ => return,
        }
        self.media = MediaState::Pending;

        let capture = self.capture.clone();
        let event_tx = self.event_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            match capture.acquire().await {
                Ok(tracks) => {
                    let _ = event_tx.send(ControllerEvent::MediaReady { epoch, tracks });
                }
                Err(error) => {
                    let _ = event_tx.send(ControllerEvent::MediaFailed { epoch, error });
                }
            }
        });
    }

    fn on_media_ready(&mut self, epoch: u64, tracks: MediaTracks) {
        if epoch != self.epoch {
            // The session this acquisition belonged to is gone; dropping
            // the tracks here releases them instead of attaching them.
            debug!("Discarding media acquired for a torn-down session");
            return;
        }
        debug!("Local media ready");
        self.media = MediaState::Ready(tracks);
        self.maybe_join();
    }

    fn on_media_failed(&mut self, epoch: u64, error: CaptureError) {
        if epoch != self.epoch {
            debug!("Ignoring stale capture failure");
            return;
        }
        self.media = MediaState::Failed;
        if self.call_state == CallState::JoiningChannel {
            self.fail(CallError::CaptureFailure(error.to_string()));
        } else {
            warn!("Capture failed outside join: {}", error);
        }
    }

    fn on_channel_state(&mut self, state: ChannelState) {
        debug!("Relay channel state: {:?}", state);
        self.channel_state = state;
        match state {
            ChannelState::Connected => self.maybe_join(),
            ChannelState::Failed => {
                if self.call_state.is_active() {
                    self.fail(CallError::ChannelConnectFailure(
                        "reconnect attempt budget exhausted".to_string(),
                    ));
                }
            }
            // Transient drop: the channel keeps retrying, business
            // state persists.
            ChannelState::Disconnected | ChannelState::Connecting => {}
        }
    }

    /// Flush the deferred join exactly once, when transport and media
    /// are both ready.
    fn maybe_join(&mut self) {
        if self.call_state != CallState::JoiningChannel {
            return;
        }
        if !self.channel_state.is_connected() || !self.media.is_ready() {
            return;
        }
        if let Some(join) = self.pending_join.take() {
            info!("Joining room {} as {}", join.room_id, join.user_id);
            let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::JoinRoom {
                room_id: join.room_id,
                user_id: join.user_id,
            }));
            self.call_state = CallState::AwaitingPeer;
        }
    }

    // ---- relay traffic ----

    async fn on_relay_message(&mut self, msg: RelayMessage) {
        if msg.sender() == Some(self.local_user_id.as_str()) {
            debug!("Suppressing self-echo of {}", msg.kind());
            return;
        }

        match msg {
            RelayMessage::UserConnected { user_id } => self.on_peer_present(user_id).await,
            RelayMessage::RoomUsers { users } => {
                let peer = users.into_iter().find(|u| *u != self.local_user_id);
                if let Some(peer) = peer {
                    self.on_peer_present(peer).await;
                }
            }
            RelayMessage::Offer { offer, from, .. } => self.on_remote_offer(from, offer).await,
            RelayMessage::Answer { answer, .. } => self.on_remote_answer(answer).await,
            RelayMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            RelayMessage::UserDisconnected { user_id } => self.on_peer_departed(user_id).await,
            RelayMessage::EndCall { user_id, .. } => {
                // Same identity guard as departure: only the paired
                // peer may hang the call up.
                if self.remote_user_id.as_deref() == Some(user_id.as_str()) {
                    info!("Peer {} ended the call", user_id);
                    self.teardown().await;
                } else {
                    debug!("End-call from unpaired user {}, ignoring", user_id);
                }
            }
            other => debug!("Unexpected {} from relay", other.kind()),
        }
    }

    /// A counterpart is present: bind to it and originate the offer.
    async fn on_peer_present(&mut self, user_id: String) {
        match self.call_state {
            CallState::AwaitingPeer | CallState::Negotiating => {}
            _ => {
                debug!("Peer {} noticed in state {}, ignoring", user_id, self.call_state);
                return;
            }
        }
        if let Some(ref existing) = self.remote_user_id {
            if *existing != user_id {
                warn!("Room already has peer {}, ignoring {}", existing, user_id);
                return;
            }
        }

        self.remote_user_id = Some(user_id.clone());
        self.call_state = CallState::Negotiating;

        let (link, created) = match self.ensure_link().await {
            Ok(pair) => pair,
            Err(e) => return self.fail(e),
        };
        if !created {
            // Negotiation already runs on the existing link; a second
            // presence notice must not trigger a second offer.
            return;
        }

        let offer = match Self::negotiate_offer(&link).await {
            Ok(offer) => offer,
            Err(e) => return self.fail(e),
        };
        info!("Sending offer to {}", user_id);
        let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::Offer {
            offer,
            to: Some(user_id),
            from: self.local_user_id.clone(),
            room_id: Some(self.room_id.clone()),
        }));
    }

    async fn negotiate_offer(link: &Arc<F::Link>) -> Result<SessionDescription, CallError> {
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn on_remote_offer(&mut self, from: String, offer: SessionDescription) {
        match self.call_state {
            CallState::AwaitingPeer | CallState::Negotiating => {}
            _ => {
                debug!("Offer from {} in state {}, ignoring", from, self.call_state);
                return;
            }
        }
        if let Some(ref existing) = self.remote_user_id {
            if *existing != from {
                warn!("Offer from {} while paired with {}, ignoring", from, existing);
                return;
            }
        }

        self.remote_user_id = Some(from.clone());
        self.call_state = CallState::Negotiating;

        let (link, _) = match self.ensure_link().await {
            Ok(pair) => pair,
            Err(e) => return self.fail(e),
        };

        let answer = match Self::negotiate_answer(&link, offer).await {
            Ok(answer) => answer,
            Err(e) => return self.fail(e),
        };
        info!("Answering offer from {}", from);
        let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::Answer {
            answer,
            to: Some(from),
            from: self.local_user_id.clone(),
            room_id: Some(self.room_id.clone()),
        }));
    }

    async fn negotiate_answer(
        link: &Arc<F::Link>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        link.set_remote_description(offer).await?;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(link) = self.peer_link.clone() else {
            // Discarded, never queued.
            warn!(
                "{}",
                CallError::ProtocolViolation("answer with no offer in flight".to_string())
            );
            return;
        };
        if let Err(e) = link.set_remote_description(answer).await {
            self.fail(e);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: CandidatePayload) {
        let Some(link) = self.peer_link.clone() else {
            // Dropped, not buffered. See DESIGN.md.
            warn!(
                "{}",
                CallError::ProtocolViolation("remote candidate with no peer link".to_string())
            );
            return;
        };
        if let Err(e) = link.add_ice_candidate(candidate).await {
            // Recoverable: a lost candidate does not change the call state.
            warn!("Failed to apply remote candidate: {}", e);
        }
    }

    async fn on_peer_departed(&mut self, user_id: String) {
        if self.remote_user_id.as_deref() != Some(user_id.as_str()) {
            debug!("Departure of unknown user {}, ignoring", user_id);
            return;
        }
        info!("Peer {} left the room", user_id);
        self.teardown().await;
    }

    // ---- peer link ----

    /// Create-or-reuse: at most one live link per session. Returns the
    /// link and whether this call created it.
    async fn ensure_link(&mut self) -> Result<(Arc<F::Link>, bool), CallError> {
        if let Some(ref link) = self.peer_link {
            return Ok((link.clone(), false));
        }

        // Bind whatever media is held right now. A link created before
        // capture completes stays trackless and is not rebuilt later.
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let link = self.link_factory.create(self.media.tracks(), link_tx).await?;

        let epoch = self.epoch;
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                if event_tx.send(ControllerEvent::Link { epoch, event }).is_err() {
                    break;
                }
            }
        });

        self.peer_link = Some(link.clone());
        Ok((link, true))
    }

    async fn on_link_event(&mut self, epoch: u64, event: LinkEvent) {
        if epoch != self.epoch {
            debug!("Ignoring event from a released peer link");
            return;
        }
        match event {
            LinkEvent::Candidate(candidate) => self.forward_local_candidate(candidate),
            LinkEvent::StateChanged(state) => self.on_link_state(state),
            LinkEvent::RemoteTrack { kind, id } => {
                info!("Remote {} track {} attached", kind, id);
            }
        }
    }

    fn forward_local_candidate(&mut self, candidate: CandidatePayload) {
        let Some(to) = self.remote_user_id.clone() else {
            // Dropped, not buffered. See DESIGN.md.
            warn!("Dropping local candidate generated before a remote peer is known");
            return;
        };
        let _ = self.channel_tx.send(ChannelCommand::Send(RelayMessage::IceCandidate {
            candidate,
            to: Some(to),
            from: self.local_user_id.clone(),
            room_id: Some(self.room_id.clone()),
        }));
    }

    fn on_link_state(&mut self, state: LinkState) {
        debug!("Peer link state: {:?}", state);
        match state {
            LinkState::Connected if self.call_state == CallState::Negotiating => {
                info!("Call connected");
                self.call_state = CallState::Connected;
            }
            LinkState::Failed if self.call_state.is_active() => {
                self.fail(CallError::NegotiationFailure(
                    "peer link transport failed".to_string(),
                ));
            }
            LinkState::Disconnected => warn!("Peer link transport interrupted"),
            _ => {}
        }
    }

    // ---- teardown ----

    /// Release everything the session holds. Idempotent; safe to call
    /// with nothing held.
    async fn release_resources(&mut self) {
        // Any in-flight acquisition now resolves against a dead epoch.
        self.epoch += 1;
        if let Some(link) = self.peer_link.take() {
            link.close().await;
        }
        // Dropping the pair releases the capture handles.
        self.media = MediaState::NotRequested;
        self.remote_user_id = None;
        self.pending_join = None;
    }

    async fn teardown(&mut self) {
        self.release_resources().await;
        self.call_state = CallState::Disconnected;
    }

    fn fail(&mut self, error: CallError) {
        error!("Call failed: {}", error);
        // Resources are released inline; the link close is detached so
        // the failure transition itself stays synchronous.
        self.epoch += 1;
        if let Some(link) = self.peer_link.take() {
            tokio::spawn(async move { link.close().await });
        }
        self.media = MediaState::NotRequested;
        self.remote_user_id = None;
        self.pending_join = None;
        self.call_state = CallState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::media::TrackCapture;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout, Duration};

    // ---- mock collaborators ----

    struct MockCapture {
        inner: TrackCapture,
        acquires: AtomicUsize,
        fail: bool,
        gate: Option<Arc<Semaphore>>,
    }

    impl MockCapture {
        fn ok() -> Self {
            Self {
                inner: TrackCapture::new(&MediaConfig::default()),
                acquires: AtomicUsize::new(0),
                fail: false,
                gate: None,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl MediaCapture for MockCapture {
        async fn acquire(&self) -> Result<MediaTracks, CaptureError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail {
                return Err(CaptureError::PermissionDenied);
            }
            self.inner.acquire().await
        }
    }

    struct MockLink {
        closed: AtomicUsize,
        remote_descs: Mutex<Vec<SessionDescription>>,
        local_descs: Mutex<Vec<SessionDescription>>,
        candidates: Mutex<Vec<CandidatePayload>>,
        events: mpsc::UnboundedSender<LinkEvent>,
    }

    impl MockLink {
        fn emit(&self, event: LinkEvent) {
            let _ = self.events.send(event);
        }

        fn close_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerLink for MockLink {
        async fn create_offer(&self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::offer("v=0 mock-offer".to_string()))
        }

        async fn create_answer(&self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::answer("v=0 mock-answer".to_string()))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
            self.local_descs.lock().unwrap().push(desc);
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
            self.remote_descs.lock().unwrap().push(desc);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), CallError> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockFactory {
        links: Mutex<Vec<Arc<MockLink>>>,
    }

    impl MockFactory {
        fn created(&self) -> usize {
            self.links.lock().unwrap().len()
        }

        fn last(&self) -> Arc<MockLink> {
            self.links.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerLinkFactory for MockFactory {
        type Link = MockLink;

        async fn create(
            &self,
            _tracks: Option<&MediaTracks>,
            events: mpsc::UnboundedSender<LinkEvent>,
        ) -> Result<Arc<MockLink>, CallError> {
            let link = Arc::new(MockLink {
                closed: AtomicUsize::new(0),
                remote_descs: Mutex::new(Vec::new()),
                local_descs: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                events,
            });
            self.links.lock().unwrap().push(link.clone());
            Ok(link)
        }
    }

    // ---- harness ----

    struct Harness {
        handle: ControllerHandle,
        cmds: mpsc::UnboundedReceiver<ChannelCommand>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        capture: Arc<MockCapture>,
        factory: Arc<MockFactory>,
    }

    fn harness_with(capture: MockCapture) -> Harness {
        let (channel_tx, cmds) = mpsc::unbounded_channel();
        let (events, channel_events) = mpsc::unbounded_channel();
        let capture = Arc::new(capture);
        let factory = Arc::new(MockFactory::default());
        let handle = SessionController::spawn(
            "room_abc".to_string(),
            "user_1".to_string(),
            capture.clone(),
            factory.clone(),
            channel_tx,
            channel_events,
        );
        Harness {
            handle,
            cmds,
            events,
            capture,
            factory,
        }
    }

    fn harness() -> Harness {
        harness_with(MockCapture::ok())
    }

    async fn next_cmd(h: &mut Harness) -> ChannelCommand {
        timeout(Duration::from_secs(5), h.cmds.recv())
            .await
            .expect("timed out waiting for channel command")
            .expect("controller dropped channel handle")
    }

    async fn expect_send(h: &mut Harness) -> RelayMessage {
        match next_cmd(h).await {
            ChannelCommand::Send(msg) => msg,
            other => panic!("Expected send, got {:?}", other),
        }
    }

    async fn wait_for_state(h: &Harness, state: CallState) -> CallSnapshot {
        let mut watch = h.handle.watch();
        let snapshot = watch
            .wait_for(|snap| snap.call_state == state)
            .await
            .expect("controller stopped before reaching state")
            .clone();
        snapshot
    }

    fn inject(h: &Harness, msg: RelayMessage) {
        h.events.send(ChannelEvent::Message(msg)).unwrap();
    }

    /// start_call with an immediately connected channel, through the
    /// join handshake.
    async fn bring_to_awaiting_peer(h: &mut Harness) {
        h.handle.start_call();
        assert!(matches!(next_cmd(h).await, ChannelCommand::Connect));
        h.events
            .send(ChannelEvent::State(ChannelState::Connected))
            .unwrap();
        match expect_send(h).await {
            RelayMessage::JoinRoom { room_id, user_id } => {
                assert_eq!(room_id, "room_abc");
                assert_eq!(user_id, "user_1");
            }
            other => panic!("Expected join-room, got {:?}", other),
        }
        wait_for_state(h, CallState::AwaitingPeer).await;
    }

    /// Continue to a connected call with peer user_2.
    async fn bring_to_connected(h: &mut Harness) {
        bring_to_awaiting_peer(h).await;
        inject(
            h,
            RelayMessage::UserConnected {
                user_id: "user_2".to_string(),
            },
        );
        match expect_send(h).await {
            RelayMessage::Offer { to, from, .. } => {
                assert_eq!(to.as_deref(), Some("user_2"));
                assert_eq!(from, "user_1");
            }
            other => panic!("Expected offer, got {:?}", other),
        }
        h.factory
            .last()
            .emit(LinkEvent::StateChanged(LinkState::Connected));
        let snap = wait_for_state(h, CallState::Connected).await;
        assert_eq!(snap.remote_user_id.as_deref(), Some("user_2"));
    }

    // ---- properties ----

    #[tokio::test]
    async fn test_media_acquired_once_per_session() {
        let mut h = harness();
        h.handle.start_call();
        h.handle.start_call(); // re-entrant start overwrites, never re-acquires
        bringup_drain(&mut h).await;
        wait_for_state(&h, CallState::AwaitingPeer).await;
        assert_eq!(h.capture.acquires.load(Ordering::SeqCst), 1);
    }

    /// Drain the Connect commands a double start produces, then
    /// connect the channel and swallow the single join.
    async fn bringup_drain(h: &mut Harness) {
        assert!(matches!(next_cmd(h).await, ChannelCommand::Connect));
        assert!(matches!(next_cmd(h).await, ChannelCommand::Connect));
        h.events
            .send(ChannelEvent::State(ChannelState::Connected))
            .unwrap();
        match expect_send(h).await {
            RelayMessage::JoinRoom { .. } => {}
            other => panic!("Expected join-room, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_peer_link_for_any_event_order() {
        let mut h = harness();
        bring_to_awaiting_peer(&mut h).await;

        inject(
            &h,
            RelayMessage::UserConnected {
                user_id: "user_2".to_string(),
            },
        );
        inject(
            &h,
            RelayMessage::Offer {
                offer: SessionDescription::offer("v=0 remote".to_string()),
                to: None,
                from: "user_2".to_string(),
                room_id: Some("room_abc".to_string()),
            },
        );
        inject(
            &h,
            RelayMessage::UserConnected {
                user_id: "user_2".to_string(),
            },
        );

        // One offer out, one answer out, still a single link.
        assert!(matches!(expect_send(&mut h).await, RelayMessage::Offer { .. }));
        assert!(matches!(expect_send(&mut h).await, RelayMessage::Answer { .. }));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_join_queued_until_channel_connects() {
        let mut h = harness();
        h.handle.start_call();
        assert!(matches!(next_cmd(&mut h).await, ChannelCommand::Connect));

        // Media completes while the channel is still down: no join yet.
        sleep(Duration::from_millis(100)).await;
        assert!(h.cmds.try_recv().is_err());

        h.events
            .send(ChannelEvent::State(ChannelState::Connecting))
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(h.cmds.try_recv().is_err());

        h.events
            .send(ChannelEvent::State(ChannelState::Connected))
            .unwrap();
        match expect_send(&mut h).await {
            RelayMessage::JoinRoom { room_id, user_id } => {
                assert_eq!(room_id, "room_abc");
                assert_eq!(user_id, "user_1");
            }
            other => panic!("Expected join-room, got {:?}", other),
        }

        // Exactly one join; nothing further queued.
        sleep(Duration::from_millis(50)).await;
        assert!(h.cmds.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let mut h = harness();
        bring_to_connected(&mut h).await;
        let link = h.factory.last();

        h.handle.end_call();
        assert!(matches!(
            expect_send(&mut h).await,
            RelayMessage::LeaveRoom { .. }
        ));
        assert!(matches!(
            expect_send(&mut h).await,
            RelayMessage::EndCall { .. }
        ));
        let snap = wait_for_state(&h, CallState::Disconnected).await;
        assert_eq!(snap.remote_user_id, None);
        assert_eq!(link.close_count(), 1);

        // Second teardown: no error, no double release, no re-notify.
        h.handle.end_call();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(link.close_count(), 1);
        assert!(h.cmds.try_recv().is_err());
        assert_eq!(h.handle.snapshot().call_state, CallState::Disconnected);
    }

    #[tokio::test]
    async fn test_self_echo_causes_no_transition() {
        let mut h = harness();
        bring_to_awaiting_peer(&mut h).await;

        inject(
            &h,
            RelayMessage::UserConnected {
                user_id: "user_1".to_string(),
            },
        );
        inject(
            &h,
            RelayMessage::Offer {
                offer: SessionDescription::offer("v=0 echo".to_string()),
                to: None,
                from: "user_1".to_string(),
                room_id: Some("room_abc".to_string()),
            },
        );
        inject(
            &h,
            RelayMessage::Answer {
                answer: SessionDescription::answer("v=0 echo".to_string()),
                to: None,
                from: "user_1".to_string(),
                room_id: None,
            },
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.factory.created(), 0);
        let snap = h.handle.snapshot();
        assert_eq!(snap.call_state, CallState::AwaitingPeer);
        assert_eq!(snap.remote_user_id, None);
    }

    #[tokio::test]
    async fn test_departure_cleans_state() {
        let mut h = harness();
        bring_to_connected(&mut h).await;
        let link = h.factory.last();

        inject(
            &h,
            RelayMessage::UserDisconnected {
                user_id: "user_2".to_string(),
            },
        );
        let snap = wait_for_state(&h, CallState::Disconnected).await;
        assert_eq!(snap.remote_user_id, None);
        assert_eq!(link.close_count(), 1);

        // Departure of someone we never paired with is a no-op.
        inject(
            &h,
            RelayMessage::UserDisconnected {
                user_id: "user_3".to_string(),
            },
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.snapshot().call_state, CallState::Disconnected);
    }

    #[tokio::test]
    async fn test_end_call_notice_requires_paired_sender() {
        let mut h = harness();
        bring_to_connected(&mut h).await;
        let link = h.factory.last();

        // Hang-up notice from a user we never paired with: no effect.
        inject(
            &h,
            RelayMessage::EndCall {
                room_id: "room_abc".to_string(),
                user_id: "user_3".to_string(),
            },
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.snapshot().call_state, CallState::Connected);
        assert_eq!(link.close_count(), 0);

        // The paired peer hanging up tears the session down.
        inject(
            &h,
            RelayMessage::EndCall {
                room_id: "room_abc".to_string(),
                user_id: "user_2".to_string(),
            },
        );
        let snap = wait_for_state(&h, CallState::Disconnected).await;
        assert_eq!(snap.remote_user_id, None);
        assert_eq!(link.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stray_answer_is_discarded() {
        let mut h = harness();
        bring_to_awaiting_peer(&mut h).await;

        inject(
            &h,
            RelayMessage::Answer {
                answer: SessionDescription::answer("v=0 stray".to_string()),
                to: None,
                from: "user_2".to_string(),
                room_id: None,
            },
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.factory.created(), 0);
        assert_eq!(h.handle.snapshot().call_state, CallState::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_remote_candidate_without_link_is_dropped() {
        let mut h = harness();
        bring_to_awaiting_peer(&mut h).await;

        inject(
            &h,
            RelayMessage::IceCandidate {
                candidate: CandidatePayload {
                    candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
                to: None,
                from: "user_2".to_string(),
                room_id: None,
            },
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.factory.created(), 0);
        assert_eq!(h.handle.snapshot().call_state, CallState::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_capture_denied_fails_without_join() {
        let mut h = harness_with(MockCapture::failing());
        h.handle.start_call();
        assert!(matches!(next_cmd(&mut h).await, ChannelCommand::Connect));
        h.events
            .send(ChannelEvent::State(ChannelState::Connected))
            .unwrap();

        wait_for_state(&h, CallState::Failed).await;

        // No join-room may ever have been emitted.
        while let Ok(cmd) = h.cmds.try_recv() {
            assert!(
                !matches!(cmd, ChannelCommand::Send(RelayMessage::JoinRoom { .. })),
                "join-room sent despite capture failure"
            );
        }
    }

    #[tokio::test]
    async fn test_channel_budget_exhaustion_fails_call() {
        let mut h = harness();
        h.handle.start_call();
        assert!(matches!(next_cmd(&mut h).await, ChannelCommand::Connect));
        h.events
            .send(ChannelEvent::State(ChannelState::Failed))
            .unwrap();
        wait_for_state(&h, CallState::Failed).await;
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded_to_remote() {
        let mut h = harness();
        bring_to_connected(&mut h).await;

        h.factory.last().emit(LinkEvent::Candidate(CandidatePayload {
            candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));

        match expect_send(&mut h).await {
            RelayMessage::IceCandidate { to, from, .. } => {
                assert_eq!(to.as_deref(), Some("user_2"));
                assert_eq!(from, "user_1");
            }
            other => panic!("Expected ice-candidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_acquisition_is_discarded_after_teardown() {
        let gate = Arc::new(Semaphore::new(0));
        let mut h = harness_with(MockCapture::gated(gate.clone()));

        h.handle.start_call();
        assert!(matches!(next_cmd(&mut h).await, ChannelCommand::Connect));
        h.handle.end_call();
        assert!(matches!(
            expect_send(&mut h).await,
            RelayMessage::LeaveRoom { .. }
        ));
        assert!(matches!(
            expect_send(&mut h).await,
            RelayMessage::EndCall { .. }
        ));
        wait_for_state(&h, CallState::Disconnected).await;

        // The first acquisition resolves against the old epoch and is
        // discarded, so a fresh start acquires again.
        gate.add_permits(1);
        sleep(Duration::from_millis(50)).await;

        h.handle.start_call();
        gate.add_permits(1);
        assert!(matches!(next_cmd(&mut h).await, ChannelCommand::Connect));
        h.events
            .send(ChannelEvent::State(ChannelState::Connected))
            .unwrap();
        loop {
            match next_cmd(&mut h).await {
                ChannelCommand::Send(RelayMessage::JoinRoom { .. }) => break,
                ChannelCommand::Send(other) => panic!("Unexpected send {:?}", other),
                _ => {}
            }
        }
        wait_for_state(&h, CallState::AwaitingPeer).await;
        assert_eq!(h.capture.acquires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_after_disconnect() {
        let mut h = harness();
        bring_to_connected(&mut h).await;
        h.handle.end_call();
        let _ = expect_send(&mut h).await; // leave-room
        let _ = expect_send(&mut h).await; // end-call
        wait_for_state(&h, CallState::Disconnected).await;

        // Same session object, fresh lifecycle.
        bring_to_awaiting_peer(&mut h).await;
    }

    // ---- scenario: two controllers through a relay ----

    struct Side {
        handle: ControllerHandle,
        cmds: mpsc::UnboundedReceiver<ChannelCommand>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        factory: Arc<MockFactory>,
        user_id: &'static str,
        joined: bool,
    }

    fn side(user_id: &'static str) -> Side {
        let (channel_tx, cmds) = mpsc::unbounded_channel();
        let (events, channel_events) = mpsc::unbounded_channel();
        let factory = Arc::new(MockFactory::default());
        let handle = SessionController::spawn(
            "room_abc".to_string(),
            user_id.to_string(),
            Arc::new(MockCapture::ok()),
            factory.clone(),
            channel_tx,
            channel_events,
        );
        Side {
            handle,
            cmds,
            events,
            factory,
            user_id,
            joined: false,
        }
    }

    /// Minimal relay: joins announce the newcomer to the established
    /// member; targeted messages route by `to`.
    fn relay_step(from: &mut Side, to: &mut Side, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Connect => {
                from.events
                    .send(ChannelEvent::State(ChannelState::Connected))
                    .unwrap();
            }
            ChannelCommand::Send(RelayMessage::JoinRoom { .. }) => {
                from.joined = true;
                if to.joined {
                    to.events
                        .send(ChannelEvent::Message(RelayMessage::UserConnected {
                            user_id: from.user_id.to_string(),
                        }))
                        .unwrap();
                }
            }
            ChannelCommand::Send(
                msg @ (RelayMessage::Offer { .. }
                | RelayMessage::Answer { .. }
                | RelayMessage::IceCandidate { .. }),
            ) => {
                to.events.send(ChannelEvent::Message(msg)).unwrap();
            }
            ChannelCommand::Send(_) | ChannelCommand::Shutdown => {}
        }
    }

    #[tokio::test]
    async fn test_two_participants_reach_connected() {
        let mut a = side("user_1");
        let mut b = side("user_2");

        a.handle.start_call();
        b.handle.start_call();

        let shuttle = async {
            loop {
                tokio::select! {
                    Some(cmd) = a.cmds.recv() => relay_step(&mut a, &mut b, cmd),
                    Some(cmd) = b.cmds.recv() => relay_step(&mut b, &mut a, cmd),
                    // Snapshots publish after commands; re-check even
                    // when the relay has gone quiet.
                    _ = sleep(Duration::from_millis(20)) => {}
                }

                // Once each side has a link in negotiation, let the
                // transport come up.
                if a.factory.created() == 1 && b.factory.created() == 1 {
                    let a_negotiating =
                        a.handle.snapshot().call_state == CallState::Negotiating;
                    let b_negotiating =
                        b.handle.snapshot().call_state == CallState::Negotiating;
                    if a_negotiating && b_negotiating {
                        a.factory
                            .last()
                            .emit(LinkEvent::StateChanged(LinkState::Connected));
                        b.factory
                            .last()
                            .emit(LinkEvent::StateChanged(LinkState::Connected));
                        break;
                    }
                }
            }
        };
        timeout(Duration::from_secs(5), shuttle)
            .await
            .expect("negotiation did not converge");

        let snap_a = wait_for_side(&a, CallState::Connected).await;
        let snap_b = wait_for_side(&b, CallState::Connected).await;
        assert_eq!(snap_a.remote_user_id.as_deref(), Some("user_2"));
        assert_eq!(snap_b.remote_user_id.as_deref(), Some("user_1"));
        assert_eq!(a.factory.created(), 1);
        assert_eq!(b.factory.created(), 1);
    }

    async fn wait_for_side(side: &Side, state: CallState) -> CallSnapshot {
        let mut watch = side.handle.watch();
        let snapshot = watch
            .wait_for(|snap| snap.call_state == state)
            .await
            .expect("controller stopped before reaching state")
            .clone();
        snapshot
    }
}
