//! Client session orchestration
//!
//! A single event loop owns the state machine, the audio router and the
//! detector. Microphone frames, transport events and client events (button
//! presses, drain notifications) are multiplexed with `tokio::select!` and
//! applied one at a time, so the route always matches the state whenever
//! the loop is suspended.

use std::future::Future;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioRouter, RouteMode};
use crate::error::AudioError;
use crate::events::{ActivationSource, ClientEvent, StateChanged};
use crate::hotword::ActivationDetector;
use crate::sounds::AckSoundLibrary;
use crate::state::{ClientState, Lifecycle, StateMachine};
use crate::transport::{ControlMessage, TransportClient, TransportEvent};

/// Client events waiting for the loop
const CLIENT_EVENT_BUFFER: usize = 32;

pub struct SessionOrchestrator {
    machine: StateMachine<ClientState>,
    router: AudioRouter,
    detector: ActivationDetector,
    transport: TransportClient,
    transport_events: mpsc::Receiver<TransportEvent>,
    sounds: AckSoundLibrary,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: mpsc::Receiver<ClientEvent>,
    changes: broadcast::Sender<StateChanged>,
    /// Incremented on every activation; drain notifications carry it
    session: u64,
}

impl SessionOrchestrator {
    pub fn new(
        router: AudioRouter,
        detector: ActivationDetector,
        transport: TransportClient,
        transport_events: mpsc::Receiver<TransportEvent>,
        sounds: AckSoundLibrary,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(CLIENT_EVENT_BUFFER);
        let (changes, _) = broadcast::channel(64);

        let mut machine = StateMachine::new(ClientState::Idle);
        for &state in ClientState::all() {
            let changes = changes.clone();
            machine.on_enter(state, move |from| {
                let _ = changes.send(StateChanged { from, to: state });
            });
        }

        Self {
            machine,
            router,
            detector,
            transport,
            transport_events,
            sounds,
            events_tx,
            events_rx,
            changes,
            session: 0,
        }
    }

    /// Sender for activation sources living outside the loop
    pub fn event_sender(&self) -> mpsc::Sender<ClientEvent> {
        self.events_tx.clone()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.changes.subscribe()
    }

    pub fn state(&self) -> ClientState {
        self.machine.current()
    }

    pub fn route(&self) -> RouteMode {
        self.router.mode()
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    /// Start the persistent connection and begin listening for the wake phrase
    ///
    /// A capture device that will not open is not fatal: recovery runs and
    /// the client may be left `Idle` with audio stopped.
    pub fn start(&mut self) {
        info!("starting session orchestrator");
        self.transport.start();
        if let Err(e) = self.enter_listening() {
            error!(error = %e, "could not start wake-phrase listening");
            self.recover();
        }
    }

    /// Process events until `shutdown` resolves, then tear down
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                frame = self.router.next_frame() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => self.recover(),
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        error!("transport event channel closed");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_client_event(event).await,
            }
        }

        self.shutdown().await;
    }

    /// Stop audio and close the connection
    pub async fn shutdown(&mut self) {
        self.machine.walk_to(ClientState::Idle);
        self.router.shutdown().await;
        self.transport.shutdown().await;
        info!("session orchestrator stopped");
    }

    async fn on_frame(&mut self, frame: Vec<u8>) {
        match self.router.mode() {
            RouteMode::Detector => {
                if self.detector.process_frame(&frame).is_some() {
                    self.activate(ActivationSource::Hotword).await;
                }
            }
            RouteMode::Transport => {
                // Failures are logged by the transport; loss arrives as an event
                let _ = self.transport.send_binary(frame).await;
            }
            RouteMode::Stopped => {}
        }
    }

    async fn on_client_event(&mut self, event: ClientEvent) {
        debug!(%event, "client event");
        match event {
            ClientEvent::Activation { source } => self.activate(source).await,
            ClientEvent::PlaybackDrained { session } => self.on_response_drained(session).await,
            ClientEvent::SessionEndDrained { session } => {
                if session != self.session || self.state() != ClientState::Idle {
                    debug!(session, "stale session end drain ignored");
                    return;
                }
                if let Err(e) = self.enter_listening() {
                    error!(error = %e, "cannot resume hotword listening, staying idle");
                }
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { connection_id } => {
                info!(connection_id, "connection to server established");
            }
            TransportEvent::Disconnected => {
                warn!("connection to server lost");
                if self.state().in_session() {
                    info!("ending active session due to connection loss");
                    self.end_session();
                }
            }
            TransportEvent::Control(message) => self.on_control(message),
            TransportEvent::Audio(pcm) => {
                if self.state().in_session() {
                    self.router.play(pcm).await;
                } else {
                    debug!(bytes = pcm.len(), "dropping audio outside a session");
                }
            }
        }
    }

    fn on_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::StartOfTtsStream => {
                if self.machine.transition_to(ClientState::ProcessingResponse) {
                    self.sync_route_or_recover();
                }
            }
            ControlMessage::TtsStreamEnd => {
                if self.state() != ClientState::ProcessingResponse {
                    warn!(state = %self.state(), "tts_stream_end outside a response");
                    return;
                }
                info!("tts stream ended, waiting for playback to drain");
                let session = self.session;
                self.notify_when_drained(ClientEvent::PlaybackDrained { session });
            }
            ControlMessage::SessionEnd => {
                if !self.state().in_session() {
                    debug!(state = %self.state(), "session_end with no session in progress");
                    return;
                }
                info!("server ended the session");
                self.end_session();
            }
            ControlMessage::HotwordDetected | ControlMessage::PlaybackComplete => {
                warn!(%message, "unexpected control message from server");
            }
        }
    }

    /// Shared path for wake phrase and button
    async fn activate(&mut self, source: ActivationSource) {
        if self.state() != ClientState::ListeningForHotword {
            debug!(?source, state = %self.state(), "activation ignored");
            return;
        }

        info!(?source, "activation triggered");
        if let Some(clip) = self.sounds.random() {
            self.router.play(clip.to_vec()).await;
        }

        if !self.transport.is_connected() {
            warn!(status = %self.transport.status(), "cannot start session, not connected to server");
            return;
        }

        if !self.machine.transition_to(ClientState::HotwordDetected) {
            return;
        }
        self.session += 1;

        let reached = self.sync_route().is_ok()
            && self.machine.transition_to(ClientState::ConnectingToServer)
            && self.machine.transition_to(ClientState::ActiveSession);
        if !reached {
            warn!("could not enter active session");
            self.recover();
            return;
        }

        if let Err(e) = self.sync_route() {
            error!(error = %e, "cannot route microphone to server");
            self.recover();
            return;
        }

        if let Err(e) = self.transport.send_control(ControlMessage::HotwordDetected).await {
            error!(error = %e, "server was not notified of activation");
            self.recover();
            return;
        }

        info!(session = self.session, "conversation session started");
    }

    async fn on_response_drained(&mut self, session: u64) {
        if session != self.session || self.state() != ClientState::ProcessingResponse {
            debug!(session, "stale playback drain ignored");
            return;
        }

        info!("playback complete");
        if !self.machine.transition_to(ClientState::ActiveSession) {
            return;
        }
        if !self.sync_route_or_recover() {
            return;
        }
        let _ = self
            .transport
            .send_control(ControlMessage::PlaybackComplete)
            .await;
    }

    /// Leave the session locally; the connection stays up
    fn end_session(&mut self) {
        info!(session = self.session, "ending conversation session");
        self.machine.walk_to(ClientState::Idle);
        if let Err(e) = self.router.ensure_mode(RouteMode::Stopped) {
            error!(error = %e, "failed to stop audio input");
        }

        let session = self.session;
        self.notify_when_drained(ClientEvent::SessionEndDrained { session });
    }

    /// Open the detector route, then enter `ListeningForHotword`
    fn enter_listening(&mut self) -> Result<(), AudioError> {
        self.router.ensure_mode(RouteMode::Detector)?;
        if !self.machine.walk_to(ClientState::ListeningForHotword) {
            let _ = self.router.ensure_mode(RouteMode::Stopped);
        }
        Ok(())
    }

    /// Return to wake-phrase listening, or to `Idle` with audio stopped
    fn recover(&mut self) {
        let recovered = match self.router.ensure_mode(RouteMode::Detector) {
            Ok(_) => self.machine.walk_to(ClientState::ListeningForHotword),
            Err(_) => false,
        };

        if recovered {
            info!("recovered to hotword listening");
            return;
        }

        self.machine.walk_to(ClientState::Idle);
        let _ = self.router.ensure_mode(RouteMode::Stopped);
        error!(state = %self.state(), "recovery failed, client is idle with audio stopped");
    }

    fn sync_route(&mut self) -> Result<bool, AudioError> {
        self.router.ensure_mode(self.state().required_route())
    }

    fn sync_route_or_recover(&mut self) -> bool {
        match self.sync_route() {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, state = %self.state(), "audio route change failed");
                self.recover();
                false
            }
        }
    }

    fn notify_when_drained(&self, event: ClientEvent) {
        let drained = self.router.playback().drained();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            drained.await;
            let _ = events.send(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{oneshot, watch};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use crate::audio::testing::FakeDevice;
    use crate::audio::QueuePolicy;
    use crate::config::TransportSettings;
    use crate::hotword::testing::ScriptedModel;
    use crate::transport::ConnectionStatus;

    const ACK: [u8; 4] = [42, 0, 42, 0];
    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        device: FakeDevice,
        scores: Arc<Mutex<VecDeque<f32>>>,
        changes: broadcast::Receiver<StateChanged>,
        events: mpsc::Sender<ClientEvent>,
        status: watch::Receiver<ConnectionStatus>,
        stop: Option<oneshot::Sender<()>>,
        task: Option<JoinHandle<SessionOrchestrator>>,
    }

    impl Harness {
        async fn start(url: String) -> Self {
            let device = FakeDevice::new();
            Self::start_on(
                url,
                device,
                ClientState::ListeningForHotword,
                RouteMode::Detector,
            )
            .await
        }

        async fn start_on(
            url: String,
            device: FakeDevice,
            state: ClientState,
            route: RouteMode,
        ) -> Self {
            let router = AudioRouter::new(Arc::new(device.clone()), QueuePolicy::Unbounded);

            let model = ScriptedModel::new("hey_tars", &[]);
            let scores = model.scores();
            let detector = ActivationDetector::new(Box::new(model), 0.2, Duration::ZERO);

            let settings = TransportSettings {
                heartbeat_interval_secs: 30.0,
                backoff_base_secs: 0.01,
                backoff_max_secs: 0.05,
            };
            let (transport, transport_events) = TransportClient::new(url, &settings);
            let status = transport.subscribe_status();

            let sounds = AckSoundLibrary::from_clips([("yes.raw", ACK.to_vec())]);
            let mut orchestrator =
                SessionOrchestrator::new(router, detector, transport, transport_events, sounds);
            orchestrator.start();
            assert_eq!(orchestrator.state(), state);
            assert_eq!(orchestrator.route(), route);

            let changes = orchestrator.subscribe();
            let events = orchestrator.event_sender();
            let (stop, stop_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                orchestrator
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await;
                orchestrator
            });

            Self {
                device,
                scores,
                changes,
                events,
                status,
                stop: Some(stop),
                task: Some(task),
            }
        }

        async fn connected(&mut self) {
            tokio::time::timeout(WAIT, self.status.wait_for(|s| *s == ConnectionStatus::Connected))
                .await
                .expect("client never reported connected")
                .unwrap();
        }

        fn say_wake_phrase(&self) {
            self.scores.lock().unwrap().push_back(0.95);
            assert!(self.device.inject(vec![0; 3200]));
        }

        async fn wait_for(&mut self, target: ClientState) {
            tokio::time::timeout(WAIT, async {
                loop {
                    let change = self.changes.recv().await.unwrap();
                    if change.to == target {
                        return;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("never reached {target}"));
        }

        async fn finish(mut self) -> SessionOrchestrator {
            let _ = self.stop.take().unwrap().send(());
            self.task.take().unwrap().await.unwrap()
        }
    }

    async fn server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    /// Next text frame, skipping audio
    async fn next_control(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("no frame from client")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return text;
            }
        }
    }

    async fn send_control(ws: &mut WebSocketStream<TcpStream>, kind: &str) {
        ws.send(Message::Text(format!(r#"{{"type":"{kind}"}}"#)))
            .await
            .unwrap();
    }

    async fn run_one_cycle(harness: &mut Harness, ws: &mut WebSocketStream<TcpStream>) {
        harness.say_wake_phrase();
        harness.wait_for(ClientState::ActiveSession).await;
        assert_eq!(next_control(ws).await, r#"{"type":"hotword_detected"}"#);

        // Microphone frames now flow upstream
        assert!(harness.device.inject(vec![7; 320]));
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(pcm) => {
                    assert_eq!(pcm, vec![7; 320]);
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        send_control(ws, "start_of_tts_stream").await;
        harness.wait_for(ClientState::ProcessingResponse).await;
        assert_eq!(harness.device.open_inputs(), 0);

        ws.send(Message::Binary(vec![9; 64])).await.unwrap();
        send_control(ws, "tts_stream_end").await;
        assert_eq!(next_control(ws).await, r#"{"type":"playback_complete"}"#);
        harness.wait_for(ClientState::ActiveSession).await;
        assert!(harness.device.played().contains(&vec![9; 64]));

        send_control(ws, "session_end").await;
        harness.wait_for(ClientState::Idle).await;
        harness.wait_for(ClientState::ListeningForHotword).await;
    }

    #[tokio::test]
    async fn test_sessions_reuse_one_connection() {
        let (listener, url) = server().await;
        let mut harness = Harness::start(url).await;
        let mut ws = accept(&listener).await;
        harness.connected().await;

        for _ in 0..3 {
            run_one_cycle(&mut harness, &mut ws).await;
        }

        assert!(harness.device.played().contains(&ACK.to_vec()));
        assert_eq!(harness.device.max_concurrent_inputs(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err(),
            "client must not reconnect between sessions"
        );

        let orchestrator = harness.finish().await;
        assert_eq!(orchestrator.transport().connection_id(), 1);
        assert_eq!(orchestrator.transport().reconnect_attempts(), 0);
        assert_eq!(orchestrator.state(), ClientState::Idle);
        assert_eq!(orchestrator.route(), RouteMode::Stopped);
    }

    #[tokio::test]
    async fn test_activation_without_connection_stays_listening() {
        let (listener, url) = server().await;
        drop(listener);
        let mut harness = Harness::start(url).await;

        harness
            .events
            .send(ClientEvent::Activation {
                source: ActivationSource::Button,
            })
            .await
            .unwrap();

        // The acknowledgement still plays immediately
        tokio::time::timeout(WAIT, async {
            while harness.device.played().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(harness.changes.try_recv().is_err());
        let orchestrator = harness.finish().await;
        assert_ne!(orchestrator.transport().status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_capture_failure_at_startup_leaves_client_idle() {
        let (listener, url) = server().await;
        let device = FakeDevice::new();
        device.fail_inputs(2);
        let mut harness =
            Harness::start_on(url, device, ClientState::Idle, RouteMode::Stopped).await;

        // Degraded, but the loop keeps serving the connection
        let _ws = accept(&listener).await;
        harness.connected().await;
        assert!(!harness.device.inject(vec![0; 3200]));
        assert_eq!(harness.device.open_inputs(), 0);

        let orchestrator = harness.finish().await;
        assert_eq!(orchestrator.state(), ClientState::Idle);
        assert_eq!(orchestrator.route(), RouteMode::Stopped);
    }

    #[tokio::test]
    async fn test_transient_capture_failure_at_startup_recovers() {
        let (listener, url) = server().await;
        let device = FakeDevice::new();
        device.fail_next_input();
        let mut harness = Harness::start_on(
            url,
            device,
            ClientState::ListeningForHotword,
            RouteMode::Detector,
        )
        .await;

        let _ws = accept(&listener).await;
        harness.connected().await;
        assert_eq!(harness.device.total_opens(), 1);
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_route_failure_recovers_to_listening() {
        let (listener, url) = server().await;
        let mut harness = Harness::start(url).await;
        let mut ws = accept(&listener).await;
        harness.connected().await;

        // Detector stream is already open; the transport route will fail
        harness.device.fail_next_input();
        harness.say_wake_phrase();
        harness.wait_for(ClientState::ActiveSession).await;
        harness.wait_for(ClientState::ListeningForHotword).await;

        assert_eq!(harness.device.open_inputs(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), ws.next())
                .await
                .is_err(),
            "server must not be told about a failed activation"
        );

        let orchestrator = harness.finish().await;
        assert_eq!(orchestrator.transport().connection_id(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_mid_session_ends_it() {
        let (listener, url) = server().await;
        let mut harness = Harness::start(url).await;
        let mut ws = accept(&listener).await;
        harness.connected().await;

        harness.say_wake_phrase();
        harness.wait_for(ClientState::ActiveSession).await;
        assert_eq!(next_control(&mut ws).await, r#"{"type":"hotword_detected"}"#);

        ws.close(None).await.unwrap();
        harness.wait_for(ClientState::Idle).await;
        harness.wait_for(ClientState::ListeningForHotword).await;

        // The connection comes back on its own
        let _ws = accept(&listener).await;
        let orchestrator = harness.finish().await;
        assert!(orchestrator.transport().connection_id() >= 1);
    }
}
