//! Connection loss: bounded reconnects, terminal close, and what the
//! controller does about it.

use coachsh::api::session::MockSessionApi;
use coachsh::api::speech::MockSpeechApi;
use coachsh::audio::playback::MockSpeaker;
use coachsh::audio::recorder::MockMicrophone;
use coachsh::channel::protocol::OutboundEvent;
use coachsh::channel::session_channel::ChannelClosed;
use coachsh::channel::transport::{MockConnect, MockSocketTransport};
use coachsh::config::ChannelSettings;
use coachsh::stt::transcriber::MockTranscriber;
use coachsh::{
    AudioPipeline, ChannelState, CoachError, ControllerConfig, ControllerEvent, ControllerState,
    ScenarioSessionController, SessionChannel, SessionDeps,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn settings(max_attempts: u32) -> ChannelSettings {
    ChannelSettings {
        handshake_timeout_ms: 2_000,
        reconnect_base_delay_ms: 1_000,
        max_reconnect_attempts: max_attempts,
    }
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_and_reports_once() {
    let socket = MockSocketTransport::new().with_script([
        MockConnect::Accept,
        MockConnect::Refuse,
        MockConnect::Hang,
        MockConnect::Refuse,
    ]);
    let channel = SessionChannel::new(Arc::new(socket.clone()), "ws://sim.test", settings(3));
    let closed: Arc<Mutex<Vec<ChannelClosed>>> = Arc::default();
    let _sub = {
        let closed = Arc::clone(&closed);
        channel.on_close(move |c| closed.lock().unwrap().push(c.clone()))
    };

    channel.open("s-1").await.unwrap();
    let mut state = channel.watch_state();
    socket.drop_connection();

    state.wait_for(|s| *s == ChannelState::Closed).await.unwrap();

    // one initial connect plus exactly three reconnect attempts
    assert_eq!(socket.connect_count(), 4);
    let closed = closed.lock().unwrap().clone();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].attempts, 3);

    // Closed is final: no further attempts, sends are refused.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(socket.connect_count(), 4);
    assert!(matches!(
        channel
            .send(&OutboundEvent::StudentMessage {
                message: "hello?".to_string()
            })
            .await,
        Err(CoachError::NotConnected { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn recovers_when_a_reconnect_succeeds() {
    let socket = MockSocketTransport::new().with_script([
        MockConnect::Accept,
        MockConnect::Refuse,
        MockConnect::Accept,
    ]);
    let channel = SessionChannel::new(Arc::new(socket.clone()), "ws://sim.test", settings(3));
    channel.open("s-1").await.unwrap();
    let mut state = channel.watch_state();

    socket.drop_connection();
    state.wait_for(|s| *s == ChannelState::Reconnecting).await.unwrap();
    state.wait_for(|s| *s == ChannelState::Open).await.unwrap();

    channel
        .send(&OutboundEvent::StudentMessage {
            message: "still there?".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(socket.sent().len(), 1);
    assert_eq!(socket.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_errors_the_controller() {
    let socket = MockSocketTransport::new().with_script([
        MockConnect::Accept,
        MockConnect::Refuse,
        MockConnect::Refuse,
    ]);
    let mic = MockMicrophone::new();
    let controller = ScenarioSessionController::new(
        SessionDeps {
            session_api: Arc::new(MockSessionApi::new()),
            speech_api: Arc::new(MockSpeechApi::new()),
            transcriber: Arc::new(MockTranscriber::new()),
            channel: SessionChannel::new(Arc::new(socket.clone()), "ws://sim.test", settings(2)),
            audio: AudioPipeline::new(
                Box::new(mic.clone()),
                Arc::new(MockSpeaker::new(Duration::from_millis(10))),
            ),
        },
        ControllerConfig::default(),
    );
    let mut events = controller.subscribe();
    controller.initialize("chest-pain", "student-7").await.unwrap();
    controller.submit_text("Can you hear me?").await.unwrap();

    socket.drop_connection();

    let mut saw_reconnecting = false;
    let message = loop {
        match events.recv().await.unwrap() {
            ControllerEvent::ChannelStateChanged(ChannelState::Reconnecting) => {
                saw_reconnecting = true
            }
            ControllerEvent::Error { message } => break message,
            _ => {}
        }
    };
    assert!(saw_reconnecting);
    assert!(message.contains("Connection lost"), "got: {}", message);
    assert_eq!(controller.state(), ControllerState::Errored);
    assert_eq!(socket.connect_count(), 3);

    // Errored is terminal.
    assert!(matches!(
        controller.submit_text("hello?").await,
        Err(CoachError::InvalidState { .. })
    ));
    assert!(matches!(
        controller.end_scenario(None).await,
        Err(CoachError::InvalidState { .. })
    ));
    assert!(!mic.is_active());
}
