//! Interactive scenario session.
//!
//! Wires the real transports and devices into a controller, then drives it
//! from stdin:
//! typed line → turn, `/rec` + `/stop` → voice turn, `/end` → report

use crate::api::http::ReqwestTransport;
use crate::api::session::RestSessionApi;
use crate::api::speech::RestSpeechApi;
use crate::api::transport::RequestTransport;
use crate::audio::capture::CpalMicrophone;
use crate::audio::pipeline::AudioPipeline;
use crate::audio::speaker::CpalSpeaker;
use crate::channel::session_channel::SessionChannel;
use crate::channel::websocket::WebSocketTransport;
use crate::config::Config;
use crate::error::{CoachError, Result};
use crate::output;
use crate::session::controller::{ControllerConfig, ScenarioSessionController, SessionDeps};
use crate::session::types::{ControllerEvent, ControllerState};
use crate::stt::gateway::TranscriptionGateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "Type to talk to the patient. Commands: /rec, /stop, /skip, /transcript, /end [diagnosis], /quit";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Say(String),
    Record,
    Stop,
    Skip,
    Transcript,
    End(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

/// Parse a line from stdin. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Say(line.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let input = match name {
        "rec" | "record" => Input::Record,
        "stop" => Input::Stop,
        "skip" => Input::Skip,
        "transcript" => Input::Transcript,
        "end" | "done" => Input::End((!rest.is_empty()).then(|| rest.to_string())),
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    };
    Some(input)
}

/// Build a controller on the real HTTP, websocket and audio stacks.
pub fn build_controller(
    config: &Config,
    reply_timeout: Option<Duration>,
) -> Result<ScenarioSessionController> {
    let transport: Arc<dyn RequestTransport> = Arc::new(ReqwestTransport::from_config(&config.server)?);

    let channel = SessionChannel::new(
        Arc::new(WebSocketTransport::new()),
        config.server.ws_url.clone(),
        config.channel.clone(),
    );
    let audio = AudioPipeline::new(
        Box::new(CpalMicrophone::new(
            config.audio.input_device.as_deref(),
            config.audio.sample_rate,
        )),
        Arc::new(CpalSpeaker::new()),
    );

    let deps = SessionDeps {
        session_api: Arc::new(RestSessionApi::new(Arc::clone(&transport))),
        speech_api: Arc::new(RestSpeechApi::new(Arc::clone(&transport))),
        transcriber: Arc::new(TranscriptionGateway::new(transport)),
        channel,
        audio,
    };
    Ok(ScenarioSessionController::new(
        deps,
        ControllerConfig {
            reply_timeout,
            voice: config.voice.clone(),
        },
    ))
}

/// Run the `play` command until the scenario ends, fails, or the user quits.
pub async fn run_play_command(
    mut config: Config,
    scenario_id: String,
    user_id: String,
    device: Option<String>,
    reply_timeout: Option<Duration>,
) -> Result<()> {
    if let Some(d) = device {
        config.audio.input_device = Some(d);
    }
    config.validate()?;
    tracing::debug!(version = %crate::version_string(), api = %config.server.api_url, "starting coachsh");

    let controller = build_controller(&config, reply_timeout)?;
    let mut events = controller.subscribe();

    eprintln!("Starting scenario '{}'...", scenario_id);
    let session = controller.initialize(&scenario_id, &user_id).await;
    drain_events(&mut events);
    let session = session?;
    tracing::info!(session_id = %session.session_id, "session started");
    if let Some(title) = controller.scenario().and_then(|s| s.title) {
        eprintln!("{}", title);
    }
    eprintln!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line?;
                let Some(line) = line else { break };
                let Some(input) = parse_input(&line) else { continue };
                match handle_input(&controller, input).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("{}", e),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    output::render_event(&event);
                    if matches!(event, ControllerEvent::StateChanged(ControllerState::Errored)) {
                        drain_events(&mut events);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("dropped {} controller events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        }
    }

    controller.dispose();
    if controller.state() == ControllerState::Errored {
        return Err(CoachError::Other(
            "session ended with an error; start a new one to continue".to_string(),
        ));
    }
    Ok(())
}

/// Returns `Ok(false)` when the session loop should stop.
async fn handle_input(controller: &ScenarioSessionController, input: Input) -> Result<bool> {
    match input {
        Input::Say(text) => controller.submit_text(&text).await?,
        Input::Record => controller.start_capture().await?,
        Input::Stop => {
            controller.stop_capture().await?;
        }
        Input::Skip => {
            if controller.skip_playback().is_none() {
                eprintln!("Nothing is playing");
            }
        }
        Input::Transcript => output::render_transcript(&controller.transcript()),
        Input::End(diagnosis) => {
            let summary = controller.end_scenario(diagnosis.as_deref()).await?;
            eprintln!("{}", output::format_summary(&summary));
            match controller.fetch_report().await {
                Ok(report) => eprint!("{}", output::format_report(&report)),
                Err(e) => eprintln!("Assessment not available: {}", e),
            }
            return Ok(false);
        }
        Input::Help => eprintln!("{HELP}"),
        Input::Quit => return Ok(false),
        Input::Unknown(name) => eprintln!("Unknown command '/{}'. {}", name, HELP),
    }
    Ok(true)
}

fn drain_events(events: &mut broadcast::Receiver<ControllerEvent>) {
    while let Ok(event) = events.try_recv() {
        output::render_event(&event);
    }
}
