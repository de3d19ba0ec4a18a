//! Terminal rendering of controller events, transcripts and reports.
//! Everything goes to stderr so stdout stays free for piping.

use crate::api::types::{AssessmentReport, CompletionSummary};
use crate::audio::pipeline::CaptureState;
use crate::channel::session_channel::ChannelState;
use crate::session::types::{ControllerEvent, ControllerState, Role, TranscriptEntry};

const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Clear the current terminal line (replaces the prompt)
pub fn clear_line() {
    eprint!("\r\x1b[2K");
}

fn role_label(role: Role) -> String {
    match role {
        Role::Patient => format!("{CYAN}{BOLD}Patient{RESET}"),
        Role::User => format!("{GREEN}{BOLD}You{RESET}"),
    }
}

/// One transcript line, e.g. `Patient: My chest hurts.  (14:02:11)`
pub fn format_entry(entry: &TranscriptEntry) -> String {
    let time = entry.timestamp_utc.format("%H:%M:%S");
    let audio = if entry.audio_ref.is_some() {
        format!(" {DIM}[audio]{RESET}")
    } else {
        String::new()
    };
    format!(
        "{}: {}{audio}  {DIM}({time}){RESET}",
        role_label(entry.role),
        entry.text
    )
}

/// Status line for a state change, or `None` when the change is not worth showing.
fn format_state(state: ControllerState) -> Option<String> {
    match state {
        ControllerState::AwaitingPatientTurn => Some(format!("{DIM}waiting for the patient...{RESET}")),
        ControllerState::Completed => Some(format!("{GREEN}Scenario completed{RESET}")),
        ControllerState::Initializing
        | ControllerState::AwaitingUserTurn
        | ControllerState::Errored => None,
    }
}

fn format_channel(state: ChannelState) -> Option<String> {
    match state {
        ChannelState::Reconnecting => Some(format!("{YELLOW}Connection lost, reconnecting...{RESET}")),
        ChannelState::Closed => Some(format!("{DIM}connection closed{RESET}")),
        ChannelState::Open => Some(format!("{DIM}connected{RESET}")),
        ChannelState::Connecting => None,
    }
}

fn format_capture(state: CaptureState) -> Option<String> {
    match state {
        CaptureState::Recording => Some(format!("{RED}● recording{RESET} {DIM}(/stop to send){RESET}")),
        CaptureState::Stopping => Some(format!("{DIM}transcribing...{RESET}")),
        CaptureState::Idle => None,
    }
}

/// Render one controller event to stderr.
pub fn render_event(event: &ControllerEvent) {
    let line = match event {
        ControllerEvent::TranscriptUpdated { entry, .. } => Some(format_entry(entry)),
        ControllerEvent::StateChanged(state) => format_state(*state),
        ControllerEvent::ChannelStateChanged(state) => format_channel(*state),
        ControllerEvent::CaptureStateChanged(state) => format_capture(*state),
        ControllerEvent::ServerError { message } => {
            Some(format!("{YELLOW}Server: {message}{RESET} {DIM}(try again){RESET}"))
        }
        ControllerEvent::Error { message } => Some(format!("{RED}Error: {message}{RESET}")),
    };
    if let Some(line) = line {
        clear_line();
        eprintln!("{line}");
    }
}

/// Full transcript, one line per turn.
pub fn render_transcript(entries: &[TranscriptEntry]) {
    for entry in entries {
        eprintln!("{}", format_entry(entry));
    }
}

pub fn format_summary(summary: &CompletionSummary) -> String {
    match summary.duration {
        Some(secs) => format!("Session length: {}m {:02}s", secs / 60, secs % 60),
        None => "Session completed".to_string(),
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{BOLD}{title}{RESET}\n"));
    for item in items {
        out.push_str(&format!("  - {item}\n"));
    }
}

/// Human-readable assessment. Unknown fields are left out; `raw` holds them.
pub fn format_report(report: &AssessmentReport) -> String {
    let mut out = String::new();
    match report.overall_score {
        Some(score) => {
            let color = if score >= 70.0 {
                GREEN
            } else if score >= 50.0 {
                YELLOW
            } else {
                RED
            };
            out.push_str(&format!("{BOLD}Overall score:{RESET} {color}{score:.0}{RESET}\n"));
        }
        None => out.push_str(&format!("{BOLD}Overall score:{RESET} {DIM}not available{RESET}\n")),
    }
    if let Some(summary) = &report.feedback_summary {
        out.push_str(&format!("\n{summary}\n"));
    }
    push_list(&mut out, "Strengths", &report.strengths);
    push_list(&mut out, "Areas for improvement", &report.areas_for_improvement);
    push_list(&mut out, "Recommendations", &report.recommendations);
    out
}
