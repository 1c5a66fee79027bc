//! Control surface: the typed commands the supervisor accepts, their JSON
//! wire decoding, and a line-delimited stdin control source.
//!
//! Transport is deliberately abstract: any source that can produce
//! `Command` values and push them into the supervisor's channel works.
//! Unknown message types and unknown commands are logged and ignored.

use std::io::{self, BufRead};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Deserialize;

use crate::supervisor::Supervisor;

/// A control operation on the running simulation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    Step,
    SetViewStartIndex(i64),
    Set32BitAddressing(bool),
    SetRelativeAddressing(bool),
    SetIpPtr { id: u32, ptr: i32 },
    SetCosmicRayRate(f64),
}

/// Incoming JSON control message. Fields not used by a given `type` are
/// simply absent and default.
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub ptr: i32,
}

impl Command {
    /// Decode a wire message into a command. Unknown types and unknown
    /// command names are logged and yield `None`.
    pub fn from_message(msg: &ControlMessage) -> Option<Command> {
        match msg.kind.as_str() {
            "command" => match msg.command.as_str() {
                "pause" => Some(Command::Pause),
                "resume" => Some(Command::Resume),
                "step" => Some(Command::Step),
                other => {
                    eprintln!("Unknown command received: {}", other);
                    None
                }
            },
            "set_view_start_index" => Some(Command::SetViewStartIndex(msg.value as i64)),
            "set_32_bit_addressing" => Some(Command::Set32BitAddressing(msg.value == 1.0)),
            "set_relative_addressing" => Some(Command::SetRelativeAddressing(msg.value == 1.0)),
            "set_ip_ptr" => Some(Command::SetIpPtr { id: msg.id, ptr: msg.ptr }),
            "set_cosmic_ray_rate" => Some(Command::SetCosmicRayRate(msg.value)),
            other => {
                eprintln!("Unknown message type received: {}", other);
                None
            }
        }
    }
}

/// Read line-delimited JSON control messages from stdin and forward the
/// decoded commands. Malformed lines are logged and skipped; EOF ends the
/// source.
pub fn spawn_stdin_source(tx: Sender<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ControlMessage>(&line) {
                Ok(msg) => {
                    if let Some(cmd) = Command::from_message(&msg) {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => eprintln!("error decoding control message: {}", e),
            }
        }
    })
}

/// Apply commands from a control source to the supervisor, until the source
/// disconnects.
pub fn spawn_dispatcher(supervisor: Arc<Supervisor>, rx: Receiver<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(cmd) = rx.recv() {
            supervisor.handle_command(cmd);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Option<Command> {
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        Command::from_message(&msg)
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(
            decode(r#"{"type":"command","command":"pause"}"#),
            Some(Command::Pause)
        );
        assert_eq!(
            decode(r#"{"type":"command","command":"resume"}"#),
            Some(Command::Resume)
        );
        assert_eq!(
            decode(r#"{"type":"command","command":"step"}"#),
            Some(Command::Step)
        );
    }

    #[test]
    fn test_decode_setters() {
        assert_eq!(
            decode(r#"{"type":"set_view_start_index","value":4096}"#),
            Some(Command::SetViewStartIndex(4096))
        );
        assert_eq!(
            decode(r#"{"type":"set_32_bit_addressing","value":1}"#),
            Some(Command::Set32BitAddressing(true))
        );
        assert_eq!(
            decode(r#"{"type":"set_relative_addressing","value":0}"#),
            Some(Command::SetRelativeAddressing(false))
        );
        assert_eq!(
            decode(r#"{"type":"set_ip_ptr","id":7,"ptr":1234}"#),
            Some(Command::SetIpPtr { id: 7, ptr: 1234 })
        );
        assert_eq!(
            decode(r#"{"type":"set_cosmic_ray_rate","value":0.25}"#),
            Some(Command::SetCosmicRayRate(0.25))
        );
    }

    #[test]
    fn test_unknown_messages_are_ignored() {
        assert_eq!(decode(r#"{"type":"set_jump_rate","value":0.5}"#), None);
        assert_eq!(decode(r#"{"type":"command","command":"explode"}"#), None);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(serde_json::from_str::<ControlMessage>("not json").is_err());
        // A message without a type field fails to decode rather than panic.
        assert!(serde_json::from_str::<ControlMessage>(r#"{"value":1}"#).is_err());
    }
}
