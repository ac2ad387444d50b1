//! Line-oriented intent source
//!
//! One intent per line, optionally prefixed with a robot id:
//!
//! ```text
//! forward 60          # every connected robot
//! 1 transform         # robot 1 only
//! wait 500
//! servo head 40
//! ```

use crate::domain::intent::{Intent, IntentEnvelope, IntentSender, IntentSource};
use crate::domain::models::{MoveDirection, RobotId, Side, TurnDirection};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{command} expects {expected}")]
    MissingArgument {
        command: String,
        expected: &'static str,
    },

    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),

    #[error("unexpected argument '{0}'")]
    TrailingArgument(String),

    #[error("{0} always applies to every robot")]
    FleetWide(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Intent(IntentEnvelope),
    Wait(Duration),
    Quit,
}

fn number<T: FromStr>(token: Option<&str>, command: &str, expected: &'static str) -> Result<T, ScriptError> {
    let token = token.ok_or_else(|| ScriptError::MissingArgument {
        command: command.to_string(),
        expected,
    })?;
    token
        .parse()
        .map_err(|_| ScriptError::InvalidNumber(token.to_string()))
}

/// Parse one script line. Blank lines and comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ScriptLine>, ScriptError> {
    let line = line.split('#').next().unwrap_or_default().trim();
    let mut tokens = line.split_whitespace().peekable();

    let robot = match tokens.peek().map(|t| t.parse::<RobotId>()) {
        Some(Ok(id)) => {
            tokens.next();
            Some(id)
        }
        _ => None,
    };
    let Some(verb) = tokens.next() else {
        return Ok(None);
    };
    let verb = verb.to_lowercase();
    let command = verb.as_str();

    let intent = match command {
        "quit" | "exit" => return Ok(Some(ScriptLine::Quit)),
        "wait" => {
            let ms: u64 = number(tokens.next(), command, "milliseconds")?;
            return Ok(Some(ScriptLine::Wait(Duration::from_millis(ms))));
        }
        "forward" | "reverse" | "reverse-left" | "reverse-right" => {
            let direction = match command {
                "forward" => MoveDirection::Forward,
                "reverse" => MoveDirection::Reverse,
                "reverse-left" => MoveDirection::ReverseLeft,
                _ => MoveDirection::ReverseRight,
            };
            let speed = number(tokens.next(), command, "a speed")?;
            Intent::Move { direction, speed }
        }
        "turn-left" | "turn-right" => {
            let direction = if command == "turn-left" {
                TurnDirection::Left
            } else {
                TurnDirection::Right
            };
            let rate = number(tokens.next(), command, "a rate")?;
            Intent::Turn { direction, rate }
        }
        "step-left" => Intent::Step { side: Side::Left },
        "step-right" => Intent::Step { side: Side::Right },
        "stop" => Intent::Stop,
        "transform" => Intent::Transform,
        "action" => Intent::Action(number(tokens.next(), command, "a button number")?),
        "toggle-speed" => Intent::ToggleSpeed,
        "servo" => {
            let label = tokens.next().ok_or_else(|| ScriptError::MissingArgument {
                command: command.to_string(),
                expected: "a servo label",
            })?;
            let value = number(tokens.next(), command, "a position")?;
            Intent::SetServo {
                label: label.to_string(),
                value,
            }
        }
        "query-position" => Intent::QueryPosition,
        "query-info" => Intent::QueryInfo,
        "shutdown" => Intent::Shutdown,
        "run-sequence" => Intent::RunSequence {
            id: number(tokens.next(), command, "a sequence id")?,
        },
        "rescan" => Intent::Rescan,
        "disconnect-all" => Intent::DisconnectAll,
        _ => return Err(ScriptError::UnknownCommand(verb)),
    };

    if let Some(extra) = tokens.next() {
        return Err(ScriptError::TrailingArgument(extra.to_string()));
    }

    let envelope = match robot {
        Some(_) if intent.is_fleet_wide() => return Err(ScriptError::FleetWide(intent.name())),
        Some(id) => IntentEnvelope::robot(id, intent),
        None => IntentEnvelope::all(intent),
    };
    Ok(Some(ScriptLine::Intent(envelope)))
}

/// Reads script lines until EOF, `quit` or cancellation.
pub struct ScriptIntentSource<R> {
    reader: R,
    name: String,
}

impl ScriptIntentSource<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl<R: AsyncBufRead + Unpin + Send> ScriptIntentSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> IntentSource for ScriptIntentSource<R> {
    async fn run(&mut self, sender: IntentSender, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Reading intents from {}", self.name);
        let mut lines = (&mut self.reader).lines();
        let mut number = 0usize;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("{} reached end of input", self.name);
                break;
            };
            number += 1;

            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(ScriptLine::Quit)) => break,
                Ok(Some(ScriptLine::Wait(pause))) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Ok(Some(ScriptLine::Intent(envelope))) => sender.send(envelope)?,
                Err(e) => warn!("{}:{}: {}", self.name, number, e),
            }
        }
        Ok(())
    }
}
