use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::deserialize_duration;
use crate::location::{LocationFix, SensorError};
use crate::trip::TripPhase;

const DEFAULT_SETTLE: Duration = Duration::milliseconds(500);

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("step {0}: {1}")]
    Step(usize, String),
    #[error("invalid settle duration: {0}")]
    Settle(String),
    #[error("scenario has no 'steps' list")]
    MissingSteps,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    #[allow(dead_code)]
    pub variables: HashMap<String, Value>,
    /// How long to let background work finish after the last step.
    pub settle: Duration,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub time: Option<TimeExpr>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeExpr {
    Relative(Duration),
    Absolute(DateTime<Utc>),
}

impl TimeExpr {
    /// Maps the expression onto the runtime clock. `started` and
    /// `started_wall` are the same moment on the two clocks; times before
    /// the start resolve to the start.
    pub fn deadline(&self, started: Instant, started_wall: DateTime<Utc>) -> Instant {
        let offset = match self {
            TimeExpr::Relative(d) => *d,
            TimeExpr::Absolute(at) => *at - started_wall,
        };
        started + offset.to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFault {
    Unavailable,
    Timeout,
    PermissionRevoked,
    Other,
}

impl SensorFault {
    pub fn to_error(self, message: Option<&str>) -> SensorError {
        let message = message.unwrap_or("simulated fault").to_string();
        match self {
            SensorFault::Unavailable => SensorError::Unavailable(message),
            SensorFault::Timeout => SensorError::Timeout,
            SensorFault::PermissionRevoked => SensorError::PermissionRevoked,
            SensorFault::Other => SensorError::Other(message),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SensorCommand {
    Fix(LocationFix),
    Error {
        kind: SensorFault,
        #[serde(default)]
        message: Option<String>,
    },
    SetPermission {
        granted: bool,
    },
    SetLastKnown(LocationFix),
    SetCurrent(LocationFix),
    /// Delay before the permission prompt answers. Zero removes it.
    SetPermissionLatency {
        #[serde(deserialize_with = "deserialize_duration")]
        latency: std::time::Duration,
    },
    FailWatch {
        kind: SensorFault,
        #[serde(default)]
        message: Option<String>,
    },
    RestoreWatch,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackerCommand {
    Start,
    Stop,
    Refresh,
    RequestPermission,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TripCommand {
    SetPhase { phase: TripPhase },
    SetRide { ride_id: String },
    ClearRide,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AppCommand {
    Foreground,
    Inactive,
    Background,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransportCommand {
    Reconnected,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconnectCommand {
    SkipNext,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CollaboratorsCommand {
    Set {
        #[serde(default)]
        fail_prefetch: Option<bool>,
        #[serde(default)]
        fail_chat: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Sensor(SensorCommand),
    Tracker(TrackerCommand),
    Trip(TripCommand),
    App(AppCommand),
    Transport(TransportCommand),
    Reconnect(ReconnectCommand),
    Collaborators(CollaboratorsCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sensor(SensorCommand::Fix(_)) => "sensor.fix",
            Command::Sensor(SensorCommand::Error { .. }) => "sensor.error",
            Command::Sensor(SensorCommand::SetPermission { .. }) => "sensor.set_permission",
            Command::Sensor(SensorCommand::SetLastKnown(_)) => "sensor.set_last_known",
            Command::Sensor(SensorCommand::SetCurrent(_)) => "sensor.set_current",
            Command::Sensor(SensorCommand::SetPermissionLatency { .. }) => {
                "sensor.set_permission_latency"
            }
            Command::Sensor(SensorCommand::FailWatch { .. }) => "sensor.fail_watch",
            Command::Sensor(SensorCommand::RestoreWatch) => "sensor.restore_watch",
            Command::Tracker(TrackerCommand::Start) => "tracker.start",
            Command::Tracker(TrackerCommand::Stop) => "tracker.stop",
            Command::Tracker(TrackerCommand::Refresh) => "tracker.refresh",
            Command::Tracker(TrackerCommand::RequestPermission) => "tracker.request_permission",
            Command::Trip(TripCommand::SetPhase { .. }) => "trip.set_phase",
            Command::Trip(TripCommand::SetRide { .. }) => "trip.set_ride",
            Command::Trip(TripCommand::ClearRide) => "trip.clear_ride",
            Command::App(AppCommand::Foreground) => "app.foreground",
            Command::App(AppCommand::Inactive) => "app.inactive",
            Command::App(AppCommand::Background) => "app.background",
            Command::Transport(TransportCommand::Reconnected) => "transport.reconnected",
            Command::Reconnect(ReconnectCommand::SkipNext) => "reconnect.skip_next",
            Command::Collaborators(CollaboratorsCommand::Set { .. }) => "collaborators.set",
        }
    }
}

#[derive(Deserialize)]
struct RawScenario {
    #[serde(default)]
    variables: HashMap<String, Value>,
    settle: Option<String>,
    steps: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct RawStep {
    time: Option<String>,
    #[serde(flatten)]
    modules: Mapping,
}

impl Scenario {
    pub fn from_str(yaml: &str) -> Result<Self, ParseError> {
        let raw: RawScenario = serde_yaml::from_str(yaml)?;

        let settle = match raw.settle {
            Some(text) => parse_duration(&text).map_err(ParseError::Settle)?,
            None => DEFAULT_SETTLE,
        };

        let steps = raw
            .steps
            .ok_or(ParseError::MissingSteps)?
            .into_iter()
            .enumerate()
            .map(|(i, step)| {
                parse_step(substitute(step, &raw.variables)).map_err(|e| ParseError::Step(i, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Scenario {
            variables: raw.variables,
            settle,
            steps,
        })
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_yaml::from_value(value).map_err(|e| e.to_string())
}

/// A step is an optional `time` plus exactly one `<module>: <command>` entry.
fn parse_step(value: Value) -> Result<Step, String> {
    let raw: RawStep = decode(value)?;
    let time = raw.time.as_deref().map(TimeExpr::parse).transpose()?;

    let mut modules = raw.modules.into_iter();
    let (module, body) = match (modules.next(), modules.next()) {
        (Some(entry), None) => entry,
        (None, _) => return Err("no command found".into()),
        (Some(_), Some(_)) => return Err("expected a single command per step".into()),
    };
    let module = module.as_str().ok_or("command module must be a string")?;

    let command = match module {
        "sensor" => Command::Sensor(decode(body)?),
        "tracker" => Command::Tracker(decode(body)?),
        "trip" => Command::Trip(decode(body)?),
        "app" => Command::App(decode(body)?),
        "transport" => Command::Transport(decode(body)?),
        "reconnect" => Command::Reconnect(decode(body)?),
        "collaborators" => Command::Collaborators(decode(body)?),
        other => return Err(format!("unknown module: {}", other)),
    };

    Ok(Step { time, command })
}

impl TimeExpr {
    /// `T+1s` / `T-5m` relative to the run start, an RFC 3339 instant, or an
    /// RFC 3339 instant followed by a whitespace-separated signed offset.
    fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if let Some(offset) = text.strip_prefix(['T', 't']) {
            return parse_offset(offset).map(TimeExpr::Relative);
        }

        let (base, offset) = match text.split_once(char::is_whitespace) {
            Some((base, offset)) => (base, Some(offset)),
            None => (text, None),
        };
        let base = DateTime::parse_from_rfc3339(base)
            .map_err(|e| format!("invalid time '{}': {}", base, e))?
            .with_timezone(&Utc);
        let offset = offset.map(parse_offset).transpose()?.unwrap_or_else(Duration::zero);
        Ok(TimeExpr::Absolute(base + offset))
    }
}

/// Signed humantime offset such as `+10s`, `- 1m 30s`.
fn parse_offset(text: &str) -> Result<Duration, String> {
    let text = text.trim_start();
    let mut chars = text.chars();
    let negative = match chars.next() {
        Some('+') => false,
        Some('-') => true,
        _ => return Err(format!("offset '{}' must start with + or -", text)),
    };
    let magnitude = parse_duration(chars.as_str())?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let std = humantime::parse_duration(text.trim()).map_err(|e| e.to_string())?;
    Duration::from_std(std).map_err(|e| e.to_string())
}

/// Replaces `$name` references. A string that is exactly one reference takes
/// the variable's own YAML type; references inside longer strings are
/// spliced in as text. Unknown names are left untouched.
fn substitute(value: Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(text) => {
            if let Some(found) = text.trim().strip_prefix('$').and_then(|name| vars.get(name)) {
                return found.clone();
            }
            Value::String(interpolate(&text, vars))
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, vars)))
                .collect(),
        ),
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(|v| substitute(v, vars)).collect())
        }
        other => other,
    }
}

fn interpolate(text: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let tail = &rest[at + 1..];
        let len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        let name = &tail[..len];
        match vars.get(name).and_then(scalar_text) {
            Some(replacement) => out.push_str(&replacement),
            None => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &tail[len..];
    }
    out.push_str(rest);
    out
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
