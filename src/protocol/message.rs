use std::fmt;

use thiserror::Error;

use crate::jobs::JobId;

pub const HELLO: &str = "HELLO";
pub const HELLO_RETRY: &str = "HELLO_RETRY";
pub const HELLO_OK: &str = "HELLO_OK";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const START: &str = "START";
pub const START_OK: &str = "START_OK";
pub const CANCEL: &str = "CANCEL";
pub const STATUS: &str = "STATUS";
pub const END: &str = "END";
pub const END_OK: &str = "END_OK";
pub const ERROR: &str = "ERROR";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown action {0:?}")]
    UnknownAction(String),

    #[error("{action} expects {expected} fields, got {got}")]
    Arity {
        action: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("{action} carries invalid job id {value:?}")]
    InvalidJobId { action: &'static str, value: String },
}

/// Payload of a `START` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub id: JobId,
    pub job_definition: String,
    pub device_definition: String,
    pub env: String,
    pub env_dut: Option<String>,
}

/// Messages the coordinator sends to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    HelloOk,
    Pong,
    Start(StartRequest),
    Cancel { id: JobId },
    Status { id: JobId },
    EndOk { id: JobId },
}

impl Inbound {
    pub fn decode(frames: &[String]) -> Result<Self, ProtocolError> {
        let (action, args) = frames.split_first().ok_or(ProtocolError::Empty)?;
        match action.as_str() {
            HELLO_OK => {
                expect_arity(HELLO_OK, "1", frames.len() == 1, frames.len())?;
                Ok(Inbound::HelloOk)
            }
            PONG => {
                expect_arity(PONG, "1", frames.len() == 1, frames.len())?;
                Ok(Inbound::Pong)
            }
            START => {
                expect_arity(START, "5 or 6", matches!(frames.len(), 5 | 6), frames.len())?;
                Ok(Inbound::Start(StartRequest {
                    id: parse_id(START, &args[0])?,
                    job_definition: args[1].clone(),
                    device_definition: args[2].clone(),
                    env: args[3].clone(),
                    env_dut: args.get(4).filter(|s| !s.is_empty()).cloned(),
                }))
            }
            CANCEL => Ok(Inbound::Cancel {
                id: single_id(CANCEL, frames)?,
            }),
            STATUS => Ok(Inbound::Status {
                id: single_id(STATUS, frames)?,
            }),
            END_OK => Ok(Inbound::EndOk {
                id: single_id(END_OK, frames)?,
            }),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Inbound::HelloOk => HELLO_OK,
            Inbound::Pong => PONG,
            Inbound::Start(_) => START,
            Inbound::Cancel { .. } => CANCEL,
            Inbound::Status { .. } => STATUS,
            Inbound::EndOk { .. } => END_OK,
        }
    }
}

fn expect_arity(
    action: &'static str,
    expected: &'static str,
    ok: bool,
    got: usize,
) -> Result<(), ProtocolError> {
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::Arity {
            action,
            expected,
            got,
        })
    }
}

fn single_id(action: &'static str, frames: &[String]) -> Result<JobId, ProtocolError> {
    expect_arity(action, "2", frames.len() == 2, frames.len())?;
    parse_id(action, &frames[1])
}

fn parse_id(action: &'static str, value: &str) -> Result<JobId, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidJobId {
        action,
        value: value.to_string(),
    })
}

/// Messages the agent sends to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Hello,
    HelloRetry,
    Ping,
    StartOk { id: JobId },
    End { id: JobId, status: i32 },
    Error { id: JobId, message: String },
}

impl Outbound {
    pub fn encode(&self) -> Vec<String> {
        match self {
            Outbound::Hello => vec![HELLO.to_string()],
            Outbound::HelloRetry => vec![HELLO_RETRY.to_string()],
            Outbound::Ping => vec![PING.to_string()],
            Outbound::StartOk { id } => vec![START_OK.to_string(), id.to_string()],
            Outbound::End { id, status } => {
                vec![END.to_string(), id.to_string(), status.to_string()]
            }
            Outbound::Error { id, message } => {
                vec![ERROR.to_string(), id.to_string(), message.clone()]
            }
        }
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Hello => write!(f, "{HELLO}"),
            Outbound::HelloRetry => write!(f, "{HELLO_RETRY}"),
            Outbound::Ping => write!(f, "{PING}"),
            Outbound::StartOk { id } => write!(f, "{START_OK}({id})"),
            Outbound::End { id, status } => write!(f, "{END}({id}, {status})"),
            Outbound::Error { id, .. } => write!(f, "{ERROR}({id})"),
        }
    }
}
