// Wire contracts between the backend, the agents and the grading containers
use crate::sync::DirectoryHashes;
use crate::types::{JobId, Limits, RawResult, SubmissionInput};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix of the stdout line carrying the container's structured result
pub const RESULT_SENTINEL: &str = "@@GRADER-RESULT@@";

/// Version of the sub-container control protocol spoken on `/sockets`
pub const CONTROL_PROTOCOL_VERSION: u32 = 1;

/// Name of the control socket inside the job's sockets directory
pub const CONTROL_SOCKET: &str = "control.sock";

pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no result line found in container output")]
    MissingResult,
    #[error("malformed result line: {0}")]
    MalformedResult(serde_json::Error),
    #[error("malformed control frame: {0}")]
    MalformedFrame(serde_json::Error),
    #[error("unsupported control protocol version {0} (expected {CONTROL_PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),
}

/// The only input the container program receives, written once to its stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInput {
    pub input: SubmissionInput,
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

/// Render a result as the line a grading program prints
pub fn format_result_line(result: &RawResult) -> Result<String, serde_json::Error> {
    Ok(format!("{} {}", RESULT_SENTINEL, serde_json::to_string(result)?))
}

/// Extract the structured result from a container's stdout.
///
/// Only the last line starting with [`RESULT_SENTINEL`] is considered; any
/// other output is ignored.
pub fn parse_container_output(stdout: &str) -> Result<RawResult, ProtocolError> {
    let payload = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix(RESULT_SENTINEL))
        .ok_or(ProtocolError::MissingResult)?;
    serde_json::from_str(payload.trim()).map_err(ProtocolError::MalformedResult)
}

/// `new_job` RPC, backend → agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJobRequest {
    pub job_id: JobId,
    pub course_id: String,
    pub task_id: String,
    pub input: SubmissionInput,
    #[serde(default)]
    pub debug: bool,
}

/// What an agent reports about itself on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Jobs the agent runs in parallel
    pub concurrency: usize,
    pub sync_enabled: bool,
}

/// `get_directory_hashes` RPC answer; `None` when the agent has sync disabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryHashesResponse {
    pub hashes: Option<DirectoryHashes>,
}

/// `update_directory` RPC, backend → agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDirectoryRequest {
    /// Base64 of a gzipped tar archive, paths relative to the task root
    pub archive: String,
    pub delete: Vec<String>,
}

impl UpdateDirectoryRequest {
    pub fn new(archive: &[u8], delete: Vec<String>) -> Self {
        Self {
            archive: general_purpose::STANDARD.encode(archive),
            delete,
        }
    }

    pub fn archive_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        general_purpose::STANDARD.decode(&self.archive)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAliasesRequest {
    pub aliases: BTreeMap<String, String>,
}

/// Sub-container operations requested from inside a grading container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Zero / empty values fall back to the parent task's settings
    Run {
        #[serde(default)]
        image: String,
        #[serde(default)]
        workdir: String,
        command: Vec<String>,
        #[serde(default)]
        memory: u64,
        #[serde(default)]
        time: u64,
        #[serde(default)]
        hard_time: u64,
    },
    Signal {
        handle: String,
        signal: String,
    },
    Stdin {
        handle: String,
    },
    Close {
        handle: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub version: u32,
    #[serde(flatten)]
    pub command: ControlCommand,
}

impl ControlRequest {
    pub fn new(command: ControlCommand) -> Self {
        Self {
            version: CONTROL_PROTOCOL_VERSION,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    /// `output_socket` names a socket in `/sockets` streaming output frames
    Started { handle: String, output_socket: String },
    Signalled { delivered: bool },
    /// `input_socket` names a socket in `/sockets` forwarding to the stdin
    StdinReady { input_socket: String },
    Closed { exit_code: i64 },
    Error { message: String },
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

/// Decode one newline-delimited control frame
pub fn decode_request(line: &str) -> Result<ControlRequest, ProtocolError> {
    let request: ControlRequest =
        serde_json::from_str(line.trim()).map_err(ProtocolError::MalformedFrame)?;
    if request.version != CONTROL_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(request.version));
    }
    Ok(request)
}

/// Encode a frame as one JSON line
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Sub-container output frame: `[stream: u8][len: u32 BE][payload]`
pub fn encode_output_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(stream);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
