//! Child process plumbing shared by the interpreter and compiler executors.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use serde_json::Value;
use slotgrid_core::ExecutorError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("{0} pipe unavailable")]
    Pipe(&'static str),

    #[error("exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for ExecutorError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound(program) => ExecutorError::Unavailable(program),
            ProcessError::Io(e) => ExecutorError::Io(e),
            other => ExecutorError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` to completion, feeding `stdin` and capturing both output
/// streams. A non-zero exit is an error carrying stderr.
///
/// The child is killed when the returned future is dropped, which is how
/// engine timeouts reclaim runaway units.
pub async fn run_process<I, S>(
    program: &Path,
    args: I,
    working_dir: &Path,
    stdin: Option<&[u8]>,
) -> Result<ProcessOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound(program.display().to_string())
            } else {
                ProcessError::Io(e)
            }
        })?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(tokio::spawn(write_input(pipe, input.to_vec()))),
        (Some(_), None) => return Err(ProcessError::Pipe("stdin")),
        _ => None,
    };
    let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;
    let stdout_handle = tokio::spawn(read_all(stdout));
    let stderr_handle = tokio::spawn(read_all(stderr));

    if let Some(writer) = writer {
        join_task(writer).await?;
    }
    let stdout = join_task(stdout_handle).await?;
    let stderr = join_task(stderr_handle).await?;
    let status = child.wait().await?;

    if !status.success() {
        tracing::debug!(program = %program.display(), %status, "process failed");
        return Err(ProcessError::Exit {
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(ProcessOutput { stdout, stderr })
}

async fn read_all<R>(reader: R) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut output = String::new();
    reader.read_to_string(&mut output).await?;
    Ok(output)
}

/// Feed stdin and close it. A child that exits without reading all of its
/// input closes the pipe early, which is not an error.
async fn write_input(mut pipe: ChildStdin, input: Vec<u8>) -> std::io::Result<()> {
    match pipe.write_all(&input).await {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

async fn join_task<T>(handle: JoinHandle<std::io::Result<T>>) -> Result<T, ProcessError> {
    handle
        .await
        .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?
        .map_err(ProcessError::Io)
}

/// Units exchange JSON over stdio. Null input sends nothing; stdout that
/// is not JSON comes back as a string.
pub(crate) fn encode_input(input: &Value) -> Option<Vec<u8>> {
    if input.is_null() {
        None
    } else {
        Some(input.to_string().into_bytes())
    }
}

pub(crate) fn decode_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
