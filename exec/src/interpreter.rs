use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use slotgrid_core::{Executor, ExecutorError, LoadRequest, LoadedCode};
use tempfile::TempDir;

use crate::process::{ProcessError, decode_output, encode_input, run_process};

/// Runs units through an interpreter: `<program> [args] <script>`, with the
/// input as JSON on stdin and the result read from stdout.
#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    /// Arguments for a syntax-only pass at load time (`-n`, `--check`).
    check_args: Option<Vec<String>>,
    extension: String,
}

impl InterpreterExecutor {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            check_args: None,
            extension: extension.into(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_check(mut self, args: &[&str]) -> Self {
        self.check_args = Some(args.iter().map(ToString::to_string).collect());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

struct Script {
    program: PathBuf,
    args: Vec<String>,
    path: PathBuf,
    // Keeps the script on disk for as long as this version is loaded.
    dir: TempDir,
}

#[async_trait]
impl LoadedCode for Script {
    async fn run(&self, input: Value) -> Result<Value, ExecutorError> {
        let stdin = encode_input(&input);
        let args = self
            .args
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.path.to_str().unwrap_or_default()));
        let output = run_process(&self.program, args, self.dir.path(), stdin.as_deref()).await?;
        if !output.stderr.is_empty() {
            tracing::debug!(program = %self.program.display(), "unit stderr: {}", output.stderr.trim());
        }
        Ok(decode_output(&output.stdout))
    }
}

#[async_trait]
impl Executor for InterpreterExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn LoadedCode>, ExecutorError> {
        let dir = tempfile::Builder::new().prefix("slotgrid-").tempdir()?;
        let path = dir.path().join(format!("unit.{}", self.extension));
        tokio::fs::write(&path, request.code.as_bytes()).await?;

        if let Some(check_args) = &self.check_args {
            let args = check_args
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(path.to_str().unwrap_or_default()));
            match run_process(&self.program, args, dir.path(), None).await {
                Ok(_) => {}
                Err(ProcessError::Exit { stderr, .. }) => return Err(ExecutorError::Load(stderr)),
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            executor = %self.name,
            unit = %request.unit_id,
            version = request.version,
            "script loaded"
        );
        Ok(Arc::new(Script {
            program: self.program.clone(),
            args: self.args.clone(),
            path,
            dir,
        }))
    }
}
