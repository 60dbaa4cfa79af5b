use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use slotgrid_core::{Executor, ExecutorError, LoadRequest, LoadedCode};
use tempfile::TempDir;

use crate::process::{ProcessError, decode_output, encode_input, run_process};

/// Compiles each version once at load time and runs the binary per input.
///
/// The compiler is invoked as `<compiler> [args] <source> -o <binary>`,
/// which rustc, gcc, g++ and clang all accept.
#[derive(Debug, Clone)]
pub struct CompilerExecutor {
    name: String,
    compiler: PathBuf,
    args: Vec<String>,
    extension: String,
}

impl CompilerExecutor {
    pub fn new(
        name: impl Into<String>,
        compiler: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            compiler: compiler.into(),
            args: Vec::new(),
            extension: extension.into(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(ToString::to_string).collect();
        self
    }
}

struct Binary {
    path: PathBuf,
    dir: TempDir,
}

#[async_trait]
impl LoadedCode for Binary {
    async fn run(&self, input: Value) -> Result<Value, ExecutorError> {
        let stdin = encode_input(&input);
        let output =
            run_process(&self.path, Vec::<String>::new(), self.dir.path(), stdin.as_deref())
                .await?;
        Ok(decode_output(&output.stdout))
    }
}

#[async_trait]
impl Executor for CompilerExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn LoadedCode>, ExecutorError> {
        let dir = tempfile::Builder::new().prefix("slotgrid-").tempdir()?;
        let source = dir.path().join(format!("unit.{}", self.extension));
        let binary = dir.path().join("unit.bin");
        tokio::fs::write(&source, request.code.as_bytes()).await?;

        let mut args = self.args.clone();
        args.push(source.display().to_string());
        args.push("-o".to_string());
        args.push(binary.display().to_string());
        match run_process(&self.compiler, &args, dir.path(), None).await {
            Ok(_) => {}
            Err(ProcessError::Exit { stderr, .. }) => return Err(ExecutorError::Load(stderr)),
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(
            executor = %self.name,
            unit = %request.unit_id,
            version = request.version,
            "unit compiled"
        );
        Ok(Arc::new(Binary { path: binary, dir }))
    }
}
