//! Executor extension point: how a row turns committed code into results.
//!
//! Adding a runtime takes three registrations: an entry in the
//! [`IdentifierRegistry`](crate::registry::IdentifierRegistry), a row in the
//! matrix configuration, and an [`Executor`] in the [`ExecutorTable`].
//!
//! Execution is split into two phases so hot-swap stays cheap for the row:
//!
//! - **load**: runs once per committed version (compile, parse, validate).
//!   The engine calls it between executions and never while a previous
//!   version is mid-run.
//! - **run**: runs once per pending input against the loaded code.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slotgrid_core::executor::{ExecutorTable, FnExecutor};
//! use slotgrid_core::registry::RuntimeId;
//!
//! let mut table = ExecutorTable::new();
//! table.register(
//!     RuntimeId::UNIVERSAL_IR,
//!     Arc::new(FnExecutor::new("echo", |_code, input| async move { Ok(input) })),
//! );
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::ids::UnitId;
use crate::registry::RuntimeId;

/// Errors returned by executor implementations.
///
/// The engine maps every variant to an `ExecutionFailure` recorded on the
/// slot; none of them stop the row loop.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Code failed to load (syntax error, compile error, missing entry point).
    #[error("load failed: {0}")]
    Load(String),

    /// Code loaded but the run failed (non-zero exit, exception, bad output).
    #[error("{0}")]
    Failed(String),

    /// The toolchain for this runtime is not installed or not usable.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything an executor needs to prepare one committed version.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub unit_id: UnitId,
    pub version: u64,
    pub runtime_id: RuntimeId,
    /// Display name of the unit, usable as an entry point.
    pub entry_point: String,
    pub code: String,
}

/// Code that has been loaded for one version and can be run repeatedly.
#[async_trait]
pub trait LoadedCode: Send + Sync {
    async fn run(&self, input: Value) -> Result<Value, ExecutorError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn LoadedCode>, ExecutorError>;
}

/// Registration table mapping runtime ids to executors.
#[derive(Clone, Default)]
pub struct ExecutorTable {
    executors: HashMap<RuntimeId, Arc<dyn Executor>>,
}

impl ExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a runtime.
    pub fn register(&mut self, runtime_id: RuntimeId, executor: Arc<dyn Executor>) -> &mut Self {
        tracing::debug!(runtime = %runtime_id, executor = executor.name(), "executor registered");
        self.executors.insert(runtime_id, executor);
        self
    }

    pub fn get(&self, runtime_id: RuntimeId) -> Option<Arc<dyn Executor>> {
        self.executors.get(&runtime_id).cloned()
    }

    pub fn runtimes(&self) -> Vec<RuntimeId> {
        let mut ids: Vec<RuntimeId> = self.executors.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.executors.iter().map(|(id, e)| (id, e.name())))
            .finish()
    }
}

type RunFn = dyn Fn(Arc<str>, Value) -> BoxFuture<'static, Result<Value, ExecutorError>>
    + Send
    + Sync;
type CheckFn = dyn Fn(&str) -> Result<(), ExecutorError> + Send + Sync;

/// In-process executor backed by a closure, for embedders whose runtime
/// lives in the host process (and for tests).
pub struct FnExecutor {
    name: String,
    run: Arc<RunFn>,
    check: Option<Arc<CheckFn>>,
}

impl FnExecutor {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Arc<str>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |code, input| run(code, input).boxed()),
            check: None,
        }
    }

    /// Validate code at load time; a failure is recorded as a load error.
    pub fn with_check<C>(mut self, check: C) -> Self
    where
        C: Fn(&str) -> Result<(), ExecutorError> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }
}

struct FnLoaded {
    code: Arc<str>,
    run: Arc<RunFn>,
}

#[async_trait]
impl LoadedCode for FnLoaded {
    async fn run(&self, input: Value) -> Result<Value, ExecutorError> {
        (self.run)(Arc::clone(&self.code), input).await
    }
}

#[async_trait]
impl Executor for FnExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn LoadedCode>, ExecutorError> {
        if let Some(check) = &self.check {
            check(&request.code)?;
        }
        Ok(Arc::new(FnLoaded {
            code: Arc::from(request.code),
            run: Arc::clone(&self.run),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(code: &str) -> LoadRequest {
        LoadRequest {
            unit_id: UnitId::from("u1"),
            version: 1,
            runtime_id: RuntimeId::UNIVERSAL_IR,
            entry_point: "f".to_string(),
            code: code.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fn_executor_runs_with_loaded_code() {
        let executor = FnExecutor::new("concat", |code, input| async move {
            Ok(json!(format!("{code}:{input}")))
        });
        let loaded = executor.load(request("v1")).await.expect("load");
        let output = loaded.run(json!(7)).await.expect("run");
        assert_eq!(output, json!("v1:7"));
    }

    #[tokio::test]
    async fn test_check_rejects_at_load() {
        let executor = FnExecutor::new("strict", |_code, input| async move { Ok(input) })
            .with_check(|code| {
                if code.contains("syntax error") {
                    Err(ExecutorError::Load("bad code".to_string()))
                } else {
                    Ok(())
                }
            });
        assert!(executor.load(request("syntax error")).await.is_err());
        assert!(executor.load(request("fine")).await.is_ok());
    }

    #[test]
    fn test_table_register_and_lookup() {
        let mut table = ExecutorTable::new();
        assert!(table.is_empty());
        table.register(
            RuntimeId::PYTHON,
            Arc::new(FnExecutor::new("py", |_c, i| async move { Ok(i) })),
        );
        assert_eq!(table.runtimes(), vec![RuntimeId::PYTHON]);
        assert_eq!(
            table.get(RuntimeId::PYTHON).map(|e| e.name().to_string()),
            Some("py".to_string())
        );
        assert!(table.get(RuntimeId::RUST).is_none());
    }
}
