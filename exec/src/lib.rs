//! Process-backed executors for slotgrid rows.
//!
//! Interpreted runtimes run a script per input; compiled runtimes compile
//! once per committed version and run the binary per input. Units read
//! their input as JSON on stdin and print their result on stdout.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod compiler;
mod interpreter;
mod process;

use std::sync::Arc;

pub use compiler::CompilerExecutor;
pub use interpreter::InterpreterExecutor;
pub use process::{ProcessError, ProcessOutput, run_process};

use slotgrid_core::{Executor, ExecutorTable, IdentifierRegistry, RuntimeId};

enum Toolchain {
    Interpreter {
        extension: &'static str,
        check: &'static [&'static str],
    },
    Compiler {
        extension: &'static str,
        args: &'static [&'static str],
    },
}

/// (registry name, programs to look for in order, how to drive them)
const TOOLCHAINS: &[(&str, &[&str], Toolchain)] = &[
    (
        "python",
        &["python3", "python"],
        Toolchain::Interpreter {
            extension: "py",
            check: &["-m", "py_compile"],
        },
    ),
    (
        "javascript",
        &["node"],
        Toolchain::Interpreter {
            extension: "js",
            check: &["--check"],
        },
    ),
    (
        "bash",
        &["bash"],
        Toolchain::Interpreter {
            extension: "sh",
            check: &["-n"],
        },
    ),
    (
        "ruby",
        &["ruby"],
        Toolchain::Interpreter {
            extension: "rb",
            check: &["-c"],
        },
    ),
    (
        "perl",
        &["perl"],
        Toolchain::Interpreter {
            extension: "pl",
            check: &["-c"],
        },
    ),
    (
        "lua",
        &["lua"],
        Toolchain::Interpreter {
            extension: "lua",
            check: &[],
        },
    ),
    (
        "rust",
        &["rustc"],
        Toolchain::Compiler {
            extension: "rs",
            args: &["--edition", "2021", "-O"],
        },
    ),
    (
        "c",
        &["gcc", "cc", "clang"],
        Toolchain::Compiler {
            extension: "c",
            args: &["-O2"],
        },
    ),
    (
        "cpp",
        &["g++", "clang++"],
        Toolchain::Compiler {
            extension: "cpp",
            args: &["-O2"],
        },
    ),
];

/// Executor table for every known toolchain found on `PATH`.
pub fn default_table(registry: &IdentifierRegistry) -> ExecutorTable {
    let mut table = ExecutorTable::new();
    for (runtime, programs, toolchain) in TOOLCHAINS {
        let runtime_id = registry.resolve(runtime);
        if runtime_id == RuntimeId::UNKNOWN {
            tracing::debug!(runtime, "runtime not in registry; skipped");
            continue;
        }
        let Some(path) = programs.iter().find_map(|p| which::which(p).ok()) else {
            tracing::debug!(runtime, "no toolchain on PATH");
            continue;
        };
        let name = format!("{runtime}:{}", path.display());
        let executor: Arc<dyn Executor> = match toolchain {
            Toolchain::Interpreter { extension, check } => {
                let executor = InterpreterExecutor::new(name, path, *extension);
                if check.is_empty() {
                    Arc::new(executor)
                } else {
                    Arc::new(executor.with_check(check))
                }
            }
            Toolchain::Compiler { extension, args } => {
                Arc::new(CompilerExecutor::new(name, path, *extension).with_args(args))
            }
        };
        tracing::info!(runtime, executor = executor.name(), "executor available");
        table.register(runtime_id, executor);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchains_name_registered_runtimes() {
        let registry = IdentifierRegistry::builtin();
        for (runtime, _, _) in TOOLCHAINS {
            assert_ne!(registry.resolve(runtime), RuntimeId::UNKNOWN, "{runtime}");
        }
    }

    #[test]
    fn test_default_table_only_lists_known_runtimes() {
        let registry = IdentifierRegistry::builtin();
        let table = default_table(&registry);
        for runtime in table.runtimes() {
            assert!(registry.contains(runtime));
        }
    }
}
