/// Build Orchestrator - Compiler Invocation
///
/// **Core Responsibility:**
/// Locate the entry point, assemble the library classpath and drive the
/// compiler over either a single entry-point file or a whole source tree.
///
/// **Outcome Handling:**
/// - Nonzero exit or timeout is returned as a normal `ProcessOutcome`;
///   callers turn it into a diagnostic via `compile_failure_report`
/// - A missing entry point or a compiler that cannot start is a `JobError`
///
/// Run mode compiles one file; jar and test modes compile the full tree.
/// Directory walks run on the blocking pool.

use crate::classpath::Classpath;
use crate::config::ToolchainConfig;
use crate::error::JobError;
use crate::layout::{self, ProjectLayout};
use crate::runner::{CommandRunner, CommandSpec, ProcessOutcome};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to hand the compiler
#[derive(Debug, Clone, Copy)]
pub enum Sources<'a> {
    /// A single file; the source path lets the compiler pull in what it references
    EntryPoint(&'a Path),
    /// Every source file under the source root
    Tree,
}

/// One compiler invocation
#[derive(Debug, Clone)]
pub struct CompileUnit<'a> {
    pub source_root: &'a Path,
    pub output_dir: &'a Path,
    pub classpath: &'a Classpath,
    pub sources: Sources<'a>,
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    runner: Arc<dyn CommandRunner>,
    toolchain: ToolchainConfig,
}

impl BuildOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, toolchain: ToolchainConfig) -> Self {
        Self { runner, toolchain }
    }

    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    /// Run any toolchain command under the configured deadline
    pub async fn invoke(&self, command: CommandSpec) -> Result<ProcessOutcome, JobError> {
        let command = command.timeout(self.toolchain.timeout());
        Ok(self.runner.run(&command).await?)
    }

    /// First file named like the configured entry point, depth-first
    pub async fn locate_entry_point(&self, source_root: &Path) -> Result<PathBuf, JobError> {
        let name = self.toolchain.entry_point.clone();
        let root = source_root.to_path_buf();
        let found = {
            let name = name.clone();
            off_runtime(source_root, move || layout::find_file(&root, &name)).await?
        };
        found.ok_or_else(|| JobError::EntryPointNotFound {
            name,
            root: source_root.to_path_buf(),
        })
    }

    /// Archives in the project's library directory
    pub async fn library_classpath(&self, project: &ProjectLayout) -> Result<Classpath, JobError> {
        let libraries = project.libraries.clone();
        let extension = self.toolchain.archive_extension.clone();
        off_runtime(&project.libraries, move || Classpath::from_libraries(&libraries, &extension)).await
    }

    pub async fn compile(
        &self,
        project: &ProjectLayout,
        unit: CompileUnit<'_>,
    ) -> Result<ProcessOutcome, JobError> {
        let files = match unit.sources {
            Sources::EntryPoint(file) => vec![file.to_path_buf()],
            Sources::Tree => {
                let root = unit.source_root.to_path_buf();
                let extension = self.toolchain.source_extension.clone();
                off_runtime(unit.source_root, move || layout::collect_files(&root, &extension)).await?
            }
        };

        layout::ensure_dir(unit.output_dir)
            .await
            .map_err(JobError::io(unit.output_dir))?;

        if files.is_empty() {
            // Nothing to compile: an empty tree builds trivially
            debug!(source_root = %unit.source_root.display(), "No sources found, skipping compiler");
            return Ok(ProcessOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                elapsed_ms: 0,
                timed_out: false,
            });
        }

        let command = self.compile_command(project, &unit, &files);
        info!(
            source_root = %unit.source_root.display(),
            files = files.len(),
            "Compiling"
        );

        let outcome = self.invoke(command).await?;
        if outcome.success() {
            info!(elapsed_ms = outcome.elapsed_ms, "Compilation succeeded");
        } else {
            warn!(
                exit_code = outcome.exit_code,
                elapsed_ms = outcome.elapsed_ms,
                timed_out = outcome.timed_out,
                "Compilation failed"
            );
        }
        Ok(outcome)
    }

    fn compile_command(&self, project: &ProjectLayout, unit: &CompileUnit<'_>, files: &[PathBuf]) -> CommandSpec {
        let tc = &self.toolchain;
        let mut command = CommandSpec::new(&tc.compiler, &project.root)
            .arg("-d")
            .arg(path_arg(unit.output_dir));

        if !unit.classpath.is_empty() {
            command = command.arg("-cp").arg(unit.classpath.to_string());
        }
        command = command.arg("-sourcepath").arg(path_arg(unit.source_root));

        if let Some(version) = &tc.source_version {
            command = command.arg("-source").arg(version);
        }
        if let Some(version) = &tc.target_version {
            command = command.arg("-target").arg(version);
        }

        command.args(files.iter().map(|file| path_arg(file)))
    }
}

/// Run a filesystem walk rooted at `path` without stalling the async runtime
async fn off_runtime<T, F>(path: &Path, walk: F) -> Result<T, JobError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(walk)
        .await
        .map_err(|err| JobError::io(path)(io::Error::other(err)))?
        .map_err(JobError::io(path))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Diagnostic published when compilation does not succeed
pub fn compile_failure_report(outcome: &ProcessOutcome) -> String {
    let headline = if outcome.timed_out {
        format!("Compilation timed out after {} ms", outcome.elapsed_ms)
    } else {
        format!("Compilation failed with exit code {}", outcome.exit_code)
    };
    format!(
        "{}\nOutput: \n{}\nTotal execution time: {} ms",
        headline,
        outcome.combined_output(),
        outcome.elapsed_ms
    )
}
