// Run action: compile the entry point, launch it, report both phases
use crate::compiler::{compile_failure_report, BuildOrchestrator, CompileUnit, Sources};
use crate::error::JobError;
use crate::layout::{self, ProjectLayout};
use crate::runner::{CommandSpec, ProcessOutcome};
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct ExecutionRunner {
    build: BuildOrchestrator,
}

impl ExecutionRunner {
    pub fn new(build: BuildOrchestrator) -> Self {
        Self { build }
    }

    /// Compile and run the project's entry point, returning the report text
    ///
    /// A failed compile short-circuits with the compile diagnostic; the
    /// runtime is never launched in that case.
    pub async fn run(&self, project: &ProjectLayout) -> Result<String, JobError> {
        let entry = self.build.locate_entry_point(&project.main_sources).await?;
        let libraries = self.build.library_classpath(project).await?;

        // Total time is measured from here, compile included
        let started = Instant::now();
        let compile = self
            .build
            .compile(
                project,
                CompileUnit {
                    source_root: &project.main_sources,
                    output_dir: &project.main_classes,
                    classpath: &libraries,
                    sources: Sources::EntryPoint(&entry),
                },
            )
            .await?;
        if !compile.success() {
            return Ok(compile_failure_report(&compile));
        }

        let class_name = layout::qualified_name(&project.main_sources, &entry)
            .ok_or_else(|| JobError::InvalidEntryPoint(entry.clone()))?;
        let classpath = libraries.with(&project.main_classes);

        let command = CommandSpec::new(&self.build.toolchain().runtime, &project.root)
            .arg("-cp")
            .arg(classpath.to_string())
            .arg(&class_name);
        let run = self.build.invoke(command).await?;

        let total_ms = (started.elapsed().as_millis() as u64).max(compile.elapsed_ms + run.elapsed_ms);
        info!(
            class_name = %class_name,
            exit_code = run.exit_code,
            elapsed_ms = total_ms,
            "Run finished"
        );

        Ok(run_report(&compile, &run, total_ms))
    }
}

fn run_report(compile: &ProcessOutcome, run: &ProcessOutcome, total_ms: u64) -> String {
    let status = if run.timed_out {
        format!("Run timed out after {} ms", run.elapsed_ms)
    } else if run.exit_code == 0 {
        "Run succeed with exit code 0".to_string()
    } else {
        format!("Run failed with exit code {}", run.exit_code)
    };

    format!(
        "Compilation successful ({} ms)\n{}\nOutput: \n{}\nTotal execution time: {} milliseconds",
        compile.elapsed_ms,
        status,
        run.combined_output(),
        total_ms
    )
}
