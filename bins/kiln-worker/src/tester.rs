/// Test Orchestrator - Compile Both Trees, Run the Console Launcher
///
/// **Pipeline:**
/// 1. Compile the main tree into `classes/src` against the libraries
/// 2. Compile the test tree into `classes/test` against libraries, main
///    classes and the test support classpath
/// 3. Launch the test runner over the combined class path
/// 4. Parse its stdout into ordered `TestOutcome`s
///
/// Either compile failing yields a diagnostic and stops the pipeline.
/// The runner exits nonzero whenever a test fails, so its exit code is
/// informational only; a transcript that cannot be parsed fails the job.

use crate::classpath::Classpath;
use crate::compiler::{compile_failure_report, BuildOrchestrator, CompileUnit, Sources};
use crate::error::JobError;
use crate::layout::ProjectLayout;
use crate::report::TestReportParser;
use crate::runner::CommandSpec;
use kiln_common::types::JobResult;
use tracing::{debug, info};

#[derive(Clone)]
pub struct TestOrchestrator {
    build: BuildOrchestrator,
    parser: TestReportParser,
}

impl TestOrchestrator {
    pub fn new(build: BuildOrchestrator, parser: TestReportParser) -> Self {
        Self { build, parser }
    }

    pub async fn test(&self, project: &ProjectLayout) -> Result<JobResult, JobError> {
        let toolchain = self.build.toolchain();
        let libraries = self.build.library_classpath(project).await?;

        let main = self
            .build
            .compile(
                project,
                CompileUnit {
                    source_root: &project.main_sources,
                    output_dir: &project.main_classes,
                    classpath: &libraries,
                    sources: Sources::Tree,
                },
            )
            .await?;
        if !main.success() {
            return Ok(JobResult::Diagnostic(compile_failure_report(&main)));
        }

        let test_classpath = libraries
            .clone()
            .with(&project.main_classes)
            .extend(&toolchain.test_support_classpath);
        let tests = self
            .build
            .compile(
                project,
                CompileUnit {
                    source_root: &project.test_sources,
                    output_dir: &project.test_classes,
                    classpath: &test_classpath,
                    sources: Sources::Tree,
                },
            )
            .await?;
        if !tests.success() {
            return Ok(JobResult::Diagnostic(compile_failure_report(&tests)));
        }

        let run_classpath = Classpath::new()
            .with(&project.main_classes)
            .with(&project.test_classes)
            .extend(libraries.entries());
        let Some((program, prefix)) = toolchain.test_runner.split_first() else {
            return Err(JobError::MissingTestRunner);
        };
        let command = CommandSpec::new(program, &project.root)
            .args(prefix.iter().cloned())
            .arg("--class-path")
            .arg(run_classpath.to_string())
            .args(toolchain.test_runner_args.iter().cloned());

        let outcome = self.build.invoke(command).await?;
        debug!(
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            stderr = %outcome.stderr,
            "Test runner finished"
        );

        let transcript: Vec<&str> = outcome.stdout.lines().collect();
        let outcomes = self.parser.parse(&transcript)?;

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        info!(
            tests = outcomes.len(),
            failed,
            elapsed_ms = outcome.elapsed_ms,
            "Test report parsed"
        );

        Ok(JobResult::Tests(outcomes))
    }
}
