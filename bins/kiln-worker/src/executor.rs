/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Map a parsed `JobRequest` onto the pipeline for its action and return the
/// `JobResult` to publish.
///
/// **Architecture:**
/// - run  → ExecutionRunner (compile entry point, launch it)
/// - jar  → BuildOrchestrator (compile tree) + ArchivePackager
/// - test → TestOrchestrator (compile both trees, run, parse report)
///
/// This module is the glue layer - it knows nothing about:
/// - How subprocesses are driven (runner's job)
/// - How the report is parsed (parser's job)
/// - Acknowledgment and publishing (dispatcher's job)

use crate::compiler::{compile_failure_report, BuildOrchestrator, CompileUnit, Sources};
use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::execution::ExecutionRunner;
use crate::layout::{self, ProjectLayout};
use crate::packager::ArchivePackager;
use crate::report::TestReportParser;
use crate::runner::CommandRunner;
use crate::tester::TestOrchestrator;
use kiln_common::types::{Action, JobRequest, JobResult};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct JobExecutor {
    build: BuildOrchestrator,
    execution: ExecutionRunner,
    tests: TestOrchestrator,
    packager: ArchivePackager,
}

impl JobExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &WorkerConfig) -> Self {
        let toolchain = config.toolchain.clone();
        let build = BuildOrchestrator::new(runner, toolchain.clone());
        Self {
            execution: ExecutionRunner::new(build.clone()),
            tests: TestOrchestrator::new(build.clone(), TestReportParser::new(config.report.clone())),
            packager: ArchivePackager::new(toolchain.class_extension, toolchain.archive_extension),
            build,
        }
    }

    pub async fn execute(&self, job: &JobRequest) -> Result<JobResult, JobError> {
        let project = ProjectLayout::new(&job.project_path, &self.build.toolchain().archive_extension);
        info!(project = %project.root.display(), action = %job.action, "Executing job");

        match job.action {
            Action::Run => Ok(JobResult::Diagnostic(self.execution.run(&project).await?)),
            Action::Jar => self.package(&project).await,
            Action::Test => self.tests.test(&project).await,
        }
    }

    async fn package(&self, project: &ProjectLayout) -> Result<JobResult, JobError> {
        let entry = self.build.locate_entry_point(&project.main_sources).await?;
        let main_class = layout::qualified_name(&project.main_sources, &entry)
            .ok_or_else(|| JobError::InvalidEntryPoint(entry.clone()))?;
        let libraries = self.build.library_classpath(project).await?;

        let compile = self
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
        if !compile.success() {
            return Ok(JobResult::Diagnostic(compile_failure_report(&compile)));
        }

        let archive = self.packager.package(project, &main_class).await?;
        Ok(JobResult::Archive(archive))
    }
}
