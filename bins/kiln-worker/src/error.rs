use crate::packager::PackageError;
use crate::report::ReportError;
use crate::runner::RunnerError;
use std::path::PathBuf;
use thiserror::Error;

/// Orchestration failures. A compile or run that merely fails is not an
/// error; it is reported through the job result.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("entry point `{name}` not found under {}", root.display())]
    EntryPointNotFound { name: String, root: PathBuf },

    #[error("cannot derive a class name for {}", .0.display())]
    InvalidEntryPoint(PathBuf),

    #[error("no test runner command configured")]
    MissingTestRunner,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| JobError::Io { path, source }
    }
}
