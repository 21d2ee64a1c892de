use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// What the worker should do with a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Compile the entry point and run it
    Run,
    /// Compile the whole tree and package a deployable archive
    Jar,
    /// Compile main and test trees and run the test runner
    Test,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Run => write!(f, "run"),
            Action::Jar => write!(f, "jar"),
            Action::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "run" => Ok(Action::Run),
            "jar" => Ok(Action::Jar),
            "test" => Ok(Action::Test),
            other => Err(format!("unknown action '{}' (expected run, jar or test)", other)),
        }
    }
}

/// Body of an inbound job message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub project_path: String,
    pub action: Action,
}

impl JobRequest {
    pub fn new(project_path: impl Into<String>, action: Action) -> Self {
        Self {
            project_path: project_path.into(),
            action,
        }
    }

    /// Parse a message body. Missing fields and unknown actions are errors.
    pub fn from_body(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Success,
    Failed,
}

/// One reported test method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    /// `<Class>.<method>()`
    pub test_name: String,
    pub status: TestStatus,
    /// Verbatim failure block, only ever set for failed tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TestOutcome {
    pub fn success(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            status: TestStatus::Success,
            detail: None,
        }
    }

    pub fn failed(test_name: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            test_name: test_name.into(),
            status: TestStatus::Failed,
            detail,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TestStatus::Failed
    }
}

/// Result of a single job, published once to the reply channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Free-form compile/run report
    Diagnostic(String),
    /// Ordered outcomes from the test runner
    Tests(Vec<TestOutcome>),
    /// Location of the packaged archive
    Archive(PathBuf),
}

impl JobResult {
    /// Render the UTF-8 text body published on the results exchange
    pub fn payload(&self) -> serde_json::Result<String> {
        match self {
            JobResult::Diagnostic(text) => Ok(text.clone()),
            JobResult::Tests(outcomes) => serde_json::to_string(outcomes),
            JobResult::Archive(path) => Ok(path.display().to_string()),
        }
    }
}

/// Wire wrapper for a message on the jobs exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub routing_key: String,
    /// Raw message body, parsed into a [`JobRequest`] by the worker
    pub body: String,
    #[serde(default)]
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            deliveries: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Wire wrapper for a message on the results exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub request_id: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_request_parses_all_actions() {
        for (raw, expected) in [("run", Action::Run), ("jar", Action::Jar), ("test", Action::Test)] {
            let body = format!(r#"{{"projectPath":"/p","action":"{}"}}"#, raw);
            let job = JobRequest::from_body(body.as_bytes()).unwrap();
            assert_eq!(job.project_path, "/p");
            assert_eq!(job.action, expected);
        }
    }

    #[test]
    fn test_job_request_rejects_missing_or_unknown_action() {
        assert!(JobRequest::from_body(br#"{"projectPath":"/p"}"#).is_err());
        assert!(JobRequest::from_body(br#"{"projectPath":"/p","action":"deploy"}"#).is_err());
        assert!(JobRequest::from_body(br#"{"action":"run"}"#).is_err());
        assert!(JobRequest::from_body(b"/p").is_err());
    }

    #[test]
    fn test_action_from_str_is_case_insensitive() {
        assert_eq!("RUN".parse::<Action>().unwrap(), Action::Run);
        assert!("build".parse::<Action>().is_err());
    }

    #[test]
    fn test_tests_payload_is_json_in_order() {
        let result = JobResult::Tests(vec![
            TestOutcome::success("SiuTest.testGetAge()"),
            TestOutcome::failed("PersonTest.testToString()", Some("boom".to_string())),
        ]);
        let payload = result.payload().unwrap();
        assert_eq!(
            payload,
            r#"[{"testName":"SiuTest.testGetAge()","status":"SUCCESS"},{"testName":"PersonTest.testToString()","status":"FAILED","detail":"boom"}]"#
        );
    }

    #[test]
    fn test_archive_payload_is_path() {
        let result = JobResult::Archive(PathBuf::from("/p/output.jar"));
        assert_eq!(result.payload().unwrap(), "/p/output.jar");
    }
}
