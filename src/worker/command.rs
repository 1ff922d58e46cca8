use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use stagegate_common::Stage;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{StageInput, StageWorker, SubtaskInput, SubtaskOutcome, SubtaskStep, WorkItemSubtasks};
use crate::errors::WorkerError;

/// Exit code a worker uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_TRANSIENT: i32 = 75;

/// Request written to the worker's stdin as one JSON document.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Stage {
        stage: Stage,
        input: &'a StageInput,
    },
    Subtask {
        step: SubtaskStep,
        input: &'a SubtaskInput,
    },
}

/// Runs an external program per call: the request goes to stdin as JSON,
/// the response is read from stdout as JSON.
///
/// Exit status 0 is success, [`EXIT_TRANSIENT`] is a transient failure,
/// anything else is a permanent failure carrying stderr.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandWorker {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            bail!("Worker command must name a program");
        }
        Ok(Self {
            argv,
            working_dir: None,
            timeout: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill the process and report a transient failure after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    async fn exchange(&self, request: &WorkerRequest<'_>) -> Result<Value, WorkerError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| WorkerError::Permanent(format!("failed to encode request: {}", e)))?;

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            WorkerError::Permanent(format!("failed to spawn '{}': {}", self.program(), e))
        })?;

        // Feed stdin while draining stdout so neither side blocks on a full
        // pipe; the timeout covers both.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Ok(()) => Ok(()),
                // The worker may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e),
            }
        };
        let call = async move { tokio::join!(feed, child.wait_with_output()) };
        let (fed, waited) = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                WorkerError::Transient(format!(
                    "'{}' timed out after {}ms",
                    self.program(),
                    limit.as_millis()
                ))
            })?,
            None => call.await,
        };
        fed.map_err(|e| {
            WorkerError::Permanent(format!(
                "failed to write request to '{}': {}",
                self.program(),
                e
            ))
        })?;
        let output = waited.map_err(|e| {
            WorkerError::Permanent(format!("failed to wait for '{}': {}", self.program(), e))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TRANSIENT) => return Err(WorkerError::Transient(stderr)),
            Some(code) => {
                return Err(WorkerError::Permanent(format!(
                    "'{}' exited with code {}: {}",
                    self.program(),
                    code,
                    stderr
                )));
            }
            None => {
                return Err(WorkerError::Permanent(format!(
                    "'{}' was terminated by a signal",
                    self.program()
                )));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(WorkerError::Permanent(format!(
                "'{}' produced no output",
                self.program()
            )));
        }
        serde_json::from_str(stdout).map_err(|e| {
            WorkerError::Permanent(format!("'{}' produced invalid JSON: {}", self.program(), e))
        })
    }

    async fn subtask(
        &self,
        step: SubtaskStep,
        input: &SubtaskInput,
    ) -> Result<SubtaskOutcome, WorkerError> {
        let value = self
            .exchange(&WorkerRequest::Subtask { step, input })
            .await?;
        serde_json::from_value(value).map_err(|e| {
            WorkerError::Permanent(format!(
                "'{}' returned an invalid {} outcome: {}",
                self.program(),
                step,
                e
            ))
        })
    }
}

#[async_trait]
impl StageWorker for CommandWorker {
    async fn run(&self, stage: Stage, input: &StageInput) -> Result<Value, WorkerError> {
        tracing::debug!(program = %self.program(), %stage, "running stage worker");
        self.exchange(&WorkerRequest::Stage { stage, input }).await
    }
}

#[async_trait]
impl WorkItemSubtasks for CommandWorker {
    async fn generate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.subtask(SubtaskStep::Generate, input).await
    }

    async fn check_quality(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.subtask(SubtaskStep::QualityCheck, input).await
    }

    async fn test(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.subtask(SubtaskStep::Test, input).await
    }

    async fn integrate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.subtask(SubtaskStep::Integrate, input).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use stagegate_common::{Session, WorkItem};

    fn sh(script: &str) -> CommandWorker {
        CommandWorker::new(vec!["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    fn stage_input() -> StageInput {
        StageInput::from_session(&Session::new("build a todo app"), Stage::Requirements)
    }

    fn subtask_input() -> SubtaskInput {
        SubtaskInput {
            session_id: stagegate_common::SessionId::new(),
            item: WorkItem::new("api", "coder", vec![]),
            feedback: None,
            artifact: None,
            context: Default::default(),
        }
    }

    #[test]
    fn rejects_empty_command() {
        assert!(CommandWorker::new(vec![]).is_err());
        assert!(CommandWorker::new(vec!["  ".into()]).is_err());
    }

    #[tokio::test]
    async fn stage_worker_reads_json_from_stdout() {
        let worker = sh(r#"cat > /dev/null; echo '{"summary": "X"}'"#);
        let output = worker.run(Stage::Requirements, &stage_input()).await.unwrap();
        assert_eq!(output, json!({"summary": "X"}));
    }

    #[tokio::test]
    async fn stage_worker_receives_request_on_stdin() {
        // Echo the request back so the test can inspect it.
        let worker = sh("cat");
        let output = worker.run(Stage::Requirements, &stage_input()).await.unwrap();
        assert_eq!(output["kind"], "stage");
        assert_eq!(output["stage"], "requirements");
        assert_eq!(output["input"]["input_document"], "build a todo app");
    }

    #[tokio::test]
    async fn exit_75_is_transient() {
        let worker = sh("echo 'rate limited' >&2; exit 75");
        let err = worker.run(Stage::Design, &stage_input()).await.unwrap_err();
        assert_eq!(err, WorkerError::Transient("rate limited".into()));
    }

    #[tokio::test]
    async fn other_exit_codes_are_permanent() {
        let worker = sh("echo 'boom' >&2; exit 3");
        match worker.run(Stage::Design, &stage_input()).await.unwrap_err() {
            WorkerError::Permanent(msg) => {
                assert!(msg.contains("code 3"));
                assert!(msg.contains("boom"));
            }
            other => panic!("Expected Permanent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_json_is_permanent() {
        let worker = sh("echo 'not json'");
        let err = worker.run(Stage::Design, &stage_input()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(ref m) if m.contains("invalid JSON")));
    }

    #[tokio::test]
    async fn missing_program_is_permanent() {
        let worker = CommandWorker::new(vec!["/nonexistent/stagegate-worker".into()]).unwrap();
        let err = worker.run(Stage::Design, &stage_input()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(ref m) if m.contains("failed to spawn")));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let worker = sh("sleep 5").with_timeout(Duration::from_millis(100));
        let err = worker.run(Stage::Design, &stage_input()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn timeout_covers_unread_request() {
        // A request larger than the pipe buffer blocks the write until the
        // worker reads it, which this one never does.
        let session = Session::new("x".repeat(512 * 1024));
        let input = StageInput::from_session(&session, Stage::Requirements);
        let worker = sh("sleep 5").with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = worker.run(Stage::Requirements, &input).await.unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn subtask_outcomes_are_parsed() {
        let worker = sh(r#"cat > /dev/null; echo '{"outcome": "fail", "detail": "3 tests failed"}'"#);
        let outcome = worker.test(&subtask_input()).await.unwrap();
        assert_eq!(outcome, SubtaskOutcome::fail("3 tests failed"));

        let worker = sh(r#"cat > /dev/null; echo '{"outcome": "pass", "output": {"files": 2}}'"#);
        let outcome = worker.generate(&subtask_input()).await.unwrap();
        assert_eq!(outcome, SubtaskOutcome::pass_with(json!({"files": 2})));
    }

    #[tokio::test]
    async fn subtask_request_names_the_step() {
        let worker = sh(r#"grep -q '"step":"quality_check"' && echo '{"outcome": "pass"}' || echo '{"outcome": "fail", "detail": "wrong step"}'"#);
        let outcome = worker.check_quality(&subtask_input()).await.unwrap();
        assert_eq!(outcome, SubtaskOutcome::pass());
    }
}
