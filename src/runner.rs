// External command execution with real and scripted implementations.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::PicoError;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Render a command line for logging and dry runs.
pub fn format_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('%') {
            line.push('\'');
            line.push_str(arg);
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Trait for running external programs (batch system, DAS, hadd, processors).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PicoError>;

    /// Run a program with inherited stdout/stderr and return its exit code.
    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<i32, PicoError>;
}

// --- Real implementation using tokio::process ---

pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// A timeout of zero seconds disables the timeout.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PicoError> {
        tracing::debug!("Executing: {}", format_command(program, args));
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let future = command.output();
        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, future).await.map_err(|_| {
                PicoError::Timeout(format!(
                    "'{}' did not finish within {}s",
                    program,
                    timeout.as_secs()
                ))
            })?,
            None => future.await,
        }
        .map_err(|e| PicoError::NotFound(format!("Could not execute '{}': {}", program, e)))?;

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        tracing::trace!("'{}' exited with {}", program, result.code);
        Ok(result)
    }

    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<i32, PicoError> {
        tracing::debug!("Executing: {}", format_command(program, args));
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PicoError::NotFound(format!("Could not execute '{}': {}", program, e)))?;
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

// --- Scripted implementation for testing ---

#[derive(Clone)]
struct ScriptedResponse {
    program: String,
    contains: Option<String>,
    output: Result<CommandOutput, String>,
}

/// Runner that answers with canned output and records every call.
///
/// Responses are matched by program name and, optionally, by a substring of
/// the joined arguments. The first matching response wins. Unmatched calls
/// succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<Vec<ScriptedResponse>>>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, program: &str, output: CommandOutput) -> Self {
        self.push(program, None, Ok(output))
    }

    pub fn respond_when(self, program: &str, contains: &str, output: CommandOutput) -> Self {
        self.push(program, Some(contains.to_string()), Ok(output))
    }

    /// Make a program fail to spawn with the given error.
    pub fn fail(self, program: &str, error: &str) -> Self {
        self.push(program, None, Err(error.to_string()))
    }

    fn push(
        self,
        program: &str,
        contains: Option<String>,
        output: Result<CommandOutput, String>,
    ) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(ScriptedResponse {
                program: program.to_string(),
                contains,
                output,
            });
        }
        self
    }

    /// Every call so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.first().map(String::as_str) == Some(program))
            .collect()
    }

    fn answer(&self, program: &str, args: &[String]) -> Result<CommandOutput, PicoError> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        let joined = args.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let responses = self
            .responses
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        let found = responses.into_iter().find(|r| {
            r.program == program
                && r.contains
                    .as_deref()
                    .map(|needle| joined.contains(needle))
                    .unwrap_or(true)
        });
        match found {
            Some(ScriptedResponse {
                output: Ok(output), ..
            }) => Ok(output),
            Some(ScriptedResponse {
                output: Err(error), ..
            }) => Err(PicoError::NotFound(format!(
                "Could not execute '{}': {}",
                program, error
            ))),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PicoError> {
        self.answer(program, args)
    }

    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<i32, PicoError> {
        self.answer(program, args).map(|out| out.code)
    }
}

/// Convert a list of string literals into owned arguments.
pub fn args<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    items.iter().map(|s| s.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_command_quotes() {
        let line = format_command(
            "squeue",
            &args(&["-u", "ineuteli", "-o", "%10u %14F", "--array"]),
        );
        assert_eq!(line, "squeue -u ineuteli -o '%10u %14F' --array");
    }

    #[tokio::test]
    async fn test_scripted_runner_matches_program_and_args() {
        let runner = ScriptedRunner::new()
            .respond_when("dasgoclient", "summary", CommandOutput::ok("[{\"nevents\": 5}]"))
            .respond("dasgoclient", CommandOutput::ok("/store/a.root\n"));

        let out = runner
            .run("dasgoclient", &args(&["--query=summary dataset=/A/B/C"]))
            .await
            .expect("run");
        assert!(out.stdout.contains("nevents"));

        let out = runner
            .run("dasgoclient", &args(&["--query=file dataset=/A/B/C"]))
            .await
            .expect("run");
        assert_eq!(out.stdout, "/store/a.root\n");
        assert_eq!(runner.calls_to("dasgoclient").len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_runner_unmatched_is_empty_success() {
        let runner = ScriptedRunner::new();
        let out = runner.run("hadd", &args(&["-f", "out.root"])).await.expect("run");
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert_eq!(runner.calls(), vec![args(&["hadd", "-f", "out.root"])]);
    }

    #[tokio::test]
    async fn test_scripted_runner_spawn_error() {
        let runner = ScriptedRunner::new().fail("sbatch", "No such file or directory");
        let err = runner.run("sbatch", &[]).await.expect_err("should fail");
        assert!(err.to_string().contains("No such file or directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new(10);
        let out = runner
            .run("sh", &args(&["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .expect("run");
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let runner = ProcessRunner::new(1);
        let err = runner
            .run("sh", &args(&["-c", "sleep 5"]))
            .await
            .expect_err("should time out");
        assert!(matches!(err, PicoError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let runner = ProcessRunner::new(0);
        let err = runner
            .run("definitely-not-a-real-program-xyz", &[])
            .await
            .expect_err("should fail");
        assert!(matches!(err, PicoError::NotFound(_)));
    }
}
