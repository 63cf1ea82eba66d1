use std::io::Write;
use std::process;

use serde::{Deserialize, Serialize};

use crate::handler::{Handler, HandlerRegistry, JobContext, NamedHandler, PerformError};

/// Exit status a command uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_RETRY: i32 = 75;

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<Echo>().register::<Command>();
}

/// Writes its message to the job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Handler for Echo {
    fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError> {
        writeln!(ctx, "{}", self.message)?;
        Ok(())
    }
}

impl NamedHandler for Echo {
    const KIND: &'static str = "echo";
}

/// Runs an external program.
///
/// Exit 0 completes the job and exit [`EXIT_RETRY`] asks for a retry.
/// Anything else is a failure carrying the program's stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Handler for Command {
    fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError> {
        let output = process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| PerformError::failed(format!("failed to run {}: {}", self.program, e)))?;

        ctx.write_all(&output.stdout)?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("{} exited with {}: {}", self.program, output.status, stderr.trim());

        match output.status.code() {
            Some(EXIT_RETRY) => Err(PerformError::retry(message)),
            _ => Err(PerformError::Failed(message)),
        }
    }
}

impl NamedHandler for Command {
    const KIND: &'static str = "command";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn echo_writes_its_message() {
        let mut ctx = JobContext::new("job", 1);
        Echo {
            message: "Hello delayed_job!".into(),
        }
        .perform(&mut ctx)
        .unwrap();

        assert_eq!(ctx.output(), b"Hello delayed_job!\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_success_captures_stdout() {
        let mut ctx = JobContext::new("job", 1);
        sh("echo hi").perform(&mut ctx).unwrap();
        assert_eq!(ctx.output(), b"hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_tempfail_asks_for_retry() {
        let mut ctx = JobContext::new("job", 1);
        let err = sh("exit 75").perform(&mut ctx).unwrap_err();
        assert!(matches!(err, PerformError::Retry { delay: None, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn command_failure_carries_stderr() {
        let mut ctx = JobContext::new("job", 1);
        let err = sh("echo 'Uh oh' >&2; exit 3").perform(&mut ctx).unwrap_err();
        match err {
            PerformError::Failed(message) => assert!(message.contains("Uh oh")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_program_fails() {
        let mut ctx = JobContext::new("job", 1);
        let err = Command {
            program: "/definitely/not/a/program".into(),
            args: vec![],
        }
        .perform(&mut ctx)
        .unwrap_err();
        assert!(matches!(err, PerformError::Failed(_)));
    }
}
