//! Runner that plays back synthetic output instead of spawning a process.

use async_trait::async_trait;
use tracing::debug;

use super::{line_channel, LineReceiver, LineSender, Runner, RunnerError};

/// A command the runner was asked to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

enum Script {
    /// Replay these lines on every run.
    Lines(Vec<String>),
    /// Lines come from a sender held by the test; usable for one run.
    Manual(Option<LineReceiver>),
    /// Fail every run with a spawn error of this kind.
    Fail(std::io::ErrorKind),
}

/// Test double for [`Runner`].
///
/// Records every invocation and serves stdout through the same bounded
/// channel a real process would, without touching the OS.
pub struct ScriptedRunner {
    script: Script,
    invocations: Vec<Invocation>,
    stdout: Option<LineReceiver>,
}

impl ScriptedRunner {
    /// Every run yields `lines` and then closes the stream. Needs a tokio
    /// runtime, since the lines are fed from a spawned task.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_script(Script::Lines(lines.into_iter().map(Into::into).collect()))
    }

    /// The caller drives stdout through the returned sender and closes it by
    /// dropping the sender.
    pub fn manual() -> (Self, LineSender) {
        let (tx, rx) = line_channel();
        (Self::from_script(Script::Manual(Some(rx))), tx)
    }

    /// Every run fails as if the executable could not be spawned.
    pub fn failing(kind: std::io::ErrorKind) -> Self {
        Self::from_script(Script::Fail(kind))
    }

    fn from_script(script: Script) -> Self {
        Self {
            script,
            invocations: Vec::new(),
            stdout: None,
        }
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn last_invocation(&self) -> Option<&Invocation> {
        self.invocations.last()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&mut self, program: &str, args: &[String]) -> Result<(), RunnerError> {
        let stdout = match &mut self.script {
            Script::Fail(kind) => {
                return Err(RunnerError::Spawn {
                    program: program.to_string(),
                    source: std::io::Error::from(*kind),
                });
            }
            Script::Manual(rx) => rx.take().ok_or(RunnerError::AlreadyStarted)?,
            Script::Lines(lines) => {
                let (tx, rx) = line_channel();
                let lines = lines.clone();
                tokio::spawn(async move {
                    for line in lines {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                });
                rx
            }
        };

        debug!("Scripted run: program={}, args={:?}", program, args);
        self.invocations.push(Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        });
        self.stdout = Some(stdout);
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<LineReceiver> {
        self.stdout.take()
    }
}
