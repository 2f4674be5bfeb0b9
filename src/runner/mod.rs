pub mod process;
pub mod scripted;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use process::{KillHandle, ProcessRunner, MAX_LINE_BYTES};
pub use scripted::{Invocation, ScriptedRunner};

/// Stdout of a started command, one line per message, closed when the
/// stream ends.
pub type LineReceiver = mpsc::Receiver<String>;

/// Producer side of a [`LineReceiver`].
pub type LineSender = mpsc::Sender<String>;

/// Lines the producer may hold ahead of the consumer. With a capacity of one
/// the reader blocks until the previous line has been taken.
pub const LINE_CHANNEL_CAPACITY: usize = 1;

/// Create a line channel with the standard back-pressure.
pub fn line_channel() -> (LineSender, LineReceiver) {
    mpsc::channel(LINE_CHANNEL_CAPACITY)
}

/// Starts an external command and exposes its stdout as a stream of lines.
#[async_trait]
pub trait Runner: Send {
    /// Start `program` with `args`. Must return once the process is running,
    /// without waiting for it to exit.
    async fn run(&mut self, program: &str, args: &[String]) -> Result<(), RunnerError>;

    /// Hand over the line stream of the last started command. The stream has a
    /// single consumer, so this yields `Some` at most once per run.
    fn take_stdout(&mut self) -> Option<LineReceiver>;
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command stdout is not available")]
    StdoutUnavailable,

    #[error("Runner has already started a command")]
    AlreadyStarted,

    #[error("Output reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
