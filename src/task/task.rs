//! Task: a parameterized external command with regex-captured outputs.
//!
//! # Invariants
//! - Every filter has an output slot of the same name (both are built together)
//! - Every placeholder in the command names a declared input
//! - The command template never changes after construction; arguments are
//!   rendered fresh on every run
//! - `run` touches neither the runner nor the outputs unless every input is bound

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::binding::{Binding, SlotStore};
use super::template::CommandTemplate;
use crate::runner::{Runner, RunnerError};

/// Unique identifier for a task, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pattern extracting one output from stdout lines.
#[derive(Debug, Clone)]
struct Filter {
    output: String,
    pattern: Regex,
}

/// What a completed run saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Stdout lines consumed
    pub lines: usize,
    /// Output updates made (a line can update several outputs)
    pub captures: usize,
}

/// A reusable external command with named inputs and outputs.
///
/// Inputs are substituted into `$name` arguments; outputs are filled from
/// stdout, each by the leftmost match of its pattern on the latest line that
/// matched.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    command: CommandTemplate,
    inputs: SlotStore,
    outputs: SlotStore,
    filters: Vec<Filter>,
}

impl Task {
    /// Build a task from a command template, its input names and a map of
    /// output name to regular expression.
    ///
    /// # Errors
    /// - `EmptyTemplate` if `template` has no executable
    /// - `InvalidPattern` if any output pattern fails to compile
    /// - `UnknownPlaceholder` if a `$name` argument names no input
    ///
    /// No task is returned on error. Every `$name` argument must be a declared
    /// input, so an undeclared one is rejected here rather than silently
    /// rendered as an empty argument. A literal `$VAR` argument therefore
    /// cannot be written directly; bind it through an input instead.
    pub fn new<I, N, O, K, P>(template: &str, inputs: I, outputs: O) -> Result<Self, TaskError>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
        O: IntoIterator<Item = (K, P)>,
        K: AsRef<str>,
        P: AsRef<str>,
    {
        let command = CommandTemplate::parse(template)?;

        // BTreeMap keeps filter order deterministic; later duplicates win
        let patterns: BTreeMap<String, String> = outputs
            .into_iter()
            .map(|(name, pattern)| (name.as_ref().to_string(), pattern.as_ref().to_string()))
            .collect();
        let filters = patterns
            .iter()
            .map(|(output, pattern)| {
                Regex::new(pattern)
                    .map(|pattern| Filter {
                        output: output.clone(),
                        pattern,
                    })
                    .map_err(|source| TaskError::InvalidPattern {
                        output: output.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let inputs = SlotStore::with_keys(inputs.into_iter().map(|n| n.as_ref().to_string()));
        if let Some(name) = command.placeholders().find(|name| !inputs.contains(name)) {
            return Err(TaskError::UnknownPlaceholder(name.to_string()));
        }

        Ok(Self {
            id: TaskId::new(),
            command,
            inputs,
            outputs: SlotStore::with_keys(patterns.into_keys()),
            filters,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn command(&self) -> &CommandTemplate {
        &self.command
    }

    /// One binding per declared input, sorted by name.
    pub fn inputs(&self) -> Vec<Binding> {
        self.inputs.bindings()
    }

    /// One binding per declared output, sorted by name.
    pub fn outputs(&self) -> Vec<Binding> {
        self.outputs.bindings()
    }

    pub fn input_of(&self, name: &str) -> Result<Binding, TaskError> {
        self.inputs
            .binding(name)
            .ok_or_else(|| TaskError::UnknownInput(name.to_string()))
    }

    pub fn output_of(&self, name: &str) -> Result<Binding, TaskError> {
        self.outputs
            .binding(name)
            .ok_or_else(|| TaskError::UnknownOutput(name.to_string()))
    }

    /// Set an input value.
    pub fn bind(&self, name: &str, value: impl Into<String>) -> Result<(), TaskError> {
        self.input_of(name)?.set(value);
        Ok(())
    }

    /// Current value of every output.
    pub fn output_values(&self) -> HashMap<String, String> {
        self.outputs.snapshot()
    }

    /// Check every input is bound and render the argument vector.
    ///
    /// # Errors
    /// Returns `UnboundParameter` naming the first (alphabetically) empty input.
    pub fn resolve_args(&self) -> Result<Vec<String>, TaskError> {
        for input in self.inputs.bindings() {
            if input.is_empty() {
                return Err(TaskError::UnboundParameter(input.key().to_string()));
            }
        }
        Ok(self.command.render(&self.inputs))
    }

    /// Apply every filter to `line`, storing the leftmost non-empty match of
    /// each pattern that matches. Returns the number of outputs updated.
    pub fn capture_line(&self, line: &str) -> usize {
        let mut captured = 0;
        for filter in &self.filters {
            if let Some(found) = filter.pattern.find(line) {
                if found.as_str().is_empty() {
                    continue;
                }
                debug!(
                    "Task {} captured {}={:?}",
                    self.id,
                    filter.output,
                    found.as_str()
                );
                self.outputs.set(&filter.output, found.as_str());
                captured += 1;
            }
        }
        captured
    }

    /// Run the command through `runner` and capture outputs from its stdout.
    ///
    /// Returns once the runner's line stream closes, after every delivered
    /// line has been processed. The exit status is not inspected.
    ///
    /// # Errors
    /// - `UnboundParameter` before the runner is called
    /// - `Runner` if the runner fails to start the command or has no stdout
    pub async fn run<R>(&self, runner: &mut R) -> Result<RunReport, TaskError>
    where
        R: Runner + ?Sized,
    {
        let args = self.resolve_args()?;

        info!(
            "Running task {}: program={}, args={:?}",
            self.id,
            self.command.program(),
            args
        );
        runner.run(self.command.program(), &args).await?;
        let mut stdout = runner
            .take_stdout()
            .ok_or(RunnerError::StdoutUnavailable)?;

        let mut report = RunReport::default();
        while let Some(line) = stdout.recv().await {
            report.lines += 1;
            report.captures += self.capture_line(&line);
        }

        info!(
            "Task {} finished: lines={}, captures={}",
            self.id, report.lines, report.captures
        );
        Ok(report)
    }
}

/// Errors that can occur while building or running a task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Command template is empty")]
    EmptyTemplate,

    #[error("Invalid pattern for output {output}: {source}")]
    InvalidPattern {
        output: String,
        #[source]
        source: regex::Error,
    },

    #[error("Placeholder ${0} does not name a declared input")]
    UnknownPlaceholder(String),

    #[error("Unbound parameter {0}")]
    UnboundParameter(String),

    #[error("Unknown input: {0}")]
    UnknownInput(String),

    #[error("Unknown output: {0}")]
    UnknownOutput(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}
