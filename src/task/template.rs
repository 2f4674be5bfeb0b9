//! Command templates and the declarative task description.
//!
//! A command template is a whitespace-separated string: the first token is the
//! executable, the rest are arguments. An argument of the form `$name` is a
//! placeholder for the input called `name`. There is no quoting, so an argument
//! containing spaces cannot be expressed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::binding::SlotStore;
use super::task::{Task, TaskError};

/// Marker that turns an argument token into an input placeholder.
pub const PLACEHOLDER_PREFIX: char = '$';

/// One argument token of a command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed to the process unchanged.
    Literal(String),
    /// Replaced by the value of the named input on every run.
    Placeholder(String),
}

impl Arg {
    fn parse(token: &str) -> Self {
        match token.strip_prefix(PLACEHOLDER_PREFIX) {
            Some(name) if !name.is_empty() => Arg::Placeholder(name.to_string()),
            _ => Arg::Literal(token.to_string()),
        }
    }
}

/// Parsed, immutable form of a command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<Arg>,
}

impl CommandTemplate {
    /// Split `template` on whitespace into program and arguments.
    ///
    /// # Errors
    /// Returns `TaskError::EmptyTemplate` if there is no program token.
    pub fn parse(template: &str) -> Result<Self, TaskError> {
        let mut tokens = template.split_whitespace();
        let program = tokens.next().ok_or(TaskError::EmptyTemplate)?.to_string();
        let args = tokens.map(Arg::parse).collect();
        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Input names referenced by placeholders, in argument order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|arg| match arg {
            Arg::Placeholder(name) => Some(name.as_str()),
            Arg::Literal(_) => None,
        })
    }

    /// Argument vector with every placeholder replaced by its current input value.
    /// The template itself is left untouched.
    pub(crate) fn render(&self, inputs: &SlotStore) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Literal(text) => text.clone(),
                Arg::Placeholder(name) => inputs.get(name),
            })
            .collect()
    }
}

/// Serializable description of a task.
///
/// ```yaml
/// command: git describe --tags $rev
/// inputs: [rev]
/// outputs:
///   version: 'v\d+\.\d+\.\d+'
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Whitespace-separated command line
    pub command: String,

    /// Names of inputs that must be bound before running
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output name -> regular expression extracting it from stdout lines
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl TaskTemplate {
    pub fn from_yaml_str(source: &str) -> Result<Self, TemplateError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> Result<Self, TemplateError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Build a fresh [`Task`] from this description.
    pub fn build(&self) -> Result<Task, TaskError> {
        Task::new(&self.command, self.inputs.iter(), self.outputs.iter())
    }
}

/// Errors that can occur while loading a [`TaskTemplate`].
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid YAML task template: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON task template: {0}")]
    Json(#[from] serde_json::Error),
}
