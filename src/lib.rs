//! # cmdtask
//!
//! Wraps one external command as a reusable, parameterized task.
//!
//! This library provides:
//! - Command templates with `$name` input placeholders
//! - Named outputs extracted from stdout lines by regular expressions
//! - A `Runner` seam with a real process implementation and a scripted one
//!
//! ## Run Flow
//!
//! ```text
//!   Task::run ──validate inputs──► render args ──► Runner::run(program, args)
//!                                                        │
//!                                              reader task (stdout lines)
//!                                                        │  bounded channel (1)
//!                                                        ▼
//!                                 capture loop: every filter × every line
//!                                                        │
//!                                                 stream closed ─► RunReport
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use cmdtask::{ProcessRunner, Task};
//!
//! # async fn demo() -> Result<(), cmdtask::TaskError> {
//! let task = Task::new("git describe --tags $rev", ["rev"], [("version", r"v\d+\.\d+\.\d+")])?;
//! task.bind("rev", "HEAD")?;
//! task.run(&mut ProcessRunner::new()).await?;
//! println!("{}", task.output_of("version")?.value());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//! - `task`: Task, bindings and templates
//! - `runner`: process spawning and stdout line streaming
//! - `config`: process runner configuration

pub mod config;
pub mod runner;
pub mod task;

pub use config::{ConfigError, ProcessConfig};
pub use runner::{KillHandle, ProcessRunner, Runner, RunnerError, ScriptedRunner};
pub use task::{Binding, RunReport, Task, TaskError, TaskId, TaskTemplate, TemplateError};
