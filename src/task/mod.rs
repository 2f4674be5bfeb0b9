//! Task module - parameterized commands, their input/output slots and templates.
//!
//! - `binding`: slot stores and the `Binding` views handed to callers
//! - `template`: command template parsing and the serializable `TaskTemplate`
//! - `task`: the `Task` itself and its run protocol

pub mod binding;
pub mod task;
pub mod template;

pub use binding::{Binding, SlotStore};
pub use task::{RunReport, Task, TaskError, TaskId};
pub use template::{Arg, CommandTemplate, TaskTemplate, TemplateError, PLACEHOLDER_PREFIX};
