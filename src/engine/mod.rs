//! Execution engine boundary
//!
//! The front end never plans or executes SQL itself. It hands statements to
//! an `ExecutionEngine`, receives a `JobHandle`, and learns about the end of
//! the job through a consume-once `TaskEndCallback` supplied per submission.

pub mod eval;
pub mod local;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::CancellationMode;
use crate::session::SessionContext;

pub use local::{JobOutcome, JobReport, LocalEngine};

/// Engine identifier for the group of tasks backing one query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to stop a job, produced by the query controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationDirective {
    pub job: JobHandle,
    pub mode: CancellationMode,
}

impl CancellationDirective {
    pub fn interrupt_on_cancel(&self) -> bool {
        self.mode.interrupt_on_cancel()
    }
}

/// Scalar value in a result row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// Materialized query result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn single_row(columns: Vec<String>, row: Vec<Value>) -> Self {
        Self { columns, rows: vec![row] }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// How a job ended. Reported exactly once per job.
#[derive(Debug)]
pub enum TaskEnd {
    Success(ResultSet),
    Failed(anyhow::Error),
    Killed,
}

impl TaskEnd {
    pub fn label(&self) -> &'static str {
        match self {
            TaskEnd::Success(_) => "success",
            TaskEnd::Failed(_) => "failed",
            TaskEnd::Killed => "killed",
        }
    }
}

/// Per-query task-end notification. `FnOnce` so it cannot fire twice.
pub type TaskEndCallback = Box<dyn FnOnce(TaskEnd) + Send + 'static>;

/// Failures raised by the engine while evaluating a statement.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("The {position} argument of '{function}' function needs to be an integer, got '{value}'")]
    InvalidIntegerArgument {
        function: String,
        position: &'static str,
        value: String,
        #[source]
        source: NumberFormatError,
    },

    #[error("Invalid date '{value}' passed as the {position} argument of '{function}'")]
    InvalidDateArgument {
        function: String,
        position: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Function '{function}' expects {expected} argument(s), got {actual}")]
    WrongArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("Undefined function: '{0}'")]
    UndefinedFunction(String),

    #[error("Cannot parse statement: {0}")]
    Parse(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Task interrupted")]
    Interrupted,
}

impl EngineError {
    /// True when the statement itself is at fault
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidIntegerArgument { .. }
                | EngineError::InvalidDateArgument { .. }
                | EngineError::WrongArgumentCount { .. }
                | EngineError::UndefinedFunction(_)
                | EngineError::Parse(_)
        )
    }
}

/// Low-level numeric conversion failure
#[derive(Error, Debug)]
#[error("invalid input syntax for type numeric: {input}")]
pub struct NumberFormatError {
    pub input: String,
    #[source]
    pub source: std::num::ParseIntError,
}

/// The external execution engine.
pub trait ExecutionEngine: Send + Sync {
    /// Start executing `sql`. `on_end` is invoked exactly once when the job
    /// terminates, possibly on another thread and possibly before `submit`
    /// returns.
    fn submit(
        &self,
        sql: &str,
        ctx: &SessionContext,
        on_end: TaskEndCallback,
    ) -> anyhow::Result<JobHandle>;

    /// Ask the engine to stop a job. Unknown or finished jobs are ignored.
    fn cancel(&self, directive: &CancellationDirective) -> anyhow::Result<()>;
}
