//! Error classification and transport-dependent rendering
//!
//! Every failure reaching the front end is an `anyhow::Error` whose causal
//! chain ends in a typed error (`EngineError`, `FrontendError`,
//! `QueryTimedOut`, ...). `classify` walks the chain to find the first
//! typed node; `render` turns the failure into a client-facing message:
//!
//! - `Transport::StructuredRpc` gets one sanitized line: no nested causes.
//! - `Transport::SqlDriver` gets the full chain, one `Caused by:` line per
//!   nested cause.
//!
//! Timeouts render identically on both transports so tooling can match on
//! the "Query timed out" phrase. The configured limit travels separately in
//! `timeout_ms`.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::controller::{QueryCancelled, QueryTimedOut};
use crate::engine::EngineError;
use crate::error::FrontendError;

pub const TIMEOUT_PHRASE: &str = "Query timed out";

/// How the client is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Transport {
    /// Thin tooling client; receives sanitized summaries
    StructuredRpc,
    /// Interactive SQL driver; receives the full causal chain
    SqlDriver,
}

impl FromStr for Transport {
    type Err = Infallible;

    /// Anything unknown is treated as RPC, the less verbose of the two.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "driver" | "jdbc" | "sql" => Transport::SqlDriver,
            _ => Transport::StructuredRpc,
        })
    }
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::StructuredRpc => "rpc",
            Transport::SqlDriver => "driver",
        }
    }

    pub fn is_diagnosable(&self) -> bool {
        matches!(self, Transport::SqlDriver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    UserInputError,
    ExecutionTimeout,
    EngineInternalError,
    RegistryError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::UserInputError => "USER_INPUT_ERROR",
            ErrorKind::ExecutionTimeout => "QUERY_TIMEOUT",
            ErrorKind::EngineInternalError => "ENGINE_INTERNAL_ERROR",
            ErrorKind::RegistryError => "REGISTRY_ERROR",
        }
    }
}

/// Client-facing failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    /// Limit that expired, set only for execution timeouts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RenderedError {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}

impl fmt::Display for RenderedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RenderedError {}

/// The typed node in a cause chain that decides the classification
enum Classified<'a> {
    Timeout(&'a QueryTimedOut),
    Engine(&'a EngineError),
    Frontend(&'a FrontendError),
    Cancelled,
    Unknown,
}

fn find_classified(cause: &anyhow::Error) -> Classified<'_> {
    for node in cause.chain() {
        if let Some(e) = node.downcast_ref::<QueryTimedOut>() {
            return Classified::Timeout(e);
        }
        if let Some(e) = node.downcast_ref::<EngineError>() {
            return Classified::Engine(e);
        }
        if let Some(e) = node.downcast_ref::<FrontendError>() {
            return Classified::Frontend(e);
        }
        if node.is::<QueryCancelled>() {
            return Classified::Cancelled;
        }
    }
    Classified::Unknown
}

pub fn classify(cause: &anyhow::Error) -> ErrorKind {
    match find_classified(cause) {
        Classified::Timeout(_) => ErrorKind::ExecutionTimeout,
        Classified::Engine(e) if e.is_user_input() => ErrorKind::UserInputError,
        Classified::Frontend(e) if e.is_registry_error() => ErrorKind::RegistryError,
        Classified::Frontend(
            FrontendError::InvalidConfig { .. }
            | FrontendError::InvalidTableName(_)
            | FrontendError::Syntax(_),
        ) => ErrorKind::UserInputError,
        _ => ErrorKind::EngineInternalError,
    }
}

fn full_chain(cause: &anyhow::Error) -> String {
    let mut message = format!("Error running query: {}", cause);
    for nested in cause.chain().skip(1) {
        message.push_str("\nCaused by: ");
        message.push_str(&nested.to_string());
    }
    message
}

pub fn render(kind: ErrorKind, cause: &anyhow::Error, transport: Transport) -> RenderedError {
    let classified = find_classified(cause);

    let code = match &classified {
        Classified::Frontend(e) if e.code() != "INTERNAL_ERROR" => e.code().to_string(),
        _ => kind.code().to_string(),
    };

    let timeout_ms = match (&kind, &classified) {
        (ErrorKind::ExecutionTimeout, Classified::Timeout(t)) => Some(t.timeout.as_millis() as u64),
        _ => None,
    };

    let message = match kind {
        ErrorKind::ExecutionTimeout => TIMEOUT_PHRASE.to_string(),
        ErrorKind::RegistryError => match classified {
            Classified::Frontend(e) => e.to_string(),
            _ => cause.to_string(),
        },
        _ if transport.is_diagnosable() => full_chain(cause),
        // Name the offending input, nothing below it
        ErrorKind::UserInputError => match classified {
            Classified::Engine(e) => e.to_string(),
            Classified::Frontend(e) => e.to_string(),
            _ => cause.to_string(),
        },
        ErrorKind::EngineInternalError => cause.to_string(),
    };

    RenderedError {
        kind,
        code,
        message,
        timeout_ms,
    }
}

/// Classify and render in one step
pub fn render_failure(cause: &anyhow::Error, transport: Transport) -> RenderedError {
    render(classify(cause), cause, transport)
}

#[cfg(test)]
mod render_tests {
    use super::*;
    use crate::engine::NumberFormatError;
    use std::time::Duration;

    fn invalid_date_add() -> anyhow::Error {
        let source = "1.2".parse::<i64>().unwrap_err();
        anyhow::Error::new(EngineError::InvalidIntegerArgument {
            function: "date_add".to_string(),
            position: "second",
            value: "1.2".to_string(),
            source: NumberFormatError { input: "1.2".to_string(), source },
        })
        .context("Job job-1-s1 aborted due to task failure")
    }

    #[test]
    fn test_classify_user_input_through_context() {
        assert_eq!(classify(&invalid_date_add()), ErrorKind::UserInputError);
    }

    #[test]
    fn test_user_input_rpc_is_sanitized() {
        let rendered = render_failure(&invalid_date_add(), Transport::StructuredRpc);

        assert_eq!(rendered.kind, ErrorKind::UserInputError);
        assert!(rendered.message.contains("'date_add'"));
        assert!(rendered.message.contains("second argument"));
        assert!(!rendered.message.contains("invalid input syntax for type numeric"));
        assert!(!rendered.message.contains("Caused by"));
    }

    #[test]
    fn test_user_input_driver_has_full_chain() {
        let rendered = render_failure(&invalid_date_add(), Transport::SqlDriver);

        assert!(rendered.message.starts_with("Error running query: Job job-1-s1 aborted"));
        assert!(rendered.message.contains("'date_add'"));
        assert!(rendered.message.contains("Caused by: invalid input syntax for type numeric: 1.2"));
        assert!(rendered.message.contains("invalid digit found in string"));
    }

    #[test]
    fn test_timeout_same_on_every_transport() {
        let cause = anyhow::Error::new(QueryTimedOut { timeout: Duration::from_secs(1) });

        let rpc = render_failure(&cause, Transport::StructuredRpc);
        let driver = render_failure(&cause, Transport::SqlDriver);

        assert_eq!(rpc.kind, ErrorKind::ExecutionTimeout);
        assert_eq!(rpc, driver);
        assert_eq!(rpc.message, TIMEOUT_PHRASE);
        assert_eq!(rpc.timeout_ms, Some(1000));
        assert_eq!(rpc.code, "QUERY_TIMEOUT");
    }

    #[test]
    fn test_timeout_limit_is_a_separate_field() {
        let cause = anyhow::Error::new(QueryTimedOut { timeout: Duration::from_millis(250) });
        let rendered = render_failure(&cause, Transport::StructuredRpc);
        let json: serde_json::Value = serde_json::from_str(&rendered.to_json()).unwrap();

        assert_eq!(json["message"], "Query timed out");
        assert_eq!(json["timeoutMs"], 250);

        let other = render_failure(&invalid_date_add(), Transport::StructuredRpc);
        assert_eq!(other.timeout_ms, None);
        assert!(!other.to_json().contains("timeoutMs"));
    }

    #[test]
    fn test_engine_internal_error() {
        let cause = anyhow::Error::new(EngineError::TaskFailed("executor lost".into()))
            .context("Job job-9-s2 aborted due to task failure");

        let rpc = render_failure(&cause, Transport::StructuredRpc);
        assert_eq!(rpc.kind, ErrorKind::EngineInternalError);
        assert_eq!(rpc.message, "Job job-9-s2 aborted due to task failure");

        let driver = render_failure(&cause, Transport::SqlDriver);
        assert!(driver.message.contains("Caused by: Task failed: executor lost"));
    }

    #[test]
    fn test_registry_error_verbatim() {
        let cause = anyhow::Error::new(FrontendError::DuplicateName("sales".into()));

        for transport in [Transport::StructuredRpc, Transport::SqlDriver] {
            let rendered = render_failure(&cause, transport);
            assert_eq!(rendered.kind, ErrorKind::RegistryError);
            assert_eq!(rendered.code, "DUPLICATE_NAME");
            assert_eq!(rendered.message, "Cached table 'sales' already exists");
        }
    }

    #[test]
    fn test_unknown_cause_is_internal() {
        let cause = anyhow::anyhow!("something odd");
        assert_eq!(classify(&cause), ErrorKind::EngineInternalError);
        assert_eq!(classify(&anyhow::Error::new(QueryCancelled)), ErrorKind::EngineInternalError);
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("driver".parse(), Ok(Transport::SqlDriver));
        assert_eq!("jdbc".parse(), Ok(Transport::SqlDriver));
        assert_eq!("rpc".parse(), Ok(Transport::StructuredRpc));
        assert_eq!("whatever".parse(), Ok(Transport::StructuredRpc));
        assert_eq!(Transport::SqlDriver.as_str(), "driver");
    }

    #[test]
    fn test_rendered_error_json() {
        let cause = anyhow::Error::new(FrontendError::SessionNotFound(3));
        let json = render_failure(&cause, Transport::StructuredRpc).to_json();
        assert!(json.contains("\"kind\":\"registryError\""));
        assert!(json.contains("\"code\":\"SESSION_NOT_FOUND\""));
    }
}
