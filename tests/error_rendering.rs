//! Integration test: failure classification and per-transport rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlfront::{ErrorKind, FrontendConfig, LocalEngine, SessionId, SqlFrontend, Transport};
use tempfile::TempDir;

fn setup() -> (TempDir, SqlFrontend, SessionId) {
    let dir = TempDir::new().unwrap();
    let config = FrontendConfig {
        scratch_root: dir.path().to_path_buf(),
        ..FrontendConfig::default()
    };
    let frontend = SqlFrontend::new(config, Arc::new(LocalEngine::new()));
    let session = frontend.open_session("tester", &BTreeMap::new()).unwrap();
    (dir, frontend, session)
}

const BAD_DATE_ADD: &str = "SELECT date_add('2011-11-11', '1.2')";

#[test]
fn invalid_argument_rpc_is_sanitized() {
    let (_dir, frontend, session) = setup();

    let err = frontend
        .execute(session, BAD_DATE_ADD, None, Transport::StructuredRpc)
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UserInputError);
    assert_eq!(
        err.message,
        "The second argument of 'date_add' function needs to be an integer, got '1.2'"
    );
    assert!(!err.message.contains("Caused by"));
    assert!(!err.message.contains("invalid input syntax for type numeric"));
}

#[test]
fn invalid_argument_driver_shows_chain() {
    let (_dir, frontend, session) = setup();

    let err = frontend
        .execute(session, BAD_DATE_ADD, None, Transport::SqlDriver)
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UserInputError);
    assert!(err.message.starts_with("Error running query: Job job-"));
    assert!(err.message.contains("aborted due to task failure"));
    assert!(err.message.contains(
        "Caused by: The second argument of 'date_add' function needs to be an integer, got '1.2'"
    ));
    assert!(err
        .message
        .contains("Caused by: invalid input syntax for type numeric: 1.2"));
}

#[test]
fn valid_date_add_succeeds() {
    let (_dir, frontend, session) = setup();

    let result = frontend
        .execute(session, "SELECT date_add('2011-11-11', 1) AS d", None, Transport::SqlDriver)
        .unwrap();
    assert_eq!(result.rows.rows[0][0].to_string(), "2011-11-12");
}

#[test]
fn engine_failure_is_internal() {
    let (_dir, frontend, session) = setup();

    let rpc = frontend
        .execute(session, "SELECT raise_error('disk on fire')", None, Transport::StructuredRpc)
        .unwrap_err();
    assert_eq!(rpc.kind, ErrorKind::EngineInternalError);
    assert!(!rpc.message.contains("disk on fire"));

    let driver = frontend
        .execute(session, "SELECT raise_error('disk on fire')", None, Transport::SqlDriver)
        .unwrap_err();
    assert!(driver.message.contains("Caused by: Task failed: disk on fire"));
}

#[test]
fn session_survives_failures() {
    let (_dir, frontend, session) = setup();

    for transport in [Transport::StructuredRpc, Transport::SqlDriver] {
        assert!(frontend.execute(session, BAD_DATE_ADD, None, transport).is_err());
    }
    assert!(frontend
        .execute(session, "SELECT 1", None, Transport::StructuredRpc)
        .is_ok());
}

#[test]
fn rpc_json_payload() {
    let (_dir, frontend, session) = setup();

    let err = frontend
        .execute(session, BAD_DATE_ADD, None, Transport::StructuredRpc)
        .unwrap_err();
    let json: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();

    assert_eq!(json["kind"], "userInputError");
    assert_eq!(json["code"], "USER_INPUT_ERROR");
}
