//! Smoke tests for the pyjail library.
//!
//! The basics every sandbox must get right:
//! 1. stdout capture
//! 2. syntax errors surface as `GuestError::SyntaxError`
//! 3. imports outside the allowlist surface as `GuestError::ImportDenied`
//! 4. a trailing expression becomes the return value
//! 5. execution duration is measured
//!
//! Run with: `cargo test -p pyjail --test smoke_test`

use pyjail::{GuestError, Sandbox};

fn sandbox() -> Sandbox {
    Sandbox::new().expect("sandbox creation should succeed")
}

#[test]
fn test_execute_hello_world() {
    let mut sb = sandbox();
    let outcome = sb.execute(r#"print("hi")"#);
    assert_eq!(outcome.stdout, "hi\n", "got {:?}", outcome.stdout);
    assert!(outcome.error.is_none(), "expected no error, got {:?}", outcome.error);
}

#[test]
fn test_execute_syntax_error() {
    let mut sb = sandbox();
    let outcome = sb.execute("def f(:");
    assert!(
        matches!(outcome.error, Some(GuestError::SyntaxError { .. })),
        "expected SyntaxError, got {:?}",
        outcome.error
    );
}

#[test]
fn test_execute_module_denied() {
    let mut sb = sandbox();
    let outcome = sb.execute("import socket");
    assert_eq!(
        outcome.error,
        Some(GuestError::ImportDenied {
            module_name: "socket".to_string()
        })
    );
}

#[test]
fn test_execute_return_value() {
    let mut sb = sandbox();
    let outcome = sb.execute("2 ** 10");
    assert_eq!(outcome.return_value.as_deref(), Some("1024"));
    let outcome = sb.execute("None");
    assert_eq!(outcome.return_value, None, "None is not reported");
}

#[test]
fn test_execute_runtime_error() {
    let mut sb = sandbox();
    match sb.execute("x = 1 / 0").error {
        Some(GuestError::RuntimeError { message, traceback }) => {
            assert!(message.contains("ZeroDivisionError"), "message: {message}");
            assert!(!traceback.is_empty());
        }
        other => panic!("expected RuntimeError, got {other:?}"),
    }
}

#[test]
fn test_execute_duration_nonzero() {
    let mut sb = sandbox();
    let outcome = sb.execute("x = 1");
    assert!(outcome.duration_ns > 0, "got {}", outcome.duration_ns);
}

#[test]
fn test_dispose_empty_sandbox() {
    let report = sandbox().dispose();
    assert_eq!(report.finalized, 0);
    assert!(report.faults.is_empty());
}
