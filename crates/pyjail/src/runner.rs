//! One-shot runs: create a sandbox, execute one source, dispose, all on a
//! dedicated thread bounded by [`SandboxSettings::timeout_ns`].

use std::time::Instant;

use crate::sandbox::{Capabilities, Sandbox};
use crate::timeout::{run_with_timeout, WorkerError};
use crate::types::{ExecOutcome, GuestError, RunReport, SandboxError, SandboxSettings};

/// Runs `source` in a fresh sandbox built from `settings`.
pub fn run_isolated(source: &str, settings: SandboxSettings) -> Result<RunReport, SandboxError> {
    run_isolated_with(source, settings, |_| Ok(()))
}

/// Like [`run_isolated`], with `configure` applied to the namespace after
/// creation and before execution (revocations, grants, module edits).
///
/// On timeout the worker is abandoned: the outcome carries
/// [`GuestError::Timeout`] and there is no teardown report. Host-side
/// failures (creation, `configure`, a panicked worker) are returned as `Err`.
pub fn run_isolated_with<F>(
    source: &str,
    settings: SandboxSettings,
    configure: F,
) -> Result<RunReport, SandboxError>
where
    F: FnOnce(&mut Capabilities<'_>) -> Result<(), SandboxError> + Send + 'static,
{
    let start = Instant::now();
    let limit_ns = settings.timeout_ns;
    let source = source.to_owned();

    let result = run_with_timeout(
        move || -> Result<RunReport, SandboxError> {
            let mut sandbox = Sandbox::create(settings)?;
            if let Err(e) = configure(&mut sandbox.capabilities()) {
                sandbox.dispose();
                return Err(e);
            }
            let outcome = sandbox.execute(&source);
            let teardown = sandbox.dispose();
            Ok(RunReport {
                outcome,
                teardown: Some(teardown),
            })
        },
        limit_ns,
    );

    match result {
        Ok(report) => report,
        Err(WorkerError::TimedOut { limit_ns }) => {
            tracing::warn!(limit_ns, "one-shot run timed out; worker abandoned");
            Ok(RunReport {
                outcome: ExecOutcome {
                    error: Some(GuestError::Timeout { limit_ns }),
                    duration_ns: u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX),
                    ..ExecOutcome::default()
                },
                teardown: None,
            })
        }
        Err(e) => Err(SandboxError::Worker {
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "slow: VM init per test"]
    fn one_shot_run_reports_outcome_and_teardown() {
        let report = run_isolated("print('hi')\n6 * 7", SandboxSettings::default())
            .expect("host side ok");
        assert_eq!(report.outcome.stdout, "hi\n");
        assert_eq!(report.outcome.return_value.as_deref(), Some("42"));
        let teardown = report.teardown.expect("disposed");
        assert_eq!(teardown.finalized, 0);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn infinite_loop_times_out() {
        let settings = SandboxSettings {
            timeout_ns: 300_000_000,
            ..SandboxSettings::default()
        };
        let report = run_isolated("while True:\n    pass", settings).expect("host side ok");
        assert_eq!(
            report.outcome.error,
            Some(GuestError::Timeout {
                limit_ns: 300_000_000
            })
        );
        assert!(report.teardown.is_none());
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn configure_errors_are_returned() {
        let result = run_isolated_with("1", SandboxSettings::default(), |caps| {
            caps.grant("definitely_not_a_builtin")
        });
        assert!(matches!(
            result,
            Err(SandboxError::UnknownCapability { .. })
        ));
    }
}
