// fail_open.rs — Turning handler failures into logged no-ops.
//
// An agent that stops responding cannot even report that something went
// wrong; one that briefly loses taint tracking can. So every lifecycle
// handler runs under `fail_open`: an error or a panic is logged with the
// hook and session, handed to an optional observer (the guard audits it),
// and the host gets the default response.
//
// A sealed-graph mutation is still swallowed here, but it is logged as an
// orchestration bug rather than a routine failure.

use std::panic::{self, AssertUnwindSafe};

use crate::error::GuardError;

/// Run a handler, converting a panic into [`GuardError::Panic`].
pub fn catch_handler<T>(handler: impl FnOnce() -> Result<T, GuardError>) -> Result<T, GuardError> {
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(GuardError::Panic(message))
        }
    }
}

/// Run a handler fail-open: on error or panic, log, call `on_failure`, and
/// return `T::default()`.
pub fn fail_open<T: Default>(
    hook: &str,
    session_key: &str,
    handler: impl FnOnce() -> Result<T, GuardError>,
    on_failure: impl FnOnce(&GuardError),
) -> T {
    match catch_handler(handler) {
        Ok(value) => value,
        Err(error) => {
            if error.is_orchestration_bug() {
                tracing::error!(
                    hook,
                    session = session_key,
                    error = %error,
                    "orchestration bug: handler mutated state it must not touch"
                );
            } else {
                tracing::error!(hook, session = session_key, error = %error, "hook handler failed");
            }
            on_failure(&error);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tg_taint::{TaintError, TurnGraph};

    fn sealed_graph_error() -> TaintError {
        let mut graph = TurnGraph::new("s");
        graph.seal().unwrap();
        graph.seal().unwrap_err()
    }

    #[test]
    fn success_passes_through() {
        let value = fail_open("test", "s", || Ok(7), |_| panic!("not called"));
        assert_eq!(value, 7);
    }

    #[test]
    fn error_becomes_default_and_is_observed() {
        let seen = Cell::new(false);
        let value: Vec<String> = fail_open(
            "test",
            "s",
            || Err(GuardError::Notify("down".to_string())),
            |e| {
                assert!(!e.is_orchestration_bug());
                seen.set(true);
            },
        );
        assert!(value.is_empty());
        assert!(seen.get());
    }

    #[test]
    fn panic_is_caught() {
        let result: Result<u8, _> = catch_handler(|| panic!("boom"));
        match result {
            Err(GuardError::Panic(message)) => assert_eq!(message, "boom"),
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn sealed_graph_is_flagged_as_orchestration_bug() {
        let error = sealed_graph_error();
        assert!(matches!(error, TaintError::SealedGraph { .. }));
        let seen = Cell::new(false);
        let _: u8 = fail_open(
            "test",
            "s",
            || Err(GuardError::from(sealed_graph_error())),
            |e| seen.set(e.is_orchestration_bug()),
        );
        assert!(seen.get());
    }
}
