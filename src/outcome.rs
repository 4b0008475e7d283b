//! Step outcomes and test verdicts
//!
//! A scenario step either finishes, or fails in one of three ways that the
//! caller must treat differently:
//!
//! - `Fatal` ends the scenario (after any cleanup the caller owns).
//! - `Recoverable` is an expected failure the caller has a remedy for.
//! - `Logged` is reported and otherwise ignored.

use std::fmt;

use crate::common::{Error, Result};

/// Result of one scenario step
#[must_use]
#[derive(Debug)]
pub enum Outcome<T> {
    /// Step completed
    Done(T),
    /// Step failed; the failure is recorded and the scenario continues
    Logged(Error),
    /// Step failed in a way the caller knows how to remedy
    Recoverable(Error),
    /// Step failed; the scenario cannot continue
    Fatal(Error),
}

impl<T> Outcome<T> {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }

    /// Collapse into a `Result`, treating every non-`Done` as fatal
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Done(v) => Ok(v),
            Outcome::Logged(e) | Outcome::Recoverable(e) | Outcome::Fatal(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    /// Errors from `?`-style code are fatal
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(v) => Outcome::Done(v),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

/// Run `region`; if it ends `Fatal`, run `cleanup` before handing the
/// original error back unchanged
///
/// Cleanup errors are logged; they never replace the region's error.
pub async fn protect<T, S, R, C>(state: &mut S, region: R, cleanup: C) -> Result<T>
where
    R: AsyncFnOnce(&mut S) -> Outcome<T>,
    C: AsyncFnOnce(&mut S) -> Result<()>,
{
    match region(state).await {
        Outcome::Fatal(e) => {
            tracing::warn!("Protected region failed, cleaning up: {}", e);
            if let Err(cleanup_err) = cleanup(state).await {
                tracing::error!("Cleanup failed: {}", cleanup_err);
            }
            Err(e)
        }
        other => other.into_result(),
    }
}

/// Final verdict of a scenario run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Error(String),
    Cancel(String),
}

impl Verdict {
    /// Map a scenario's result to a verdict
    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Verdict::Pass,
            Err(Error::TestFail(m)) => Verdict::Fail(m.clone()),
            Err(Error::TestCancel(m)) => Verdict::Cancel(m.clone()),
            Err(e) => Verdict::Error(e.to_string()),
        }
    }

    /// Whether the run counts as successful (passed or cancelled)
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Pass | Verdict::Cancel(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail(_) => "FAIL",
            Verdict::Error(_) => "ERROR",
            Verdict::Cancel(_) => "CANCEL",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail(m) | Verdict::Error(m) | Verdict::Cancel(m) => {
                write!(f, "{}: {}", self.label(), m)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_is_fatal_on_error() {
        let o: Outcome<u8> = Err(Error::SessionClosed).into();
        assert!(o.is_fatal());
        let o: Outcome<u8> = Ok(3).into();
        assert!(matches!(o, Outcome::Done(3)));
    }

    #[tokio::test]
    async fn test_protect_runs_cleanup_only_on_fatal() {
        let mut cleaned = 0u32;
        let r: Result<()> = protect(
            &mut cleaned,
            async |_: &mut u32| Outcome::Fatal(Error::TestFail("boom".into())),
            async |c: &mut u32| {
                *c += 1;
                Ok(())
            },
        )
        .await;
        assert!(matches!(r, Err(Error::TestFail(m)) if m == "boom"));
        assert_eq!(cleaned, 1);

        let r: Result<u8> = protect(
            &mut cleaned,
            async |_: &mut u32| Outcome::Done(7),
            async |c: &mut u32| {
                *c += 1;
                Ok(())
            },
        )
        .await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(cleaned, 1);
    }

    #[tokio::test]
    async fn test_protect_keeps_original_error_when_cleanup_fails() {
        let mut state = ();
        let r: Result<()> = protect(
            &mut state,
            async |_: &mut ()| Outcome::Fatal(Error::timeout("dd", 360)),
            async |_: &mut ()| Err(Error::SessionClosed),
        )
        .await;
        assert!(matches!(r, Err(Error::Timeout { secs: 360, .. })));
    }

    #[test]
    fn test_verdict_mapping() {
        assert_eq!(Verdict::from_result(&Ok(())), Verdict::Pass);
        assert_eq!(
            Verdict::from_result(&Err(Error::TestCancel("no sev".into()))),
            Verdict::Cancel("no sev".into())
        );
        assert!(matches!(
            Verdict::from_result(&Err(Error::MissingParam("main_vm".into()))),
            Verdict::Error(_)
        ));
        assert!(Verdict::Cancel("x".into()).is_success());
        assert!(!Verdict::Fail("x".into()).is_success());
    }
}
