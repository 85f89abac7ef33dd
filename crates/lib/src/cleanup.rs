//! A LIFO stack of compensating actions run when a workflow exits.
//!
//! Jobs receive a mutable context (for example the snapshotter) so that
//! compensators can act on state the workflow keeps using until it ends.

use std::fmt;

use anyhow::Result;

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Always,
    ErrorOnly,
    SuccessOnly,
}

type Job<'a, C> = Box<dyn FnOnce(&mut C) -> Result<()> + 'a>;

pub(crate) struct CleanupStack<'a, C: ?Sized> {
    jobs: Vec<(JobKind, String, Job<'a, C>)>,
}

impl<C: ?Sized> fmt::Debug for CleanupStack<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.jobs.iter().map(|(kind, name, _)| (kind, name)))
            .finish()
    }
}

impl<'a, C: ?Sized> CleanupStack<'a, C> {
    pub(crate) fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    fn push_kind<F>(&mut self, kind: JobKind, name: impl Into<String>, f: F)
    where
        F: FnOnce(&mut C) -> Result<()> + 'a,
    {
        self.jobs.push((kind, name.into(), Box::new(f)));
    }

    /// Push a job that runs whatever the outcome.
    pub(crate) fn push<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(&mut C) -> Result<()> + 'a,
    {
        self.push_kind(JobKind::Always, name, f)
    }

    /// Push a job that only runs if the workflow failed.
    pub(crate) fn push_error_only<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(&mut C) -> Result<()> + 'a,
    {
        self.push_kind(JobKind::ErrorOnly, name, f)
    }

    /// Push a job that only runs if the workflow succeeded.
    pub(crate) fn push_success_only<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(&mut C) -> Result<()> + 'a,
    {
        self.push_kind(JobKind::SuccessOnly, name, f)
    }

    /// Run every applicable job in reverse push order. A failing job does
    /// not stop the others; all failures are reported as one error.
    pub(crate) fn run(self, ctx: &mut C, failed: bool) -> Result<()> {
        let mut errors = Vec::new();
        for (kind, name, job) in self.jobs.into_iter().rev() {
            let applies = match kind {
                JobKind::Always => true,
                JobKind::ErrorOnly => failed,
                JobKind::SuccessOnly => !failed,
            };
            if !applies {
                tracing::trace!("Skipping cleanup job {name}");
                continue;
            }
            tracing::debug!("Running cleanup job {name}");
            if let Err(e) = job(ctx) {
                tracing::warn!("Cleanup job {name} failed: {e:#}");
                errors.push(format!("{name}: {e:#}"));
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(anyhow::anyhow!("{}", errors[0])),
            n => Err(anyhow::anyhow!(
                "{n} cleanup jobs failed: {}",
                errors.join("; ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_and_totality() {
        let mut ran: Vec<u32> = Vec::new();
        let mut stack = CleanupStack::<Vec<u32>>::new();
        for i in 1..=5 {
            stack.push(format!("job{i}"), move |ran: &mut Vec<u32>| {
                ran.push(i);
                if i == 3 {
                    anyhow::bail!("boom");
                }
                Ok(())
            });
        }
        let e = stack.run(&mut ran, false).unwrap_err();
        assert_eq!(e.to_string(), "job3: boom");
        assert_eq!(ran, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_multiple_failures_aggregated() {
        let mut stack = CleanupStack::<()>::new();
        stack.push("a", |_: &mut ()| anyhow::bail!("first"));
        stack.push("b", |_: &mut ()| Ok(()));
        stack.push("c", |_: &mut ()| anyhow::bail!("second"));
        let e = stack.run(&mut (), true).unwrap_err();
        assert_eq!(e.to_string(), "2 cleanup jobs failed: c: second; a: first");
    }

    #[test]
    fn test_job_kinds() {
        let build = || {
            let mut stack = CleanupStack::<Vec<&'static str>>::new();
            stack.push("always", |v: &mut Vec<_>| {
                v.push("always");
                Ok(())
            });
            stack.push_error_only("error", |v: &mut Vec<_>| {
                v.push("error");
                Ok(())
            });
            stack.push_success_only("success", |v: &mut Vec<_>| {
                v.push("success");
                Ok(())
            });
            stack
        };
        let mut ran = Vec::new();
        build().run(&mut ran, true).unwrap();
        assert_eq!(ran, ["error", "always"]);
        let mut ran = Vec::new();
        build().run(&mut ran, false).unwrap();
        assert_eq!(ran, ["success", "always"]);
    }
}
