//! Ordered release of acquired resources.
//!
//! Releases are recorded as they are acquired and run in reverse. Each runs
//! exactly once; a failing or panicking release does not stop the rest.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub label: &'static str,
    pub message: String,
}

#[derive(Default)]
pub struct TeardownStack {
    releases: Vec<(&'static str, BoxFuture<'static, anyhow::Result<()>>)>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the release for a resource that was just acquired.
    pub fn push<F>(&mut self, label: &'static str, release: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.releases.push((label, release.boxed()));
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Run every release, last acquired first.
    pub async fn unwind(mut self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        while let Some((label, release)) = self.releases.pop() {
            tracing::debug!(resource = label, "Releasing");
            let message = match AssertUnwindSafe(release).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::warn!(resource = label, error = %message, "Release failed");
            failures.push(TeardownFailure { label, message });
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn releases_run_in_reverse_order() {
        let order = recorder();
        let mut stack = TeardownStack::new();
        for label in ["listener", "process", "registration"] {
            let order = Arc::clone(&order);
            stack.push(label, async move {
                order.lock().unwrap().push(label);
                Ok(())
            });
        }
        assert_eq!(stack.len(), 3);

        let failures = stack.unwind().await;
        assert!(failures.is_empty());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["registration", "process", "listener"]
        );
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_releases() {
        let order = recorder();
        let mut stack = TeardownStack::new();

        let first = Arc::clone(&order);
        stack.push("first", async move {
            first.lock().unwrap().push("first");
            Ok(())
        });
        stack.push("broken", async { Err(anyhow::anyhow!("socket already gone")) });
        stack.push("panicky", async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(())
        });

        let failures = stack.unwind().await;

        assert_eq!(*order.lock().unwrap(), vec!["first"]);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].label, "panicky");
        assert_eq!(failures[0].message, "panicked: boom");
        assert_eq!(failures[1].label, "broken");
        assert_eq!(failures[1].message, "socket already gone");
    }

    #[tokio::test]
    async fn empty_stack_unwinds_cleanly() {
        let stack = TeardownStack::new();
        assert!(stack.is_empty());
        assert!(stack.unwind().await.is_empty());
    }
}
