//! Single-flight gate: one executor, concurrent callers observe its outcome.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

type Outcome = Arc<anyhow::Result<()>>;

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Admits a single executor at a time. Callers that arrive while an
/// execution is in flight block until it completes and observe the same
/// outcome. The gate resets after every completion, so the next call
/// starts a fresh execution.
pub struct SingleFlight {
    in_flight: Mutex<Option<watch::Receiver<Option<Outcome>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }

    /// Run `fut` if no execution is in flight, otherwise wait for the
    /// current one and return its outcome.
    pub async fn run<F>(&self, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let role = {
            let mut slot = self.in_flight.lock();
            // A leader that was cancelled leaves a closed channel with no
            // published outcome behind; reclaim leadership in that case.
            let live = match slot.as_ref() {
                Some(rx) if rx.has_changed().is_ok() || rx.borrow().is_some() => Some(rx.clone()),
                _ => None,
            };
            match live {
                Some(rx) => Role::Follower(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let outcome: Outcome = Arc::new(fut.await);
                // Reset before publishing so followers of this execution see
                // the outcome while new callers start a fresh one.
                *self.in_flight.lock() = None;
                let _ = tx.send(Some(Arc::clone(&outcome)));
                share(&outcome)
            }
            Role::Follower(mut rx) => loop {
                let published = rx.borrow().clone();
                if let Some(outcome) = published {
                    return share(&outcome);
                }
                if rx.changed().await.is_err() {
                    anyhow::bail!("operation was cancelled before completing");
                }
            },
        }
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

fn share(outcome: &Outcome) -> anyhow::Result<()> {
    match outcome.as_ref() {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_collapse_to_one_execution() {
        let gate = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let gate = Arc::clone(&gate);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                gate.run(async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_callers_observe_the_same_error() {
        let gate = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let gate = Arc::clone(&gate);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                gate.run(async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    anyhow::bail!("build exploded")
                })
                .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("build exploded"));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gate_resets_after_each_completion() {
        let gate = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            gate.run(async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }
}
