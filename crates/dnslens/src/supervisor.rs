use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How hard a background task is kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// Restarted forever, quickly.
    Essential,
    /// Restarted a few times with a slow backoff, then given up.
    Background,
}

impl TaskPriority {
    fn max_restarts(self) -> u32 {
        match self {
            Self::Essential => u32::MAX,
            Self::Background => 3,
        }
    }

    fn backoff(self, attempt: u32) -> Duration {
        match self {
            Self::Essential => Duration::from_millis(200 * attempt as u64),
            Self::Background => Duration::from_secs(5 * attempt as u64),
        }
    }
}

/// A run longer than this counts as healthy and clears the restart count.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Run the future built by `factory` on its own task and rebuild it when it
/// fails or panics, according to `priority`. A clean `Ok(())` ends
/// supervision.
pub fn spawn_supervised<F, Fut>(name: &'static str, priority: TaskPriority, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut attempt: u32 = 0;

        loop {
            info!("Starting task {}", name);
            let started = Instant::now();
            let run = {
                let factory = factory.clone();
                tokio::spawn(async move { factory().await })
            };

            match run.await {
                Ok(Ok(())) => {
                    info!("Task {} finished", name);
                    return;
                }
                Ok(Err(e)) => error!("Task {} failed: {:#}", name, e),
                Err(e) => error!("Task {} panicked: {}", name, e),
            }

            if started.elapsed() > HEALTHY_RUN {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);
            if attempt > priority.max_restarts() {
                error!("Task {} failed {} times, giving up", name, attempt - 1);
                return;
            }

            let backoff = priority.backoff(attempt);
            warn!("Restarting task {} in {:?} (attempt {})", name, backoff, attempt);
            tokio::time::sleep(backoff).await;
        }
    })
}
