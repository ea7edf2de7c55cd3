//! Fixed-delay polling.
//!
//! A poll runs its operation right away, then again `interval` after each
//! completion, whether the operation succeeded, failed or panicked. The loop
//! lives until its [`Armed`] guard is dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, warn};
use tokio::task::JoinHandle;

/// Owns a background task and aborts it on drop.
#[derive(Debug)]
pub struct Armed {
    name: String,
    task: JoinHandle<()>,
}

impl Armed {
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Armed {
            name: name.into(),
            task: tokio::spawn(future),
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        debug!("disarming {}", self.name);
        self.task.abort();
    }
}

pub fn arm<F, Fut>(name: impl Into<String>, interval: Duration, mut operation: F) -> Armed
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    let label = name.clone();
    Armed::spawn(name, async move {
        loop {
            match AssertUnwindSafe(operation()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error polling {}: {:#}", label, e),
                Err(_) => warn!("{} poll panicked", label),
            }
            tokio::time::sleep(interval).await;
        }
    })
}
