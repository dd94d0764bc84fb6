//! Ingressor controller: keeps one Ingress per annotated Service.
//!
//! Event source -> [`Dispatcher`] -> work queue -> workers -> [`Reconciler`]
//! -> Ingress store. Failed keys go back through the [`RetryPolicy`].

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use ingressor_core::{DependentStore, Lister, ResourceKey, DEFAULT_ENABLE_ANNOTATION};
use ingressor_queue::WorkQueue;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod dispatch;
pub mod reconcile;
pub mod retry;

pub use dispatch::Dispatcher;
pub use reconcile::{build_ingress, wants_ingress, Action, Outcome, Reconciler};
pub use retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    pub max_retries: u32,
    /// Service annotation requesting an Ingress.
    pub annotation: String,
    pub forget_on_retry: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 5, max_retries: 10, annotation: DEFAULT_ENABLE_ANNOTATION.to_string(), forget_on_retry: false }
    }
}

pub struct Controller {
    queue: WorkQueue<ResourceKey>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
    retry: RetryPolicy,
    workers: usize,
}

impl Controller {
    /// The caller registers [`Controller::dispatcher`] with its event sources
    /// and waits for their caches to sync before calling [`Controller::run`].
    pub fn new(
        store: Arc<dyn DependentStore>,
        services: Arc<dyn Lister<Service>>,
        ingresses: Arc<dyn Lister<Ingress>>,
        config: ControllerConfig,
    ) -> Self {
        let queue = WorkQueue::with_default_limiter("ingressor");
        let reconciler = Reconciler::new(services, ingresses, store, config.annotation);
        Self {
            dispatcher: Arc::new(Dispatcher::new(queue.clone())),
            queue,
            reconciler: Arc::new(reconciler),
            retry: RetryPolicy { max_retries: config.max_retries, forget_on_retry: config.forget_on_retry },
            workers: config.workers.max(1),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> { Arc::clone(&self.dispatcher) }

    pub fn queue(&self) -> &WorkQueue<ResourceKey> { &self.queue }

    /// Run the workers until `stop` completes, then shut the queue down and
    /// wait for in-flight syncs to finish.
    pub async fn run<F>(&self, stop: F)
    where
        F: Future<Output = ()>,
    {
        info!(workers = self.workers, max_retries = self.retry.max_retries, "starting workers");
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker(id, self.queue.clone(), Arc::clone(&self.reconciler), self.retry));
        }

        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(res) = workers.join_next() => match res {
                    Err(e) => error!(error = %e, "worker crashed; not restarted"),
                    Ok(()) => warn!("worker exited before shutdown"),
                },
            }
        }

        info!("stop signal received; shutting down");
        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker crashed");
            }
        }
        info!("workers stopped");
    }
}

/// Calls `done` when dropped, so the key leaves in-flight on every path.
struct InFlight<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.queue.done(self.key) }
}

async fn worker(id: usize, queue: WorkQueue<ResourceKey>, reconciler: Arc<Reconciler>, retry: RetryPolicy) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let _in_flight = InFlight { queue: &queue, key: &key };
        process(&queue, &reconciler, &retry, &key).await;
    }
    debug!(worker = id, "worker stopped");
}

async fn process(queue: &WorkQueue<ResourceKey>, reconciler: &Reconciler, retry: &RetryPolicy, key: &ResourceKey) {
    match reconciler.reconcile(key).await {
        Ok(outcome) => {
            queue.forget(key);
            counter!("reconcile_total", 1u64, "outcome" => outcome.as_str());
            debug!(%key, outcome = outcome.as_str(), "synced");
        }
        Err(e) => {
            retry.handle_error(queue, key, &e);
        }
    }
}
