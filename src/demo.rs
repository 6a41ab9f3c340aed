//! In-memory Deployment → Service cluster with simulated churn.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use converge_cache::{InMemorySource, ListWatch};
use converge_core::{
    Error, ObjectKey, ObjectMeta, Resource, Result, ShutdownCoordinator, ShutdownPhase, ShutdownSignal,
};
use converge_reconciler::{
    Controller, ControllerConfig, DependentApi, DependentReconciler, ReconcileReport, SyncOutcome,
};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NAMESPACES: [&str; 2] = ["default", "staging"];
const NAMES: [&str; 4] = ["api", "web", "worker", "cron"];

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub meta: ObjectMeta,
    pub replicas: u32,
    /// Zero is rejected by the Service builder.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub meta: ObjectMeta,
    pub selector: String,
    pub port: u16,
}

impl Resource for Deployment {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Resource for Service {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

/// Desired Service for a Deployment.
///
/// # Errors
///
/// Returns [`Error::PermanentSync`] for a Deployment without a port.
pub fn service_for(key: &ObjectKey, deployment: &Deployment) -> Result<Service> {
    if deployment.port == 0 {
        return Err(Error::permanent_sync(key, "deployment exposes no port"));
    }
    let namespace = key.namespace().map_or_else(String::new, ToString::to_string);
    Ok(Service {
        meta: ObjectMeta::namespaced(namespace, key.name()),
        selector: format!("app={}", key.name()),
        port: deployment.port,
    })
}

/// Service API whose writes fail transiently at a configured rate.
pub struct FlakyServices {
    inner: Arc<InMemorySource<Service>>,
    rng: Mutex<StdRng>,
    failure_rate: f64,
}

impl FlakyServices {
    pub fn new(inner: Arc<InMemorySource<Service>>, seed: u64, failure_rate: f64) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }

    fn maybe_fail(&self, key: &ObjectKey, op: &str) -> Result<()> {
        let fail = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.failure_rate);
        if fail {
            Err(Error::transient_sync(key, format!("{op} rejected: apiserver unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DependentApi<Service> for FlakyServices {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Service>> {
        Ok(self.inner.get(key))
    }

    async fn create(&self, object: Service) -> Result<()> {
        self.maybe_fail(&object.key()?, "create")?;
        self.inner.upsert(object).map(|_| ())
    }

    async fn update(&self, object: Service) -> Result<()> {
        self.maybe_fail(&object.key()?, "update")?;
        self.inner.upsert(object).map(|_| ())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.maybe_fail(key, "delete")?;
        self.inner.delete(key);
        Ok(())
    }
}

/// A simulated change to the Deployment collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChurnOp {
    Apply(Deployment),
    Delete(ObjectKey),
}

/// Pick the next change. Deletes and portless Deployments are rarer than applies.
pub fn next_op(rng: &mut impl Rng) -> ChurnOp {
    let namespace = NAMESPACES.choose(rng).copied().unwrap_or("default");
    let name = NAMES.choose(rng).copied().unwrap_or("api");
    match rng.gen_range(0..10u8) {
        0..=2 => ChurnOp::Delete(ObjectKey::namespaced(namespace, name)),
        roll => ChurnOp::Apply(Deployment {
            meta: ObjectMeta::namespaced(namespace, name),
            replicas: rng.gen_range(1..=5),
            port: if roll == 9 { 0 } else { 8000u16.saturating_add(rng.gen_range(0..4)) },
        }),
    }
}

async fn churn(
    deployments: Arc<InMemorySource<Deployment>>,
    seed: u64,
    interval: Duration,
    shutdown: ShutdownSignal,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {}
        }
        match next_op(&mut rng) {
            ChurnOp::Apply(deployment) => {
                let name = deployment.meta.name.clone();
                if let Err(e) = deployments.upsert(deployment) {
                    warn!(error = %e, name = %name, "Churn apply failed");
                }
            }
            ChurnOp::Delete(key) => {
                if deployments.delete(&key).is_some() {
                    debug!(key = %key, "Churn deleted deployment");
                }
            }
        }
    }
}

/// Running totals of reconcile outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub done: u64,
    pub retried: u64,
    pub terminal: u64,
    pub standing: u64,
}

impl Tally {
    pub fn record(&mut self, report: &ReconcileReport) {
        match report.outcome {
            SyncOutcome::Done => self.done = self.done.saturating_add(1),
            SyncOutcome::RetryableError(_) => self.retried = self.retried.saturating_add(1),
            SyncOutcome::TerminalError(_) => self.terminal = self.terminal.saturating_add(1),
        }
        if report.standing_condition {
            self.standing = self.standing.saturating_add(1);
        }
    }
}

async fn tally(mut reports: broadcast::Receiver<ReconcileReport>) -> Tally {
    let mut tally = Tally::default();
    loop {
        match reports.recv().await {
            Ok(report) => tally.record(&report),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Report listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return tally,
        }
    }
}

/// Settings for [`run`] that are not controller configuration.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub seed: u64,
    pub churn_interval: Duration,
    pub failure_rate: f64,
}

/// Run the demo cluster until shutdown.
///
/// # Errors
///
/// Returns the controller's startup error, e.g. a cache sync timeout.
pub async fn run(
    config: ControllerConfig,
    options: DemoOptions,
    coordinator: Arc<ShutdownCoordinator>,
) -> anyhow::Result<Tally> {
    let deployments: Arc<InMemorySource<Deployment>> = Arc::new(InMemorySource::new());
    let services: Arc<InMemorySource<Service>> = Arc::new(InMemorySource::new());
    let api = Arc::new(FlakyServices::new(
        Arc::clone(&services),
        options.seed.wrapping_add(1),
        options.failure_rate,
    ));
    let handler = Arc::new(DependentReconciler::new(api, service_for));

    let source: Arc<dyn ListWatch<Deployment>> = Arc::<InMemorySource<Deployment>>::clone(&deployments);
    let controller = Controller::new("deployments", source, handler, config)
        .context("Failed to build controller")?;
    let queue = controller.queue();
    let tally_task = tokio::spawn(tally(controller.reports()));

    info!(seed = options.seed, failure_rate = options.failure_rate, "Starting demo cluster");

    let churn_task = tokio::spawn(churn(
        Arc::clone(&deployments),
        options.seed,
        options.churn_interval,
        coordinator.signal(),
    ));

    let signal = coordinator.signal();
    let controller_task = tokio::spawn(async move { controller.run(signal).await });

    let draining = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator.signal().triggered().await;
            coordinator.set_phase(ShutdownPhase::Draining).await;
        })
    };

    let result = controller_task.await;
    draining.abort();
    churn_task.abort();
    coordinator.set_phase(ShutdownPhase::Complete).await;
    result
        .context("Controller task failed")?
        .context("Controller exited with an error")?;

    let totals = tally_task.await.unwrap_or_default();
    let stats = queue.stats();
    let converged = diverged(&deployments, &services).is_empty();
    info!(
        done = totals.done,
        retried = totals.retried,
        terminal = totals.terminal,
        standing = totals.standing,
        adds = stats.adds,
        deduplicated = stats.deduplicated,
        converged,
        "Demo finished"
    );
    Ok(totals)
}

/// Keys whose Service does not match the Deployment (or should not exist).
pub fn diverged(
    deployments: &InMemorySource<Deployment>,
    services: &InMemorySource<Service>,
) -> Vec<ObjectKey> {
    // Portless deployments are rejected permanently, so their Service is left as it was.
    let owners: BTreeMap<ObjectKey, u16> = deployments
        .keys()
        .into_iter()
        .filter_map(|key| deployments.get(&key).map(|d| (key, d.port)))
        .collect();

    let mismatched: Vec<ObjectKey> = owners
        .iter()
        .filter(|(key, port)| **port != 0 && services.get(key).map(|s| s.port) != Some(**port))
        .map(|(key, _)| key.clone())
        .chain(services.keys().into_iter().filter(|k| !owners.contains_key(k)))
        .sorted()
        .dedup()
        .collect();

    if !mismatched.is_empty() {
        debug!(keys = %mismatched.iter().join(", "), "Diverged objects");
    }
    mismatched
}

#[cfg(test)]
mod tests {
    use converge_reconciler::RateLimitConfig;

    use super::*;

    #[test]
    fn test_next_op_is_deterministic_for_a_seed() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let ops_a: Vec<ChurnOp> = (0..20).map(|_| next_op(&mut a)).collect();
        let ops_b: Vec<ChurnOp> = (0..20).map(|_| next_op(&mut b)).collect();
        assert_eq!(ops_a, ops_b);
    }

    #[test]
    fn test_service_for_rejects_portless_deployment() {
        let key = ObjectKey::namespaced("default", "api");
        let deployment = Deployment {
            meta: ObjectMeta::namespaced("default", "api"),
            replicas: 1,
            port: 0,
        };
        assert!(matches!(service_for(&key, &deployment), Err(Error::PermanentSync { .. })));
    }

    #[test]
    fn test_service_mirrors_deployment() {
        let key = ObjectKey::namespaced("staging", "web");
        let deployment = Deployment {
            meta: ObjectMeta::namespaced("staging", "web"),
            replicas: 3,
            port: 8080,
        };
        let service = service_for(&key, &deployment).ok();
        assert_eq!(service.as_ref().map(|s| s.port), Some(8080));
        assert_eq!(service.map(|s| s.selector), Some("app=web".to_string()));
    }

    #[tokio::test]
    async fn test_flaky_services_always_failing() {
        let services = Arc::new(InMemorySource::new());
        let api = FlakyServices::new(Arc::clone(&services), 1, 1.0);
        let service = Service {
            meta: ObjectMeta::namespaced("default", "api"),
            selector: "app=api".to_string(),
            port: 80,
        };

        let result = api.create(service).await;
        assert!(matches!(result, Err(Error::TransientSync { .. })));
        assert!(services.is_empty());
    }

    #[test]
    fn test_diverged_detects_orphan_and_drift() {
        let deployments = InMemorySource::new();
        let services = InMemorySource::new();
        let _ = deployments.upsert(Deployment {
            meta: ObjectMeta::namespaced("default", "api"),
            replicas: 1,
            port: 80,
        });
        let _ = services.upsert(Service {
            meta: ObjectMeta::namespaced("default", "api"),
            selector: "app=api".to_string(),
            port: 81,
        });
        let _ = services.upsert(Service {
            meta: ObjectMeta::namespaced("default", "orphan"),
            selector: "app=orphan".to_string(),
            port: 80,
        });

        assert_eq!(
            diverged(&deployments, &services),
            vec![
                ObjectKey::namespaced("default", "api"),
                ObjectKey::namespaced("default", "orphan")
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_demo_runs_until_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let config = ControllerConfig::default()
            .workers(2)
            .cache_sync_timeout(Duration::from_secs(2))
            .rate_limit(RateLimitConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
                ..RateLimitConfig::default()
            });
        let options = DemoOptions {
            seed: 3,
            churn_interval: Duration::from_millis(5),
            failure_rate: 0.2,
        };

        let stopper = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.initiate(converge_core::ShutdownReason::Programmatic).await;
        });

        let totals = tokio::time::timeout(Duration::from_secs(5), run(config, options, Arc::clone(&coordinator))).await;
        assert!(matches!(totals, Ok(Ok(t)) if t.done > 0));
        assert_eq!(coordinator.phase().await, ShutdownPhase::Complete);
    }
}
