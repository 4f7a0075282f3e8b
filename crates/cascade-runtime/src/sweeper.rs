use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cascade_core::error::Result;

use crate::driver::{InstanceContext, PersistentDriver};
use crate::repository::StateRepository;

/// Configuration for the timeout sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to look for expired signal waits. Clamped to
    /// [10 seconds, 24 hours] at run time.
    pub check_interval: Duration,
    /// Maximum instances cancelled per sweep.
    pub max_batch_size: usize,
    /// Pause after a failed repository query before trying again.
    pub query_backoff: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            max_batch_size: 100,
            query_backoff: Duration::from_secs(60),
        }
    }
}

impl SweeperConfig {
    /// The effective polling interval.
    pub fn clamped_interval(&self) -> Duration {
        self.check_interval
            .clamp(Duration::from_secs(10), Duration::from_secs(86400))
    }
}

/// Periodic worker that cancels instances whose signal wait has expired.
pub struct TimeoutSweeper<C: InstanceContext> {
    driver: Arc<PersistentDriver<C>>,
    repository: Arc<dyn StateRepository>,
    config: SweeperConfig,
}

impl<C: InstanceContext> TimeoutSweeper<C> {
    /// Create a sweeper over a driver and its repository.
    pub fn new(
        driver: Arc<PersistentDriver<C>>,
        repository: Arc<dyn StateRepository>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            driver,
            repository,
            config,
        }
    }

    /// Run the sweeper until shutdown. The batch in flight completes
    /// before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.clamped_interval());

        tracing::info!(
            check_interval = ?self.config.clamped_interval(),
            max_batch_size = self.config.max_batch_size,
            "Timeout sweeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Signal timeout sweep failed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.query_backoff) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Timeout sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// One sweep: cancel every expired signal wait, up to the batch cap.
    /// Returns the number of instances cancelled.
    pub async fn sweep_once(&self) -> Result<usize> {
        let expired = self
            .repository
            .query_waiting_with_timeout(Utc::now(), self.config.max_batch_size)
            .await?;

        let mut cancelled = 0;
        for state in expired {
            let signal = state.waiting_for_signal.clone().unwrap_or_default();
            let reason = format!("Timed out waiting for signal: {}", signal);

            match self.driver.cancel(state.instance_id, &reason).await {
                Ok(true) => {
                    cancelled += 1;
                    tracing::info!(
                        instance_id = %state.instance_id,
                        signal = %signal,
                        "Cancelled instance after signal timeout"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    // One bad instance never aborts the batch.
                    tracing::error!(
                        instance_id = %state.instance_id,
                        error = %e,
                        "Failed to cancel timed-out instance"
                    );
                }
            }
        }

        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::repository::InMemoryStateRepository;
    use crate::state::InstanceStatus;
    use cascade_core::definition::WorkflowDefinition;
    use cascade_core::engine::Engine;
    use cascade_core::node::Node;
    use cascade_core::resolver::StepRegistry;
    use cascade_core::step::{StepFuture, StepOutcome, WorkflowStep};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Default)]
    struct EmptyContext;

    impl InstanceContext for EmptyContext {
        fn apply_signal(&self, _signal: &str, _payload: serde_json::Value) {}
    }

    struct WaitStep;

    impl WorkflowStep<EmptyContext> for WaitStep {
        fn name(&self) -> &str {
            "wait"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a EmptyContext,
            _cancel: &'a tokio_util::sync::CancellationToken,
        ) -> StepFuture<'a> {
            Box::pin(async { StepOutcome::suspend("approval") })
        }
    }

    fn waiting_driver(
        repository: Arc<InMemoryStateRepository>,
    ) -> Arc<PersistentDriver<EmptyContext>> {
        let mut registry = StepRegistry::new();
        registry.register("wait", WaitStep);
        Arc::new(
            PersistentDriver::new(Engine::new(Arc::new(registry)), repository).with_config(
                DriverConfig {
                    default_signal_timeout: Duration::ZERO,
                },
            ),
        )
    }

    #[test]
    fn test_interval_clamping() {
        let tight = SweeperConfig {
            check_interval: Duration::from_secs(1),
            ..SweeperConfig::default()
        };
        assert_eq!(tight.clamped_interval(), Duration::from_secs(10));

        let loose = SweeperConfig {
            check_interval: Duration::from_secs(200_000),
            ..SweeperConfig::default()
        };
        assert_eq!(loose.clamped_interval(), Duration::from_secs(86400));

        assert_eq!(
            SweeperConfig::default().clamped_interval(),
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_sweep_cancels_expired_instances() {
        let repository = Arc::new(InMemoryStateRepository::new());
        let driver = waiting_driver(repository.clone());

        let definition = Arc::new(WorkflowDefinition::new("wf.wait", "Wait", || {
            Node::step("wait")
        }));
        let instance_id = driver
            .start(definition, Arc::new(EmptyContext), None)
            .await
            .unwrap();

        let state = driver.get_status(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::WaitingForSignal);

        let sweeper = TimeoutSweeper::new(driver.clone(), repository, SweeperConfig::default());
        let cancelled = sweeper.sweep_once().await.unwrap();
        assert_eq!(cancelled, 1);

        let state = driver.get_status(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Cancelled);

        // Nothing left to sweep.
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_unexpired_instances_alone() {
        let repository = Arc::new(InMemoryStateRepository::new());

        let mut registry = StepRegistry::new();
        registry.register("wait", WaitStep);
        let driver = Arc::new(PersistentDriver::new(
            Engine::new(Arc::new(registry)),
            repository.clone() as Arc<dyn StateRepository>,
        ));

        let definition = Arc::new(WorkflowDefinition::new("wf.wait", "Wait", || {
            Node::step("wait")
        }));
        let instance_id = driver
            .start(definition, Arc::new(EmptyContext), None)
            .await
            .unwrap();

        let sweeper = TimeoutSweeper::new(
            driver.clone(),
            repository,
            SweeperConfig::default(),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let state = driver.get_status(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::WaitingForSignal);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let repository = Arc::new(InMemoryStateRepository::new());
        let driver = waiting_driver(repository.clone());
        let sweeper = TimeoutSweeper::new(driver, repository, SweeperConfig::default());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // Returns promptly instead of waiting out the interval.
        sweeper.run(shutdown).await;
    }
}
