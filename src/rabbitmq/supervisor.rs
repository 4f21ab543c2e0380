// src/rabbitmq/supervisor.rs
// Runs several handler loops side by side and collects how each one ended

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::amqp_client::Acknowledge;
use super::consumer::{run_handler, HandlerError, Incoming};
use super::errors::{RabbitMQError, Result};
use super::subscription::DeliveryStream;

/// What happens to the other subscriptions when one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// A failing subscription ends alone.
    #[default]
    Isolate,
    /// The first failure cancels every other subscription.
    CancelAll,
}

#[derive(Debug)]
pub struct SubscriptionOutcome {
    pub name: String,
    /// Number of deliveries handled, or why the loop stopped.
    pub result: Result<u64>,
}

pub struct SubscriptionSupervisor {
    root: CancellationToken,
    policy: FailurePolicy,
    tasks: JoinSet<SubscriptionOutcome>,
    names: HashMap<Id, String>,
}

impl SubscriptionSupervisor {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            root: CancellationToken::new(),
            policy,
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// A token for `subscribe` that is cancelled on `shutdown`, or on the
    /// first failure under `FailurePolicy::CancelAll`.
    pub fn token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `handler` over `stream` on its own task.
    pub fn spawn<D, F, Fut>(
        &mut self,
        name: impl Into<String>,
        stream: DeliveryStream<D>,
        auto_ack: bool,
        handler: F,
    ) where
        D: Acknowledge,
        F: FnMut(Incoming) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let stop = self.root.child_token();
        let task_name = name.clone();

        let handle = self.tasks.spawn(async move {
            let result = run_handler(stream, stop, auto_ack, handler).await;
            SubscriptionOutcome {
                name: task_name,
                result,
            }
        });

        info!(subscription = %name, "Subscription task spawned");
        self.names.insert(handle.id(), name);
    }

    /// Ask every subscription to stop. `join` still has to be awaited.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Wait for the next subscription to finish. `None` once all have.
    pub async fn join_next(&mut self) -> Option<SubscriptionOutcome> {
        let joined = self.tasks.join_next_with_id().await?;

        let outcome = match joined {
            Ok((id, outcome)) => {
                self.names.remove(&id);
                outcome
            }
            Err(e) => {
                let name = self
                    .names
                    .remove(&e.id())
                    .unwrap_or_else(|| "unknown".to_string());
                error!(subscription = %name, error = %e, "Subscription task aborted");
                SubscriptionOutcome {
                    name,
                    result: Err(RabbitMQError::SubscribeError(format!(
                        "subscription task failed: {}",
                        e
                    ))),
                }
            }
        };

        if let Err(e) = &outcome.result {
            warn!(subscription = %outcome.name, error = %e, "Subscription ended with error");
            if self.policy == FailurePolicy::CancelAll && !self.root.is_cancelled() {
                info!("Cancelling remaining subscriptions");
                self.root.cancel();
            }
        }
        Some(outcome)
    }

    /// Wait for every subscription to finish, in completion order.
    pub async fn join(mut self) -> Vec<SubscriptionOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        while let Some(outcome) = self.join_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Default for SubscriptionSupervisor {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}
