//! Rate-limited, retrying invocation of fallible async operations.

use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use opsdeck_core::{TelemetryBus, TelemetryPublisher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Backoff, BackoffPolicy, RateLimiter};

/// Failure of an invoked operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvokeError<E> {
    /// Admission was refused; the operation was not (re)attempted.
    #[error("rate limit exceeded for {resource}, retry after {retry_after:?}")]
    RateLimitExceeded {
        resource: String,
        retry_after: Duration,
    },

    /// The operation's own error from its final attempt.
    #[error("{0}")]
    Operation(E),
}

impl<E> InvokeError<E> {
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// The operation error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::RateLimitExceeded { .. } => None,
        }
    }
}

/// Invoker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Sleep out a refused admission once before giving up, instead of
    /// failing immediately.
    pub wait_on_limit: bool,
    pub backoff: BackoffPolicy,
}

/// Runs operations through a shared [`RateLimiter`] with per-resource
/// exponential backoff between retries.
#[derive(Debug)]
pub struct ResilientInvoker {
    limiter: Arc<RateLimiter>,
    config: InvokerConfig,
    backoffs: Mutex<HashMap<String, Arc<Backoff>>>,
    telemetry: Option<TelemetryPublisher>,
}

impl ResilientInvoker {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, config: InvokerConfig) -> Self {
        Self {
            limiter,
            config,
            backoffs: Mutex::new(HashMap::new()),
            telemetry: None,
        }
    }

    /// Report retries and refused admissions on `bus` under the `invoker` source.
    #[must_use]
    pub fn with_telemetry(mut self, bus: &TelemetryBus) -> Self {
        self.telemetry = Some(bus.publisher("invoker"));
        self
    }

    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub const fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Backoff state shared by every caller of `resource`.
    #[must_use]
    pub fn backoff(&self, resource: &str) -> Arc<Backoff> {
        let mut backoffs = self
            .backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            backoffs
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Backoff::new(self.config.backoff))),
        )
    }

    /// Run `operation` with up to `max_retries` retries after the first attempt.
    ///
    /// # Errors
    /// [`InvokeError::RateLimitExceeded`] if any attempt is refused admission,
    /// otherwise the operation's last error once retries are exhausted.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        resource: &str,
        max_retries: u32,
        operation: F,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.invoke_with(resource, max_retries, |_| true, operation)
            .await
    }

    /// Like [`Self::invoke`], retrying only errors accepted by `should_retry`.
    ///
    /// # Errors
    /// See [`Self::invoke`]. A rejected error is returned without retrying.
    pub async fn invoke_with<T, E, F, Fut, R>(
        &self,
        resource: &str,
        max_retries: u32,
        should_retry: R,
        mut operation: F,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let backoff = self.backoff(resource);
        let mut retries = 0u32;

        loop {
            self.admit::<E>(resource).await?;

            match operation().await {
                Ok(value) => {
                    backoff.reset();
                    return Ok(value);
                }
                Err(e) if retries < max_retries && should_retry(&e) => {
                    let delay = backoff.next_delay();
                    retries += 1;
                    tracing::warn!(
                        resource,
                        attempt = retries,
                        max_retries,
                        ?delay,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    if let Some(ref telemetry) = self.telemetry {
                        telemetry.warning(format!(
                            "{resource} failed ({e}), retry {retries}/{max_retries} in {delay:?}"
                        ));
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        resource,
                        attempts = retries + 1,
                        error = %e,
                        "Operation failed"
                    );
                    return Err(InvokeError::Operation(e));
                }
            }
        }
    }

    async fn admit<E>(&self, resource: &str) -> Result<(), InvokeError<E>> {
        if self.limiter.is_allowed(resource) {
            return Ok(());
        }

        if self.config.wait_on_limit {
            let wait = self.limiter.wait_time(resource);
            tracing::debug!(resource, ?wait, "Waiting for rate limit window");
            tokio::time::sleep(wait).await;
            if self.limiter.is_allowed(resource) {
                return Ok(());
            }
        }

        let retry_after = self.limiter.wait_time(resource);
        tracing::warn!(resource, ?retry_after, "Rate limit exceeded");
        if let Some(ref telemetry) = self.telemetry {
            telemetry.warning(format!("rate limit exceeded for {resource}, retry after {retry_after:?}"));
        }
        Err(InvokeError::RateLimitExceeded {
            resource: resource.to_string(),
            retry_after,
        })
    }
}
