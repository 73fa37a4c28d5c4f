//! Named resilience policies and the registry middleware resolves them from.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::{ChannelError, DispatchError};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Well-known policy name: dispatch retry.
pub const RETRY_POLICY: &str = "RETRYPOLICY";
/// Well-known policy name: cooperative dispatch retry.
pub const RETRY_POLICY_ASYNC: &str = "RETRYPOLICYASYNC";
/// Well-known policy name: producer circuit breaker.
pub const CIRCUIT_BREAKER: &str = "CIRCUITBREAKER";
/// Well-known policy name: cooperative producer circuit breaker.
pub const CIRCUIT_BREAKER_ASYNC: &str = "CIRCUITBREAKERASYNC";

/// Failure while executing an operation under a policy.
#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    /// The circuit breaker refused the call.
    #[error("circuit open ({failures} failures, open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },
    /// Every retry attempt failed.
    #[error("retry exhausted after {attempts} attempts")]
    RetryExhausted { attempts: usize, failures: Vec<DispatchError> },
    /// The operation itself failed.
    #[error(transparent)]
    Inner(DispatchError),
}

impl PolicyError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PolicyError::CircuitOpen { .. })
    }

    /// Collapse into the dispatch taxonomy: open circuits become channel
    /// failures, exhaustion surfaces its last underlying error.
    pub fn into_dispatch(self) -> DispatchError {
        match self {
            PolicyError::CircuitOpen { failures, open_for } => {
                DispatchError::Channel(ChannelError::CircuitOpen { failures, open_for })
            }
            PolicyError::RetryExhausted { attempts, mut failures } => {
                failures.pop().unwrap_or_else(|| {
                    DispatchError::configuration(format!(
                        "retry exhausted after {attempts} attempts with no recorded failure"
                    ))
                })
            }
            PolicyError::Inner(e) => e,
        }
    }
}

/// A named policy: retry, circuit breaker, or a pass-through.
#[derive(Clone, Debug)]
pub enum ResiliencePolicy {
    Retry(RetryPolicy),
    Breaker(CircuitBreakerPolicy),
    /// Runs the operation once, unprotected.
    NoOp,
}

impl ResiliencePolicy {
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        match self {
            ResiliencePolicy::Retry(retry) => retry.execute(operation).await,
            ResiliencePolicy::Breaker(breaker) => breaker.execute(operation).await,
            ResiliencePolicy::NoOp => operation().await,
        }
    }

    /// The breaker inside, when this policy is one.
    pub fn as_breaker(&self) -> Option<&CircuitBreakerPolicy> {
        match self {
            ResiliencePolicy::Breaker(b) => Some(b),
            _ => None,
        }
    }
}

/// Registry of named policies. Written during startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, ResiliencePolicy>,
}

impl PolicyRegistry {
    /// An empty registry. Resolving any name fails until policies are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the well-known names: a default retry under
    /// both retry keys and one shared circuit breaker under both breaker
    /// keys.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let retry = RetryPolicy::default();
        registry.add(RETRY_POLICY, ResiliencePolicy::Retry(retry.clone()));
        registry.add(RETRY_POLICY_ASYNC, ResiliencePolicy::Retry(retry));
        let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
        registry.add(CIRCUIT_BREAKER, ResiliencePolicy::Breaker(breaker.clone()));
        registry.add(CIRCUIT_BREAKER_ASYNC, ResiliencePolicy::Breaker(breaker));
        registry
    }

    /// Register or replace a policy under `name`.
    pub fn add(&mut self, name: impl Into<String>, policy: ResiliencePolicy) -> &mut Self {
        self.policies.insert(name.into(), policy);
        self
    }

    /// Resolve a policy. Policies are cheap to clone; breaker clones share
    /// their state.
    pub fn get(&self, name: &str) -> Option<ResiliencePolicy> {
        self.policies.get(name).cloned()
    }

    /// Resolve a policy that middleware or the mediator requires to exist.
    pub fn require(&self, name: &str) -> Result<ResiliencePolicy, DispatchError> {
        self.get(name)
            .ok_or_else(|| DispatchError::configuration(format!("no policy registered as {name}")))
    }

    /// Registered names, sorted, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }
}
