//! Stock middleware for handler chains.

use async_trait::async_trait;
use serde::Serialize;
use std::any::type_name;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::inbox::Inbox;
use crate::pipeline::{MiddlewareDescriptor, RequestHandler, StepTiming};
use crate::policy::{PolicyError, PolicyRegistry};
use crate::request::{Request, RequestContext};

/// Runs the rest of the chain under a named retry policy.
pub struct RetryMiddleware<R: Request + Clone> {
    policy_name: String,
    policies: Arc<PolicyRegistry>,
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request + Clone> RetryMiddleware<R> {
    pub fn descriptor(
        step: i32,
        policies: Arc<PolicyRegistry>,
        policy_name: impl Into<String>,
    ) -> MiddlewareDescriptor<R> {
        let policy_name = policy_name.into();
        MiddlewareDescriptor::new("retry", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> = Arc::new(RetryMiddleware {
                policy_name: policy_name.clone(),
                policies: policies.clone(),
                next,
            });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for RetryMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let policy = self.policies.require(&self.policy_name)?;
        let next = self.next.clone();
        let ctx = ctx.clone();
        policy
            .execute(move || {
                let next = next.clone();
                let ctx = ctx.clone();
                let request = request.clone();
                async move { next.handle(request, &ctx).await.map_err(PolicyError::Inner) }
            })
            .await
            .map_err(PolicyError::into_dispatch)
    }
}

/// Runs the rest of the chain behind a named circuit breaker. The breaker
/// instance lives in the policy registry, so every pipeline resolving the
/// same name shares one circuit.
pub struct CircuitBreakerMiddleware<R: Request + Clone> {
    policy_name: String,
    policies: Arc<PolicyRegistry>,
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request + Clone> CircuitBreakerMiddleware<R> {
    pub fn descriptor(
        step: i32,
        policies: Arc<PolicyRegistry>,
        policy_name: impl Into<String>,
    ) -> MiddlewareDescriptor<R> {
        let policy_name = policy_name.into();
        MiddlewareDescriptor::new("circuit-breaker", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> = Arc::new(CircuitBreakerMiddleware {
                policy_name: policy_name.clone(),
                policies: policies.clone(),
                next,
            });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for CircuitBreakerMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let policy = self.policies.require(&self.policy_name)?;
        let next = self.next.clone();
        let ctx = ctx.clone();
        policy
            .execute(move || {
                let next = next.clone();
                let ctx = ctx.clone();
                let request = request.clone();
                async move { next.handle(request, &ctx).await.map_err(PolicyError::Inner) }
            })
            .await
            .map_err(PolicyError::into_dispatch)
    }
}

/// Emits a debug event on the way in and logs the outcome on the way out.
pub struct LoggingMiddleware<R: Request> {
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request> LoggingMiddleware<R> {
    pub fn descriptor(step: i32) -> MiddlewareDescriptor<R> {
        MiddlewareDescriptor::new("logging", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> = Arc::new(LoggingMiddleware { next });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request> RequestHandler<R> for LoggingMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let request_id = request.id().clone();
        tracing::debug!(request_id = %request_id, request_type = type_name::<R>(), "handling");
        match self.next.handle(request, ctx).await {
            Ok(request) => {
                tracing::debug!(request_id = %request_id, "handled");
                Ok(request)
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "handling failed");
                Err(e)
            }
        }
    }
}

/// Error produced when a validation gate rejects a request.
#[derive(thiserror::Error, Debug)]
#[error("validation failed: {0}")]
pub struct ValidationFailure(pub String);

/// Gates the chain on a predicate over the incoming request.
pub struct ValidationMiddleware<R: Request> {
    validate: Arc<dyn Fn(&R) -> Result<(), String> + Send + Sync>,
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request> ValidationMiddleware<R> {
    pub fn descriptor<F>(step: i32, validate: F) -> MiddlewareDescriptor<R>
    where
        F: Fn(&R) -> Result<(), String> + Send + Sync + 'static,
    {
        let validate: Arc<dyn Fn(&R) -> Result<(), String> + Send + Sync> = Arc::new(validate);
        MiddlewareDescriptor::new("validation", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> =
                Arc::new(ValidationMiddleware { validate: validate.clone(), next });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request> RequestHandler<R> for ValidationMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        if let Err(reason) = (self.validate)(&request) {
            return Err(DispatchError::app(ValidationFailure(reason)));
        }
        self.next.handle(request, ctx).await
    }
}

/// Catches downstream failures matching a predicate and routes them to a
/// fallback instead of the caller.
pub struct FallbackMiddleware<R: Request + Clone> {
    catches: Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>,
    fallback: Arc<dyn Fn(R, DispatchError) -> Result<R, DispatchError> + Send + Sync>,
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request + Clone> FallbackMiddleware<R> {
    /// Fallback for any downstream error.
    pub fn descriptor<F>(step: i32, fallback: F) -> MiddlewareDescriptor<R>
    where
        F: Fn(R, DispatchError) -> Result<R, DispatchError> + Send + Sync + 'static,
    {
        Self::descriptor_catching(step, |_| true, fallback)
    }

    /// Fallback only for errors the predicate accepts (e.g. open circuits).
    pub fn descriptor_catching<C, F>(step: i32, catches: C, fallback: F) -> MiddlewareDescriptor<R>
    where
        C: Fn(&DispatchError) -> bool + Send + Sync + 'static,
        F: Fn(R, DispatchError) -> Result<R, DispatchError> + Send + Sync + 'static,
    {
        let catches: Arc<dyn Fn(&DispatchError) -> bool + Send + Sync> = Arc::new(catches);
        let fallback: Arc<dyn Fn(R, DispatchError) -> Result<R, DispatchError> + Send + Sync> =
            Arc::new(fallback);
        MiddlewareDescriptor::new("fallback", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> = Arc::new(FallbackMiddleware {
                catches: catches.clone(),
                fallback: fallback.clone(),
                next,
            });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for FallbackMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let original = request.clone();
        match self.next.handle(request, ctx).await {
            Ok(request) => Ok(request),
            Err(e) if (self.catches)(&e) => {
                tracing::debug!(error = %e, "routing failure to fallback");
                (self.fallback)(original, e)
            }
            Err(e) => Err(e),
        }
    }
}

/// What to do when the inbox has already seen a request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnceOnlyAction {
    /// Raise `DispatchError::OnceOnly`.
    Throw,
    /// Log a warning and skip the rest of the chain.
    Warn,
}

/// Once-only guard: records request ids in the inbox and refuses (or skips)
/// redeliveries of ids it has seen under the same context key.
pub struct InboxMiddleware<R: Request + Serialize> {
    inbox: Arc<dyn Inbox>,
    context_key: String,
    action: OnceOnlyAction,
    next: Arc<dyn RequestHandler<R>>,
}

impl<R: Request + Serialize> InboxMiddleware<R> {
    pub fn descriptor(
        step: i32,
        inbox: Arc<dyn Inbox>,
        context_key: impl Into<String>,
        action: OnceOnlyAction,
    ) -> MiddlewareDescriptor<R> {
        let context_key = context_key.into();
        MiddlewareDescriptor::new("inbox", step, StepTiming::Before, move |next| {
            let link: Arc<dyn RequestHandler<R>> = Arc::new(InboxMiddleware {
                inbox: inbox.clone(),
                context_key: context_key.clone(),
                action,
                next,
            });
            Ok(link)
        })
    }
}

#[async_trait]
impl<R: Request + Serialize> RequestHandler<R> for InboxMiddleware<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let request_id = request.id().clone();
        if self.inbox.exists(&request_id, &self.context_key).await? {
            return match self.action {
                OnceOnlyAction::Throw => Err(DispatchError::OnceOnly {
                    request_id: request_id.to_string(),
                    context_key: self.context_key.clone(),
                }),
                OnceOnlyAction::Warn => {
                    tracing::warn!(
                        request_id = %request_id,
                        context_key = %self.context_key,
                        "request already handled, skipping"
                    );
                    Ok(request)
                }
            };
        }

        let body = serde_json::to_vec(&request).map_err(|e| DispatchError::MappingFailed {
            type_name: type_name::<R>(),
            reason: e.to_string(),
        })?;
        self.inbox.add(&request_id, &self.context_key, &body).await?;
        self.next.handle(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::inbox::InMemoryInbox;
    use crate::pipeline::HandlerRegistration;
    use crate::policy::{ResiliencePolicy, RETRY_POLICY};
    use crate::request::{RequestId, RequestKind};
    use crate::retry::RetryPolicy;
    use crate::sleeper::InstantSleeper;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Transfer {
        id: RequestId,
    }

    impl Request for Transfer {
        fn id(&self) -> &RequestId {
            &self.id
        }

        fn kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl RequestHandler<Transfer> for FlakyHandler {
        async fn handle(
            &self,
            request: Transfer,
            _ctx: &RequestContext,
        ) -> Result<Transfer, DispatchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(DispatchError::Channel(ChannelError::Io("db hiccup".into())))
            } else {
                Ok(request)
            }
        }
    }

    struct SeenHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestHandler<Transfer> for SeenHandler {
        async fn handle(
            &self,
            request: Transfer,
            _ctx: &RequestContext,
        ) -> Result<Transfer, DispatchError> {
            self.seen.lock().unwrap().push(request.id.to_string());
            Ok(request)
        }
    }

    fn instant_retry_registry(attempts: usize) -> Arc<PolicyRegistry> {
        let mut policies = PolicyRegistry::new();
        policies.add(
            RETRY_POLICY,
            ResiliencePolicy::Retry(
                RetryPolicy::builder().max_attempts(attempts).sleeper(InstantSleeper).build(),
            ),
        );
        Arc::new(policies)
    }

    #[tokio::test]
    async fn retry_middleware_retries_transient_handler_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let reg = HandlerRegistration::new("Flaky", move || {
            Ok(Arc::new(FlakyHandler { calls: handler_calls.clone(), fail_first: 2 }))
        })
        .with_middleware(vec![RetryMiddleware::descriptor(
            1,
            instant_retry_registry(3),
            RETRY_POLICY,
        )]);

        let result = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("t-1") }, &RequestContext::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_middleware_surfaces_last_error_when_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let reg = HandlerRegistration::new("Flaky", move || {
            Ok(Arc::new(FlakyHandler { calls: handler_calls.clone(), fail_first: usize::MAX }))
        })
        .with_middleware(vec![RetryMiddleware::descriptor(
            1,
            instant_retry_registry(2),
            RETRY_POLICY,
        )]);

        let err = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("t-2") }, &RequestContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Channel(ChannelError::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_policy_is_a_configuration_error() {
        let reg = HandlerRegistration::new("Flaky", move || {
            Ok(Arc::new(FlakyHandler { calls: Arc::new(AtomicUsize::new(0)), fail_first: 0 }))
        })
        .with_middleware(vec![RetryMiddleware::descriptor(
            1,
            Arc::new(PolicyRegistry::new()),
            "UNREGISTERED",
        )]);

        let err = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("t-3") }, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn validation_middleware_rejects_bad_requests() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        let reg = HandlerRegistration::new("Seen", move || {
            Ok(Arc::new(SeenHandler { seen: handler_seen.clone() }))
        })
        .with_middleware(vec![ValidationMiddleware::descriptor(1, |t: &Transfer| {
            if t.id.as_str().is_empty() {
                Err("empty id".into())
            } else {
                Ok(())
            }
        })]);

        let err = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("") }, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("validation failed"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fallback_middleware_catches_matching_errors() {
        let reg = HandlerRegistration::new("AlwaysFails", move || {
            Ok(Arc::new(FlakyHandler { calls: Arc::new(AtomicUsize::new(0)), fail_first: usize::MAX }))
        })
        .with_middleware(vec![FallbackMiddleware::descriptor(1, |request: Transfer, _e| {
            Ok(request)
        })]);

        let result = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("t-4") }, &RequestContext::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fallback_middleware_ignores_non_matching_errors() {
        let reg = HandlerRegistration::new("AlwaysFails", move || {
            Ok(Arc::new(FlakyHandler { calls: Arc::new(AtomicUsize::new(0)), fail_first: usize::MAX }))
        })
        .with_middleware(vec![FallbackMiddleware::descriptor_catching(
            1,
            DispatchError::is_circuit_open,
            |request: Transfer, _e| Ok(request),
        )]);

        let err = reg
            .build_chain()
            .unwrap()
            .handle(Transfer { id: RequestId::new("t-5") }, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Channel(ChannelError::Io(_))));
    }

    #[tokio::test]
    async fn inbox_middleware_throws_on_duplicates() {
        let inbox = Arc::new(InMemoryInbox::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        let reg = HandlerRegistration::new("Seen", move || {
            Ok(Arc::new(SeenHandler { seen: handler_seen.clone() }))
        })
        .with_middleware(vec![InboxMiddleware::descriptor(
            1,
            inbox,
            "transfers",
            OnceOnlyAction::Throw,
        )]);

        let chain = reg.build_chain().unwrap();
        let ctx = RequestContext::new();
        chain.handle(Transfer { id: RequestId::new("t-6") }, &ctx).await.unwrap();
        let err =
            chain.handle(Transfer { id: RequestId::new("t-6") }, &ctx).await.unwrap_err();

        assert!(matches!(err, DispatchError::OnceOnly { .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inbox_middleware_warn_skips_quietly() {
        let inbox = Arc::new(InMemoryInbox::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        let reg = HandlerRegistration::new("Seen", move || {
            Ok(Arc::new(SeenHandler { seen: handler_seen.clone() }))
        })
        .with_middleware(vec![InboxMiddleware::descriptor(
            1,
            inbox,
            "transfers",
            OnceOnlyAction::Warn,
        )]);

        let chain = reg.build_chain().unwrap();
        let ctx = RequestContext::new();
        chain.handle(Transfer { id: RequestId::new("t-7") }, &ctx).await.unwrap();
        chain.handle(Transfer { id: RequestId::new("t-7") }, &ctx).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
