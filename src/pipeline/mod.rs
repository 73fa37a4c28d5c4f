//! Handler pipelines: a user handler plus declared middleware, compiled
//! into a linked chain and driven per request.

mod middleware;

pub use middleware::{
    CircuitBreakerMiddleware, FallbackMiddleware, InboxMiddleware, LoggingMiddleware,
    OnceOnlyAction, RetryMiddleware, ValidationFailure, ValidationMiddleware,
};

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

use crate::error::DispatchError;
use crate::request::{Request, RequestContext};

/// A link in a handler chain. User handlers implement this directly;
/// middleware implements it around a `next` link captured at build time.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(
        &self,
        request: R,
        ctx: &RequestContext,
    ) -> Result<R, DispatchError>;
}

/// Whether a middleware link runs on the way in to the user handler or on
/// the way out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepTiming {
    Before,
    After,
}

type HandlerFactory<R> =
    Arc<dyn Fn() -> Result<Arc<dyn RequestHandler<R>>, DispatchError> + Send + Sync>;

type MiddlewareFactory<R> = Arc<
    dyn Fn(Arc<dyn RequestHandler<R>>) -> Result<Arc<dyn RequestHandler<R>>, DispatchError>
        + Send
        + Sync,
>;

/// Declares one middleware link: an ordering step, a timing, and a factory
/// that wraps the next link.
#[derive(Clone)]
pub struct MiddlewareDescriptor<R: Request> {
    name: &'static str,
    step: i32,
    timing: StepTiming,
    factory: MiddlewareFactory<R>,
}

impl<R: Request> MiddlewareDescriptor<R> {
    pub fn new<F>(name: &'static str, step: i32, timing: StepTiming, factory: F) -> Self
    where
        F: Fn(Arc<dyn RequestHandler<R>>) -> Result<Arc<dyn RequestHandler<R>>, DispatchError>
            + Send
            + Sync
            + 'static,
    {
        Self { name, step, timing, factory: Arc::new(factory) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Validated build order for one registration: indices into the middleware
/// list, in execution order.
#[derive(Debug, Clone)]
struct ChainPlan {
    before: Vec<usize>,
    after: Vec<usize>,
}

/// One handler registered for a request type: the handler factory plus its
/// declared middleware. The validated chain order is computed once; chain
/// instances are built fresh per request since handlers may be stateful.
pub struct HandlerRegistration<R: Request> {
    name: &'static str,
    factory: HandlerFactory<R>,
    middleware: Vec<MiddlewareDescriptor<R>>,
    plan: OnceLock<Result<ChainPlan, String>>,
}

impl<R: Request> HandlerRegistration<R> {
    pub fn new<H, F>(name: &'static str, factory: F) -> Self
    where
        H: RequestHandler<R> + 'static,
        F: Fn() -> Result<Arc<H>, DispatchError> + Send + Sync + 'static,
    {
        let factory: HandlerFactory<R> = Arc::new(move || {
            factory().map(|handler| {
                let handler: Arc<dyn RequestHandler<R>> = handler;
                handler
            })
        });
        Self { name, factory, middleware: Vec::new(), plan: OnceLock::new() }
    }

    /// Register a shared handler instance; every chain reuses it.
    pub fn of_instance(name: &'static str, handler: Arc<dyn RequestHandler<R>>) -> Self {
        let factory: HandlerFactory<R> = Arc::new(move || Ok(handler.clone()));
        Self { name, factory, middleware: Vec::new(), plan: OnceLock::new() }
    }

    /// Attach middleware declarations. Order in the vector is declaration
    /// order, which breaks step ties.
    pub fn with_middleware(mut self, middleware: Vec<MiddlewareDescriptor<R>>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn plan(&self) -> Result<&ChainPlan, DispatchError> {
        match self.plan.get_or_init(|| compute_plan(&self.middleware)) {
            Ok(plan) => Ok(plan),
            Err(msg) => Err(DispatchError::configuration(msg.clone())),
        }
    }

    /// Compile this registration into a runnable chain:
    /// before-middleware ascending by step, the handler, then
    /// after-middleware descending by step.
    pub fn build_chain(&self) -> Result<Arc<dyn RequestHandler<R>>, DispatchError> {
        let plan = self.plan()?;
        let target = (self.factory)().map_err(|e| {
            DispatchError::configuration(format!("handler factory for {} failed: {e}", self.name))
        })?;

        // Link back-to-front so each factory receives its successor.
        let mut next: Arc<dyn RequestHandler<R>> = Arc::new(TerminalStep);
        for idx in plan.after.iter().rev() {
            next = (self.middleware[*idx].factory)(next)?;
        }
        let mut chain: Arc<dyn RequestHandler<R>> =
            Arc::new(TargetStep { handler: target, next });
        for idx in plan.before.iter().rev() {
            chain = (self.middleware[*idx].factory)(chain)?;
        }
        Ok(chain)
    }
}

fn compute_plan<R: Request>(middleware: &[MiddlewareDescriptor<R>]) -> Result<ChainPlan, String> {
    let mut before: Vec<usize> = Vec::new();
    let mut after: Vec<usize> = Vec::new();
    for (idx, descriptor) in middleware.iter().enumerate() {
        match descriptor.timing {
            StepTiming::Before => before.push(idx),
            StepTiming::After => after.push(idx),
        }
    }

    check_duplicates(middleware, &before, "before")?;
    check_duplicates(middleware, &after, "after")?;

    before.sort_by_key(|&idx| middleware[idx].step);
    after.sort_by(|&a, &b| middleware[b].step.cmp(&middleware[a].step));

    Ok(ChainPlan { before, after })
}

fn check_duplicates<R: Request>(
    middleware: &[MiddlewareDescriptor<R>],
    bucket: &[usize],
    timing: &str,
) -> Result<(), String> {
    for (i, &a) in bucket.iter().enumerate() {
        for &b in &bucket[i + 1..] {
            if middleware[a].step == middleware[b].step {
                return Err(format!(
                    "duplicate middleware step {} at {timing} ({} and {})",
                    middleware[a].step, middleware[a].name, middleware[b].name
                ));
            }
        }
    }
    Ok(())
}

/// Tail of every chain: hands the request back unchanged.
struct TerminalStep;

#[async_trait]
impl<R: Request> RequestHandler<R> for TerminalStep {
    async fn handle(&self, request: R, _ctx: &RequestContext) -> Result<R, DispatchError> {
        Ok(request)
    }
}

/// Wraps the user handler so the after-chain still runs once it returns.
struct TargetStep<R: Request> {
    handler: Arc<dyn RequestHandler<R>>,
    next: Arc<dyn RequestHandler<R>>,
}

#[async_trait]
impl<R: Request> RequestHandler<R> for TargetStep<R> {
    async fn handle(&self, request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let request = self.handler.handle(request, ctx).await?;
        self.next.handle(request, ctx).await
    }
}
