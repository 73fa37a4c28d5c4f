//! Deferred dispatch: schedule a request to be sent, published, or posted
//! later, through a pluggable scheduler backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::DispatchError;
use crate::request::{Request, RequestId, RequestKind};

/// Opaque handle for a scheduled firing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchedulerId(String);

impl SchedulerId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which processor operation fires when the schedule comes due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchKind {
    Send,
    Publish,
    Post,
}

/// When a schedule comes due.
#[derive(Clone, Copy, Debug)]
pub enum ScheduleTime {
    At(DateTime<Utc>),
    Delay(Duration),
}

impl ScheduleTime {
    /// The wait from `now`; times already past fire immediately.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            ScheduleTime::Delay(d) => *d,
            ScheduleTime::At(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Type-erased deferred operation. The processor builds these around the
/// concrete request type; backends only store and hand them back.
#[async_trait]
pub(crate) trait ErasedDispatch: Send + Sync {
    async fn dispatch(
        &self,
        kind: DispatchKind,
        processor: &crate::processor::CommandProcessor,
    ) -> Result<(), DispatchError>;
}

/// The wrapper request a scheduler fires. Handled like any other command:
/// its registered handler re-enters the processor with the real request, so
/// scheduler backends stay oblivious to dispatch internals.
#[derive(Clone)]
pub struct FireScheduledRequest {
    id: RequestId,
    kind: DispatchKind,
    pub(crate) dispatch: Arc<dyn ErasedDispatch>,
}

impl FireScheduledRequest {
    pub(crate) fn new(kind: DispatchKind, dispatch: Arc<dyn ErasedDispatch>) -> Self {
        Self { id: RequestId::random(), kind, dispatch }
    }

    pub fn dispatch_kind(&self) -> DispatchKind {
        self.kind
    }
}

impl fmt::Debug for FireScheduledRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FireScheduledRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Request for FireScheduledRequest {
    fn id(&self) -> &RequestId {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Command
    }
}

/// Where a scheduler delivers due requests. Bound explicitly after the
/// processor is built; no process-wide statics.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn fire(&self, request: FireScheduledRequest) -> Result<(), DispatchError>;
}

/// A scheduler backend: at-least-once firing, idempotent cancel.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Attach the sink due requests fire into.
    fn bind(&self, sink: Arc<dyn DispatchSink>);

    async fn schedule(
        &self,
        request: FireScheduledRequest,
        when: ScheduleTime,
    ) -> Result<SchedulerId, DispatchError>;

    /// Move a pending schedule. Returns false when the id is unknown or the
    /// schedule already fired.
    async fn reschedule(
        &self,
        id: &SchedulerId,
        when: ScheduleTime,
    ) -> Result<bool, DispatchError>;

    /// Drop a pending schedule. Idempotent: cancelling twice, or after the
    /// firing, returns false.
    async fn cancel(&self, id: &SchedulerId) -> Result<bool, DispatchError>;
}

struct PendingJob {
    request: FireScheduledRequest,
    handle: tokio::task::JoinHandle<()>,
}

type SharedSink = Arc<RwLock<Option<Arc<dyn DispatchSink>>>>;
type SharedJobs = Arc<Mutex<HashMap<SchedulerId, PendingJob>>>;

/// Timer-based scheduler for tests and single-process use. Each schedule is
/// a tokio task sleeping until due.
#[derive(Default)]
pub struct InMemoryScheduler {
    sink: SharedSink,
    jobs: SharedJobs,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending (not yet fired, not cancelled) schedule count.
    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    fn spawn(
        sink: &SharedSink,
        jobs: &SharedJobs,
        id: &SchedulerId,
        request: FireScheduledRequest,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let sink = sink.clone();
        let jobs = jobs.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Remove first: a cancel racing the firing sees "already fired".
            jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&id);
            let bound = sink.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
            match bound {
                Some(sink) => {
                    if let Err(e) = sink.fire(request).await {
                        tracing::warn!(schedule_id = %id, error = %e, "scheduled firing failed");
                    }
                }
                None => {
                    tracing::warn!(schedule_id = %id, "schedule came due with no sink bound");
                }
            }
        })
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    fn bind(&self, sink: Arc<dyn DispatchSink>) {
        *self.sink.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    async fn schedule(
        &self,
        request: FireScheduledRequest,
        when: ScheduleTime,
    ) -> Result<SchedulerId, DispatchError> {
        let id = SchedulerId::random();
        let delay = when.delay_from(Utc::now());
        tracing::debug!(schedule_id = %id, delay = ?delay, "request scheduled");
        // Insert under the lock the firing task must take to remove itself,
        // so a zero-delay firing cannot race the insert.
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let handle = Self::spawn(&self.sink, &self.jobs, &id, request.clone(), delay);
        jobs.insert(id.clone(), PendingJob { request, handle });
        Ok(id)
    }

    async fn reschedule(
        &self,
        id: &SchedulerId,
        when: ScheduleTime,
    ) -> Result<bool, DispatchError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(job) = jobs.remove(id) else {
            return Ok(false);
        };
        job.handle.abort();
        let delay = when.delay_from(Utc::now());
        tracing::debug!(schedule_id = %id, delay = ?delay, "request rescheduled");
        let handle = Self::spawn(&self.sink, &self.jobs, id, job.request.clone(), delay);
        jobs.insert(id.clone(), PendingJob { request: job.request, handle });
        Ok(true)
    }

    async fn cancel(&self, id: &SchedulerId) -> Result<bool, DispatchError> {
        let job = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(id);
        match job {
            Some(job) => {
                job.handle.abort();
                tracing::debug!(schedule_id = %id, "schedule cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::CommandProcessor;

    struct NoopDispatch;

    #[async_trait]
    impl ErasedDispatch for NoopDispatch {
        async fn dispatch(
            &self,
            _kind: DispatchKind,
            _processor: &CommandProcessor,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        fired: Arc<Mutex<Vec<DispatchKind>>>,
    }

    #[async_trait]
    impl DispatchSink for CountingSink {
        async fn fire(&self, request: FireScheduledRequest) -> Result<(), DispatchError> {
            self.fired
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(request.dispatch_kind());
            Ok(())
        }
    }

    fn wrapper(kind: DispatchKind) -> FireScheduledRequest {
        FireScheduledRequest::new(kind, Arc::new(NoopDispatch))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn due_schedules_fire_into_the_sink() {
        let scheduler = InMemoryScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        scheduler.bind(Arc::new(CountingSink { fired: fired.clone() }));

        scheduler
            .schedule(wrapper(DispatchKind::Send), ScheduleTime::Delay(Duration::from_millis(20)))
            .await
            .unwrap();

        wait_for(|| !fired.lock().unwrap().is_empty()).await;
        assert_eq!(*fired.lock().unwrap(), vec![DispatchKind::Send]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn absolute_times_in_the_past_fire_immediately() {
        let scheduler = InMemoryScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        scheduler.bind(Arc::new(CountingSink { fired: fired.clone() }));

        scheduler
            .schedule(
                wrapper(DispatchKind::Publish),
                ScheduleTime::At(Utc::now() - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();

        wait_for(|| !fired.lock().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn cancel_prevents_the_firing_and_is_idempotent() {
        let scheduler = InMemoryScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        scheduler.bind(Arc::new(CountingSink { fired: fired.clone() }));

        let id = scheduler
            .schedule(wrapper(DispatchKind::Send), ScheduleTime::Delay(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(scheduler.cancel(&id).await.unwrap());
        assert!(!scheduler.cancel(&id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_moves_the_due_time() {
        let scheduler = InMemoryScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        scheduler.bind(Arc::new(CountingSink { fired: fired.clone() }));

        let id = scheduler
            .schedule(wrapper(DispatchKind::Send), ScheduleTime::Delay(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(scheduler
            .reschedule(&id, ScheduleTime::Delay(Duration::from_millis(200)))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.lock().unwrap().is_empty(), "fired at the old due time");

        wait_for(|| !fired.lock().unwrap().is_empty()).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rescheduling_an_unknown_id_reports_false() {
        let scheduler = InMemoryScheduler::new();
        let unknown = SchedulerId::random();
        assert!(!scheduler
            .reschedule(&unknown, ScheduleTime::Delay(Duration::ZERO))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn firing_without_a_bound_sink_is_survivable() {
        let scheduler = InMemoryScheduler::new();
        scheduler
            .schedule(wrapper(DispatchKind::Send), ScheduleTime::Delay(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(scheduler.pending(), 0);
    }
}
