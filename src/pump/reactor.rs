//! Reactor pump: one dedicated OS thread per channel, driving the pump on a
//! current-thread runtime. Same semantics as running the pump as a task,
//! with strictly blocking execution; stop it with the quit sentinel.

use crate::channel::Channel;
use crate::error::DispatchError;
use crate::pump::MessagePump;
use crate::request::Request;

#[derive(Debug, thiserror::Error)]
#[error("message pump thread panicked")]
struct PumpThreadPanicked;

/// Spawns pumps onto dedicated threads.
pub struct Reactor;

impl Reactor {
    /// Run the pump on its own named thread. The thread owns the channel
    /// and a current-thread runtime; it exits when the pump does.
    pub fn spawn<R: Request + Clone>(
        pump: MessagePump<R>,
        channel: Box<dyn Channel>,
    ) -> Result<ReactorHandle, DispatchError> {
        let name = format!("courier-pump-{}", channel.topic());
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(DispatchError::app)?;
                runtime.block_on(pump.run(channel))
            })
            .map_err(DispatchError::app)?;
        Ok(ReactorHandle { thread })
    }
}

/// Join handle for a reactor pump thread.
pub struct ReactorHandle {
    thread: std::thread::JoinHandle<Result<(), DispatchError>>,
}

impl ReactorHandle {
    /// Block until the pump exits and return its outcome.
    pub fn join(self) -> Result<(), DispatchError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(DispatchError::app(PumpThreadPanicked)),
        }
    }

    /// Whether the pump thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}
