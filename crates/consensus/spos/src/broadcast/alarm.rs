//! Cancellable one-shot alarms on the tokio runtime

use crate::errors::{SposError, SposResult};
use core::future::Future;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, trace, Span};

#[derive(Debug, Default)]
struct AlarmState {
    alarms: HashMap<String, (u64, AbortHandle)>,
    next_generation: u64,
    closed: bool,
}

/// Schedules callbacks keyed by alarm id
///
/// Adding an alarm under an id that is already pending replaces it. A fired
/// alarm is removed before its callback runs, so cancelling it afterwards is a
/// no-op.
#[derive(Debug)]
pub struct AlarmScheduler {
    handle: Handle,
    state: Arc<Mutex<AlarmState>>,
    span: Span,
}

impl AlarmScheduler {
    /// Scheduler bound to the current tokio runtime
    pub fn new() -> SposResult<Self> {
        let handle = Handle::try_current().map_err(|_| SposError::NoRuntime)?;
        Ok(Self { handle, state: Arc::default(), span: Span::none() })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run `callback` with the alarm id once `delay` has elapsed
    pub fn add<F, Fut>(&self, id: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let mut state = self.state.lock();
        if state.closed {
            trace!(parent: &self.span, alarm = %id, "Alarm scheduler closed, alarm ignored");
            return;
        }
        state.next_generation += 1;
        let generation = state.next_generation;

        let shared = Arc::clone(&self.state);
        let alarm_id = id.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = {
                let mut state = shared.lock();
                match state.alarms.get(&alarm_id) {
                    Some((current, _)) if *current == generation => {
                        state.alarms.remove(&alarm_id);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                callback(alarm_id).await;
            }
        });

        if let Some((_, previous)) = state.alarms.insert(id.clone(), (generation, task.abort_handle()))
        {
            previous.abort();
        }
        trace!(parent: &self.span, alarm = %id, ?delay, "Alarm set");
    }

    /// Cancel a pending alarm
    pub fn cancel(&self, id: &str) {
        if let Some((_, task)) = self.state.lock().alarms.remove(id) {
            task.abort();
            trace!(parent: &self.span, alarm = %id, "Alarm cancelled");
        }
    }

    /// Whether an alarm is pending under `id`
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.state.lock().alarms.contains_key(id)
    }

    /// Number of pending alarms
    pub fn len(&self) -> usize {
        self.state.lock().alarms.len()
    }

    /// Whether no alarm is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every alarm and refuse new ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let count = state.alarms.len();
        for (_, (_, task)) in state.alarms.drain() {
            task.abort();
        }
        debug!(parent: &self.span, cancelled = count, "Alarm scheduler closed");
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        for (_, (_, task)) in self.state.lock().alarms.drain() {
            task.abort();
        }
    }
}
