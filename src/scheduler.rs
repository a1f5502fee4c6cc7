// File: src/scheduler.rs
//
// Cooperative async task scheduler for the Rill engine.
// Single-threaded: only the owning VM's thread resumes tasks. Tasks are
// sequence instances; each pump of run() drains the continuations that were
// ready when the pump started, FIFO. A task that yields the scheduler's
// pending sentinel is parked until a host completion re-enqueues it through
// its TaskWaker, which is safe to call from any thread. Task failures land
// in a mutex-guarded error queue so one task cannot abort the scheduler;
// the next run() raises the oldest failure.

use crate::errors::ScriptError;
use crate::sequence::{self, SequenceRef};
use crate::value::{ObjectData, ObjectRef, Value};
use crate::vm::VM;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A parked continuation: which sequence to resume, and either the value of
/// its pending yield or a host-injected failure
pub struct TaskResume {
    pub seq: SequenceRef,
    pub send: Result<Value, ScriptError>,
}

/// Handle a host completion uses to wake a parked task. Cloneable and
/// thread-safe; the scheduler itself only ever runs on its owner thread.
#[derive(Clone)]
pub struct TaskWaker {
    ready: Arc<Mutex<VecDeque<TaskResume>>>,
    seq: SequenceRef,
}

impl TaskWaker {
    /// Re-enqueue the task with `value` as the result of its pending yield.
    /// The task runs on a later pump, never inline.
    pub fn complete(&self, value: Value) {
        let mut ready = self.ready.lock().unwrap();
        ready.push_back(TaskResume { seq: self.seq.clone(), send: Ok(value) });
    }

    /// Inject a failure into the parked task; how hosts implement timeouts.
    /// The next pump abandons the task and queues the error.
    pub fn fail(&self, error: ScriptError) {
        let mut ready = self.ready.lock().unwrap();
        ready.push_back(TaskResume { seq: self.seq.clone(), send: Err(error) });
    }
}

/// The per-VM cooperative scheduler state
pub struct Scheduler {
    ready: Arc<Mutex<VecDeque<TaskResume>>>,
    errors: Arc<Mutex<VecDeque<ScriptError>>>,
    active: Arc<AtomicUsize>,
    /// Sentinel a task yields to park itself until a host completion
    pending: ObjectRef,
    /// The task currently being stepped, for waker handout
    current: Option<SequenceRef>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let mut pending = ObjectData::new();
        pending.locked = true;
        Self {
            ready: Arc::new(Mutex::new(VecDeque::new())),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            active: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(Mutex::new(pending)),
            current: None,
        }
    }

    /// The sentinel value an awaiting task yields; compared by identity
    pub fn pending_value(&self) -> Value {
        Value::Object(self.pending.clone())
    }

    pub fn is_pending(&self, value: &Value) -> bool {
        matches!(value, Value::Object(obj) if Arc::ptr_eq(obj, &self.pending))
    }

    /// Waker for the task currently being stepped. Host natives call this
    /// while handling an await-shaped call, then return the pending value.
    pub fn current_waker(&self) -> Option<TaskWaker> {
        self.current.as_ref().map(|seq| TaskWaker {
            ready: self.ready.clone(),
            seq: seq.clone(),
        })
    }

    /// Number of started, not yet finished tasks
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued_errors(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    fn task_finished(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl VM {
    /// Accept a task: a function returning a sequence when invoked, or any
    /// value with a getEnumerator. Schedules the task's first step; nothing
    /// executes until the next pump.
    pub fn start_task(&mut self, task: Value) -> Result<(), ScriptError> {
        let value = if matches!(task, Value::Function(_)) {
            self.call_value(task, Vec::new())?
        } else {
            task
        };

        let seq = match sequence::sequence_of(&value) {
            Some(seq) => seq,
            None => {
                let enumerator = self.call_method(value, "getEnumerator", Vec::new())?;
                sequence::sequence_of(&enumerator).ok_or_else(|| {
                    ScriptError::type_error(
                        "task did not produce a sequence enumerator".to_string(),
                    )
                })?
            }
        };

        self.scheduler.active.fetch_add(1, Ordering::SeqCst);
        self.scheduler
            .ready
            .lock()
            .unwrap()
            .push_back(TaskResume { seq, send: Ok(Value::Undefined) });
        Ok(())
    }

    /// One pump: execute the continuations that are ready right now, FIFO.
    /// Continuations enqueued during the pump wait for a later pump. If the
    /// error queue is non-empty afterwards, the oldest failure is raised as
    /// a RuntimeError with its cause chained. Returns true while tasks
    /// remain active or errors remain queued.
    pub fn run_scheduler_once(&mut self) -> Result<bool, ScriptError> {
        let batch: Vec<TaskResume> = {
            let mut ready = self.scheduler.ready.lock().unwrap();
            ready.drain(..).collect()
        };

        for item in batch {
            let send = match item.send {
                Ok(send) => send,
                Err(injected) => {
                    // Host-injected failure (e.g. a timeout): abandon the
                    // task and queue the error
                    {
                        let mut guard = item.seq.lock().unwrap();
                        guard.state = crate::sequence::SequenceState::Errored;
                        guard.frame = None;
                    }
                    self.scheduler.errors.lock().unwrap().push_back(injected);
                    self.scheduler.task_finished();
                    continue;
                }
            };

            self.scheduler.current = Some(item.seq.clone());
            let outcome = self.resume_sequence(&item.seq, send);
            self.scheduler.current = None;

            match outcome {
                Ok(Some(yielded)) => {
                    if self.scheduler.is_pending(&yielded) {
                        // Parked; the host completion holds the waker
                    } else {
                        self.scheduler.ready.lock().unwrap().push_back(TaskResume {
                            seq: item.seq.clone(),
                            send: Ok(Value::Undefined),
                        });
                    }
                }
                Ok(None) => self.scheduler.task_finished(),
                Err(error) => {
                    self.scheduler.errors.lock().unwrap().push_back(error);
                    self.scheduler.task_finished();
                }
            }
        }

        let oldest = self.scheduler.errors.lock().unwrap().pop_front();
        if let Some(oldest) = oldest {
            let payload = oldest.catch_value();
            return Err(ScriptError::runtime_error("async task failed".to_string())
                .with_payload(payload)
                .with_cause(oldest));
        }

        Ok(self.scheduler.active_tasks() > 0 || self.scheduler.queued_errors() > 0)
    }

    /// Pump run() to quiescence, yielding the thread between iterations so
    /// external completions can make progress.
    pub fn run_to_completion(&mut self) -> Result<(), ScriptError> {
        while self.run_scheduler_once()? {
            std::thread::yield_now();
        }
        Ok(())
    }
}
