use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;

use futures::executor::block_on;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, warn};

use super::{Completion, Engine, Receipt, TaskId};
use crate::config::LocalEngineConfig;
use crate::error::EngineError;
use crate::tensor::Tensor;

/// The computation a [`LocalEngine`] runs for each request.
///
/// An `Err` is reported to the receiver as an invalid completion.
pub type LocalFn = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync;

type Job = (TaskId, Vec<Tensor>);

/// An in-process [`Engine`] backed by a pool of worker threads.
///
/// Requests are queued on an unbounded channel and picked up by whichever
/// worker is free, so completions come back in no particular order. The
/// sentinel closes the queue; once the workers have finished everything they
/// accepted, their result senders drop and the receiver reports
/// [`Receipt::Drained`].
pub struct LocalEngine {
    name: String,
    input_arity: Option<usize>,
    jobs: Mutex<Option<UnboundedSender<Job>>>,
    results: Mutex<UnboundedReceiver<Completion>>,
    next_id: AtomicU32,
    in_flight: AtomicUsize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl LocalEngine {
    /// Starts `config.workers` threads running `func`.
    pub fn new<F>(name: impl Into<String>, config: LocalEngineConfig, func: F) -> Result<Self, EngineError>
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync + 'static,
    {
        config.validate()?;
        let name = name.into();
        let func: Arc<LocalFn> = Arc::new(func);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (results_tx, results_rx) = mpsc::unbounded_channel::<Completion>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            let func = Arc::clone(&func);
            let worker_name = format!("{name}-worker-{index}");
            let handle = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || work(&worker_name, &jobs_rx, &results_tx, &*func))
                .map_err(|e| EngineError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            name,
            input_arity: config.input_arity,
            jobs: Mutex::new(Some(jobs_tx)),
            results: Mutex::new(results_rx),
            next_id: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            workers: Mutex::new(workers),
        })
    }

    /// Convenience constructor with `workers` threads and no arity check.
    pub fn with_workers<F>(name: impl Into<String>, workers: usize, func: F) -> Result<Self, EngineError>
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync + 'static,
    {
        let config = LocalEngineConfig {
            workers,
            ..LocalEngineConfig::default()
        };
        Self::new(name, config, func)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Wraps around without ever yielding zero.
    fn next_task_id(&self) -> TaskId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(id) = TaskId::new(raw) {
                return id;
            }
        }
    }

    fn delivered(&self, receipt: Receipt) -> Receipt {
        if let Receipt::Ready(_) = receipt {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        receipt
    }
}

fn work(name: &str, jobs: &Mutex<UnboundedReceiver<Job>>, results: &UnboundedSender<Completion>, func: &LocalFn) {
    loop {
        let job = jobs.lock().blocking_recv();
        let Some((task_id, inputs)) = job else {
            debug!(worker = name, "job queue closed");
            break;
        };
        let completion = match panic::catch_unwind(AssertUnwindSafe(|| func(&inputs))) {
            Ok(Ok(outputs)) => Completion {
                task_id,
                outputs,
                valid: true,
            },
            Ok(Err(reason)) => {
                warn!(worker = name, task = %task_id, reason = %reason, "request failed");
                Completion {
                    task_id,
                    outputs: Vec::new(),
                    valid: false,
                }
            }
            Err(_) => {
                warn!(worker = name, task = %task_id, "request panicked");
                Completion {
                    task_id,
                    outputs: Vec::new(),
                    valid: false,
                }
            }
        };
        if results.send(completion).is_err() {
            break;
        }
    }
}

impl Engine for LocalEngine {
    fn submit(&self, inputs: Vec<Tensor>) -> Result<TaskId, EngineError> {
        if let Some(expected) = self.input_arity {
            if inputs.len() != expected {
                return Err(EngineError::Arity {
                    expected,
                    got: inputs.len(),
                });
            }
        }
        let jobs = self.jobs.lock();
        let sender = jobs.as_ref().ok_or(EngineError::Closed)?;
        let task_id = self.next_task_id();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send((task_id, inputs)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::Closed);
        }
        Ok(task_id)
    }

    fn submit_sentinel(&self) {
        if self.jobs.lock().take().is_some() {
            debug!(engine = %self.name, "job queue closed by sentinel");
        }
    }

    fn try_receive(&self) -> Receipt {
        let receipt = match self.results.lock().try_recv() {
            Ok(completion) => Receipt::Ready(completion),
            Err(TryRecvError::Empty) => Receipt::Pending,
            Err(TryRecvError::Disconnected) => Receipt::Drained,
        };
        self.delivered(receipt)
    }

    // `block_on` rather than `blocking_recv`, which panics when called from
    // inside an async runtime.
    fn receive(&self) -> Receipt {
        let receipt = match block_on(self.results.lock().recv()) {
            Some(completion) => Receipt::Ready(completion),
            None => Receipt::Drained,
        };
        self.delivered(receipt)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.jobs.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!(engine = %self.name, "worker exited by panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn doubler() -> LocalEngine {
        LocalEngine::with_workers("double", 3, |inputs| {
            let values = inputs[0].to_vec::<f32>().map_err(|e| e.to_string())?;
            let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
            Ok(vec![Tensor::vector(&doubled)])
        })
        .unwrap()
    }

    fn drain(engine: &LocalEngine) -> Vec<Completion> {
        let mut out = Vec::new();
        loop {
            match engine.receive() {
                Receipt::Ready(c) => out.push(c),
                Receipt::Drained => return out,
                Receipt::Pending => continue,
            }
        }
    }

    #[test]
    fn test_every_task_comes_back_once() {
        let engine = doubler();
        let mut submitted = HashSet::new();
        for i in 0..20 {
            let task = engine.submit(vec![Tensor::vector(&[i as f32])]).unwrap();
            assert!(submitted.insert(task));
        }
        engine.submit_sentinel();
        let completions = drain(&engine);
        let returned: HashSet<TaskId> = completions.iter().map(|c| c.task_id).collect();
        assert_eq!(returned, submitted);
        assert!(completions.iter().all(|c| c.valid));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_submit_after_sentinel_is_closed() {
        let engine = doubler();
        engine.submit_sentinel();
        assert_eq!(engine.submit(vec![Tensor::vector(&[1.0f32])]), Err(EngineError::Closed));
        assert!(matches!(engine.receive(), Receipt::Drained));
    }

    #[test]
    fn test_function_error_is_invalid() {
        let engine = LocalEngine::with_workers("fail", 1, |_| Err("no".to_string())).unwrap();
        engine.submit(vec![Tensor::vector(&[1u8])]).unwrap();
        engine.submit_sentinel();
        let completions = drain(&engine);
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].valid);
    }

    #[test]
    fn test_panicking_function_is_invalid() {
        let engine = LocalEngine::with_workers("boom", 1, |_| panic!("kaboom")).unwrap();
        engine.submit(vec![Tensor::vector(&[1u8])]).unwrap();
        engine.submit_sentinel();
        let completions = drain(&engine);
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].valid);
    }

    #[test]
    fn test_arity_check() {
        let config = LocalEngineConfig {
            workers: 1,
            input_arity: Some(2),
        };
        let engine = LocalEngine::new("pair", config, |inputs| Ok(inputs.to_vec())).unwrap();
        let err = engine.submit(vec![Tensor::vector(&[1u8])]).unwrap_err();
        assert_eq!(err, EngineError::Arity { expected: 2, got: 1 });
    }

    #[test]
    fn test_zero_workers_is_a_config_error() {
        let err = LocalEngine::with_workers("none", 0, |inputs| Ok(inputs.to_vec())).err();
        assert!(matches!(err, Some(EngineError::Config(_))));
    }

    #[test]
    fn test_try_receive_reports_pending_before_sentinel() {
        let engine = LocalEngine::with_workers("idle", 1, |inputs| Ok(inputs.to_vec())).unwrap();
        assert!(matches!(engine.try_receive(), Receipt::Pending));
        engine.submit_sentinel();
        assert!(matches!(engine.receive(), Receipt::Drained));
    }
}
