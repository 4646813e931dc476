use hashbrown::HashMap;
use photon::logging::{self, Logger};
use photon::time::timestamp_secs;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// A periodic or delayed job. `run` returns the next absolute unix time at
/// which the task wants to execute again, or zero to retire.
pub trait Task: Send + Sync {
    fn run(&self, now: u64) -> u64;

    fn name(&self) -> &str {
        "unnamed task"
    }
}

type TaskKey = usize;

fn task_key(task: &Arc<dyn Task>) -> TaskKey {
    Arc::as_ptr(task) as *const () as usize
}

struct TaskEntry {
    at: u64,
    // Registration order, to break deadline ties deterministically.
    seq: u64,
    // Generation stamp; entries older than the task's current generation
    // were unregistered and get dropped when they surface.
    gen: u64,
    key: TaskKey,
    task: Arc<dyn Task>,
}

impl PartialEq for TaskEntry {
    fn eq(&self, other: &TaskEntry) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TaskEntry {}

impl PartialOrd for TaskEntry {
    fn partial_cmp(&self, other: &TaskEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskEntry {
    fn cmp(&self, other: &TaskEntry) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct SchedulerState {
    // Min-heap of (deadline, task), earliest deadline on top.
    queue: BinaryHeap<Reverse<TaskEntry>>,
    generations: HashMap<TaskKey, u64>,
    running_key: Option<TaskKey>,
    seq: u64,
}

impl SchedulerState {
    fn current_gen(&self, key: TaskKey) -> u64 {
        self.generations.get(&key).copied().unwrap_or(0)
    }

    /// Throw away entries whose task was unregistered since they were
    /// queued, so the top of the heap is always live.
    fn prune_stale(&mut self) {
        loop {
            let stale = match self.queue.peek() {
                Some(Reverse(entry)) => {
                    entry.gen != self.generations.get(&entry.key).copied().unwrap_or(0)
                }
                None => false,
            };

            if !stale {
                break;
            }
            self.queue.pop();
        }
    }
}

struct SchedulerCore {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
    running: AtomicBool,
    log: Logger,
}

/// Runs registered tasks at their deadlines on a single worker thread.
pub struct TaskManager {
    core: Arc<SchedulerCore>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(log: Logger) -> TaskManager {
        TaskManager {
            core: Arc::new(SchedulerCore {
                state: Mutex::new(SchedulerState {
                    queue: BinaryHeap::new(),
                    generations: HashMap::new(),
                    running_key: None,
                    seq: 0,
                }),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                log,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> bool {
        if self.core.running.swap(true, Ordering::AcqRel) {
            return false;
        }

        logging::debug!(self.core.log, "starting the task manager");

        let core = self.core.clone();
        let worker = thread::Builder::new()
            .name("xrd-taskmgr".to_string())
            .spawn(move || SchedulerCore::run_loop(core));

        match worker {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                true
            }
            Err(_) => {
                self.core.running.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn stop(&self) -> bool {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        logging::debug!(self.core.log, "stopping the task manager");

        self.core.wakeup.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        true
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Schedule a task to run at the given absolute unix time.
    pub fn register_task(&self, task: Arc<dyn Task>, at: u64) {
        let key = task_key(&task);

        logging::trace!(self.core.log, "registering task"; "task" => task.name(), "at" => at);

        let mut state = self.core.state.lock().unwrap();
        state.seq += 1;
        let entry = TaskEntry {
            at,
            seq: state.seq,
            gen: state.current_gen(key),
            key,
            task,
        };
        state.queue.push(Reverse(entry));
        self.core.wakeup.notify_all();
    }

    /// Remove a task. On return no further `run` call will be made for it;
    /// if the task is mid-run the call blocks until that run finishes.
    /// Must not be invoked from within the task's own `run`.
    pub fn unregister_task(&self, task: &Arc<dyn Task>) {
        let key = task_key(task);

        logging::trace!(self.core.log, "unregistering task"; "task" => task.name());

        let mut state = self.core.state.lock().unwrap();

        // Invalidate everything queued under this key; the heap drops the
        // dead entries lazily.
        *state.generations.entry(key).or_insert(0) += 1;

        while state.running_key == Some(key) {
            state = self.core.wakeup.wait(state).unwrap();
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerCore {
    fn run_loop(core: Arc<SchedulerCore>) {
        let mut state = core.state.lock().unwrap();

        while core.running.load(Ordering::Acquire) {
            state.prune_stale();

            let now = timestamp_secs();
            let next_due: Option<u64> = state.queue.peek().map(|entry| entry.0.at);

            let next_due = match next_due {
                Some(at) => at,
                None => {
                    let (guard, _) = core
                        .wakeup
                        .wait_timeout(state, Duration::from_secs(1))
                        .unwrap();
                    state = guard;
                    continue;
                }
            };

            if next_due > now {
                let wait = Duration::from_secs((next_due - now).min(1));
                let (guard, _) = core.wakeup.wait_timeout(state, wait).unwrap();
                state = guard;
                continue;
            }

            let Reverse(entry) = state.queue.pop().unwrap();
            state.running_key = Some(entry.key);
            drop(state);

            let next = entry.task.run(now);

            state = core.state.lock().unwrap();
            state.running_key = None;

            // Reschedule unless the task retired or was unregistered while
            // it ran.
            if next > 0 && entry.gen == state.current_gen(entry.key) {
                // A deadline in the past would spin the worker.
                let at = if next > now { next } else { now + 1 };
                state.seq += 1;
                let seq = state.seq;
                state.queue.push(Reverse(TaskEntry {
                    at,
                    seq,
                    gen: entry.gen,
                    key: entry.key,
                    task: entry.task,
                }));
            }

            core.wakeup.notify_all();
        }
    }
}
