//! Compile thread pool
//!
//! A fixed set of workers, each owning a per-thread context built by a
//! factory at startup. Tasks are boxed closures in a queue guarded by one
//! mutex with two condition variables (task available, task done). An
//! optional per-worker tail task runs once after the queue drains under the
//! no-new-task flag. `wait_for_tasks` drains both lists; `interrupt` sets
//! the stop sentinel and joins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;
type TailTask<C> = Arc<dyn Fn(&mut C) + Send + Sync>;

struct PoolState<C> {
    tasks: VecDeque<Task<C>>,
    /// Queued plus running tasks.
    tasks_total: usize,
    running: bool,
    waiting: bool,
    no_new_task: bool,
    tail_remaining: usize,
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    task_available: Condvar,
    task_done: Condvar,
}

pub struct ThreadPool<C: Send + 'static> {
    shared: Arc<Shared<C>>,
    workers: Vec<JoinHandle<()>>,
}

/// `1 + hardware concurrency`, capped at 8.
pub fn default_thread_count() -> usize {
    (1 + num_cpus::get()).min(8)
}

impl<C: Send + 'static> ThreadPool<C> {
    /// Spawn `thread_count` workers (the default count when zero), each
    /// with a context from `context_factory` and an optional tail task.
    pub fn new<F>(thread_count: usize, context_factory: F, tail_task: Option<TailTask<C>>) -> Self
    where
        F: Fn(usize) -> C + Send + Sync + 'static,
    {
        let thread_count = if thread_count == 0 {
            default_thread_count()
        } else {
            thread_count
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                tasks_total: 0,
                running: true,
                waiting: false,
                no_new_task: false,
                tail_remaining: if tail_task.is_some() { thread_count } else { 0 },
            }),
            task_available: Condvar::new(),
            task_done: Condvar::new(),
        });

        let factory = Arc::new(context_factory);
        let workers = (0..thread_count)
            .map(|worker_idx| {
                let shared = Arc::clone(&shared);
                let factory = Arc::clone(&factory);
                let tail = tail_task.clone();
                thread::Builder::new()
                    .name(format!("kiln-compile-{}", worker_idx))
                    .spawn(move || {
                        let mut context = factory(worker_idx);
                        Self::worker_loop(&shared, &mut context);
                        if let Some(tail) = tail {
                            tail(&mut context);
                            let mut state = shared.state.lock();
                            state.tail_remaining -= 1;
                            if state.waiting {
                                shared.task_done.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn compile worker")
            })
            .collect();

        ThreadPool { shared, workers }
    }

    fn worker_loop(shared: &Shared<C>, context: &mut C) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                loop {
                    if !state.running {
                        return;
                    }
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.no_new_task {
                        return;
                    }
                    shared.task_available.wait(&mut state);
                }
            };
            task(context);
            let mut state = shared.state.lock();
            state.tasks_total -= 1;
            if state.waiting {
                shared.task_done.notify_all();
            }
        }
    }

    pub fn push_task<F>(&self, task: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(Box::new(task));
        state.tasks_total += 1;
        drop(state);
        self.shared.task_available.notify_one();
    }

    pub fn tasks_queued(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn tasks_total(&self) -> usize {
        self.shared.state.lock().tasks_total
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work; workers exit (running their tail tasks) once
    /// the queue drains.
    pub fn set_no_new_task(&self) {
        self.shared.state.lock().no_new_task = true;
        self.shared.task_available.notify_all();
    }

    /// Block until every queued task has finished and, once the no-new-task
    /// flag is set, every tail task too.
    pub fn wait_for_tasks(&self) {
        let mut state = self.shared.state.lock();
        state.waiting = true;
        while state.tasks_total > 0 {
            self.shared.task_done.wait(&mut state);
        }
        self.shared.task_available.notify_all();
        while state.no_new_task && state.tail_remaining > 0 {
            self.shared.task_done.wait(&mut state);
        }
        state.waiting = false;
    }

    /// Set the stop sentinel and join the workers; queued tasks are
    /// abandoned.
    pub fn interrupt(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.task_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl<C: Send + 'static> Drop for ThreadPool<C> {
    fn drop(&mut self) {
        // no task outlives the pool: drain, then stop
        if self.shared.state.lock().running {
            self.wait_for_tasks();
        }
        self.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_with_context() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool: ThreadPool<usize> = ThreadPool::new(2, |idx| idx, None);
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.push_task(move |_ctx| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
        assert_eq!(pool.tasks_total(), 0);
    }

    #[test]
    fn test_contexts_are_per_worker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool: ThreadPool<usize> = ThreadPool::new(3, |idx| idx * 100, None);
        for _ in 0..12 {
            let seen = Arc::clone(&seen);
            pool.push_task(move |ctx| {
                seen.lock().push(*ctx);
                thread::sleep(Duration::from_millis(1));
            });
        }
        pool.wait_for_tasks();
        let seen = seen.lock();
        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|v| v % 100 == 0 && *v < 300));
    }

    #[test]
    fn test_tail_tasks_run_after_drain() {
        let tail_runs = Arc::new(AtomicUsize::new(0));
        let tail_counter = Arc::clone(&tail_runs);
        let pool: ThreadPool<()> = ThreadPool::new(
            2,
            |_| (),
            Some(Arc::new(move |_: &mut ()| {
                tail_counter.fetch_add(1, Ordering::Relaxed);
            })),
        );
        for _ in 0..4 {
            pool.push_task(|_| {});
        }
        pool.set_no_new_task();
        pool.wait_for_tasks();
        // one tail task per worker
        assert_eq!(tail_runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_interrupt_joins() {
        let mut pool: ThreadPool<()> = ThreadPool::new(2, |_| (), None);
        pool.push_task(|_| {});
        pool.wait_for_tasks();
        pool.interrupt();
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_default_thread_count_capped() {
        let count = default_thread_count();
        assert!(count >= 1 && count <= 8);
    }
}
