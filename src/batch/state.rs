//! Batch bookkeeping for one aggregator.
//!
//! `BatchState` is the synchronous core of the aggregator: it tracks the
//! task list of the current generation, counts completions and decides when
//! a full snapshot is due. The async driver feeds it events.

use crate::error::FetchError;
use crate::models::{QueryKey, Snapshot, Task, TaskState};
use chrono::Utc;
use tracing::debug;

/// Completions needed before a publish, unless fewer remain.
pub const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Debug)]
pub struct BatchState<V> {
    batch_size: usize,
    generation: u64,
    tasks: Vec<Task<V>>,
    /// Terminal tasks in this generation.
    completed: usize,
    /// `completed` at the last publish.
    last_published: usize,
}

impl<V: Clone> BatchState<V> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            generation: 0,
            tasks: Vec::new(),
            completed: 0,
            last_published: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Indices of the unsettled tasks that wait on `query`. Duplicate items
    /// share one fetch, so there can be more than one.
    pub fn indices_of(&self, query: &QueryKey) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| &task.query == query && !task.is_terminal())
            .map(|(index, _)| index)
            .collect()
    }

    /// Start a new generation with one pending task per query.
    ///
    /// Returns the new generation number. Completions tagged with any
    /// earlier generation are ignored from now on.
    pub fn reset(&mut self, queries: Vec<QueryKey>) -> u64 {
        self.generation += 1;
        self.tasks = queries.into_iter().map(Task::pending).collect();
        self.completed = 0;
        self.last_published = 0;
        self.generation
    }

    /// Mark a pending task as in flight.
    pub fn start(&mut self, generation: u64, index: usize) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.tasks.get_mut(index) {
            Some(task) if matches!(task.state, TaskState::Pending) => {
                task.state = TaskState::InFlight;
                true
            }
            _ => false,
        }
    }

    /// Record a task outcome and return a snapshot if a batch is due.
    pub fn settle(
        &mut self,
        generation: u64,
        index: usize,
        outcome: Result<V, FetchError>,
    ) -> Option<Snapshot<V>> {
        if generation != self.generation {
            debug!(
                "Discarding completion from generation {} (current {})",
                generation, self.generation
            );
            return None;
        }

        let task = self.tasks.get_mut(index)?;
        if task.is_terminal() {
            return None;
        }

        task.state = match outcome {
            Ok(value) => TaskState::Succeeded(value),
            Err(err) => TaskState::Failed(err),
        };
        self.completed += 1;

        self.poll_publish()
    }

    /// Completions required for the next publish.
    ///
    /// The full batch size, or whatever is left unpublished when that is
    /// smaller, so the final partial batch is never starved.
    pub fn batch_threshold(&self) -> usize {
        let remaining = self.tasks.len() - self.last_published;
        self.batch_size.min(remaining)
    }

    fn poll_publish(&mut self) -> Option<Snapshot<V>> {
        let fresh = self.completed - self.last_published;
        if fresh == 0 || fresh < self.batch_threshold() {
            return None;
        }

        self.last_published = self.completed;
        Some(self.snapshot())
    }

    /// Full snapshot of the current generation.
    pub fn snapshot(&self) -> Snapshot<V> {
        Snapshot {
            generation: self.generation,
            tasks: self.tasks.clone(),
            total: self.tasks.len(),
            completed: self.completed,
            published_at: Utc::now(),
        }
    }
}
