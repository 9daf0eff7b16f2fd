use std::thread;

use crate::config::DEFAULT_BATCH_WIDTH;

/// Outcome counts of one driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub batches: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Processes items in fixed-width batches. Every member of a batch runs on
/// its own scoped thread and the next batch starts only after all of them
/// have finished, so a slow or failing member only holds up its own batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchDriver {
    width: usize,
}

impl Default for BatchDriver {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_WIDTH)
    }
}

impl BatchDriver {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Runs `job` for every item, in order, `width` at a time. Errors and
    /// panics are logged and counted; they never stop the run.
    pub fn run<T, E, F>(&self, items: &[T], job: F) -> BatchSummary
    where
        T: Sync,
        E: std::fmt::Display + Send,
        F: Fn(&T) -> Result<(), E> + Sync,
    {
        let mut summary = BatchSummary::default();
        for (index, batch) in items.chunks(self.width).enumerate() {
            let outcomes: Vec<bool> = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|item| scope.spawn(|| job(item)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(Ok(())) => true,
                        Ok(Err(err)) => {
                            tracing::warn!(batch = index, error = %err, "batch member failed");
                            false
                        }
                        Err(_) => {
                            tracing::warn!(batch = index, "batch member panicked");
                            false
                        }
                    })
                    .collect()
            });
            summary.batches += 1;
            for ok in outcomes {
                if ok {
                    summary.completed += 1;
                } else {
                    summary.failed += 1;
                }
            }
            tracing::debug!(batch = index, size = batch.len(), "batch settled");
        }
        summary
    }
}
