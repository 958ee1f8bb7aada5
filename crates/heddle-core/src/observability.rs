use serde::{Deserialize, Serialize};

use crate::domain::{TaskRecord, TaskStatus};

/// Number of tasks per status in one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.add(task.status);
        }
        counts
    }

    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Waiting => self.waiting += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Waiting => self.waiting,
            TaskStatus::Ready => self.ready,
            TaskStatus::Running => self.running,
            TaskStatus::Done => self.done,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Nothing left that could still run without a retry.
    pub fn is_settled(&self) -> bool {
        self.waiting == 0 && self.ready == 0 && self.running == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn counts_by_status() {
        let proj = fixtures::project(10, 1);
        let mut done = fixtures::task(1, &proj, &[]);
        done.status = TaskStatus::Done;
        let waiting = fixtures::task(2, &proj, &[1]);
        let mut failed = fixtures::task(3, &proj, &[]);
        failed.status = TaskStatus::Failed;

        let counts = QueueCounts::from_tasks([&done, &waiting, &failed]);

        assert_eq!(counts.done, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_settled());
    }
}
