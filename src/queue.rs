//! Holding Queue
//!
//! Priority-ordered staging area for enqueued tasks, plus the admission
//! controller enforcing the global, per-host and per-group concurrency caps.
//! All mutation happens under a single mutex; admission scans stop at the
//! first admissible item so the common case is O(1).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::EngineConfig;
use crate::task::{ResumeData, Task};

/// A task waiting for admission, with its optional resume payload.
#[derive(Debug, Clone)]
pub struct EnqueueItem {
    pub task: Task,
    pub notification_config: Option<String>,
    pub resume_data: Option<ResumeData>,
    /// Monotonic arrival counter, tie-breaker after priority/creation time
    pub sequence: u64,
}

impl EnqueueItem {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            notification_config: None,
            resume_data: None,
            sequence: 0,
        }
    }

    fn ordering_key(&self) -> (u8, i64, u64) {
        (self.task.priority, self.task.creation_time, self.sequence)
    }
}

/// Concurrency caps for admission
#[derive(Debug, Clone, Copy)]
pub struct AdmissionCaps {
    pub max_concurrent: usize,
    pub max_concurrent_by_host: usize,
    pub max_concurrent_by_group: usize,
}

impl From<&EngineConfig> for AdmissionCaps {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_concurrent_by_host: config.max_concurrent_by_host,
            max_concurrent_by_group: config.max_concurrent_by_group,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Sorted by (priority asc, creation_time asc, sequence asc)
    items: Vec<EnqueueItem>,
    concurrent: usize,
    concurrent_by_host: HashMap<String, usize>,
    concurrent_by_group: HashMap<String, usize>,
    next_sequence: u64,
}

/// Priority queue gating dispatch behind concurrency caps
pub struct HoldingQueue {
    state: Mutex<QueueState>,
    caps: AdmissionCaps,
}

impl HoldingQueue {
    pub fn new(caps: AdmissionCaps) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            caps,
        }
    }

    /// Insert one item in priority order.
    pub fn add(&self, item: EnqueueItem) {
        self.add_all(vec![item]);
    }

    /// Insert a batch under a single lock acquisition.
    pub fn add_all(&self, items: Vec<EnqueueItem>) {
        let mut state = self.state.lock().unwrap();
        for mut item in items {
            item.sequence = state.next_sequence;
            state.next_sequence += 1;
            let key = item.ordering_key();
            let index = state
                .items
                .partition_point(|existing| existing.ordering_key() <= key);
            state.items.insert(index, item);
        }
    }

    /// Admit as many items as the caps allow, in priority order. Items whose
    /// host or group is saturated, or that `eligible` rejects, stay queued.
    pub fn admit(&self, eligible: impl Fn(&Task) -> bool) -> Vec<EnqueueItem> {
        let mut state = self.state.lock().unwrap();
        let mut admitted = Vec::new();
        let mut index = 0;
        while index < state.items.len() {
            if state.concurrent >= self.caps.max_concurrent {
                break;
            }
            let task = &state.items[index].task;
            let host = task.host();
            let group = task.group.clone();
            let host_count = state.concurrent_by_host.get(&host).copied().unwrap_or(0);
            let group_count = state.concurrent_by_group.get(&group).copied().unwrap_or(0);
            if host_count >= self.caps.max_concurrent_by_host
                || group_count >= self.caps.max_concurrent_by_group
                || !eligible(task)
            {
                index += 1;
                continue;
            }
            let item = state.items.remove(index);
            state.concurrent += 1;
            *state.concurrent_by_host.entry(host).or_insert(0) += 1;
            *state.concurrent_by_group.entry(group).or_insert(0) += 1;
            admitted.push(item);
        }
        admitted
    }

    /// Release the counters a finished (or never-started) admitted task held.
    pub fn task_finished(&self, task: &Task) {
        let mut state = self.state.lock().unwrap();
        state.concurrent = state.concurrent.saturating_sub(1);
        decrement(&mut state.concurrent_by_host, &task.host());
        decrement(&mut state.concurrent_by_group, &task.group);
    }

    /// Rebuild the counters from the live-worker table, healing any lost
    /// decrement. `live` is one (host, group) pair per running worker.
    pub fn recompute_counters(&self, live: &[(String, String)]) {
        let mut state = self.state.lock().unwrap();
        let drifted = state.concurrent != live.len();
        state.concurrent = live.len();
        state.concurrent_by_host.clear();
        state.concurrent_by_group.clear();
        for (host, group) in live {
            *state
                .concurrent_by_host
                .entry(host.clone())
                .or_insert(0) += 1;
            *state
                .concurrent_by_group
                .entry(group.clone())
                .or_insert(0) += 1;
        }
        if drifted {
            tracing::warn!(
                "admission counters drifted, recomputed to {} live workers",
                live.len()
            );
        }
    }

    /// Remove a queued item by task id.
    pub fn remove_by_id(&self, task_id: &str) -> Option<EnqueueItem> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .items
            .iter()
            .position(|item| item.task.task_id == task_id)?;
        Some(state.items.remove(index))
    }

    /// Remove every queued item in `group`.
    pub fn remove_group(&self, group: &str) -> Vec<EnqueueItem> {
        let mut state = self.state.lock().unwrap();
        let (matching, rest): (Vec<_>, Vec<_>) = state
            .items
            .drain(..)
            .partition(|item| item.task.group == group);
        state.items = rest;
        matching
    }

    /// Queued tasks in `group`.
    pub fn tasks_in_group(&self, group: &str) -> Vec<Task> {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .filter(|item| item.task.group == group)
            .map(|item| item.task.clone())
            .collect()
    }

    pub fn task_for_id(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .find(|item| item.task.task_id == task_id)
            .map(|item| item.task.clone())
    }

    /// Every queued task, in admission order.
    pub fn all_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().unwrap();
        state.items.iter().map(|item| item.task.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn concurrent(&self) -> usize {
        self.state.lock().unwrap().concurrent
    }
}

fn decrement(counters: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counters.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counters.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(global: usize, host: usize, group: usize) -> AdmissionCaps {
        AdmissionCaps {
            max_concurrent: global,
            max_concurrent_by_host: host,
            max_concurrent_by_group: group,
        }
    }

    fn item(id: &str, priority: u8, creation_time: i64) -> EnqueueItem {
        let mut task = Task::download(id, "https://example.com/f");
        task.priority = priority;
        task.creation_time = creation_time;
        EnqueueItem::new(task)
    }

    #[test]
    fn test_priority_order() {
        let queue = HoldingQueue::new(caps(10, 10, 10));
        queue.add(item("p5", 5, 100));
        queue.add(item("p0", 0, 200));
        queue.add(item("p3", 3, 300));
        let admitted = queue.admit(|_| true);
        let ids: Vec<_> = admitted.iter().map(|i| i.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p3", "p5"]);
    }

    #[test]
    fn test_creation_time_tie_break() {
        let queue = HoldingQueue::new(caps(10, 10, 10));
        queue.add(item("later", 5, 200));
        queue.add(item("earlier", 5, 100));
        let admitted = queue.admit(|_| true);
        assert_eq!(admitted[0].task.task_id, "earlier");
        assert_eq!(admitted[1].task.task_id, "later");
    }

    #[test]
    fn test_global_cap() {
        let queue = HoldingQueue::new(caps(2, 10, 10));
        for i in 0..4 {
            queue.add(item(&format!("t{i}"), 5, i));
        }
        assert_eq!(queue.admit(|_| true).len(), 2);
        assert_eq!(queue.len(), 2);
        // nothing admitted while saturated
        assert!(queue.admit(|_| true).is_empty());
        // finishing releases a slot
        queue.task_finished(&item("t0", 5, 0).task);
        assert_eq!(queue.admit(|_| true).len(), 1);
    }

    #[test]
    fn test_host_cap_skips_but_retains() {
        let queue = HoldingQueue::new(caps(10, 1, 10));
        queue.add(item("a", 0, 1));
        queue.add(item("b", 1, 2));
        let mut other = item("other-host", 2, 3);
        other.task.url = "https://other.example.org/f".to_string();
        queue.add(other);
        let admitted = queue.admit(|_| true);
        let ids: Vec<_> = admitted.iter().map(|i| i.task.task_id.as_str()).collect();
        // same-host "b" is skipped, different host still admitted
        assert_eq!(ids, vec!["a", "other-host"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_group_cap() {
        let queue = HoldingQueue::new(caps(10, 10, 1));
        queue.add(item("a", 0, 1));
        queue.add(item("b", 1, 2));
        assert_eq!(queue.admit(|_| true).len(), 1);
        queue.task_finished(&item("a", 0, 1).task);
        assert_eq!(queue.admit(|_| true).len(), 1);
    }

    #[test]
    fn test_eligibility_filter_retains() {
        let queue = HoldingQueue::new(caps(10, 10, 10));
        let mut wifi = item("wifi", 0, 1);
        wifi.task.requires_wifi = true;
        queue.add(wifi);
        queue.add(item("plain", 5, 2));
        let admitted = queue.admit(|task| !task.requires_wifi);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].task.task_id, "plain");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_recompute_counters() {
        let queue = HoldingQueue::new(caps(2, 10, 10));
        queue.add(item("a", 0, 1));
        queue.add(item("b", 1, 2));
        assert_eq!(queue.admit(|_| true).len(), 2);
        // simulate a lost decrement: one worker actually alive
        queue.recompute_counters(&[("example.com".to_string(), "default".to_string())]);
        assert_eq!(queue.concurrent(), 1);
        queue.add(item("c", 2, 3));
        assert_eq!(queue.admit(|_| true).len(), 1);
    }

    #[test]
    fn test_remove_and_queries() {
        let queue = HoldingQueue::new(caps(10, 10, 10));
        queue.add(item("a", 0, 1));
        let mut grouped = item("g", 1, 2);
        grouped.task.group = "bulk".to_string();
        queue.add(grouped);
        assert!(queue.task_for_id("a").is_some());
        assert_eq!(queue.tasks_in_group("bulk").len(), 1);
        assert!(queue.remove_by_id("a").is_some());
        assert!(queue.remove_by_id("a").is_none());
        assert_eq!(queue.remove_group("bulk").len(), 1);
        assert!(queue.is_empty());
    }
}
