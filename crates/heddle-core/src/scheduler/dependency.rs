//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Invariant: a node is in `ready` iff its state is `Ready`, and its state is
//!   `Ready` or `Dispatched` only when every dependency is `Done`
//!
//! One graph covers one project. It only holds ids and scheduling keys; the
//! task records live in the state store and the graph can always be rebuilt
//! from them with [`DependencyGraph::restore`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{TaskId, TaskRecord, TaskStatus};
use crate::error::{Entity, HeddleError, Result};

/// Scheduling state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Referenced as a dependency but not registered yet (forward declaration).
    Declared,
    /// Some dependency is not done.
    Waiting,
    /// Every dependency is done and nobody took it yet.
    Ready,
    /// Handed out by `get_next`.
    Dispatched,
    Done,
    /// Failed or cancelled. Dependents keep waiting.
    Blocked,
}

/// A task entering the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub dependencies: Vec<TaskId>,
}

/// Counts by scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub total: usize,
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub blocked: usize,
    /// Forward-declared ids nobody registered yet.
    pub declared: usize,
}

#[derive(Debug, Clone)]
struct Node {
    state: NodeState,
    priority: i32,
    created_at: DateTime<Utc>,
    /// Insertion order inside this graph.
    seq: u64,
    /// Dependencies that are not `Done`.
    unresolved: usize,
}

impl Node {
    fn ready_key(&self, id: TaskId) -> ReadyKey {
        ReadyKey(Reverse(self.priority), self.created_at, self.seq, id)
    }
}

/// Highest priority first, then earliest created, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey(Reverse<i32>, DateTime<Utc>, u64, TaskId);

/// Dependency graph for tracking task dependencies.
///
/// This graph maintains both forward and reverse edges for efficient lookups:
/// - `edges`: TaskId -> Set of TaskIds it depends on
/// - `reverse_edges`: TaskId -> Set of TaskIds waiting for it
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,

    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    /// Enables O(1) lookup: "who is waiting for this task?"
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,

    ready: BTreeSet<ReadyKey>,
    next_seq: u64,
    allow_forward_declarations: bool,
}

impl DependencyGraph {
    /// Create an empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown dependencies become placeholder nodes instead of errors.
    pub fn with_forward_declarations(mut self, allow: bool) -> Self {
        self.allow_forward_declarations = allow;
        self
    }

    pub fn len(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state != NodeState::Declared)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered (not merely forward-declared) task.
    pub fn contains(&self, id: TaskId) -> bool {
        self.state(id).is_some_and(|s| s != NodeState::Declared)
    }

    pub fn state(&self, id: TaskId) -> Option<NodeState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    /// Add one task. Returns whether it is immediately ready.
    pub fn add_task(&mut self, node: NewNode) -> Result<bool> {
        let ready = self.add_batch(std::slice::from_ref(&node))?;
        Ok(!ready.is_empty())
    }

    /// Add several tasks at once; either all of them go in or none does.
    ///
    /// Batch members may depend on each other in any order. Returns the
    /// members that are ready right away, in batch order.
    pub fn add_batch(&mut self, batch: &[NewNode]) -> Result<Vec<TaskId>> {
        self.check_batch(batch)?;
        Ok(self.insert_batch(batch))
    }

    /// Validation half of `add_batch`. Does not touch the graph.
    ///
    /// Every edge is checked for a cycle as it is accepted, against the graph
    /// plus the batch edges accepted before it. The search only walks what is
    /// reachable from the new edge's target.
    pub fn check_batch(&self, batch: &[NewNode]) -> Result<()> {
        let mut batch_ids = HashSet::with_capacity(batch.len());
        for node in batch {
            if self.contains(node.id) || !batch_ids.insert(node.id) {
                return Err(HeddleError::InvalidArgument(format!(
                    "task {} is already registered",
                    node.id
                )));
            }
        }

        let mut accepted: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for node in batch {
            for &dep in &node.dependencies {
                if dep == node.id {
                    return Err(HeddleError::Cycle {
                        path: vec![node.id, node.id],
                    });
                }
                if !self.nodes.contains_key(&dep)
                    && !batch_ids.contains(&dep)
                    && !self.allow_forward_declarations
                {
                    return Err(HeddleError::UnknownDependency {
                        task: node.id,
                        dependency: dep,
                    });
                }
                if let Some(path) = self.find_path(dep, node.id, &accepted) {
                    let mut cycle = Vec::with_capacity(path.len() + 1);
                    cycle.push(node.id);
                    cycle.extend(path);
                    return Err(HeddleError::Cycle { path: cycle });
                }
                accepted.entry(node.id).or_default().push(dep);
            }
        }
        Ok(())
    }

    /// Path `from -> ... -> to` following dependency edges, if any.
    fn find_path(
        &self,
        from: TaskId,
        to: TaskId,
        extra: &HashMap<TaskId, Vec<TaskId>>,
    ) -> Option<Vec<TaskId>> {
        let mut stack = vec![from];
        let mut prev: HashMap<TaskId, TaskId> = HashMap::new();
        let mut visited = HashSet::from([from]);

        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![to];
                let mut current = to;
                while let Some(&p) = prev.get(&current) {
                    path.push(p);
                    current = p;
                }
                path.reverse();
                return Some(path);
            }
            let known = self.edges.get(&node).into_iter().flatten();
            let staged = extra.get(&node).into_iter().flatten();
            for &dep in known.chain(staged) {
                if visited.insert(dep) {
                    prev.insert(dep, node);
                    stack.push(dep);
                }
            }
        }
        None
    }

    fn insert_batch(&mut self, batch: &[NewNode]) -> Vec<TaskId> {
        for node in batch {
            let seq = self.next_seq;
            self.next_seq += 1;
            let entry = self.nodes.entry(node.id).or_insert(Node {
                state: NodeState::Declared,
                priority: node.priority,
                created_at: node.created_at,
                seq,
                unresolved: 0,
            });
            entry.state = NodeState::Waiting;
            entry.priority = node.priority;
            entry.created_at = node.created_at;
            entry.seq = seq;

            for &dep in &node.dependencies {
                if !self.nodes.contains_key(&dep) {
                    let placeholder_seq = self.next_seq;
                    self.next_seq += 1;
                    debug!(task = %node.id, dependency = %dep, "forward-declared dependency");
                    self.nodes.insert(
                        dep,
                        Node {
                            state: NodeState::Declared,
                            priority: 0,
                            created_at: node.created_at,
                            seq: placeholder_seq,
                            unresolved: 0,
                        },
                    );
                }
                self.add_dependency(node.id, dep);
            }
        }

        let mut ready = Vec::new();
        for node in batch {
            let unresolved = self.count_unresolved(node.id);
            if let Some(n) = self.nodes.get_mut(&node.id) {
                n.unresolved = unresolved;
            }
            if unresolved == 0 {
                self.promote(node.id);
                ready.push(node.id);
            }
        }
        debug!(added = batch.len(), ready = ready.len(), "tasks added to graph");
        ready
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A"
    ///
    /// This method must maintain the invariant by updating both:
    /// - edges: B -> {A}
    /// - reverse_edges: A -> {B}
    fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    fn count_unresolved(&self, id: TaskId) -> usize {
        self.edges
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| self.state(**dep) != Some(NodeState::Done))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Waiting -> Ready, entering the ready set.
    fn promote(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.get_mut(&id)
            && node.state == NodeState::Waiting
        {
            node.state = NodeState::Ready;
            self.ready.insert(node.ready_key(id));
        }
    }

    /// Leaves the ready set if it was there.
    fn demote(&mut self, id: TaskId, to: NodeState) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.state == NodeState::Ready {
                self.ready.remove(&node.ready_key(id));
            }
            node.state = to;
        }
    }

    fn registered(&self, id: TaskId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .filter(|n| n.state != NodeState::Declared)
            .ok_or_else(|| HeddleError::not_found(Entity::Task, id))
    }

    /// Ready tasks, best first. Borrowing the graph again restarts the sequence.
    pub fn ready_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter().map(|key| key.3)
    }

    pub fn first_ready(&self) -> Option<TaskId> {
        self.ready_tasks().next()
    }

    /// Ready -> Dispatched.
    pub fn mark_dispatched(&mut self, id: TaskId) -> Result<()> {
        let state = self.registered(id)?.state;
        if state != NodeState::Ready {
            return Err(HeddleError::InvalidArgument(format!(
                "task {id} is not ready to dispatch ({state:?})"
            )));
        }
        self.demote(id, NodeState::Dispatched);
        Ok(())
    }

    /// Marks the node resolved and returns the dependents that became ready,
    /// best first. Completing a node twice is a no-op.
    pub fn mark_complete(&mut self, id: TaskId) -> Result<Vec<TaskId>> {
        if self.registered(id)?.state == NodeState::Done {
            return Ok(Vec::new());
        }
        self.demote(id, NodeState::Done);

        let mut unblocked = Vec::new();
        let dependents: Vec<TaskId> = self.get_waiting_tasks(id);
        for dependent in dependents {
            let Some(node) = self.nodes.get_mut(&dependent) else {
                continue;
            };
            node.unresolved = node.unresolved.saturating_sub(1);
            if node.unresolved == 0 && node.state == NodeState::Waiting {
                self.promote(dependent);
                unblocked.push(dependent);
            }
        }
        unblocked.sort_by_key(|id| self.nodes.get(id).map(|n| n.ready_key(*id)));
        debug!(task = %id, unblocked = unblocked.len(), "task completed in graph");
        Ok(unblocked)
    }

    /// Dependents that `mark_complete(id)` would make ready, best first.
    /// Read-only.
    pub fn would_unblock(&self, id: TaskId) -> Vec<TaskId> {
        if self.state(id) == Some(NodeState::Done) {
            return Vec::new();
        }
        let mut unblocked: Vec<TaskId> = self
            .get_waiting_tasks(id)
            .into_iter()
            .filter(|dependent| {
                self.nodes
                    .get(dependent)
                    .is_some_and(|n| n.state == NodeState::Waiting && n.unresolved == 1)
            })
            .collect();
        unblocked.sort_by_key(|id| self.nodes.get(id).map(|n| n.ready_key(*id)));
        unblocked
    }

    /// Failed or cancelled: out of the ready set, dependents keep waiting.
    pub fn mark_blocked(&mut self, id: TaskId) -> Result<()> {
        let state = self.registered(id)?.state;
        if state == NodeState::Done {
            return Err(HeddleError::InvalidArgument(format!(
                "task {id} is already done"
            )));
        }
        self.demote(id, NodeState::Blocked);
        Ok(())
    }

    /// Blocked -> Ready or Waiting. Returns whether it is ready.
    pub fn requeue(&mut self, id: TaskId) -> Result<bool> {
        let node = self.registered(id)?;
        if node.state != NodeState::Blocked {
            return Err(HeddleError::InvalidArgument(format!(
                "task {id} is not blocked ({:?})",
                node.state
            )));
        }
        let ready = node.unresolved == 0;
        self.demote(id, NodeState::Waiting);
        if ready {
            self.promote(id);
        }
        Ok(ready)
    }

    /// Whether every dependency of `id` is done.
    pub fn dependencies_satisfied(&self, id: TaskId) -> Result<bool> {
        Ok(self.registered(id)?.unresolved == 0)
    }

    /// Get all tasks that can be unblocked when `completed_task` finishes.
    ///
    /// Note: This returns ALL tasks waiting for `completed_task`, even if they
    /// have other dependencies.
    fn get_waiting_tasks(&self, completed_task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&completed_task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    fn by_insertion(&self, mut ids: Vec<TaskId>) -> Vec<TaskId> {
        ids.sort_by_key(|id| self.nodes.get(id).map(|n| n.seq));
        ids
    }

    /// Direct dependencies, in insertion order.
    pub fn dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        let deps = self
            .edges
            .get(&id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        self.by_insertion(deps)
    }

    /// Direct dependents, in insertion order.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.by_insertion(self.get_waiting_tasks(id))
    }

    /// Everything `id` waits for, directly or not, in insertion order.
    pub fn transitive_dependencies(&self, id: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependencies_of(id).into();
        while let Some(dep) = queue.pop_front() {
            if seen.insert(dep) {
                queue.extend(self.edges.get(&dep).into_iter().flatten().copied());
            }
        }
        self.by_insertion(seen.into_iter().collect())
    }

    /// One valid total order of the registered tasks (Kahn).
    ///
    /// Among tasks whose dependencies are already placed, the one inserted
    /// first goes next; priority breaks ties. Forward-declared placeholders
    /// are left out.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let registered: HashMap<TaskId, &Node> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.state != NodeState::Declared)
            .map(|(id, n)| (*id, n))
            .collect();

        let mut in_degree: HashMap<TaskId, usize> = registered
            .keys()
            .map(|id| {
                let degree = self
                    .edges
                    .get(id)
                    .into_iter()
                    .flatten()
                    .filter(|dep| registered.contains_key(dep))
                    .count();
                (*id, degree)
            })
            .collect();

        let key = |id: TaskId| {
            let node = registered[&id];
            Reverse((node.seq, Reverse(node.priority), id))
        };
        let mut available: BinaryHeap<_> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| key(*id))
            .collect();

        let mut order = Vec::with_capacity(registered.len());
        while let Some(Reverse((_, _, id))) = available.pop() {
            order.push(id);
            for dependent in self.reverse_edges.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        available.push(key(*dependent));
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), registered.len(), "graph must stay acyclic");
        order
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats::default();
        for node in self.nodes.values() {
            match node.state {
                NodeState::Declared => {
                    stats.declared += 1;
                    continue;
                }
                NodeState::Waiting => stats.waiting += 1,
                NodeState::Ready => stats.ready += 1,
                NodeState::Dispatched => stats.running += 1,
                NodeState::Done => stats.completed += 1,
                NodeState::Blocked => stats.blocked += 1,
            }
            stats.total += 1;
        }
        stats
    }

    /// Rebuild a graph from persisted records (insertion order).
    ///
    /// Readiness is recomputed from the dependencies; a stored `waiting` or
    /// `ready` status is not trusted. Running tasks stay dispatched.
    pub fn restore(records: &[TaskRecord], allow_forward_declarations: bool) -> Self {
        let mut graph = Self::new().with_forward_declarations(allow_forward_declarations);
        for record in records {
            let seq = graph.next_seq;
            graph.next_seq += 1;
            let state = match record.status {
                TaskStatus::Running => NodeState::Dispatched,
                TaskStatus::Done => NodeState::Done,
                status if status.blocks_dependents() => NodeState::Blocked,
                _ => NodeState::Waiting,
            };
            let node = graph.nodes.entry(record.id).or_insert(Node {
                state,
                priority: record.priority,
                created_at: record.created_at,
                seq,
                unresolved: 0,
            });
            node.state = state;
            node.priority = record.priority;
            node.created_at = record.created_at;
            node.seq = seq;

            for &dep in &record.dependencies {
                if !graph.nodes.contains_key(&dep) {
                    let placeholder_seq = graph.next_seq;
                    graph.next_seq += 1;
                    graph.nodes.insert(
                        dep,
                        Node {
                            state: NodeState::Declared,
                            priority: 0,
                            created_at: record.created_at,
                            seq: placeholder_seq,
                            unresolved: 0,
                        },
                    );
                }
                graph.add_dependency(record.id, dep);
            }
        }

        for record in records {
            let unresolved = graph.count_unresolved(record.id);
            if let Some(node) = graph.nodes.get_mut(&record.id) {
                node.unresolved = unresolved;
            }
            if unresolved == 0 {
                graph.promote(record.id);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(n: u128) -> TaskId {
        TaskId::from_u128(n)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn node(n: u128, priority: i32, deps: &[u128]) -> NewNode {
        NewNode {
            id: id(n),
            priority,
            created_at: at(n as i64),
            dependencies: deps.iter().copied().map(id).collect(),
        }
    }

    fn ready(graph: &DependencyGraph) -> Vec<TaskId> {
        graph.ready_tasks().collect()
    }

    #[test]
    fn test_task_without_dependencies_is_ready() {
        let mut graph = DependencyGraph::new();
        assert!(graph.add_task(node(1, 5, &[])).unwrap());
        assert!(!graph.add_task(node(2, 5, &[1])).unwrap());

        assert_eq!(ready(&graph), vec![id(1)]);
        assert_eq!(graph.state(id(2)), Some(NodeState::Waiting));
    }

    #[test]
    fn test_ready_order_is_priority_then_age() {
        let mut graph = DependencyGraph::new();
        graph
            .add_batch(&[node(1, 1, &[]), node(2, 9, &[]), node(3, 9, &[]), node(4, 5, &[])])
            .unwrap();

        assert_eq!(ready(&graph), vec![id(2), id(3), id(4), id(1)]);
        // restartable
        assert_eq!(graph.first_ready(), Some(id(2)));
        assert_eq!(ready(&graph).len(), 4);
    }

    #[test]
    fn test_complete_unblocks_dependent_exactly_once() {
        let mut graph = DependencyGraph::new();
        graph.add_batch(&[node(1, 5, &[]), node(2, 10, &[1])]).unwrap();

        graph.mark_dispatched(id(1)).unwrap();
        assert_eq!(graph.mark_complete(id(1)).unwrap(), vec![id(2)]);
        assert_eq!(ready(&graph), vec![id(2)]);

        // completing again changes nothing
        assert!(graph.mark_complete(id(1)).unwrap().is_empty());
        assert_eq!(ready(&graph), vec![id(2)]);
    }

    #[test]
    fn test_diamond_waits_for_both_branches() {
        let mut graph = DependencyGraph::new();
        graph
            .add_batch(&[node(1, 0, &[]), node(2, 0, &[1]), node(3, 0, &[1]), node(4, 0, &[2, 3])])
            .unwrap();

        graph.mark_complete(id(1)).unwrap();
        assert!(graph.would_unblock(id(2)).is_empty());
        assert!(graph.mark_complete(id(2)).unwrap().is_empty());
        assert_eq!(graph.would_unblock(id(3)), vec![id(4)]);
        assert_eq!(graph.mark_complete(id(3)).unwrap(), vec![id(4)]);
        assert!(graph.would_unblock(id(3)).is_empty());
    }

    #[test]
    fn test_restore_recomputes_readiness() {
        use crate::fixtures;

        let project = fixtures::project(10, 1);
        let mut done = fixtures::task(1, &project, &[]);
        done.status = TaskStatus::Done;
        let stale_waiting = fixtures::task(2, &project, &[1]);
        let mut running = fixtures::task(3, &project, &[]);
        running.status = TaskStatus::Running;
        let mut failed = fixtures::task(4, &project, &[]);
        failed.status = TaskStatus::Failed;
        let blocked_by_failure = fixtures::task(5, &project, &[4]);

        let graph = DependencyGraph::restore(
            &[done, stale_waiting, running, failed, blocked_by_failure],
            false,
        );

        assert_eq!(ready(&graph), vec![id(2)]);
        assert_eq!(graph.state(id(3)), Some(NodeState::Dispatched));
        assert_eq!(graph.state(id(4)), Some(NodeState::Blocked));
        assert_eq!(graph.state(id(5)), Some(NodeState::Waiting));
        assert_eq!(graph.topological_order(), vec![id(1), id(2), id(3), id(4), id(5)]);

        let mut cancelled = fixtures::task(6, &project, &[]);
        cancelled.status = TaskStatus::Cancelled;
        let graph = DependencyGraph::restore(&[cancelled], false);
        assert_eq!(graph.state(id(6)), Some(NodeState::Blocked));
        assert!(ready(&graph).is_empty());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let err = graph.add_task(node(1, 0, &[1])).unwrap_err();

        assert!(matches!(err, HeddleError::Cycle { ref path } if path == &vec![id(1), id(1)]));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_cycle_inside_batch_inserts_nothing() {
        let mut graph = DependencyGraph::new();
        graph.add_task(node(9, 0, &[])).unwrap();

        let err = graph
            .add_batch(&[node(1, 0, &[9, 2]), node(2, 0, &[1])])
            .unwrap_err();

        match err {
            HeddleError::Cycle { path } => assert_eq!(path, vec![id(2), id(1), id(2)]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(!graph.contains(id(1)));
        assert!(!graph.contains(id(2)));
        assert_eq!(graph.dependents_of(id(9)), vec![]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_longer_cycle_reports_full_path() {
        let mut graph = DependencyGraph::new();
        let err = graph
            .add_batch(&[node(1, 0, &[3]), node(2, 0, &[1]), node(3, 0, &[2])])
            .unwrap_err();

        match err {
            HeddleError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let mut graph = DependencyGraph::new();
        let err = graph.add_task(node(1, 0, &[42])).unwrap_err();

        assert!(matches!(
            err,
            HeddleError::UnknownDependency { task, dependency } if task == id(1) && dependency == id(42)
        ));
        assert_eq!(graph.stats(), GraphStats::default());
    }

    #[test]
    fn test_forward_declaration_waits_for_registration() {
        let mut graph = DependencyGraph::new().with_forward_declarations(true);
        assert!(!graph.add_task(node(2, 0, &[1])).unwrap());
        assert_eq!(graph.state(id(1)), Some(NodeState::Declared));
        assert!(!graph.contains(id(1)));
        assert_eq!(graph.stats().declared, 1);

        assert!(graph.add_task(node(1, 0, &[])).unwrap());
        assert_eq!(graph.mark_complete(id(1)).unwrap(), vec![id(2)]);
    }

    #[test]
    fn test_forward_declaration_still_detects_cycles() {
        let mut graph = DependencyGraph::new().with_forward_declarations(true);
        graph.add_task(node(2, 0, &[1])).unwrap();

        let err = graph.add_task(node(1, 0, &[2])).unwrap_err();
        assert!(matches!(err, HeddleError::Cycle { .. }));
        assert_eq!(graph.state(id(1)), Some(NodeState::Declared));
    }

    #[test]
    fn test_duplicate_registration_is_invalid() {
        let mut graph = DependencyGraph::new();
        graph.add_task(node(1, 0, &[])).unwrap();

        assert!(matches!(
            graph.add_task(node(1, 0, &[])),
            Err(HeddleError::InvalidArgument(_))
        ));
        assert!(matches!(
            graph.add_batch(&[node(2, 0, &[]), node(2, 0, &[])]),
            Err(HeddleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_blocked_dependency_keeps_dependents_waiting() {
        let mut graph = DependencyGraph::new();
        graph.add_batch(&[node(1, 0, &[]), node(2, 0, &[1])]).unwrap();

        graph.mark_dispatched(id(1)).unwrap();
        graph.mark_blocked(id(1)).unwrap();
        assert_eq!(graph.state(id(2)), Some(NodeState::Waiting));
        assert!(ready(&graph).is_empty());

        assert!(graph.requeue(id(1)).unwrap());
        assert_eq!(ready(&graph), vec![id(1)]);
    }

    #[test]
    fn test_dispatch_requires_ready() {
        let mut graph = DependencyGraph::new();
        graph.add_batch(&[node(1, 0, &[]), node(2, 0, &[1])]).unwrap();

        assert!(graph.mark_dispatched(id(2)).is_err());
        assert!(matches!(
            graph.mark_dispatched(id(7)),
            Err(HeddleError::NotFound { .. })
        ));
        graph.mark_dispatched(id(1)).unwrap();
        assert!(graph.mark_dispatched(id(1)).is_err());
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let mut graph = DependencyGraph::new();
        graph
            .add_batch(&[node(1, 0, &[3]), node(2, 9, &[]), node(3, 0, &[]), node(4, 0, &[1, 2])])
            .unwrap();

        let order = graph.topological_order();
        let pos = |n| order.iter().position(|x| *x == id(n)).unwrap();

        assert_eq!(order.len(), 4);
        assert!(pos(3) < pos(1));
        assert!(pos(1) < pos(4));
        assert!(pos(2) < pos(4));
        // insertion order among available tasks
        assert_eq!(order, vec![id(2), id(3), id(1), id(4)]);
    }

    #[test]
    fn test_relationship_queries() {
        let mut graph = DependencyGraph::new();
        graph
            .add_batch(&[node(1, 0, &[]), node(2, 0, &[1]), node(3, 0, &[2]), node(4, 0, &[1])])
            .unwrap();

        assert_eq!(graph.dependencies_of(id(3)), vec![id(2)]);
        assert_eq!(graph.dependents_of(id(1)), vec![id(2), id(4)]);
        assert_eq!(graph.transitive_dependencies(id(3)), vec![id(1), id(2)]);
        assert!(graph.transitive_dependencies(id(1)).is_empty());
    }

    #[test]
    fn test_stats_follow_lifecycle() {
        let mut graph = DependencyGraph::new();
        graph
            .add_batch(&[node(1, 0, &[]), node(2, 0, &[]), node(3, 0, &[1])])
            .unwrap();
        graph.mark_dispatched(id(1)).unwrap();
        graph.mark_dispatched(id(2)).unwrap();
        graph.mark_complete(id(1)).unwrap();
        graph.mark_blocked(id(2)).unwrap();

        assert_eq!(
            graph.stats(),
            GraphStats {
                total: 3,
                waiting: 0,
                ready: 1,
                running: 0,
                completed: 1,
                blocked: 1,
                declared: 0,
            }
        );
    }
}
