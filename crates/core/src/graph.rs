use crate::error::{OrchestratorError, Result};
use crate::types::{
    DagDefinition, DispatchHandle, InstanceId, TaskId, TaskRecord, TaskSpec, TaskState,
    WorkflowState,
};
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// A task node: its static spec plus the mutable execution state
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub spec: TaskSpec,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub dispatch_handle: Option<DispatchHandle>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskNode {
    fn new(mut spec: TaskSpec, now: DateTime<Utc>) -> Self {
        if spec.name.is_empty() {
            spec.name = spec.id.0.clone();
        }
        Self {
            spec,
            state: TaskState::Waiting,
            result: None,
            error: None,
            dispatch_handle: None,
            dispatched_at: None,
            attempt: 0,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }
}

/// DAG of task nodes for one workflow instance.
///
/// The structure is fixed at construction; afterwards only node execution
/// state changes, and only through the transition table on [`TaskState`].
/// Edges point from a predecessor to the task that depends on it.
pub struct GraphModel {
    name: String,
    graph: DiGraph<TaskNode, ()>,
    indices: HashMap<TaskId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl GraphModel {
    /// Build and validate a graph from a definition
    pub fn from_definition(definition: &DagDefinition, now: DateTime<Utc>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for spec in &definition.tasks {
            if indices.contains_key(&spec.id) {
                return Err(OrchestratorError::DuplicateTask(spec.id.clone()));
            }
            let node = graph.add_node(TaskNode::new(spec.clone(), now));
            indices.insert(spec.id.clone(), node);
        }

        for spec in &definition.tasks {
            let task_idx = indices[&spec.id];
            for pred in &spec.predecessors {
                let pred_idx = indices.get(pred).ok_or_else(|| {
                    OrchestratorError::DanglingReference {
                        task: spec.id.clone(),
                        missing: pred.clone(),
                    }
                })?;
                graph.update_edge(*pred_idx, task_idx, ());
            }
        }

        if let Some(path) = find_cycle(&graph) {
            return Err(OrchestratorError::CyclicGraph(path));
        }

        let order = topological_sort(&graph);

        Ok(Self {
            name: definition.name.clone(),
            graph,
            indices,
            order,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.indices.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.node(id).map(|n| n.state)
    }

    fn index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.indices
            .get(id)
            .copied()
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", id)))
    }

    fn neighbors(&self, idx: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        out.sort();
        out
    }

    fn ids(&self, nodes: impl IntoIterator<Item = NodeIndex>) -> Vec<TaskId> {
        nodes
            .into_iter()
            .map(|n| self.graph[n].spec.id.clone())
            .collect()
    }

    /// Tasks with no predecessors, in definition order
    pub fn entry_tasks(&self) -> Vec<TaskId> {
        let entries = self.graph.node_indices().filter(|&n| {
            self.graph
                .neighbors_directed(n, Direction::Incoming)
                .next()
                .is_none()
        });
        self.ids(entries)
    }

    /// Every task, dependencies first
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.ids(self.order.iter().copied())
    }

    pub fn predecessors(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let idx = self.index(id)?;
        Ok(self.ids(self.neighbors(idx, Direction::Incoming)))
    }

    pub fn successors(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let idx = self.index(id)?;
        Ok(self.ids(self.neighbors(idx, Direction::Outgoing)))
    }

    /// All tasks reachable from `id`, excluding `id`, in breadth-first order
    pub fn downstream_closure(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let start = self.index(id)?;
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut closure = Vec::new();

        while let Some(node) = queue.pop_front() {
            for next in self.neighbors(node, Direction::Outgoing) {
                if seen.insert(next) {
                    closure.push(next);
                    queue.push_back(next);
                }
            }
        }

        Ok(self.ids(closure))
    }

    /// Apply the dependency rule to every waiting or ready task.
    ///
    /// Runs in topological order so a skip cascades through the whole
    /// downstream closure in one pass. Returns the tasks whose state changed.
    pub fn refresh_readiness(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut changed = Vec::new();

        for i in 0..self.order.len() {
            let idx = self.order[i];
            let state = self.graph[idx].state;
            if !matches!(state, TaskState::Waiting | TaskState::Ready) {
                continue;
            }

            let preds = self.neighbors(idx, Direction::Incoming);
            let poisoned = preds
                .iter()
                .any(|p| self.graph[*p].state.poisons_successors());
            let satisfied = preds
                .iter()
                .all(|p| self.graph[*p].state == TaskState::Completed);

            let next = if poisoned {
                TaskState::Skipped
            } else if state == TaskState::Waiting && satisfied {
                TaskState::Ready
            } else {
                continue;
            };

            let node = &mut self.graph[idx];
            node.state = next;
            node.updated_at = now;
            changed.push(node.spec.id.clone());
        }

        changed
    }

    /// Move one task to a new state, rejecting transitions the table does not allow
    pub fn transition(&mut self, id: &TaskId, to: TaskState, now: DateTime<Utc>) -> Result<()> {
        let idx = self.index(id)?;
        let node = &mut self.graph[idx];
        if !node.state.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTaskTransition {
                task: id.clone(),
                from: node.state,
                to,
            });
        }
        node.state = to;
        node.updated_at = now;
        Ok(())
    }

    pub fn record_dispatch(
        &mut self,
        id: &TaskId,
        handle: DispatchHandle,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, TaskState::Dispatched, now)?;
        let node = &mut self.graph[self.indices[id]];
        node.dispatch_handle = Some(handle);
        node.dispatched_at = Some(now);
        node.attempt += 1;
        Ok(())
    }

    pub fn record_result(&mut self, id: &TaskId, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, TaskState::Completed, now)?;
        self.graph[self.indices[id]].result = Some(result);
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        id: &TaskId,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, TaskState::Failed, now)?;
        self.graph[self.indices[id]].error = Some(error.into());
        Ok(())
    }

    /// Skip every non-terminal task in the downstream closure of `id`
    pub fn skip_downstream(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut skipped = Vec::new();
        for task in self.downstream_closure(id)? {
            if self.skip(&task, now)? {
                skipped.push(task);
            }
        }
        Ok(skipped)
    }

    /// Skip every non-terminal task
    pub fn skip_all(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        for i in 0..self.order.len() {
            let node = &mut self.graph[self.order[i]];
            if !node.state.is_terminal() {
                node.state = TaskState::Skipped;
                node.updated_at = now;
                skipped.push(node.spec.id.clone());
            }
        }
        skipped
    }

    fn skip(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        match self.state(id) {
            Some(state) if state.is_terminal() => Ok(false),
            Some(_) => self.transition(id, TaskState::Skipped, now).map(|_| true),
            None => Err(OrchestratorError::NotFound(format!("task {}", id))),
        }
    }

    /// Tasks currently in `state`, dependencies first
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<TaskId> {
        let nodes = self
            .order
            .iter()
            .copied()
            .filter(|n| self.graph[*n].state == state);
        self.ids(nodes)
    }

    pub fn any_in_flight(&self) -> bool {
        self.graph
            .node_weights()
            .any(|n| n.state.is_in_flight())
    }

    /// Every node has reached completed, failed or skipped
    pub fn is_terminal(&self) -> bool {
        self.graph.node_weights().all(|n| n.state.is_terminal())
    }

    /// Instance state implied by the node states once every node is terminal.
    ///
    /// Skips only follow a failure or an unselected branch, so an instance
    /// fails exactly when one of its tasks failed.
    pub fn computed_outcome(&self) -> WorkflowState {
        if self
            .graph
            .node_weights()
            .any(|n| n.state == TaskState::Failed)
        {
            WorkflowState::Failed
        } else {
            WorkflowState::Completed
        }
    }

    /// Input handed to a task on dispatch.
    ///
    /// Entry tasks receive the instance's initial input. Other tasks receive an
    /// object keyed by predecessor id, with each result also exposed under the
    /// slot label the task assigns to that predecessor.
    pub fn input_for(&self, id: &TaskId, initial: &Value) -> Result<Value> {
        let idx = self.index(id)?;
        let preds = self.neighbors(idx, Direction::Incoming);
        if preds.is_empty() {
            return Ok(initial.clone());
        }

        let slots = &self.graph[idx].spec.slots;
        let mut input = serde_json::Map::new();
        for pred in preds {
            let node = &self.graph[pred];
            let result = node.result.clone().unwrap_or(Value::Null);
            if let Some(label) = slots.get(node.id()) {
                input.insert(label.clone(), result.clone());
            }
            input.insert(node.spec.id.0.clone(), result);
        }
        Ok(Value::Object(input))
    }

    /// Overlay persisted execution state onto the matching node
    pub fn restore(&mut self, record: &TaskRecord) -> Result<()> {
        let idx = self.indices.get(&record.id).copied().ok_or_else(|| {
            OrchestratorError::corruption(
                format!("tasks/{}/{}", record.instance_id, record.id),
                "task is not part of the definition",
            )
        })?;

        let node = &mut self.graph[idx];
        node.state = record.state;
        node.result = record.result.clone();
        node.error = record.error.clone();
        node.dispatch_handle = record.dispatch_handle.clone();
        node.dispatched_at = record.dispatched_at;
        node.attempt = record.attempt;
        node.updated_at = record.updated_at;
        Ok(())
    }

    pub fn to_record(&self, instance_id: InstanceId, id: &TaskId) -> Result<TaskRecord> {
        let idx = self.index(id)?;
        let preds = self.ids(self.neighbors(idx, Direction::Incoming));
        let node = &self.graph[idx];
        Ok(TaskRecord {
            id: node.spec.id.clone(),
            instance_id,
            state: node.state,
            predecessors: preds,
            result: node.result.clone(),
            error: node.error.clone(),
            dispatch_handle: node.dispatch_handle.clone(),
            dispatched_at: node.dispatched_at,
            attempt: node.attempt,
            updated_at: node.updated_at,
        })
    }
}

/// Kahn's algorithm, breaking ties by definition order
fn topological_sort(graph: &DiGraph<TaskNode, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

/// Iterative three-color depth-first search; returns the first cycle found,
/// closed on its starting task.
fn find_cycle(graph: &DiGraph<TaskNode, ()>) -> Option<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let successors = |n: NodeIndex| {
        let mut out: Vec<NodeIndex> = graph.neighbors_directed(n, Direction::Outgoing).collect();
        // popped from the back, so visit in ascending index order
        out.sort_by(|a, b| b.cmp(a));
        out
    };

    let mut marks = vec![Mark::White; graph.node_count()];

    for start in graph.node_indices() {
        if marks[start.index()] != Mark::White {
            continue;
        }

        marks[start.index()] = Mark::Gray;
        let mut stack = vec![(start, successors(start))];

        loop {
            let Some((node, pending)) = stack.last_mut() else {
                break;
            };
            let node = *node;

            let next = pending.pop();
            match next {
                Some(next) => match marks[next.index()] {
                    Mark::White => {
                        marks[next.index()] = Mark::Gray;
                        stack.push((next, successors(next)));
                    }
                    Mark::Gray => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<TaskId> = stack[from..]
                            .iter()
                            .map(|(n, _)| graph[*n].spec.id.clone())
                            .collect();
                        path.push(graph[next].spec.id.clone());
                        return Some(path);
                    }
                    Mark::Black => {}
                },
                None => {
                    marks[node.index()] = Mark::Black;
                    stack.pop();
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dag(tasks: Vec<TaskSpec>) -> DagDefinition {
        DagDefinition {
            name: "test".to_string(),
            tasks,
        }
    }

    fn diamond() -> GraphModel {
        GraphModel::from_definition(
            &dag(vec![
                TaskSpec::new("a"),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c").after(["a"]),
                TaskSpec::new("d").after(["b", "c"]),
            ]),
            Utc::now(),
        )
        .unwrap()
    }

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|s| TaskId::new(*s)).collect()
    }

    #[test]
    fn test_linear_dag() {
        let graph = GraphModel::from_definition(
            &dag(vec![
                TaskSpec::new("step3").after(["step2"]),
                TaskSpec::new("step1"),
                TaskSpec::new("step2").after(["step1"]),
            ]),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(graph.topological_order(), ids(&["step1", "step2", "step3"]));
        assert_eq!(graph.entry_tasks(), ids(&["step1"]));
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let err = GraphModel::from_definition(
            &dag(vec![
                TaskSpec::new("a").after(["c"]),
                TaskSpec::new("b").after(["a"]),
                TaskSpec::new("c").after(["b"]),
            ]),
            Utc::now(),
        )
        .err()
        .unwrap();

        match err {
            OrchestratorError::CyclicGraph(path) => {
                assert_eq!(path, ids(&["a", "b", "c", "a"]));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = GraphModel::from_definition(&dag(vec![TaskSpec::new("a").after(["a"])]), Utc::now())
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::CyclicGraph(path) if path == ids(&["a", "a"])));
    }

    #[test]
    fn test_dangling_and_duplicate_rejected() {
        let dangling =
            GraphModel::from_definition(&dag(vec![TaskSpec::new("a").after(["ghost"])]), Utc::now())
                .err()
                .unwrap();
        assert!(matches!(
            dangling,
            OrchestratorError::DanglingReference { ref missing, .. } if missing.as_str() == "ghost"
        ));

        let duplicate =
            GraphModel::from_definition(&dag(vec![TaskSpec::new("a"), TaskSpec::new("a")]), Utc::now())
                .err()
                .unwrap();
        assert!(matches!(duplicate, OrchestratorError::DuplicateTask(_)));
    }

    #[test]
    fn test_downstream_closure_is_breadth_first() {
        let graph = diamond();
        assert_eq!(
            graph.downstream_closure(&TaskId::new("a")).unwrap(),
            ids(&["b", "c", "d"])
        );
        assert_eq!(graph.downstream_closure(&TaskId::new("d")).unwrap(), vec![]);
        assert_eq!(graph.predecessors(&TaskId::new("d")).unwrap(), ids(&["b", "c"]));
    }

    #[test]
    fn test_readiness_requires_all_predecessors_completed() {
        let now = Utc::now();
        let mut graph = diamond();

        assert_eq!(graph.refresh_readiness(now), ids(&["a"]));
        graph.record_dispatch(&TaskId::new("a"), DispatchHandle::generate(), now).unwrap();
        graph.record_result(&TaskId::new("a"), json!(1), now).unwrap();

        assert_eq!(graph.refresh_readiness(now), ids(&["b", "c"]));
        graph.record_dispatch(&TaskId::new("b"), DispatchHandle::generate(), now).unwrap();
        graph.record_result(&TaskId::new("b"), json!(2), now).unwrap();

        assert!(graph.refresh_readiness(now).is_empty());
        assert_eq!(graph.state(&TaskId::new("d")), Some(TaskState::Waiting));
    }

    #[test]
    fn test_failure_poisons_downstream_closure() {
        let now = Utc::now();
        let mut graph = diamond();

        graph.refresh_readiness(now);
        graph.record_dispatch(&TaskId::new("a"), DispatchHandle::generate(), now).unwrap();
        graph.record_failure(&TaskId::new("a"), "boom", now).unwrap();

        assert_eq!(graph.refresh_readiness(now), ids(&["b", "c", "d"]));
        assert!(graph.is_terminal());
        assert_eq!(graph.computed_outcome(), WorkflowState::Failed);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let now = Utc::now();
        let mut graph = diamond();

        let err = graph
            .transition(&TaskId::new("d"), TaskState::Dispatched, now)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTaskTransition { .. }));
        assert_eq!(graph.state(&TaskId::new("d")), Some(TaskState::Waiting));
    }

    #[test]
    fn test_input_aggregates_predecessor_results_and_slots() {
        let now = Utc::now();
        let mut graph = GraphModel::from_definition(
            &dag(vec![
                TaskSpec::new("fetch"),
                TaskSpec::new("load").after(["fetch"]).with_slot("fetch", "rows"),
            ]),
            now,
        )
        .unwrap();

        let initial = json!({"url": "s3://bucket"});
        assert_eq!(graph.input_for(&TaskId::new("fetch"), &initial).unwrap(), initial);

        graph.refresh_readiness(now);
        graph.record_dispatch(&TaskId::new("fetch"), DispatchHandle::generate(), now).unwrap();
        graph.record_result(&TaskId::new("fetch"), json!([1, 2]), now).unwrap();

        assert_eq!(
            graph.input_for(&TaskId::new("load"), &initial).unwrap(),
            json!({"fetch": [1, 2], "rows": [1, 2]})
        );
    }

    #[test]
    fn test_restore_roundtrips_record() {
        let now = Utc::now();
        let instance = InstanceId::new();
        let mut graph = diamond();
        graph.refresh_readiness(now);
        graph.record_dispatch(&TaskId::new("a"), DispatchHandle::generate(), now).unwrap();

        let record = graph.to_record(instance, &TaskId::new("a")).unwrap();
        assert_eq!(record.attempt, 1);

        let mut fresh = diamond();
        fresh.restore(&record).unwrap();
        assert_eq!(fresh.state(&TaskId::new("a")), Some(TaskState::Dispatched));
        assert_eq!(fresh.node(&TaskId::new("a")).unwrap().dispatch_handle, record.dispatch_handle);

        let mut stray = record.clone();
        stray.id = TaskId::new("zzz");
        assert!(matches!(
            fresh.restore(&stray),
            Err(OrchestratorError::StoreCorruption { .. })
        ));
    }
}
