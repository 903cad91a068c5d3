use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definition::{PipelineDefinition, StageDefinition};
use crate::error::{PipelineError, PipelineResult};
use crate::report::RunRecord;

/// Validated stage dependency graph. Indices follow declaration order.
#[derive(Debug, Clone)]
pub struct JobGraph {
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl JobGraph {
    /// Rejects duplicate ids, unknown `needs` and cycles before anything runs.
    pub fn build(definition: &PipelineDefinition) -> PipelineResult<Self> {
        let stages = definition.stages.clone();
        let mut index = HashMap::with_capacity(stages.len());
        for (idx, stage) in stages.iter().enumerate() {
            if index.insert(stage.id.clone(), idx).is_some() {
                return Err(PipelineError::DuplicateStage(stage.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); stages.len()];
        let mut dependents = vec![Vec::new(); stages.len()];
        for (idx, stage) in stages.iter().enumerate() {
            for need in &stage.needs {
                let dep = *index.get(need).ok_or_else(|| PipelineError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: need.clone(),
                })?;
                if !dependencies[idx].contains(&dep) {
                    dependencies[idx].push(dep);
                    dependents[dep].push(idx);
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let mut graph = Self {
            stages,
            index,
            dependencies,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.kahn_order()?;
        Ok(graph)
    }

    /// Kahn's algorithm; among ready stages the earliest declared goes first.
    fn kahn_order(&self) -> PipelineResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &dependent in &self.dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.stages.len() {
            Ok(order)
        } else {
            let placed: BTreeSet<usize> = order.into_iter().collect();
            Err(PipelineError::CycleDetected {
                cycle: self.find_cycle(&placed),
            })
        }
    }

    /// Walks `needs` edges among unplaced stages and returns the first closed
    /// path, e.g. `[a, b, a]`.
    fn find_cycle(&self, placed: &BTreeSet<usize>) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(graph: &JobGraph, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
            marks[node] = Mark::Active;
            path.push(node);
            for &dep in &graph.dependencies[node] {
                match marks[dep] {
                    Mark::Active => {
                        let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(graph, dep, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks: Vec<Mark> = (0..self.stages.len())
            .map(|idx| if placed.contains(&idx) { Mark::Done } else { Mark::New })
            .collect();
        for start in 0..self.stages.len() {
            if marks[start] != Mark::New {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, start, &mut marks, &mut path) {
                return cycle.into_iter().map(|idx| self.stages[idx].id.clone()).collect();
            }
        }
        Vec::new()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, idx: usize) -> &StageDefinition {
        &self.stages[idx]
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.id.clone()).collect()
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&idx| self.stages[idx].id.as_str())
            .collect()
    }

    /// Stages grouped by depth: every stage in batch `n` only needs stages
    /// from batches before `n`.
    pub fn batches(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.stages.len()];
        for &idx in &self.order {
            depth[idx] = self.dependencies[idx]
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
        }
        let levels = depth.iter().copied().max().map_or(0, |max| max + 1);
        let mut batches = vec![Vec::new(); levels];
        for (idx, stage) in self.stages.iter().enumerate() {
            batches[depth[idx]].push(stage.id.as_str());
        }
        batches
    }

    /// Every stage reachable through `needs` from `id`, excluding `id`.
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(start) = self.position(id) else {
            return BTreeSet::new();
        };
        let mut stack = self.dependencies[start].clone();
        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(self.dependencies[idx].iter().copied());
            }
        }
        seen.into_iter()
            .map(|idx| self.stages[idx].id.clone())
            .collect()
    }
}

/// Runs one stage and always returns a terminal record.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run_stage(&self, stage: &StageDefinition, cancel: &CancellationToken) -> RunRecord;
}

/// Dispatches stages as soon as every dependency unblocked them, with at
/// most `max_parallel` in flight.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_parallel: usize,
}

impl Scheduler {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Returns one terminal record per stage, in completion order.
    pub async fn run(
        &self,
        graph: &JobGraph,
        executor: Arc<dyn StageExecutor>,
        cancel: &CancellationToken,
    ) -> Vec<RunRecord> {
        let mut progress = Progress::new(graph);
        let mut running: JoinSet<(usize, RunRecord)> = JoinSet::new();

        loop {
            while running.len() < self.max_parallel {
                let Some(Reverse(idx)) = progress.ready.pop() else {
                    break;
                };
                let stage = graph.stage(idx).clone();
                if cancel.is_cancelled() {
                    progress.settle(graph, idx, RunRecord::skipped(&stage.id, stage.gate, "run cancelled"));
                    continue;
                }
                debug!(stage = stage.id.as_str(), "Dispatching stage");
                running.spawn(dispatch(idx, stage, executor.clone(), cancel.clone()));
            }

            match running.join_next().await {
                Some(Ok((idx, record))) => progress.settle(graph, idx, record),
                Some(Err(err)) => {
                    // dispatch() never panics; the stage body runs on its own task.
                    warn!(error = %err, "Scheduler task aborted");
                }
                None => break,
            }
        }

        // Anything never reached (only possible if a task was aborted) is skipped.
        for idx in 0..graph.len() {
            if !progress.settled[idx] {
                let stage = graph.stage(idx);
                progress.settle(graph, idx, RunRecord::skipped(&stage.id, stage.gate, "never scheduled"));
            }
        }

        info!(stages = progress.completed.len(), "Scheduler finished");
        progress.completed
    }
}

async fn dispatch(
    idx: usize,
    stage: StageDefinition,
    executor: Arc<dyn StageExecutor>,
    cancel: CancellationToken,
) -> (usize, RunRecord) {
    let task = {
        let stage = stage.clone();
        tokio::spawn(async move { executor.run_stage(&stage, &cancel).await })
    };
    let record = match task.await {
        Ok(record) => record,
        Err(err) => {
            warn!(stage = stage.id.as_str(), error = %err, "Stage task crashed");
            let mut record = RunRecord::pending(&stage.id, stage.gate);
            record.start();
            record.fail(
                &PipelineError::ActionExecutionFailed {
                    action: stage.id.clone(),
                    reason: format!("stage task crashed: {err}"),
                },
                String::new(),
            );
            record
        }
    };
    (idx, record)
}

struct Progress {
    waiting_on: Vec<usize>,
    settled: Vec<bool>,
    /// Earliest declared first, matching `JobGraph::topological_order`.
    ready: BinaryHeap<Reverse<usize>>,
    completed: Vec<RunRecord>,
}

impl Progress {
    fn new(graph: &JobGraph) -> Self {
        let waiting_on: Vec<usize> = (0..graph.len())
            .map(|idx| graph.dependencies(idx).len())
            .collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();
        Self {
            waiting_on,
            settled: vec![false; graph.len()],
            ready,
            completed: Vec::with_capacity(graph.len()),
        }
    }

    /// Records a terminal stage, then releases or skips its dependents.
    /// Skips cascade transitively.
    fn settle(&mut self, graph: &JobGraph, idx: usize, record: RunRecord) {
        let mut pending = vec![(idx, record)];
        while let Some((idx, record)) = pending.pop() {
            if self.settled[idx] {
                continue;
            }
            self.settled[idx] = true;
            let unblocks = record.unblocks_dependents();
            let stage_id = record.stage.clone();
            let outcome = record.status.as_str();
            info!(stage = stage_id.as_str(), status = outcome, "Stage finished");
            self.completed.push(record);

            let mut skipped = Vec::new();
            for &dependent in graph.dependents(idx) {
                if self.settled[dependent] {
                    continue;
                }
                if unblocks {
                    self.waiting_on[dependent] -= 1;
                    if self.waiting_on[dependent] == 0 {
                        self.ready.push(Reverse(dependent));
                    }
                } else {
                    let stage = graph.stage(dependent);
                    skipped.push((
                        dependent,
                        RunRecord::skipped(
                            &stage.id,
                            stage.gate,
                            format!("dependency '{stage_id}' {outcome}"),
                        ),
                    ));
                }
            }
            // Stack: reversed so skips settle in declaration order.
            pending.extend(skipped.into_iter().rev());
        }
    }
}
