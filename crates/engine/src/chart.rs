// SPDX-License-Identifier: Apache-2.0

//! Structural analysis and rendering of the assembled pipeline graph.
//!
//! The chart walks the graph from the root supply pipe, building a matrix
//! whose columns alternate workers and pipes left-to-right while rows
//! capture fanout, and collects the structural [`Warning`]s along the way.
//! The rendering is observability only; the stable tokens are `o<` (single
//! supply entry), `*<` (multi-supply entry), `+<` (fork output), and a
//! trailing `+` (join input), with dashes joining the segments of a row.

use crate::node::{RoleKind, WorkerDescriptor};
use dropflow_pipe::{PipeId, PipeInfo};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// A non-fatal structural observation about the assembled graph.
///
/// `Cycle` is the exception: the pipeline builder treats it as fatal, and a
/// cyclic chart is discarded (empty matrix, no discovery analysis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Warning {
    /// Some worker was supplied to the pipeline but never reached by the
    /// walk from the root supply pipe.
    Discovery,
    /// Some pipe in the graph has no consuming worker.
    Completeness,
    /// The graph contains a cycle; the chart is discarded.
    Cycle,
    /// Several workers push into the same pipe (legal only for supply
    /// pipes).
    MultipleInputs,
    /// A fork's outputs have differing base capacities.
    UnbalancedFork,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Self::Discovery => "Not all workers are discoverable.",
            Self::Completeness => "Not all pipes have a target worker.",
            Self::Cycle => "Cycle detected.",
            Self::MultipleInputs => "Multiple workers push into the same pipe.",
            Self::UnbalancedFork => "Unbalanced fork detected.",
        };
        write!(f, "{description}")
    }
}

#[derive(Debug, Clone)]
struct Cell {
    text: String,
}

/// The matrix-and-warnings view produced by the validator.
pub struct Chart {
    warnings: BTreeSet<Warning>,
    rows: Vec<Vec<Option<Cell>>>,
    rendered: String,
}

/// Graph indexes shared by the analyses: pipes by id, and the workers
/// producing into / consuming from each pipe.
struct Analysis<'a> {
    workers: &'a [WorkerDescriptor],
    pipes: HashMap<PipeId, PipeInfo>,
    producers: HashMap<PipeId, Vec<usize>>,
    consumers: HashMap<PipeId, Vec<usize>>,
}

impl<'a> Analysis<'a> {
    fn new(workers: &'a [WorkerDescriptor], root: &PipeInfo) -> Self {
        let mut pipes = HashMap::new();
        let mut producers: HashMap<PipeId, Vec<usize>> = HashMap::new();
        let mut consumers: HashMap<PipeId, Vec<usize>> = HashMap::new();
        let _ = pipes.insert(root.id, root.clone());
        for (index, worker) in workers.iter().enumerate() {
            for port in &worker.outputs {
                let _ = pipes.insert(port.info().id, port.info().clone());
                producers.entry(port.info().id).or_default().push(index);
            }
            for port in &worker.inputs {
                let _ = pipes.insert(port.info().id, port.info().clone());
                consumers.entry(port.info().id).or_default().push(index);
            }
        }
        Self {
            workers,
            pipes,
            producers,
            consumers,
        }
    }

    fn producer_count(&self, pipe: PipeId) -> usize {
        self.producers.get(&pipe).map_or(0, Vec::len)
    }

    /// Depth-first cycle search over the worker graph, following each
    /// worker's outputs to the workers consuming them.
    fn detect_cycles(&self) -> Vec<Vec<usize>> {
        fn visit(
            node: usize,
            analysis: &Analysis<'_>,
            visiting: &mut HashSet<usize>,
            visited: &mut HashSet<usize>,
            current_path: &mut Vec<usize>,
            cycles: &mut Vec<Vec<usize>>,
        ) {
            if visited.contains(&node) {
                return;
            }
            if visiting.contains(&node) {
                if let Some(position) = current_path.iter().position(|&n| n == node) {
                    cycles.push(current_path[position..].to_vec());
                }
                return;
            }
            let _ = visiting.insert(node);
            current_path.push(node);

            for port in &analysis.workers[node].outputs {
                if let Some(targets) = analysis.consumers.get(&port.info().id) {
                    for &target in targets {
                        visit(target, analysis, visiting, visited, current_path, cycles);
                    }
                }
            }

            let _ = visiting.remove(&node);
            let _ = visited.insert(node);
            let _ = current_path.pop();
        }

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut current_path = Vec::new();
        let mut cycles = Vec::new();

        for node in 0..self.workers.len() {
            if !visited.contains(&node) {
                visit(
                    node,
                    self,
                    &mut visiting,
                    &mut visited,
                    &mut current_path,
                    &mut cycles,
                );
            }
        }

        cycles
    }

    fn pipe_cell(&self, pipe: PipeId) -> Cell {
        let info = &self.pipes[&pipe];
        let from_fork = self
            .producers
            .get(&pipe)
            .is_some_and(|ps| ps.iter().any(|&w| self.workers[w].kind == RoleKind::Fork));
        let to_join = self
            .consumers
            .get(&pipe)
            .is_some_and(|cs| cs.iter().any(|&w| self.workers[w].kind == RoleKind::Join));
        let mut text = String::new();
        if from_fork {
            text.push_str("+<");
        } else if info.supply {
            text.push_str(if self.producer_count(pipe) >= 2 {
                "*<"
            } else {
                "o<"
            });
        }
        text.push_str(&info.name);
        if to_join {
            text.push('+');
        }
        Cell { text }
    }
}

/// The matrix walk from the root supply pipe.
struct Walk<'a> {
    analysis: &'a Analysis<'a>,
    rows: Vec<Vec<Option<Cell>>>,
    placed: HashSet<usize>,
    visited_pipes: HashSet<PipeId>,
    /// Strict upper bound on the columns of an acyclic layout.
    max_col: usize,
    cycle: bool,
}

impl<'a> Walk<'a> {
    fn run(analysis: &'a Analysis<'a>, root: PipeId) -> Self {
        let mut walk = Self {
            analysis,
            rows: Vec::new(),
            placed: HashSet::new(),
            visited_pipes: HashSet::new(),
            max_col: 2 * analysis.workers.len() + 1,
            cycle: false,
        };
        // Suppliers feeding the root occupy the leftmost column.
        let entry = analysis.producers.get(&root).cloned().unwrap_or_default();
        for (i, &worker) in entry.iter().enumerate() {
            let row = if i == 0 { 0 } else { walk.next_row() };
            walk.place(
                row,
                0,
                Cell {
                    text: analysis.workers[worker].name.clone(),
                },
            );
            let _ = walk.placed.insert(worker);
        }
        walk.walk_pipe(root, 0, 1);
        walk
    }

    fn next_row(&self) -> usize {
        self.rows.len()
    }

    fn place(&mut self, row: usize, col: usize, cell: Cell) {
        while self.rows.len() <= row {
            self.rows.push(Vec::new());
        }
        let cells = &mut self.rows[row];
        while cells.len() <= col {
            cells.push(None);
        }
        cells[col] = Some(cell);
    }

    fn walk_pipe(&mut self, pipe: PipeId, row: usize, col: usize) {
        if self.cycle {
            return;
        }
        if col > self.max_col {
            self.cycle = true;
            return;
        }
        let first_visit = self.visited_pipes.insert(pipe);
        self.place(row, col, self.analysis.pipe_cell(pipe));
        if !first_visit {
            return;
        }
        let consumers = self
            .analysis
            .consumers
            .get(&pipe)
            .cloned()
            .unwrap_or_default();
        let mut first = true;
        for worker in consumers {
            if self.placed.contains(&worker) {
                // A second route into a placed worker: a join input (or a
                // diamond); the pipe already carries the join marker.
                continue;
            }
            let target_row = if first { row } else { self.next_row() };
            first = false;
            self.walk_worker(worker, target_row, col + 1);
        }
    }

    fn walk_worker(&mut self, worker: usize, row: usize, col: usize) {
        if self.cycle {
            return;
        }
        if col > self.max_col {
            self.cycle = true;
            return;
        }
        self.place(
            row,
            col,
            Cell {
                text: self.analysis.workers[worker].name.clone(),
            },
        );
        let _ = self.placed.insert(worker);
        let mut first = true;
        for port in &self.analysis.workers[worker].outputs {
            let target_row = if first { row } else { self.next_row() };
            first = false;
            self.walk_pipe(port.info().id, target_row, col + 1);
        }
    }
}

fn render(rows: &[Vec<Option<Cell>>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in rows {
        for (col, cell) in row.iter().enumerate() {
            if let Some(cell) = cell {
                widths[col] = widths[col].max(cell.text.len());
            }
        }
    }
    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for col in 0..columns {
            let cell = row.get(col).and_then(Option::as_ref);
            let text = cell.map_or("", |cell| cell.text.as_str());
            line.push_str(&format!("{text:<width$}", width = widths[col]));
            if col + 1 < columns {
                let next = row.get(col + 1).and_then(Option::as_ref);
                let connected = cell.is_some() && next.is_some();
                line.push_str(if connected { "--" } else { "  " });
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

impl Chart {
    /// Analyzes the graph spanned by `workers`, walking from the `root`
    /// supply pipe.
    #[must_use]
    pub fn build(workers: &[WorkerDescriptor], root: &PipeInfo) -> Self {
        let analysis = Analysis::new(workers, root);
        let mut warnings = BTreeSet::new();

        for &pipe in analysis.pipes.keys() {
            if analysis.producer_count(pipe) >= 2 {
                let _ = warnings.insert(Warning::MultipleInputs);
            }
            if analysis.consumers.get(&pipe).is_none_or(Vec::is_empty) {
                let _ = warnings.insert(Warning::Completeness);
            }
        }
        for worker in workers {
            if worker.kind == RoleKind::Fork {
                let mut capacities = worker.outputs.iter().map(|p| p.info().base_capacity);
                if let Some(first) = capacities.next() {
                    if capacities.any(|c| c != first) {
                        let _ = warnings.insert(Warning::UnbalancedFork);
                    }
                }
            }
        }

        let mut rows = Vec::new();
        let mut rendered = String::new();
        if analysis.detect_cycles().is_empty() {
            let walk = Walk::run(&analysis, root.id);
            if walk.cycle {
                let _ = warnings.insert(Warning::Cycle);
            } else {
                let undiscovered = (0..workers.len())
                    .any(|w| !workers[w].internal && !walk.placed.contains(&w));
                if undiscovered {
                    let _ = warnings.insert(Warning::Discovery);
                }
                rows = walk.rows;
                rendered = render(&rows);
            }
        } else {
            let _ = warnings.insert(Warning::Cycle);
        }

        Self {
            warnings,
            rows,
            rendered,
        }
    }

    /// The structural warnings observed on the graph.
    #[must_use]
    pub fn warnings(&self) -> &BTreeSet<Warning> {
        &self.warnings
    }

    /// Whether the chart was discarded (cyclic graph) or has no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The rendered ASCII diagram; empty for a discarded chart.
    #[must_use]
    pub fn render(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for Chart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl fmt::Debug for Chart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chart")
            .field("warnings", &self.warnings)
            .field("rows", &self.rows.len())
            .finish()
    }
}
