//! The frozen dependency graph.
//!
//! Built once when a run starts, from the connections the scenario
//! declared. Edges keep their resolved attribute flows (with trigger
//! and persistence flags baked in) and the [`TieredInterval`] that
//! maps source-side times into the destination's frame. The subgraph
//! of strict edges — immediate, non-weak — must be acyclic; weak and
//! time-shifted edges are what breaks feedback loops.

use std::collections::BTreeMap;
use tandem_types::{ConfigError, EntityId, SimId, SimValue, TieredInterval};

/// One attribute pair carried by a flow, with the destination-side
/// classification resolved at connect time.
#[derive(Debug, Clone)]
pub(crate) struct AttrPair {
    /// Source attribute.
    pub src: String,
    /// Destination attribute.
    pub dst: String,
    /// Arrival causes the destination to step.
    pub trigger: bool,
    /// The destination keeps the last value readable.
    pub persistent: bool,
}

/// The entity-to-entity part of a connection.
#[derive(Debug, Clone)]
pub(crate) struct Flow {
    /// Source entity.
    pub src_eid: EntityId,
    /// Destination entity.
    pub dst_eid: EntityId,
    /// The attribute pairs exchanged between the two.
    pub pairs: Vec<AttrPair>,
}

/// A frozen edge between two simulators.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    /// Source node index.
    pub src: usize,
    /// Destination node index.
    pub dst: usize,
    /// Weak edges order same-time loops without blocking them.
    pub weak: bool,
    /// Time shift on the real clock; 0 for immediate edges.
    pub shift: u64,
    /// The destination may reach back to the source (`get_data`) and
    /// the source may push ahead (`set_data`).
    pub async_requests: bool,
    /// Maps source-frame times to destination-frame times.
    pub interval: TieredInterval,
    /// The entity flows riding this edge.
    pub flows: Vec<Flow>,
    /// Fallback values per source attribute for reads that reach
    /// before the start of the simulation.
    pub initial: BTreeMap<String, SimValue>,
}

impl Edge {
    /// Whether any carried attribute triggers the destination.
    pub fn has_trigger(&self) -> bool {
        self.flows
            .iter()
            .any(|f| f.pairs.iter().any(|p| p.trigger))
    }
}

/// The frozen graph: edges plus per-node adjacency and ranks.
#[derive(Debug)]
pub(crate) struct DependencyGraph {
    /// All edges.
    pub edges: Vec<Edge>,
    /// Per node: indices of edges arriving at it.
    pub preds: Vec<Vec<usize>>,
    /// Per node: indices of edges leaving it.
    pub succs: Vec<Vec<usize>>,
    /// Topological rank of each node in the strict subgraph, used as
    /// the primary key of deadlock resolution.
    pub ranks: Vec<usize>,
}

impl DependencyGraph {
    /// Freeze `edges` over `node_count` simulators.
    ///
    /// # Errors
    ///
    /// [`ConfigError::StrictCycle`] when the strict subgraph is
    /// cyclic, naming one witnessing cycle.
    pub fn build(
        node_count: usize,
        edges: Vec<Edge>,
        sids: &[SimId],
    ) -> Result<Self, ConfigError> {
        let mut preds = vec![Vec::new(); node_count];
        let mut succs = vec![Vec::new(); node_count];
        for (i, edge) in edges.iter().enumerate() {
            preds[edge.dst].push(i);
            succs[edge.src].push(i);
        }

        let ranks = strict_ranks(node_count, &edges, sids)?;

        Ok(Self {
            edges,
            preds,
            succs,
            ranks,
        })
    }
}

/// Kahn's algorithm over the strict subgraph: longest-path ranks, or
/// the witnessing cycle if one exists.
fn strict_ranks(
    node_count: usize,
    edges: &[Edge],
    sids: &[SimId],
) -> Result<Vec<usize>, ConfigError> {
    let strict: Vec<&Edge> = edges
        .iter()
        .filter(|e| !e.weak && e.shift == 0 && e.src != e.dst)
        .collect();

    let mut in_degree = vec![0usize; node_count];
    for e in &strict {
        in_degree[e.dst] += 1;
    }

    let mut ranks = vec![0usize; node_count];
    let mut ready: Vec<usize> = (0..node_count).filter(|&n| in_degree[n] == 0).collect();
    let mut visited = 0;
    while let Some(n) = ready.pop() {
        visited += 1;
        for e in strict.iter().filter(|e| e.src == n) {
            ranks[e.dst] = ranks[e.dst].max(ranks[n] + 1);
            in_degree[e.dst] -= 1;
            if in_degree[e.dst] == 0 {
                ready.push(e.dst);
            }
        }
    }

    if visited == node_count {
        return Ok(ranks);
    }

    // residue nodes all lie on or downstream of a cycle; walk
    // predecessors within the residue until a node repeats
    let in_residue: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    let start = in_residue
        .iter()
        .position(|&r| r)
        .expect("residue is nonempty");
    let mut path = vec![start];
    let mut current = start;
    let cycle = loop {
        let pred = strict
            .iter()
            .find(|e| e.dst == current && in_residue[e.src])
            .expect("residue nodes keep a residue predecessor")
            .src;
        if let Some(pos) = path.iter().position(|&n| n == pred) {
            let mut cycle: Vec<SimId> = path[pos..].iter().map(|&n| sids[n].clone()).collect();
            cycle.reverse();
            cycle.push(sids[pred].clone());
            break cycle;
        }
        path.push(pred);
        current = pred;
    };
    Err(ConfigError::StrictCycle { cycle })
}
