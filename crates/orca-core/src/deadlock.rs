//! Wait-for graph over labware, rebuilt every tick from rejected requests.

use crate::reservation::ReservationCollection;
use orca_schema::{LabwareId, LocationName};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Edge `a -> b` means labware `a` waits for a location `b` occupies or
/// has reserved.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    graph: DiGraph<LabwareId, ()>,
    index: HashMap<LabwareId, NodeIndex>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, labware: &LabwareId) -> NodeIndex {
        if let Some(&node) = self.index.get(labware) {
            return node;
        }
        let node = self.graph.add_node(labware.clone());
        self.index.insert(labware.clone(), node);
        node
    }

    pub fn add_wait(&mut self, waiter: &LabwareId, holder: &LabwareId) {
        let (a, b) = (self.intern(waiter), self.intern(holder));
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Labware on some cycle of waits.
    pub fn cyclic_members(&self) -> HashSet<LabwareId> {
        let mut members = HashSet::new();
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| self.graph.contains_edge(n, n));
            if cyclic {
                members.extend(component.into_iter().map(|n| self.graph[n].clone()));
            }
        }
        members
    }
}

/// Labware whose rejected requests sit on a wait cycle.
///
/// For every candidate of every rejected collection, the requester waits for
/// whichever labware `holder_of` names for the requested location.
pub fn find_deadlocked<'a, I, F>(rejected: I, holder_of: F) -> HashSet<LabwareId>
where
    I: IntoIterator<Item = &'a ReservationCollection>,
    F: Fn(&LocationName) -> Option<LabwareId>,
{
    let mut graph = WaitForGraph::new();
    for collection in rejected {
        let Some(waiter) = collection.labware() else {
            continue;
        };
        for candidate in collection.candidates() {
            match holder_of(candidate.location()) {
                Some(holder) if holder != *waiter => graph.add_wait(waiter, &holder),
                _ => {}
            }
        }
    }
    graph.cyclic_members()
}
