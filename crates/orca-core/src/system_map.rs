//! Directed, weighted graph of teachpoints.
//!
//! Every edge is a hop some transporter can perform; its weight is the cost
//! of that hop. Occupancy lives on the `Location` nodes themselves and is only
//! mutated through pick/place notifications.

use crate::CoreError;
use orca_schema::{LabwareId, LocationName, ResourceName};
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, NodeFiltered};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_HOP_WEIGHT: u32 = 1;

/// Ordered sequence of locations, source first.
pub type Path = Vec<LocationName>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub transporter: ResourceName,
    pub weight: u32,
}

#[derive(Debug)]
pub struct Location {
    name: LocationName,
    resource: Option<ResourceName>,
    occupant: Mutex<Option<LabwareId>>,
}

impl Location {
    fn new(name: LocationName, resource: Option<ResourceName>) -> Self {
        Self {
            name,
            resource,
            occupant: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &LocationName {
        &self.name
    }

    /// Instrument hosted here, if any.
    pub fn resource(&self) -> Option<&ResourceName> {
        self.resource.as_ref()
    }

    /// Plain pads with no instrument double as deadlock escape spots.
    pub fn is_parking(&self) -> bool {
        self.resource.is_none()
    }

    pub fn occupant(&self) -> Option<LabwareId> {
        self.occupant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant().is_some()
    }

    pub fn notify_picked(&self, labware: &LabwareId) -> Result<(), CoreError> {
        let mut occupant = self.occupant.lock().unwrap_or_else(PoisonError::into_inner);
        match occupant.as_ref() {
            Some(current) if current == labware => {
                *occupant = None;
                Ok(())
            }
            Some(current) => Err(CoreError::ProtocolViolation(format!(
                "picked {labware} from '{}' but {current} is staged there",
                self.name
            ))),
            None => Err(CoreError::ProtocolViolation(format!(
                "picked {labware} from empty location '{}'",
                self.name
            ))),
        }
    }

    pub fn notify_placed(&self, labware: &LabwareId) -> Result<(), CoreError> {
        let mut occupant = self.occupant.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = occupant.as_ref() {
            return Err(CoreError::ProtocolViolation(format!(
                "placed {labware} on '{}' already holding {current}",
                self.name
            )));
        }
        *occupant = Some(labware.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SystemMap {
    graph: DiGraph<LocationName, Hop>,
    nodes: HashMap<LocationName, NodeIndex>,
    locations: BTreeMap<LocationName, Arc<Location>>,
}

impl SystemMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(
        &mut self,
        name: impl Into<LocationName>,
        resource: Option<ResourceName>,
    ) -> Result<Arc<Location>, CoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "location name must not be empty".to_owned(),
            ));
        }
        if self.locations.contains_key(&name) {
            return Err(CoreError::InvalidArgument(format!(
                "location '{name}' already exists"
            )));
        }
        let location = Arc::new(Location::new(name.clone(), resource));
        let node = self.graph.add_node(name.clone());
        self.nodes.insert(name.clone(), node);
        self.locations.insert(name, Arc::clone(&location));
        Ok(location)
    }

    /// Connect every ordered pair of a transporter's taught positions.
    ///
    /// Positions not yet on the map are added as plain locations. An existing
    /// edge keeps the transporter that registered it first.
    pub fn add_transporter(
        &mut self,
        transporter: &ResourceName,
        positions: &[LocationName],
    ) -> Result<(), CoreError> {
        for position in positions {
            if !self.locations.contains_key(position) {
                self.add_location(position.clone(), None)?;
            }
        }
        for a in positions {
            for b in positions {
                if a != b {
                    self.add_hop(a, b, transporter, DEFAULT_HOP_WEIGHT)?;
                }
            }
        }
        Ok(())
    }

    /// Add a single directed hop. Returns `false` if one already existed.
    pub fn add_hop(
        &mut self,
        from: &str,
        to: &str,
        transporter: &ResourceName,
        weight: u32,
    ) -> Result<bool, CoreError> {
        if weight == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "hop '{from}' -> '{to}' must have a positive weight"
            )));
        }
        let (a, b) = (self.node(from)?, self.node(to)?);
        if self.graph.find_edge(a, b).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(
            a,
            b,
            Hop {
                transporter: transporter.clone(),
                weight,
            },
        );
        Ok(true)
    }

    pub fn get_location(&self, name: &str) -> Result<&Arc<Location>, CoreError> {
        self.locations
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("location '{name}'")))
    }

    /// First location hosting the given instrument.
    pub fn get_resource_location(&self, resource: &str) -> Result<&Arc<Location>, CoreError> {
        self.locations
            .values()
            .find(|l| l.resource().is_some_and(|r| r == resource))
            .ok_or_else(|| CoreError::NotFound(format!("location of resource '{resource}'")))
    }

    /// Every location hosting the given instrument, ordered by name.
    pub fn get_resource_locations(&self, resource: &str) -> Vec<Arc<Location>> {
        self.locations
            .values()
            .filter(|l| l.resource().is_some_and(|r| r == resource))
            .cloned()
            .collect()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Arc<Location>> {
        self.locations.values()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// All minimum-weight paths, ignoring occupancy.
    pub fn get_all_shortest_any_paths(&self, src: &str, dst: &str) -> Result<Vec<Path>, CoreError> {
        let (a, b) = self.endpoints(src, dst)?;
        let paths = self.shortest_paths(a, b, |_| true);
        if paths.is_empty() {
            return Err(no_path(src, dst));
        }
        Ok(paths)
    }

    /// All minimum-weight paths through unoccupied locations only. The
    /// source is exempt: it normally holds the labware being routed.
    pub fn get_all_shortest_available_paths(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Vec<Path>, CoreError> {
        let (a, b) = self.endpoints(src, dst)?;
        let paths = self.shortest_paths(a, b, |n| n == a || !self.location_at(n).is_occupied());
        if paths.is_empty() {
            return Err(no_path(src, dst));
        }
        Ok(paths)
    }

    /// Total weight of the cheapest path.
    ///
    /// Unlike the path queries, identical endpoints are not rejected: the
    /// distance is zero. The resolver ranks candidate locations by distance
    /// from where the labware sits, and that location is often a candidate.
    pub fn get_distance(&self, src: &str, dst: &str) -> Result<u32, CoreError> {
        let (a, b) = (self.node(src)?, self.node(dst)?);
        let dist = dijkstra(&self.graph, a, Some(b), |e| e.weight().weight);
        dist.get(&b).copied().ok_or_else(|| no_path(src, dst))
    }

    pub fn get_transporter_between(&self, src: &str, dst: &str) -> Result<&ResourceName, CoreError> {
        let (a, b) = self.endpoints(src, dst)?;
        self.graph
            .find_edge(a, b)
            .map(|e| &self.graph[e].transporter)
            .ok_or_else(|| no_path(src, dst))
    }

    /// Shortest paths from `src` to every other reachable parking location,
    /// cheapest first, ties broken by path names.
    pub fn get_shortest_paths_to_deadlock_resolution(
        &self,
        src: &str,
    ) -> Result<Vec<Path>, CoreError> {
        let a = self.node(src)?;
        let dist = dijkstra(&self.graph, a, None, |e| e.weight().weight);

        let mut ranked: Vec<(u32, Path)> = Vec::new();
        for location in self.locations.values() {
            if !location.is_parking() || location.name() == src {
                continue;
            }
            let b = self.nodes[location.name()];
            let Some(&d) = dist.get(&b) else { continue };
            for path in self.enumerate(a, b, &dist, &|_| true) {
                ranked.push((d, path));
            }
        }
        ranked.sort();
        Ok(ranked.into_iter().map(|(_, path)| path).collect())
    }

    fn shortest_paths<F>(&self, src: NodeIndex, dst: NodeIndex, allowed: F) -> Vec<Path>
    where
        F: Fn(NodeIndex) -> bool,
    {
        let filtered = NodeFiltered::from_fn(&self.graph, |n| allowed(n));
        let dist = dijkstra(&filtered, src, None, |e| e.weight().weight);
        if !dist.contains_key(&dst) {
            return Vec::new();
        }
        let mut paths = self.enumerate(src, dst, &dist, &allowed);
        paths.sort();
        paths
    }

    /// Walk predecessor edges back from `dst`, keeping only edges that lie
    /// on some minimum-weight path.
    fn enumerate<F>(
        &self,
        src: NodeIndex,
        dst: NodeIndex,
        dist: &HashMap<NodeIndex, u32>,
        allowed: &F,
    ) -> Vec<Path>
    where
        F: Fn(NodeIndex) -> bool,
    {
        let mut paths = Vec::new();
        let mut stack = vec![vec![dst]];
        while let Some(suffix) = stack.pop() {
            let node = suffix[suffix.len() - 1];
            if node == src {
                paths.push(
                    suffix
                        .iter()
                        .rev()
                        .map(|n| self.graph[*n].clone())
                        .collect(),
                );
                continue;
            }
            let d = dist[&node];
            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                let pred = edge.source();
                if !allowed(pred) {
                    continue;
                }
                if dist.get(&pred).is_some_and(|dp| dp + edge.weight().weight == d) {
                    let mut next = suffix.clone();
                    next.push(pred);
                    stack.push(next);
                }
            }
        }
        paths
    }

    fn node(&self, name: &str) -> Result<NodeIndex, CoreError> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("location '{name}'")))
    }

    fn endpoints(&self, src: &str, dst: &str) -> Result<(NodeIndex, NodeIndex), CoreError> {
        if src == dst {
            return Err(CoreError::InvalidArgument(format!(
                "source and target are both '{src}'"
            )));
        }
        Ok((self.node(src)?, self.node(dst)?))
    }

    fn location_at(&self, node: NodeIndex) -> &Arc<Location> {
        &self.locations[&self.graph[node]]
    }
}

fn no_path(src: &str, dst: &str) -> CoreError {
    CoreError::NoPath {
        from: src.to_owned(),
        to: dst.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(paths: &[Path]) -> Vec<Vec<&str>> {
        paths
            .iter()
            .map(|p| p.iter().map(LocationName::as_str).collect())
            .collect()
    }

    /// Diamond: a -> {b, c} -> d, plus a long detour a -> e -> f -> d.
    fn diamond() -> SystemMap {
        let mut map = SystemMap::new();
        for name in ["a", "b", "c", "d", "e", "f"] {
            map.add_location(name, None).unwrap();
        }
        let arm = ResourceName::new("arm");
        for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("a", "e"), ("e", "f"), ("f", "d")] {
            map.add_hop(from, to, &arm, 1).unwrap();
        }
        map
    }

    #[test]
    fn returns_all_tied_shortest_paths() {
        let map = diamond();
        let paths = map.get_all_shortest_any_paths("a", "d").unwrap();
        assert_eq!(names(&paths), vec![vec!["a", "b", "d"], vec!["a", "c", "d"]]);
        // Idempotent.
        assert_eq!(map.get_all_shortest_any_paths("a", "d").unwrap(), paths);
    }

    #[test]
    fn weights_break_ties() {
        let mut map = diamond();
        let arm = ResourceName::new("arm");
        map.add_location("g", None).unwrap();
        map.add_hop("a", "g", &arm, 5).unwrap();
        map.add_hop("g", "d", &arm, 5).unwrap();
        assert_eq!(map.get_distance("a", "d").unwrap(), 2);
        let paths = map.get_all_shortest_any_paths("a", "d").unwrap();
        assert!(paths.iter().all(|p| p.len() == 3 && p[1] != "g"));
    }

    #[test]
    fn available_paths_skip_occupied_locations() {
        let map = diamond();
        map.get_location("b")
            .unwrap()
            .notify_placed(&LabwareId::new("blocker"))
            .unwrap();

        let any = map.get_all_shortest_any_paths("a", "d").unwrap();
        assert_eq!(any.len(), 2);

        let free = map.get_all_shortest_available_paths("a", "d").unwrap();
        assert_eq!(names(&free), vec![vec!["a", "c", "d"]]);

        map.get_location("c")
            .unwrap()
            .notify_placed(&LabwareId::new("blocker-2"))
            .unwrap();
        let detour = map.get_all_shortest_available_paths("a", "d").unwrap();
        assert_eq!(names(&detour), vec![vec!["a", "e", "f", "d"]]);
    }

    #[test]
    fn occupied_source_is_allowed() {
        let map = diamond();
        map.get_location("a")
            .unwrap()
            .notify_placed(&LabwareId::new("mover"))
            .unwrap();
        assert_eq!(map.get_all_shortest_available_paths("a", "d").unwrap().len(), 2);
    }

    #[test]
    fn distance_to_self_is_zero_while_paths_reject_it() {
        let map = diamond();
        assert_eq!(map.get_distance("a", "a").unwrap(), 0);
        assert!(matches!(
            map.get_all_shortest_available_paths("a", "a"),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            map.get_transporter_between("a", "a"),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_queries_fail_fast() {
        let map = diamond();
        assert!(matches!(
            map.get_all_shortest_any_paths("a", "a"),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            map.get_all_shortest_any_paths("a", "zz"),
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            map.get_all_shortest_any_paths("d", "a"),
            Err(CoreError::NoPath { .. })
        ));
        assert!(map.get_location("nowhere").is_err());
    }

    #[test]
    fn transporter_adds_pairwise_edges() {
        let mut map = SystemMap::new();
        map.add_location("pad", None).unwrap();
        let arm = ResourceName::new("arm");
        map.add_transporter(
            &arm,
            &[LocationName::new("pad"), LocationName::new("new_1"), LocationName::new("new_2")],
        )
        .unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.get_transporter_between("new_1", "pad").unwrap(), &arm);
        assert_eq!(map.get_distance("pad", "new_2").unwrap(), 1);

        let other = ResourceName::new("other_arm");
        map.add_transporter(&other, &[LocationName::new("pad"), LocationName::new("new_1")])
            .unwrap();
        assert_eq!(map.get_transporter_between("pad", "new_1").unwrap(), &arm);
    }

    #[test]
    fn deadlock_resolution_targets_parking_only() {
        let mut map = SystemMap::new();
        map.add_location("shaker", Some(ResourceName::new("shaker"))).unwrap();
        let arm = ResourceName::new("arm");
        map.add_transporter(
            &arm,
            &[LocationName::new("shaker"), LocationName::new("p1"), LocationName::new("p2")],
        )
        .unwrap();
        map.add_location("far", None).unwrap();
        map.add_hop("p2", "far", &arm, 1).unwrap();

        let paths = map.get_shortest_paths_to_deadlock_resolution("p1").unwrap();
        let ends: Vec<&str> = paths.iter().map(|p| p[p.len() - 1].as_str()).collect();
        assert_eq!(ends, vec!["p2", "far"]);
        assert!(paths.iter().all(|p| p[0] == "p1"));
    }

    #[test]
    fn pick_and_place_guard_occupancy() {
        let map = diamond();
        let a = map.get_location("a").unwrap();
        let plate = LabwareId::new("plate");

        assert!(a.notify_picked(&plate).is_err());
        a.notify_placed(&plate).unwrap();
        assert!(a.notify_placed(&LabwareId::new("other")).is_err());
        assert!(a.notify_picked(&LabwareId::new("other")).is_err());
        a.notify_picked(&plate).unwrap();
        assert!(!a.is_occupied());
    }

    #[test]
    fn resource_locations_lookup() {
        let mut map = SystemMap::new();
        let deck = ResourceName::new("deck");
        map.add_location("deck_2", Some(deck.clone())).unwrap();
        map.add_location("deck_1", Some(deck)).unwrap();
        map.add_location("pad", None).unwrap();

        assert_eq!(map.get_resource_location("deck").unwrap().name(), "deck_1");
        assert_eq!(map.get_resource_locations("deck").len(), 2);
        assert!(map.get_resource_location("missing").is_err());
        assert!(map.add_location("pad", None).is_err());
    }
}
