use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sitepack_core::{PackageId, PackageRef, Requirement};
use tracing::warn;

/// Packages and their `requires` relations.
///
/// An edge `from -> to` means `from` requires `to`. Vertices keep their
/// insertion order, which is also the tie-breaker for `package_order`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    vertices: Vec<PackageRef>,
    index: HashMap<PackageId, usize>,
    edges: BTreeMap<(usize, usize), u64>,
    next_edge_seq: u64,
    missing: Vec<(usize, String)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &PackageId) -> Option<&PackageRef> {
        self.index.get(id).map(|&slot| &self.vertices[slot])
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageRef> {
        self.vertices.iter()
    }

    pub fn add_vertex(&mut self, package: PackageRef) -> usize {
        if let Some(&slot) = self.index.get(&package.id) {
            return slot;
        }
        let slot = self.vertices.len();
        self.index.insert(package.id.clone(), slot);
        self.vertices.push(package);
        slot
    }

    pub fn add_edge(&mut self, from: &PackageRef, to: &PackageRef) {
        let from_slot = self.add_vertex(from.clone());
        let to_slot = self.add_vertex(to.clone());
        if from_slot == to_slot || self.edges.contains_key(&(from_slot, to_slot)) {
            return;
        }
        self.edges.insert((from_slot, to_slot), self.next_edge_seq);
        self.next_edge_seq += 1;
    }

    /// Records an unresolved requirement so it shows up in dot output.
    pub fn add_missing_dependency(&mut self, from: &PackageRef, requirement: &Requirement) {
        let slot = self.add_vertex(from.clone());
        let label = requirement.to_string();
        if !self.missing.iter().any(|(s, l)| *s == slot && *l == label) {
            self.missing.push((slot, label));
        }
    }

    pub fn vertex_ids(&self) -> Vec<PackageId> {
        self.vertices.iter().map(|package| package.id.clone()).collect()
    }

    /// Edges in insertion order.
    pub fn edge_ids(&self) -> Vec<(PackageId, PackageId)> {
        let mut edges: Vec<_> = self.edges.iter().collect();
        edges.sort_by_key(|(_, seq)| **seq);
        edges
            .into_iter()
            .map(|((from, to), _)| {
                (
                    self.vertices[*from].id.clone(),
                    self.vertices[*to].id.clone(),
                )
            })
            .collect()
    }

    /// Vertices that require nothing else in the graph.
    pub fn roots(&self) -> Vec<PackageRef> {
        let with_deps: BTreeSet<usize> = self.edges.keys().map(|(from, _)| *from).collect();
        self.vertices
            .iter()
            .enumerate()
            .filter(|(slot, _)| !with_deps.contains(slot))
            .map(|(_, package)| package.clone())
            .collect()
    }

    pub fn dependencies_of(&self, id: &PackageId) -> Vec<PackageRef> {
        let Some(&slot) = self.index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<_> = self
            .edges
            .iter()
            .filter(|((from, _), _)| *from == slot)
            .collect();
        deps.sort_by_key(|(_, seq)| **seq);
        deps.into_iter()
            .map(|((_, to), _)| self.vertices[*to].clone())
            .collect()
    }

    pub fn dependents_of(&self, id: &PackageId) -> Vec<PackageRef> {
        let Some(&slot) = self.index.get(id) else {
            return Vec::new();
        };
        self.edges
            .keys()
            .filter(|(_, to)| *to == slot)
            .map(|(from, _)| self.vertices[*from].clone())
            .collect()
    }

    /// Dependencies before dependents. Cycles are broken by dropping the
    /// most recently inserted edge that lies on one.
    pub fn package_order(&self) -> Vec<PackageRef> {
        let (order, broken) = self.order_slots();
        for (from, to) in broken {
            warn!(
                from = %self.vertices[from].id,
                to = %self.vertices[to].id,
                "dependency cycle detected, ignoring edge"
            );
        }
        order
            .into_iter()
            .map(|slot| self.vertices[slot].clone())
            .collect()
    }

    pub fn broken_cycle_edges(&self) -> Vec<(PackageId, PackageId)> {
        self.order_slots()
            .1
            .into_iter()
            .map(|(from, to)| {
                (
                    self.vertices[from].id.clone(),
                    self.vertices[to].id.clone(),
                )
            })
            .collect()
    }

    fn order_slots(&self) -> (Vec<usize>, Vec<(usize, usize)>) {
        let count = self.vertices.len();
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut reverse: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        for (from, to) in self.edges.keys() {
            deps[*from].insert(*to);
            reverse[*to].insert(*from);
        }

        let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..count).filter(|slot| in_degree[*slot] == 0).collect();
        let mut placed = vec![false; count];
        let mut ordered = Vec::with_capacity(count);
        let mut broken = Vec::new();

        loop {
            while let Some(next) = ready.pop_first() {
                placed[next] = true;
                ordered.push(next);
                for child in &reverse[next] {
                    in_degree[*child] = in_degree[*child].saturating_sub(1);
                    if in_degree[*child] == 0 {
                        ready.insert(*child);
                    }
                }
            }

            if ordered.len() == count {
                break;
            }

            let cycle_edge = self
                .edges
                .iter()
                .filter(|((from, to), _)| !placed[*from] && !placed[*to])
                .filter(|((from, to), _)| deps[*from].contains(to))
                .filter(|((from, to), _)| reaches(&deps, &placed, *to, *from))
                .max_by_key(|(_, seq)| **seq)
                .map(|(edge, _)| *edge);

            let Some((from, to)) = cycle_edge else {
                // unreachable while in_degree counts unplaced deps only
                ordered.extend((0..count).filter(|slot| !placed[*slot]));
                break;
            };

            deps[from].remove(&to);
            reverse[to].remove(&from);
            broken.push((from, to));
            in_degree[from] = in_degree[from].saturating_sub(1);
            if in_degree[from] == 0 {
                ready.insert(from);
            }
        }

        (ordered, broken)
    }

    pub fn to_dot(&self, tree_mode: bool) -> String {
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.vertices.len()];
        for (from, to) in self.edges.keys() {
            deps[*from].insert(*to);
        }
        let no_skip = vec![false; self.vertices.len()];

        let mut dot = String::from("digraph dependencies {\n");
        let mut connected = BTreeSet::new();
        for (from, to) in self.edge_slots_in_order() {
            if tree_mode {
                let redundant = deps[from]
                    .iter()
                    .filter(|other| **other != to)
                    .any(|other| reaches(&deps, &no_skip, *other, to));
                if redundant {
                    continue;
                }
            }
            connected.insert(from);
            connected.insert(to);
            let _ = writeln!(
                dot,
                "    \"{}\" -> \"{}\";",
                self.vertices[from].id,
                self.vertices[to].id
            );
        }
        for (slot, label) in &self.missing {
            connected.insert(*slot);
            let _ = writeln!(
                dot,
                "    \"{}\" -> \"{}\" [style=dashed, color=red];",
                self.vertices[*slot].id,
                label
            );
        }
        for (slot, package) in self.vertices.iter().enumerate() {
            if !connected.contains(&slot) {
                let _ = writeln!(dot, "    \"{}\";", package.id);
            }
        }
        dot.push_str("}\n");
        dot
    }

    /// Writes the dot rendering to `<filename>.dot` and returns that path.
    pub fn generate_dot(&self, tree_mode: bool, filename: &Path) -> Result<PathBuf> {
        let path = if filename.extension().and_then(|ext| ext.to_str()) == Some("dot") {
            filename.to_path_buf()
        } else {
            let mut raw = filename.as_os_str().to_os_string();
            raw.push(".dot");
            PathBuf::from(raw)
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create graph directory: {}", parent.display())
                })?;
            }
        }
        fs::write(&path, self.to_dot(tree_mode))
            .with_context(|| format!("failed to write dependency graph: {}", path.display()))?;
        Ok(path)
    }

    fn edge_slots_in_order(&self) -> Vec<(usize, usize)> {
        let mut edges: Vec<_> = self.edges.iter().collect();
        edges.sort_by_key(|(_, seq)| **seq);
        edges.into_iter().map(|(edge, _)| *edge).collect()
    }
}

fn reaches(deps: &[BTreeSet<usize>], skip: &[bool], start: usize, target: usize) -> bool {
    let mut stack = vec![start];
    let mut seen = BTreeSet::new();
    while let Some(slot) = stack.pop() {
        if slot == target {
            return true;
        }
        if !seen.insert(slot) {
            continue;
        }
        for next in &deps[slot] {
            if !skip[*next] {
                stack.push(*next);
            }
        }
    }
    false
}
