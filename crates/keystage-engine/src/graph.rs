use std::collections::{BTreeMap, BTreeSet, HashMap};

use keystage_domain::{ManifestSpec, NodeId, Phase, ResourceSpec};

use crate::error::GraphError;

/// Validated, acyclic dependency graph over declared resources.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    nodes: Vec<ResourceSpec>,
    index: HashMap<NodeId, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Build a graph from every resource declared across `manifests`.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate ids, references to undeclared nodes,
    /// phase inversions, resources in the rotate phase, or dependency cycles.
    pub fn build(manifests: &[ManifestSpec]) -> std::result::Result<Self, GraphError> {
        let resources = manifests
            .iter()
            .flat_map(|manifest| manifest.resources.iter().cloned())
            .collect();
        Self::from_resources(resources)
    }

    /// Build a graph from a flat list of resource declarations.
    ///
    /// # Errors
    ///
    /// See [`ResourceGraph::build`].
    pub fn from_resources(resources: Vec<ResourceSpec>) -> std::result::Result<Self, GraphError> {
        let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(resources.len());
        for (position, resource) in resources.iter().enumerate() {
            if resource.phase == Phase::Rotate {
                return Err(GraphError::ReservedPhase {
                    node: resource.id.clone(),
                });
            }
            if let Some(existing) = index.insert(resource.id.clone(), position) {
                return Err(GraphError::DuplicateNode {
                    id: resource.id.clone(),
                    first: resources[existing].manifest.to_path_buf(),
                    second: resource.manifest.to_path_buf(),
                });
            }
        }

        let mut dependencies = vec![BTreeSet::new(); resources.len()];
        let mut dependents = vec![BTreeSet::new(); resources.len()];

        // Sorted by node id so the reported error does not depend on manifest order.
        let mut by_id: Vec<usize> = (0..resources.len()).collect();
        by_id.sort_by(|left, right| resources[*left].id.cmp(&resources[*right].id));

        for &position in &by_id {
            let resource = &resources[position];
            let edges = resource
                .references()
                .into_iter()
                .map(|(attribute, reference)| (attribute.to_string(), &reference.node))
                .chain(
                    resource
                        .depends_on
                        .iter()
                        .map(|target| ("depends_on".to_string(), target)),
                );

            for (attribute, target) in edges {
                let Some(&target_position) = index.get(target) else {
                    return Err(GraphError::UnresolvedReference {
                        node: resource.id.clone(),
                        attribute,
                        target: target.clone(),
                    });
                };

                let dependency = &resources[target_position];
                if dependency.phase > resource.phase {
                    return Err(GraphError::PhaseInversion {
                        node: resource.id.clone(),
                        phase: resource.phase,
                        dependency: dependency.id.clone(),
                        dependency_phase: dependency.phase,
                    });
                }

                dependencies[position].insert(target_position);
                dependents[target_position].insert(position);
            }
        }

        let order = topological_order(&resources, &dependencies, &dependents)?;

        Ok(Self {
            nodes: resources,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&ResourceSpec> {
        self.index.get(id).map(|position| &self.nodes[*position])
    }

    /// Resources in dependency order: every node follows all of its dependencies.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().map(|position| &self.nodes[*position])
    }

    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        self.ordered().map(|resource| resource.id.clone()).collect()
    }

    /// Resources of one phase, in dependency order.
    #[must_use]
    pub fn phase_nodes(&self, phase: Phase) -> Vec<&ResourceSpec> {
        self.ordered()
            .filter(|resource| resource.phase == phase)
            .collect()
    }

    #[must_use]
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges(id, &self.dependencies)
    }

    #[must_use]
    pub fn dependents_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges(id, &self.dependents)
    }

    /// All nodes reachable through dependency edges from `id`, excluding `id`.
    #[must_use]
    pub fn transitive_dependencies(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };

        let mut stack: Vec<usize> = self.dependencies[start].iter().copied().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(self.nodes[next].id.clone()) {
                stack.extend(self.dependencies[next].iter().copied());
            }
        }
        seen
    }

    fn edges<'a>(&'a self, id: &NodeId, table: &'a [BTreeSet<usize>]) -> Vec<&'a NodeId> {
        self.index.get(id).map_or_else(Vec::new, |position| {
            table[*position]
                .iter()
                .map(|other| &self.nodes[*other].id)
                .collect()
        })
    }
}

fn topological_order(
    resources: &[ResourceSpec],
    dependencies: &[BTreeSet<usize>],
    dependents: &[BTreeSet<usize>],
) -> std::result::Result<Vec<usize>, GraphError> {
    let mut indegree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();

    // Keyed by id so ties between independent nodes resolve alphabetically.
    let mut ready: BTreeMap<&NodeId, usize> = BTreeMap::new();
    for (position, count) in indegree.iter().enumerate() {
        if *count == 0 {
            ready.insert(&resources[position].id, position);
        }
    }

    let mut order = Vec::with_capacity(resources.len());
    while let Some((_, next)) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(&resources[dependent].id, dependent);
            }
        }
    }

    if order.len() == resources.len() {
        return Ok(order);
    }

    let cycle = find_cycle(resources, dependencies, &indegree);
    Err(GraphError::CycleDetected { cycle })
}

/// Walk dependency edges among the nodes Kahn's algorithm could not place.
///
/// Every leftover node has at least one leftover dependency, so the walk must
/// revisit a node; the revisited suffix is a concrete cycle.
fn find_cycle(
    resources: &[ResourceSpec],
    dependencies: &[BTreeSet<usize>],
    indegree: &[usize],
) -> String {
    let leftover: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter_map(|(position, count)| (*count > 0).then_some(position))
        .collect();

    let Some(start) = leftover
        .iter()
        .copied()
        .min_by(|left, right| resources[*left].id.cmp(&resources[*right].id))
    else {
        return String::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut visited_at: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&first) = visited_at.get(&current) {
            let mut cycle: Vec<String> = path[first..]
                .iter()
                .map(|position| resources[*position].id.to_string())
                .collect();
            cycle.push(resources[current].id.to_string());
            return cycle.join(" -> ");
        }
        visited_at.insert(current, path.len());
        path.push(current);

        let next = dependencies[current]
            .iter()
            .copied()
            .filter(|candidate| leftover.contains(candidate))
            .min_by(|left, right| resources[*left].id.cmp(&resources[*right].id));
        match next {
            Some(next) => current = next,
            None => {
                return path
                    .iter()
                    .map(|position| resources[*position].id.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");
            }
        }
    }
}
