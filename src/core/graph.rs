//! Dependency graph construction.
//!
//! Edges come from attribute references (implicit) and `depends_on` hints
//! (explicit), always target -> source: the referenced resource must be
//! applied first. Cycle detection runs at build with three-color DFS; the
//! topological order uses Kahn's algorithm with declaration-order
//! tie-breaking for determinism. The graph is immutable after build — a
//! re-plan rebuilds from scratch.

use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::error::ConfigError;
use super::types::{ResourceKey, ResourceSpec};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    specs: Vec<ResourceSpec>,
    index: FxHashMap<ResourceKey, usize>,
    /// node -> nodes it depends on (must apply before it)
    dependencies: Vec<Vec<usize>>,
    /// node -> nodes that depend on it
    dependents: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl DependencyGraph {
    /// Build a graph from a declaration's resources.
    pub fn build(specs: Vec<ResourceSpec>) -> Result<Self, ConfigError> {
        let mut index = FxHashMap::default();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.key(), i).is_some() {
                return Err(ConfigError::DuplicateResource(spec.key()));
            }
        }

        let n = specs.len();
        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, spec) in specs.iter().enumerate() {
            for dep in spec.dependency_keys() {
                let Some(&j) = index.get(&dep) else {
                    return Err(ConfigError::UnresolvedReference {
                        from: spec.key(),
                        to: dep,
                    });
                };
                dependencies[i].push(j);
                dependents[j].push(i);
            }
        }

        detect_cycle(&specs, &dependencies)?;
        let topo = topo_order(&dependencies, &dependents);

        Ok(Self {
            specs,
            index,
            dependencies,
            dependents,
            topo,
        })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceSpec> {
        self.index.get(key).map(|&i| &self.specs[i])
    }

    /// Keys this resource must be applied after.
    pub fn dependency_keys(&self, key: &ResourceKey) -> Vec<ResourceKey> {
        self.adjacent_keys(key, &self.dependencies)
    }

    /// Keys applied after this resource.
    pub fn dependent_keys(&self, key: &ResourceKey) -> Vec<ResourceKey> {
        self.adjacent_keys(key, &self.dependents)
    }

    fn adjacent_keys(&self, key: &ResourceKey, edges: &[Vec<usize>]) -> Vec<ResourceKey> {
        match self.index.get(key) {
            Some(&i) => edges[i].iter().map(|&j| self.specs[j].key()).collect(),
            None => Vec::new(),
        }
    }

    /// Specs in topological order: every dependency before its dependents,
    /// ties broken by declaration order.
    pub fn in_topo_order(&self) -> impl Iterator<Item = &ResourceSpec> + '_ {
        self.topo.iter().map(move |&i| &self.specs[i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS. A gray-to-gray edge closes a cycle; the error carries
/// the full cycle path, closing node repeated.
fn detect_cycle(specs: &[ResourceSpec], dependencies: &[Vec<usize>]) -> Result<(), ConfigError> {
    let mut colors = vec![Color::White; specs.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..specs.len() {
        if colors[start] != Color::White {
            continue;
        }
        if let Some(cycle) = visit(start, dependencies, &mut colors, &mut path) {
            return Err(ConfigError::Cycle {
                path: cycle.iter().map(|&i| specs[i].key()).collect(),
            });
        }
    }
    Ok(())
}

fn visit(
    node: usize,
    dependencies: &[Vec<usize>],
    colors: &mut [Color],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    colors[node] = Color::Gray;
    path.push(node);

    for &next in &dependencies[node] {
        match colors[next] {
            Color::Gray => {
                let start = path.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = visit(next, dependencies, colors, path) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    path.pop();
    colors[node] = Color::Black;
    None
}

/// Kahn's algorithm; the ready heap yields the lowest declaration index
/// first. Assumes cycle detection already passed.
fn topo_order(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let n = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &dependent in &dependents[current] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    debug_assert_eq!(order.len(), n);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Value;
    use proptest::prelude::*;

    fn spec(kind: &str, name: &str) -> ResourceSpec {
        ResourceSpec::new(kind, name)
    }

    fn chain() -> Vec<ResourceSpec> {
        vec![
            spec("network", "main").attr("cidr", "10.0.0.0/16"),
            spec("subnet", "app")
                .attr("network", Value::reference("network.main.id".parse().unwrap())),
            spec("cluster", "main")
                .attr("subnet", Value::reference("subnet.app.id".parse().unwrap())),
            spec("database", "main").attr("engine", "postgres"),
        ]
    }

    #[test]
    fn test_build_chain_topo_order() {
        let graph = DependencyGraph::build(chain()).unwrap();
        let order: Vec<String> = graph.in_topo_order().map(|s| s.key().to_string()).collect();
        // database has no dependencies; declaration order breaks the tie
        // with the chain, dependency order holds within the chain.
        let net = order.iter().position(|k| k == "network.main").unwrap();
        let sub = order.iter().position(|k| k == "subnet.app").unwrap();
        let clu = order.iter().position(|k| k == "cluster.main").unwrap();
        assert!(net < sub && sub < clu);
        assert_eq!(order[0], "network.main");
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let graph = DependencyGraph::build(vec![
            spec("bucket", "logs"),
            spec("bucket", "assets"),
            spec("bucket", "archive"),
        ])
        .unwrap();
        let order: Vec<String> = graph.in_topo_order().map(|s| s.key().to_string()).collect();
        assert_eq!(order, vec!["bucket.logs", "bucket.assets", "bucket.archive"]);
    }

    #[test]
    fn test_implicit_reference_creates_edge() {
        let graph = DependencyGraph::build(chain()).unwrap();
        assert_eq!(
            graph.dependency_keys(&ResourceKey::new("subnet", "app")),
            vec![ResourceKey::new("network", "main")]
        );
        assert_eq!(
            graph.dependent_keys(&ResourceKey::new("network", "main")),
            vec![ResourceKey::new("subnet", "app")]
        );
    }

    #[test]
    fn test_explicit_depends_on_creates_edge() {
        let graph = DependencyGraph::build(vec![
            spec("network", "main"),
            spec("cluster", "main").depends(ResourceKey::new("network", "main")),
        ])
        .unwrap();
        assert_eq!(
            graph.dependency_keys(&ResourceKey::new("cluster", "main")),
            vec![ResourceKey::new("network", "main")]
        );
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let result = DependencyGraph::build(vec![spec("network", "main"), spec("network", "main")]);
        assert!(matches!(result, Err(ConfigError::DuplicateResource(_))));
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let result = DependencyGraph::build(vec![spec("subnet", "app")
            .attr("network", Value::reference("network.ghost.id".parse().unwrap()))]);
        match result {
            Err(ConfigError::UnresolvedReference { from, to }) => {
                assert_eq!(from, ResourceKey::new("subnet", "app"));
                assert_eq!(to, ResourceKey::new("network", "ghost"));
            }
            other => panic!("expected UnresolvedReference, got {:?}", other),
        }
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let result = DependencyGraph::build(vec![
            spec("a", "x").depends(ResourceKey::new("b", "y")),
            spec("b", "y").depends(ResourceKey::new("a", "x")),
        ]);
        match result {
            Err(ConfigError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let result = DependencyGraph::build(vec![
            spec("a", "x").attr("me", Value::reference("a.x.id".parse().unwrap()))
        ]);
        assert!(matches!(result, Err(ConfigError::Cycle { .. })));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let graph = DependencyGraph::build(vec![
            spec("network", "main"),
            spec("subnet", "a").depends(ResourceKey::new("network", "main")),
            spec("subnet", "b").depends(ResourceKey::new("network", "main")),
            spec("cluster", "main")
                .depends(ResourceKey::new("subnet", "a"))
                .depends(ResourceKey::new("subnet", "b")),
        ])
        .unwrap();
        let order: Vec<String> = graph.in_topo_order().map(|s| s.key().to_string()).collect();
        assert_eq!(order[0], "network.main");
        assert_eq!(order[3], "cluster.main");
    }

    #[test]
    fn test_empty_declaration() {
        let graph = DependencyGraph::build(vec![]).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.in_topo_order().count(), 0);
    }

    // Random DAG: nodes 0..n, edges only from lower to higher index.
    fn arb_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| {
            let all_edges: Vec<(usize, usize)> = (0..n)
                .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
                .collect();
            proptest::sample::subsequence(all_edges, 0..=(n * (n - 1) / 2))
                .prop_map(move |edges| (n, edges))
        })
    }

    proptest! {
        #[test]
        fn prop_acyclic_declarations_build_and_linearize((n, edges) in arb_dag()) {
            let mut specs: Vec<ResourceSpec> =
                (0..n).map(|i| spec("node", &format!("n{}", i))).collect();
            for &(from, to) in &edges {
                let dep = ResourceKey::new("node", format!("n{}", from));
                specs[to].depends_on.push(dep);
            }

            let graph = DependencyGraph::build(specs).unwrap();
            let position: std::collections::HashMap<String, usize> = graph
                .in_topo_order()
                .enumerate()
                .map(|(pos, s)| (s.key().to_string(), pos))
                .collect();
            for &(from, to) in &edges {
                let from_pos = position[&format!("node.n{}", from)];
                let to_pos = position[&format!("node.n{}", to)];
                prop_assert!(from_pos < to_pos, "dependency scheduled after dependent");
            }
        }

        #[test]
        fn prop_cycles_always_rejected(
            len in 2usize..8,
            rotation in 0usize..8,
        ) {
            // A cycle of `len` nodes, declared starting from an arbitrary
            // rotation so detection cannot depend on declaration order.
            let specs: Vec<ResourceSpec> = (0..len)
                .map(|offset| {
                    let i = (rotation + offset) % len;
                    let next = (i + 1) % len;
                    spec("node", &format!("n{}", i))
                        .depends(ResourceKey::new("node", format!("n{}", next)))
                })
                .collect();
            prop_assert!(
                matches!(
                    DependencyGraph::build(specs),
                    Err(ConfigError::Cycle { .. })
                ),
                "expected a cycle error"
            );
        }
    }
}
