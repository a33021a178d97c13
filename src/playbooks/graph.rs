//! Playbook graph validation and topological layering.
//!
//! A playbook's `depends_on` edges must form a DAG over the playbook's own step ids.
//! Layer 0 holds every root step; layer `k` holds the steps whose dependencies all
//! live in layers `0..k`. Steps inside a layer are sorted by id so that iteration
//! (logging, dispatch order) is deterministic.

use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

use crate::models::{Playbook, StepId};

/// Structural problems in a playbook graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Dependency chain that loops back on itself, listed in `depends_on` direction
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<StepId> },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: StepId, dependency: StepId },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(StepId),
}

/// Validated dependency structure of one playbook
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    upstream: BTreeMap<StepId, BTreeSet<StepId>>,
    layers: Vec<Vec<StepId>>,
}

impl DependencyGraph {
    /// Validate `playbook` and compute its layers
    pub fn build(playbook: &Playbook) -> Result<Self, GraphError> {
        let upstream = collect_edges(playbook)?;
        detect_cycle(&upstream)?;

        let mut downstream: BTreeMap<StepId, BTreeSet<StepId>> = upstream
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, deps) in &upstream {
            for dep in deps {
                if let Some(children) = downstream.get_mut(dep) {
                    children.insert(id.clone());
                }
            }
        }

        let layers = compute_layers(&upstream, &downstream)?;

        Ok(Self { upstream, layers })
    }

    /// Direct dependencies of `step_id`
    pub fn upstream(&self, step_id: &str) -> impl Iterator<Item = &StepId> {
        self.upstream.get(step_id).into_iter().flatten()
    }

    pub fn layers(&self) -> &[Vec<StepId>] {
        &self.layers
    }

    /// All steps, layer by layer. A step always comes after its dependencies.
    pub fn execution_order(&self) -> impl Iterator<Item = &StepId> {
        self.layers.iter().flatten()
    }
}

/// Validate the step graph of `playbook`
pub fn validate(playbook: &Playbook) -> Result<(), GraphError> {
    let upstream = collect_edges(playbook)?;
    detect_cycle(&upstream)
}

/// Group the steps of `playbook` into dependency layers
pub fn topological_layers(playbook: &Playbook) -> Result<Vec<Vec<StepId>>, GraphError> {
    DependencyGraph::build(playbook).map(|graph| graph.layers)
}

/// Check that `layers` is a sound layering of `playbook`: every step appears exactly
/// once and only after all of its dependencies.
pub fn verify_layers(playbook: &Playbook, layers: &[Vec<StepId>]) -> Result<(), String> {
    let mut placed: HashMap<&str, usize> = HashMap::new();
    for (index, layer) in layers.iter().enumerate() {
        for id in layer {
            if placed.insert(id.as_str(), index).is_some() {
                return Err(format!("step '{}' appears in more than one layer", id));
            }
        }
    }

    for step in &playbook.steps {
        let layer = placed
            .get(step.id.as_str())
            .ok_or_else(|| format!("step '{}' missing from layering", step.id))?;
        for dep in &step.depends_on {
            match placed.get(dep.as_str()) {
                Some(dep_layer) if dep_layer < layer => {}
                _ => {
                    return Err(format!(
                        "step '{}' in layer {} is not after its dependency '{}'",
                        step.id, layer, dep
                    ))
                }
            }
        }
    }

    if placed.len() != playbook.steps.len() {
        return Err("layering contains steps that are not in the playbook".to_string());
    }
    Ok(())
}

fn collect_edges(playbook: &Playbook) -> Result<BTreeMap<StepId, BTreeSet<StepId>>, GraphError> {
    let mut edges: BTreeMap<StepId, BTreeSet<StepId>> = BTreeMap::new();
    for step in &playbook.steps {
        if edges
            .insert(step.id.clone(), step.depends_on.iter().cloned().collect())
            .is_some()
        {
            return Err(GraphError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &playbook.steps {
        if let Some(dependency) = step.depends_on.iter().find(|d| !edges.contains_key(*d)) {
            return Err(GraphError::UnknownDependency {
                step_id: step.id.clone(),
                dependency: dependency.clone(),
            });
        }
    }

    Ok(edges)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search along `depends_on` edges with an explicit stack, so chain
/// length is bounded by memory rather than thread stack size. The stack of steps
/// being visited doubles as the reported cycle path.
fn detect_cycle(upstream: &BTreeMap<StepId, BTreeSet<StepId>>) -> Result<(), GraphError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for root in upstream.keys() {
        if marks.contains_key(root.as_str()) {
            continue;
        }

        let mut stack: Vec<(&str, btree_set::Iter<'_, StepId>)> = Vec::new();
        marks.insert(root.as_str(), Mark::Visiting);
        stack.push((root.as_str(), dependencies(upstream, root)));

        loop {
            let next = match stack.last_mut() {
                Some((_, deps)) => deps.next(),
                None => break,
            };
            match next {
                Some(dep) => match marks.get(dep.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|(id, _)| *id == dep.as_str())
                            .unwrap_or(0);
                        let mut path: Vec<StepId> =
                            stack[start..].iter().map(|(id, _)| id.to_string()).collect();
                        path.push(dep.clone());
                        return Err(GraphError::CycleDetected { path });
                    }
                    None => {
                        marks.insert(dep.as_str(), Mark::Visiting);
                        stack.push((dep.as_str(), dependencies(upstream, dep)));
                    }
                },
                None => {
                    if let Some((id, _)) = stack.pop() {
                        marks.insert(id, Mark::Done);
                    }
                }
            }
        }
    }
    Ok(())
}

fn dependencies<'a>(
    upstream: &'a BTreeMap<StepId, BTreeSet<StepId>>,
    id: &str,
) -> btree_set::Iter<'a, StepId> {
    static EMPTY: BTreeSet<StepId> = BTreeSet::new();
    upstream.get(id).unwrap_or(&EMPTY).iter()
}

fn compute_layers(
    upstream: &BTreeMap<StepId, BTreeSet<StepId>>,
    downstream: &BTreeMap<StepId, BTreeSet<StepId>>,
) -> Result<Vec<Vec<StepId>>, GraphError> {
    let mut pending: HashMap<&str, usize> = upstream
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();

    let mut current: Vec<StepId> = upstream
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| id.clone())
        .collect();

    let mut layers = Vec::new();
    let mut placed: HashSet<StepId> = HashSet::new();

    while !current.is_empty() {
        let mut next: BTreeSet<StepId> = BTreeSet::new();
        for id in &current {
            placed.insert(id.clone());
            for child in downstream.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(child.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        next.insert(child.clone());
                    }
                }
            }
        }
        layers.push(current);
        current = next.into_iter().collect();
    }

    if placed.len() != upstream.len() {
        let path = upstream
            .keys()
            .filter(|id| !placed.contains(*id))
            .cloned()
            .collect();
        return Err(GraphError::CycleDetected { path });
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlaybookStep;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn playbook(steps: Vec<PlaybookStep>) -> Playbook {
        Playbook::new("pb", "Test", steps)
    }

    fn layers_of(steps: Vec<PlaybookStep>) -> Vec<Vec<String>> {
        topological_layers(&playbook(steps)).unwrap()
    }

    #[test]
    fn test_linear_layers() {
        let layers = layers_of(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("B", "noop").depends_on(["A"]),
            PlaybookStep::new("C", "noop").depends_on(["B"]),
        ]);
        assert_eq!(layers, vec![vec!["A"], vec!["B"], vec!["C"]]);
    }

    #[test]
    fn test_diamond_layers() {
        let layers = layers_of(vec![
            PlaybookStep::new("D", "noop").depends_on(["C", "B"]),
            PlaybookStep::new("C", "noop").depends_on(["A"]),
            PlaybookStep::new("B", "noop").depends_on(["A"]),
            PlaybookStep::new("A", "noop"),
        ]);
        assert_eq!(layers, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
    }

    #[test]
    fn test_layer_ties_sorted_by_id() {
        let layers = layers_of(vec![
            PlaybookStep::new("zeta", "noop"),
            PlaybookStep::new("alpha", "noop"),
            PlaybookStep::new("mid", "noop").depends_on(["zeta"]),
        ]);
        assert_eq!(layers, vec![vec!["alpha", "zeta"], vec!["mid"]]);
    }

    #[test]
    fn test_cycle_detected() {
        let result = validate(&playbook(vec![
            PlaybookStep::new("A", "noop").depends_on(["C"]),
            PlaybookStep::new("B", "noop").depends_on(["A"]),
            PlaybookStep::new("C", "noop").depends_on(["B"]),
        ]));
        match result {
            Err(GraphError::CycleDetected { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_deep_chain_validates_on_small_stack() {
        let steps: Vec<PlaybookStep> = (0..50_000)
            .map(|i| {
                let step = PlaybookStep::new(format!("s{}", i), "noop");
                if i == 0 {
                    step
                } else {
                    step.depends_on([format!("s{}", i - 1)])
                }
            })
            .collect();
        let chain = playbook(steps);

        let outcome = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                let validated = validate(&chain);
                let layers = topological_layers(&chain).map(|layers| layers.len());
                (validated, layers)
            })
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(outcome.0, Ok(()));
        assert_eq!(outcome.1, Ok(50_000));
    }

    #[test]
    fn test_deep_cycle_reports_full_path() {
        let n = 10_000;
        let steps: Vec<PlaybookStep> = (0..n)
            .map(|i| PlaybookStep::new(format!("s{}", i), "noop").depends_on([format!("s{}", (i + 1) % n)]))
            .collect();
        match validate(&playbook(steps)) {
            Err(GraphError::CycleDetected { path }) => {
                assert_eq!(path.len(), n + 1);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let result = validate(&playbook(vec![PlaybookStep::new("A", "noop").depends_on(["A"])]));
        assert_eq!(
            result,
            Err(GraphError::CycleDetected {
                path: vec!["A".to_string(), "A".to_string()]
            })
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let result = validate(&playbook(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("B", "noop").depends_on(["missing"]),
        ]));
        assert_eq!(
            result,
            Err(GraphError::UnknownDependency {
                step_id: "B".to_string(),
                dependency: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_duplicate_step_id() {
        let result = validate(&playbook(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("A", "other"),
        ]));
        assert_eq!(result, Err(GraphError::DuplicateStepId("A".to_string())));
    }

    #[test]
    fn test_repeated_dependency_entries_tolerated() {
        let layers = layers_of(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("B", "noop").depends_on(["A", "A"]),
        ]);
        assert_eq!(layers, vec![vec!["A"], vec!["B"]]);
    }

    #[test]
    fn test_empty_playbook_has_no_layers() {
        let graph = DependencyGraph::build(&playbook(vec![])).unwrap();
        assert!(graph.layers().is_empty());
        assert_eq!(graph.execution_order().count(), 0);
    }

    #[test]
    fn test_adjacency_and_order() {
        let graph = DependencyGraph::build(&playbook(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("B", "noop").depends_on(["A"]),
            PlaybookStep::new("C", "noop").depends_on(["B"]),
            PlaybookStep::new("X", "noop"),
        ]))
        .unwrap();

        assert_eq!(graph.upstream("C").collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(graph.upstream("X").count(), 0);
        assert_eq!(
            graph.execution_order().cloned().collect::<Vec<_>>(),
            vec!["A", "X", "B", "C"]
        );
    }

    #[test]
    fn test_verify_layers_rejects_unsound_layering() {
        let pb = playbook(vec![
            PlaybookStep::new("A", "noop"),
            PlaybookStep::new("B", "noop").depends_on(["A"]),
        ]);
        let same_layer = vec![vec!["A".to_string(), "B".to_string()]];
        assert!(verify_layers(&pb, &same_layer).is_err());

        let missing = vec![vec!["A".to_string()]];
        assert!(verify_layers(&pb, &missing).is_err());

        let sound = topological_layers(&pb).unwrap();
        assert!(verify_layers(&pb, &sound).is_ok());
    }

    #[test]
    fn test_layers_sound_for_random_dags() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let size = rng.gen_range(1..25);
            let steps: Vec<PlaybookStep> = (0..size)
                .map(|i| {
                    // only point at lower indices so the graph stays acyclic
                    let deps: Vec<String> = (0..i)
                        .filter(|_| rng.gen_bool(0.25))
                        .map(|j| format!("s{:02}", j))
                        .collect();
                    PlaybookStep::new(format!("s{:02}", i), "noop").depends_on(deps)
                })
                .collect();
            let pb = playbook(steps);
            let layers = topological_layers(&pb).unwrap();
            verify_layers(&pb, &layers).unwrap();

            for layer in &layers {
                let mut sorted = layer.clone();
                sorted.sort();
                assert_eq!(&sorted, layer);
            }
        }
    }

    #[test]
    fn test_random_back_edge_always_detected() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let size = rng.gen_range(2..15);
            let mut steps: Vec<PlaybookStep> = (0..size)
                .map(|i| {
                    let deps: Vec<String> = if i == 0 {
                        vec![]
                    } else {
                        vec![format!("s{:02}", i - 1)]
                    };
                    PlaybookStep::new(format!("s{:02}", i), "noop").depends_on(deps)
                })
                .collect();
            // close the chain at a random point
            let from = rng.gen_range(0..size);
            let to = rng.gen_range(from..size);
            steps[from].depends_on.push(format!("s{:02}", to));

            assert!(matches!(
                validate(&playbook(steps)),
                Err(GraphError::CycleDetected { .. })
            ));
        }
    }
}
