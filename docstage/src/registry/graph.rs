//! The validated stage graph.

use super::StageDefinition;
use crate::errors::RegistryError;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Validated, immutable stage graph.
///
/// Construction validates the definitions and precomputes the reverse
/// adjacency used for frontier expansion, so lookups never fail on a
/// registry that exists.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, StageDefinition>,
    /// Definition order, used as a tie-breaker for determinism.
    order: Vec<String>,
    /// Topologically sorted stage names.
    topo: Vec<String>,
    /// stage -> stages that list it as a dependency.
    successors: HashMap<String, BTreeSet<String>>,
}

impl StageRegistry {
    /// Builds a registry from definitions.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn new(definitions: impl IntoIterator<Item = StageDefinition>) -> Result<Self, RegistryError> {
        let definitions: Vec<StageDefinition> = definitions.into_iter().collect();
        validate(&definitions)?;

        let order: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        let mut successors: HashMap<String, BTreeSet<String>> =
            order.iter().map(|name| (name.clone(), BTreeSet::new())).collect();
        for def in &definitions {
            for dep in &def.depends_on {
                if let Some(set) = successors.get_mut(dep) {
                    set.insert(def.name.clone());
                }
            }
        }

        let stages: HashMap<String, StageDefinition> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let topo = topological_sort(&stages, &order);

        Ok(Self {
            stages,
            order,
            topo,
            successors,
        })
    }

    /// Returns the definition of a stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&StageDefinition> {
        self.stages.get(stage)
    }

    /// Returns true if the stage exists.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a constructed registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iterates definitions in topological order.
    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.topo.iter().filter_map(|name| self.stages.get(name))
    }

    /// Stage names in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.topo
    }

    /// Stage names in definition order.
    #[must_use]
    pub fn definition_order(&self) -> &[String] {
        &self.order
    }

    /// Stages with no dependencies, in topological order.
    #[must_use]
    pub fn root_stages(&self) -> Vec<&StageDefinition> {
        self.iter().filter(|d| d.is_root()).collect()
    }

    /// Required stages, in topological order.
    #[must_use]
    pub fn required_stages(&self) -> Vec<&StageDefinition> {
        self.iter().filter(|d| d.required).collect()
    }

    /// Number of required stages.
    #[must_use]
    pub fn required_count(&self) -> usize {
        self.stages.values().filter(|d| d.required).count()
    }

    /// Stages that list `stage` as a direct dependency.
    ///
    /// These are the only candidates that may become eligible once `stage`
    /// reaches completed or skipped. Unknown stages yield nothing.
    #[must_use]
    pub fn eligible_successors(&self, stage: &str) -> Vec<&StageDefinition> {
        self.successors
            .get(stage)
            .into_iter()
            .flatten()
            .filter_map(|name| self.stages.get(name))
            .collect()
    }

    /// All stages reachable through reverse dependency edges, in
    /// topological order. Does not include `stage` itself.
    #[must_use]
    pub fn transitive_dependents(&self, stage: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([stage]);

        while let Some(current) = queue.pop_front() {
            for next in self.successors.get(current).into_iter().flatten() {
                if seen.insert(next.as_str()) {
                    queue.push_back(next.as_str());
                }
            }
        }

        self.topo
            .iter()
            .filter(|name| seen.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Validates stage definitions.
///
/// # Errors
///
/// Returns [`RegistryError`] for an empty set, duplicate names, self
/// dependencies, unknown dependencies or cycles.
pub fn validate(definitions: &[StageDefinition]) -> Result<(), RegistryError> {
    if definitions.is_empty() {
        return Err(RegistryError::Empty);
    }

    let mut by_name: HashMap<&str, &StageDefinition> = HashMap::new();
    for def in definitions {
        if by_name.insert(def.name.as_str(), def).is_some() {
            return Err(RegistryError::DuplicateStage {
                stage: def.name.clone(),
            });
        }
    }

    for def in definitions {
        if def.depends_on.contains(&def.name) {
            return Err(RegistryError::SelfDependency {
                stage: def.name.clone(),
            });
        }
        if let Some(missing) = def.depends_on.iter().find(|d| !by_name.contains_key(d.as_str())) {
            return Err(RegistryError::UnknownDependency {
                stage: def.name.clone(),
                dependency: missing.clone(),
            });
        }
    }

    detect_cycles(definitions, &by_name)
}

fn detect_cycles(
    definitions: &[StageDefinition],
    by_name: &HashMap<&str, &StageDefinition>,
) -> Result<(), RegistryError> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for def in definitions {
        if !visited.contains(def.name.as_str()) {
            if let Some(cycle) = dfs_cycle(&def.name, by_name, &mut visited, &mut on_stack, &mut path) {
                return Err(RegistryError::CycleDetected { cycle_path: cycle });
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_name: &HashMap<&str, &'a StageDefinition>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    if let Some(def) = by_name.get(node) {
        for dep in &def.depends_on {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_name, visited, on_stack, path) {
                    return Some(cycle);
                }
            } else if on_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack.remove(node);
    None
}

fn topological_sort(stages: &HashMap<String, StageDefinition>, order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &HashMap<String, StageDefinition>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(def) = stages.get(node) {
            for dep in &def.depends_on {
                visit(dep, stages, visited, result);
            }
        }
        result.push(node.to_string());
    }

    let mut result = Vec::with_capacity(order.len());
    let mut visited = HashSet::new();
    for name in order {
        visit(name, stages, &mut visited, &mut result);
    }
    result
}
