//! Stage dependency graph representation and analysis.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::domain::pipeline::{DefinitionError, PipelineDefinition};
use crate::domain::run::{StageResult, StageStatus};

/// Directed acyclic graph of the stages of one pipeline definition.
///
/// Edges point from a dependency to the stages that depend on it.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Dependencies of each stage.
    dependencies: HashMap<String, Vec<String>>,
    /// Direct dependents of each stage.
    dependents: HashMap<String, Vec<String>>,
    /// Stages in a valid execution order.
    order: Vec<String>,
}

impl StageGraph {
    /// Build the graph and compute a topological order using Kahn's algorithm.
    ///
    /// Ties are broken by declaration order so the result is deterministic.
    /// Returns [`DefinitionError::Cycle`] if the dependencies are not acyclic.
    pub fn build(definition: &PipelineDefinition) -> Result<Self, DefinitionError> {
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for stage in &definition.stages {
            dependencies.insert(stage.id.clone(), stage.depends_on.clone());
            dependents.entry(stage.id.clone()).or_default();
            in_degree.insert(stage.id.as_str(), stage.depends_on.len());
        }

        for stage in &definition.stages {
            for dep in &stage.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(stage.id.clone());
            }
        }

        let mut queue: VecDeque<&str> = definition
            .stages
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(definition.stages.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());

            // Keep declaration order among newly freed stages
            for stage in &definition.stages {
                if !stage.depends_on.iter().any(|d| d == id) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(stage.id.as_str()) {
                    // A stage may list the same dependency twice
                    let edges = stage.depends_on.iter().filter(|d| *d == id).count();
                    *degree = degree.saturating_sub(edges);
                    if *degree == 0 {
                        queue.push_back(stage.id.as_str());
                    }
                }
            }
        }

        if order.len() != definition.stages.len() {
            let mut remaining: Vec<&str> = definition
                .stages
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !order.iter().any(|o| o == id))
                .collect();
            remaining.sort_unstable();
            return Err(DefinitionError::Cycle(remaining.join(", ")));
        }

        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    /// Stages in topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a stage.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of a stage.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every stage that transitively depends on `id`, in topological order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut found: Vec<&str> = Vec::new();
        let mut queue: VecDeque<&str> = self.dependents(id).iter().map(String::as_str).collect();

        while let Some(next) = queue.pop_front() {
            if found.contains(&next) {
                continue;
            }
            found.push(next);
            queue.extend(self.dependents(next).iter().map(String::as_str));
        }

        self.order
            .iter()
            .filter(|s| found.contains(&s.as_str()))
            .cloned()
            .collect()
    }

    /// Whether every dependency of `id` has succeeded.
    pub fn dependencies_met(&self, id: &str, results: &BTreeMap<String, StageResult>) -> bool {
        self.dependencies(id).iter().all(|dep| {
            results
                .get(dep)
                .is_some_and(|r| r.status == StageStatus::Succeeded)
        })
    }

    /// Pending stages whose dependencies have all succeeded, in topological order.
    pub fn ready_stages(&self, results: &BTreeMap<String, StageResult>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                results
                    .get(id.as_str())
                    .is_some_and(|r| r.status == StageStatus::Pending)
            })
            .filter(|id| self.dependencies_met(id, results))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::{Capability, StageDefinition};

    fn diamond() -> PipelineDefinition {
        PipelineDefinition {
            name: "diamond".to_string(),
            repository: "acme/diamond".to_string(),
            description: None,
            stages: vec![
                StageDefinition::new("a", Capability::Build),
                StageDefinition::new("b", Capability::Custom).depends_on(["a"]),
                StageDefinition::new("c", Capability::Custom).depends_on(["a"]),
                StageDefinition::new("d", Capability::Custom).depends_on(["b", "c"]),
                StageDefinition::new("e", Capability::Custom),
            ],
            gates: vec![],
            canary: None,
        }
    }

    fn pending(def: &PipelineDefinition) -> BTreeMap<String, StageResult> {
        def.stages
            .iter()
            .map(|s| (s.id.clone(), StageResult::pending()))
            .collect()
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = StageGraph::build(&diamond()).unwrap();
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();

        assert_eq!(order.len(), 5);
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = StageGraph::build(&diamond()).unwrap();
        assert_eq!(graph.transitive_dependents("a"), vec!["b", "c", "d"]);
        assert_eq!(graph.transitive_dependents("c"), vec!["d"]);
        assert!(graph.transitive_dependents("e").is_empty());
    }

    #[test]
    fn test_ready_stages_follow_success() {
        let def = diamond();
        let graph = StageGraph::build(&def).unwrap();
        let mut results = pending(&def);

        assert_eq!(graph.ready_stages(&results), vec!["a", "e"]);

        results.get_mut("a").unwrap().status = StageStatus::Succeeded;
        results.get_mut("e").unwrap().status = StageStatus::Running;
        assert_eq!(graph.ready_stages(&results), vec!["b", "c"]);

        results.get_mut("b").unwrap().status = StageStatus::Succeeded;
        results.get_mut("c").unwrap().status = StageStatus::Failed;
        assert!(graph.ready_stages(&results).is_empty());
        assert!(!graph.dependencies_met("d", &results));
    }

    #[test]
    fn test_cycle_detection() {
        let mut def = diamond();
        def.stages[1].depends_on.push("d".to_string());

        let err = StageGraph::build(&def).unwrap_err();
        assert_eq!(err, DefinitionError::Cycle("b, d".to_string()));
    }
}
