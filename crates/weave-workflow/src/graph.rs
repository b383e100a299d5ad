//! Step dependency graph.
//!
//! Built once when a workflow is registered and cached alongside it. Rejects
//! references to unknown steps and dependency cycles.

use std::collections::HashMap;

use crate::definition::WorkflowDefinition;
use crate::error::{Result, WorkflowError};

/// DFS visit state.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Step id → dependency ids, plus the reverse edges and a topological order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph for a definition.
    ///
    /// Fails with `InvalidWorkflow` if any dependency names an unknown step
    /// or if the dependency relation contains a cycle.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for step in &definition.steps {
            dependencies.insert(step.id.clone(), step.dependencies.clone());
            dependents.entry(step.id.clone()).or_default();
        }

        for step in &definition.steps {
            for dep in &step.dependencies {
                if !dependencies.contains_key(dep) {
                    return Err(WorkflowError::InvalidWorkflow(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        // Visit in declaration order so the topological order is stable.
        let ids: Vec<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut colors: HashMap<&str, Color> = ids.iter().map(|id| (*id, Color::White)).collect();
        let mut order = Vec::with_capacity(ids.len());

        for id in &ids {
            if colors[id] == Color::White {
                visit(id, &dependencies, &mut colors, &mut order)?;
            }
        }

        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    /// Dependencies of a step (empty for unknown ids).
    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.dependencies
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Steps that depend directly on `step_id`.
    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Step ids ordered so every step comes after all of its dependencies.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// The raw step id → dependency ids map.
    pub fn as_map(&self) -> &HashMap<String, Vec<String>> {
        &self.dependencies
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Iterative depth-first visit from `root`. Each frame is a gray step and
/// the index of its next dependency; the frames form the current path.
fn visit<'a>(
    root: &'a str,
    dependencies: &'a HashMap<String, Vec<String>>,
    colors: &mut HashMap<&'a str, Color>,
    order: &mut Vec<String>,
) -> Result<()> {
    let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];
    colors.insert(root, Color::Gray);

    while let Some(frame) = stack.last_mut() {
        let (id, next) = *frame;
        frame.1 += 1;

        let Some(dep) = dependencies[id].get(next) else {
            stack.pop();
            colors.insert(id, Color::Black);
            order.push(id.to_string());
            continue;
        };

        match colors[dep.as_str()] {
            Color::White => {
                colors.insert(dep.as_str(), Color::Gray);
                stack.push((dep.as_str(), 0));
            }
            Color::Gray => {
                let start = stack
                    .iter()
                    .position(|(p, _)| *p == dep.as_str())
                    .unwrap_or(0);
                let mut cycle: Vec<&str> = stack[start..].iter().map(|(p, _)| *p).collect();
                cycle.push(dep.as_str());
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "Cycle detected in step dependencies: {}",
                    cycle.join(" -> ")
                )));
            }
            Color::Black => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowStep;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        let mut s = WorkflowStep::action(id, "agent", "run");
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        steps
            .into_iter()
            .fold(WorkflowDefinition::new("wf", "wf"), |wf, s| wf.with_step(s))
    }

    #[test]
    fn test_linear_chain() {
        let wf = workflow(vec![step("c", &["b"]), step("a", &[]), step("b", &["a"])]);
        let graph = DependencyGraph::build(&wf).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies("c"), ["b".to_string()]);
        assert_eq!(graph.dependents("a"), ["b".to_string()]);
        assert_eq!(graph.topological_order(), ["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_order() {
        let wf = workflow(vec![
            step("root", &[]),
            step("left", &["root"]),
            step("right", &["root"]),
            step("join", &["left", "right"]),
        ]);
        let graph = DependencyGraph::build(&wf).unwrap();
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("root") < pos("left"));
        assert!(pos("root") < pos("right"));
        assert!(pos("left") < pos("join"));
        assert!(pos("right") < pos("join"));
        assert_eq!(graph.dependents("root").len(), 2);
    }

    #[test]
    fn test_unknown_dependency() {
        let wf = workflow(vec![step("a", &["ghost"])]);
        let err = DependencyGraph::build(&wf).unwrap_err();
        assert!(
            err.to_string()
                .contains("Step 'a' depends on unknown step 'ghost'")
        );
    }

    #[test]
    fn test_cycle_detected() {
        let wf = workflow(vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])]);
        let err = DependencyGraph::build(&wf).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Cycle detected"), "{msg}");
        assert!(msg.contains("a -> c -> b -> a"), "{msg}");
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        // Declared tail first so the walk descends the whole chain at once
        let n = 10_000;
        let steps = (0..n)
            .rev()
            .map(|i| {
                let mut s = WorkflowStep::action(format!("s{i}"), "agent", "run");
                if i > 0 {
                    s.dependencies = vec![format!("s{}", i - 1)];
                }
                s
            })
            .collect();
        let graph = DependencyGraph::build(&workflow(steps)).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), n);
        assert_eq!(order[0], "s0");
        assert_eq!(order[n - 1], format!("s{}", n - 1));
    }

    #[test]
    fn test_long_cycle_reports_path() {
        let n = 5_000;
        let steps = (0..n)
            .map(|i| {
                let mut s = WorkflowStep::action(format!("s{i}"), "agent", "run");
                s.dependencies = vec![format!("s{}", (i + 1) % n)];
                s
            })
            .collect();
        let msg = DependencyGraph::build(&workflow(steps)).unwrap_err().to_string();
        assert!(msg.contains("Cycle detected"));
        assert!(msg.ends_with(&format!("s{} -> s0", n - 1)), "{}", &msg[msg.len() - 40..]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let wf = workflow(vec![step("a", &["a"])]);
        assert!(DependencyGraph::build(&wf).is_err());
    }

    #[test]
    fn test_empty_workflow() {
        let graph = DependencyGraph::build(&WorkflowDefinition::new("wf", "wf")).unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_order().is_empty());
        assert!(graph.dependencies("missing").is_empty());
    }
}
