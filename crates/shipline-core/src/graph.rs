//! Validated stage graph and its topological layers.
//!
//! An edge `A → B` means "B depends on A": A must resolve Succeeded before B
//! may run. Layers come from Kahn's algorithm with level tracking, so every
//! stage in a layer has all of its upstreams in earlier layers and the stages
//! of one layer may run concurrently.

use std::collections::{HashMap, HashSet};

use crate::domain::{Result, ShiplineError, Stage};
use crate::registry::EnvironmentRegistry;

#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declaration order.
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
    /// Stage indices grouped by topological level.
    layers: Vec<Vec<usize>>,
}

impl StageGraph {
    /// Validate and layer a stage list.
    ///
    /// Rejects, as `Configuration` errors and before anything executes:
    /// duplicate stage names, dependencies on unknown or self stages, stages
    /// targeting unregistered environments, and cycles.
    pub fn build(stages: Vec<Stage>, registry: &EnvironmentRegistry) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(ShiplineError::Configuration(
                    "stage name must not be empty".to_string(),
                ));
            }
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(ShiplineError::Configuration(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        for stage in &stages {
            if !registry.contains(&stage.environment) {
                return Err(ShiplineError::Configuration(format!(
                    "stage '{}' targets unknown environment '{}'",
                    stage.name, stage.environment
                )));
            }
            let mut seen = HashSet::new();
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    return Err(ShiplineError::Configuration(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    )));
                }
                if !index.contains_key(dep) {
                    return Err(ShiplineError::Configuration(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
                if !seen.insert(dep) {
                    return Err(ShiplineError::Configuration(format!(
                        "stage '{}' lists dependency '{}' twice",
                        stage.name, dep
                    )));
                }
            }
        }

        let layers = layer(&stages, &index)?;
        Ok(Self {
            stages,
            index,
            layers,
        })
    }

    /// Stages grouped by topological level; declaration order within a level.
    pub fn layers(&self) -> Vec<Vec<&Stage>> {
        self.layers
            .iter()
            .map(|level| level.iter().map(|&i| &self.stages[i]).collect())
            .collect()
    }

    /// All stages in dispatch order (layer by layer).
    pub fn topological(&self) -> Vec<&Stage> {
        self.layers
            .iter()
            .flatten()
            .map(|&i| &self.stages[i])
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Direct upstream stages of `name`.
    pub fn upstream_of(&self, name: &str) -> Vec<&Stage> {
        self.stage(name)
            .map(|s| {
                s.depends_on
                    .iter()
                    .filter_map(|dep| self.stage(dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn layer(stages: &[Stage], index: &HashMap<String, usize>) -> Result<Vec<Vec<usize>>> {
    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.depends_on.len()).collect();
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for dep in &stage.depends_on {
            downstream[index[dep]].push(i);
        }
    }

    let mut current: Vec<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut layers = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::replace(&mut current, next));
    }

    if placed != stages.len() {
        let cyclic: Vec<&str> = stages
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.name.as_str())
            .collect();
        return Err(ShiplineError::Configuration(format!(
            "dependency cycle among stages: {}",
            cyclic.join(", ")
        )));
    }

    Ok(layers)
}
