//! Workflow definitions and the step dependency graph.
//!
//! A client submits a [`WorkflowDefinition`]. Parsing resolves every step
//! target against the registry and builds the dependency graph from the
//! input bindings. The result is a [`ParsedWorkflow`], whose execution order
//! is fixed: topological, with declaration order breaking ties. The parsed
//! form is also what gets persisted as the workflow descriptor.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, ValidationKind};
use crate::naming::{normalize_path, validate_name};
use crate::service::{ServiceEntry, ServiceKind};
use crate::types::EntityId;

/// Maximum number of steps in a single workflow.
pub const MAX_STEPS: usize = 256;

/// Binding keyword for the original request payload.
pub const REQUEST_BINDING: &str = "request";

/// Slot used when a step declares no bindings, or uses the `input` shorthand.
pub const DEFAULT_INPUT_SLOT: &str = "input";

// ---------------------------------------------------------------------------
// Submitted definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Defaults to `step{N}` (1-based declaration index).
    #[serde(default)]
    pub id: Option<String>,
    /// Routable path of the target service, e.g. `/algorithms/binarize/1`.
    pub target: String,
    /// Shorthand for `inputs: {"input": <binding>}`.
    #[serde(default)]
    pub input: Option<String>,
    /// Input slot -> binding. A binding is `request`, `request.<key>`,
    /// an output name, or `<stepId>.<outputName>`.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    pub output: String,
    /// Static parameters passed to the algorithm unchanged.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Parsed workflow
// ---------------------------------------------------------------------------

/// Where a step input slot gets its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum Binding {
    /// The original request payload, or one key of it.
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    /// The published result of an earlier step.
    Step { step: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStep {
    pub id: String,
    pub target_path: String,
    pub target_id: EntityId,
    pub bindings: BTreeMap<String, Binding>,
    pub output: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Step ids this step waits for, in declaration order.
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedWorkflow {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<ResolvedStep>,
    /// Step ids in execution order.
    pub order: Vec<String>,
}

impl ParsedWorkflow {
    pub fn step(&self, id: &str) -> Option<&ResolvedStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps in execution order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.order.iter().filter_map(|id| self.step(id))
    }

    /// Steps that bind directly to `id`'s output.
    pub fn direct_dependents(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Every step that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for dependent in self.direct_dependents(&current) {
                if found.insert(dependent.to_string()) {
                    frontier.push(dependent.to_string());
                }
            }
        }
        found
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Validate `definition` and build its dependency graph.
///
/// `resolve` maps a normalized target path to the active service entry at
/// that path, if any. Only available algorithms can be step targets.
pub fn parse_definition<F>(
    definition: &WorkflowDefinition,
    resolve: F,
) -> Result<ParsedWorkflow, CoreError>
where
    F: Fn(&str) -> Option<ServiceEntry>,
{
    validate_name("Workflow name", &definition.name)?;
    validate_name("Workflow version", &definition.version)?;

    if definition.steps.is_empty() {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            "Workflow must declare at least one step",
        ));
    }
    if definition.steps.len() > MAX_STEPS {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            format!(
                "Workflow has {} steps, exceeding the maximum of {MAX_STEPS}",
                definition.steps.len()
            ),
        ));
    }

    let ids = step_ids(definition)?;
    let outputs = output_owners(definition, &ids)?;

    let mut steps = Vec::with_capacity(definition.steps.len());
    for (step_def, id) in definition.steps.iter().zip(&ids) {
        let target = resolve_target(id, &step_def.target, &resolve)?;
        let bindings = parse_bindings(id, step_def, &ids, &outputs)?;

        let mut depends_on: Vec<String> = Vec::new();
        for binding in bindings.values() {
            if let Binding::Step { step, .. } = binding {
                if !depends_on.contains(step) {
                    depends_on.push(step.clone());
                }
            }
        }
        // Keep dependencies in declaration order for stable descriptors.
        depends_on.sort_by_key(|dep| ids.iter().position(|i| i == dep));

        steps.push(ResolvedStep {
            id: id.clone(),
            target_path: target.path,
            target_id: target.identifier,
            bindings,
            output: step_def.output.clone(),
            parameters: step_def.parameters.clone(),
            depends_on,
        });
    }

    let order = execution_order(&steps)?;

    Ok(ParsedWorkflow {
        name: definition.name.clone(),
        version: definition.version.clone(),
        description: definition.description.clone(),
        steps,
        order,
    })
}

fn step_ids(definition: &WorkflowDefinition) -> Result<Vec<String>, CoreError> {
    let mut ids: Vec<String> = Vec::with_capacity(definition.steps.len());
    for (index, step) in definition.steps.iter().enumerate() {
        let id = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step{}", index + 1));
        validate_name("Step id", &id)?;
        if ids.contains(&id) {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                format!("Duplicate step id '{id}'"),
            ));
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Map each output name to the id of the step producing it.
fn output_owners(
    definition: &WorkflowDefinition,
    ids: &[String],
) -> Result<HashMap<String, String>, CoreError> {
    let mut owners = HashMap::new();
    for (step, id) in definition.steps.iter().zip(ids) {
        validate_name("Step output", &step.output)?;
        if step.output == REQUEST_BINDING {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                format!("Step '{id}' may not name its output '{REQUEST_BINDING}'"),
            ));
        }
        if let Some(previous) = owners.insert(step.output.clone(), id.clone()) {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                format!(
                    "Output '{}' is declared by both '{previous}' and '{id}'",
                    step.output
                ),
            ));
        }
    }
    Ok(owners)
}

fn resolve_target<F>(step_id: &str, target: &str, resolve: &F) -> Result<ServiceEntry, CoreError>
where
    F: Fn(&str) -> Option<ServiceEntry>,
{
    let path = normalize_path(target);
    let entry = resolve(&path).ok_or_else(|| {
        CoreError::validation(
            ValidationKind::UnknownTarget,
            format!("Step '{step_id}' targets unknown service '{path}'"),
        )
    })?;

    if !entry.is_available() {
        return Err(CoreError::validation(
            ValidationKind::UnknownTarget,
            format!(
                "Step '{step_id}' targets '{path}' which is not available ({})",
                entry.status.status_code
            ),
        ));
    }
    if entry.kind != ServiceKind::Algorithm {
        return Err(CoreError::validation(
            ValidationKind::UnknownTarget,
            format!("Step '{step_id}' targets '{path}', which is not an algorithm"),
        ));
    }
    Ok(entry)
}

fn parse_bindings(
    step_id: &str,
    step: &StepDefinition,
    ids: &[String],
    outputs: &HashMap<String, String>,
) -> Result<BTreeMap<String, Binding>, CoreError> {
    let mut raw = step.inputs.clone();
    if let Some(shorthand) = &step.input {
        if raw
            .insert(DEFAULT_INPUT_SLOT.to_string(), shorthand.clone())
            .is_some()
        {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                format!("Step '{step_id}' binds slot '{DEFAULT_INPUT_SLOT}' twice"),
            ));
        }
    }

    if raw.is_empty() {
        let mut bindings = BTreeMap::new();
        bindings.insert(
            DEFAULT_INPUT_SLOT.to_string(),
            Binding::Request { key: None },
        );
        return Ok(bindings);
    }

    raw.into_iter()
        .map(|(slot, value)| {
            validate_name("Input slot", &slot)?;
            let binding = parse_binding(step_id, &value, ids, outputs)?;
            Ok((slot, binding))
        })
        .collect()
}

fn parse_binding(
    step_id: &str,
    value: &str,
    ids: &[String],
    outputs: &HashMap<String, String>,
) -> Result<Binding, CoreError> {
    let value = value.trim();
    if value == REQUEST_BINDING {
        return Ok(Binding::Request { key: None });
    }
    if let Some(key) = value.strip_prefix("request.") {
        if key.is_empty() {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                format!("Step '{step_id}' has an empty request key"),
            ));
        }
        return Ok(Binding::Request {
            key: Some(key.to_string()),
        });
    }
    if let Some(owner) = outputs.get(value) {
        return Ok(Binding::Step {
            step: owner.clone(),
            output: value.to_string(),
        });
    }
    if let Some((step, output)) = value.split_once('.') {
        if ids.iter().any(|id| id == step) && outputs.get(output).map(String::as_str) == Some(step)
        {
            return Ok(Binding::Step {
                step: step.to_string(),
                output: output.to_string(),
            });
        }
    }
    Err(CoreError::validation(
        ValidationKind::UnknownBinding,
        format!("Step '{step_id}' binds '{value}', which no step produces"),
    ))
}

/// Kahn's algorithm. Among ready steps the earliest-declared runs first.
fn execution_order(steps: &[ResolvedStep]) -> Result<Vec<String>, CoreError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(next) = ready.pop_first() {
        order.push(steps[next].id.clone());
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck: Vec<&str> = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.id.as_str())
            .collect();
        return Err(CoreError::validation(
            ValidationKind::Cyclic,
            format!("Steps form a dependency cycle: {}", stuck.join(", ")),
        ));
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
