//! Pipeline specifications.
//!
//! A pipeline is an ordered list of steps. Each step names its controller
//! type, the computation it runs and how its input is assembled:
//!
//! ```json
//! {
//!   "steps": [
//!     {
//!       "controller": "local",
//!       "computations": [{ "id": "sum", "dockerImage": "org/sum", "command": ["python", "entry.py"] }],
//!       "inputMap": { "numbers": { "value": [2, 3] } }
//!     },
//!     {
//!       "controller": "decentralized",
//!       "computations": [{ "id": "scale", "dockerImage": "org/scale", "command": ["python", "entry.py"] }],
//!       "inputMap": { "sum": { "fromCache": { "step": 0, "variable": "sum" } } }
//!     }
//!   ]
//! }
//! ```

use crate::config::OperatingMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Controller policy of a step.
///
/// Deserializes from the bare name (`"local"`) or the registry's object
/// form (`{"type": "local"}`); serializes to the bare name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// Iterates locally until the computation reports success.
    #[default]
    Local,
    /// Alternates local iterations with remote aggregation.
    Decentralized,
}

impl std::fmt::Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Decentralized => f.write_str("decentralized"),
        }
    }
}

impl<'de> Deserialize<'de> for ControllerType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "lowercase")]
        enum Name {
            Local,
            Decentralized,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(Name),
            Object {
                #[serde(rename = "type")]
                kind: Name,
            },
        }

        let name = match Repr::deserialize(deserializer)? {
            Repr::Name(name) | Repr::Object { kind: name } => name,
        };
        Ok(match name {
            Name::Local => Self::Local,
            Name::Decentralized => Self::Decentralized,
        })
    }
}

/// Image and command replacing the local ones on the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationOverrides {
    /// Aggregator image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    /// Aggregator command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// Computation run by a step, as supplied by the computation registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationSpec {
    /// Registry ID.
    pub id: String,
    /// Worker image.
    pub docker_image: String,
    /// Command and leading arguments. The JSON input is appended.
    pub command: Vec<String>,
    /// Aggregator overrides.
    #[serde(default, alias = "remote", skip_serializing_if = "Option::is_none")]
    pub remote_overrides: Option<ComputationOverrides>,
}

impl ComputationSpec {
    /// Effective spec for `mode`: the aggregator applies its overrides.
    #[must_use]
    pub fn for_mode(&self, mode: OperatingMode) -> Self {
        let mut resolved = self.clone();
        if mode == OperatingMode::Remote {
            if let Some(overrides) = &self.remote_overrides {
                if let Some(image) = &overrides.docker_image {
                    resolved.docker_image = image.clone();
                }
                if let Some(command) = &overrides.command {
                    resolved.command = command.clone();
                }
            }
        }
        resolved
    }
}

/// Reference to a variable in an earlier step's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRef {
    /// Index of the producing step.
    pub step: usize,
    /// Key in that step's output object.
    pub variable: String,
}

/// Source of one input variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// Output variable of an earlier step.
    FromCache {
        /// Producing step and variable.
        #[serde(rename = "fromCache")]
        from_cache: CacheRef,
    },
    /// Literal value.
    Value {
        /// The value.
        value: Value,
    },
}

/// One pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Controller policy.
    #[serde(alias = "controllerType")]
    pub controller: ControllerType,
    /// Computations of the step. Only the first one runs.
    pub computations: Vec<ComputationSpec>,
    /// Input variables.
    #[serde(default)]
    pub input_map: BTreeMap<String, InputSource>,
}

impl StepSpec {
    /// Assembles the step's input from its input map.
    ///
    /// With an empty map the previous step's output is passed through, and
    /// the first step receives an empty object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputMapping`] if a reference points at the current
    /// or a later step, or at a variable the step did not produce.
    pub fn build_input(&self, index: usize, outputs: &[Value]) -> Result<Value> {
        if self.input_map.is_empty() {
            return Ok(outputs
                .last()
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())));
        }
        let mut input = Map::new();
        for (name, source) in &self.input_map {
            let value = match source {
                InputSource::Value { value } => value.clone(),
                InputSource::FromCache { from_cache } => {
                    if from_cache.step >= index {
                        return Err(Error::InputMapping {
                            step: index,
                            reason: format!(
                                "variable '{name}' references step {} which has not run",
                                from_cache.step
                            ),
                        });
                    }
                    outputs
                        .get(from_cache.step)
                        .and_then(|output| output.get(&from_cache.variable))
                        .cloned()
                        .ok_or_else(|| Error::InputMapping {
                            step: index,
                            reason: format!(
                                "step {} produced no variable '{}'",
                                from_cache.step, from_cache.variable
                            ),
                        })?
                }
            };
            input.insert(name.clone(), value);
        }
        Ok(Value::Object(input))
    }
}

/// Ordered pipeline steps. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Steps in execution order.
    pub steps: Vec<StepSpec>,
}

impl PipelineSpec {
    /// Parses a pipeline from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the pipeline invalid.
    pub fn from_json(raw: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that every step has a runnable computation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPipeline`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no steps".to_string()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let Some(computation) = step.computations.first() else {
                return Err(Error::InvalidPipeline(format!(
                    "step {index} has no computation"
                )));
            };
            if computation.command.is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "computation '{}' of step {index} has an empty command",
                    computation.id
                )));
            }
            if computation.docker_image.is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "computation '{}' of step {index} has no image",
                    computation.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(input_map: Value) -> StepSpec {
        serde_json::from_value(json!({
            "controller": "local",
            "computations": [{ "id": "c", "dockerImage": "img", "command": ["run"] }],
            "inputMap": input_map,
        }))
        .unwrap()
    }

    #[test]
    fn test_input_sources() {
        let step = step(json!({
            "sum": { "fromCache": { "step": 0, "variable": "sum" } },
            "scale": { "value": 2 },
        }));
        let input = step.build_input(1, &[json!({ "sum": 5 })]).unwrap();
        assert_eq!(input, json!({ "sum": 5, "scale": 2 }));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let step = step(json!({ "x": { "fromCache": { "step": 1, "variable": "x" } } }));
        let err = step.build_input(1, &[json!({})]).unwrap_err();
        assert!(matches!(err, Error::InputMapping { step: 1, .. }));
    }

    #[test]
    fn test_missing_variable() {
        let step = step(json!({ "x": { "fromCache": { "step": 0, "variable": "x" } } }));
        assert!(step.build_input(1, &[json!({ "y": 1 })]).is_err());
    }

    #[test]
    fn test_empty_map_passes_previous_output() {
        let step = step(json!({}));
        assert_eq!(step.build_input(0, &[]).unwrap(), json!({}));
        assert_eq!(
            step.build_input(1, &[json!({ "a": 1 })]).unwrap(),
            json!({ "a": 1 })
        );
    }

    #[test]
    fn test_controller_forms() {
        let object: StepSpec = serde_json::from_value(json!({
            "controller": { "type": "decentralized", "options": {} },
            "computations": [{ "id": "c", "dockerImage": "img", "command": ["run"] }],
        }))
        .unwrap();
        assert_eq!(object.controller, ControllerType::Decentralized);
        assert_eq!(step(json!({})).controller, ControllerType::Local);

        let local: ControllerType = serde_json::from_value(json!({ "type": "local" })).unwrap();
        assert_eq!(local, ControllerType::Local);
        assert_eq!(serde_json::to_value(local).unwrap(), json!("local"));
        assert!(serde_json::from_value::<ControllerType>(json!({ "type": "central" })).is_err());
        assert!(serde_json::from_value::<ControllerType>(json!("central")).is_err());
    }

    #[test]
    fn test_remote_overrides() {
        let spec: ComputationSpec = serde_json::from_value(json!({
            "id": "c",
            "dockerImage": "org/local",
            "command": ["python", "local.py"],
            "remote": { "dockerImage": "org/remote", "command": ["python", "remote.py"] }
        }))
        .unwrap();
        assert_eq!(spec.for_mode(OperatingMode::Local).docker_image, "org/local");
        let remote = spec.for_mode(OperatingMode::Remote);
        assert_eq!(remote.docker_image, "org/remote");
        assert_eq!(remote.command, vec!["python", "remote.py"]);
    }

    #[test]
    fn test_validate() {
        assert!(PipelineSpec { steps: vec![] }.validate().is_err());
        let mut bad = step(json!({}));
        bad.computations[0].command.clear();
        assert!(PipelineSpec { steps: vec![bad] }.validate().is_err());
        assert!(PipelineSpec { steps: vec![step(json!({}))] }.validate().is_ok());
    }
}
