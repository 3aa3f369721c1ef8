//! Experiments: groupings of completions across versions and inputs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentInput;
use crate::domain::version::Version;
use crate::error::ApiError;

/// A grouping of related completions, typically the cross product of a set
/// of versions and a set of inputs. Owns references only; completions live
/// in the analytics store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Completion ids, ordered, deduplicated
    #[serde(default)]
    pub run_ids: Vec<Uuid>,
    #[serde(default)]
    pub versions: Vec<Version>,
    #[serde(default)]
    pub inputs: Vec<AgentInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    /// Append a run id, keeping the list deduplicated. The completion must
    /// reference a version and input already registered on the experiment.
    pub fn add_run_id(
        &mut self,
        run_id: Uuid,
        version_id: &str,
        input_id: &str,
    ) -> Result<(), ApiError> {
        if !self.versions.iter().any(|v| v.id == version_id) {
            return Err(ApiError::bad_request(format!(
                "Version {version_id} is not part of experiment {}",
                self.id
            )));
        }
        if !self.inputs.iter().any(|i| i.id == input_id) {
            return Err(ApiError::bad_request(format!(
                "Input {input_id} is not part of experiment {}",
                self.id
            )));
        }
        if !self.run_ids.contains(&run_id) {
            self.run_ids.push(run_id);
        }
        Ok(())
    }
}
