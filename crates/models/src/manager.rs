use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ServerError;

/// The (cluster, hostname, uuid) triplet identifying a compute manager.
/// The triplet renders to the unique manager name `cluster-hostname-uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagerName {
    pub cluster: String,
    pub hostname: String,
    pub uuid: String,
}

impl ManagerName {
    pub fn fullname(&self) -> String {
        format!("{}-{}-{}", self.cluster, self.hostname, self.uuid)
    }
}

impl std::fmt::Display for ManagerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fullname())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "manager_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStatus {
    Active,
    Inactive,
}

/// Activation payload sent by a manager when it comes online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerActivation {
    pub name: ManagerName,
    pub manager_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Programs the manager can execute, mapped to an optional version.
    pub programs: BTreeMap<String, Option<String>>,
    /// Compute tags served, in preference order. `*` serves anything.
    pub tags: Vec<String>,
}

impl ManagerActivation {
    /// Normalize and validate: program names lowercased, zero-length entries
    /// dropped, tags lowercased and deduplicated preserving first appearance.
    pub fn normalized(&self) -> Result<(BTreeMap<String, Option<String>>, Vec<String>), ServerError>
    {
        let programs: BTreeMap<String, Option<String>> = self
            .programs
            .iter()
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, version)| (name.trim().to_lowercase(), version.clone()))
            .collect();

        if programs.is_empty() {
            return Err(ServerError::compute_manager(format!(
                "manager {} does not have any programs available",
                self.name
            )));
        }

        let mut tags: Vec<String> = Vec::new();
        for tag in &self.tags {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() || tags.contains(&tag) {
                continue;
            }
            tags.push(tag);
        }

        if tags.is_empty() {
            return Err(ServerError::compute_manager(format!(
                "manager {} does not have any tags assigned",
                self.name
            )));
        }

        Ok((programs, tags))
    }
}

/// Resource counters replaced wholesale by each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerResources {
    #[serde(default)]
    pub total_cpu_hours: f64,
    #[serde(default)]
    pub active_tasks: i64,
    #[serde(default)]
    pub active_cores: i64,
    #[serde(default)]
    pub active_memory: f64,
}
