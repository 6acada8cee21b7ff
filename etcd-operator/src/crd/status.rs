//! Observed state of an EtcdCluster.
//!
//! Only this half of the resource is ever written back by the operator.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// EtcdCluster status.
///
/// Every field is always serialized so a merge patch of the whole status
/// also clears conditions and member lists that went away.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Running phase of the cluster.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Reason of the last failure, if any.
    #[serde(default)]
    pub reason: String,

    /// Whether the operator paused control of the cluster.
    #[serde(default)]
    pub control_paused: bool,

    /// Current conditions, at most one per type.
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Current membership size.
    #[serde(default)]
    pub size: usize,

    /// Service clients use to reach the cluster.
    #[serde(default)]
    pub service_name: String,

    /// Client port, shared by the service and the members.
    #[serde(default)]
    pub client_port: i32,

    /// Ready and unready member pods.
    #[serde(default)]
    pub members: MembersStatus,

    /// Version every member runs.
    #[serde(default)]
    pub current_version: String,

    /// Version an upgrade is moving to. Empty when not upgrading.
    #[serde(default)]
    pub target_version: String,
}

/// Cluster phase. Moves forward only; re-entering Running is a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    /// Not set up yet.
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Seed member is being created.
    Creating,
    /// Cluster is being reconciled.
    Running,
    /// Setup or reconciliation failed permanently.
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterPhase::Unset => write!(f, "Unset"),
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// All members run the desired version and the shape matches.
    Available,
    /// Majority lost, recovery needed.
    Recovering,
    /// Membership size is changing.
    Scaling,
    /// Members are moving to a new version.
    Upgrading,
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// Condition holds.
    True,
    /// Condition does not hold.
    False,
    /// Unknown.
    Unknown,
}

/// One observation attached to the status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Condition type.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Condition status.
    pub status: ConditionStatus,

    /// Last time the condition was written.
    #[serde(default)]
    pub last_update_time: String,

    /// Last time the status changed.
    #[serde(default)]
    pub last_transition_time: String,

    /// Machine-readable reason.
    #[serde(default)]
    pub reason: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Member pod readiness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MembersStatus {
    /// Members ready to serve requests. Names match pod names.
    #[serde(default)]
    pub ready: Vec<String>,

    /// Members running but not ready.
    #[serde(default)]
    pub unready: Vec<String>,
}

impl ClusterCondition {
    fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            condition_type,
            status,
            last_update_time: now.clone(),
            last_transition_time: now,
            reason: reason.to_string(),
            message,
        }
    }
}

fn scaling_message(from: usize, to: usize) -> String {
    format!("Current cluster size: {}, desired cluster size: {}", from, to)
}

impl EtcdClusterStatus {
    /// Set the phase.
    pub fn set_phase(&mut self, phase: ClusterPhase) {
        self.phase = phase;
    }

    /// Set the failure reason.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    /// Mark control as paused.
    pub fn pause_control(&mut self) {
        self.control_paused = true;
    }

    /// Mark control as active.
    pub fn resume_control(&mut self) {
        self.control_paused = false;
    }

    /// Record the version an upgrade is moving to.
    pub fn upgrade_version_to(&mut self, version: &str) {
        self.target_version = version.to_string();
    }

    /// Record the version all members run; ends any upgrade.
    pub fn set_version(&mut self, version: &str) {
        self.target_version.clear();
        self.current_version = version.to_string();
    }

    /// Look up the condition of a type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&ClusterCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Upsert a condition by type.
    ///
    /// Identical status, reason and message leave the stored entry untouched,
    /// timestamps included.
    pub fn set_condition(&mut self, mut condition: ClusterCondition) {
        let existing = self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition.condition_type);

        match existing {
            Some(pos) => {
                let current = &self.conditions[pos];
                if current.status == condition.status
                    && current.reason == condition.reason
                    && current.message == condition.message
                {
                    return;
                }
                if current.status == condition.status {
                    condition.last_transition_time = current.last_transition_time.clone();
                }
                self.conditions[pos] = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Remove the condition of a type, if present.
    pub fn clear_condition(&mut self, condition_type: ConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }

    /// Set Scaling for growing from `from` to `to` members.
    pub fn set_scaling_up_condition(&mut self, from: usize, to: usize) {
        self.set_condition(ClusterCondition::new(
            ConditionType::Scaling,
            ConditionStatus::True,
            "Scaling up",
            scaling_message(from, to),
        ));
    }

    /// Set Scaling for shrinking from `from` to `to` members.
    pub fn set_scaling_down_condition(&mut self, from: usize, to: usize) {
        self.set_condition(ClusterCondition::new(
            ConditionType::Scaling,
            ConditionStatus::True,
            "Scaling down",
            scaling_message(from, to),
        ));
    }

    /// Set Recovering and drop Available.
    pub fn set_recovering_condition(&mut self) {
        self.set_condition(ClusterCondition::new(
            ConditionType::Recovering,
            ConditionStatus::True,
            "Disaster recovery",
            "Majority is down. Recovering from backup".to_string(),
        ));
        self.clear_condition(ConditionType::Available);
    }

    /// Set Upgrading toward `version`.
    pub fn set_upgrading_condition(&mut self, version: &str) {
        self.set_condition(ClusterCondition::new(
            ConditionType::Upgrading,
            ConditionStatus::True,
            "Cluster upgrading",
            format!("upgrading to {}", version),
        ));
    }

    /// Set Available.
    pub fn set_ready_condition(&mut self) {
        self.set_condition(ClusterCondition::new(
            ConditionType::Available,
            ConditionStatus::True,
            "Cluster available",
            String::new(),
        ));
    }
}
