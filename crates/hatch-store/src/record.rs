//! Sandbox record model: the persisted shape of a sandbox, its labels,
//! lifecycle state, runtime-observed status and named conditions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label grouping records per template.
pub const LABEL_POOL: &str = "pool";
/// Label carrying the lifecycle state; absent while the runtime is creating.
pub const LABEL_STATE: &str = "state";
/// Label carrying the template generation that produced the record.
pub const LABEL_TEMPLATE_HASH: &str = "template-hash";
/// Label mirroring the record id, patched once the sandbox becomes pending.
pub const LABEL_SANDBOX_ID: &str = "sandbox-id";
/// Prefix reserved for labels and annotations the manager owns.
pub const INTERNAL_LABEL_PREFIX: &str = "hatch.io/";

/// Condition type signalled by the runtime once the sandbox can serve.
pub const CONDITION_READY: &str = "Ready";
/// Condition type signalled by the runtime once the sandbox is frozen.
pub const CONDITION_PAUSED: &str = "Paused";

/// Runtime-reported phase of the backing sandbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Paused,
    Failed,
    Succeeded,
    Terminating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Paused => "Paused",
            Phase::Failed => "Failed",
            Phase::Succeeded => "Succeeded",
            Phase::Terminating => "Terminating",
        }
    }

    /// True for phases that disqualify a record from ever serving again.
    pub fn terminal(&self) -> bool {
        matches!(self, Phase::Failed | Phase::Succeeded | Phase::Terminating)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state stored in the `state` label. A record without the label
/// is still being created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Pending,
    Running,
    Paused,
    Killing,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Pending => "pending",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Killing => "killing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SandboxState::Pending),
            "running" => Some(SandboxState::Running),
            "paused" => Some(SandboxState::Paused),
            "killing" => Some(SandboxState::Killing),
            _ => None,
        }
    }

    /// True for states a claimed sandbox moves through while owned.
    pub fn claimed(&self) -> bool {
        matches!(self, SandboxState::Running | SandboxState::Paused)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named status entry on the record. Timers piggyback on these to survive
/// process restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub ctype: String,
    pub status: bool,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(ctype: impl Into<String>, status: bool, message: impl Into<String>) -> Self {
        Self {
            ctype: ctype.into(),
            status,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// A CSI volume attachment recorded on the spec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub driver: String,
    pub path: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Desired state written by the manager.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub template: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Observed state written by the runtime controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SandboxStatus {
    pub fn condition(&self, ctype: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.ctype == ctype)
    }

    /// Replaces the condition with the same type, or appends it.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.ctype == condition.ctype) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    pub fn ready(&self) -> bool {
        self.condition(CONDITION_READY).map(|c| c.status).unwrap_or(false)
    }

    pub fn paused(&self) -> bool {
        self.condition(CONDITION_PAUSED).map(|c| c.status).unwrap_or(false)
    }
}

/// The persisted sandbox record, authoritative in the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Empty while pending; set once at claim.
    #[serde(default)]
    pub owner: String,
    /// Claim receipt; set once at claim, never cleared.
    #[serde(default)]
    pub lock_token: String,
    #[serde(default)]
    pub spec: SandboxSpec,
    #[serde(default)]
    pub status: SandboxStatus,
    /// Compare-and-set token managed by the store.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, spec: SandboxSpec) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            spec,
            ..Default::default()
        }
    }

    pub fn state(&self) -> Option<SandboxState> {
        self.labels.get(LABEL_STATE).and_then(|v| SandboxState::parse(v))
    }

    pub fn set_state(&mut self, state: SandboxState) {
        self.labels.insert(LABEL_STATE.to_string(), state.as_str().to_string());
    }

    pub fn pool(&self) -> Option<&str> {
        self.labels.get(LABEL_POOL).map(String::as_str)
    }

    pub fn template_hash(&self) -> Option<&str> {
        self.labels.get(LABEL_TEMPLATE_HASH).map(String::as_str)
    }

    pub fn ready(&self) -> bool {
        self.status.ready()
    }

    /// True while the record is owned by a user.
    pub fn claimed(&self) -> bool {
        self.state().map(|s| s.claimed()).unwrap_or(false)
    }
}

/// Exact-match label selector: a record matches when every key=value pair
/// is present in its label set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_label_roundtrip() {
        let mut record = SandboxRecord::new("default", "sb-1", SandboxSpec::default());
        assert_eq!(record.state(), None);

        record.set_state(SandboxState::Pending);
        assert_eq!(record.state(), Some(SandboxState::Pending));
        assert!(!record.claimed());

        record.set_state(SandboxState::Running);
        assert!(record.claimed());
        assert_eq!(record.labels.get(LABEL_STATE).unwrap(), "running");
    }

    #[test]
    fn selector_requires_every_pair() {
        let mut record = SandboxRecord::new("default", "sb-1", SandboxSpec::default());
        record.labels.insert(LABEL_POOL.into(), "python".into());
        record.set_state(SandboxState::Pending);

        let selector = LabelSelector::new()
            .with(LABEL_POOL, "python")
            .with(LABEL_STATE, "pending");
        assert!(selector.matches(&record.labels));

        let wrong = LabelSelector::new()
            .with(LABEL_POOL, "python")
            .with(LABEL_STATE, "running");
        assert!(!wrong.matches(&record.labels));
    }

    #[test]
    fn set_condition_replaces_by_type() {
        let mut status = SandboxStatus::default();
        status.set_condition(Condition::new(CONDITION_READY, false, ""));
        assert!(!status.ready());

        status.set_condition(Condition::new(CONDITION_READY, true, ""));
        assert!(status.ready());
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn record_serde_keeps_conditions() {
        let mut record = SandboxRecord::new("default", "sb-1", SandboxSpec::default());
        record.status.phase = Phase::Running;
        record
            .status
            .set_condition(Condition::new("SandboxTimer.SandboxKill", false, "pending"));

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: SandboxRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.status.condition("SandboxTimer.SandboxKill").is_some());
    }
}
