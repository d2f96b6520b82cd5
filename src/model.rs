use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Run state of an experiment task or one of its activity tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Ready,
    Running,
    Stopping,
    Finished,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Finished => "FINISHED",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "FINISHED" => Ok(Self::Finished),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Experiment-level outcome: success iff at least one attack landed.
    pub fn from_attack_successes(count: usize) -> Self {
        if count > 0 { Self::Success } else { Self::Failed }
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid result status: {}", s)),
        }
    }
}

/// One stage of an experiment's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Attack,
    Recover,
    Status,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Attack => "attack",
            Self::Recover => "recover",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Self::Prepare),
            "attack" => Ok(Self::Attack),
            "recover" => Ok(Self::Recover),
            "status" => Ok(Self::Status),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Kind of device an invoker can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Host,
    Node,
    Pod,
    Container,
}

impl DeviceType {
    /// Lowercase name, used as the request scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Node => "node",
            Self::Pod => "pod",
            Self::Container => "container",
        }
    }
}

/// The kind of target an experiment acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentDimension {
    Host,
    Application,
    Node,
    Pod,
    Container,
}

impl ExperimentDimension {
    /// Fixed dimension → device type table.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Host | Self::Application => DeviceType::Host,
            Self::Node => DeviceType::Node,
            Self::Pod => DeviceType::Pod,
            Self::Container => DeviceType::Container,
        }
    }

    /// Lowercase name, used as the request scope.
    pub fn as_scope(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Application => "application",
            Self::Node => "node",
            Self::Pod => "pod",
            Self::Container => "container",
        }
    }

    /// HOST and APPLICATION fan out to per-device agents; the Kubernetes
    /// dimensions dispatch one resource and reconcile it.
    pub fn is_per_device(&self) -> bool {
        matches!(self, Self::Host | Self::Application)
    }

    /// Parse a request scope (case-insensitive), e.g. `"pod"` or `"HOST"`.
    pub fn from_scope(scope: &str) -> Result<Self, EngineError> {
        match scope.to_ascii_uppercase().as_str() {
            "HOST" => Ok(Self::Host),
            "APPLICATION" => Ok(Self::Application),
            "NODE" => Ok(Self::Node),
            "POD" => Ok(Self::Pod),
            "CONTAINER" => Ok(Self::Container),
            _ => Err(EngineError::UnknownScope(scope.to_string())),
        }
    }
}

/// A device targeted by a HOST or APPLICATION experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub device_id: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    pub device_type: DeviceType,
}

impl DeviceMeta {
    pub fn label(&self) -> String {
        format!("{}-{}", self.hostname, self.ip)
    }
}

/// Immutable input to one activity task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTaskSpec {
    pub experiment_task_id: i64,
    pub activity_task_id: i64,
    pub activity_id: i64,
    pub flow_id: i64,
    pub phase: Phase,
    pub scene_code: String,
    pub experiment_dimension: ExperimentDimension,
    #[serde(default)]
    pub device_metas: Vec<DeviceMeta>,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    /// Delay before the phase signals downstream, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_of_after_ms: Option<u64>,
}

impl ActivityTaskSpec {
    pub fn wait_of_after(&self) -> Option<Duration> {
        self.wait_of_after_ms.map(Duration::from_millis)
    }
}

/// Persisted experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentTask {
    pub id: i64,
    pub name: String,
    pub run_status: RunStatus,
    pub result_status: Option<ResultStatus>,
    pub activity_id: Option<i64>,
    pub activity_task_id: Option<i64>,
    pub gmt_start: Option<DateTime<Utc>>,
    pub gmt_end: Option<DateTime<Utc>>,
}

impl ExperimentTask {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            run_status: RunStatus::Ready,
            result_status: None,
            activity_id: None,
            activity_task_id: None,
            gmt_start: None,
            gmt_end: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentTaskUpdate {
    pub run_status: Option<RunStatus>,
    pub result_status: Option<ResultStatus>,
    pub activity_id: Option<i64>,
    pub activity_task_id: Option<i64>,
    pub gmt_start: Option<DateTime<Utc>>,
    pub gmt_end: Option<DateTime<Utc>>,
}

/// Persisted state of one phase of one experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentActivityTask {
    pub id: i64,
    pub experiment_task_id: i64,
    pub activity_id: i64,
    pub flow_id: i64,
    pub phase: Phase,
    pub scene_code: String,
    pub run_status: RunStatus,
    pub result_status: Option<ResultStatus>,
    pub error_message: Option<String>,
    pub gmt_start: Option<DateTime<Utc>>,
    pub gmt_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityTaskUpdate {
    pub phase: Option<Phase>,
    pub run_status: Option<RunStatus>,
    pub result_status: Option<ResultStatus>,
    pub error_message: Option<String>,
    pub gmt_start: Option<DateTime<Utc>>,
    pub gmt_end: Option<DateTime<Utc>>,
}

/// Log of one device-level invocation attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityTaskRecord {
    pub id: i64,
    pub experiment_task_id: i64,
    pub activity_task_id: i64,
    pub flow_id: i64,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub scene_code: String,
    pub phase: Option<Phase>,
    pub gmt_start: Option<DateTime<Utc>>,
    pub gmt_end: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub code: Option<i64>,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl ActivityTaskRecord {
    /// A fresh record for a dispatch starting now.
    pub fn started(spec: &ActivityTaskSpec) -> Self {
        Self {
            experiment_task_id: spec.experiment_task_id,
            activity_task_id: spec.activity_task_id,
            flow_id: spec.flow_id,
            scene_code: spec.scene_code.clone(),
            phase: Some(spec.phase),
            gmt_start: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn for_device(mut self, device: &DeviceMeta) -> Self {
        self.device_id = Some(device.device_id.clone());
        self.ip = Some(device.ip.clone());
        self.hostname = Some(device.hostname.clone());
        self
    }

    pub fn is_successful(&self) -> bool {
        self.success.unwrap_or(false)
    }

    pub fn device_label(&self) -> String {
        format!(
            "{}-{}",
            self.hostname.as_deref().unwrap_or_default(),
            self.ip.as_deref().unwrap_or_default()
        )
    }
}

/// Terminal outcome written to a record, exactly once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub gmt_end: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub code: Option<i64>,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl RecordUpdate {
    /// Finished successfully without a remote call.
    pub fn no_op() -> Self {
        Self {
            gmt_end: Some(Utc::now()),
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            gmt_end: Some(Utc::now()),
            success: Some(false),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_device_type_table() {
        assert_eq!(ExperimentDimension::Host.device_type(), DeviceType::Host);
        assert_eq!(ExperimentDimension::Application.device_type(), DeviceType::Host);
        assert_eq!(ExperimentDimension::Node.device_type(), DeviceType::Node);
        assert_eq!(ExperimentDimension::Pod.device_type(), DeviceType::Pod);
        assert_eq!(ExperimentDimension::Container.device_type(), DeviceType::Container);
    }

    #[test]
    fn test_dimension_from_scope_is_case_insensitive() {
        assert_eq!(
            ExperimentDimension::from_scope("application").unwrap(),
            ExperimentDimension::Application
        );
        assert_eq!(ExperimentDimension::from_scope("POD").unwrap(), ExperimentDimension::Pod);
        assert!(matches!(
            ExperimentDimension::from_scope("cluster"),
            Err(EngineError::UnknownScope(_))
        ));
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Ready,
            RunStatus::Running,
            RunStatus::Stopping,
            RunStatus::Finished,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_result_status_from_attack_successes() {
        assert_eq!(ResultStatus::from_attack_successes(0), ResultStatus::Failed);
        assert_eq!(ResultStatus::from_attack_successes(3), ResultStatus::Success);
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let json = r#"{
            "experiment_task_id": 1,
            "activity_task_id": 2,
            "activity_id": 3,
            "flow_id": 4,
            "phase": "attack",
            "scene_code": "chaosblade.cpu.fullload",
            "experiment_dimension": "HOST"
        }"#;
        let spec: ActivityTaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.phase, Phase::Attack);
        assert!(spec.device_metas.is_empty());
        assert!(spec.wait_of_after().is_none());
    }

    #[test]
    fn test_record_for_device() {
        let spec: ActivityTaskSpec = serde_json::from_value(serde_json::json!({
            "experiment_task_id": 9,
            "activity_task_id": 8,
            "activity_id": 7,
            "flow_id": 6,
            "phase": "prepare",
            "scene_code": "chaosblade.jvm.delay",
            "experiment_dimension": "APPLICATION",
        }))
        .unwrap();
        let device = DeviceMeta {
            device_id: "d-1".into(),
            ip: "10.0.0.1".into(),
            hostname: "web-1".into(),
            device_type: DeviceType::Host,
        };
        let record = ActivityTaskRecord::started(&spec).for_device(&device);
        assert_eq!(record.experiment_task_id, 9);
        assert_eq!(record.phase, Some(Phase::Prepare));
        assert_eq!(record.device_label(), "web-1-10.0.0.1");
        assert!(record.gmt_start.is_some());
        assert!(!record.is_successful());
    }
}
