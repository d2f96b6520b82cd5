//! Remote invocation: request/response types, the invoker trait, the routing
//! registry and the concrete ChaosBlade invokers.

mod http;
mod kube;
mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::model::{ActivityTaskRecord, ActivityTaskSpec, DeviceMeta, DeviceType, Phase};
use crate::scene::SceneCode;

pub use http::HttpAgentInvoker;
pub use kube::KubeApiInvoker;
pub use registry::{InvokerPhases, InvokerStrategyRegistry};

/// Scene family served by the built-in invokers.
pub const CHAOSBLADE: &str = "chaosblade";

/// Argument key carrying the target names of a Kubernetes experiment.
pub const NAMES_ARGUMENT: &str = "names";

/// One remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCommand {
    /// Lowercase device type or experiment dimension, e.g. `host` or `pod`.
    pub scope: String,
    pub phase: Phase,
    pub scene_code: String,
    /// Remote resource the call refers to (status, recover).
    pub name: Option<String>,
    pub arguments: BTreeMap<String, String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<Duration>,
}

impl RequestCommand {
    pub fn new(scope: &str, phase: Phase, scene_code: &str) -> Self {
        Self {
            scope: scope.to_string(),
            phase,
            scene_code: scene_code.to_string(),
            name: None,
            arguments: BTreeMap::new(),
            host: None,
            port: None,
            timeout: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_agent(mut self, host: &str, port: u16) -> Self {
        self.host = Some(host.to_string());
        self.port = Some(port);
        self
    }
}

/// Outcome reported by the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCommand {
    pub success: bool,
    pub code: Option<i64>,
    /// Often the identifier of the created resource.
    pub result: Option<String>,
    pub error: Option<String>,
    /// Sub-phase reported by a status query, e.g. `Running` or `Destroyed`.
    pub resource_phase: Option<String>,
}

impl ResponseCommand {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A not-yet-terminal status report.
    pub fn status(resource_phase: impl Into<String>) -> Self {
        Self {
            success: false,
            resource_phase: Some(resource_phase.into()),
            ..Default::default()
        }
    }

    /// Non-blank error text, if any.
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }

    /// The business error carried by an unsuccessful response.
    pub fn business_error(&self) -> Option<EngineError> {
        (!self.success)
            .then(|| EngineError::from_response(self.error.as_deref(), self.result.as_deref()))
    }
}

/// A capability that performs one remote call.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: RequestCommand) -> Result<ResponseCommand, EngineError>;
}

/// Builds the requests an activity task dispatches.
pub trait RequestFactory: Send + Sync {
    /// Request for one device of a HOST/APPLICATION phase. `None` means the
    /// device needs no remote call for this phase.
    fn device_request(&self, spec: &ActivityTaskSpec, device: &DeviceMeta)
    -> Option<RequestCommand>;

    /// The single request of a NODE/POD/CONTAINER phase.
    fn resource_request(&self, spec: &ActivityTaskSpec) -> RequestCommand;

    /// Recovery of one earlier attempt. The earlier result names the target
    /// only when that attempt succeeded.
    fn recover_request(&self, spec: &ActivityTaskSpec, prior: &ActivityTaskRecord)
    -> RequestCommand;
}

/// Targets the ChaosBlade agent listening on each device.
#[derive(Debug, Clone)]
pub struct AgentRequestFactory {
    port: u16,
}

/// Scene targets whose agents need a prepare step (Java and C++ agents).
const PREPARED_TARGETS: &[&str] = &["jvm", "cplus"];

impl AgentRequestFactory {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl RequestFactory for AgentRequestFactory {
    fn device_request(
        &self,
        spec: &ActivityTaskSpec,
        device: &DeviceMeta,
    ) -> Option<RequestCommand> {
        if spec.phase == Phase::Prepare {
            let needs_prepare = SceneCode::parse(&spec.scene_code)
                .map(|scene| PREPARED_TARGETS.contains(&scene.target()))
                .unwrap_or(true);
            if !needs_prepare {
                return None;
            }
        }
        Some(
            RequestCommand::new(device.device_type.as_str(), spec.phase, &spec.scene_code)
                .with_arguments(spec.arguments.clone())
                .with_agent(&device.ip, self.port),
        )
    }

    fn resource_request(&self, spec: &ActivityTaskSpec) -> RequestCommand {
        RequestCommand::new(
            spec.experiment_dimension.as_scope(),
            spec.phase,
            &spec.scene_code,
        )
        .with_arguments(spec.arguments.clone())
    }

    fn recover_request(
        &self,
        spec: &ActivityTaskSpec,
        prior: &ActivityTaskRecord,
    ) -> RequestCommand {
        let mut request = RequestCommand::new(
            spec.experiment_dimension.as_scope(),
            spec.phase,
            &spec.scene_code,
        )
        .with_arguments(spec.arguments.clone());
        if let Some(ip) = prior.ip.as_deref().filter(|ip| !ip.is_empty()) {
            request = request.with_agent(ip, self.port);
        }
        if prior.is_successful() {
            request.name = prior.result.clone();
        }
        request
    }
}

/// The built-in routing table: agent HTTP for hosts (prepare first, with its
/// longer timeout), the Kubernetes API for cluster dimensions.
pub fn default_registry(config: &EngineConfig) -> InvokerStrategyRegistry {
    let registry = InvokerStrategyRegistry::new();
    registry.register(
        CHAOSBLADE,
        &[DeviceType::Host],
        InvokerPhases::only(&[Phase::Prepare]),
        Arc::new(HttpAgentInvoker::new(config.prepare_timeout())),
    );
    registry.register(
        CHAOSBLADE,
        &[DeviceType::Host],
        InvokerPhases::All,
        Arc::new(HttpAgentInvoker::new(config.request_timeout())),
    );
    registry.register(
        CHAOSBLADE,
        &[DeviceType::Node, DeviceType::Pod, DeviceType::Container],
        InvokerPhases::All,
        Arc::new(KubeApiInvoker::new(&config.kubernetes, config.request_timeout())),
    );
    registry
}
