use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{RemoteInvoker, RequestCommand, ResponseCommand};
use crate::errors::EngineError;
use crate::model::{DeviceType, ExperimentDimension, Phase};
use crate::scene::SceneCode;

/// Phases an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokerPhases {
    All,
    Only(Vec<Phase>),
}

impl InvokerPhases {
    pub fn only(phases: &[Phase]) -> Self {
        Self::Only(phases.to_vec())
    }

    fn contains(&self, phase: Phase) -> bool {
        match self {
            Self::All => true,
            Self::Only(phases) => phases.contains(&phase),
        }
    }
}

struct Entry {
    target: String,
    device_types: Vec<DeviceType>,
    phases: InvokerPhases,
    invoker: Arc<dyn RemoteInvoker>,
}

impl Entry {
    fn same_key(&self, target: &str, device_types: &[DeviceType], phases: &InvokerPhases) -> bool {
        self.target == target && self.device_types == device_types && &self.phases == phases
    }

    fn matches(&self, original: &str, device_type: DeviceType, phase: Phase) -> bool {
        self.target == original
            && self.device_types.contains(&device_type)
            && self.phases.contains(phase)
    }
}

/// Ordered routing table from (scene family, device type, phase) to an
/// invoker. Lookups walk entries in registration order and the first match
/// wins.
#[derive(Default)]
pub struct InvokerStrategyRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl InvokerStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker. Registering the same (target, device types,
    /// phases) key again replaces the invoker in place and keeps its
    /// position.
    pub fn register(
        &self,
        target: &str,
        device_types: &[DeviceType],
        phases: InvokerPhases,
        invoker: Arc<dyn RemoteInvoker>,
    ) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.same_key(target, device_types, &phases))
        {
            entry.invoker = invoker;
            return;
        }
        entries.push(Entry {
            target: target.to_string(),
            device_types: device_types.to_vec(),
            phases,
            invoker,
        });
    }

    /// Find the invoker for a scene family, request scope and phase.
    pub fn resolve(
        &self,
        original: &str,
        scope: &str,
        phase: Phase,
    ) -> Result<Arc<dyn RemoteInvoker>, EngineError> {
        let device_type = ExperimentDimension::from_scope(scope)?.device_type();
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .iter()
            .find(|e| e.matches(original, device_type, phase))
            .map(|e| e.invoker.clone())
            .ok_or_else(|| EngineError::InvokerNotFound {
                original: original.to_string(),
                scope: scope.to_string(),
                phase: phase.to_string(),
            })
    }

    /// Route a request by its scene code, scope and phase, then invoke it.
    pub async fn invoke(&self, request: RequestCommand) -> Result<ResponseCommand, EngineError> {
        let scene = SceneCode::parse(&request.scene_code)?;
        let invoker = self.resolve(scene.original(), &request.scope, request.phase)?;
        debug!(
            invoker = invoker.name(),
            scene_code = %request.scene_code,
            scope = %request.scope,
            phase = %request.phase,
            "Invoking"
        );
        invoker.invoke(request).await
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
