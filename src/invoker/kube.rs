use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{NAMES_ARGUMENT, RemoteInvoker, RequestCommand, ResponseCommand};
use crate::config::KubernetesConfig;
use crate::errors::EngineError;
use crate::model::Phase;
use crate::scene::SceneCode;

const CHAOSBLADE_API: &str = "/apis/chaosblade.io/v1alpha1/chaosblades";

/// Phase reported for a resource that no longer exists.
pub const DESTROYED: &str = "Destroyed";

/// Drives ChaosBlade custom resources through the Kubernetes API server.
///
/// Attack and prepare create a resource and answer with its name; status
/// reads the resource's phase; recover deletes it.
pub struct KubeApiInvoker {
    client: reqwest::Client,
    api_server: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct ChaosBladeResource {
    #[serde(default)]
    status: Option<ChaosBladeStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChaosBladeStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    exp_statuses: Vec<ExperimentStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentStatus {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    res_statuses: Vec<ResourceStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceStatus {
    #[serde(default)]
    error: Option<String>,
}

impl ChaosBladeStatus {
    /// First non-empty error, experiment level before resource level.
    fn first_error(&self) -> Option<String> {
        let non_empty = |e: &Option<String>| e.as_deref().filter(|s| !s.trim().is_empty()).map(str::to_string);
        self.exp_statuses
            .iter()
            .find_map(|exp| non_empty(&exp.error))
            .or_else(|| {
                self.exp_statuses
                    .iter()
                    .flat_map(|exp| exp.res_statuses.iter())
                    .find_map(|res| non_empty(&res.error))
            })
    }
}

impl KubeApiInvoker {
    pub fn new(config: &KubernetesConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_server: config.api_server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.api_server, CHAOSBLADE_API)
    }

    fn resource_url(&self, name: &str) -> String {
        format!("{}/{}", self.collection_url(), name)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn create(&self, request: &RequestCommand) -> Result<ResponseCommand, EngineError> {
        let name = uuid::Uuid::new_v4().simple().to_string();
        let manifest = build_manifest(&name, request)?;
        let response = self
            .authorize(self.client.post(self.collection_url()))
            .json(&manifest)
            .send()
            .await
            .map_err(|e| EngineError::Invocation(format!("Failed to create ChaosBlade {}: {}", name, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(ResponseCommand {
                code: Some(i64::from(status.as_u16())),
                ..ResponseCommand::ok(name)
            });
        }
        let body = response.text().await.unwrap_or_default();
        Ok(ResponseCommand {
            code: Some(i64::from(status.as_u16())),
            ..ResponseCommand::failed(format!("Kubernetes API returned {}: {}", status, body))
        })
    }

    async fn status(&self, name: &str) -> Result<ResponseCommand, EngineError> {
        let response = self
            .authorize(self.client.get(self.resource_url(name)))
            .send()
            .await
            .map_err(|e| EngineError::Invocation(format!("Failed to query ChaosBlade {}: {}", name, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ResponseCommand::status(DESTROYED));
        }
        if !status.is_success() {
            return Err(EngineError::Invocation(format!(
                "Kubernetes API returned {} for ChaosBlade {}",
                status, name
            )));
        }
        let resource: ChaosBladeResource = response
            .json()
            .await
            .map_err(|e| EngineError::Invocation(format!("Undecodable ChaosBlade {}: {}", name, e)))?;
        Ok(status_response(name, resource))
    }

    async fn delete(&self, name: &str) -> Result<ResponseCommand, EngineError> {
        let response = self
            .authorize(self.client.delete(self.resource_url(name)))
            .send()
            .await
            .map_err(|e| EngineError::Invocation(format!("Failed to delete ChaosBlade {}: {}", name, e)))?;

        let status = response.status();
        let code = Some(i64::from(status.as_u16()));
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ResponseCommand {
                code,
                ..ResponseCommand::ok(name)
            });
        }
        let body = response.text().await.unwrap_or_default();
        Ok(ResponseCommand {
            code,
            ..ResponseCommand::failed(format!("Kubernetes API returned {}: {}", status, body))
        })
    }
}

fn required_name(request: &RequestCommand) -> Result<&str, EngineError> {
    request
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Invocation(format!(
                "{} request for {} without a resource name",
                request.phase, request.scene_code
            ))
        })
}

/// Matchers from the request arguments. `names` is a comma separated list,
/// every other argument is a single value; blank and `false` values are
/// left out.
fn matchers(arguments: &BTreeMap<String, String>) -> Vec<Value> {
    arguments
        .iter()
        .filter(|(_, value)| !value.trim().is_empty() && !value.eq_ignore_ascii_case("false"))
        .map(|(key, value)| {
            let values: Vec<&str> = if key == NAMES_ARGUMENT {
                value.split(',').map(str::trim).filter(|v| !v.is_empty()).collect()
            } else {
                vec![value.trim()]
            };
            json!({ "name": key.trim(), "value": values })
        })
        .collect()
}

fn build_manifest(name: &str, request: &RequestCommand) -> Result<Value, EngineError> {
    let scene = SceneCode::parse(&request.scene_code)?;
    Ok(json!({
        "apiVersion": "chaosblade.io/v1alpha1",
        "kind": "ChaosBlade",
        "metadata": { "name": name },
        "spec": {
            "experiments": [{
                "scope": request.scope,
                "target": scene.target(),
                "action": scene.action(),
                "desc": format!("{} {}", request.phase, request.scene_code),
                "matchers": matchers(&request.arguments),
            }]
        }
    }))
}

/// Status reads are never terminal on their own: the caller compares the
/// reported phase with what it waits for.
fn status_response(name: &str, resource: ChaosBladeResource) -> ResponseCommand {
    let status = resource.status.unwrap_or_default();
    ResponseCommand {
        success: false,
        code: None,
        result: Some(name.to_string()),
        error: status.first_error(),
        resource_phase: status.phase.clone(),
    }
}

#[async_trait]
impl RemoteInvoker for KubeApiInvoker {
    fn name(&self) -> &str {
        "kube-api"
    }

    async fn invoke(&self, request: RequestCommand) -> Result<ResponseCommand, EngineError> {
        match request.phase {
            Phase::Prepare | Phase::Attack => self.create(&request).await,
            Phase::Status => self.status(required_name(&request)?).await,
            Phase::Recover => self.delete(required_name(&request)?).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_shape() {
        let request = RequestCommand::new("pod", Phase::Attack, "chaosblade.network.delay")
            .with_arguments(
                [
                    ("names", "web-0, web-1"),
                    ("namespace", "default"),
                    ("time", "3000"),
                    ("force", "false"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            );
        let manifest = build_manifest("abc", &request).unwrap();
        assert_eq!(manifest["kind"], "ChaosBlade");
        assert_eq!(manifest["metadata"]["name"], "abc");
        let experiment = &manifest["spec"]["experiments"][0];
        assert_eq!(experiment["scope"], "pod");
        assert_eq!(experiment["target"], "network");
        assert_eq!(experiment["action"], "delay");

        let matchers = experiment["matchers"].as_array().unwrap();
        assert_eq!(matchers.len(), 3);
        let names = matchers.iter().find(|m| m["name"] == "names").unwrap();
        assert_eq!(names["value"], json!(["web-0", "web-1"]));
    }

    #[test]
    fn test_status_response_reports_phase_and_error() {
        let resource: ChaosBladeResource = serde_json::from_value(json!({
            "status": {
                "phase": "Error",
                "expStatuses": [
                    { "error": "", "resStatuses": [{ "error": "container not found" }] }
                ]
            }
        }))
        .unwrap();
        let response = status_response("abc", resource);
        assert!(!response.success);
        assert_eq!(response.resource_phase.as_deref(), Some("Error"));
        assert_eq!(response.error.as_deref(), Some("container not found"));
    }

    #[test]
    fn test_status_response_without_status_block() {
        let response = status_response("abc", ChaosBladeResource::default());
        assert!(response.resource_phase.is_none());
        assert!(response.error_text().is_none());
        assert_eq!(response.result.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_status_and_recover_need_a_name() {
        let invoker = KubeApiInvoker::new(&KubernetesConfig::default(), Duration::from_secs(1));
        for phase in [Phase::Status, Phase::Recover] {
            let err = invoker
                .invoke(RequestCommand::new("pod", phase, "chaosblade.pod.delete"))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Invocation(_)));
        }
    }
}
