use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{RemoteInvoker, RequestCommand, ResponseCommand};
use crate::errors::EngineError;
use crate::model::Phase;
use crate::scene::SceneCode;

/// Calls the ChaosBlade agent on a device: `GET http://<host>:<port>/chaosblade?cmd=...`.
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    timeout: Duration,
}

/// Body returned by the agent.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl AgentResponse {
    fn into_command(self) -> ResponseCommand {
        // `status` answers with an object whose `Status` field is the experiment state.
        let resource_phase = self
            .result
            .as_ref()
            .and_then(|r| r.get("Status"))
            .and_then(|s| s.as_str())
            .map(str::to_string);
        let result = self.result.map(|r| match r {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        ResponseCommand {
            success: self.success,
            code: self.code,
            result,
            error: self.error,
            resource_phase,
        }
    }
}

impl HttpAgentInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Render the agent command line for a request.
    pub fn build_command(request: &RequestCommand) -> Result<String, EngineError> {
        let scene = SceneCode::parse(&request.scene_code)?;
        let mut parts: Vec<String> = match request.phase {
            Phase::Prepare => vec!["prepare".into(), scene.prepare_type().into()],
            Phase::Attack => vec!["create".into(), scene.target().into(), scene.action().into()],
            Phase::Recover => match request.name.as_deref().filter(|n| !n.trim().is_empty()) {
                Some(uid) => return Ok(format!("destroy {}", uid.trim())),
                None => vec!["destroy".into(), scene.target().into(), scene.action().into()],
            },
            Phase::Status => {
                let uid = request
                    .name
                    .as_deref()
                    .filter(|n| !n.trim().is_empty())
                    .ok_or_else(|| {
                        EngineError::Invocation("status request without an experiment uid".into())
                    })?;
                return Ok(format!("status {}", uid.trim()));
            }
        };
        parts.extend(flags(&request.arguments));
        Ok(parts.join(" "))
    }
}

/// `--key 'value'` pairs; blank and `false` values are left out.
fn flags(arguments: &BTreeMap<String, String>) -> Vec<String> {
    arguments
        .iter()
        .filter(|(_, value)| !value.trim().is_empty() && !value.eq_ignore_ascii_case("false"))
        .map(|(key, value)| format!("--{} '{}'", key.trim(), value.trim()))
        .collect()
}

#[async_trait]
impl RemoteInvoker for HttpAgentInvoker {
    fn name(&self) -> &str {
        "http-agent"
    }

    async fn invoke(&self, request: RequestCommand) -> Result<ResponseCommand, EngineError> {
        let command = Self::build_command(&request)?;
        let host = request
            .host
            .as_deref()
            .ok_or_else(|| EngineError::Invocation("agent request without a host".into()))?;
        let port = request
            .port
            .ok_or_else(|| EngineError::Invocation("agent request without a port".into()))?;
        let url = format!("http://{}:{}/chaosblade", host, port);

        let response = self
            .client
            .get(&url)
            .query(&[("cmd", command.as_str())])
            .timeout(request.timeout.unwrap_or(self.timeout))
            .send()
            .await
            .map_err(|e| EngineError::Invocation(format!("{} ({}): {}", url, command, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Invocation(format!("Failed to read agent response: {}", e)))?;
        match serde_json::from_str::<AgentResponse>(&body) {
            Ok(parsed) => Ok(parsed.into_command()),
            Err(_) if !status.is_success() => Ok(ResponseCommand {
                code: Some(i64::from(status.as_u16())),
                ..ResponseCommand::failed(body)
            }),
            Err(e) => Err(EngineError::Invocation(format!(
                "Undecodable agent response from {}: {}",
                host, e
            ))),
        }
    }
}
