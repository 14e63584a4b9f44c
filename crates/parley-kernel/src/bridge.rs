//! McpBridge: exposes the local tool runtime to remote sessions.
//!
//! Every call is checked against the calling session: a tool is visible and
//! callable only if one of the session's granted capabilities maps to the
//! tool's server. Arguments are validated against the tool's JSON schema
//! before dispatch, and every runtime failure is reduced to a [`ToolError`].

use crate::negotiation::NegotiationEngine;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use parley_types::config::ToolsConfig;
use parley_types::error::ParleyResult;
use parley_types::session::{Session, SessionId};
use parley_types::tool::{split_qualified, ToolDescriptor, ToolError, ToolResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The external runtime that owns the tools.
#[async_trait]
pub trait ToolRuntime: Send + Sync + 'static {
    /// Every tool the runtime currently knows about.
    async fn list_registered(&self) -> Vec<ToolDescriptor>;

    /// Run `tool` with already-validated arguments.
    async fn execute(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

pub struct McpBridge {
    runtime: Arc<dyn ToolRuntime>,
    engine: Arc<NegotiationEngine>,
    call_timeout: Duration,
    capability_servers: HashMap<String, Vec<String>>,
}

impl McpBridge {
    pub fn new(
        runtime: Arc<dyn ToolRuntime>,
        engine: Arc<NegotiationEngine>,
        config: &ToolsConfig,
    ) -> Self {
        Self {
            runtime,
            engine,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            capability_servers: config.capability_servers.clone(),
        }
    }

    /// Tool servers reachable through the capabilities granted to `session`.
    pub fn allowed_servers(&self, session: &Session) -> BTreeSet<String> {
        session
            .granted
            .iter()
            .flat_map(|cap| match self.capability_servers.get(cap) {
                Some(servers) => servers.clone(),
                None => vec![cap.clone()],
            })
            .collect()
    }

    /// Tools visible to the session.
    pub async fn list_tools(&self, session_id: SessionId) -> ParleyResult<Vec<ToolDescriptor>> {
        let session = self.engine.touch(session_id)?;
        let allowed = self.allowed_servers(&session);
        let tools: Vec<ToolDescriptor> = self
            .runtime
            .list_registered()
            .await
            .into_iter()
            .filter(|t| allowed.contains(&t.server))
            .collect();
        debug!(session = %session_id, visible = tools.len(), "Tools listed");
        Ok(tools)
    }

    /// Execute a tool on behalf of a session.
    ///
    /// Session problems surface as the session error; everything after the
    /// session check is a [`ToolError`].
    pub async fn execute_tool(
        &self,
        session_id: SessionId,
        tool_name: &str,
        args: serde_json::Value,
    ) -> ParleyResult<ToolResult> {
        let session = self.engine.touch(session_id)?;
        let allowed = self.allowed_servers(&session);
        let (server, bare_name) = split_qualified(tool_name);

        if let Some(server) = server {
            if !allowed.contains(server) {
                warn!(
                    session = %session_id,
                    tool = %tool_name,
                    server = %server,
                    "Tool call outside granted capabilities"
                );
                return Err(ToolError::unauthorized(
                    tool_name,
                    format!("no granted capability covers server '{server}'"),
                )
                .into());
            }
        }

        // Only granted servers are searched, so tools elsewhere stay invisible.
        let mut candidates: Vec<ToolDescriptor> = self
            .runtime
            .list_registered()
            .await
            .into_iter()
            .filter(|t| t.name == bare_name && allowed.contains(&t.server))
            .filter(|t| server.map_or(true, |s| s == t.server))
            .collect();
        let tool = match candidates.len() {
            0 => return Err(ToolError::validation(tool_name, "unknown tool").into()),
            1 => candidates.remove(0),
            _ => {
                let names: Vec<String> = candidates.iter().map(|t| t.qualified_name()).collect();
                return Err(ToolError::validation(
                    tool_name,
                    format!("ambiguous tool name, use one of: {}", names.join(", ")),
                )
                .into());
            }
        };
        if !tool.enabled {
            return Err(ToolError::validation(tool_name, "tool is disabled").into());
        }

        validate_args(&tool, &args)?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, self.runtime.execute(&tool, args)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                warn!(tool = %tool_name, timeout_ms = self.call_timeout.as_millis() as u64, "Tool call timed out");
                Err(ToolError::timeout(tool_name, self.call_timeout.as_millis() as u64).into())
            }
            Ok(Err(message)) => {
                debug!(tool = %tool_name, error = %message, "Tool execution failed");
                Err(ToolError::execution(tool_name, message).into())
            }
            Ok(Ok(output)) => {
                info!(session = %session_id, tool = %tool_name, duration_ms, "Tool executed");
                Ok(ToolResult {
                    tool: tool.name,
                    output,
                    duration_ms,
                })
            }
        }
    }
}

/// Check `args` against the tool's declared input schema.
fn validate_args(tool: &ToolDescriptor, args: &serde_json::Value) -> Result<(), ToolError> {
    let compiled = JSONSchema::compile(&tool.input_schema)
        .map_err(|e| ToolError::validation(&tool.name, format!("tool schema is invalid: {e}")))?;
    if let Err(errors) = compiled.validate(args) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(ToolError::validation(&tool.name, messages.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentCardRegistry;
    use parley_types::agent::{AgentIdentity, ProtocolSpec};
    use parley_types::capability::Capability;
    use parley_types::config::SessionConfig;
    use parley_types::error::ParleyError;
    use parley_types::negotiation::NegotiationRequest;
    use parley_types::tool::ToolErrorKind;

    struct FakeRuntime;

    fn tool(name: &str, server: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            server: server.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"code": {"type": "string"}},
                "required": ["code"]
            }),
            enabled: true,
        }
    }

    #[async_trait]
    impl ToolRuntime for FakeRuntime {
        async fn list_registered(&self) -> Vec<ToolDescriptor> {
            let mut off = tool("old_exec", "sandbox");
            off.enabled = false;
            vec![
                tool("run_python", "sandbox"),
                tool("slow", "sandbox"),
                tool("crash", "sandbox"),
                tool("fetch", "browser"),
                tool("read_file", "browser"),
                tool("read_file", "sandbox"),
                tool("stat", "sandbox"),
                tool("stat", "scratch"),
                off,
            ]
        }

        async fn execute(
            &self,
            tool: &ToolDescriptor,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            match tool.name.as_str() {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(serde_json::Value::Null)
                }
                "crash" => Err("segfault in interpreter".to_string()),
                _ => Ok(serde_json::json!({ "ran": args["code"], "server": tool.server })),
            }
        }
    }

    fn setup() -> (McpBridge, SessionId) {
        let registry = Arc::new(AgentCardRegistry::new(
            AgentIdentity {
                id: "me".to_string(),
                name: "me".to_string(),
                version: "0.1.0".to_string(),
                description: String::new(),
            },
            Vec::new(),
            "http://localhost",
        ));
        registry
            .register_capability(Capability::new("code_execution", "", "1.0.0"))
            .unwrap();
        registry
            .register_capability(Capability::new("browsing", "", "1.0.0"))
            .unwrap();
        let engine = Arc::new(NegotiationEngine::new(
            registry,
            vec![ProtocolSpec::new("a2a", "1.0", &[])],
            &SessionConfig::default(),
        ));
        let mut config = ToolsConfig {
            call_timeout_ms: 200,
            ..Default::default()
        };
        config.capability_servers.insert(
            "code_execution".to_string(),
            vec!["sandbox".to_string(), "scratch".to_string()],
        );
        let bridge = McpBridge::new(Arc::new(FakeRuntime), engine.clone(), &config);
        let resp = engine
            .negotiate(NegotiationRequest {
                requester_id: "peer".to_string(),
                session_id: None,
                preferences: vec![ProtocolSpec::new("a2a", "1.0", &[])],
                required: vec!["code_execution".to_string()],
                optional: Vec::new(),
            })
            .unwrap();
        (bridge, resp.session_id)
    }

    fn tool_error(err: ParleyError) -> ToolError {
        match err {
            ParleyError::Tool(e) => e,
            other => panic!("expected tool error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_filtered_by_granted_servers() {
        let (bridge, sid) = setup();
        let tools = bridge.list_tools(sid).await.unwrap();
        assert!(tools.iter().all(|t| t.server == "sandbox" || t.server == "scratch"));
        assert!(!tools.iter().any(|t| t.server == "browser"));
    }

    #[tokio::test]
    async fn test_execute_success() {
        let (bridge, sid) = setup();
        let result = bridge
            .execute_tool(sid, "run_python", serde_json::json!({"code": "1+1"}))
            .await
            .unwrap();
        assert_eq!(result.output["ran"], "1+1");
    }

    #[tokio::test]
    async fn test_schema_violation_is_validation_error() {
        let (bridge, sid) = setup();
        let err = bridge
            .execute_tool(sid, "run_python", serde_json::json!({"code": 5}))
            .await
            .unwrap_err();
        assert_eq!(tool_error(err).kind, ToolErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_ungranted_server_is_unauthorized() {
        let (bridge, sid) = setup();
        let err = bridge
            .execute_tool(sid, "browser/fetch", serde_json::json!({"code": ""}))
            .await
            .unwrap_err();
        assert_eq!(tool_error(err).kind, ToolErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_ungranted_tool_is_indistinguishable_from_unknown() {
        let (bridge, sid) = setup();
        let hidden = tool_error(
            bridge
                .execute_tool(sid, "fetch", serde_json::json!({"code": ""}))
                .await
                .unwrap_err(),
        );
        let missing = tool_error(
            bridge
                .execute_tool(sid, "nope", serde_json::json!({"code": ""}))
                .await
                .unwrap_err(),
        );
        assert_eq!(hidden.kind, ToolErrorKind::ValidationError);
        assert_eq!(hidden.message, missing.message);
    }

    #[tokio::test]
    async fn test_name_collision_resolves_to_granted_server() {
        let (bridge, sid) = setup();
        let listed: Vec<(String, String)> = bridge
            .list_tools(sid)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.name == "read_file")
            .map(|t| (t.name, t.server))
            .collect();
        assert_eq!(listed, vec![("read_file".to_string(), "sandbox".to_string())]);

        let result = bridge
            .execute_tool(sid, "read_file", serde_json::json!({"code": "x"}))
            .await
            .unwrap();
        assert_eq!(result.output["server"], "sandbox");
    }

    #[tokio::test]
    async fn test_collision_between_granted_servers_needs_qualified_name() {
        let (bridge, sid) = setup();
        let err = tool_error(
            bridge
                .execute_tool(sid, "stat", serde_json::json!({"code": "x"}))
                .await
                .unwrap_err(),
        );
        assert_eq!(err.kind, ToolErrorKind::ValidationError);
        assert!(err.message.contains("sandbox/stat"));
        assert!(err.message.contains("scratch/stat"));

        let result = bridge
            .execute_tool(sid, "scratch/stat", serde_json::json!({"code": "x"}))
            .await
            .unwrap();
        assert_eq!(result.output["server"], "scratch");
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_tools() {
        let (bridge, sid) = setup();
        for name in ["nope", "old_exec"] {
            let err = bridge
                .execute_tool(sid, name, serde_json::json!({"code": ""}))
                .await
                .unwrap_err();
            assert_eq!(tool_error(err).kind, ToolErrorKind::ValidationError);
        }
    }

    #[tokio::test]
    async fn test_runtime_failure_wrapped() {
        let (bridge, sid) = setup();
        let err = tool_error(
            bridge
                .execute_tool(sid, "crash", serde_json::json!({"code": ""}))
                .await
                .unwrap_err(),
        );
        assert_eq!(err.kind, ToolErrorKind::ExecutionError);
        assert!(err.message.contains("segfault"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let (bridge, sid) = setup();
        let err = bridge
            .execute_tool(sid, "slow", serde_json::json!({"code": ""}))
            .await
            .unwrap_err();
        assert_eq!(tool_error(err).kind, ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_closed_session_rejected() {
        let (bridge, sid) = setup();
        bridge.engine.revoke(sid).unwrap();
        assert!(matches!(
            bridge.list_tools(sid).await,
            Err(ParleyError::SessionClosed(_))
        ));
    }
}
