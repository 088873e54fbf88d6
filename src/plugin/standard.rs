use crate::plugin::AgentFamily;
use crate::protocol::types::{
    AgentData, BuildProfile, ConsoleMessageData, TaskData, TaskType,
};
use crate::{NocturneError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Built-in agent family. First beacons carry a field-tagged identity
/// record; console commands map onto a small fixed command set. Payload
/// builds emit a descriptor blob the external build pipeline consumes.
pub struct StandardAgentFamily;

/// Command parameters carried in a task's data field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CommandParams {
    #[serde(rename = "c_name")]
    name: String,
    #[serde(rename = "c_args")]
    args: Vec<String>,
}

fn arg_str(args: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn arg_u64(args: &HashMap<String, serde_json::Value>, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

impl AgentFamily for StandardAgentFamily {
    fn generate_profiles(&self, profile: &BuildProfile) -> Result<Vec<Vec<u8>>> {
        profile
            .listener_profiles
            .iter()
            .map(|p| {
                serde_json::to_vec(p).map_err(|e| NocturneError::MalformedRecord(e.to_string()))
            })
            .collect()
    }

    fn build_payload(
        &self,
        profile: &BuildProfile,
        agent_profiles: &[Vec<u8>],
    ) -> Result<(Vec<u8>, String)> {
        // Descriptor consumed by the external build pipeline; not a binary
        let descriptor = serde_json::json!({
            "build_id": profile.builder_id,
            "agent_params": profile.agent_config,
            "profiles": agent_profiles
                .iter()
                .map(|p| STANDARD.encode(p))
                .collect::<Vec<_>>(),
        });
        let bytes = serde_json::to_vec(&descriptor)
            .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;
        Ok((bytes, format!("{}.json", profile.builder_id)))
    }

    fn create_agent(&self, beat: &[u8]) -> Result<AgentData> {
        let mut agent: AgentData = serde_json::from_slice(beat)
            .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;
        // The key is minted server-side at registration, never trusted from
        // the wire
        agent.session_key.clear();
        agent.id.clear();
        Ok(agent)
    }

    fn create_command(
        &self,
        agent: &AgentData,
        args: &HashMap<String, serde_json::Value>,
    ) -> Result<(TaskData, Option<ConsoleMessageData>)> {
        let name = arg_str(args, "command")
            .ok_or_else(|| NocturneError::InvalidCommand("<missing>".to_string()))?;

        let mut task = TaskData::new(TaskType::Task, &agent.id);
        task.client = arg_str(args, "client").unwrap_or_default();

        let mut console = None;
        match name.as_str() {
            "shell" => {
                let cmd = arg_str(args, "cmd")
                    .ok_or_else(|| NocturneError::InvalidCommand("shell: missing cmd".into()))?;
                task.command_line = format!("shell {}", cmd);
                task.sync = true;
                task.data = command_data("shell", vec![cmd])?;
            }
            "sleep" => {
                let secs = arg_u64(args, "seconds")
                    .ok_or_else(|| NocturneError::InvalidCommand("sleep: missing seconds".into()))?;
                let jitter = arg_u64(args, "jitter").unwrap_or(0);
                task.command_line = format!("sleep {} {}", secs, jitter);
                task.data = command_data("sleep", vec![secs.to_string(), jitter.to_string()])?;
                console = Some(ConsoleMessageData::info(format!(
                    "Sleep set to {}s with {}% jitter",
                    secs, jitter
                )));
            }
            "download" => {
                let path = arg_str(args, "path")
                    .ok_or_else(|| NocturneError::InvalidCommand("download: missing path".into()))?;
                task.command_line = format!("download {}", path);
                task.data = command_data("download", vec![path])?;
            }
            "upload" => {
                let path = arg_str(args, "path")
                    .ok_or_else(|| NocturneError::InvalidCommand("upload: missing path".into()))?;
                let content = arg_str(args, "content").unwrap_or_default();
                task.command_line = format!("upload {}", path);
                task.data = command_data("upload", vec![path, content])?;
            }
            "exit" => {
                task.command_line = "exit".to_string();
                task.data = command_data("exit", Vec::new())?;
                console = Some(ConsoleMessageData::info("Agent will terminate on next check-in"));
            }
            other => return Err(NocturneError::InvalidCommand(other.to_string())),
        }

        Ok((task, console))
    }
}

fn command_data(name: &str, args: Vec<String>) -> Result<Vec<u8>> {
    serde_json::to_vec(&CommandParams {
        name: name.to_string(),
        args,
    })
    .map_err(|e| NocturneError::MalformedRecord(e.to_string()))
}
