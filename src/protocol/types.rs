use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serde helper for binary fields carried inside field-tagged records.
/// Byte payloads cross the boundary base64-encoded, not as JSON arrays.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Unknown = 0,
    Windows = 1,
    Linux = 2,
    Mac = 3,
}

impl OsKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Windows,
            2 => Self::Linux,
            3 => Self::Mac,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Local = 0,
    Task = 1,
    Browser = 2,
    Job = 3,
    Tunnel = 4,
    ProxyData = 5,
}

impl TaskType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Local),
            1 => Some(Self::Task),
            2 => Some(Self::Browser),
            3 => Some(Self::Job),
            4 => Some(Self::Tunnel),
            5 => Some(Self::ProxyData),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Task => "task",
            Self::Browser => "browser",
            Self::Job => "job",
            Self::Tunnel => "tunnel",
            Self::ProxyData => "proxy_data",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Info = 5,
    Error = 6,
    Success = 7,
}

impl MessageStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            5 => Some(Self::Info),
            6 => Some(Self::Error),
            7 => Some(Self::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildLogLevel {
    None = 0,
    Info = 1,
    Error = 2,
    Success = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Running = 1,
    Stopped = 2,
    Finished = 3,
    Canceled = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Socks4 = 1,
    Socks5 = 2,
    Socks5Auth = 3,
    LocalPort = 4,
    Reverse = 5,
}

impl TunnelType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Socks4),
            2 => Some(Self::Socks5),
            3 => Some(Self::Socks5Auth),
            4 => Some(Self::LocalPort),
            5 => Some(Self::Reverse),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Socks5Auth => "socks5_auth",
            Self::LocalPort => "local_port",
            Self::Reverse => "reverse",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 1,
    Domain = 3,
    Ipv6 = 4,
}

impl AddressType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Ipv4),
            3 => Some(Self::Domain),
            4 => Some(Self::Ipv6),
            _ => None,
        }
    }
}

/// One unit of work exchanged between console and agent. Travels inside the
/// encrypted envelope as a field-tagged record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskData {
    #[serde(rename = "t_type")]
    pub task_type: i32,
    #[serde(rename = "t_task_id")]
    pub task_id: String,
    #[serde(rename = "t_agent_id")]
    pub agent_id: String,
    #[serde(rename = "t_client")]
    pub client: String,
    #[serde(rename = "t_hook_id")]
    pub hook_id: String,
    #[serde(rename = "t_handler_id")]
    pub handler_id: String,
    #[serde(rename = "t_user")]
    pub user: String,
    #[serde(rename = "t_computer")]
    pub computer: String,
    #[serde(rename = "t_start_date")]
    pub start_date: i64,
    #[serde(rename = "t_finish_date")]
    pub finish_date: i64,
    #[serde(rename = "t_data", with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "t_command_line")]
    pub command_line: String,
    #[serde(rename = "t_message_type")]
    pub message_type: i32,
    #[serde(rename = "t_message")]
    pub message: String,
    #[serde(rename = "t_clear_text")]
    pub clear_text: String,
    #[serde(rename = "t_completed")]
    pub completed: bool,
    #[serde(rename = "t_sync")]
    pub sync: bool,
}

impl TaskData {
    pub fn new(task_type: TaskType, agent_id: &str) -> Self {
        Self {
            task_type: task_type as i32,
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            agent_id: agent_id.to_string(),
            start_date: Utc::now().timestamp(),
            ..Default::default()
        }
    }
}

/// Registered identity and session state of one implant instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentData {
    #[serde(rename = "a_crc")]
    pub crc: String,
    #[serde(rename = "a_id")]
    pub id: String,
    #[serde(rename = "a_name")]
    pub name: String,
    #[serde(rename = "a_session_key", with = "base64_bytes")]
    pub session_key: Vec<u8>,
    #[serde(rename = "a_listener")]
    pub listener: String,
    #[serde(rename = "a_async")]
    pub is_async: bool,
    #[serde(rename = "a_external_ip")]
    pub external_ip: String,
    #[serde(rename = "a_internal_ip")]
    pub internal_ip: String,
    #[serde(rename = "a_gmt_offset")]
    pub gmt_offset: i32,
    #[serde(rename = "a_sleep")]
    pub sleep: u32,
    #[serde(rename = "a_jitter")]
    pub jitter: u32,
    #[serde(rename = "a_pid")]
    pub pid: String,
    #[serde(rename = "a_tid")]
    pub tid: String,
    #[serde(rename = "a_arch")]
    pub arch: String,
    #[serde(rename = "a_elevated")]
    pub elevated: bool,
    #[serde(rename = "a_process")]
    pub process: String,
    #[serde(rename = "a_os")]
    pub os: i32,
    #[serde(rename = "a_os_desc")]
    pub os_desc: String,
    #[serde(rename = "a_domain")]
    pub domain: String,
    #[serde(rename = "a_computer")]
    pub computer: String,
    #[serde(rename = "a_username")]
    pub username: String,
    #[serde(rename = "a_impersonated")]
    pub impersonated: String,
    #[serde(rename = "a_oemcp")]
    pub oem_cp: i32,
    #[serde(rename = "a_acp")]
    pub acp: i32,
    #[serde(rename = "a_create_time")]
    pub create_time: i64,
    #[serde(rename = "a_last_tick")]
    pub last_tick: i64,
    #[serde(rename = "a_killdate")]
    pub kill_date: i64,
    #[serde(rename = "a_workingtime")]
    pub working_time: i64,
    #[serde(rename = "a_tags")]
    pub tags: String,
    #[serde(rename = "a_mark")]
    pub mark: String,
    #[serde(rename = "a_color")]
    pub color: String,
    #[serde(rename = "a_target")]
    pub target_id: String,
    #[serde(rename = "a_custom_data", with = "base64_bytes")]
    pub custom_data: Vec<u8>,
}

/// One configured transport instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerData {
    #[serde(rename = "l_name")]
    pub name: String,
    #[serde(rename = "l_reg_name")]
    pub reg_name: String,
    #[serde(rename = "l_protocol")]
    pub protocol: String,
    #[serde(rename = "l_type")]
    pub listener_type: String,
    #[serde(rename = "l_bind_host")]
    pub bind_host: String,
    #[serde(rename = "l_bind_port")]
    pub bind_port: String,
    #[serde(rename = "l_agent_addr")]
    pub agent_addr: String,
    #[serde(rename = "l_create_time")]
    pub create_time: i64,
    #[serde(rename = "l_status")]
    pub status: String,
    #[serde(rename = "l_data")]
    pub data: String,
    #[serde(rename = "l_watermark")]
    pub watermark: String,
}

/// Console notification shown to the issuing operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleMessageData {
    #[serde(rename = "m_message")]
    pub message: String,
    #[serde(rename = "m_status")]
    pub status: i32,
    #[serde(rename = "m_text")]
    pub text: String,
}

impl ConsoleMessageData {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: MessageStatus::Info as i32,
            text: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: MessageStatus::Error as i32,
            text: String::new(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: MessageStatus::Success as i32,
            text: String::new(),
        }
    }
}

/// One active forwarding path multiplexed over an agent's channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelData {
    #[serde(rename = "p_tunnel_id")]
    pub tunnel_id: String,
    #[serde(rename = "p_agent_id")]
    pub agent_id: String,
    #[serde(rename = "p_computer")]
    pub computer: String,
    #[serde(rename = "p_username")]
    pub username: String,
    #[serde(rename = "p_process")]
    pub process: String,
    #[serde(rename = "p_type")]
    pub tunnel_type: String,
    #[serde(rename = "p_info")]
    pub info: String,
    #[serde(rename = "p_interface")]
    pub interface: String,
    #[serde(rename = "p_port")]
    pub port: String,
    #[serde(rename = "p_client")]
    pub client: String,
    #[serde(rename = "p_fhost")]
    pub forward_host: String,
    #[serde(rename = "p_fport")]
    pub forward_port: String,
    #[serde(rename = "p_auth_user")]
    pub auth_user: String,
    #[serde(rename = "p_auth_pass")]
    pub auth_pass: String,
}

/// An edge in the agent relay graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PivotData {
    #[serde(rename = "p_pivot_id")]
    pub pivot_id: String,
    #[serde(rename = "p_pivot_name")]
    pub pivot_name: String,
    #[serde(rename = "p_parent_agent_id")]
    pub parent_agent_id: String,
    #[serde(rename = "p_child_agent_id")]
    pub child_agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatData {
    #[serde(rename = "c_username")]
    pub username: String,
    #[serde(rename = "c_message")]
    pub message: String,
    #[serde(rename = "c_date")]
    pub date: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadData {
    #[serde(rename = "d_file_id")]
    pub file_id: String,
    #[serde(rename = "d_agent_id")]
    pub agent_id: String,
    #[serde(rename = "d_agent_name")]
    pub agent_name: String,
    #[serde(rename = "d_user")]
    pub user: String,
    #[serde(rename = "d_computer")]
    pub computer: String,
    #[serde(rename = "d_remote_path")]
    pub remote_path: String,
    #[serde(rename = "d_local_path")]
    pub local_path: String,
    #[serde(rename = "d_total_size")]
    pub total_size: i64,
    #[serde(rename = "d_recv_size")]
    pub recv_size: i64,
    #[serde(rename = "d_date")]
    pub date: i64,
    #[serde(rename = "d_state")]
    pub state: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenData {
    #[serde(rename = "s_screen_id")]
    pub screen_id: String,
    #[serde(rename = "s_user")]
    pub user: String,
    #[serde(rename = "s_computer")]
    pub computer: String,
    #[serde(rename = "s_local_path")]
    pub local_path: String,
    #[serde(rename = "s_note")]
    pub note: String,
    #[serde(rename = "s_date")]
    pub date: i64,
    #[serde(rename = "s_content", with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredsData {
    #[serde(rename = "c_creds_id")]
    pub cred_id: String,
    #[serde(rename = "c_username")]
    pub username: String,
    #[serde(rename = "c_password")]
    pub password: String,
    #[serde(rename = "c_realm")]
    pub realm: String,
    #[serde(rename = "c_type")]
    pub cred_type: String,
    #[serde(rename = "c_tag")]
    pub tag: String,
    #[serde(rename = "c_date")]
    pub date: i64,
    #[serde(rename = "c_storage")]
    pub storage: String,
    #[serde(rename = "c_agent_id")]
    pub agent_id: String,
    #[serde(rename = "c_host")]
    pub host: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetData {
    #[serde(rename = "t_target_id")]
    pub target_id: String,
    #[serde(rename = "t_computer")]
    pub computer: String,
    #[serde(rename = "t_domain")]
    pub domain: String,
    #[serde(rename = "t_address")]
    pub address: String,
    #[serde(rename = "t_os")]
    pub os: i32,
    #[serde(rename = "t_os_desk")]
    pub os_desc: String,
    #[serde(rename = "t_tag")]
    pub tag: String,
    #[serde(rename = "t_info")]
    pub info: String,
    #[serde(rename = "t_date")]
    pub date: i64,
    #[serde(rename = "t_alive")]
    pub alive: bool,
    #[serde(rename = "t_agents")]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingFileDataWin {
    #[serde(rename = "b_is_dir")]
    pub is_dir: bool,
    #[serde(rename = "b_size")]
    pub size: i64,
    #[serde(rename = "b_date")]
    pub date: i64,
    #[serde(rename = "b_filename")]
    pub filename: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingFileDataUnix {
    #[serde(rename = "b_is_dir")]
    pub is_dir: bool,
    #[serde(rename = "b_mode")]
    pub mode: String,
    #[serde(rename = "b_user")]
    pub user: String,
    #[serde(rename = "b_group")]
    pub group: String,
    #[serde(rename = "b_size")]
    pub size: i64,
    #[serde(rename = "b_date")]
    pub date: String,
    #[serde(rename = "b_filename")]
    pub filename: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingProcessDataWin {
    #[serde(rename = "b_pid")]
    pub pid: u32,
    #[serde(rename = "b_ppid")]
    pub ppid: u32,
    #[serde(rename = "b_session_id")]
    pub session_id: u32,
    #[serde(rename = "b_arch")]
    pub arch: String,
    #[serde(rename = "b_context")]
    pub context: String,
    #[serde(rename = "b_process_name")]
    pub process_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingProcessDataUnix {
    #[serde(rename = "b_pid")]
    pub pid: u32,
    #[serde(rename = "b_ppid")]
    pub ppid: u32,
    #[serde(rename = "b_tty")]
    pub tty: String,
    #[serde(rename = "b_context")]
    pub context: String,
    #[serde(rename = "b_process_name")]
    pub process_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingDrivesDataWin {
    #[serde(rename = "b_name")]
    pub name: String,
    #[serde(rename = "b_type")]
    pub drive_type: String,
}

/// Per-listener build artifact: the watermark tags traffic produced by the
/// payload built from this profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportProfile {
    #[serde(rename = "watermark")]
    pub watermark: String,
    #[serde(rename = "profile", with = "base64_bytes")]
    pub profile: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildProfile {
    #[serde(rename = "build_id")]
    pub builder_id: String,
    #[serde(rename = "agent_params")]
    pub agent_config: String,
    #[serde(rename = "listener_profiles")]
    pub listener_profiles: Vec<TransportProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn task_record_uses_tagged_keys() {
        let mut task = TaskData::new(TaskType::Task, "a1b2");
        task.command_line = "whoami".to_string();
        task.data = vec![1, 2, 3];

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["t_type"], 1);
        assert_eq!(json["t_agent_id"], "a1b2");
        assert_eq!(json["t_command_line"], "whoami");
        // Binary payloads are base64 strings on the wire
        assert_eq!(json["t_data"], STANDARD.encode([1u8, 2, 3]));
    }

    #[test]
    fn absent_fields_decode_to_defaults() {
        let task: TaskData = serde_json::from_str(r#"{"t_task_id":"t1"}"#).unwrap();
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.task_type, 0);
        assert_eq!(task.start_date, 0);
        assert!(task.command_line.is_empty());
        assert!(!task.completed);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: ConsoleMessageData =
            serde_json::from_str(r#"{"m_message":"hi","m_status":5,"m_future_field":42}"#).unwrap();
        assert_eq!(msg.message, "hi");
        assert_eq!(MessageStatus::from_i32(msg.status), Some(MessageStatus::Info));
    }

    #[test]
    fn enum_discriminants_are_stable() {
        assert_eq!(TaskType::Tunnel as i32, 4);
        assert_eq!(TaskType::from_i32(5), Some(TaskType::ProxyData));
        assert_eq!(TunnelType::from_i32(3), Some(TunnelType::Socks5Auth));
        assert_eq!(AddressType::from_i32(2), None);
        assert_eq!(AddressType::Domain as i32, 3);
        assert_eq!(MessageStatus::Error as i32, 6);
    }
}
