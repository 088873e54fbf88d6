pub mod socks;

pub use socks::SocksReply;

use crate::protocol::types::{base64_bytes, TaskData, TaskType, TunnelData};
use crate::{NocturneError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Tunnel operations dispatched over an agent's channel, one variant per
/// callback the transport layer can raise.
#[derive(Debug, Clone)]
pub enum TunnelCommand {
    ConnectTcp {
        channel_id: u32,
        tunnel_type: i32,
        address_type: i32,
        address: String,
        port: u16,
    },
    ConnectUdp {
        channel_id: u32,
        tunnel_type: i32,
        address_type: i32,
        address: String,
        port: u16,
    },
    WriteTcp {
        channel_id: u32,
        data: Vec<u8>,
    },
    WriteUdp {
        channel_id: u32,
        data: Vec<u8>,
    },
    Close {
        channel_id: u32,
    },
    Reverse {
        tunnel_id: String,
        port: u16,
    },
}

/// Wire body of a tunnel task, carried in the task's data field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelFrame {
    #[serde(rename = "f_cmd")]
    pub command: String,
    #[serde(rename = "f_channel_id")]
    pub channel_id: u32,
    #[serde(rename = "f_tunnel_type")]
    pub tunnel_type: i32,
    #[serde(rename = "f_address_type")]
    pub address_type: i32,
    #[serde(rename = "f_address")]
    pub address: String,
    #[serde(rename = "f_port")]
    pub port: u16,
    #[serde(rename = "f_data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// What the operator-facing proxy socket observes for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Connected,
    ConnectFailed(SocksReply),
    Data(Vec<u8>),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Connect task sent, awaiting the implant's SOCKS reply
    Init,
    Connected,
    /// Close sent, id not reusable until the implant acknowledges
    Closed,
}

struct Channel {
    tunnel_id: String,
    agent_id: String,
    state: ChannelState,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

/// Demultiplexes tunnel channel I/O over the single agent transport, keyed
/// by channel id. Channels are independent; ordering is only promised
/// within one channel.
pub struct TunnelMultiplexer {
    tunnels: DashMap<String, TunnelData>,
    channels: DashMap<u32, Channel>,
}

impl Default for TunnelMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelMultiplexer {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    pub fn register_tunnel(&self, data: TunnelData) {
        tracing::info!(tunnel_id = %data.tunnel_id, tunnel_type = %data.tunnel_type, "Tunnel registered");
        self.tunnels.insert(data.tunnel_id.clone(), data);
    }

    pub fn remove_tunnel(&self, tunnel_id: &str) {
        if self.tunnels.remove(tunnel_id).is_some() {
            tracing::info!(tunnel_id = %tunnel_id, "Tunnel removed");
        }
        self.channels.retain(|_, c| c.tunnel_id != tunnel_id);
    }

    pub fn tunnel(&self, tunnel_id: &str) -> Option<TunnelData> {
        self.tunnels.get(tunnel_id).map(|t| t.clone())
    }

    /// Dispatch one tunnel operation, producing the task to queue for the
    /// agent. Connect variants also hand back the event stream the
    /// operator-facing socket consumes.
    pub fn handle(
        &self,
        tunnel_id: &str,
        command: TunnelCommand,
    ) -> Result<(TaskData, Option<mpsc::UnboundedReceiver<TunnelEvent>>)> {
        match command {
            TunnelCommand::ConnectTcp {
                channel_id,
                tunnel_type,
                address_type,
                address,
                port,
            } => self
                .connect(tunnel_id, "connect_tcp", channel_id, tunnel_type, address_type, address, port)
                .map(|(task, rx)| (task, Some(rx))),
            TunnelCommand::ConnectUdp {
                channel_id,
                tunnel_type,
                address_type,
                address,
                port,
            } => self
                .connect(tunnel_id, "connect_udp", channel_id, tunnel_type, address_type, address, port)
                .map(|(task, rx)| (task, Some(rx))),
            TunnelCommand::WriteTcp { channel_id, data } => {
                self.write(channel_id, "write_tcp", data).map(|t| (t, None))
            }
            TunnelCommand::WriteUdp { channel_id, data } => {
                self.write(channel_id, "write_udp", data).map(|t| (t, None))
            }
            TunnelCommand::Close { channel_id } => self.close(channel_id).map(|t| (t, None)),
            TunnelCommand::Reverse { tunnel_id, port } => {
                self.reverse(&tunnel_id, port).map(|t| (t, None))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn connect(
        &self,
        tunnel_id: &str,
        command: &str,
        channel_id: u32,
        tunnel_type: i32,
        address_type: i32,
        address: String,
        port: u16,
    ) -> Result<(TaskData, mpsc::UnboundedReceiver<TunnelEvent>)> {
        let tunnel = self
            .tunnels
            .get(tunnel_id)
            .ok_or_else(|| NocturneError::UnknownTunnel(tunnel_id.to_string()))?;

        if self.channels.contains_key(&channel_id) {
            return Err(NocturneError::ChannelInUse(channel_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(
            channel_id,
            Channel {
                tunnel_id: tunnel_id.to_string(),
                agent_id: tunnel.agent_id.clone(),
                state: ChannelState::Init,
                events: tx,
            },
        );

        tracing::debug!(channel_id = channel_id, tunnel_id = %tunnel_id, address = %address, port = port, "Channel opening");

        let task = self.tunnel_task(
            &tunnel.agent_id,
            tunnel_id,
            TunnelFrame {
                command: command.to_string(),
                channel_id,
                tunnel_type,
                address_type,
                address,
                port,
                data: Vec::new(),
            },
        )?;
        Ok((task, rx))
    }

    fn write(&self, channel_id: u32, command: &str, data: Vec<u8>) -> Result<TaskData> {
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or(NocturneError::UnknownChannel(channel_id))?;

        if channel.state == ChannelState::Closed {
            return Err(NocturneError::ChannelClosed(channel_id));
        }

        self.tunnel_task(
            &channel.agent_id,
            &channel.tunnel_id,
            TunnelFrame {
                command: command.to_string(),
                channel_id,
                data,
                ..Default::default()
            },
        )
    }

    fn close(&self, channel_id: u32) -> Result<TaskData> {
        let mut channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(NocturneError::UnknownChannel(channel_id))?;

        channel.state = ChannelState::Closed;
        let _ = channel.events.send(TunnelEvent::Closed);
        tracing::debug!(channel_id = channel_id, "Channel close requested");

        self.tunnel_task(
            &channel.agent_id,
            &channel.tunnel_id,
            TunnelFrame {
                command: "close".to_string(),
                channel_id,
                ..Default::default()
            },
        )
    }

    /// Ask the implant to bind a reverse listener for `(tunnel_id, port)`.
    /// No channel exists until a remote peer connects.
    fn reverse(&self, tunnel_id: &str, port: u16) -> Result<TaskData> {
        let tunnel = self
            .tunnels
            .get(tunnel_id)
            .ok_or_else(|| NocturneError::UnknownTunnel(tunnel_id.to_string()))?;

        self.tunnel_task(
            &tunnel.agent_id,
            tunnel_id,
            TunnelFrame {
                command: "reverse".to_string(),
                port,
                ..Default::default()
            },
        )
    }

    /// A remote peer connected to a reverse listener: the implant announced
    /// a fresh channel, allocate it on our side already connected.
    pub fn accept_reverse(
        &self,
        tunnel_id: &str,
        channel_id: u32,
    ) -> Result<mpsc::UnboundedReceiver<TunnelEvent>> {
        let tunnel = self
            .tunnels
            .get(tunnel_id)
            .ok_or_else(|| NocturneError::UnknownTunnel(tunnel_id.to_string()))?;

        if self.channels.contains_key(&channel_id) {
            return Err(NocturneError::ChannelInUse(channel_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TunnelEvent::Connected);
        self.channels.insert(
            channel_id,
            Channel {
                tunnel_id: tunnel_id.to_string(),
                agent_id: tunnel.agent_id.clone(),
                state: ChannelState::Connected,
                events: tx,
            },
        );
        tracing::debug!(channel_id = channel_id, tunnel_id = %tunnel_id, "Reverse channel accepted");
        Ok(rx)
    }

    /// The implant's SOCKS reply for a connecting channel. A failure tears
    /// the channel down immediately, freeing the id for reuse.
    pub fn process_reply(&self, channel_id: u32, code: u8) -> Result<SocksReply> {
        let reply = SocksReply::from_byte(code);

        let Some(mut channel) = self.channels.get_mut(&channel_id) else {
            return Err(NocturneError::UnknownChannel(channel_id));
        };

        if channel.state != ChannelState::Init {
            tracing::debug!(channel_id = channel_id, "Late SOCKS reply ignored");
            return Ok(reply);
        }

        if reply.is_success() {
            channel.state = ChannelState::Connected;
            let _ = channel.events.send(TunnelEvent::Connected);
        } else {
            let _ = channel.events.send(TunnelEvent::ConnectFailed(reply));
            drop(channel);
            self.channels.remove(&channel_id);
            tracing::debug!(channel_id = channel_id, reply = %reply, "Channel connect failed");
        }

        Ok(reply)
    }

    /// Bytes from the implant side of a connected channel, forwarded to the
    /// operator-facing socket in arrival order.
    pub fn process_data_frame(&self, channel_id: u32, data: Vec<u8>) -> Result<()> {
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or(NocturneError::UnknownChannel(channel_id))?;

        if channel.state == ChannelState::Closed {
            return Err(NocturneError::ChannelClosed(channel_id));
        }

        let _ = channel.events.send(TunnelEvent::Data(data));
        Ok(())
    }

    /// The implant acknowledged a close; the id becomes reusable. Duplicate
    /// acknowledgements are possible under retransmission and are dropped.
    pub fn acknowledge_close(&self, channel_id: u32) {
        if self.channels.remove(&channel_id).is_none() {
            tracing::debug!(channel_id = channel_id, "Close acknowledgement for unknown channel");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn tunnel_task(&self, agent_id: &str, tunnel_id: &str, frame: TunnelFrame) -> Result<TaskData> {
        let mut task = TaskData::new(TaskType::Tunnel, agent_id);
        task.handler_id = tunnel_id.to_string();
        task.data = serde_json::to_vec(&frame)
            .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{AddressType, TunnelType};

    fn mux_with_tunnel(tunnel_id: &str) -> TunnelMultiplexer {
        let mux = TunnelMultiplexer::new();
        mux.register_tunnel(TunnelData {
            tunnel_id: tunnel_id.to_string(),
            agent_id: "agent-1".to_string(),
            tunnel_type: TunnelType::Socks5.to_string(),
            ..Default::default()
        });
        mux
    }

    fn connect_cmd(channel_id: u32) -> TunnelCommand {
        TunnelCommand::ConnectTcp {
            channel_id,
            tunnel_type: TunnelType::Socks5 as i32,
            address_type: AddressType::Ipv4 as i32,
            address: "10.0.0.5".to_string(),
            port: 445,
        }
    }

    #[test]
    fn connect_emits_tunnel_task_with_frame() {
        let mux = mux_with_tunnel("tun-1");
        let (task, rx) = mux.handle("tun-1", connect_cmd(7)).unwrap();
        assert!(rx.is_some());
        assert_eq!(task.task_type, TaskType::Tunnel as i32);
        assert_eq!(task.agent_id, "agent-1");
        assert_eq!(task.handler_id, "tun-1");

        let frame: TunnelFrame = serde_json::from_slice(&task.data).unwrap();
        assert_eq!(frame.command, "connect_tcp");
        assert_eq!(frame.channel_id, 7);
        assert_eq!(frame.address, "10.0.0.5");
        assert_eq!(frame.port, 445);
    }

    #[test]
    fn connect_to_unknown_tunnel_fails() {
        let mux = TunnelMultiplexer::new();
        assert!(matches!(
            mux.handle("nope", connect_cmd(1)),
            Err(NocturneError::UnknownTunnel(_))
        ));
    }

    #[tokio::test]
    async fn host_unreachable_reply_frees_the_channel_id() {
        let mux = mux_with_tunnel("tun-1");
        let (_, rx) = mux.handle("tun-1", connect_cmd(7)).unwrap();
        let mut rx = rx.unwrap();

        let reply = mux.process_reply(7, SocksReply::HostUnreachable as u8).unwrap();
        assert_eq!(reply, SocksReply::HostUnreachable);
        assert_eq!(
            rx.recv().await,
            Some(TunnelEvent::ConnectFailed(SocksReply::HostUnreachable))
        );

        // Channel id 7 is immediately eligible for reuse
        assert!(mux.handle("tun-1", connect_cmd(7)).is_ok());
    }

    #[tokio::test]
    async fn successful_reply_connects_the_channel() {
        let mux = mux_with_tunnel("tun-1");
        let (_, rx) = mux.handle("tun-1", connect_cmd(3)).unwrap();
        let mut rx = rx.unwrap();

        mux.process_reply(3, SocksReply::Success as u8).unwrap();
        assert_eq!(rx.recv().await, Some(TunnelEvent::Connected));

        // Reusing a live id is rejected
        assert!(matches!(
            mux.handle("tun-1", connect_cmd(3)),
            Err(NocturneError::ChannelInUse(3))
        ));
    }

    #[test]
    fn writes_preserve_per_channel_payloads() {
        let mux = mux_with_tunnel("tun-1");
        mux.handle("tun-1", connect_cmd(1)).unwrap();
        mux.process_reply(1, 0).unwrap();

        let (task_a, _) = mux
            .handle(
                "tun-1",
                TunnelCommand::WriteTcp {
                    channel_id: 1,
                    data: b"A".to_vec(),
                },
            )
            .unwrap();
        let (task_b, _) = mux
            .handle(
                "tun-1",
                TunnelCommand::WriteTcp {
                    channel_id: 1,
                    data: b"B".to_vec(),
                },
            )
            .unwrap();

        let frame_a: TunnelFrame = serde_json::from_slice(&task_a.data).unwrap();
        let frame_b: TunnelFrame = serde_json::from_slice(&task_b.data).unwrap();
        assert_eq!(frame_a.data, b"A");
        assert_eq!(frame_b.data, b"B");
    }

    #[test]
    fn write_on_closed_channel_fails_loudly() {
        let mux = mux_with_tunnel("tun-1");
        mux.handle("tun-1", connect_cmd(5)).unwrap();
        mux.process_reply(5, 0).unwrap();
        mux.handle("tun-1", TunnelCommand::Close { channel_id: 5 }).unwrap();

        let outcome = mux.handle(
            "tun-1",
            TunnelCommand::WriteTcp {
                channel_id: 5,
                data: b"late".to_vec(),
            },
        );
        assert!(matches!(outcome, Err(NocturneError::ChannelClosed(5))));

        // Id stays reserved until the implant acknowledges the close
        assert!(matches!(
            mux.handle("tun-1", connect_cmd(5)),
            Err(NocturneError::ChannelInUse(5))
        ));
        mux.acknowledge_close(5);
        assert!(mux.handle("tun-1", connect_cmd(5)).is_ok());
    }

    #[test]
    fn write_on_unknown_channel_fails() {
        let mux = mux_with_tunnel("tun-1");
        assert!(matches!(
            mux.handle(
                "tun-1",
                TunnelCommand::WriteTcp {
                    channel_id: 42,
                    data: vec![]
                }
            ),
            Err(NocturneError::UnknownChannel(42))
        ));
    }

    #[tokio::test]
    async fn reverse_allocates_channels_only_on_peer_connect() {
        let mux = mux_with_tunnel("tun-1");
        let (task, rx) = mux
            .handle(
                "tun-1",
                TunnelCommand::Reverse {
                    tunnel_id: "tun-1".to_string(),
                    port: 8443,
                },
            )
            .unwrap();
        assert!(rx.is_none());
        assert_eq!(mux.channel_count(), 0);

        let frame: TunnelFrame = serde_json::from_slice(&task.data).unwrap();
        assert_eq!(frame.command, "reverse");
        assert_eq!(frame.port, 8443);

        let mut rx = mux.accept_reverse("tun-1", 9).unwrap();
        assert_eq!(mux.channel_count(), 1);
        assert_eq!(rx.recv().await, Some(TunnelEvent::Connected));
    }

    #[tokio::test]
    async fn data_frames_flow_to_the_operator_side_in_order() {
        let mux = mux_with_tunnel("tun-1");
        let (_, rx) = mux.handle("tun-1", connect_cmd(2)).unwrap();
        let mut rx = rx.unwrap();
        mux.process_reply(2, 0).unwrap();
        assert_eq!(rx.recv().await, Some(TunnelEvent::Connected));

        mux.process_data_frame(2, b"first".to_vec()).unwrap();
        mux.process_data_frame(2, b"second".to_vec()).unwrap();
        assert_eq!(rx.recv().await, Some(TunnelEvent::Data(b"first".to_vec())));
        assert_eq!(rx.recv().await, Some(TunnelEvent::Data(b"second".to_vec())));
    }

    #[test]
    fn removing_a_tunnel_drops_its_channels() {
        let mux = mux_with_tunnel("tun-1");
        mux.handle("tun-1", connect_cmd(1)).unwrap();
        mux.handle("tun-1", connect_cmd(2)).unwrap();
        assert_eq!(mux.channel_count(), 2);

        mux.remove_tunnel("tun-1");
        assert_eq!(mux.channel_count(), 0);
        assert!(mux.tunnel("tun-1").is_none());
    }
}
