pub mod registry;

use crate::config::ServerConfig;
use crate::pivot::PivotRelay;
use crate::plugin::PluginRegistry;
use crate::protocol::types::{
    AgentData, ConsoleMessageData, ListenerData, TaskData, TaskType, TunnelData,
};
use crate::tasks::TaskDispatcher;
use crate::terminal::{TerminalCommand, TerminalEvent, TerminalMultiplexer};
use crate::tunnel::{TunnelCommand, TunnelEvent, TunnelFrame, TunnelMultiplexer};
use crate::{crypto, NocturneError, Result};
use dashmap::DashMap;
use self::registry::{AgentRegistry, ListenerRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};

/// Result of issuing one console command: the queued task, optional
/// immediate feedback, and the completion receiver when the task is
/// synchronous.
pub struct CommandOutcome {
    pub task: TaskData,
    pub console: Option<ConsoleMessageData>,
    pub completion: Option<oneshot::Receiver<TaskData>>,
}

/// A freshly-accepted reverse-tunnel peer: the implant allocated the
/// channel, the operator proxy consumes its event stream.
pub struct ReverseConnection {
    pub channel_id: u32,
    pub events: mpsc::UnboundedReceiver<TunnelEvent>,
}

/// The teamserver core: owns the registries, the dispatcher, and the
/// multiplexers, and glues the check-in path together. Listener transports
/// and the operator console talk to this object only.
pub struct Teamserver {
    config: ServerConfig,
    plugins: Arc<PluginRegistry>,
    agents: Arc<AgentRegistry>,
    listeners: Arc<ListenerRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    tunnels: Arc<TunnelMultiplexer>,
    terminals: Arc<TerminalMultiplexer>,
    pivots: Arc<PivotRelay>,
    console_notifiers: DashMap<String, mpsc::UnboundedSender<ConsoleMessageData>>,
    reverse_acceptors: DashMap<String, mpsc::UnboundedSender<ReverseConnection>>,
}

impl Teamserver {
    pub fn new(config: ServerConfig) -> Self {
        let dispatcher = Arc::new(TaskDispatcher::new(config.tasking.clone()));
        Self {
            config,
            plugins: Arc::new(PluginRegistry::new()),
            agents: Arc::new(AgentRegistry::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            dispatcher,
            tunnels: Arc::new(TunnelMultiplexer::new()),
            terminals: Arc::new(TerminalMultiplexer::new()),
            pivots: Arc::new(PivotRelay::new()),
            console_notifiers: DashMap::new(),
            reverse_acceptors: DashMap::new(),
        }
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn tunnels(&self) -> &TunnelMultiplexer {
        &self.tunnels
    }

    pub fn terminals(&self) -> &TerminalMultiplexer {
        &self.terminals
    }

    pub fn pivots(&self) -> &PivotRelay {
        &self.pivots
    }

    // ---- console notification channel ----

    pub fn register_console(&self, client: &str) -> mpsc::UnboundedReceiver<ConsoleMessageData> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.console_notifiers.insert(client.to_string(), tx);
        rx
    }

    pub fn unregister_console(&self, client: &str) {
        self.console_notifiers.remove(client);
    }

    pub fn notify_console(&self, message: ConsoleMessageData) {
        self.console_notifiers.retain(|client, tx| {
            if tx.send(message.clone()).is_err() {
                tracing::debug!(client = %client, "Console notifier gone");
                false
            } else {
                true
            }
        });
    }

    // ---- listener lifecycle ----

    pub async fn start_listener(
        &self,
        reg_name: &str,
        name: &str,
        config: &str,
    ) -> Result<ListenerData> {
        let factory = self.plugins.listener_factory(reg_name)?;
        let (mut data, transport) = factory.create(name, config).await?;
        data.reg_name = reg_name.to_string();

        match self.listeners.register(data, transport).await {
            Ok(data) => {
                self.notify_console(ConsoleMessageData::success(format!(
                    "Listener {} started on {}:{}",
                    data.name, data.bind_host, data.bind_port
                )));
                Ok(data)
            }
            Err(e) => {
                self.notify_console(ConsoleMessageData::error(format!(
                    "Listener {} failed to start: {}",
                    name, e
                )));
                Err(e)
            }
        }
    }

    pub async fn stop_listener(&self, name: &str) -> Result<ListenerData> {
        let data = self.listeners.stop(name).await?;
        self.notify_console(ConsoleMessageData::info(format!("Listener {} stopped", name)));
        Ok(data)
    }

    pub async fn edit_listener(&self, name: &str, config: &str) -> Result<ListenerData> {
        self.listeners.edit(name, config).await
    }

    // ---- agent lifecycle ----

    /// First beacon from a new implant, delivered by its listener.
    pub fn handle_beacon(
        &self,
        reg_name: &str,
        listener: &str,
        beat: &[u8],
    ) -> Result<AgentData> {
        let family = self.plugins.agent_family(reg_name)?;
        let mut agent = family.create_agent(beat)?;
        agent.name = reg_name.to_string();
        agent.listener = listener.to_string();

        let agent = self.agents.register(agent)?;
        self.dispatcher.register_agent(&agent.id);
        self.notify_console(ConsoleMessageData::success(format!(
            "New agent {} ({}@{}) via {}",
            agent.id, agent.username, agent.computer, agent.listener
        )));
        Ok(agent)
    }

    /// Operator-initiated teardown. Queued work is dropped, sync waiters
    /// observe cancellation, and relay edges through this agent die with
    /// it.
    pub fn remove_agent(&self, agent_id: &str) -> Result<AgentData> {
        self.dispatcher.remove_agent(agent_id);
        let dropped_edges = self.pivots.remove_agent_edges(agent_id);
        if dropped_edges > 0 {
            tracing::info!(agent_id = %agent_id, edges = dropped_edges, "Pivot edges dropped with agent");
        }
        self.agents.remove(agent_id)
    }

    // ---- tasking ----

    /// Turn console arguments into a queued task via the agent's family
    /// plugin.
    pub fn issue_command(
        &self,
        agent_id: &str,
        args: &HashMap<String, serde_json::Value>,
    ) -> Result<CommandOutcome> {
        let agent = self.agents.get(agent_id)?;
        let family = self.plugins.agent_family(&agent.name)?;
        let (task, console) = family.create_command(&agent, args)?;

        if let Some(message) = &console {
            self.notify_console(message.clone());
        }

        let completion = if task.sync {
            Some(self.dispatcher.enqueue_sync(task.clone()))
        } else {
            self.dispatcher.enqueue(task.clone());
            None
        };

        Ok(CommandOutcome {
            task,
            console,
            completion,
        })
    }

    pub async fn wait_completion(
        &self,
        rx: oneshot::Receiver<TaskData>,
        wait: Option<Duration>,
    ) -> Result<TaskData> {
        self.dispatcher.wait_completion(rx, wait).await
    }

    /// One agent check-in: open the envelope with the agent's own key,
    /// resolve completions, route tunnel/terminal/pivot frames, then pack
    /// the outbound batch. Errors here poison only this agent's exchange.
    pub fn agent_checkin(
        &self,
        agent_id: &str,
        ciphertext: &[u8],
        external_ip: Option<&str>,
    ) -> Result<Vec<u8>> {
        let key = self.agents.session_key(agent_id)?;
        let plaintext = crypto::open(ciphertext, &key).map_err(|e| {
            tracing::warn!(agent_id = %agent_id, "Check-in failed envelope authentication");
            e
        })?;

        self.agents.checkin(agent_id, external_ip)?;
        let agent = self.agents.get(agent_id)?;

        let processed = self.dispatcher.process_data(&agent, &plaintext)?;
        self.deliver_processed(processed);

        // Stage batches for agents reached through this one before packing
        self.stage_pivot_batches(agent_id)?;
        self.dispatcher.pack_tasks(&agent)
    }

    /// Push the pending batch to a persistent-connection agent through its
    /// owning listener. Polling agents are skipped; their batches ride the
    /// next check-in. The queue lock is never held across the transport
    /// call.
    pub async fn push_tasks(&self, agent_id: &str) -> Result<()> {
        let agent = self.agents.get(agent_id)?;
        if agent.is_async {
            return Ok(());
        }

        let transport = self.listeners.transport(&agent.listener)?;
        let envelope = self.dispatcher.pack_tasks(&agent)?;
        transport.send(&agent.id, &envelope).await
    }

    fn deliver_processed(&self, processed: crate::tasks::ProcessedData) {
        for message in processed.console_messages {
            self.notify_console(message);
        }
        for task in processed.unsolicited {
            if let Err(e) = self.route_frame(&task) {
                tracing::warn!(
                    task_id = %task.task_id,
                    agent_id = %task.agent_id,
                    error = %e,
                    "Dropped unroutable agent frame"
                );
            }
        }
    }

    /// Agent-initiated records: tunnel channel traffic, terminal output,
    /// and relayed child responses.
    fn route_frame(&self, task: &TaskData) -> Result<()> {
        match TaskType::from_i32(task.task_type) {
            Some(TaskType::Tunnel) => self.route_tunnel_frame(task),
            Some(TaskType::Job) => self.route_terminal_frame(task),
            Some(TaskType::ProxyData) => self.route_pivot_frame(task),
            _ => Err(NocturneError::MalformedRecord(format!(
                "unroutable task type {}",
                task.task_type
            ))),
        }
    }

    fn route_tunnel_frame(&self, task: &TaskData) -> Result<()> {
        let frame: TunnelFrame = serde_json::from_slice(&task.data)
            .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;

        match frame.command.as_str() {
            // SOCKS code rides as the single byte of the frame payload
            "reply" => {
                let code = frame.data.first().copied().unwrap_or(1);
                self.tunnels.process_reply(frame.channel_id, code)?;
                Ok(())
            }
            "data" => self.tunnels.process_data_frame(frame.channel_id, frame.data),
            "close" => {
                self.tunnels.acknowledge_close(frame.channel_id);
                Ok(())
            }
            "accept" => {
                let tunnel_id = &task.handler_id;
                let events = self.tunnels.accept_reverse(tunnel_id, frame.channel_id)?;
                if let Some(acceptor) = self.reverse_acceptors.get(tunnel_id) {
                    let _ = acceptor.send(ReverseConnection {
                        channel_id: frame.channel_id,
                        events,
                    });
                }
                Ok(())
            }
            other => Err(NocturneError::MalformedRecord(format!(
                "unknown tunnel frame command {}",
                other
            ))),
        }
    }

    fn route_terminal_frame(&self, task: &TaskData) -> Result<()> {
        let frame: crate::terminal::TerminalFrame = serde_json::from_slice(&task.data)
            .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;

        match frame.command.as_str() {
            "output" => self.terminals.process_output(frame.terminal_id, frame.data),
            "closed" => {
                self.terminals.acknowledge_close(frame.terminal_id);
                Ok(())
            }
            other => Err(NocturneError::MalformedRecord(format!(
                "unknown terminal frame command {}",
                other
            ))),
        }
    }

    /// A relayed response from a child agent, carried up by its parent.
    /// Each hop keeps its own trust boundary: the blob opens only with the
    /// child's key.
    fn route_pivot_frame(&self, task: &TaskData) -> Result<()> {
        let edge = self
            .pivots
            .edge(&task.hook_id)
            .ok_or_else(|| NocturneError::UnknownPivot(task.hook_id.clone()))?;

        let child = self.agents.get(&edge.child_agent_id)?;
        let plaintext = crypto::open(&task.data, &child.session_key)?;
        self.agents.checkin(&child.id, None)?;

        let processed = self.dispatcher.process_data(&child, &plaintext)?;
        self.deliver_processed(processed);
        Ok(())
    }

    /// Pack pending work for every agent relayed through `agent_id`,
    /// deepest hops first so a grandchild's batch rides inside its own
    /// parent's batch.
    fn stage_pivot_batches(&self, agent_id: &str) -> Result<()> {
        for edge in self.pivots.children_of(agent_id) {
            self.stage_pivot_batches(&edge.child_agent_id)?;

            if self.dispatcher.pending_count(&edge.child_agent_id) == 0 {
                continue;
            }
            let plain = self.dispatcher.pack_plain(&edge.child_agent_id)?;
            if plain.is_empty() {
                continue;
            }
            match self.pivots.pack_data(&edge.pivot_id, &plain, &self.agents) {
                Ok(task) => self.dispatcher.enqueue(task),
                // The edge died between listing and packing; that hop is
                // simply dead, siblings are unaffected
                Err(NocturneError::UnknownPivot(_)) => {
                    tracing::warn!(pivot_id = %edge.pivot_id, "Pivot hop vanished while staging");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ---- tunnels ----

    pub fn create_tunnel(&self, data: TunnelData) -> Result<TunnelData> {
        self.agents.get(&data.agent_id)?;
        self.tunnels.register_tunnel(data.clone());
        Ok(data)
    }

    pub fn remove_tunnel(&self, tunnel_id: &str) {
        self.reverse_acceptors.remove(tunnel_id);
        self.tunnels.remove_tunnel(tunnel_id);
    }

    /// Dispatch a tunnel operation and queue the resulting task for the
    /// owning agent. Connects hand back the channel's event stream.
    pub fn tunnel_command(
        &self,
        tunnel_id: &str,
        command: TunnelCommand,
    ) -> Result<Option<mpsc::UnboundedReceiver<TunnelEvent>>> {
        let (task, events) = self.tunnels.handle(tunnel_id, command)?;
        self.dispatcher.enqueue(task);
        Ok(events)
    }

    /// Ask the implant for a reverse listener and return the stream of
    /// accepted peer connections.
    pub fn reverse_tunnel(
        &self,
        tunnel_id: &str,
        port: u16,
    ) -> Result<mpsc::UnboundedReceiver<ReverseConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reverse_acceptors.insert(tunnel_id.to_string(), tx);

        let (task, _) = self.tunnels.handle(
            tunnel_id,
            TunnelCommand::Reverse {
                tunnel_id: tunnel_id.to_string(),
                port,
            },
        )?;
        self.dispatcher.enqueue(task);
        Ok(rx)
    }

    // ---- terminals ----

    /// Dispatch a terminal operation for an agent. Start hands back the
    /// output event stream; a redundant close queues nothing.
    pub fn terminal_command(
        &self,
        agent_id: &str,
        command: TerminalCommand,
    ) -> Result<Option<mpsc::UnboundedReceiver<TerminalEvent>>> {
        self.agents.get(agent_id)?;
        let (task, events) = self.terminals.handle(agent_id, command)?;
        if let Some(task) = task {
            self.dispatcher.enqueue(task);
        }
        Ok(events)
    }

    // ---- pivots ----

    pub fn add_pivot(&self, edge: crate::protocol::types::PivotData) -> Result<()> {
        self.agents.get(&edge.parent_agent_id)?;
        self.agents.get(&edge.child_agent_id)?;
        self.pivots.add_edge(edge)
    }

    pub fn remove_pivot(&self, pivot_id: &str) -> Result<()> {
        self.pivots.remove_edge(pivot_id)?;
        Ok(())
    }

    /// Re-pack an already-unwrapped blob for the next hop and queue it on
    /// the parent.
    pub fn pivot_pack_data(&self, pivot_id: &str, data: &[u8]) -> Result<TaskData> {
        let task = self.pivots.pack_data(pivot_id, data, &self.agents)?;
        self.dispatcher.enqueue(task.clone());
        Ok(task)
    }

    // ---- lifecycle ----

    pub fn statistics(&self) -> TeamserverStatistics {
        TeamserverStatistics {
            agents: self.agents.count(),
            listeners: self.listeners.count(),
            pivots: self.pivots.count(),
            tunnel_channels: self.tunnels.channel_count(),
            terminals: self.terminals.terminal_count(),
            dispatcher: self.dispatcher.statistics(),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Starting Nocturne teamserver core");

        let sweeper = self.clone();
        let sweep_interval = Duration::from_secs(self.config.maintenance.sweep_interval_seconds);
        let archive_after = Duration::from_secs(self.config.maintenance.archive_after_seconds as u64);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let archived = sweeper.dispatcher.archive_sweep(archive_after);
                if archived > 0 {
                    tracing::info!(archived = archived, "Archived completed tasks");
                }
                let stats = sweeper.statistics();
                tracing::debug!(
                    agents = stats.agents,
                    listeners = stats.listeners,
                    pending = stats.dispatcher.pending_tasks,
                    outstanding = stats.dispatcher.outstanding_tasks,
                    orphans = stats.dispatcher.orphan_responses,
                    "Engine statistics"
                );
            }
        });

        signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TeamserverStatistics {
    pub agents: usize,
    pub listeners: usize,
    pub pivots: usize,
    pub tunnel_channels: usize,
    pub terminals: usize,
    pub dispatcher: crate::tasks::DispatcherStatistics,
}
