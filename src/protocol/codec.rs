use crate::protocol::types::{ConsoleMessageData, TaskData};
use crate::{NocturneError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Record kind discriminators on the wire.
const KIND_TASK: u8 = 1;
const KIND_CONSOLE: u8 = 2;

/// Upper bound on a single record body. Matches the task payload limit so a
/// corrupt length field cannot make the decoder swallow the transport.
const MAX_RECORD_SIZE: usize = 10 * 1024 * 1024;

/// Header: kind byte + u32-le body length.
const HEADER_LEN: usize = 5;

/// One decoded record from an envelope. A single envelope may carry zero,
/// one, or many concatenated records.
#[derive(Debug, Clone)]
pub enum Frame {
    Task(TaskData),
    Console(ConsoleMessageData),
}

/// Serialize a single record into `buf`.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    let (kind, body) = match frame {
        Frame::Task(task) => (KIND_TASK, serde_json::to_vec(task)),
        Frame::Console(msg) => (KIND_CONSOLE, serde_json::to_vec(msg)),
    };
    let body = body.map_err(|e| NocturneError::MalformedRecord(e.to_string()))?;

    buf.put_u8(kind);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

pub fn encode_task(task: &TaskData, buf: &mut BytesMut) -> Result<()> {
    encode_frame(&Frame::Task(task.clone()), buf)
}

/// Decode one record from the front of `input`, reporting how many bytes
/// were consumed. Callers loop until the buffer is exhausted.
pub fn decode_frame(input: &[u8]) -> Result<(Frame, usize)> {
    if input.len() < HEADER_LEN {
        return Err(NocturneError::MalformedRecord(format!(
            "truncated header: {} bytes",
            input.len()
        )));
    }

    let mut header = &input[..HEADER_LEN];
    let kind = header.get_u8();
    let body_len = header.get_u32_le() as usize;

    if body_len > MAX_RECORD_SIZE {
        return Err(NocturneError::MalformedRecord(format!(
            "record length {} exceeds limit",
            body_len
        )));
    }
    if input.len() < HEADER_LEN + body_len {
        return Err(NocturneError::MalformedRecord(format!(
            "record length {} but only {} bytes remain",
            body_len,
            input.len() - HEADER_LEN
        )));
    }

    let body = &input[HEADER_LEN..HEADER_LEN + body_len];
    let frame = match kind {
        KIND_TASK => Frame::Task(
            serde_json::from_slice(body)
                .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?,
        ),
        KIND_CONSOLE => Frame::Console(
            serde_json::from_slice(body)
                .map_err(|e| NocturneError::MalformedRecord(e.to_string()))?,
        ),
        other => {
            return Err(NocturneError::MalformedRecord(format!(
                "unknown record kind {}",
                other
            )))
        }
    };

    Ok((frame, HEADER_LEN + body_len))
}

/// Decode every record in `input`. Any malformed record discards the whole
/// buffer: a partial agent reply is safer to drop than to misinterpret.
pub fn decode_all(input: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < input.len() {
        let (frame, consumed) = decode_frame(&input[offset..])?;
        frames.push(frame);
        offset += consumed;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::TaskType;

    fn sample_task() -> TaskData {
        let mut task = TaskData::new(TaskType::Task, "agent-1");
        task.client = "operator".to_string();
        task.command_line = "ls -la".to_string();
        task.data = b"payload bytes".to_vec();
        task.sync = true;
        task
    }

    #[test]
    fn round_trip_single_task() {
        let task = sample_task();
        let mut buf = BytesMut::new();
        encode_task(&task, &mut buf).unwrap();

        let (frame, consumed) = decode_frame(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        match frame {
            Frame::Task(decoded) => {
                assert_eq!(decoded.task_id, task.task_id);
                assert_eq!(decoded.agent_id, task.agent_id);
                assert_eq!(decoded.command_line, task.command_line);
                assert_eq!(decoded.data, task.data);
                assert_eq!(decoded.sync, task.sync);
                assert_eq!(decoded.start_date, task.start_date);
            }
            other => panic!("expected task frame, got {:?}", other),
        }
    }

    #[test]
    fn streaming_decode_of_batched_records() {
        let mut buf = BytesMut::new();
        for _ in 0..3 {
            encode_task(&sample_task(), &mut buf).unwrap();
        }
        encode_frame(
            &Frame::Console(crate::protocol::types::ConsoleMessageData::info("done")),
            &mut buf,
        )
        .unwrap();

        let frames = decode_all(&buf).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[3], Frame::Console(_)));
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_length_field_is_malformed() {
        let mut buf = BytesMut::new();
        encode_task(&sample_task(), &mut buf).unwrap();
        let truncated = &buf[..buf.len() - 1];

        match decode_all(truncated) {
            Err(NocturneError::MalformedRecord(_)) => {}
            other => panic!("expected MalformedRecord, got {:?}", other),
        }
    }

    #[test]
    fn inconsistent_length_discards_buffer() {
        // Claims a 100-byte body but carries only 3
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32_le(100);
        buf.put_slice(b"abc");

        assert!(matches!(
            decode_frame(&buf),
            Err(NocturneError::MalformedRecord(_))
        ));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        buf.put_u32_le(2);
        buf.put_slice(b"{}");

        assert!(matches!(
            decode_frame(&buf),
            Err(NocturneError::MalformedRecord(_))
        ));
    }
}
