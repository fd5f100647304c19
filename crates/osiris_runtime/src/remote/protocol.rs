//! The proxy ↔ worker wire protocol.
//!
//! Frame format: [4 bytes u32 BE length][JSON payload bytes]. Three frame
//! shapes flow over it:
//! - host → worker requests `{id, kind, payload}`
//! - worker → host responses `{id, ok, result | error}`
//! - worker → host unsolicited `{kind: event|metric|heartbeat, payload}`
//!
//! Classification is structural: a frame with an `ok` field is a response,
//! anything else must be an unsolicited kind.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RemoteError;

/// Hard cap on a single frame; anything larger is a protocol error, not an
/// allocation request.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub const CMD_PREPARE: &str = "prepare";
pub const CMD_EXEC_STEP: &str = "exec_step";
pub const CMD_GET_ARTIFACT: &str = "get_artifact";
pub const CMD_CANCEL: &str = "cancel";
pub const CMD_SHUTDOWN: &str = "shutdown";

pub const UNSOLICITED_EVENT: &str = "event";
pub const UNSOLICITED_METRIC: &str = "metric";
pub const UNSOLICITED_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Response { id, ok: true, result: Some(result), error: None }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Response { id, ok: false, result: None, error: Some(error.into()) }
    }
}

/// A worker→host frame after classification.
#[derive(Debug, Clone)]
pub enum WorkerFrame {
    Response(Response),
    Unsolicited { kind: String, payload: Value },
}

pub fn classify_worker_frame(v: Value) -> Result<WorkerFrame, RemoteError> {
    if v.get("ok").is_some() {
        let response: Response = serde_json::from_value(v)
            .map_err(|e| RemoteError::WorkerProtocol(format!("bad response frame: {e}")))?;
        return Ok(WorkerFrame::Response(response));
    }
    let kind = v
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::WorkerProtocol("frame has neither 'ok' nor 'kind'".into()))?;
    match kind {
        UNSOLICITED_EVENT | UNSOLICITED_METRIC | UNSOLICITED_HEARTBEAT => Ok(WorkerFrame::Unsolicited {
            kind: kind.to_owned(),
            payload: v.get("payload").cloned().unwrap_or(Value::Null),
        }),
        other => Err(RemoteError::WorkerProtocol(format!("unknown unsolicited kind: {other}"))),
    }
}

/// Write one length-prefixed frame and flush it (frames are the flush unit).
pub fn write_frame<W: Write>(w: &mut W, v: &Value) -> std::io::Result<()> {
    let payload = serde_json::to_vec(v)?;
    let length = payload.len() as u32;
    w.write_all(&length.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Read one frame. `Ok(None)` means clean EOF at a frame boundary; EOF
/// mid-frame is a transport error.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Value>, RemoteError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RemoteError::RemoteTransportLost(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RemoteError::WorkerProtocol(format!("frame of {len} bytes exceeds cap")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .map_err(|e| RemoteError::RemoteTransportLost(format!("truncated frame: {e}")))?;
    serde_json::from_slice(&payload)
        .map_err(|e| RemoteError::WorkerProtocol(format!("frame is not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        let v = json!({"id": 1, "kind": "prepare", "payload": {}});
        write_frame(&mut buf, &v).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(v));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn truncated_frame_is_transport_loss() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"a": 1})).unwrap();
        buf.truncate(buf.len() - 1);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(RemoteError::RemoteTransportLost(_))
        ));
    }

    #[test]
    fn classification() {
        let resp = classify_worker_frame(json!({"id": 3, "ok": true, "result": {"x": 1}})).unwrap();
        assert!(matches!(resp, WorkerFrame::Response(Response { id: 3, ok: true, .. })));

        let beat = classify_worker_frame(json!({"kind": "heartbeat", "payload": {}})).unwrap();
        assert!(matches!(beat, WorkerFrame::Unsolicited { ref kind, .. } if kind == "heartbeat"));

        assert!(classify_worker_frame(json!({"kind": "mystery"})).is_err());
        assert!(classify_worker_frame(json!({"neither": true})).is_err());
    }
}
