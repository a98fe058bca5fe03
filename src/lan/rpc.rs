use serde::{Deserialize, Serialize};

/// Error code sent when the peer speaks another protocol version.
pub const ERR_VERSION_MISMATCH: u32 = 1;
/// Error code for a message that is not valid in the current state.
pub const ERR_UNEXPECTED_MESSAGE: u32 = 2;

/// Control messages of the LAN speed protocol, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LanMessage {
    Hello {
        version: u32,
        client_name: String,
    },
    Ready {
        version: u32,
        server_name: String,
        host_id: String,
    },
    /// `send_time_us` is on the sender's clock and echoed back untouched.
    Ping {
        seq: u32,
        send_time_us: u64,
    },
    Pong {
        seq: u32,
        send_time_us: u64,
    },
    StartDownload {
        duration_ms: u64,
        max_bytes: u64,
        chunk_size: u32,
    },
    DownloadDone {
        bytes_sent: u64,
    },
    StartUpload {
        duration_ms: u64,
        max_bytes: u64,
    },
    UploadDone {
        bytes_sent: u64,
    },
    UploadAck {
        bytes_received: u64,
    },
    Bye,
    Error {
        code: u32,
        message: String,
    },
}

impl LanMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            LanMessage::Hello { .. } => "hello",
            LanMessage::Ready { .. } => "ready",
            LanMessage::Ping { .. } => "ping",
            LanMessage::Pong { .. } => "pong",
            LanMessage::StartDownload { .. } => "start_download",
            LanMessage::DownloadDone { .. } => "download_done",
            LanMessage::StartUpload { .. } => "start_upload",
            LanMessage::UploadDone { .. } => "upload_done",
            LanMessage::UploadAck { .. } => "upload_ack",
            LanMessage::Bye => "bye",
            LanMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(LanMessage::Ping {
            seq: 3,
            send_time_us: 1500,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "seq": 3, "send_time_us": 1500}));

        let json = serde_json::to_value(LanMessage::Bye).unwrap();
        assert_eq!(json, serde_json::json!({"type": "bye"}));
    }

    #[test]
    fn test_parse_start_download() {
        let msg: LanMessage = serde_json::from_str(
            r#"{"type":"start_download","duration_ms":5000,"max_bytes":268435456,"chunk_size":65536}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            LanMessage::StartDownload {
                duration_ms: 5000,
                max_bytes: 268_435_456,
                chunk_size: 65536,
            }
        );
        assert_eq!(msg.name(), "start_download");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<LanMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
