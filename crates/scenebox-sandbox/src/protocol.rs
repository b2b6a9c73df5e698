//! Message channel vocabulary and the frame codec used by process-backed contexts.
//!
//! Guest → host traffic is a fixed set of [`GuestMessage`]s. In-process contexts
//! hand them over an mpsc channel; worker processes wrap them in [`WorkerFrame`]s
//! and write them as length-delimited JSON: a 4-byte big-endian length prefix
//! followed by the JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::document::BootstrapDocument;
use crate::error::ErrorCode;
use crate::scene::graph::MAX_SCENE_DEPTH;
use crate::transport::{NetworkRequest, NetworkResponse};

/// Default maximum frame size: 64 MB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Deepest JSON nesting a frame may carry.
///
/// A snapshot object costs two levels per scene level (the object and its
/// `children` array), plus a fixed envelope around the snapshot root.
pub const MAX_FRAME_DEPTH: usize = 2 * MAX_SCENE_DEPTH + 16;

/// Severity of a mirrored guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a console method name onto a level. Unknown names log at info.
    pub fn from_console(method: &str) -> Self {
        match method {
            "debug" | "trace" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One diagnostics line, tagged with the time elapsed since guest boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Which trigger won the completion race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportReason {
    Idle,
    Timeout,
    FirstRender,
    Manual,
}

impl ExportReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Timeout => "timeout",
            Self::FirstRender => "first-render",
            Self::Manual => "manual",
        }
    }
}

/// Outbound primitive that initiated a network attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkChannel {
    Fetch,
    Xhr,
    WebSocket,
    EventSource,
    Beacon,
    Script,
    Asset,
}

impl NetworkChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Xhr => "xhr",
            Self::WebSocket => "websocket",
            Self::EventSource => "eventsource",
            Self::Beacon => "beacon",
            Self::Script => "script",
            Self::Asset => "asset",
        }
    }

    /// Parse the channel name used by the guest-runtime bootstrap.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "fetch" => Self::Fetch,
            "xhr" => Self::Xhr,
            "websocket" => Self::WebSocket,
            "eventsource" => Self::EventSource,
            "beacon" => Self::Beacon,
            "script" => Self::Script,
            "asset" => Self::Asset,
            _ => return None,
        })
    }
}

/// Summary attached to a successful `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// Number of nodes in the exported (stripped and deduplicated) graph.
    pub object_count: usize,
    /// Time spent in the export pipeline.
    pub duration_ms: u64,
    pub reason: ExportReason,
    /// Network attempts the guest made before settling.
    pub network_requests: u32,
}

/// Guest → host message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GuestMessage {
    /// Guest runtime initialized.
    #[serde(rename = "boot", rename_all = "camelCase")]
    Boot { file_name: String },

    /// Diagnostics mirror.
    #[serde(rename = "log")]
    Log(LogEntry),

    /// Network guard rejection. Terminal.
    #[serde(rename = "policyViolation")]
    PolicyViolation {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<NetworkChannel>,
    },

    /// Terminal failure.
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default)]
        detail: Map<String, Value>,
    },

    /// Primary success payload.
    #[serde(rename = "result", rename_all = "camelCase")]
    Result {
        scene_snapshot: Value,
        summary: ExportSummary,
    },

    /// Exported binary bundle.
    #[serde(rename = "binary-asset", rename_all = "camelCase")]
    BinaryAsset {
        byte_length: usize,
        #[serde(with = "base64_bytes")]
        buffer: Vec<u8>,
    },

    /// Preview raster (RGBA8).
    #[serde(rename = "thumbnail")]
    Thumbnail {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
}

impl GuestMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Boot { .. } => "boot",
            Self::Log(_) => "log",
            Self::PolicyViolation { .. } => "policyViolation",
            Self::Error { .. } => "error",
            Self::Result { .. } => "result",
            Self::BinaryAsset { .. } => "binary-asset",
            Self::Thumbnail { .. } => "thumbnail",
        }
    }

    /// Whether this message settles the conversion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PolicyViolation { .. } | Self::Error { .. } | Self::Result { .. }
        )
    }
}

/// Limits forwarded to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Whether the `SCENE` engine is installed for the guest.
    #[serde(default = "default_provide_engine")]
    pub provide_engine: bool,
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_provide_engine() -> bool {
    true
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            max_heap_size: config.max_heap_size,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            provide_engine: config.provide_engine,
        }
    }
}

/// Frames sent from the host to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostFrame {
    /// Initial frame: run this document.
    Start {
        document: BootstrapDocument,
        config: WorkerConfig,
    },
    /// Response to a proxied network request.
    FetchResult {
        request_id: u64,
        result: Result<NetworkResponse, String>,
    },
}

/// Frames sent from a worker process to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerFrame {
    /// A message-channel message produced by the guest runtime.
    Guest { message: GuestMessage },
    /// The guard admitted a request; the host performs it.
    FetchRequest {
        request_id: u64,
        request: NetworkRequest,
    },
}

/// Write a length-delimited JSON frame to an async writer.
pub async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON frame using [`DEFAULT_MAX_FRAME_SIZE`].
///
/// Returns `None` on clean EOF.
pub async fn read_frame<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_frame_with_limit(reader, DEFAULT_MAX_FRAME_SIZE).await
}

/// Read a length-delimited JSON frame, rejecting anything above `max_size` bytes.
///
/// Returns `None` on clean EOF.
pub async fn read_frame_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (limit: {} bytes)", len, max_size),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let depth = nesting_depth(&payload);
    if depth > MAX_FRAME_DEPTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame nests {depth} levels deep (limit: {MAX_FRAME_DEPTH})"),
        ));
    }

    // Nesting is bounded by the scan above.
    let invalid = |e: serde_json::Error| std::io::Error::new(std::io::ErrorKind::InvalidData, e);
    let mut de = serde_json::Deserializer::from_slice(&payload);
    de.disable_recursion_limit();
    let frame = T::deserialize(&mut de).map_err(invalid)?;
    de.end().map_err(invalid)?;
    Ok(Some(frame))
}

/// Deepest `{`/`[` nesting in a JSON text, ignoring brackets inside strings.
fn nesting_depth(json: &[u8]) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    let mut in_string = false;
    let mut escaped = false;
    for &b in json {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max = max.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Serde adapter carrying byte buffers as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
