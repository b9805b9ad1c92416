//! Wire format for intercepted calls.
//!
//! The proxy speaks the same protocol on both legs: frames arriving from a
//! client are decoded, forwarded to the real provider, and the provider's
//! reply is re-encoded for the client. Because the encoding is deterministic,
//! a forwarded frame is byte-identical to the one the client sent.
//!
//! Frames are a u32 little-endian length prefix followed by a JSON payload.
//! The length is checked against the frame limit before any allocation.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling for a single frame. Overridable via configuration.
pub const DEFAULT_FRAME_LIMIT: usize = 1024 * 1024; // 1 MiB

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Correlation token identifying one callable object.
///
/// For every object the proxy exposes, this value equals the identity the
/// real provider assigned to its own matching object. Request routing keys
/// off identity equality, so the two must never diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Addresses the root facade of a session.
    pub const ROOT: ObjectId = ObjectId(0);

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Operation result code.
///
/// Codes produced by the real provider are relayed byte-for-byte and never
/// reinterpreted. The proxy reports its own failures in a reserved
/// `0xFFFF_xxxx` band so they cannot shadow a provider code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    /// Proxy-internal defect (registry collision, codec failure on the
    /// provider leg).
    pub const INTERNAL: ResultCode = ResultCode(0xFFFF_0001);
    /// The addressed object is unknown or not owned by the calling session.
    pub const INVALID_OBJECT: ResultCode = ResultCode(0xFFFF_0002);
    /// The frame could not be decoded, or the operation is not part of the
    /// addressed object's call surface.
    pub const MALFORMED: ResultCode = ResultCode(0xFFFF_0003);
    /// Session construction failed (port at capacity, provider unreachable).
    pub const REJECTED: ResultCode = ResultCode(0xFFFF_0004);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Interface enumeration filter. Field layout mirrors the intercepted
/// service; the proxy passes it through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceFilter {
    pub flags: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_min: u16,
    pub device_max: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

/// One enumerated interface. The payload is an opaque descriptor blob the
/// proxy copies verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub interface_id: u32,
    pub data: Vec<u8>,
}

/// Endpoint descriptor returned when an endpoint is opened, cached on the
/// registry entry that serves the minted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Completion report for a previously submitted transfer. The provider keys
/// these by the transfer id it assigned; the proxy relays them unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub transfer_id: u32,
    pub requested_size: u32,
    pub transferred_size: u32,
    pub result: u32,
}

/// First frame a client sends after connecting to a port. The broker accept
/// contract concretized: program identity rides along for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHello {
    pub program_id: u64,
}

/// Preamble the proxy sends when dialing the real provider: attach this
/// connection to the named port (root) or to an existing sub-object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attach {
    pub port: String,
    pub object: Option<ObjectId>,
}

/// Every operation of the intercepted call surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    // Root facade.
    #[serde(rename = "bind_client_process")]
    BindClientProcess { process_handle: u64 },

    #[serde(rename = "query_all_interfaces")]
    QueryAllInterfaces { filter: InterfaceFilter, capacity: u32 },

    #[serde(rename = "query_available_interfaces")]
    QueryAvailableInterfaces { filter: InterfaceFilter, capacity: u32 },

    #[serde(rename = "query_acquired_interfaces")]
    QueryAcquiredInterfaces { capacity: u32 },

    #[serde(rename = "create_interface_available_event")]
    CreateInterfaceAvailableEvent { index: u8, filter: InterfaceFilter },

    #[serde(rename = "destroy_interface_available_event")]
    DestroyInterfaceAvailableEvent { index: u8 },

    #[serde(rename = "get_interface_state_change_event")]
    GetInterfaceStateChangeEvent,

    #[serde(rename = "acquire_interface")]
    AcquireInterface { interface_id: u32 },

    #[serde(rename = "set_test_mode")]
    SetTestMode { a: u32, b: u32, c: u32 },

    // Interface facade.
    #[serde(rename = "get_state_change_event")]
    GetStateChangeEvent,

    #[serde(rename = "set_interface")]
    SetInterface { alt_setting: u8 },

    #[serde(rename = "get_interface")]
    GetInterface,

    #[serde(rename = "get_alternate_interface")]
    GetAlternateInterface { alt_setting: u8 },

    #[serde(rename = "get_current_frame")]
    GetCurrentFrame,

    #[serde(rename = "ctrl_transfer")]
    CtrlTransfer {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        buffer: u64,
    },

    #[serde(rename = "get_ctrl_transfer_completion_event")]
    GetCtrlTransferCompletionEvent,

    #[serde(rename = "get_ctrl_transfer_report")]
    GetCtrlTransferReport,

    #[serde(rename = "reset_device")]
    ResetDevice,

    #[serde(rename = "open_endpoint")]
    OpenEndpoint {
        max_urb_count: u16,
        endpoint_type: u32,
        endpoint_number: u32,
        direction: u32,
        max_transfer_size: u32,
    },

    // Endpoint facade.
    #[serde(rename = "reopen")]
    Reopen,

    #[serde(rename = "close")]
    Close,

    #[serde(rename = "get_completion_event")]
    GetCompletionEvent,

    #[serde(rename = "populate_ring")]
    PopulateRing,

    #[serde(rename = "post_buffer")]
    PostBuffer { size: u32, buffer: u64, id: u64 },

    #[serde(rename = "batch_buffer")]
    BatchBuffer {
        urb_count: u32,
        unk1: u32,
        unk2: u32,
        buffer: u64,
        id: u64,
        sizes: Vec<u32>,
    },

    #[serde(rename = "get_transfer_report")]
    GetTransferReport { max_reports: u32 },

    #[serde(rename = "create_smmu_space")]
    CreateSmmuSpace { size: u32, buffer: u64 },

    #[serde(rename = "share_report_ring")]
    ShareReportRing { size: u32, ring_handle: u64 },
}

impl Request {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::BindClientProcess { .. } => "bind_client_process",
            Request::QueryAllInterfaces { .. } => "query_all_interfaces",
            Request::QueryAvailableInterfaces { .. } => "query_available_interfaces",
            Request::QueryAcquiredInterfaces { .. } => "query_acquired_interfaces",
            Request::CreateInterfaceAvailableEvent { .. } => "create_interface_available_event",
            Request::DestroyInterfaceAvailableEvent { .. } => "destroy_interface_available_event",
            Request::GetInterfaceStateChangeEvent => "get_interface_state_change_event",
            Request::AcquireInterface { .. } => "acquire_interface",
            Request::SetTestMode { .. } => "set_test_mode",
            Request::GetStateChangeEvent => "get_state_change_event",
            Request::SetInterface { .. } => "set_interface",
            Request::GetInterface => "get_interface",
            Request::GetAlternateInterface { .. } => "get_alternate_interface",
            Request::GetCurrentFrame => "get_current_frame",
            Request::CtrlTransfer { .. } => "ctrl_transfer",
            Request::GetCtrlTransferCompletionEvent => "get_ctrl_transfer_completion_event",
            Request::GetCtrlTransferReport => "get_ctrl_transfer_report",
            Request::ResetDevice => "reset_device",
            Request::OpenEndpoint { .. } => "open_endpoint",
            Request::Reopen => "reopen",
            Request::Close => "close",
            Request::GetCompletionEvent => "get_completion_event",
            Request::PopulateRing => "populate_ring",
            Request::PostBuffer { .. } => "post_buffer",
            Request::BatchBuffer { .. } => "batch_buffer",
            Request::GetTransferReport { .. } => "get_transfer_report",
            Request::CreateSmmuSpace { .. } => "create_smmu_space",
            Request::ShareReportRing { .. } => "share_report_ring",
        }
    }
}

/// Reply payloads. `Empty` accompanies failure result codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply")]
pub enum Reply {
    #[serde(rename = "empty")]
    Empty,

    #[serde(rename = "ack")]
    Ack,

    #[serde(rename = "interfaces")]
    Interfaces { total: i32, records: Vec<InterfaceRecord> },

    #[serde(rename = "event_handle")]
    EventHandle { handle: u64 },

    #[serde(rename = "interface_acquired")]
    InterfaceAcquired { identity: ObjectId, info: Vec<u8> },

    #[serde(rename = "interface_info")]
    InterfaceInfo { info: Vec<u8> },

    #[serde(rename = "current_frame")]
    CurrentFrame { frame: u32 },

    #[serde(rename = "endpoint_opened")]
    EndpointOpened { identity: ObjectId, descriptor: EndpointDescriptor },

    #[serde(rename = "transfer_submitted")]
    TransferSubmitted { transfer_id: u32 },

    #[serde(rename = "transfer_reports")]
    TransferReports { count: u32, reports: Vec<TransferReport> },

    #[serde(rename = "test_mode")]
    TestMode { value: i32 },
}

impl Reply {
    /// Payload kind for diagnostics on unexpected reply shapes.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Empty => "empty",
            Reply::Ack => "ack",
            Reply::Interfaces { .. } => "interfaces",
            Reply::EventHandle { .. } => "event_handle",
            Reply::InterfaceAcquired { .. } => "interface_acquired",
            Reply::InterfaceInfo { .. } => "interface_info",
            Reply::CurrentFrame { .. } => "current_frame",
            Reply::EndpointOpened { .. } => "endpoint_opened",
            Reply::TransferSubmitted { .. } => "transfer_submitted",
            Reply::TransferReports { .. } => "transfer_reports",
            Reply::TestMode { .. } => "test_mode",
        }
    }
}

/// One call addressed to an object. `ObjectId::ROOT` targets the session's
/// root facade; anything else is routed through the object registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub object: ObjectId,
    pub request: Request,
}

/// One reply. `result` carries the provider's code verbatim on forwarded
/// failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub result: ResultCode,
    pub reply: Reply,
}

impl ReplyFrame {
    pub fn success(reply: Reply) -> Self {
        Self { result: ResultCode::SUCCESS, reply }
    }

    pub fn failure(result: ResultCode) -> Self {
        Self { result, reply: Reply::Empty }
    }
}

/// Encode a message, enforcing the frame limit.
pub fn encode<T: Serialize>(message: &T, limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > limit {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: limit });
    }
    Ok(bytes)
}

/// Decode a message. The size check runs before parsing so an oversized
/// frame never reaches the parser.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8], limit: usize) -> Result<T, ProtocolError> {
    if bytes.len() > limit {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: limit });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read one length-prefixed frame. Returns `None` on a clean EOF before the
/// header; EOF mid-frame is an error. The declared length is validated
/// against `limit` before the payload buffer is allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    limit: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { size: len, max: limit });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_frame_roundtrip() {
        let frame = CallFrame {
            object: ObjectId(0xABCD),
            request: Request::OpenEndpoint {
                max_urb_count: 4,
                endpoint_type: 2,
                endpoint_number: 1,
                direction: 0,
                max_transfer_size: 512,
            },
        };
        let bytes = encode(&frame, DEFAULT_FRAME_LIMIT).unwrap();
        let decoded: CallFrame = decode(&bytes, DEFAULT_FRAME_LIMIT).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn reencode_is_byte_identical() {
        let frame = CallFrame {
            object: ObjectId::ROOT,
            request: Request::QueryAllInterfaces {
                filter: InterfaceFilter { flags: 0x3, vendor_id: 0x57e, ..Default::default() },
                capacity: 8,
            },
        };
        let bytes = encode(&frame, DEFAULT_FRAME_LIMIT).unwrap();
        let decoded: CallFrame = decode(&bytes, DEFAULT_FRAME_LIMIT).unwrap();
        let reencoded = encode(&decoded, DEFAULT_FRAME_LIMIT).unwrap();
        assert_eq!(bytes, reencoded);
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let bytes = vec![0u8; DEFAULT_FRAME_LIMIT + 1];
        let result: Result<CallFrame, _> = decode(&bytes, DEFAULT_FRAME_LIMIT);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn encode_rejects_oversized_output() {
        let frame = ReplyFrame::success(Reply::InterfaceInfo { info: vec![0u8; 1024] });
        let result = encode(&frame, 64);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn result_code_bands() {
        assert!(ResultCode::SUCCESS.is_success());
        assert!(!ResultCode::INTERNAL.is_success());
        // Forwarded provider codes are arbitrary and must survive untouched.
        let provider = ResultCode(0x0000_2282);
        let frame = ReplyFrame::failure(provider);
        let bytes = encode(&frame, DEFAULT_FRAME_LIMIT).unwrap();
        let decoded: ReplyFrame = decode(&bytes, DEFAULT_FRAME_LIMIT).unwrap();
        assert_eq!(decoded.result, provider);
        assert_eq!(decoded.reply, Reply::Empty);
    }

    #[tokio::test]
    async fn framing_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello framing").await.unwrap();
        let received = read_frame(&mut server, DEFAULT_FRAME_LIMIT).await.unwrap().unwrap();
        assert_eq!(received, b"hello framing");
    }

    #[tokio::test]
    async fn framing_eof_before_header_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result = read_frame(&mut server, DEFAULT_FRAME_LIMIT).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn framing_rejects_oversized_declared_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (DEFAULT_FRAME_LIMIT as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len).await.unwrap();
        let result = read_frame(&mut server, DEFAULT_FRAME_LIMIT).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn framing_multiple_messages_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"second").await.unwrap();
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"second");
    }
}
