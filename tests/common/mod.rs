//! Shared test fixtures: a scripted in-memory provider and a socket-backed
//! variant of it for end-to-end tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixListener;

use svcgate::provider::{ForwardError, ForwardingConnection, ProviderChannel, ProviderConnector};
use svcgate::proxy::protocol::{
    self, Attach, CallFrame, EndpointDescriptor, InterfaceRecord, ObjectId, Reply, ReplyFrame,
    Request, ResultCode, TransferReport, DEFAULT_FRAME_LIMIT,
};
use svcgate::proxy::session::{ClientIdentity, Session};

pub fn bulk_out_descriptor() -> EndpointDescriptor {
    EndpointDescriptor {
        length: 7,
        descriptor_type: 5,
        endpoint_address: 0x01,
        attributes: 2,
        max_packet_size: 512,
        interval: 0,
    }
}

pub fn test_identity() -> ClientIdentity {
    ClientIdentity { process_id: 0x42, program_id: 0x0100_0000_0000_1234 }
}

/// Scripted behavior of the fake provider plus a record of everything the
/// proxy forwarded to it. Shared across all channels derived from one
/// provider instance.
#[derive(Default)]
pub struct ProviderScript {
    /// Identities handed out for `AcquireInterface`, in order. Falls back to
    /// a counter when exhausted.
    pub interface_identities: Mutex<VecDeque<ObjectId>>,
    /// Identity and descriptor pairs handed out for `OpenEndpoint`.
    pub endpoint_mints: Mutex<VecDeque<(ObjectId, EndpointDescriptor)>>,
    /// Transfer ids for `PostBuffer` / `BatchBuffer`.
    pub transfer_ids: Mutex<VecDeque<u32>>,
    /// Records returned by the interface queries.
    pub interface_records: Mutex<Vec<InterfaceRecord>>,
    /// Reports returned by the transfer-report operations.
    pub reports: Mutex<Vec<TransferReport>>,
    /// When set, the next call fails with this code (taken once).
    pub fail_next: Mutex<Option<ResultCode>>,
    /// Every forwarded call: the channel's bound object (None for root) and
    /// the frame exactly as received.
    pub forwarded: Mutex<Vec<(Option<ObjectId>, CallFrame)>>,
    /// Channel shutdown order, by bound object (None for root).
    pub close_order: Mutex<Vec<Option<ObjectId>>>,
    fallback_identity: AtomicU64,
    event_handles: AtomicU64,
}

impl ProviderScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fallback_identity: AtomicU64::new(0x1000),
            event_handles: AtomicU64::new(0x9000),
            ..Default::default()
        })
    }

    pub fn script_interface(&self, identity: ObjectId) {
        self.interface_identities.lock().push_back(identity);
    }

    pub fn script_endpoint(&self, identity: ObjectId, descriptor: EndpointDescriptor) {
        self.endpoint_mints.lock().push_back((identity, descriptor));
    }

    pub fn script_transfer_id(&self, id: u32) {
        self.transfer_ids.lock().push_back(id);
    }

    pub fn fail_next_with(&self, code: ResultCode) {
        *self.fail_next.lock() = Some(code);
    }

    pub fn close_count(&self) -> usize {
        self.close_order.lock().len()
    }

    fn next_identity(&self) -> ObjectId {
        ObjectId(self.fallback_identity.fetch_add(1, Ordering::Relaxed))
    }

    fn next_event_handle(&self) -> u64 {
        self.event_handles.fetch_add(1, Ordering::Relaxed)
    }

    /// Answer one forwarded call the way the scripted provider would.
    pub fn reply_for(&self, target: Option<ObjectId>, frame: &CallFrame) -> ReplyFrame {
        self.forwarded.lock().push((target, frame.clone()));

        if let Some(code) = self.fail_next.lock().take() {
            return ReplyFrame::failure(code);
        }

        let reply = match &frame.request {
            Request::AcquireInterface { .. } => {
                let identity = self
                    .interface_identities
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| self.next_identity());
                Reply::InterfaceAcquired { identity, info: vec![0xAA, 0xBB] }
            }
            Request::OpenEndpoint { .. } => {
                let (identity, descriptor) = self
                    .endpoint_mints
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| (self.next_identity(), bulk_out_descriptor()));
                Reply::EndpointOpened { identity, descriptor }
            }
            Request::QueryAllInterfaces { .. }
            | Request::QueryAvailableInterfaces { .. }
            | Request::QueryAcquiredInterfaces { .. } => {
                let records = self.interface_records.lock().clone();
                Reply::Interfaces { total: records.len() as i32, records }
            }
            Request::GetInterfaceStateChangeEvent
            | Request::CreateInterfaceAvailableEvent { .. }
            | Request::GetStateChangeEvent
            | Request::GetCtrlTransferCompletionEvent
            | Request::GetCompletionEvent => {
                Reply::EventHandle { handle: self.next_event_handle() }
            }
            Request::SetInterface { .. }
            | Request::GetInterface
            | Request::GetAlternateInterface { .. } => {
                Reply::InterfaceInfo { info: vec![0x09, 0x04, 0x00] }
            }
            Request::GetCurrentFrame => Reply::CurrentFrame { frame: 0x1234 },
            Request::PostBuffer { .. } | Request::BatchBuffer { .. } => {
                let transfer_id = self.transfer_ids.lock().pop_front().unwrap_or(1);
                Reply::TransferSubmitted { transfer_id }
            }
            Request::GetTransferReport { .. } | Request::GetCtrlTransferReport => {
                let reports = self.reports.lock().clone();
                Reply::TransferReports { count: reports.len() as u32, reports }
            }
            Request::SetTestMode { .. } => Reply::TestMode { value: 0 },
            Request::BindClientProcess { .. }
            | Request::DestroyInterfaceAvailableEvent { .. }
            | Request::CtrlTransfer { .. }
            | Request::ResetDevice
            | Request::Reopen
            | Request::Close
            | Request::PopulateRing
            | Request::CreateSmmuSpace { .. }
            | Request::ShareReportRing { .. } => Reply::Ack,
        };
        ReplyFrame::success(reply)
    }
}

/// In-memory channel bound to one provider-side object.
pub struct FakeChannel {
    script: Arc<ProviderScript>,
    target: Option<ObjectId>,
    shut: bool,
}

impl FakeChannel {
    pub fn root(script: Arc<ProviderScript>) -> Self {
        Self { script, target: None, shut: false }
    }
}

#[async_trait]
impl ProviderChannel for FakeChannel {
    async fn round_trip(&mut self, frame: &CallFrame) -> Result<ReplyFrame, ForwardError> {
        Ok(self.script.reply_for(self.target, frame))
    }

    async fn open_child(
        &mut self,
        object: ObjectId,
    ) -> Result<Box<dyn ProviderChannel>, ForwardError> {
        Ok(Box::new(FakeChannel {
            script: Arc::clone(&self.script),
            target: Some(object),
            shut: false,
        }))
    }

    async fn shutdown(&mut self) -> Result<(), ForwardError> {
        assert!(!self.shut, "channel shut down twice");
        self.shut = true;
        self.script.close_order.lock().push(self.target);
        Ok(())
    }
}

/// Connector that hands out in-memory root channels against one script.
pub struct FakeConnector {
    script: Arc<ProviderScript>,
}

impl FakeConnector {
    pub fn new(script: Arc<ProviderScript>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect_root(&self, _port: &str) -> Result<ForwardingConnection, ForwardError> {
        Ok(ForwardingConnection::new(Box::new(FakeChannel::root(Arc::clone(&self.script)))))
    }
}

/// Build a session directly on an in-memory root connection.
pub fn scripted_session(script: &Arc<ProviderScript>) -> Session {
    let root = ForwardingConnection::new(Box::new(FakeChannel::root(Arc::clone(script))));
    Session::new(test_identity(), "usb:hs".to_string(), root)
}

/// Serve the scripted provider over a Unix socket: each accepted connection
/// opens with an [`Attach`] preamble and is answered from the script until
/// the peer disconnects.
pub async fn run_socket_provider(listener: UnixListener, script: Arc<ProviderScript>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let script = Arc::clone(&script);
        tokio::spawn(async move {
            let attach = match protocol::read_frame(&mut stream, DEFAULT_FRAME_LIMIT).await {
                Ok(Some(bytes)) => {
                    match protocol::decode::<Attach>(&bytes, DEFAULT_FRAME_LIMIT) {
                        Ok(attach) => attach,
                        Err(_) => return,
                    }
                }
                _ => return,
            };
            let ack = protocol::encode(&ReplyFrame::success(Reply::Ack), DEFAULT_FRAME_LIMIT)
                .unwrap();
            if protocol::write_frame(&mut stream, &ack).await.is_err() {
                return;
            }

            loop {
                let bytes = match protocol::read_frame(&mut stream, DEFAULT_FRAME_LIMIT).await {
                    Ok(Some(bytes)) => bytes,
                    _ => break,
                };
                let frame: CallFrame = match protocol::decode(&bytes, DEFAULT_FRAME_LIMIT) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let reply = script.reply_for(attach.object, &frame);
                let out = protocol::encode(&reply, DEFAULT_FRAME_LIMIT).unwrap();
                if protocol::write_frame(&mut stream, &out).await.is_err() {
                    break;
                }
            }
            script.close_order.lock().push(attach.object);
        });
    }
}
