//! Synchronous client stubs against the real provider.
//!
//! One stub per forwarded operation, each a single blocking round trip over
//! the connection this client owns. Provider result codes surface unchanged
//! as [`ForwardError::Provider`]; no retries, no caching, no batching.

use crate::handle::Handle;
use crate::proxy::protocol::{
    CallFrame, EndpointDescriptor, InterfaceFilter, InterfaceRecord, ObjectId, Reply, Request,
    TransferReport,
};

use super::channel::{ForwardError, ForwardingConnection};

/// A freshly minted interface object on the provider side.
#[derive(Debug)]
pub struct MintedInterface {
    pub identity: ObjectId,
    pub info: Vec<u8>,
}

/// A freshly minted endpoint object on the provider side.
#[derive(Debug)]
pub struct MintedEndpoint {
    pub identity: ObjectId,
    pub descriptor: EndpointDescriptor,
}

/// Arguments for opening an endpoint, forwarded untouched.
#[derive(Debug, Clone, Copy)]
pub struct OpenEndpointArgs {
    pub max_urb_count: u16,
    pub endpoint_type: u32,
    pub endpoint_number: u32,
    pub direction: u32,
    pub max_transfer_size: u32,
}

/// Typed client for one remote object (root or sub-object).
pub struct ProviderClient {
    target: ObjectId,
    conn: ForwardingConnection,
}

impl ProviderClient {
    pub fn new(target: ObjectId, conn: ForwardingConnection) -> Self {
        Self { target, conn }
    }

    /// Client for the root object of a session.
    pub fn root(conn: ForwardingConnection) -> Self {
        Self::new(ObjectId::ROOT, conn)
    }

    pub fn target(&self) -> ObjectId {
        self.target
    }

    /// Derive the exclusively-owned connection for a sub-object the provider
    /// just minted.
    pub async fn open_child(&mut self, identity: ObjectId) -> Result<ForwardingConnection, ForwardError> {
        self.conn.open_child(identity).await
    }

    /// Close the underlying forwarding connection. Idempotent.
    pub async fn close_connection(&mut self) -> Result<(), ForwardError> {
        self.conn.close().await
    }

    async fn invoke(&mut self, request: Request) -> Result<Reply, ForwardError> {
        let frame = CallFrame { object: self.target, request };
        let reply = self.conn.call(&frame).await?;
        if !reply.result.is_success() {
            return Err(ForwardError::Provider(reply.result));
        }
        Ok(reply.reply)
    }

    // --- Root object ---

    pub async fn bind_client_process(&mut self, process_handle: Handle) -> Result<(), ForwardError> {
        let request = Request::BindClientProcess { process_handle: process_handle.into_raw() };
        expect_ack(self.invoke(request).await?)
    }

    pub async fn query_all_interfaces(
        &mut self,
        filter: InterfaceFilter,
        capacity: u32,
    ) -> Result<(i32, Vec<InterfaceRecord>), ForwardError> {
        expect_interfaces(self.invoke(Request::QueryAllInterfaces { filter, capacity }).await?)
    }

    pub async fn query_available_interfaces(
        &mut self,
        filter: InterfaceFilter,
        capacity: u32,
    ) -> Result<(i32, Vec<InterfaceRecord>), ForwardError> {
        expect_interfaces(
            self.invoke(Request::QueryAvailableInterfaces { filter, capacity }).await?,
        )
    }

    pub async fn query_acquired_interfaces(
        &mut self,
        capacity: u32,
    ) -> Result<(i32, Vec<InterfaceRecord>), ForwardError> {
        expect_interfaces(self.invoke(Request::QueryAcquiredInterfaces { capacity }).await?)
    }

    pub async fn create_interface_available_event(
        &mut self,
        index: u8,
        filter: InterfaceFilter,
    ) -> Result<Handle, ForwardError> {
        expect_event_handle(
            self.invoke(Request::CreateInterfaceAvailableEvent { index, filter }).await?,
        )
    }

    pub async fn destroy_interface_available_event(&mut self, index: u8) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::DestroyInterfaceAvailableEvent { index }).await?)
    }

    pub async fn get_interface_state_change_event(&mut self) -> Result<Handle, ForwardError> {
        expect_event_handle(self.invoke(Request::GetInterfaceStateChangeEvent).await?)
    }

    pub async fn acquire_interface(&mut self, interface_id: u32) -> Result<MintedInterface, ForwardError> {
        match self.invoke(Request::AcquireInterface { interface_id }).await? {
            Reply::InterfaceAcquired { identity, info } => Ok(MintedInterface { identity, info }),
            other => Err(unexpected("interface_acquired", other)),
        }
    }

    pub async fn set_test_mode(&mut self, a: u32, b: u32, c: u32) -> Result<i32, ForwardError> {
        match self.invoke(Request::SetTestMode { a, b, c }).await? {
            Reply::TestMode { value } => Ok(value),
            other => Err(unexpected("test_mode", other)),
        }
    }

    // --- Interface object ---

    pub async fn get_state_change_event(&mut self) -> Result<Handle, ForwardError> {
        expect_event_handle(self.invoke(Request::GetStateChangeEvent).await?)
    }

    pub async fn set_interface(&mut self, alt_setting: u8) -> Result<Vec<u8>, ForwardError> {
        expect_interface_info(self.invoke(Request::SetInterface { alt_setting }).await?)
    }

    pub async fn get_interface(&mut self) -> Result<Vec<u8>, ForwardError> {
        expect_interface_info(self.invoke(Request::GetInterface).await?)
    }

    pub async fn get_alternate_interface(&mut self, alt_setting: u8) -> Result<Vec<u8>, ForwardError> {
        expect_interface_info(self.invoke(Request::GetAlternateInterface { alt_setting }).await?)
    }

    pub async fn get_current_frame(&mut self) -> Result<u32, ForwardError> {
        match self.invoke(Request::GetCurrentFrame).await? {
            Reply::CurrentFrame { frame } => Ok(frame),
            other => Err(unexpected("current_frame", other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn ctrl_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        buffer: u64,
    ) -> Result<(), ForwardError> {
        let request = Request::CtrlTransfer { request_type, request, value, index, length, buffer };
        expect_ack(self.invoke(request).await?)
    }

    pub async fn get_ctrl_transfer_completion_event(&mut self) -> Result<Handle, ForwardError> {
        expect_event_handle(self.invoke(Request::GetCtrlTransferCompletionEvent).await?)
    }

    pub async fn get_ctrl_transfer_report(&mut self) -> Result<(u32, Vec<TransferReport>), ForwardError> {
        expect_transfer_reports(self.invoke(Request::GetCtrlTransferReport).await?)
    }

    pub async fn reset_device(&mut self) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::ResetDevice).await?)
    }

    pub async fn open_endpoint(&mut self, args: OpenEndpointArgs) -> Result<MintedEndpoint, ForwardError> {
        let request = Request::OpenEndpoint {
            max_urb_count: args.max_urb_count,
            endpoint_type: args.endpoint_type,
            endpoint_number: args.endpoint_number,
            direction: args.direction,
            max_transfer_size: args.max_transfer_size,
        };
        match self.invoke(request).await? {
            Reply::EndpointOpened { identity, descriptor } => {
                Ok(MintedEndpoint { identity, descriptor })
            }
            other => Err(unexpected("endpoint_opened", other)),
        }
    }

    // --- Endpoint object ---

    pub async fn reopen(&mut self) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::Reopen).await?)
    }

    /// Forward the endpoint close. Registry teardown is the dispatcher's job.
    pub async fn close(&mut self) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::Close).await?)
    }

    pub async fn get_completion_event(&mut self) -> Result<Handle, ForwardError> {
        expect_event_handle(self.invoke(Request::GetCompletionEvent).await?)
    }

    pub async fn populate_ring(&mut self) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::PopulateRing).await?)
    }

    /// Submit an async transfer. The provider-assigned transfer id is relayed
    /// verbatim; completion is reported through the completion-event path the
    /// client already holds, so nothing is tracked here.
    pub async fn post_buffer(&mut self, size: u32, buffer: u64, id: u64) -> Result<u32, ForwardError> {
        match self.invoke(Request::PostBuffer { size, buffer, id }).await? {
            Reply::TransferSubmitted { transfer_id } => Ok(transfer_id),
            other => Err(unexpected("transfer_submitted", other)),
        }
    }

    pub async fn batch_buffer(
        &mut self,
        urb_count: u32,
        unk1: u32,
        unk2: u32,
        buffer: u64,
        id: u64,
        sizes: Vec<u32>,
    ) -> Result<u32, ForwardError> {
        let request = Request::BatchBuffer { urb_count, unk1, unk2, buffer, id, sizes };
        match self.invoke(request).await? {
            Reply::TransferSubmitted { transfer_id } => Ok(transfer_id),
            other => Err(unexpected("transfer_submitted", other)),
        }
    }

    pub async fn get_transfer_report(
        &mut self,
        max_reports: u32,
    ) -> Result<(u32, Vec<TransferReport>), ForwardError> {
        expect_transfer_reports(self.invoke(Request::GetTransferReport { max_reports }).await?)
    }

    pub async fn create_smmu_space(&mut self, size: u32, buffer: u64) -> Result<(), ForwardError> {
        expect_ack(self.invoke(Request::CreateSmmuSpace { size, buffer }).await?)
    }

    pub async fn share_report_ring(&mut self, size: u32, ring_handle: Handle) -> Result<(), ForwardError> {
        let request = Request::ShareReportRing { size, ring_handle: ring_handle.into_raw() };
        expect_ack(self.invoke(request).await?)
    }
}

fn unexpected(expected: &'static str, got: Reply) -> ForwardError {
    ForwardError::UnexpectedReply { expected, got: got.kind() }
}

fn expect_ack(reply: Reply) -> Result<(), ForwardError> {
    match reply {
        Reply::Ack => Ok(()),
        other => Err(unexpected("ack", other)),
    }
}

fn expect_event_handle(reply: Reply) -> Result<Handle, ForwardError> {
    match reply {
        Reply::EventHandle { handle } => Ok(Handle::from_raw(handle)),
        other => Err(unexpected("event_handle", other)),
    }
}

fn expect_interfaces(reply: Reply) -> Result<(i32, Vec<InterfaceRecord>), ForwardError> {
    match reply {
        Reply::Interfaces { total, records } => Ok((total, records)),
        other => Err(unexpected("interfaces", other)),
    }
}

fn expect_interface_info(reply: Reply) -> Result<Vec<u8>, ForwardError> {
    match reply {
        Reply::InterfaceInfo { info } => Ok(info),
        other => Err(unexpected("interface_info", other)),
    }
}

fn expect_transfer_reports(reply: Reply) -> Result<(u32, Vec<TransferReport>), ForwardError> {
    match reply {
        Reply::TransferReports { count, reports } => Ok((count, reports)),
        other => Err(unexpected("transfer_reports", other)),
    }
}
