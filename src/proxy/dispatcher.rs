//! Per-object facade dispatch.
//!
//! Every intercepted call follows the same shape: decode, forward through the
//! matching client stub, relay the provider's result code verbatim, re-encode
//! the reply. The proxy validates nothing the provider validates itself.
//!
//! Object-minting operations (`AcquireInterface`, `OpenEndpoint`) do one
//! extra step: after the forward succeeds, a registry entry is built around a
//! freshly derived child connection and published under the identity the
//! provider assigned, before success reaches the client. A client can never
//! observe a minted object that is not yet routable.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::handle::Handle;
use crate::provider::{ForwardError, OpenEndpointArgs, ProviderClient};
use crate::proxy::protocol::{CallFrame, ObjectId, Reply, ReplyFrame, Request, ResultCode};
use crate::proxy::registry::{ObjectKind, ObjectRegistry, RegistryEntry};
use crate::proxy::session::Session;

/// Routes calls to the facade serving the addressed object.
pub struct Dispatcher {
    registry: Arc<ObjectRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Serve one call for `session`. Never panics; proxy-internal failures
    /// come back as a generic internal-error result.
    pub async fn dispatch(&self, session: &mut Session, frame: CallFrame) -> ReplyFrame {
        debug!(
            session = %session.id(),
            object = %frame.object,
            op = frame.request.name(),
            "dispatching call"
        );

        if frame.object.is_root() {
            return self.dispatch_root(session, frame.request).await;
        }

        let Some(entry) = self.registry.lookup(frame.object) else {
            debug!(object = %frame.object, "call addressed to unknown object");
            return ReplyFrame::failure(ResultCode::INVALID_OBJECT);
        };
        if entry.owner != session.id() {
            warn!(
                session = %session.id(),
                object = %frame.object,
                "call addressed to an object owned by another session"
            );
            return ReplyFrame::failure(ResultCode::INVALID_OBJECT);
        }

        match entry.kind {
            ObjectKind::Interface => self.dispatch_interface(session, &entry, frame.request).await,
            ObjectKind::Endpoint => self.dispatch_endpoint(session, &entry, frame.request).await,
        }
    }

    async fn dispatch_root(&self, session: &mut Session, request: Request) -> ReplyFrame {
        match request {
            Request::BindClientProcess { process_handle } => {
                let handle = Handle::from_raw(process_handle);
                relay(session.root_mut().bind_client_process(handle).await.map(|_| Reply::Ack))
            }
            Request::QueryAllInterfaces { filter, capacity } => relay(
                session
                    .root_mut()
                    .query_all_interfaces(filter, capacity)
                    .await
                    .map(|(total, records)| Reply::Interfaces { total, records }),
            ),
            Request::QueryAvailableInterfaces { filter, capacity } => relay(
                session
                    .root_mut()
                    .query_available_interfaces(filter, capacity)
                    .await
                    .map(|(total, records)| Reply::Interfaces { total, records }),
            ),
            Request::QueryAcquiredInterfaces { capacity } => relay(
                session
                    .root_mut()
                    .query_acquired_interfaces(capacity)
                    .await
                    .map(|(total, records)| Reply::Interfaces { total, records }),
            ),
            Request::CreateInterfaceAvailableEvent { index, filter } => relay(
                session
                    .root_mut()
                    .create_interface_available_event(index, filter)
                    .await
                    .map(|handle| Reply::EventHandle { handle: handle.into_raw() }),
            ),
            Request::DestroyInterfaceAvailableEvent { index } => relay(
                session
                    .root_mut()
                    .destroy_interface_available_event(index)
                    .await
                    .map(|_| Reply::Ack),
            ),
            Request::GetInterfaceStateChangeEvent => relay(
                session
                    .root_mut()
                    .get_interface_state_change_event()
                    .await
                    .map(|handle| Reply::EventHandle { handle: handle.into_raw() }),
            ),
            Request::AcquireInterface { interface_id } => {
                self.acquire_interface(session, interface_id).await
            }
            Request::SetTestMode { a, b, c } => relay(
                session
                    .root_mut()
                    .set_test_mode(a, b, c)
                    .await
                    .map(|value| Reply::TestMode { value }),
            ),
            other => not_on_this_object(ObjectId::ROOT, &other),
        }
    }

    async fn dispatch_interface(
        &self,
        session: &mut Session,
        entry: &Arc<RegistryEntry>,
        request: Request,
    ) -> ReplyFrame {
        match request {
            Request::GetStateChangeEvent => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_state_change_event()
                        .await
                        .map(|handle| Reply::EventHandle { handle: handle.into_raw() }),
                )
            }
            Request::SetInterface { alt_setting } => {
                let mut client = entry.connection.lock().await;
                relay(client.set_interface(alt_setting).await.map(|info| Reply::InterfaceInfo { info }))
            }
            Request::GetInterface => {
                let mut client = entry.connection.lock().await;
                relay(client.get_interface().await.map(|info| Reply::InterfaceInfo { info }))
            }
            Request::GetAlternateInterface { alt_setting } => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_alternate_interface(alt_setting)
                        .await
                        .map(|info| Reply::InterfaceInfo { info }),
                )
            }
            Request::GetCurrentFrame => {
                let mut client = entry.connection.lock().await;
                relay(client.get_current_frame().await.map(|frame| Reply::CurrentFrame { frame }))
            }
            Request::CtrlTransfer { request_type, request, value, index, length, buffer } => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .ctrl_transfer(request_type, request, value, index, length, buffer)
                        .await
                        .map(|_| Reply::Ack),
                )
            }
            Request::GetCtrlTransferCompletionEvent => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_ctrl_transfer_completion_event()
                        .await
                        .map(|handle| Reply::EventHandle { handle: handle.into_raw() }),
                )
            }
            Request::GetCtrlTransferReport => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_ctrl_transfer_report()
                        .await
                        .map(|(count, reports)| Reply::TransferReports { count, reports }),
                )
            }
            Request::ResetDevice => {
                // Destructive, but teardown stays per-object: a reset does
                // not deregister endpoints sharing the device.
                let mut client = entry.connection.lock().await;
                relay(client.reset_device().await.map(|_| Reply::Ack))
            }
            Request::OpenEndpoint {
                max_urb_count,
                endpoint_type,
                endpoint_number,
                direction,
                max_transfer_size,
            } => {
                let args = OpenEndpointArgs {
                    max_urb_count,
                    endpoint_type,
                    endpoint_number,
                    direction,
                    max_transfer_size,
                };
                self.open_endpoint(session, entry, args).await
            }
            other => not_on_this_object(entry.identity, &other),
        }
    }

    async fn dispatch_endpoint(
        &self,
        session: &mut Session,
        entry: &Arc<RegistryEntry>,
        request: Request,
    ) -> ReplyFrame {
        match request {
            Request::Reopen => {
                let mut client = entry.connection.lock().await;
                relay(client.reopen().await.map(|_| Reply::Ack))
            }
            Request::Close => self.close_endpoint(session, entry).await,
            Request::GetCompletionEvent => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_completion_event()
                        .await
                        .map(|handle| Reply::EventHandle { handle: handle.into_raw() }),
                )
            }
            Request::PopulateRing => {
                let mut client = entry.connection.lock().await;
                relay(client.populate_ring().await.map(|_| Reply::Ack))
            }
            Request::PostBuffer { size, buffer, id } => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .post_buffer(size, buffer, id)
                        .await
                        .map(|transfer_id| Reply::TransferSubmitted { transfer_id }),
                )
            }
            Request::BatchBuffer { urb_count, unk1, unk2, buffer, id, sizes } => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .batch_buffer(urb_count, unk1, unk2, buffer, id, sizes)
                        .await
                        .map(|transfer_id| Reply::TransferSubmitted { transfer_id }),
                )
            }
            Request::GetTransferReport { max_reports } => {
                let mut client = entry.connection.lock().await;
                relay(
                    client
                        .get_transfer_report(max_reports)
                        .await
                        .map(|(count, reports)| Reply::TransferReports { count, reports }),
                )
            }
            Request::CreateSmmuSpace { size, buffer } => {
                let mut client = entry.connection.lock().await;
                relay(client.create_smmu_space(size, buffer).await.map(|_| Reply::Ack))
            }
            Request::ShareReportRing { size, ring_handle } => {
                let mut client = entry.connection.lock().await;
                let handle = Handle::from_raw(ring_handle);
                relay(client.share_report_ring(size, handle).await.map(|_| Reply::Ack))
            }
            other => not_on_this_object(entry.identity, &other),
        }
    }

    /// Forward `AcquireInterface` and mint the matching proxy-side object.
    async fn acquire_interface(&self, session: &mut Session, interface_id: u32) -> ReplyFrame {
        let minted = match session.root_mut().acquire_interface(interface_id).await {
            Ok(minted) => minted,
            Err(e) => return relay_err(e),
        };
        let child_conn = match session.root_mut().open_child(minted.identity).await {
            Ok(conn) => conn,
            Err(e) => return relay_err(e),
        };

        let client = ProviderClient::new(minted.identity, child_conn);
        let entry =
            RegistryEntry::new(minted.identity, ObjectKind::Interface, session.id(), client, None);
        if let Err(rejected) = self.registry.register(entry) {
            return self.discard_rejected(session, rejected).await;
        }
        session.adopt_child(minted.identity);

        debug!(session = %session.id(), object = %minted.identity, "interface acquired");
        ReplyFrame::success(Reply::InterfaceAcquired {
            identity: minted.identity,
            info: minted.info,
        })
    }

    /// Forward `OpenEndpoint` on an interface and mint the endpoint object,
    /// caching the creation-time descriptor on the entry.
    async fn open_endpoint(
        &self,
        session: &mut Session,
        parent: &Arc<RegistryEntry>,
        args: OpenEndpointArgs,
    ) -> ReplyFrame {
        let mut parent_client = parent.connection.lock().await;
        let minted = match parent_client.open_endpoint(args).await {
            Ok(minted) => minted,
            Err(e) => return relay_err(e),
        };
        let child_conn = match parent_client.open_child(minted.identity).await {
            Ok(conn) => conn,
            Err(e) => return relay_err(e),
        };
        drop(parent_client);

        let client = ProviderClient::new(minted.identity, child_conn);
        let entry = RegistryEntry::new(
            minted.identity,
            ObjectKind::Endpoint,
            session.id(),
            client,
            Some(minted.descriptor),
        );
        if let Err(rejected) = self.registry.register(entry) {
            return self.discard_rejected(session, rejected).await;
        }
        session.adopt_child(minted.identity);

        debug!(session = %session.id(), object = %minted.identity, "endpoint opened");
        ReplyFrame::success(Reply::EndpointOpened {
            identity: minted.identity,
            descriptor: minted.descriptor,
        })
    }

    /// An identity collision on publish means the correlation invariant
    /// broke. The rejected entry never became routable; close its forwarding
    /// connection so the minted provider object is torn down rather than
    /// left orphaned, then report the defect.
    async fn discard_rejected(&self, session: &Session, rejected: RegistryEntry) -> ReplyFrame {
        let identity = rejected.identity;
        error!(
            session = %session.id(),
            object = %identity,
            "identity collision on object registration"
        );
        let mut client = rejected.connection.into_inner();
        if let Err(e) = client.close_connection().await {
            warn!(object = %identity, error = %e, "failed to close rejected child connection");
        }
        ReplyFrame::failure(ResultCode::INTERNAL)
    }

    /// Forward the endpoint close; on success, tear the registry entry down
    /// within the same call.
    async fn close_endpoint(&self, session: &mut Session, entry: &Arc<RegistryEntry>) -> ReplyFrame {
        {
            let mut client = entry.connection.lock().await;
            if let Err(e) = client.close().await {
                return relay_err(e);
            }
        }

        if let Some(removed) = self.registry.remove(entry.identity) {
            let mut client = removed.connection.lock().await;
            if let Err(e) = client.close_connection().await {
                warn!(object = %entry.identity, error = %e,
                    "failed to close endpoint forwarding connection");
            }
        }
        session.release_child(entry.identity);

        debug!(session = %session.id(), object = %entry.identity, "endpoint closed");
        ReplyFrame::success(Reply::Ack)
    }
}

/// Map a stub outcome to the client-visible reply, relaying forwarded
/// failure codes byte-for-byte.
fn relay(result: Result<Reply, ForwardError>) -> ReplyFrame {
    match result {
        Ok(reply) => ReplyFrame::success(reply),
        Err(e) => relay_err(e),
    }
}

fn relay_err(error: ForwardError) -> ReplyFrame {
    match error {
        ForwardError::Provider(code) => ReplyFrame::failure(code),
        other => {
            error!(error = %other, "forwarding failed");
            ReplyFrame::failure(ResultCode::INTERNAL)
        }
    }
}

fn not_on_this_object(object: ObjectId, request: &Request) -> ReplyFrame {
    debug!(object = %object, op = request.name(), "operation not in object's call surface");
    ReplyFrame::failure(ResultCode::MALFORMED)
}
