//! Session teardown: every minted sub-object's forwarding connection closes
//! exactly once, children before the root.

mod common;

use std::sync::Arc;

use common::{bulk_out_descriptor, scripted_session, ProviderScript};
use svcgate::proxy::protocol::{CallFrame, ObjectId, Request};
use svcgate::proxy::registry::ObjectRegistry;
use svcgate::proxy::Dispatcher;

fn call(object: ObjectId, request: Request) -> CallFrame {
    CallFrame { object, request }
}

async fn open_endpoint(
    dispatcher: &Dispatcher,
    session: &mut svcgate::proxy::Session,
    iface: ObjectId,
) {
    let reply = dispatcher
        .dispatch(
            session,
            call(
                iface,
                Request::OpenEndpoint {
                    max_urb_count: 1,
                    endpoint_type: 2,
                    endpoint_number: 1,
                    direction: 0,
                    max_transfer_size: 512,
                },
            ),
        )
        .await;
    assert!(reply.result.is_success());
}

#[tokio::test]
async fn teardown_closes_children_then_root_exactly_once() {
    let script = ProviderScript::new();
    script.script_interface(ObjectId(0x10));
    script.script_interface(ObjectId(0x20));
    script.script_endpoint(ObjectId(0x30), bulk_out_descriptor());

    let registry = Arc::new(ObjectRegistry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut session = scripted_session(&script);

    for interface_id in [1u32, 2] {
        let reply = dispatcher
            .dispatch(&mut session, call(ObjectId::ROOT, Request::AcquireInterface { interface_id }))
            .await;
        assert!(reply.result.is_success());
    }
    open_endpoint(&dispatcher, &mut session, ObjectId(0x10)).await;
    assert_eq!(registry.len(), 3);

    session.teardown(&registry).await;

    // Three children plus the root, each closed once, newest child first and
    // the root strictly last. The scripted channel panics on a second
    // shutdown, so exactly-once is enforced structurally.
    assert_eq!(
        script.close_order.lock().as_slice(),
        &[Some(ObjectId(0x30)), Some(ObjectId(0x20)), Some(ObjectId(0x10)), None]
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn explicitly_closed_endpoint_is_not_closed_again() {
    let script = ProviderScript::new();
    script.script_interface(ObjectId(0x10));
    script.script_endpoint(ObjectId(0x30), bulk_out_descriptor());

    let registry = Arc::new(ObjectRegistry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut session = scripted_session(&script);

    let reply = dispatcher
        .dispatch(&mut session, call(ObjectId::ROOT, Request::AcquireInterface { interface_id: 1 }))
        .await;
    assert!(reply.result.is_success());
    open_endpoint(&dispatcher, &mut session, ObjectId(0x10)).await;

    let reply = dispatcher.dispatch(&mut session, call(ObjectId(0x30), Request::Close)).await;
    assert!(reply.result.is_success());

    session.teardown(&registry).await;

    assert_eq!(
        script.close_order.lock().as_slice(),
        &[Some(ObjectId(0x30)), Some(ObjectId(0x10)), None]
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn teardown_with_no_children_closes_only_the_root() {
    let script = ProviderScript::new();
    let registry = Arc::new(ObjectRegistry::new());
    let session = scripted_session(&script);

    session.teardown(&registry).await;
    assert_eq!(script.close_order.lock().as_slice(), &[None]);
}
