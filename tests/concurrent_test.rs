//! Cross-session parallelism: sessions dispatch independently against a
//! shared registry without seeing each other's objects.

mod common;

use std::sync::Arc;

use common::{bulk_out_descriptor, scripted_session, ProviderScript};
use svcgate::proxy::protocol::{CallFrame, ObjectId, Request, ResultCode};
use svcgate::proxy::registry::ObjectRegistry;
use svcgate::proxy::{Dispatcher, Session};

const CALLS_PER_SESSION: usize = 1000;

fn call(object: ObjectId, request: Request) -> CallFrame {
    CallFrame { object, request }
}

async fn hammer(
    registry: Arc<ObjectRegistry>,
    script: Arc<ProviderScript>,
    endpoint: ObjectId,
) -> Session {
    let dispatcher = Dispatcher::new(registry);
    let mut session = scripted_session(&script);

    let reply = dispatcher
        .dispatch(&mut session, call(ObjectId::ROOT, Request::AcquireInterface { interface_id: 1 }))
        .await;
    assert!(reply.result.is_success());
    let iface = session.children()[0];

    let reply = dispatcher
        .dispatch(
            &mut session,
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

    for i in 0..CALLS_PER_SESSION {
        let frame = match i % 3 {
            0 => call(ObjectId::ROOT, Request::GetCurrentFrame),
            1 => call(iface, Request::GetInterface),
            _ => call(endpoint, Request::PostBuffer { size: 512, buffer: 0x1000, id: i as u64 }),
        };
        let reply = dispatcher.dispatch(&mut session, frame).await;
        assert!(reply.result.is_success(), "call {} failed: {}", i, reply.result);
    }
    session
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_sessions_stay_isolated() {
    let registry = Arc::new(ObjectRegistry::new());

    // Disjoint identity ranges so the shared registry never collides.
    let script_a = ProviderScript::new();
    script_a.script_interface(ObjectId(0xA1));
    script_a.script_endpoint(ObjectId(0xA2), bulk_out_descriptor());
    let script_b = ProviderScript::new();
    script_b.script_interface(ObjectId(0xB1));
    script_b.script_endpoint(ObjectId(0xB2), bulk_out_descriptor());

    let task_a = tokio::spawn(hammer(
        Arc::clone(&registry),
        Arc::clone(&script_a),
        ObjectId(0xA2),
    ));
    let task_b = tokio::spawn(hammer(
        Arc::clone(&registry),
        Arc::clone(&script_b),
        ObjectId(0xB2),
    ));

    let mut session_a = task_a.await.unwrap();
    let mut session_b = task_b.await.unwrap();

    // Every call reached its own provider: two mints plus the loop.
    assert_eq!(script_a.forwarded.lock().len(), 2 + CALLS_PER_SESSION);
    assert_eq!(script_b.forwarded.lock().len(), 2 + CALLS_PER_SESSION);

    // Neither session can address the other's objects.
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let reply = dispatcher
        .dispatch(&mut session_a, call(ObjectId(0xB2), Request::PopulateRing))
        .await;
    assert_eq!(reply.result, ResultCode::INVALID_OBJECT);
    let reply = dispatcher
        .dispatch(&mut session_b, call(ObjectId(0xA1), Request::GetInterface))
        .await;
    assert_eq!(reply.result, ResultCode::INVALID_OBJECT);

    session_a.teardown(&registry).await;
    session_b.teardown(&registry).await;
    assert!(registry.is_empty());
}
