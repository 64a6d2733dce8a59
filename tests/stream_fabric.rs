//! Protocol-level exercises of the stream fabric, driving raw block handles
//! through the full setup sequence and the runtime packet cycle.

use std::time::Duration;

use cam_multicast::buffer::{
    AccessPerm, BufAttrs, BufModule, ImageLayout, SurfaceFormat,
};
use cam_multicast::config::{COOKIE_BASE, ELEMENT_NAME_DATA, ELEMENT_NAME_META};
use cam_multicast::fabric::{
    BlockHandle, EndpointKind, PacketHandle, SetupStep, StreamEvent, StreamHub,
};
use cam_multicast::sync::{SyncAttrs, SyncModule, SyncObj, SyncPerm};

const TIMEOUT: Duration = Duration::from_secs(5);

fn expect_event(block: &BlockHandle, expected: StreamEvent) {
    let got = block.event_query(TIMEOUT).expect("event query failed");
    assert_eq!(got, expected);
}

fn image_attrs(perm: AccessPerm) -> BufAttrs {
    let mut attrs = BufAttrs::image(
        32,
        16,
        SurfaceFormat::Yuv420SemiPlanar,
        ImageLayout::BlockLinear,
    );
    attrs.set_perm(perm).set_need_cpu_access(true);
    attrs
}

fn meta_attrs(perm: AccessPerm) -> BufAttrs {
    let mut attrs = BufAttrs::raw(64, 1);
    attrs.set_perm(perm).set_need_cpu_access(true);
    attrs
}

struct Endpoint {
    block: BlockHandle,
    signal: SyncObj,
}

/// Drive producer and consumer through element, packet and sync setup.
/// Returns the endpoints and the packet handles, with the producer holding
/// initial ownership of every packet.
fn full_setup(
    producer: BlockHandle,
    pool: BlockHandle,
    consumer: BlockHandle,
    num_packets: usize,
) -> (Endpoint, Endpoint, Vec<PacketHandle>) {
    let buf_module = BufModule::open();
    let sync_module = SyncModule::open();

    expect_event(&producer, StreamEvent::Connected);
    expect_event(&pool, StreamEvent::Connected);
    expect_event(&consumer, StreamEvent::Connected);
    assert_eq!(producer.consumer_count().unwrap(), 1);

    // Element export from both endpoints.
    producer
        .element_attr_set(ELEMENT_NAME_DATA, image_attrs(AccessPerm::ReadWrite))
        .unwrap();
    producer
        .element_attr_set(ELEMENT_NAME_META, meta_attrs(AccessPerm::ReadWrite))
        .unwrap();
    producer
        .setup_status_set(SetupStep::ElementExport, true)
        .unwrap();
    consumer
        .element_attr_set(ELEMENT_NAME_DATA, image_attrs(AccessPerm::Readonly))
        .unwrap();
    consumer
        .element_attr_set(ELEMENT_NAME_META, meta_attrs(AccessPerm::Readonly))
        .unwrap();
    consumer
        .setup_status_set(SetupStep::ElementExport, true)
        .unwrap();

    // Pool reconciles and allocates the packets.
    expect_event(&pool, StreamEvent::Elements);
    assert_eq!(pool.element_count(EndpointKind::Producer).unwrap(), 2);
    assert_eq!(pool.element_count(EndpointKind::Consumer).unwrap(), 2);
    let mut handles = Vec::new();
    let mut reconciled = Vec::new();
    for i in 0..2 {
        let (name, p_attrs) = pool.element_attr_get(EndpointKind::Producer, i).unwrap();
        let (c_name, c_attrs) = pool.element_attr_get(EndpointKind::Consumer, i).unwrap();
        assert_eq!(name, c_name);
        let merged = BufAttrs::reconcile([&p_attrs, &c_attrs]).unwrap();
        pool.element_attr_set(name, merged.clone()).unwrap();
        reconciled.push(merged);
    }
    pool.setup_status_set(SetupStep::ElementExport, true).unwrap();
    pool.setup_status_set(SetupStep::ElementImport, true).unwrap();
    for p in 0..num_packets {
        let handle = pool.pool_packet_create(p as u64 + 1).unwrap();
        for (e, attrs) in reconciled.iter().enumerate() {
            let obj = buf_module.alloc(attrs).unwrap();
            pool.pool_packet_insert_buffer(handle, e, &obj).unwrap();
        }
        pool.pool_packet_complete(handle).unwrap();
        handles.push(handle);
    }
    pool.setup_status_set(SetupStep::PacketExport, true).unwrap();

    // Endpoints import the reconciled elements and exchange waiter attrs.
    let mut cpu_waiter = SyncAttrs::new();
    cpu_waiter
        .set_need_cpu_access(true)
        .set_perm(SyncPerm::WaitOnly);

    expect_event(&producer, StreamEvent::Elements);
    producer
        .element_waiter_attr_set(0, cpu_waiter.clone())
        .unwrap();
    producer
        .setup_status_set(SetupStep::ElementImport, true)
        .unwrap();
    producer
        .setup_status_set(SetupStep::WaiterAttrExport, true)
        .unwrap();

    expect_event(&consumer, StreamEvent::Elements);
    consumer
        .element_waiter_attr_set(0, cpu_waiter.clone())
        .unwrap();
    consumer
        .setup_status_set(SetupStep::ElementImport, true)
        .unwrap();
    consumer
        .setup_status_set(SetupStep::WaiterAttrExport, true)
        .unwrap();

    // Packet import on both endpoints.
    for (i, handle) in handles.iter().enumerate() {
        expect_event(&producer, StreamEvent::PacketCreate);
        let got = producer.packet_new_handle().unwrap();
        assert_eq!(got, *handle);
        let _data = producer.packet_buffer_get(got, 0).unwrap();
        producer
            .packet_status_set(got, Some(COOKIE_BASE + i as u64 + 1), Ok(()))
            .unwrap();

        expect_event(&consumer, StreamEvent::PacketCreate);
        let got = consumer.packet_new_handle().unwrap();
        consumer
            .packet_status_set(got, Some(COOKIE_BASE + i as u64 + 1), Ok(()))
            .unwrap();
    }
    expect_event(&producer, StreamEvent::PacketsComplete);
    producer
        .setup_status_set(SetupStep::PacketImport, true)
        .unwrap();
    expect_event(&consumer, StreamEvent::PacketsComplete);
    consumer
        .setup_status_set(SetupStep::PacketImport, true)
        .unwrap();

    // Pool validates acceptance.
    for handle in &handles {
        expect_event(&pool, StreamEvent::PacketStatus);
        assert!(pool.pool_packet_status_accept(*handle).unwrap());
        assert!(pool
            .pool_packet_status_value(*handle, EndpointKind::Producer, 0)
            .unwrap()
            .is_none());
    }
    pool.setup_status_set(SetupStep::PacketImport, true).unwrap();

    // Sync object exchange.
    expect_event(&producer, StreamEvent::WaiterAttr);
    let peer_waiter = producer.element_waiter_attr_get(0).unwrap();
    producer
        .setup_status_set(SetupStep::WaiterAttrImport, true)
        .unwrap();
    let mut prod_signaler = SyncAttrs::new();
    prod_signaler.set_perm(SyncPerm::SignalOnly);
    let prod_signal = sync_module
        .alloc(&SyncAttrs::reconcile([&prod_signaler, &peer_waiter]).unwrap())
        .unwrap();
    producer
        .element_signal_obj_set(0, Some(prod_signal.clone()))
        .unwrap();
    producer
        .setup_status_set(SetupStep::SignalObjExport, true)
        .unwrap();

    expect_event(&consumer, StreamEvent::WaiterAttr);
    let peer_waiter = consumer.element_waiter_attr_get(0).unwrap();
    consumer
        .setup_status_set(SetupStep::WaiterAttrImport, true)
        .unwrap();
    let mut cons_signaler = SyncAttrs::new();
    cons_signaler.set_perm(SyncPerm::SignalOnly);
    let cons_signal = sync_module
        .alloc(&SyncAttrs::reconcile([&cons_signaler, &peer_waiter]).unwrap())
        .unwrap();
    consumer
        .element_signal_obj_set(0, Some(cons_signal.clone()))
        .unwrap();
    consumer
        .setup_status_set(SetupStep::SignalObjExport, true)
        .unwrap();

    expect_event(&producer, StreamEvent::SignalObj);
    assert!(producer.element_signal_obj_get(0, 0).unwrap().is_some());
    producer
        .setup_status_set(SetupStep::SignalObjImport, true)
        .unwrap();
    expect_event(&consumer, StreamEvent::SignalObj);
    assert!(consumer.element_signal_obj_get(0, 0).unwrap().is_some());
    consumer
        .setup_status_set(SetupStep::SignalObjImport, true)
        .unwrap();

    // The barrier trips: everyone sees setup-complete, and the producer
    // receives initial ownership of every packet.
    expect_event(&pool, StreamEvent::SetupComplete);
    expect_event(&producer, StreamEvent::SetupComplete);
    expect_event(&consumer, StreamEvent::SetupComplete);
    for i in 0..num_packets {
        expect_event(&producer, StreamEvent::PacketReady);
        let cookie = producer.producer_packet_get().unwrap();
        assert_eq!(cookie, COOKIE_BASE + i as u64 + 1);
    }

    (
        Endpoint {
            block: producer,
            signal: prod_signal,
        },
        Endpoint {
            block: consumer,
            signal: cons_signal,
        },
        handles,
    )
}

#[test]
fn setup_and_packet_cycle_with_fences() {
    let hub = StreamHub::new("fabric-test");
    let pool = hub.create_static_pool(2);
    let producer = hub.create_producer(&pool).unwrap();
    let queue = hub.create_fifo_queue();
    let consumer = hub.create_consumer(&queue).unwrap();
    producer.connect(&consumer).unwrap();

    let (prod, cons, handles) = full_setup(producer, pool, consumer, 2);

    // Present packet 0 with a producer fence.
    let prod_fence = prod.signal.generate_fence();
    prod.block
        .packet_fence_set(handles[0], 0, prod_fence.clone())
        .unwrap();
    prod.block.producer_packet_present(handles[0]).unwrap();

    // The consumer acquires it and observes the producer's fence.
    expect_event(&cons.block, StreamEvent::PacketReady);
    let cookie = cons.block.consumer_packet_acquire().unwrap();
    assert_eq!(cookie, COOKIE_BASE + 1);
    let pre = cons
        .block
        .packet_fence_get(handles[0], 0, 0)
        .unwrap()
        .expect("producer fence must travel with the packet");
    assert!(!pre.is_signaled());
    prod.signal.signal();
    assert!(pre.is_signaled());

    // Release with the consumer's completion fence.
    let post = cons.signal.generate_fence();
    cons.block
        .packet_fence_set(handles[0], 0, post.clone())
        .unwrap();
    cons.block.consumer_packet_release(handles[0]).unwrap();

    // The producer gets the packet back with the consumer's fence.
    expect_event(&prod.block, StreamEvent::PacketReady);
    let cookie = prod.block.producer_packet_get().unwrap();
    assert_eq!(cookie, COOKIE_BASE + 1);
    let returned = prod
        .block
        .packet_fence_get(handles[0], 0, 0)
        .unwrap()
        .expect("consumer fence must travel back");
    assert_eq!(returned.value(), post.value());

    // Presenting a packet the producer no longer owns is a protocol error.
    prod.block.producer_packet_present(handles[0]).unwrap();
    assert!(prod.block.producer_packet_present(handles[0]).is_err());

    // Acquire with nothing further queued is a protocol error.
    expect_event(&cons.block, StreamEvent::PacketReady);
    cons.block.consumer_packet_acquire().unwrap();
    assert!(cons.block.consumer_packet_acquire().is_err());
}

#[test]
fn mailbox_queue_drops_stale_packets_back_to_producer() {
    let hub = StreamHub::new("mailbox-test");
    let pool = hub.create_static_pool(2);
    let producer = hub.create_producer(&pool).unwrap();
    let queue = hub.create_mailbox_queue();
    let consumer = hub.create_consumer(&queue).unwrap();
    producer.connect(&consumer).unwrap();

    let (prod, cons, handles) = full_setup(producer, pool, consumer, 2);

    // Present both packets without the consumer acquiring anything: the
    // mailbox keeps only the latest and the stale one returns immediately.
    prod.block.producer_packet_present(handles[0]).unwrap();
    prod.block.producer_packet_present(handles[1]).unwrap();

    expect_event(&prod.block, StreamEvent::PacketReady);
    let recycled = prod.block.producer_packet_get().unwrap();
    assert_eq!(recycled, COOKIE_BASE + 1);
    assert_eq!(cons.block.queue_dropped().unwrap(), 1);

    // The consumer sees exactly one pending packet: the latest.
    expect_event(&cons.block, StreamEvent::PacketReady);
    let cookie = cons.block.consumer_packet_acquire().unwrap();
    assert_eq!(cookie, COOKIE_BASE + 2);
    assert!(cons.block.consumer_packet_acquire().is_err());

    // No fence was attached by the drop path.
    assert!(prod
        .block
        .packet_fence_get(handles[0], 0, 0)
        .unwrap()
        .is_none());
}

#[test]
fn duplicate_cookie_is_rejected() {
    let hub = StreamHub::new("cookie-test");
    let pool = hub.create_static_pool(2);
    let producer = hub.create_producer(&pool).unwrap();
    let queue = hub.create_fifo_queue();
    let consumer = hub.create_consumer(&queue).unwrap();
    producer.connect(&consumer).unwrap();

    for block in [&producer, &pool, &consumer] {
        expect_event(block, StreamEvent::Connected);
    }

    let buf_module = BufModule::open();
    let attrs = BufAttrs::raw(16, 1);
    let h1 = pool.pool_packet_create(1).unwrap();
    pool.pool_packet_insert_buffer(h1, 0, &buf_module.alloc(&attrs).unwrap())
        .unwrap();
    pool.pool_packet_complete(h1).unwrap();
    let h2 = pool.pool_packet_create(2).unwrap();
    pool.pool_packet_insert_buffer(h2, 0, &buf_module.alloc(&attrs).unwrap())
        .unwrap();
    pool.pool_packet_complete(h2).unwrap();

    producer
        .packet_status_set(h1, Some(COOKIE_BASE + 1), Ok(()))
        .unwrap();
    let dup = producer.packet_status_set(h2, Some(COOKIE_BASE + 1), Ok(()));
    assert!(dup.is_err());
}
