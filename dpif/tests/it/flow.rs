use std::net::Ipv4Addr;

use dpif::{
    key::{Ipv4Key, PortsKey, TunnelKey},
    Action, FlowKey, FlowSpec, KernelError,
};
use dpif_sim::SimOptions;

use crate::{random_name, setup};

fn ethernet_flow(n: u8) -> FlowSpec {
    FlowSpec::new().with_key(FlowKey::ethernet([1, 2, 3, 4, 5, n], [6, 5, 4, 3, 2, 1])).unwrap()
}

#[tokio::test]
async fn create_and_delete_flow() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    let dp = conn.create_datapath(&name).await.unwrap();

    let flow = ethernet_flow(6);
    dp.create_flow(&flow).await.unwrap();
    assert_eq!(sim.flow_count(&name), Some(1));

    dp.delete_flow(&flow).await.unwrap();
    assert_eq!(sim.flow_count(&name), Some(0));

    let err = dp.delete_flow(&flow).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::NoSuchFlow));
}

#[tokio::test]
async fn enumerate_flows() {
    let (_sim, conn) = setup(SimOptions::default().with_dump_batch_size(3)).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();

    let flows: Vec<_> = (0..10).map(ethernet_flow).collect();
    for flow in &flows {
        dp.create_flow(flow).await.unwrap();
    }

    let dumped = dp.enumerate_flows().await.unwrap();
    assert_eq!(dumped.len(), flows.len());
    for flow in &flows {
        assert!(dumped.iter().any(|dumped| dumped.equals(flow)), "{flow:?} missing");
    }

    for flow in &dumped {
        dp.delete_flow(flow).await.unwrap();
    }
    assert!(dp.enumerate_flows().await.unwrap().is_empty());
}

#[tokio::test]
async fn flow_keys_and_actions_survive_the_kernel() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();
    let vport = dp.create_vport("v1", dpif::VportSpec::Internal).await.unwrap();

    let mut flow = FlowSpec::new();
    flow.add_key(FlowKey::InPort(vport.port_no()))
        .unwrap()
        .add_key(FlowKey::ethernet([0, 0x16, 0x3e, 0, 0, 1], [0, 0x16, 0x3e, 0, 0, 2]))
        .unwrap()
        .add_key(FlowKey::EtherType(0x0800))
        .unwrap()
        .add_key(FlowKey::Ipv4(Ipv4Key {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            proto: 6,
            tos: 0,
            ttl: 64,
            frag: 0,
        }))
        .unwrap()
        .add_key(FlowKey::Tcp(PortsKey { src: 40000, dst: 443 }))
        .unwrap()
        .add_key(FlowKey::Tunnel(TunnelKey {
            id: Some(42),
            ipv4_dst: Some(Ipv4Addr::new(192, 168, 1, 1)),
            ttl: Some(64),
            ..Default::default()
        }))
        .unwrap()
        .add_action(Action::PushVlan { tpid: 0x8100, tci: 0x1064 })
        .add_action(Action::Output(vport.port_no()))
        .add_action(Action::Userspace { pid: 1, userdata: None });
    dp.create_flow(&flow).await.unwrap();

    let dumped = dp.enumerate_flows().await.unwrap();
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].keys(), flow.keys());
    assert_eq!(dumped[0].actions(), flow.actions());
    assert!(dumped[0].stats().is_none());
}

#[tokio::test]
async fn flow_refusals() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();

    let flow = ethernet_flow(1).with_action(Action::Output(1));
    dp.create_flow(&flow).await.unwrap();

    // Same keys, different actions
    let err = dp.create_flow(&ethernet_flow(1)).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::AlreadyExists));

    let err = dp.create_flow(&FlowSpec::new()).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::InvalidArgument));

    dp.clone().delete().await.unwrap();

    let err = dp.create_flow(&ethernet_flow(2)).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::NoSuchDatapath));
}

#[tokio::test]
async fn flush_flows() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let a = conn.create_datapath(&random_name("test")).await.unwrap();
    let b = conn.create_datapath(&random_name("test")).await.unwrap();

    for n in 0..5 {
        a.create_flow(&ethernet_flow(n)).await.unwrap();
    }
    b.create_flow(&ethernet_flow(0)).await.unwrap();

    a.flush_flows().await.unwrap();
    assert_eq!(sim.flow_count(a.name()), Some(0));
    assert_eq!(sim.flow_count(b.name()), Some(1));

    // Flows are scoped to their datapath
    assert_eq!(b.enumerate_flows().await.unwrap().len(), 1);
}

#[tokio::test]
async fn flow_counters() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    let dp = conn.create_datapath(&name).await.unwrap();

    let flow = ethernet_flow(7).with_action(Action::Output(1));
    dp.create_flow(&flow).await.unwrap();
    assert!(sim.record_hit(&name, flow.keys(), 3, 180));

    let dumped = dp.enumerate_flows().await.unwrap();
    let stats = dumped[0].stats().expect("flow has matched traffic");
    assert_eq!((stats.packets, stats.bytes), (3, 180));
    assert!(dumped[0].used().is_some());

    let dp = conn.lookup_datapath(&name).await.unwrap().unwrap();
    let stats = dp.stats().unwrap();
    assert_eq!((stats.hit, stats.flows), (3, 1));
}
