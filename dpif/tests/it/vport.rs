use std::collections::HashSet;

use dpif::{Connection, ConnectionOptions, KernelError, VportSpec};
use dpif_sim::{SimOptions, Simulator};

use crate::{random_name, setup};

#[tokio::test]
async fn create_enumerate_delete_vport() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();
    assert!(dp.enumerate_vports().await.unwrap().is_empty());

    let vport = dp.create_vport("v1", VportSpec::Internal).await.unwrap();
    assert_eq!(vport.name(), "v1");
    assert_eq!(vport.dp_index(), dp.index());
    assert_eq!(vport.spec(), &VportSpec::Internal);

    let names: HashSet<_> = dp.enumerate_vports().await.unwrap().into_keys().collect();
    assert_eq!(names, HashSet::from(["v1".to_string()]));

    vport.delete().await.unwrap();
    assert!(dp.enumerate_vports().await.unwrap().is_empty());

    dp.delete().await.unwrap();
}

#[tokio::test]
async fn lookup_vport_across_connections() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let dp_name = random_name("test");
    let name = random_name("vport");

    let dp = conn.create_datapath(&dp_name).await.unwrap();
    assert!(dp.lookup_vport(&name).await.unwrap().is_none());
    let port_no = dp.create_vport(&name, VportSpec::Internal).await.unwrap().port_no();
    conn.close().await;

    let conn = Connection::open(&sim.transport()).await.unwrap();
    let dp = conn.lookup_datapath(&dp_name).await.unwrap().unwrap();

    let vport = dp.lookup_vport(&name).await.unwrap().expect("vport outlives the connection");
    assert_eq!(vport.port_no(), port_no);
    assert!(vport.stats().is_some());

    let by_port = dp.lookup_vport_by_port(port_no).await.unwrap().unwrap();
    assert_eq!(by_port.name(), name);
    assert!(dp.lookup_vport_by_port(port_no + 100).await.unwrap().is_none());

    dp.delete_vport(&vport).await.unwrap();
    assert!(dp.lookup_vport(&name).await.unwrap().is_none());

    let err = vport.delete().await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::NoSuchVport));
}

#[tokio::test]
async fn delete_vport_uses_its_own_datapath() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp1 = conn.create_datapath(&random_name("test")).await.unwrap();
    let dp2 = conn.create_datapath(&random_name("test")).await.unwrap();

    let vport = dp1.create_vport("v1", VportSpec::Internal).await.unwrap();
    let other = dp2.create_vport("v2", VportSpec::Internal).await.unwrap();
    assert_eq!(vport.port_no(), other.port_no());

    // Addressed by the vport's datapath and port number, not by the handle it goes through
    dp2.delete_vport(&vport).await.unwrap();
    assert!(dp1.enumerate_vports().await.unwrap().is_empty());
    assert!(dp2.lookup_vport_by_port(other.port_no()).await.unwrap().is_some());

    other.delete().await.unwrap();
    dp1.delete().await.unwrap();
    dp2.delete().await.unwrap();
}

#[tokio::test]
async fn enumerate_vports() {
    let (_sim, conn) = setup(SimOptions::default().with_dump_batch_size(3)).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();

    let names: Vec<_> = (0..10).map(|_| random_name("vport")).collect();
    for name in &names {
        dp.create_vport(name, VportSpec::Internal).await.unwrap();
    }

    let by_name = dp.enumerate_vports().await.unwrap();
    assert_eq!(by_name.len(), names.len());

    let ports: HashSet<_> = by_name.values().map(|vport| vport.port_no()).collect();
    assert_eq!(ports.len(), names.len(), "port numbers are unique");

    for vport in by_name.into_values() {
        vport.delete().await.unwrap();
    }
    assert!(dp.enumerate_vports().await.unwrap().is_empty());
}

#[tokio::test]
async fn vports_are_scoped_to_their_datapath() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let a = conn.create_datapath(&random_name("test")).await.unwrap();
    let b = conn.create_datapath(&random_name("test")).await.unwrap();

    a.create_vport("shared", VportSpec::Internal).await.unwrap();
    assert!(b.lookup_vport("shared").await.unwrap().is_none());
    assert!(b.enumerate_vports().await.unwrap().is_empty());

    // The same name may be used in another datapath
    b.create_vport("shared", VportSpec::Internal).await.unwrap();
    assert_eq!(a.enumerate_vports().await.unwrap().len(), 1);
}

#[tokio::test]
async fn tunnel_vport_options() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();
    dp.create_vport("vx0", VportSpec::Vxlan { dst_port: 4789 }).await.unwrap();
    dp.create_vport("gnv0", VportSpec::Geneve { dst_port: 6081 }).await.unwrap();
    dp.create_vport("gre0", VportSpec::Gre).await.unwrap();

    let vports = dp.enumerate_vports().await.unwrap();
    assert_eq!(vports["vx0"].spec(), &VportSpec::Vxlan { dst_port: 4789 });
    assert_eq!(vports["gnv0"].spec(), &VportSpec::Geneve { dst_port: 6081 });
    assert_eq!(vports["gre0"].spec(), &VportSpec::Gre);
}

#[tokio::test]
async fn vport_refusals() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();
    dp.create_vport("v1", VportSpec::Internal).await.unwrap();

    let err = dp.create_vport("v1", VportSpec::Internal).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::AlreadyExists));

    let err = dp.create_vport("odd", VportSpec::Unknown { kind: 99, options: None }).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::Unsupported));

    dp.clone().delete().await.unwrap();

    // A handle to a deleted datapath addresses nothing
    let err = dp.create_vport("v2", VportSpec::Internal).await.unwrap_err();
    assert!(err.kernel().is_some_and(|err| err.is_not_found()), "{err:?}");
}

#[tokio::test]
async fn vport_carries_upcall_pid() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::start(SimOptions::default());
    let conn = Connection::open_with_options(&sim.transport(), ConnectionOptions::default().with_upcall_pid(4242))
        .await
        .unwrap();

    let dp = conn.create_datapath(&random_name("test")).await.unwrap();
    let vport = dp.create_vport("v1", VportSpec::Netdev).await.unwrap();
    assert_eq!(vport.upcall_pid(), Some(4242));
}
