use std::time::Duration;

use futures::{future::join_all, StreamExt};

use dpif::{Connection, ConnectionOptions, Error, KernelError, ResolveError, SessionError};
use dpif_sim::{SimOptions, Simulator};

use crate::{random_name, setup};

#[tokio::test]
async fn create_and_delete_datapath() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    let dp = conn.create_datapath(&name).await.unwrap();
    assert_eq!(dp.name(), name);
    assert_ne!(dp.index(), 0);
    assert_eq!(sim.datapath_names(), vec![name.clone()]);

    dp.clone().delete().await.unwrap();
    assert!(sim.datapath_names().is_empty());

    // The handle outlived the datapath
    let err = dp.delete().await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::NoSuchDatapath));

    conn.close().await;
}

#[tokio::test]
async fn duplicate_datapath_name() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    let dp = conn.create_datapath(&name).await.unwrap();

    let err = conn.create_datapath(&name).await.unwrap_err();
    assert_eq!(err.kernel(), Some(KernelError::AlreadyExists));

    dp.delete().await.unwrap();
}

#[tokio::test]
async fn lookup_datapath_across_connections() {
    let (sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    assert!(conn.lookup_datapath(&name).await.unwrap().is_none());

    let created = conn.create_datapath(&name).await.unwrap().index();
    conn.close().await;

    let conn = Connection::open(&sim.transport()).await.unwrap();
    let dp = conn.lookup_datapath(&name).await.unwrap().expect("datapath outlives the connection");
    assert_eq!(dp.index(), created);
    assert_eq!(dp.stats().map(|stats| stats.flows), Some(0));

    dp.delete().await.unwrap();
    assert!(conn.lookup_datapath(&name).await.unwrap().is_none());
}

#[tokio::test]
async fn enumerate_datapaths() {
    // Small batches so the dump spans several datagrams
    let (_sim, conn) = setup(SimOptions::default().with_dump_batch_size(3)).await;

    assert!(conn.enumerate_datapaths().await.unwrap().is_empty());

    let names: Vec<_> = (0..10).map(|_| random_name("test")).collect();
    for name in &names {
        conn.create_datapath(name).await.unwrap();
    }

    let by_name = conn.enumerate_datapaths().await.unwrap();
    assert_eq!(by_name.len(), names.len());
    for name in &names {
        assert!(by_name.contains_key(name), "{name} missing");
    }

    for dp in by_name.into_values() {
        dp.delete().await.unwrap();
    }

    let by_name = conn.enumerate_datapaths().await.unwrap();
    for name in &names {
        assert!(!by_name.contains_key(name));
    }
}

#[tokio::test]
async fn dump_datapaths_lazily() {
    let (_sim, conn) = setup(SimOptions::default().with_dump_batch_size(2)).await;

    for _ in 0..5 {
        conn.create_datapath(&random_name("test")).await.unwrap();
    }

    let mut dump = conn.dump_datapaths().await.unwrap();
    let first = dump.next().await.unwrap().unwrap();
    assert!(!first.name().is_empty());

    let rest: Vec<_> = dump.collect().await;
    assert_eq!(rest.len(), 4);
    assert!(rest.iter().all(Result::is_ok));
}

#[tokio::test]
async fn concurrent_requests() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let names: Vec<_> = (0..8).map(|_| random_name("test")).collect();
    let created = join_all(names.iter().map(|name| conn.create_datapath(name))).await;
    assert!(created.iter().all(Result::is_ok));

    let found = join_all(names.iter().map(|name| conn.lookup_datapath(name))).await;
    for (name, dp) in names.iter().zip(found) {
        assert_eq!(dp.unwrap().unwrap().name(), name);
    }

    assert!(conn.stats().requests() >= 16);
}

#[tokio::test]
async fn abandoned_request_does_not_disturb_others() {
    let (_sim, conn) = setup(SimOptions::default()).await;

    let name = random_name("test");
    let _ = tokio::time::timeout(Duration::ZERO, conn.create_datapath(&name)).await;

    // The abandoned create may or may not have reached the kernel
    let dp = match conn.lookup_datapath(&name).await.unwrap() {
        Some(dp) => dp,
        None => conn.create_datapath(&name).await.unwrap(),
    };
    assert_eq!(dp.name(), name);
}

#[tokio::test]
async fn interrupted_dump_is_an_error() {
    let (_sim, conn) = setup(SimOptions::default().with_interrupted_dumps()).await;

    for _ in 0..3 {
        conn.create_datapath(&random_name("test")).await.unwrap();
    }

    let err = conn.enumerate_datapaths().await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::DumpInterrupted)), "{err:?}");
}

#[tokio::test]
async fn socket_closed_mid_dump() {
    let (_sim, conn) = setup(SimOptions::default().with_dump_batch_size(2).with_close_mid_dump()).await;

    for _ in 0..5 {
        conn.create_datapath(&random_name("test")).await.unwrap();
    }

    // No partial result is presented as complete
    let err = conn.enumerate_datapaths().await.unwrap_err();
    match err {
        Error::Session(SessionError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected an IO error, got {other:?}"),
    }

    // The connection is unusable once its socket is gone
    let err = conn.lookup_datapath("test").await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::Closed)), "{err:?}");
}

#[tokio::test]
async fn open_fails_without_family() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::start(SimOptions::default().with_families(["ovs_datapath", "ovs_vport"]));

    let err = Connection::open(&sim.transport()).await.unwrap_err();
    assert!(matches!(err, Error::Resolve(ResolveError::NoSuchFamily(ref name)) if name == "ovs_flow"), "{err:?}");
}

#[tokio::test]
async fn families_are_resolved_at_open() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::start(SimOptions::default());
    let conn = Connection::open_with_options(&sim.transport(), ConnectionOptions::default().with_upcall_pid(77))
        .await
        .unwrap();

    let families = conn.families();
    assert_eq!(families.len(), 3);
    let vport = families.get("ovs_vport").unwrap();
    assert_ne!(vport.id, 0);
    assert!(vport.mcast_group("ovs_vport").is_some());
    assert!(families.get("ovs_packet").is_none());
}
