use dpif::{Connection, Netlink};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // Requires CAP_NET_ADMIN and the openvswitch kernel module
    let conn = Connection::open(&Netlink::default()).await.unwrap();

    for (name, dp) in conn.enumerate_datapaths().await.unwrap() {
        println!("{name} (ifindex {}): {:?}", dp.index(), dp.stats());

        for (name, vport) in dp.enumerate_vports().await.unwrap() {
            println!("  port {}: {name} {:?}", vport.port_no(), vport.spec());
        }

        for flow in dp.enumerate_flows().await.unwrap() {
            println!("  flow {:?} actions {:?} stats {:?}", flow.keys(), flow.actions(), flow.stats());
        }
    }

    conn.close().await;
}
