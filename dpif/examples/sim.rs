use dpif::{Action, Connection, FlowKey, FlowSpec, VportSpec};
use dpif_sim::{SimOptions, Simulator};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // An in-process stand-in for the kernel datapath
    let sim = Simulator::start(SimOptions::default());
    let conn = Connection::open(&sim.transport()).await.unwrap();

    let dp = conn.create_datapath("dp0").await.unwrap();
    let a = dp.create_vport("a", VportSpec::Internal).await.unwrap();
    let b = dp.create_vport("b", VportSpec::Vxlan { dst_port: 4789 }).await.unwrap();

    let flow = FlowSpec::new()
        .with_key(FlowKey::InPort(a.port_no()))
        .unwrap()
        .with_action(Action::Output(b.port_no()));
    dp.create_flow(&flow).await.unwrap();

    sim.record_hit("dp0", flow.keys(), 10, 1500);

    for flow in dp.enumerate_flows().await.unwrap() {
        println!("Flow: {:?} -> {:?}, stats {:?}", flow.keys(), flow.actions(), flow.stats());
    }

    dp.delete().await.unwrap();
    conn.close().await;
}
