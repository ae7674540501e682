use dpif::Connection;
use dpif_sim::{SimOptions, Simulator};

mod datapath;
mod flow;
mod vport;

/// Starts a simulated kernel and opens a connection to it.
async fn setup(options: SimOptions) -> (Simulator, Connection) {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::start(options);
    let conn = Connection::open(&sim.transport()).await.unwrap();

    (sim, conn)
}

fn random_name(prefix: &str) -> String {
    format!("{prefix}{}", rand::random::<u32>())
}
