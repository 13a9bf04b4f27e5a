use ceph_cluster::{
    controllers::{bucket_topic, cluster_controller, context::State, disruption, lua_script, object_realm},
    util::telemetry,
};
use kube::Client;
use tracing::{error, info};

mod handlers;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;

    let client = Client::try_default().await?;
    if let Err(e) = cluster_controller::check_crd(&client).await {
        error!("{e}. Are the CRDs installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    // Initialize Kubernetes controller state
    let state = State::new()?;
    let server = server::build(state.clone(), &state.config().metrics_bind_address)?;
    info!("operator started in namespace {}", state.config().namespace);

    // The controllers and the server all shut down on a signal, so poll until every one is done
    let (.., served) = tokio::join!(
        cluster_controller::run(state.clone(), client.clone()),
        disruption::run(state.clone(), client.clone()),
        lua_script::run(state.clone(), client.clone()),
        bucket_topic::run_topics(state.clone(), client.clone()),
        bucket_topic::run_notifications(state.clone(), client.clone()),
        object_realm::run_realms(state.clone(), client.clone()),
        object_realm::run_zone_groups(state.clone(), client),
        server,
    );
    // health checkers and in-flight commands
    state.shutdown();
    served?;
    Ok(())
}
