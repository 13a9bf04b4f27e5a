use actix_web::{dev::Server, middleware, web::Data, App, HttpServer};
use anyhow::{Context, Result};
use ceph_cluster::controllers::context::State;

use crate::handlers::{health, metrics};

/// Binds the diagnostics and metrics server
pub fn build(state: State, bind_address: &str) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(bind_address)
    .with_context(|| format!("failed to bind {bind_address}"))?
    .shutdown_timeout(5);

    Ok(server.run())
}
