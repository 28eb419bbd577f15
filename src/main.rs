/*!
 * App Pool - Demo Entry Point
 *
 * Runs a pool over in-memory workers, drives a steady trickle of requests
 * against a few applications and logs the pool snapshot until Ctrl-C.
 */

use anyhow::Context;
use app_pool::{init_tracing, DummySpawnerFactory, Options, Pool, PoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const APPS: [&str; 3] = ["/srv/shop", "/srv/blog", "/srv/admin"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = PoolConfig::from_env().context("invalid pool configuration")?;
    let shutdown_wait = config.process_shutdown_timeout;
    let factory = DummySpawnerFactory::new()
        .with_concurrency(4)
        .with_spawn_delay(Duration::from_millis(50));
    let pool = Arc::new(
        Pool::builder()
            .with_config(config)
            .with_spawner_factory(factory)
            .build()
            .context("could not start the pool")?,
    );

    info!("App pool demo running, press Ctrl-C to stop");
    let mut requests = tokio::time::interval(Duration::from_millis(200));
    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut served: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = requests.tick() => {
                let app = APPS[(served % APPS.len() as u64) as usize];
                let pool = pool.clone();
                tokio::spawn(async move {
                    match pool.checkout(Options::new(app).with_max_processes(2)).await {
                        Ok(session) => {
                            tokio::time::sleep(Duration::from_millis(120)).await;
                            session.close();
                        }
                        Err(err) => warn!(app, error = %err, "Request failed"),
                    }
                });
                served += 1;
            }
            _ = report.tick() => {
                match pool.to_json() {
                    Ok(json) => info!(requests = served, snapshot = %json, "Pool snapshot"),
                    Err(err) => warn!(error = %err, "Could not serialize pool snapshot"),
                }
            }
        }
    }

    let result = tokio::task::spawn_blocking(move || pool.shutdown(shutdown_wait))
        .await
        .context("shutdown task failed")?;
    info!(result = ?result, requests = served, "App pool demo stopped");
    Ok(())
}
