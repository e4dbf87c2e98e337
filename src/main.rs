use clap::Parser;
use tracing::{error, info};

use flaky_test_cleaner::config::Config;
use flaky_test_cleaner::runtime;
use flaky_test_cleaner::service::{Service, ServiceDeps};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    let mut cfg = Config::parse();
    if let Err(err) = cfg.validate() {
        eprintln!("{err}");
        std::process::exit(2);
    }

    match run(cfg).await {
        Ok(()) => {}
        Err(err) => {
            error!("run failed: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let service = Service::new(cfg.clone(), ServiceDeps::default()).await?;
    let result = tokio::select! {
        res = runtime::run(&cfg, &service) => res,
        _ = shutdown_signal() => {
            info!("shutdown signal received, exiting");
            Ok(())
        }
    };
    service.close().await?;
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
