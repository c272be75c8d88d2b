use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirage_auth::MemoryAuthenticator;
use mirage_config::{validate, Args, Config};
use mirage_tunnel::{build_server_proxy, Scope};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match args.load_config().and_then(|config| {
        validate(&config)?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if config.mysql.enabled {
        warn!("mysql authenticator backend is not bundled, using the in-memory table");
    }
    if config.api.enabled {
        warn!("management api is not bundled, ignoring the api section");
    }

    let auth = Arc::new(MemoryAuthenticator::from_passwords(&config.password));
    info!(users = auth.len(), "authenticator ready");

    let scope = Scope::new(Arc::new(config), auth);
    let proxy = match build_server_proxy(scope.clone()).await {
        Ok(proxy) => proxy,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let shutdown_scope = scope.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_scope.cancel();
    });

    proxy.run().await;
    proxy.close();
    info!("server stopped");
}

fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_new(config.log_directive()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.log_file.is_empty() {
        builder.init();
        return;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
    {
        Ok(file) => {
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        Err(err) => {
            builder.init();
            warn!(path = %config.log_file, error = %err, "cannot open log file, logging to stderr");
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
