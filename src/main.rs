use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use orca::config::GatewayConfig;
use orca::core::{CoreState, ImageRegistry, UserRegistry};
use orca::runtime::{ContainerRuntime, DockerRuntime};
use orca::shutdown::ShutdownController;
use orca::web::WebState;
use orca::{logging, web};

#[derive(Parser)]
#[command(name = "orca")]
#[command(about = "Multi-protocol gateway dispatching user sessions onto workload containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve,

    /// List the labeled images the runtime currently offers
    Images,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Images => list_images().await,
    }
}

async fn serve() -> Result<()> {
    let config = GatewayConfig::from_env();
    logging::init(&config.log_dir, "orca")?;

    let pid = std::process::id();
    if let Err(err) = std::fs::write(&config.pid_file, pid.to_string()) {
        warn!("could not write pid file {}: {err}", config.pid_file);
    }
    info!("starting orca (pid {pid})");

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("failed to connect to the container runtime")?,
    );

    // Nothing survives a restart; managed containers from a previous run are
    // garbage.
    match runtime.list_managed_containers().await {
        Ok(leftovers) => {
            for id in leftovers {
                warn!("removing leftover managed container {id}");
                if let Err(err) = runtime.remove_container(&id).await {
                    warn!("could not remove leftover container {id}: {err}");
                }
            }
        }
        Err(err) => warn!("could not list leftover containers: {err}"),
    }

    let shutdown = ShutdownController::new(
        Some(config.request_deadline),
        Some(config.demand_deadline),
    );
    shutdown.install_interrupt_handler();

    let state = Arc::new(CoreState {
        runtime,
        shutdown: shutdown.clone(),
        scheduling: config.scheduling,
        container_url_format: config.container_url_format.clone(),
    });

    let images = Arc::new(ImageRegistry::new(state));
    images
        .reconcile()
        .await
        .context("initial image reconciliation failed")?;
    spawn_reconcile_loop(images.clone(), &shutdown, config.image_refresh);

    let users = Arc::new(UserRegistry::new(config.token_checker_url.clone()));

    // Redirects from containers must reach the user, not be followed here.
    let proxy_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build the proxy http client")?;

    let web_state = Arc::new(WebState {
        images,
        users,
        shutdown: shutdown.clone(),
        http: proxy_client,
        identity_cookie: config.identity_cookie.clone(),
        login_url_format: config.login_url_format.clone(),
    });
    let http_addr = config.http_addr.clone();
    tokio::spawn(async move {
        if let Err(err) = web::serve(web_state, &http_addr).await {
            tracing::error!("http gateway failed: {err}");
        }
    });

    shutdown.done().await;
    let _ = std::fs::remove_file(&config.pid_file);
    info!("shutdown completed");
    Ok(())
}

fn spawn_reconcile_loop(
    images: Arc<ImageRegistry>,
    shutdown: &ShutdownController,
    interval: std::time::Duration,
) {
    let token = shutdown.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = images.reconcile().await {
                        warn!("image reconciliation failed: {err}");
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    });
}

async fn list_images() -> Result<()> {
    let runtime = DockerRuntime::connect()
        .await
        .context("failed to connect to the container runtime")?;
    let images = runtime.list_labeled_images().await?;
    if images.is_empty() {
        println!("no labeled images found");
        return Ok(());
    }
    for image in images {
        let name = image
            .label("orca.name")
            .or_else(|| image.repo_tags.first().cloned())
            .unwrap_or_else(|| "?".to_string());
        println!("{}\t{}\t{}", image.label_or("orca.kind", "?"), name, image.id);
    }
    Ok(())
}
