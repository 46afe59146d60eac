use busrpc::{telemetry, AccessLog, CancellationToken, Error, Module, Server, ServerConfig};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "BUSRPC_CONFIG")]
    config: Option<PathBuf>,

    /// NATS server url, overrides the config file
    #[arg(long, env = "BUSRPC_NATS_URL")]
    nats_url: Option<String>,

    /// Application queue, overrides the config file
    #[arg(short, long, env = "BUSRPC_QUEUE")]
    queue: Option<String>,

    /// Deployment environment, overrides the config file
    #[arg(short, long, env = "BUSRPC_ENV")]
    env: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, Error> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(nats_url) = &cli.nats_url {
        config.nats_url = nats_url.clone();
    }
    if let Some(queue) = &cli.queue {
        config.queue = queue.clone();
    }
    if let Some(env) = &cli.env {
        config.environment = Some(env.clone());
    }
    if cli.verbose {
        config.logging.filter = "debug".to_string();
    }
    Ok(config)
}

fn echo_module() -> Module {
    Module::new()
        .method("echo", |ctx| {
            Box::pin(async move {
                let params = ctx.params().clone();
                ctx.append_ext_log(format!("echoed {} params", params.len()));
                ctx.json(params).await
            })
        })
        .method("whoami", |ctx| {
            Box::pin(async move {
                let identity = json!({
                    "server_id": ctx.server_id(),
                    "app": ctx.app(),
                    "id": ctx.id(),
                });
                ctx.json(identity).await
            })
        })
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let config = load_config(cli)?;
    telemetry::init_tracing(&config.logging);
    info!("config loaded.");
    debug!("config: {:?}", config);

    let server = Server::connect(config)
        .await?
        .router("echo", echo_module())
        .use_middleware(AccessLog);
    let bound = server.bind().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        signal.cancel();
    });

    println!("busrpc-echo started. Press Ctrl+C to shutdown.");
    bound.run(shutdown).await?;
    println!("busrpc-echo stopped.");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
