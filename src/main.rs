//! aether-market: runs an in-process marketplace hub with an echo provider.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Setup agent identity (the provider's)
//!   6. Spawn the hub, register and serve the echo service
//!   7. Either run one consumer request and exit, or (`--serve`) wait for Ctrl-C
//!   8. Stop the provider, shut the hub down

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use aether_marketplace::error::MarketplaceError;
use aether_marketplace::hub::MarketHub;
use aether_marketplace::identity::{self, Identity};
use aether_marketplace::provider::ServiceRequest;
use aether_marketplace::{
    MarketplaceConsumer, MarketplaceProvider, Pricing, ServiceListing, ServiceQuery, config, logger,
};

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    serve: bool,
    input: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MarketplaceError> {
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let config = config::load(args.config_path.as_deref())?;

    match args.log_level {
        Some(level) => logger::init(level, true, config.log_file.as_deref())?,
        None => logger::init_from_config(&config)?,
    }
    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());

    info!(
        agent_name = %config.agent_name,
        work_dir = %config.work_dir.display(),
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let identity = Arc::new(identity::setup(&config)?);
    info!(agent_id = %identity.agent_id, "identity ready, starting hub");

    let hub = MarketHub::spawn(&config.hub);

    let provider = Arc::new(MarketplaceProvider::new(Arc::clone(&identity), hub.bus(), &config));
    provider.start().await?;
    let listing = provider
        .register_service(
            ServiceListing::new("echo")
                .with_description("Returns whatever text it is sent")
                .with_capability("echo")
                .with_pricing(Pricing::per_request(1, "credits")),
        )
        .await?;

    let handler = Arc::new(|request: ServiceRequest| async move {
        Ok::<_, MarketplaceError>(json!({ "echo": request.inputs.join("\n") }))
    });
    let serve_token = hub.shutdown_token().child_token();
    let serving = tokio::spawn(Arc::clone(&provider).serve(handler, serve_token.clone()));

    if args.serve {
        let ctrlc_token = serve_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                ctrlc_token.cancel();
            }
        });
        println!("✓ Serving {} ({}) as {}", listing.name, listing.id, identity.agent_id);
        serve_token.cancelled().await;
    } else {
        // An ephemeral consumer; only the provider keeps a persisted identity.
        let consumer = MarketplaceConsumer::new(Arc::new(Identity::generate()), hub.bus(), &config);
        let found = consumer.discover(ServiceQuery::new().capability("echo")).await?;
        info!(results = found.len(), "discovered services");

        let result = consumer.request(listing.id, args.input).await;
        serve_token.cancel();
        let result = result?;
        println!("✓ {} replied: {result}", listing.name);
    }

    match serving.await {
        Ok(served) => served?,
        Err(e) => return Err(MarketplaceError::Handler(format!("serve task panicked: {e}"))),
    }
    provider.stop().await?;
    hub.shutdown().await;
    Ok(())
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity: u8 = 0;
    let mut config_path = None;
    let mut serve = false;
    let mut input = Vec::new();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: aether-market [OPTIONS] [INPUT...]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -s, --serve                Keep serving the echo service until Ctrl-C");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-s" | "--serve" => serve = true,
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            other => input.push(other.to_string()),
        }
    }

    //   -v → warn, -vv → info, -vvv → debug, -vvvv+ → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    let input = if input.is_empty() {
        "hello, marketplace".to_string()
    } else {
        input.join(" ")
    };

    CliArgs {
        log_level,
        config_path,
        serve,
        input,
    }
}
