//! Zenth Gateway - authenticated API gateway with a realtime channel

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use zenth_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Validate) => run_validate(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> zenth_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    Ok(config)
}

/// Validate configuration and print a summary
fn run_validate(config: &Config) -> ExitCode {
    let gateway = match Gateway::new(config.clone()) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let state = gateway.state();

    println!("✅ Configuration valid");
    println!("   Listen: {}:{}", config.server.host, config.server.port);
    println!(
        "   Protected prefix: {} (header: {}, keys: {})",
        state.gate.scope().prefix(),
        state.gate.header(),
        state.gate.credential_count()
    );
    for route in gateway.routes().routes() {
        println!("   {:<6} {} ({})", route.method, route.path, route.scope.as_str());
    }
    match &state.channel_path {
        Some(path) => println!("   Channel: {path}"),
        None => println!("   Channel: disabled"),
    }
    if state.gate.credential_count() == 0 {
        println!("⚠️  No API keys configured - protected routes will reject every request");
    }
    if state.http_origins.allows_any_origin() || state.channel_origins.allows_any_origin() {
        println!("⚠️  CORS allows any origin - restrict allowed_origins in production");
    }

    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    match gateway.run().await {
        Ok(()) => {
            info!("Gateway shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Gateway error: {e}");
            ExitCode::FAILURE
        }
    }
}
