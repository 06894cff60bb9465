use clap::Parser;
use log::{error, info};
use opsdesk::configuration::config::Config;
use opsdesk::controller::controller_handler::Controller;
use std::path::Path;

#[derive(Parser)]
#[command(name = "opsdesk")]
#[command(version)]
#[command(about = "Alert intake, live log tailing and deployments for a small ops team")]
struct Args {
    /// Path to the TOML configuration file
    config_file: String,

    /// Overrides web.port
    #[arg(long, env = "OPSDESK_PORT")]
    port: Option<u16>,

    /// Overrides web.bind_address
    #[arg(long, env = "OPSDESK_BIND_ADDRESS")]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    if args.config_file.is_empty() {
        error!("No configuration file given");
        std::process::exit(1);
    }

    info!("Importing configuration");
    let mut config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_overrides(args.bind_address, args.port);
    info!("Configuration imported successfully");

    let mut controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!("Error occurred in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}
