use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored_json::to_colored_json_auto;
use ebroker_core::{BrokerError, Gateway, ProvCode, RequestStore, TemplateCatalog};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

mod config;
mod logging;
mod ls;
mod providers;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "ebroker")]
#[command(about = "ebroker - host provider for the ebrokerd protocol")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Input {
    /// JSON input document; read from stdin when omitted
    #[arg(short, long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request new nodes from a template
    CreateNode(Input),
    /// Advance and report tracked requests
    GetRequestStatus(Input),
    /// Give nodes back to the backend
    TerminateNode(Input),
    /// List nodes the backend has reclaimed or is about to reclaim
    GetReturnRequests(Input),
    /// List the configured templates
    GetAvailableTemplates,
    /// List nodes that are up and not being returned
    GetAvailableNodes,
    /// Show tracked requests as a table
    Ls,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match config::parse_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init(&config) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args.command, &config).await {
        error!(error = %format!("{:#}", e), "command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    let gateway = build_gateway(config)?;

    match command {
        Commands::CreateNode(input) => {
            let result = match read_input(&input) {
                Ok(doc) => gateway.create_node(doc).await,
                Err(e) => Err(e),
            };
            emit(&gateway, result)?;
        }
        Commands::GetRequestStatus(input) => {
            let result = match read_input(&input) {
                Ok(doc) => gateway.get_request_status(doc).await,
                Err(e) => Err(e),
            };
            emit(&gateway, result)?;
        }
        Commands::TerminateNode(input) => {
            let result = match read_input(&input) {
                Ok(doc) => gateway.terminate_node(doc).await,
                Err(e) => Err(e),
            };
            emit(&gateway, result)?;
        }
        Commands::GetReturnRequests(input) => {
            let result = match read_input(&input) {
                Ok(doc) => gateway.get_return_requests(doc).await,
                Err(e) => Err(e),
            };
            emit(&gateway, result)?;
        }
        Commands::GetAvailableTemplates => emit(&gateway, Ok(gateway.get_available_templates()))?,
        Commands::GetAvailableNodes => emit(&gateway, gateway.get_available_nodes())?,
        Commands::Ls => println!("{}", ls::render_requests(&gateway.list_requests()?)),
    }

    if let Err(e) = gateway.collect_garbage().await {
        warn!(error = %e, "request cleanup failed");
    }
    Ok(())
}

fn build_gateway(config: &Config) -> Result<Gateway> {
    let backend = config.backend()?;
    let provider = providers::create_provider_handle(backend, config)?;
    let store = RequestStore::open(config.data_dir())?.with_call_timeout(config.call_timeout()?);
    let catalog = match TemplateCatalog::load(&config.templates_path()) {
        Ok(catalog) => catalog,
        Err(e) if e.code() == ProvCode::NotExistFile => {
            warn!(path = %config.templates_path().display(), "no templates configured");
            TemplateCatalog::default()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Gateway::new(provider, store, catalog, config.timeouts(backend)?)?)
}

fn read_input<T: DeserializeOwned>(input: &Input) -> Result<T, BrokerError> {
    let raw = match &input.file {
        Some(path) => fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BrokerError::refused(ProvCode::NotExistFile, path.display().to_string()),
            _ => BrokerError::refused(ProvCode::ErrReadFile, format!("{} ({})", path.display(), e)),
        })?,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .map_err(|e| BrokerError::refused(ProvCode::ErrReadFile, format!("stdin ({})", e)))?;
            raw
        }
    };
    serde_json::from_str(&raw).map_err(|e| BrokerError::refused(ProvCode::UnrecognizedJson, e.to_string()))
}

/// Print the verb's document, or the failure document if it was refused.
fn emit<T: Serialize>(gateway: &Gateway, result: Result<T, BrokerError>) -> Result<()> {
    let value = match result {
        Ok(doc) => serde_json::to_value(doc)?,
        Err(e) => {
            warn!(error = %e, "verb refused");
            serde_json::to_value(gateway.failure(&e))?
        }
    };
    println!("{}", to_colored_json_auto(&value)?);
    Ok(())
}
