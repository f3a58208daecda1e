use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{info, warn};

use hermes_bus::{
    broker::Broker,
    cli::{Cli, ClientAction, ClientArgs, Command},
    client::{Client, DEFAULT_REQUEST_TIMEOUT},
    command::Command as Wire,
    envelope::{Envelope, Payload, Reply},
    error::Result as BusResult,
    service::Service,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let broker = Broker::bind(args.into_config())
                .await
                .context("failed to start broker")?;
            info!("broker listening on {}", broker.local_addr());
            if let Err(err) = broker.run().await {
                warn!("broker exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Service(args) => {
            let mut service = Service::start(args.into_config())
                .await
                .context("failed to start service")?;
            info!("service {} listening on {}", service.name(), service.local_addr());

            let mut about = Map::new();
            about.insert(
                service.name().to_string(),
                serde_json::to_value(service.record())?,
            );
            let about = Value::Object(about);
            service.add_handler(Wire::InfoReq, move |_: &Envelope| -> BusResult<Option<Reply>> {
                Ok(Some(Reply::message(
                    Wire::InfoRep,
                    vec![Payload::Json(about.clone())],
                )))
            });
            service.run().await?;
        }
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    match args.action {
        ClientAction::Info { name } => {
            let mut client = match args.broker {
                Some(addr) => Client::connect(addr).await,
                None => Client::discover(args.discovery_port, Duration::from_secs(5)).await,
            }
            .context("failed to reach broker")?;
            let services = client.services(name.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&services)?);
        }
        ClientAction::Exit { target } => {
            let farewell = Client::exit(target, DEFAULT_REQUEST_TIMEOUT).await?;
            println!("{farewell}");
        }
    }
    Ok(())
}
