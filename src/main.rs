use anyhow::Result;
use clap::{Parser, Subcommand};
use crop_health_client::app::App;
use crop_health_client::models::{BodyFraming, Config, ModelName};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "crop-health")]
#[command(about = "Request crop-health predictions for an image")]
struct CliArgs {
    /// Base URL of the prediction API (overrides CROP_HEALTH_API_URL).
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send an image to the prediction models and print the results.
    Predict {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Model to query; repeat for several. Defaults to all three.
        #[arg(long = "model", value_name = "MODEL", value_parser = parse_model_arg)]
        models: Vec<ModelName>,

        /// Request body framing: raw or multipart.
        #[arg(long, value_parser = parse_framing_arg)]
        framing: Option<BodyFraming>,

        /// Also save the full report as JSON in this directory.
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Check that the prediction service is up.
    Ping,
}

fn parse_model_arg(input: &str) -> std::result::Result<ModelName, String> {
    input.parse().map_err(|e: crop_health_client::Error| e.to_string())
}

fn parse_framing_arg(input: &str) -> std::result::Result<BodyFraming, String> {
    input.parse().map_err(|e: crop_health_client::Error| e.to_string())
}

fn build_config(args: &CliArgs) -> crop_health_client::Result<Config> {
    let mut config = Config::from_env()?;

    if let Some(url) = &args.base_url {
        config = config.with_api_url(url);
    }
    if let Command::Predict {
        framing: Some(framing),
        ..
    } = &args.command
    {
        config = config.with_framing(*framing);
    }

    Ok(config)
}

async fn execute(args: CliArgs) -> crop_health_client::Result<()> {
    let config = build_config(&args)?;
    let app = App::new(&config)?;

    match args.command {
        Command::Predict {
            image,
            models,
            output,
            ..
        } => {
            let report = app.run_predictions(&image, &models).await?;
            println!("{}", App::render(&report)?);

            if let Some(dir) = output {
                App::save_report(&report, &dir)?;
            }
        }
        Command::Ping => {
            let healthy = app.ping().await?;
            println!("{}", if healthy { "Healthy" } else { "Unhealthy" });
            ensure_healthy(healthy, &config.api_url)?;
        }
    }

    Ok(())
}

fn ensure_healthy(healthy: bool, api_url: &str) -> crop_health_client::Result<()> {
    if healthy {
        Ok(())
    } else {
        Err(crop_health_client::Error::ServiceUnavailable(format!(
            "{} did not report healthy",
            api_url
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crop_health_client=info,crop_health=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();
    info!("Starting crop-health");

    match execute(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("crop-health failed: {}", e);
            std::process::exit(1);
        }
    }
}
