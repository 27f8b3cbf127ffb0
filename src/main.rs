mod config;
mod geocode;
mod location;
mod reconnect;
mod sim;
mod trip;

use clap::{Parser, Subcommand};
use log::error;
use std::fs;
use std::process::ExitCode;

use crate::config::Config;
use crate::sim::{Runner, Scenario};

#[derive(Parser)]
#[command(name = "ride-sync")]
#[command(about = "Rider location tracking and reconnect recovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a scenario file
    Validate { scenario: String },
    /// Play a scenario against the simulated device and backend
    Run {
        scenario: String,
        /// YAML config file; defaults apply when omitted
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { scenario } => validate(&scenario),
        Commands::Run { scenario, config } => run(&scenario, config.as_deref()).await,
    }
}

fn load_scenario(path: &str) -> Option<Scenario> {
    let yaml = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading file: {}", e);
            return None;
        }
    };

    match Scenario::from_str(&yaml) {
        Ok(scenario) => Some(scenario),
        Err(e) => {
            eprintln!("Parse error: {}", e);
            None
        }
    }
}

fn validate(path: &str) -> ExitCode {
    let Some(scenario) = load_scenario(path) else {
        return ExitCode::FAILURE;
    };

    println!("Scenario is valid ({} steps)", scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let time_str = match &step.time {
            Some(t) => format!("{:?}", t),
            None => "immediate".to_string(),
        };
        println!("  {}: {} @ {}", i + 1, step.command.name(), time_str);
    }
    ExitCode::SUCCESS
}

async fn run(path: &str, config_path: Option<&str>) -> ExitCode {
    let Some(scenario) = load_scenario(path) else {
        return ExitCode::FAILURE;
    };

    let config = match config_path.map(Config::from_file).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Config error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let start_time = chrono::Utc::now();
    println!("Starting scenario at {}", start_time);

    let summary = match (Runner { scenario, config }).run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Scenario failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to encode summary: {}", e);
            return ExitCode::FAILURE;
        }
    }

    println!("Scenario completed");
    ExitCode::SUCCESS
}
