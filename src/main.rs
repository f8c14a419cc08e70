use clap::Parser;
use kupo::config::{Cli, Command};
use kupo::launcher;
use serde_json::Value;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version || matches!(cli.command, Some(Command::Version)) {
        println!("kupo {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match cli.command {
        Some(Command::HealthCheck { host, port }) => health_check(&host, port).await,
        Some(Command::Version) => unreachable!("handled above"),
        None => {
            let settings = match cli.run.into_settings() {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            match launcher::launch(settings).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            }
        }
    }
}

/// Probe a running instance: healthy means the endpoint answers 200, reports
/// a live producer connection and holds at least one checkpoint.
async fn health_check(host: &str, port: u16) -> ExitCode {
    let url = format!("http://{}:{}/health", host, port);
    let response = match reqwest::Client::new().get(&url).header("Accept", "application/json").send().await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("health check failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !response.status().is_success() {
        eprintln!("health check failed: status {}", response.status());
        return ExitCode::FAILURE;
    }
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            eprintln!("health check failed: unreadable body: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let connected = body["connection_status"] == "connected";
    let has_checkpoint = !body["most_recent_checkpoint"].is_null();
    if connected && has_checkpoint {
        ExitCode::SUCCESS
    } else {
        eprintln!("unhealthy: {}", body);
        ExitCode::FAILURE
    }
}
