use clap::Parser;
use marketflow::app::App;
use marketflow::cli::Args;
use marketflow::config::Config;
use marketflow::logging::setup_logging;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config and setup logging before App::new() so startup logs are never silently dropped
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting marketflow"
    );

    let app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = ?e, "Failed to initialize application");
            return ExitCode::FAILURE;
        }
    };

    if args.once {
        return match app.run_once().await {
            Ok(stats) => match serde_json::to_string_pretty(&stats) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = ?e, "Failed to serialize stats");
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                error!(error = ?e, "Refresh cycle failed");
                ExitCode::FAILURE
            }
        };
    }

    app.run(!args.no_web).await
}
