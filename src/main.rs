mod cli;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use cli::{Cli, Commands};
use mash::broker::Broker;
use mash::config::Config;
use mash::handlers::{HandlerError, JobFactory, NoOpHandler, StageHandler};
use mash::jobcreator::JobCreatorService;
use mash::listener::{ListenerArgs, ListenerService, ServiceError};
use mash::logging;
use mash::messages::JobDocument;
use mash::obs::ObsWatchdogService;
use mash::pipeline;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let service_name = cli.command.service_name();
    if let Err(error) = logging::setup_service(service_name, &config.log_dir) {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    let broker = Broker::new();
    let outcome = tokio::select! {
        result = run_command(&cli.command, config, broker) => result,
        _ = shutdown_signal() => {
            info!(service = service_name, "shutdown signal received");
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(service = service_name, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, mash::config::ConfigError> {
    match &cli.config {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    }
}

async fn run_command(
    command: &Commands,
    config: Config,
    broker: Broker,
) -> Result<(), ServiceError> {
    match command {
        Commands::Obs => ObsWatchdogService::new(config, broker)?.run().await,
        Commands::Jobcreator => JobCreatorService::new(config, broker).run().await,
        Commands::Pipeline => run_pipeline(config, broker).await,
        stage => run_stage(stage.service_name(), config, broker).await,
    }
}

async fn run_stage(service: &str, config: Config, broker: Broker) -> Result<(), ServiceError> {
    ListenerService::new(service, config, listener_args(service), broker)?
        .run()
        .await
}

/// All services in one process, wired onto one shared broker. This is the
/// single-host deployment; the per-service subcommands exist for running
/// one piece against an external setup under a supervisor.
async fn run_pipeline(config: Config, broker: Broker) -> Result<(), ServiceError> {
    let mut services = tokio::task::JoinSet::new();

    services.spawn(ObsWatchdogService::new(config.clone(), broker.clone())?.run());
    for service in pipeline::PIPELINE.iter().filter(|name| **name != "obs") {
        services.spawn(
            ListenerService::new(service, config.clone(), listener_args(service), broker.clone())?
                .run(),
        );
    }
    services.spawn(JobCreatorService::new(config, broker).run());

    // The first service to go down takes the process with it; the
    // supervisor restarts everything against the persisted job state.
    match services.join_next().await {
        Some(Ok(result)) => result,
        _ => Err(ServiceError::BrokerClosed),
    }
}

/// Keys each stage needs from its predecessor, and the handler outputs it
/// forwards. The accumulated status message carries everything else
/// through untouched.
fn listener_args(service: &str) -> ListenerArgs {
    let (listener_msg_args, status_msg_args): (&[&str], &[&str]) = match service {
        "upload" => (&["image_file"], &["image_file", "source_regions"]),
        "create" => (&["image_file"], &["cloud_image_name", "source_regions"]),
        "test" => (&["cloud_image_name", "source_regions"], &[]),
        "raw_image_upload" => (&["image_file"], &[]),
        "replicate" => (&["cloud_image_name", "source_regions"], &["source_regions"]),
        "publish" => (&["cloud_image_name", "source_regions"], &[]),
        "deprecate" => (&[], &[]),
        _ => (&[], &[]),
    };

    ListenerArgs {
        listener_msg_args: listener_msg_args.iter().map(|s| s.to_string()).collect(),
        status_msg_args: status_msg_args.iter().map(|s| s.to_string()).collect(),
        job_factory: stage_factory(service),
    }
}

/// Per-stage cloud tables. Clouds with no work at a stage are wired to the
/// no-op handler explicitly; deployments that link real per-cloud handlers
/// register them here.
fn stage_factory(service: &str) -> JobFactory {
    let factory = JobFactory::new(service);
    match service {
        // EC2 image creation uploads and creates in one step
        "upload" => factory.register("ec2", noop),
        "raw_image_upload" => factory
            .register("gce", noop)
            .register("oci", noop)
            .register("aliyun", noop),
        "replicate" => factory.register("azure", noop).register("gce", noop),
        "deprecate" => factory.register("azure", noop).register("oci", noop),
        _ => factory,
    }
}

fn noop(_doc: &JobDocument, _config: &Config) -> Result<Box<dyn StageHandler>, HandlerError> {
    Ok(Box::new(NoOpHandler::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
