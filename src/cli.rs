use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mash")]
#[command(about = "Cloud image release pipeline services", long_about = None)]
pub struct Cli {
    /// Path to the service configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the OBS watchdog service
    Obs,

    /// Run the image upload service
    Upload,

    /// Run the image create service
    Create,

    /// Run the image test service
    Test,

    /// Run the raw image upload service
    RawImageUpload,

    /// Run the image replicate service
    Replicate,

    /// Run the image publish service
    Publish,

    /// Run the image deprecate service
    Deprecate,

    /// Run the job creator service
    Jobcreator,

    /// Run every service in one process on a shared broker
    Pipeline,
}

impl Commands {
    pub fn service_name(&self) -> &'static str {
        match self {
            Commands::Obs => "obs",
            Commands::Upload => "upload",
            Commands::Create => "create",
            Commands::Test => "test",
            Commands::RawImageUpload => "raw_image_upload",
            Commands::Replicate => "replicate",
            Commands::Publish => "publish",
            Commands::Deprecate => "deprecate",
            Commands::Jobcreator => "jobcreator",
            Commands::Pipeline => "pipeline",
        }
    }
}
