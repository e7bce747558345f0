use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "tfgen")]
#[command(version, about = "Generate, validate and correct Terraform with an LLM")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding tfgen.toml
    #[arg(long, global = true, env = "TFGEN_CONFIG_DIR", default_value = ".tfgen")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Default LLM provider
        #[arg(long)]
        provider: Option<String>,

        /// Enable permissive CORS for local frontends
        #[arg(long)]
        dev: bool,
    },
    /// Generate Terraform for a single request and write it to disk
    Generate {
        /// What to build, in plain language
        query: String,

        /// new_resource, modify_resource, new_module, new_variables, new_outputs
        #[arg(short, long, default_value = "new_resource")]
        scenario: String,

        /// File holding the code to modify (modify_resource)
        #[arg(long)]
        existing: Option<PathBuf>,

        /// Target file for modify_resource
        #[arg(long)]
        target_file: Option<String>,

        /// LLM provider name from tfgen.toml
        #[arg(long)]
        provider: Option<String>,

        /// Where generated files are written
        #[arg(short, long, default_value = "tfgen-out")]
        output: PathBuf,

        /// Skip the error correction loop
        #[arg(long)]
        no_correction: bool,

        /// Record the files in the database and storage, under this project
        #[arg(long)]
        project: Option<String>,
    },
    /// Check Terraform files for syntax, structure and security issues
    Validate {
        /// A .tf file or a directory of them
        path: PathBuf,

        /// Don't report references to undeclared variables and locals
        #[arg(long)]
        lenient: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate configuration and list problems
    Validate,
    /// Write a default tfgen.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            port,
            db_path,
            provider,
            dev,
        } => {
            cmd::cmd_serve(&cli, *port, db_path.clone(), provider.clone(), *dev).await?;
        }
        Commands::Generate {
            query,
            scenario,
            existing,
            target_file,
            provider,
            output,
            no_correction,
            project,
        } => {
            cmd::cmd_generate(
                &cli,
                cmd::GenerateArgs {
                    query: query.clone(),
                    scenario: scenario.clone(),
                    existing: existing.clone(),
                    target_file: target_file.clone(),
                    provider: provider.clone(),
                    output: output.clone(),
                    correction: !*no_correction,
                    project: project.clone(),
                },
            )
            .await?;
        }
        Commands::Validate {
            path,
            lenient,
            json,
        } => cmd::cmd_validate(path, *lenient, *json)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config_dir, command.clone())?,
    }

    Ok(())
}
