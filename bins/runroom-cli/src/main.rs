mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "runroom-cli")]
#[command(about = "Runroom CLI - Manage runnable languages and project layout", long_about = None)]
struct Cli {
    /// Path to languages.json
    #[arg(long, global = true, default_value = "config/languages.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a runnable language
    AddLang {
        /// Language tag clients send (e.g., ruby, go)
        #[arg(short, long)]
        name: String,

        /// File extension for the source artifact (e.g., rb, go)
        #[arg(short, long)]
        ext: String,

        /// Interpreter or launcher to run (defaults to the language name)
        #[arg(short, long)]
        command: Option<String>,

        /// Arguments before the artifact path; `{file}` and `{language}` are substituted
        #[arg(short, long, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Language version (informational)
        #[arg(short, long, default_value = "latest")]
        version: String,
    },

    /// Remove a runnable language
    RemoveLang {
        /// Language name
        #[arg(short, long)]
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },

    /// List configured languages
    ListLangs,

    /// Initialize a new Runroom project
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::AddLang {
            name,
            ext,
            command,
            args,
            version,
        } => {
            commands::add_language(
                &cli.config,
                &name,
                &ext,
                command.as_deref(),
                &args,
                &version,
            )?;
        }
        Commands::RemoveLang { name, yes } => {
            commands::remove_language(&cli.config, &name, yes)?;
        }
        Commands::ListLangs => {
            commands::list_languages(&cli.config)?;
        }
        Commands::Init { path } => {
            commands::init_project(&path)?;
        }
    }

    Ok(())
}
