use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use entity_import::config::{Config, Overrides};
use entity_import::importers::ImportOptions;
use entity_import::logging::Verbosity;
use entity_import::model::RecoverStrategy;
use entity_import::output::Format;

#[derive(Parser)]
#[command(
    name = "entity-import",
    version,
    about = "Idempotent import of exported entities into a remote management server"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import (or delete) the entities listed in a CSV export
    Import(ImportArgs),
    /// List known importers with their CSV columns and mappings
    Entities,
    /// Show the live content of one mapping
    Mappings {
        /// Mapping name, e.g. organizations
        name: String,
        /// Directory holding the mapping segments
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ImportArgs {
    /// Entity to import (see `entities`)
    entity: String,
    /// CSV export to read
    #[arg(long)]
    csv_file: PathBuf,
    /// Delete previously imported entities instead of importing
    #[arg(long)]
    delete: bool,
    /// Recovery strategy for uniqueness conflicts
    #[arg(long, value_enum)]
    recover: Option<RecoverStrategy>,
    /// Print nothing on stdout
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    /// Mirror the log on stdout
    #[arg(long)]
    verbose: bool,
    /// Include debug messages in the log
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    logfile: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Map every organization onto this existing organization
    #[arg(long)]
    into_org_id: Option<i64>,
    /// Map users onto existing users with the same login
    #[arg(long)]
    merge_users: bool,
    /// Write generated passwords of new users to this CSV file
    #[arg(long)]
    new_passwords: Option<PathBuf>,
    /// Start synchronization of imported repositories
    #[arg(long)]
    synchronize: bool,
    /// Wait for started synchronizations to finish
    #[arg(long, requires = "synchronize")]
    wait: bool,
}

impl ImportArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            server: self.server.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            data_dir: self.data_dir.clone(),
            logfile: self.logfile.clone(),
            recover: self.recover,
        }
    }

    fn into_request(self) -> entity_import::commands::import::ImportRequest {
        entity_import::commands::import::ImportRequest {
            entity: self.entity,
            csv_file: self.csv_file,
            delete: self.delete,
            verbosity: Verbosity {
                quiet: self.quiet,
                verbose: self.verbose,
                debug: self.debug,
            },
            options: ImportOptions {
                into_org_id: self.into_org_id,
                merge_users: self.merge_users,
                new_passwords: self.new_passwords,
                synchronize: self.synchronize,
                wait: self.wait,
            },
        }
    }
}

fn run(cli: Cli, format: Format) -> entity_import::error::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Import(args) => {
            let config = config.apply(args.overrides());
            entity_import::commands::import::run(&config, &args.into_request(), format)
        }
        Commands::Entities => entity_import::commands::entities::run(format),
        Commands::Mappings { name, data_dir } => {
            let config = config.apply(Overrides {
                data_dir,
                ..Overrides::default()
            });
            entity_import::commands::mappings::run(&config.data_dir(), &name, format)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
