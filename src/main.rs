use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use phptags::config::{Config, LoggingConfig};

mod cli;

use cli::query::{OutputFormat, QueryArgs, QueryMode};

#[derive(Parser)]
#[command(name = "phptags")]
#[command(version)]
#[command(about = "Incremental PHP tag index with exact, near-match, file and trait-aware lookup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index (or incrementally re-index) a project
    Index {
        /// Project directory to index
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Drop the existing index first
        #[arg(short, long)]
        rebuild: bool,

        /// Remove entries for files deleted from disk
        #[arg(long)]
        prune: bool,

        /// Keep running and apply file changes as they happen
        #[arg(short, long)]
        watch: bool,
    },

    /// Query the index
    Query {
        /// Match strategy
        #[arg(value_enum)]
        mode: QueryMode,

        /// `Name`, `Class::member`, `::member`, `\Ns\Name` or `file.php[:line]`
        query: String,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Ancestor classes for inherited-member lookup, nearest first
        #[arg(long = "parent")]
        parents: Vec<String>,

        /// Extra traits in scope
        #[arg(long = "trait")]
        traits: Vec<String>,

        /// Restrict to files under these directories
        #[arg(long = "source-dir")]
        source_dirs: Vec<String>,

        /// Maximum results to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the ancestor chain of a class
    Parents {
        class: String,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,
    },

    /// Show index statistics
    Stats {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

impl Commands {
    fn project(&self) -> &str {
        match self {
            Commands::Index { project, .. }
            | Commands::Query { project, .. }
            | Commands::Parents { project, .. }
            | Commands::Stats { project, .. } => project,
        }
    }
}

fn init_logging(debug: bool, level: Option<&str>, logging: &LoggingConfig) {
    let fallback = if debug {
        "debug"
    } else {
        level.unwrap_or(logging.level.as_str())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_project_dir(cli.command.project());
    init_logging(cli.debug, cli.log_level.as_deref(), &config.logging);

    debug!("phptags v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Index {
            project,
            rebuild,
            prune,
            watch,
        } => {
            cli::index::index_project(project, rebuild, prune, watch).await?;
        }

        Commands::Query {
            mode,
            query,
            project,
            parents,
            traits,
            source_dirs,
            limit,
            format,
        } => {
            cli::query::query_index(QueryArgs {
                mode,
                query,
                project,
                parents,
                traits,
                source_dirs,
                limit,
                format,
            })
            .await?;
        }

        Commands::Parents { class, project } => {
            cli::query::show_parents(class, project).await?;
        }

        Commands::Stats { project, verbose } => {
            cli::stats::show_stats(project, verbose).await?;
        }
    }

    Ok(())
}
