use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "coherencectl",
    about = "Coherence — inspect and invalidate cache generations in a backing store",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to coherence.toml (default: ./coherence.toml when present)
    #[arg(short, long, global = true)]
    config: Option<String>,
    /// Database URI, overrides [database].uri (e.g. sqlite:db/trac.db)
    #[arg(short, long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the generation table if it does not exist
    Init,
    /// Print every (id, generation) row
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Bump the generation of one or more cache ids
    Invalidate {
        /// Cache ids, e.g. WikiSystem.pages
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Open a pooled connection, probe it and print pool statistics
    Check,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coherence=info".parse()?)
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref(), cli.database.as_deref())?;

    match cli.command {
        Commands::Init => commands::generations::init(&config),
        Commands::List { format } => commands::generations::list(&config, &format),
        Commands::Invalidate { ids } => commands::generations::invalidate(&config, &ids),
        Commands::Check => commands::check::check(&config),
    }
}
