use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::*;
use config::{load_layer_config, OutputFormat};

#[derive(Parser)]
#[command(name = "qil")]
#[command(author, version, about = "Distributed index and query optimization layer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Layer configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show nodes, shards and preferred replicas
    Topology,

    /// Validate sort fields for an entity and render ORDER BY
    Validate {
        /// Entity type whose sort options apply
        #[arg(short, long)]
        entity: String,

        /// Sort fields, e.g. `created_at:desc,tenant_id`
        #[arg(short, long)]
        sort: String,
    },

    /// Choose in-memory or streaming execution for an estimated result size
    Plan {
        #[arg(short, long)]
        entity: String,

        #[arg(short, long, default_value = "")]
        sort: String,

        /// Estimated number of result rows
        #[arg(short, long)]
        rows: i64,
    },

    /// Rewrite a query for the cluster without executing it
    Optimize {
        #[arg(short, long)]
        entity: String,

        /// Target table
        #[arg(short, long)]
        table: String,

        /// Base query without ORDER BY, LIMIT or SETTINGS
        #[arg(short, long)]
        query: String,

        #[arg(short, long, default_value = "")]
        sort: String,

        /// Condition such as `tenant_id=t1`, `status=a|b`, `name~ali`, `created_at>=100`
        #[arg(short = 'w', long = "where")]
        conditions: Vec<String>,

        #[arg(short, long, default_value = "0")]
        rows: i64,
    },

    /// Search records of a metadata snapshot across files
    Search {
        /// Parquet snapshot of the record table
        #[arg(long)]
        snapshot: PathBuf,

        #[arg(short, long)]
        tenant: String,

        #[arg(long)]
        source: Option<String>,

        #[arg(short = 'w', long = "where")]
        conditions: Vec<String>,

        #[arg(short, long, default_value = "")]
        sort: String,

        /// Maximum records returned; 0 for the configured maximum
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Topology => {
            let config = load_layer_config(cli.config.as_deref())?;
            show_topology(&config)?;
        }
        Commands::Validate { entity, sort } => {
            let config = load_layer_config(cli.config.as_deref())?;
            validate_sort(&config, &entity, &sort)?;
        }
        Commands::Plan { entity, sort, rows } => {
            let config = load_layer_config(cli.config.as_deref())?;
            plan_strategy(&config, &entity, &sort, rows)?;
        }
        Commands::Optimize {
            entity,
            table,
            query,
            sort,
            conditions,
            rows,
        } => {
            let config = load_layer_config(cli.config.as_deref())?;
            optimize_query(&config, &entity, &table, &query, &sort, &conditions, rows)?;
        }
        Commands::Search {
            snapshot,
            tenant,
            source,
            conditions,
            sort,
            limit,
            output,
        } => {
            let search = SearchArgs {
                tenant,
                source,
                conditions,
                sort,
                limit,
                output,
            };
            search_snapshot(&snapshot, &search)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "qil=debug,query_core=debug,query_planner=debug,query_distributed=debug,query_index=debug"
    } else {
        "qil=info,query_distributed=warn,query_index=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
