use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "ngt")]
#[command(about = "ngtrader core CLI", long_about = None)]
struct Cli {
    /// Environment name (falls back to NGT_ENV); loads `.env.<env>` before `.env.local`.
    #[arg(long, global = true)]
    env: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Job queue
    Jobs {
        #[command(subcommand)]
        cmd: commands::jobs::JobsCmd,
    },

    /// Orders
    Orders {
        #[command(subcommand)]
        cmd: commands::orders::OrdersCmd,
    },

    /// Executions and trades
    Executions {
        #[command(subcommand)]
        cmd: commands::executions::ExecutionsCmd,
    },

    /// Worker liveness
    Workers {
        #[command(subcommand)]
        cmd: WorkersCmd,
    },

    /// Run a worker process
    Worker {
        #[command(subcommand)]
        cmd: commands::worker::WorkerCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply embedded SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum WorkersCmd {
    /// One line per worker kind with its liveness light.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    commands::load_env(cli.env.as_deref());
    init_tracing();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ngt_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ngt_db::status(&pool).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    ngt_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = ngt_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Jobs { cmd } => commands::jobs::run(cmd).await?,
        Commands::Orders { cmd } => commands::orders::run(cmd).await?,
        Commands::Executions { cmd } => commands::executions::run(cmd).await?,

        Commands::Workers { cmd } => match cmd {
            WorkersCmd::Status => {
                let pool = ngt_db::connect_from_env().await?;
                for w in ngt_db::worker_statuses(&pool).await? {
                    println!(
                        "worker={} light={} status={} heartbeat_at={} age_secs={} details={}",
                        w.kind.as_str(),
                        w.light.as_str(),
                        w.status.as_deref().unwrap_or("-"),
                        commands::opt_dt(&w.heartbeat_at),
                        w.age_secs.map(|a| format!("{a:.1}")).unwrap_or_default(),
                        w.details.as_deref().unwrap_or("")
                    );
                }
            }
        },

        Commands::Worker { cmd } => commands::worker::run(cmd).await?,
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
