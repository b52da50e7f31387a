use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use replay_commander::config::{NodeConfig, Role};
use replay_commander::node::Node;
use replay_commander::scheduler::job::now_ms;
use replay_commander::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "replay-commander")]
#[command(version)]
#[command(about = "Rate-limited replay fetching across a fleet of agents")]
#[command(propagate_version = true)]
struct Args {
    /// Coordination store URL (`redis://host:port[/db]` or `memory://`)
    #[arg(long, global = true, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    store_url: String,

    /// Output format for client commands
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the assignment loop, stuck-job sweep and queue reaper
    Commander(RunArgs),

    /// Run one agent that fetches the replays assigned to it
    Agent(RunArgs),

    /// Serve the HTTP submission and status API
    Api(RunArgs),

    /// Run commander, agent and API in one process
    All(RunArgs),

    /// Submit replay urls for processing
    Submit {
        /// Replay urls; all of them share one session id
        #[arg(required = true)]
        urls: Vec<String>,

        #[arg(long)]
        session_id: Option<String>,

        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// Show the status of jobs
    Status {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Show queue counts
    Stats,

    /// List registered agents
    Agents,
}

// =============================================================================
// Process Arguments
// =============================================================================

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Port for the HTTP API (required for `api`, optional otherwise)
    #[arg(long, env = "API_PORT")]
    api_port: Option<u16>,

    /// External scraper command; gets the url and session id appended
    #[arg(long, env = "SCRAPER_COMMAND")]
    scraper_command: Option<String>,

    /// Minimum gap between two external requests, fleet-wide
    #[arg(long, env = "MIN_REQUEST_INTERVAL_MS", default_value = "15000")]
    min_request_interval_ms: u64,

    /// Longest a request waits for its slot before proceeding anyway
    #[arg(long, env = "MAX_WAIT_MS", default_value = "60000")]
    max_wait_ms: u64,

    #[arg(long, env = "ASSIGN_INTERVAL_MS", default_value = "5000")]
    assign_interval_ms: u64,

    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "60000")]
    sweep_interval_ms: u64,

    /// Agents silent for longer than this are not assigned work
    #[arg(long, env = "HEARTBEAT_TIMEOUT_MS", default_value = "30000")]
    heartbeat_timeout_ms: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "10000")]
    heartbeat_interval_ms: u64,

    #[arg(long, env = "QUEUE_NAME", default_value = "replay-processing")]
    queue_name: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn build_config(role: Role, store_url: String, args: RunArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(role, store_url);
    config.rate_limit = config
        .rate_limit
        .with_min_request_interval(Duration::from_millis(args.min_request_interval_ms))
        .with_max_wait(Duration::from_millis(args.max_wait_ms));
    config.commander.assign_interval = Duration::from_millis(args.assign_interval_ms);
    config.commander.sweep_interval = Duration::from_millis(args.sweep_interval_ms);
    config.commander.heartbeat_timeout = Duration::from_millis(args.heartbeat_timeout_ms);
    config.agent.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    config.queue.name = args.queue_name;
    config.scraper_command = args.scraper_command;

    match (role, args.api_port) {
        (_, Some(port)) => {
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            config = config.with_api_addr(addr);
        }
        (Role::Api, None) => return Err("the api role needs --api-port".into()),
        _ => {}
    }
    if role.runs_agent() && config.scraper_command.is_none() {
        return Err("agents need --scraper-command (or SCRAPER_COMMAND)".into());
    }
    Ok(config)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_node(role: Role, store_url: String, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(role, store_url, args)?;
    tracing::info!(
        ?role,
        store = %config.store.url,
        api_addr = ?config.api_addr,
        min_request_interval_ms = config.rate_limit.min_request_interval.as_millis() as u64,
        "Starting replay-commander"
    );

    let cancel = install_shutdown_handler()?;
    let node = Node::connect(config).await?;
    node.run(cancel).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn client_node(store_url: String) -> Result<Node, Box<dyn std::error::Error>> {
    let config = NodeConfig::new(Role::Api, store_url);
    Ok(Node::connect(config).await?)
}

async fn handle_submit(
    node: &Node,
    urls: Vec<String>,
    session_id: Option<String>,
    priority: i64,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ids = node
        .service()
        .add_replay_jobs(&urls, session_id.as_deref(), priority)
        .await?;
    match output {
        OutputFormat::Json => {
            let body = serde_json::json!({ "jobIds": ids, "sessionId": session_id });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputFormat::Table => {
            for (url, id) in urls.iter().zip(&ids) {
                println!("{:<38} {}", id, url);
            }
        }
    }
    Ok(())
}

async fn handle_status(
    node: &Node,
    ids: Vec<String>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let reports = node.service().get_jobs_status(&ids).await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Table => {
            println!("{:<38} {:<10} {:>8}  ERROR", "JOB ID", "STATUS", "PROGRESS");
            for r in reports {
                println!(
                    "{:<38} {:<10} {:>7}%  {}",
                    r.id,
                    r.status,
                    r.progress,
                    r.error.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn handle_stats(node: &Node, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let stats = node.service().get_queue_stats().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => {
            println!("Pending:   {}", stats.pending);
            println!("Waiting:   {}", stats.waiting);
            println!("Active:    {}", stats.active);
            println!("Delayed:   {}", stats.delayed);
            println!("Completed: {}", stats.completed);
            println!("Failed:    {}", stats.failed);
            println!("Total:     {}", stats.total);
        }
    }
    Ok(())
}

async fn handle_agents(node: &Node, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let registry = node.commander().registry();
    let agents = registry.list().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&agents)?),
        OutputFormat::Table => {
            if agents.is_empty() {
                println!("No agents registered");
                return Ok(());
            }
            let now = now_ms();
            println!("{:<44} {:<6} {:<8} {:<38}", "AGENT", "STATUS", "ALIVE", "JOB");
            for a in agents {
                println!(
                    "{:<44} {:<6} {:<8} {:<38}",
                    a.agent_id.as_str(),
                    format!("{:?}", a.status).to_lowercase(),
                    a.is_alive(registry.heartbeat_timeout(), now),
                    a.job_id.unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let store_url = args.store_url;

    match args.command {
        Commands::Commander(run) => run_node(Role::Commander, store_url, run).await,
        Commands::Agent(run) => run_node(Role::Agent, store_url, run).await,
        Commands::Api(run) => run_node(Role::Api, store_url, run).await,
        Commands::All(run) => run_node(Role::All, store_url, run).await,
        Commands::Submit {
            urls,
            session_id,
            priority,
        } => {
            let node = client_node(store_url).await?;
            handle_submit(&node, urls, session_id, priority, &args.output).await
        }
        Commands::Status { ids } => {
            let node = client_node(store_url).await?;
            handle_status(&node, ids, &args.output).await
        }
        Commands::Stats => {
            let node = client_node(store_url).await?;
            handle_stats(&node, &args.output).await
        }
        Commands::Agents => {
            let node = client_node(store_url).await?;
            handle_agents(&node, &args.output).await
        }
    }
}
