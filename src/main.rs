use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use pactown::blocks::{self, Block};
use pactown::{CacheConfig, ServiceConfig, ServiceRunner, SupervisorConfig};

/// `pactown` keeps README-defined services honest by materializing them
/// into sandboxes and running them under supervision.
#[derive(Parser, Debug)]
#[command(
    name = "pactown",
    version,
    about = "Run README-defined services in supervised sandboxes"
)]
struct Cli {
    /// Path to the service README markdown file.
    #[arg(default_value = "README.md")]
    readme: PathBuf,

    /// Directory where sandboxes are materialized.
    #[arg(long, value_name = "DIR", default_value = ".pactown-sandboxes")]
    sandbox_root: PathBuf,

    /// Disable the dependency cache (every run installs from scratch).
    #[arg(long)]
    no_cache: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the service and supervise it until Ctrl-C.
    Run(RunArgs),
    /// List tagged blocks with metadata but do not execute anything.
    List {
        #[arg(long, default_value_t = ReportFormat::Human, value_enum)]
        format: ReportFormat,
    },
    /// Validate the document without touching the filesystem.
    Validate {
        #[arg(long, default_value_t = ReportFormat::Human, value_enum)]
        format: ReportFormat,
    },
    /// Inspect or clear the dependency cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show entry count, total size, and hit/miss counters.
    Stats,
    /// Delete every unreferenced cache entry.
    Purge,
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
enum ReportFormat {
    Human,
    Json,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Service name; defaults to the README's parent directory name.
    #[arg(long)]
    name: Option<String>,

    /// Port the service listens on.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Health check path polled until the service answers 2xx.
    #[arg(long, value_name = "PATH", default_value = "/health")]
    health_path: String,

    /// Skip the readiness phase after spawning.
    #[arg(long)]
    skip_health_check: bool,

    /// Materialize the sandbox but do not install dependencies.
    #[arg(long)]
    no_install: bool,

    /// Repeatable KEY=VALUE pairs merged into install and run environments.
    #[arg(long = "env", value_name = "KEY=VALUE", action = ArgAction::Append)]
    env: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let runner = ServiceRunner::configured(
        &cli.sandbox_root,
        !cli.no_cache,
        CacheConfig::default(),
        SupervisorConfig::default(),
    );

    match &cli.command {
        Some(Command::List { format }) => {
            let content = read_readme(&cli.readme)?;
            let doc_blocks = blocks::parse_blocks(&content)?;
            render_list(&doc_blocks, *format)?;
        }
        Some(Command::Validate { format }) => {
            let content = read_readme(&cli.readme)?;
            let result = runner.validate_content(&content);
            match format {
                ReportFormat::Human => {
                    for error in &result.errors {
                        println!("{error}");
                    }
                    println!(
                        "{}: {}",
                        cli.readme.display(),
                        if result.valid { "valid" } else { "invalid" }
                    );
                }
                ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }
            if !result.valid {
                bail!("document failed validation");
            }
        }
        Some(Command::Cache { action }) => match action {
            CacheAction::Stats => {
                let stats = runner.get_cache_stats();
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            CacheAction::Purge => {
                let removed = runner.purge_cache()?;
                println!("purged {removed} cache entries");
            }
        },
        Some(Command::Run(args)) => run_service(&cli, &runner, args).await?,
        None => run_service(&cli, &runner, &cli.run).await?,
    }

    Ok(())
}

async fn run_service(cli: &Cli, runner: &ServiceRunner, args: &RunArgs) -> Result<()> {
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| service_name(&cli.readme));
    let env = parse_env_pairs(&args.env)?;

    let mut service = ServiceConfig::new(&name, cli.readme.display().to_string(), args.port)
        .with_health_check(&args.health_path);
    if !env.is_empty() {
        service = service.with_env(env);
    }

    let on_log = std::sync::Arc::new(|line: &str| println!("  {line}"));
    let (sandbox, handle) = runner
        .run_service(
            &service,
            !args.no_install,
            args.skip_health_check,
            Some(on_log),
        )
        .await
        .with_context(|| format!("while starting '{name}'"))?;

    println!(
        "{name} running on port {} (pid {}, sandbox {}{})",
        handle.port,
        handle.pid,
        sandbox.path.display(),
        if sandbox.cache_hit { ", cache hit" } else { "" },
    );
    println!("press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nstopping {name}...");
    runner.stop(&name).await?;
    Ok(())
}

fn read_readme(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("while reading {}", path.display()))
}

fn service_name(readme: &PathBuf) -> String {
    readme
        .canonicalize()
        .ok()
        .and_then(|p| {
            p.parent()
                .and_then(|d| d.file_name())
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "service".to_string())
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("--env expects KEY=VALUE, got '{pair}'"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn render_list(doc_blocks: &[Block], format: ReportFormat) -> Result<()> {
    match format {
        ReportFormat::Json => {
            println!("{}", serde_json::to_string_pretty(doc_blocks)?);
        }
        ReportFormat::Human => {
            println!("Discovered {} tagged block(s):", doc_blocks.len());
            for block in doc_blocks {
                let lang = if block.lang.is_empty() {
                    "-".to_string()
                } else {
                    block.lang.clone()
                };
                let headings = if block.headings.is_empty() {
                    "(root)".to_string()
                } else {
                    block.headings.join(" › ")
                };
                let meta_hint = if block.meta.is_empty() {
                    String::new()
                } else {
                    format!(" {}", block.meta)
                };
                println!(
                    "- line {:>3} {} [{lang}]{meta_hint} — {headings}",
                    block.line, block.kind
                );
            }
        }
    }
    Ok(())
}
