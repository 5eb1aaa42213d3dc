use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tether::{AppContext, ApiResponse, Config, Method, Params, PendingMutation, RequestOptions};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Resilient requests with caching, retries and an offline queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./tether.yaml, then $XDG_CONFIG_HOME/tether/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Log at debug level (RUST_LOG overrides)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request through the adapter
  Request(RequestArgs),
  /// Inspect or replay the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Print the effective configuration with secrets redacted
  Config,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
  /// GET, POST, PUT, PATCH or DELETE
  method: Method,
  /// Endpoint relative to the base URL, e.g. /projects
  endpoint: String,
  /// JSON request body
  #[arg(short, long)]
  data: Option<String>,
  /// Query parameter as key=value (repeatable)
  #[arg(short, long = "param", value_parser = parse_param)]
  params: Vec<(String, String)>,
  /// Bypass the response cache
  #[arg(long)]
  no_cache: bool,
  /// Retry transient failures with backoff
  #[arg(long)]
  retry: bool,
  /// Collapse identical concurrent GETs
  #[arg(long)]
  dedupe: bool,
  /// Queue priority (higher starts first)
  #[arg(long, default_value_t = 0)]
  priority: i32,
  /// Send the request this many times concurrently
  #[arg(long, default_value_t = 1)]
  repeat: usize,
  /// Park the mutation in the offline queue if the backend is unreachable
  #[arg(long)]
  offline: bool,
  /// Print adapter statistics afterwards
  #[arg(long)]
  stats: bool,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List parked mutations
  List,
  /// Park a mutation without sending it
  Add {
    method: Method,
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Remove a parked mutation by id
  Remove { id: String },
  /// Drop every parked mutation
  Clear,
  /// Replay parked mutations once
  Sync,
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn collect_params(pairs: Vec<(String, String)>) -> Params {
  pairs
    .into_iter()
    .fold(Params::new(), |params, (k, v)| params.with(k, v))
}

fn parse_body(data: Option<&str>) -> Result<Option<Value>> {
  data
    .map(|raw| serde_json::from_str(raw).map_err(|e| eyre!("--data is not valid JSON: {}", e)))
    .transpose()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(if verbose { "tether=debug" } else { "tether=info" })
  });

  match log_file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
      Ok(None)
    }
  }
}

async fn run_request(ctx: &AppContext, args: RequestArgs) -> Result<()> {
  let body = parse_body(args.data.as_deref())?;
  let params = collect_params(args.params);

  let mut options = RequestOptions::default().with_priority(args.priority);
  if args.no_cache {
    options = options.no_cache();
  }
  if args.retry {
    options = options.with_retry();
  }
  if args.dedupe {
    options = options.deduped();
  }

  if args.offline {
    let submission = ctx
      .submit_or_enqueue(args.method, &args.endpoint, body, &params, &options)
      .await?;
    print_json(&submission)?;
  } else {
    let calls = (0..args.repeat.max(1)).map(|_| {
      ctx
        .adapter()
        .request::<Value>(args.method, &args.endpoint, body.clone(), &params, &options)
    });
    let responses: Vec<ApiResponse<Value>> = futures::future::join_all(calls).await;
    if responses.len() == 1 {
      print_json(&responses[0])?;
    } else {
      print_json(&responses)?;
    }
  }

  if args.stats {
    print_json(&ctx.adapter().stats())?;
  }
  Ok(())
}

async fn run_queue(ctx: &AppContext, command: QueueCommand) -> Result<()> {
  let offline = ctx.offline();
  match command {
    QueueCommand::List => print_json(&offline.get_all())?,
    QueueCommand::Add {
      method,
      endpoint,
      data,
      params,
    } => {
      let mutation = PendingMutation {
        method,
        endpoint,
        body: parse_body(data.as_deref())?,
        params: collect_params(params),
      };
      let id = offline.add(mutation.action_type(), mutation)?;
      println!("{}", id);
    }
    QueueCommand::Remove { id } => {
      if !offline.remove(&id)? {
        return Err(eyre!("No queued action with id {}", id));
      }
    }
    QueueCommand::Clear => offline.clear()?,
    QueueCommand::Sync => print_json(&ctx.sync_offline().await?)?,
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  if let Command::Config = args.command {
    print!("{}", serde_yaml::to_string(&config.redacted())?);
    return Ok(());
  }

  let ctx = AppContext::init(config)?;
  let result = match args.command {
    Command::Request(request) => run_request(&ctx, request).await,
    Command::Queue(command) => run_queue(&ctx, command).await,
    Command::Config => Ok(()),
  };
  ctx.dispose();

  result
}
