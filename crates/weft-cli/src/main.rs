//! # Weft CLI Entry Point
//!
//! Starts a Weft server or talks to a running one.
//!
//! ## Usage
//!
//! ```bash
//! # Serve, loading scripts in order
//! weft serve -s app.js -s routes.js -b 127.0.0.1:3000
//!
//! # Run a script on a running server (stdin when neither -f nor -e is given)
//! weft exec http://127.0.0.1:3000 -e 'state.visits'
//!
//! # Read or replace the global state
//! weft state http://127.0.0.1:3000 --set '{"visits": 0}'
//!
//! # List registered routes
//! weft routes http://127.0.0.1:3000
//! ```
//!
//! All server URLs must include the `http://` or `https://` prefix.

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use serde_json::Value;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use weft_client::WeftClient;
use weft_common::auth::AuthConfig;
use weft_server::{DatabaseConfig, Engine, EngineConfig, HttpServer};

/// Environment variable consulted when `--database` is not given.
const DATABASE_ENV: &str = "WEFT_DATABASE";

fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[derive(FromArgs)]
/// weft - scriptable HTTP endpoints backed by one JavaScript context
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Exec(ExecArgs),
    State(StateArgs),
    Routes(RoutesArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start a Weft server
struct ServeArgs {
    /// script to load at startup; repeat to load several, in order
    #[argh(option, short = 's', long = "script")]
    scripts: Vec<String>,

    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:3000\".into()")]
    bind: String,

    /// how long a request waits for the dispatcher, in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,

    /// largest accepted request body in bytes
    #[argh(option, long = "max-body-bytes", default = "1048576")]
    max_body_bytes: usize,

    /// SQLite file backing the script `db` object (in-memory when absent;
    /// falls back to WEFT_DATABASE)
    #[argh(option, long = "database")]
    database: Option<String>,

    /// API key required by the administrative endpoints
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// entries kept by each in-memory history log
    #[argh(option, long = "history", default = "500")]
    history: usize,

    /// path prefix of the administrative endpoints
    #[argh(option, long = "admin-prefix", default = "\"/_api\".into()")]
    admin_prefix: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "exec")]
/// run a script on a running server and print the result envelope
struct ExecArgs {
    /// server URL (e.g. http://127.0.0.1:3000)
    #[argh(positional)]
    server_address: String,

    /// read the script from this file
    #[argh(option, short = 'f', long = "file")]
    file: Option<String>,

    /// script text
    #[argh(option, short = 'e', long = "eval")]
    eval: Option<String>,

    /// API key for the administrative endpoints
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "state")]
/// print or replace the global state
struct StateArgs {
    /// server URL (e.g. http://127.0.0.1:3000)
    #[argh(positional)]
    server_address: String,

    /// replace the state with this JSON object
    #[argh(option, long = "set")]
    set: Option<String>,

    /// replace the state with the JSON object in this file
    #[argh(option, long = "file")]
    file: Option<String>,

    /// API key for the administrative endpoints
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "routes")]
/// list the routes registered on a server
struct RoutesArgs {
    /// server URL (e.g. http://127.0.0.1:3000)
    #[argh(positional)]
    server_address: String,

    /// API key for the administrative endpoints
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Client commands print JSON meant for piping; keep stdout clean.
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Exec(args) => run_exec(args).await,
        Commands::State(args) => run_state(args).await,
        Commands::Routes(args) => run_routes(args).await,
    }
}

fn engine_config(args: &ServeArgs, env_database: Option<String>) -> Result<EngineConfig> {
    let database = match args.database.clone().or(env_database) {
        Some(path) if !path.is_empty() => DatabaseConfig::File(PathBuf::from(path)),
        _ => DatabaseConfig::InMemory,
    };

    let config = EngineConfig::new()
        .with_response_timeout(Duration::from_millis(args.timeout_ms))
        .with_max_body_bytes(args.max_body_bytes)
        .with_admin_prefix(args.admin_prefix.clone())
        .with_history_capacity(args.history)
        .with_database(database);
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = engine_config(&args, std::env::var(DATABASE_ENV).ok())?;
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    tracing::info!("Starting Weft server on {}", addr);
    match &config.database {
        DatabaseConfig::InMemory => tracing::info!("Using in-memory database"),
        DatabaseConfig::File(path) => tracing::info!("Using database {}", path.display()),
    }

    let mut engine = Engine::new(config)?;
    if let Some(api_key) = &args.api_key {
        tracing::info!("API key authentication enabled for admin endpoints");
        engine = engine.with_auth(AuthConfig::with_api_key(api_key));
    }

    for script in &args.scripts {
        let result = engine.load_script_file(Path::new(script)).await?;
        if let Some(error) = result.error {
            bail!("Script {} failed: {}", script, error);
        }
    }
    if args.scripts.is_empty() {
        tracing::warn!("No scripts given; use the admin API to register routes");
    }

    HttpServer::new(Arc::new(engine)).run(addr).await?;
    Ok(())
}

fn client(server_address: &str, api_key: Option<String>) -> Result<WeftClient> {
    validate_http_url(server_address, "server address")?;
    let client = WeftClient::new(server_address)?;
    Ok(match api_key {
        Some(key) => client.with_api_key(key),
        None => client,
    })
}

/// Script text from `-e`, `-f` or stdin, in that order.
fn script_source(args: &ExecArgs) -> Result<String> {
    if let Some(code) = &args.eval {
        return Ok(code.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path));
    }
    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("Failed to read script from stdin")?;
    Ok(source)
}

async fn run_exec(args: ExecArgs) -> Result<()> {
    let client = client(&args.server_address, args.api_key.clone())?;
    let source = script_source(&args)?;

    let envelope = client.execute(source).await?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if !envelope.success {
        bail!(envelope.error.unwrap_or_else(|| "script failed".to_string()));
    }
    Ok(())
}

/// The replacement state from `--set` or `--file`, if any.
fn replacement_state(args: &StateArgs) -> Result<Option<Value>> {
    let text = match (&args.set, &args.file) {
        (Some(_), Some(_)) => bail!("Use either --set or --file, not both"),
        (Some(json), None) => json.clone(),
        (None, Some(path)) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
        }
        (None, None) => return Ok(None),
    };
    let state: Value = serde_json::from_str(&text).context("State is not valid JSON")?;
    if !state.is_object() {
        bail!("State must be a JSON object");
    }
    Ok(Some(state))
}

async fn run_state(args: StateArgs) -> Result<()> {
    let client = client(&args.server_address, args.api_key.clone())?;
    if let Some(state) = replacement_state(&args)? {
        client.replace_state(&state).await?;
    }
    println!("{}", serde_json::to_string_pretty(&client.state().await?)?);
    Ok(())
}

async fn run_routes(args: RoutesArgs) -> Result<()> {
    let client = client(&args.server_address, args.api_key)?;
    for route in client.routes().await? {
        println!("{:<7} {:<40} {}", route.method.as_str(), route.pattern, route.kind);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["weft"], args).unwrap()
    }

    fn serve_args(args: &[&str]) -> ServeArgs {
        let mut full = vec!["serve"];
        full.extend_from_slice(args);
        match parse(&full).command {
            Commands::Serve(args) => args,
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args = serve_args(&["-s", "app.js"]);
        assert_eq!(args.scripts, vec!["app.js".to_string()]);
        assert_eq!(args.bind, "127.0.0.1:3000");
        assert_eq!(args.timeout_ms, 30000);
        assert_eq!(args.max_body_bytes, 1048576);
        assert_eq!(args.history, 500);
        assert_eq!(args.admin_prefix, "/_api");
        assert!(args.database.is_none());
        assert!(args.api_key.is_none());
    }

    #[test]
    fn test_cli_parse_serve_multiple_scripts_in_order() {
        let args = serve_args(&["-s", "a.js", "--script", "b.js", "-b", "0.0.0.0:8080"]);
        assert_eq!(args.scripts, vec!["a.js".to_string(), "b.js".to_string()]);
        assert_eq!(args.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_engine_config_from_flags() {
        let args = serve_args(&[
            "--timeout-ms",
            "500",
            "--max-body-bytes",
            "64",
            "--admin-prefix",
            "/admin",
        ]);
        let config = engine_config(&args, None).unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.max_body_bytes, 64);
        assert_eq!(config.admin_prefix, "/admin");
        assert_eq!(config.database, DatabaseConfig::InMemory);
    }

    #[test]
    fn test_engine_config_database_env_fallback() {
        let args = serve_args(&[]);
        let config = engine_config(&args, Some("/tmp/weft.db".to_string())).unwrap();
        assert_eq!(config.database, DatabaseConfig::File(PathBuf::from("/tmp/weft.db")));

        let args = serve_args(&["--database", "/var/app.db"]);
        let config = engine_config(&args, Some("/tmp/weft.db".to_string())).unwrap();
        assert_eq!(config.database, DatabaseConfig::File(PathBuf::from("/var/app.db")));
    }

    #[test]
    fn test_engine_config_rejects_invalid_values() {
        assert!(engine_config(&serve_args(&["--timeout-ms", "0"]), None).is_err());
        assert!(engine_config(&serve_args(&["--admin-prefix", "admin"]), None).is_err());
        assert!(engine_config(&serve_args(&["--history", "0"]), None).is_err());
    }

    #[test]
    fn test_cli_parse_exec() {
        match parse(&["exec", "http://127.0.0.1:3000", "-e", "1 + 1"]).command {
            Commands::Exec(args) => {
                assert_eq!(args.server_address, "http://127.0.0.1:3000");
                assert_eq!(args.eval.as_deref(), Some("1 + 1"));
                assert!(args.file.is_none());
                assert_eq!(script_source(&args).unwrap(), "1 + 1");
            }
            _ => panic!("Expected Exec command"),
        }
    }

    #[test]
    fn test_exec_reads_script_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "state.x = 1").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        match parse(&["exec", "http://127.0.0.1:3000", "-f", &path]).command {
            Commands::Exec(args) => assert_eq!(script_source(&args).unwrap(), "state.x = 1"),
            _ => panic!("Expected Exec command"),
        }
    }

    #[test]
    fn test_state_replacement_parsing() {
        let args = |set: Option<&str>| StateArgs {
            server_address: "http://127.0.0.1:3000".to_string(),
            set: set.map(str::to_string),
            file: None,
            api_key: None,
        };

        assert_eq!(replacement_state(&args(None)).unwrap(), None);
        assert_eq!(
            replacement_state(&args(Some(r#"{"a": 1}"#))).unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(replacement_state(&args(Some("[1]"))).is_err());
        assert!(replacement_state(&args(Some("{broken"))).is_err());
    }

    #[test]
    fn test_cli_parse_routes() {
        match parse(&["routes", "https://weft.example.com", "--api-key", "k"]).command {
            Commands::Routes(args) => {
                assert_eq!(args.server_address, "https://weft.example.com");
                assert_eq!(args.api_key.as_deref(), Some("k"));
            }
            _ => panic!("Expected Routes command"),
        }
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:3000", "server address").is_ok());
        assert!(validate_http_url("https://example.com", "server address").is_ok());
        let err = validate_http_url("127.0.0.1:3000", "server address").unwrap_err();
        assert!(err.to_string().contains("must start with http:// or https://"));
    }
}
