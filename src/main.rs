//! tarmoq broker
//!
//! Accepts agent control channels over WebSocket and exposes their tunnels on
//! public subdomains (HTTP) or allocated ports (TCP).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tarmoq_auth::{
    JwtAuthorizer, JwtClaims, QuotaLedger, StaticTokenStore, TokenAuthorizer, UnlimitedQuota,
};
use tarmoq_control::{Broker, BrokerConfig};
use tarmoq_transport_websocket::{WebSocketConfig, WebSocketListener};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tarmoq")]
#[command(about = "Run a tunnel broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a JWT for agent authentication
    GenerateToken {
        /// JWT secret (must match the broker's --jwt-secret)
        #[arg(long, env = "TARMOQ_JWT_SECRET")]
        secret: String,

        /// Identity the token is issued to
        #[arg(long, default_value = "agent")]
        identity: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Agent control channel bind address
    #[arg(long, env = "TARMOQ_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Host used in public tunnel URLs
    #[arg(long, env = "TARMOQ_PUBLIC_HOST", default_value = "localhost")]
    public_host: String,

    /// Upgrade path for HTTP tunnel agents
    #[arg(long, default_value = "/server")]
    http_path: String,

    /// Upgrade path for TCP tunnel agents
    #[arg(long, default_value = "/tcp")]
    tcp_path: String,

    /// Address TCP tunnel listeners bind on
    #[arg(long, env = "TARMOQ_TCP_BIND_IP", default_value = "0.0.0.0")]
    tcp_bind_ip: IpAddr,

    /// First port handed out to TCP tunnels
    #[arg(long, env = "TARMOQ_PORT_MIN", default_value_t = tarmoq_proto::DEFAULT_MIN_PORT)]
    port_min: u16,

    /// Last port handed out to TCP tunnels
    #[arg(long, env = "TARMOQ_PORT_MAX", default_value_t = tarmoq_proto::DEFAULT_MAX_PORT)]
    port_max: u16,

    /// Maximum HTTP tunnels per identity
    #[arg(long, default_value_t = tarmoq_proto::DEFAULT_HTTP_TUNNEL_LIMIT)]
    http_tunnel_limit: usize,

    /// Maximum TCP tunnels per identity
    #[arg(long, default_value_t = tarmoq_proto::DEFAULT_TCP_TUNNEL_LIMIT)]
    tcp_tunnel_limit: usize,

    /// Seconds a forwarded request waits for the agent
    #[arg(long, env = "TARMOQ_REQUEST_TIMEOUT", default_value = "60")]
    request_timeout: u64,

    /// Seconds of silence after which an agent counts as gone
    #[arg(long, default_value = "90")]
    keepalive_grace: u64,

    /// Static agent token, as TOKEN=IDENTITY (repeatable)
    #[arg(long = "token", value_parser = parse_token)]
    tokens: Vec<(String, String)>,

    /// JWT secret; when set, agents authenticate with signed tokens instead
    #[arg(long, env = "TARMOQ_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Forwarded-request allowance, as IDENTITY=COUNT (repeatable; unlisted identities are unlimited)
    #[arg(long = "quota", value_parser = parse_quota)]
    quotas: Vec<(String, u64)>,
}

fn parse_token(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((token, identity)) if !token.is_empty() && !identity.is_empty() => {
            Ok((token.to_string(), identity.to_string()))
        }
        _ => Err(format!("expected TOKEN=IDENTITY, got '{}'", s)),
    }
}

fn parse_quota(s: &str) -> Result<(String, u64), String> {
    let (identity, count) = s
        .split_once('=')
        .filter(|(identity, _)| !identity.is_empty())
        .ok_or_else(|| format!("expected IDENTITY=COUNT, got '{}'", s))?;
    let count = count
        .parse()
        .map_err(|e| format!("invalid count in '{}': {}", s, e))?;
    Ok((identity.to_string(), count))
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

struct Credentials {
    authorizer: Arc<dyn TokenAuthorizer>,
    quota: Arc<dyn QuotaLedger>,
}

fn build_credentials(args: &ServerArgs) -> Result<Credentials> {
    let store = Arc::new(StaticTokenStore::new());
    for (identity, count) in &args.quotas {
        store.set_quota(identity.clone(), *count);
    }
    let quota: Arc<dyn QuotaLedger> = if args.quotas.is_empty() {
        Arc::new(UnlimitedQuota)
    } else {
        info!("Request quotas set for {} identity(ies)", args.quotas.len());
        store.clone()
    };

    if let Some(secret) = &args.jwt_secret {
        if !args.tokens.is_empty() {
            warn!("--jwt-secret is set; ignoring {} static token(s)", args.tokens.len());
        }
        info!("Authenticating agents with JWT");
        return Ok(Credentials {
            authorizer: Arc::new(JwtAuthorizer::new(secret.as_bytes())),
            quota,
        });
    }

    if args.tokens.is_empty() {
        anyhow::bail!("no credentials configured: pass --token TOKEN=IDENTITY or --jwt-secret");
    }

    for (token, identity) in &args.tokens {
        store.insert(token.clone(), identity.clone());
    }
    info!("Authenticating agents with {} static token(s)", store.len());
    Ok(Credentials {
        authorizer: store,
        quota,
    })
}

fn broker_config(args: &ServerArgs) -> Result<BrokerConfig> {
    if args.port_min > args.port_max {
        anyhow::bail!(
            "invalid port range {}-{}",
            args.port_min,
            args.port_max
        );
    }

    Ok(BrokerConfig::default()
        .with_public_host(args.public_host.clone())
        .with_tunnel_caps(args.http_tunnel_limit, args.tcp_tunnel_limit)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_keepalive_grace(Duration::from_secs(args.keepalive_grace))
        .with_port_range(args.port_min..=args.port_max)
        .with_tcp_bind_ip(args.tcp_bind_ip))
}

async fn run_broker(args: ServerArgs) -> Result<()> {
    let credentials = build_credentials(&args)?;
    let broker = Arc::new(
        Broker::new(broker_config(&args)?, credentials.authorizer).with_quota(credentials.quota),
    );

    let ws_config = WebSocketConfig::new(args.bind).with_paths(&args.http_path, &args.tcp_path);
    let listener = WebSocketListener::bind(ws_config)
        .await
        .context("Failed to start agent listener")?;

    info!("Public host: {}", args.public_host);
    info!("TCP tunnel ports: {}-{}", args.port_min, args.port_max);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(listener.serve(broker.clone(), shutdown.clone()));

    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    shutdown.cancel();
    server.await.context("Agent listener task panicked")?;

    for tunnel in broker.tunnels() {
        broker.close_session(&tunnel.session_id).await;
    }
    info!("tarmoq stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Some(Commands::GenerateToken {
            secret,
            identity,
            hours,
        }) => {
            let claims = JwtClaims::new(identity.clone(), "tarmoq", chrono::Duration::hours(hours));
            let token = JwtAuthorizer::encode(secret.as_bytes(), &claims)
                .context("Failed to generate token")?;

            println!("Identity:  {}", identity);
            println!("Valid for: {} hours", hours);
            println!("\n{}\n", token);
            Ok(())
        }
        None => {
            info!("tarmoq {} ({}) starting", env!("GIT_TAG"), env!("GIT_HASH"));
            run_broker(cli.server_args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        assert_eq!(
            parse_token("tok-a=alice").unwrap(),
            ("tok-a".to_string(), "alice".to_string())
        );
        assert!(parse_token("tok-a").is_err());
        assert!(parse_token("=alice").is_err());
    }

    #[test]
    fn test_cli_parses_server_args() {
        let cli = Cli::parse_from([
            "tarmoq",
            "--public-host",
            "tarmoq.dev",
            "--token",
            "tok-a=alice",
            "--port-min",
            "40000",
            "--port-max",
            "40010",
        ]);
        assert!(cli.command.is_none());

        let config = broker_config(&cli.server_args).unwrap();
        assert_eq!(config.public_host, "tarmoq.dev");
        assert_eq!(config.port_range, 40000..=40010);
        assert!(build_credentials(&cli.server_args).is_ok());
    }

    #[test]
    fn test_parse_quota() {
        assert_eq!(parse_quota("alice=100").unwrap(), ("alice".to_string(), 100));
        assert!(parse_quota("alice").is_err());
        assert!(parse_quota("=5").is_err());
        assert!(parse_quota("alice=-1").is_err());
    }

    #[tokio::test]
    async fn test_quota_flag_reaches_ledger() {
        let cli = Cli::parse_from([
            "tarmoq",
            "--token",
            "tok-a=alice",
            "--quota",
            "alice=2",
        ]);
        let credentials = build_credentials(&cli.server_args).unwrap();

        let alice = credentials.authorizer.authorize("tok-a").await.unwrap();
        assert_eq!(credentials.quota.check(&alice).await.unwrap(), 2);
        assert_eq!(credentials.quota.decrement(&alice).await.unwrap(), 1);

        let bob = tarmoq_auth::Identity::new("bob");
        assert_eq!(credentials.quota.check(&bob).await.unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn test_quota_without_static_tokens_in_jwt_mode() {
        let cli = Cli::parse_from([
            "tarmoq",
            "--jwt-secret",
            "s3cret",
            "--quota",
            "alice=0",
        ]);
        let credentials = build_credentials(&cli.server_args).unwrap();

        let alice = tarmoq_auth::Identity::new("alice");
        assert!(credentials.quota.check(&alice).await.is_err());
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let cli = Cli::parse_from(["tarmoq", "--port-min", "5", "--port-max", "1"]);
        assert!(broker_config(&cli.server_args).is_err());
    }
}
