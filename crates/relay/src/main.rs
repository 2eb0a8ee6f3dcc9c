use std::sync::Arc;

use anyhow::Context;
use gridsync_relay::{create_registry, serve, RelayConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("gridsync-relay - sync rooms for collaborative sheets");
    println!();
    println!("USAGE:");
    println!("    gridsync-relay [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -b, --bind ADDR    Listen address (default 127.0.0.1:9031)");
    println!("    --init-config      Write a default config file and exit");
    println!("    -h, --help         Print help information");
    println!("    -v, --version      Print version");
    println!();
    println!("CONFIG:");
    println!("    ~/.config/gridsync/relay.toml");
    println!();
    println!("ENVIRONMENT:");
    println!("    GRIDSYNC_BIND      Listen address, overridden by --bind");
    println!("    RUST_LOG           Log filter (default: info)");
}

/// What the command line asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Serve,
    Version,
    Help,
    InitConfig,
}

/// Parse arguments (without the program name), applying overrides to `config`
fn parse_args(args: &[String], config: &mut RelayConfig) -> anyhow::Result<Command> {
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-v" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            "--init-config" => return Ok(Command::InitConfig),
            "--bind" | "-b" => {
                let addr = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value for {arg} (see --help)"))?;
                config.bind.clone_from(addr);
            }
            other => anyhow::bail!("unknown argument {other:?} (see --help)"),
        }
    }
    Ok(Command::Serve)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging (tracing)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let mut config = RelayConfig::load();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args, &mut config)? {
        Command::Serve => {}
        Command::Version => {
            println!("gridsync-relay {VERSION}");
            return Ok(());
        }
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::InitConfig => {
            let path = RelayConfig::create_default_if_missing()?;
            println!("{}", path.display());
            return Ok(());
        }
    }

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(
        listener,
        create_registry(),
        Arc::new(config),
        shutdown.clone(),
    ));

    // Wait for Ctrl+C or SIGTERM
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    server.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn bind_overrides_config() {
        let mut config = RelayConfig::default();
        let command = parse_args(&args(&["-b", "0.0.0.0:9100"]), &mut config).unwrap();
        assert_eq!(command, Command::Serve);
        assert_eq!(config.bind, "0.0.0.0:9100");
    }

    #[test]
    fn trailing_bind_reports_missing_value() {
        let mut config = RelayConfig::default();
        let err = parse_args(&args(&["--bind"]), &mut config).unwrap_err();
        assert_eq!(err.to_string(), "missing value for --bind (see --help)");
        assert_eq!(config.bind, RelayConfig::default().bind);
    }

    #[test]
    fn unknown_argument_is_rejected() {
        let mut config = RelayConfig::default();
        let err = parse_args(&args(&["--port"]), &mut config).unwrap_err();
        assert!(err.to_string().contains("unknown argument \"--port\""));
    }

    #[test]
    fn informational_flags_stop_parsing() {
        let mut config = RelayConfig::default();
        assert_eq!(parse_args(&args(&["-v", "--bogus"]), &mut config).unwrap(), Command::Version);
        assert_eq!(parse_args(&args(&["--help"]), &mut config).unwrap(), Command::Help);
        assert_eq!(parse_args(&args(&["--init-config"]), &mut config).unwrap(), Command::InitConfig);
    }
}
