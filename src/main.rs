use clap::Parser;
use slinger_capture::{CaptureConfig, CaptureProxy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TLS-intercepting capture proxy
#[derive(Parser, Debug)]
#[command(name = "slinger-capture", version, about)]
struct Args {
  /// Listen for incoming connections on [host:]port
  #[arg(long, default_value = "8888", value_parser = parse_listen)]
  listen: String,
  /// Directory holding certificates, config.json and the bundled UI
  #[arg(long, env = "SLINGER_CAPTURE_DATA_DIR", default_value = ".")]
  data_dir: PathBuf,
  /// Verbose logging
  #[arg(long)]
  debug: bool,
}

/// `port` or `host:port`, normalized to `host:port`
fn parse_listen(value: &str) -> Result<String, String> {
  let (host, port) = match value.rsplit_once(':') {
    Some((host, port)) => (host, port),
    None => ("", value),
  };
  port
    .parse::<u16>()
    .map_err(|_| format!("Invalid port: {}", port))?;
  let host = if host.is_empty() { "0.0.0.0" } else { host };
  Ok(format!("{}:{}", host, port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();
  let default_level = if args.debug { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .init();

  let proxy = CaptureProxy::new(CaptureConfig::new(&args.data_dir)).await?;
  println!("Root CA: {}", proxy.ca_cert_path().display());

  let (addr, serve) = proxy.bind(args.listen.as_str()).await?;
  println!("Listening on {}", addr);

  tokio::select! {
    _ = serve => {},
    result = tokio::signal::ctrl_c() => {
      result?;
      tracing::info!("Shutting down");
    }
  }
  Ok(())
}
