use clap::Parser;
use ja3proxy::{Cli, ProxyContext, ProxyServer, RunningConfig};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
  let config = RunningConfig::from(Cli::parse());
  let default_filter = if config.debug {
    "ja3proxy=debug"
  } else {
    "ja3proxy=info"
  };
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  match run(config).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("ja3proxy: {}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(config: RunningConfig) -> ja3proxy::Result<()> {
  let ctx = ProxyContext::from_config(config).await?;
  let server = ProxyServer::new(ctx);
  let listener = server.bind().await?;
  let addr = listener.local_addr()?;
  println!(
    "HTTP Proxy Server listen at {}, with tls fingerprint {}",
    addr,
    server.context().hello_id()
  );
  server
    .serve(listener, async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
