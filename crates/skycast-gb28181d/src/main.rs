use anyhow::{anyhow, Context};
use clap::Parser;
use skycast_config::{ConfigLoader, ProtocolConfig};
use skycast_gb28181::{Gb28181Config, Gb28181Service, MemoryRepository};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
use api::AppState;

const STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置目录（global.toml、protocols/gb28181.toml）
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    #[arg(long, default_value = "0.0.0.0:8081")]
    http_bind: String,

    /// 覆盖配置中的 SIP 监听地址
    #[arg(long)]
    sip_bind: Option<String>,

    /// 覆盖配置中的数据目录
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// 命令行覆盖 SIP 监听地址
fn apply_sip_bind(config: &mut Gb28181Config, sip_bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = sip_bind
        .parse()
        .map_err(|e| anyhow!("invalid sip_bind {}: {}", sip_bind, e))?;
    config.listen_ip = addr.ip().to_string();
    config.listen_port = addr.port();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "gb28181d", "SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!(target: "gb28181d", "Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => tracing::info!(target: "gb28181d", "Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: "gb28181d", "Received Ctrl+C");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let loader = ConfigLoader::new(&args.config_dir);
    loader.validate()?;
    let global = loader.load_global()?;
    let protocol: ProtocolConfig<Gb28181Config> = loader.load_protocol("gb28181")?;

    let mut config = protocol.server;
    if let Some(sip_bind) = &args.sip_bind {
        apply_sip_bind(&mut config, sip_bind)?;
    }
    let data_dir = args.data_dir.clone().unwrap_or(global.storage.data_dir);

    tracing::info!(
        target: "gb28181d",
        system = %global.system.name,
        listen = %config.listen_addr(),
        transport = %config.transport,
        data_dir = %data_dir.display(),
        "Starting GB28181 signaling daemon"
    );

    let repo = Arc::new(MemoryRepository::new());
    let service = Arc::new(Gb28181Service::new(config, repo, data_dir));
    service
        .start(STOP_DEADLINE)
        .await
        .context("failed to start GB28181 service")?;

    let app = api::router(AppState {
        service: service.clone(),
    });

    let addr = args.http_bind;
    tracing::info!(target: "gb28181d", "http listening on {}", addr);

    axum::Server::bind(
        &addr
            .parse()
            .map_err(|e| anyhow!("invalid http_bind {}: {}", addr, e))?,
    )
    .serve(app.into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    service.stop(STOP_DEADLINE).await?;
    tracing::info!(target: "gb28181d", "GB28181 signaling daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sip_bind() {
        let mut config = Gb28181Config::default();
        apply_sip_bind(&mut config, "127.0.0.1:15060").unwrap();
        assert_eq!(config.listen_ip, "127.0.0.1");
        assert_eq!(config.listen_port, 15060);

        assert!(apply_sip_bind(&mut config, "not-an-addr").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["skycast-gb28181d"]);
        assert_eq!(args.config_dir, PathBuf::from("./config"));
        assert_eq!(args.http_bind, "0.0.0.0:8081");
        assert!(args.sip_bind.is_none());
    }

    #[test]
    fn test_load_gb28181_config_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("protocols")).unwrap();
        std::fs::write(
            dir.path().join("protocols").join("gb28181.toml"),
            r#"
[server]
listen_port = 15060
transport = "both"
realm = "4401000000"
media_port_start = 31000
media_port_end = 31010
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path());
        let protocol: ProtocolConfig<Gb28181Config> = loader.load_protocol("gb28181").unwrap();
        let cfg = protocol.server;
        assert_eq!(cfg.listen_port, 15060);
        assert_eq!(cfg.transport, skycast_gb28181::TransportMode::Both);
        assert_eq!(cfg.realm, "4401000000");
        assert_eq!(cfg.media_port_start, 31000);
        assert_eq!(cfg.register_expires, 3600);
    }
}
