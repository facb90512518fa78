//! `p2pfs server`: serve chat, greeting and file requests until interrupted.

use std::time::Duration;

use anyhow::Context;
use p2pfs_core::{
    ChatResponder, FileResponder, HelloResponder, Host, Keypair, ListenAddress, CHAT_PROTOCOL,
    FILE_SHARE_PROTOCOL, HELLO_PROTOCOL,
};
use tracing::{info, warn};

use crate::config::Config;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let keypair = load_identity(cfg)?;
    let host = Host::new(keypair);
    register_handlers(&host, cfg).await;

    let listen: ListenAddress = cfg
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", cfg.listen))?;
    host.listen(&listen)
        .await
        .with_context(|| format!("listening on {}", listen))?;
    for addr in host.peer_addresses().await {
        println!("Listening on {}", addr);
    }
    info!(root = %cfg.root.display(), chunk_size = cfg.chunk_size, "serving files");

    shutdown_signal().await?;
    info!("shutting down");
    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    if tokio::time::timeout(grace, host.close()).await.is_err() {
        warn!(grace_secs = cfg.shutdown_grace_secs, "streams still open, exiting anyway");
    }
    Ok(())
}

pub(crate) fn load_identity(cfg: &Config) -> anyhow::Result<Keypair> {
    match &cfg.identity_file {
        Some(path) => Keypair::load_or_generate(path)
            .with_context(|| format!("identity file {}", path.display())),
        None => Ok(Keypair::generate()),
    }
}

async fn register_handlers(host: &Host, cfg: &Config) {
    host.set_stream_handler(
        FILE_SHARE_PROTOCOL,
        FileResponder::new(&cfg.root, cfg.chunk_size),
    )
    .await;
    host.set_stream_handler(CHAT_PROTOCOL, ChatResponder).await;
    host.set_stream_handler(HELLO_PROTOCOL, HelloResponder).await;
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pfs_core::hello::read_greeting;
    use p2pfs_core::HELLO_GREETING;

    #[tokio::test]
    async fn registered_handlers_answer() {
        let root = tempfile::tempdir().unwrap();
        let cfg = Config {
            root: root.path().to_path_buf(),
            ..Config::default()
        };
        let server = Host::new(load_identity(&cfg).unwrap());
        register_handlers(&server, &cfg).await;
        let bound = server
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = bound.with_peer(server.peer_id());

        let client = Host::new(Keypair::generate());
        client.connect(&addr).await.unwrap();
        let mut stream = client
            .new_stream(addr.peer_id(), HELLO_PROTOCOL)
            .await
            .unwrap();
        assert_eq!(read_greeting(&mut stream).await.unwrap(), HELLO_GREETING);
        drop(stream);
        client.close().await;
        server.close().await;
    }

    #[test]
    fn identity_file_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            identity_file: Some(dir.path().join("id.key")),
            ..Config::default()
        };
        let first = load_identity(&cfg).unwrap().peer_id();
        let second = load_identity(&cfg).unwrap().peer_id();
        assert_eq!(first, second);
    }
}
