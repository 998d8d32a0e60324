mod channel_writer;
mod russh_handler;
mod session;

use std::borrow::Cow;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orca_common::{ssh_server_id, Gateway};
use orca_core::logging::LogLevelHandle;
use orca_core::Services;
use russh::keys::{Algorithm, HashAlg};
use russh::{MethodKind, MethodSet, Preferred, SshId};
pub use russh_handler::ServerHandler;
pub use session::ServerSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Mutex;
use tracing::*;

/// Accept loop. Each connection gets its own session task and protocol
/// task; the session task ending tears the protocol down, closing the
/// socket. Gateway config swaps replace the russh config for new accepts
/// only, so live sessions keep the key they handshook with.
pub async fn run_server(
    services: Services,
    log_levels: LogLevelHandle,
    address: SocketAddr,
) -> Result<()> {
    let russh_config = Arc::new(Mutex::new(Arc::new(make_russh_config(
        &services.gateway_snapshot().await,
    )?)));

    tokio::spawn({
        let services = services.clone();
        let russh_config = russh_config.clone();
        let mut updates = services.config_store.watch_gateway(&services.zone);
        async move {
            while let Some(gateway) = updates.recv().await {
                debug!("New gateway settings received");
                log_levels.apply(gateway.log_level);
                match make_russh_config(&gateway) {
                    Ok(config) => {
                        *russh_config.lock().await = Arc::new(config);
                        info!("Gateway settings applied");
                    }
                    Err(error) => {
                        error!(%error, "New gateway settings are unusable, keeping current ones");
                    }
                }
                *services.gateway.lock().await = gateway;
            }
        }
    });

    let listener = TcpListener::bind(address)
        .await
        .context("binding the listen address")?;
    info!(%address, "Gateway is listening");

    loop {
        let (stream, remote_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(%error, "Failed to accept an incoming connection");
                continue;
            }
        };
        let russh_config = russh_config.lock().await.clone();

        let (event_tx, event_rx) = unbounded_channel();
        let handler = ServerHandler { event_tx };

        let session = match ServerSession::start(remote_address, &services, event_rx).await {
            Ok(session) => session,
            Err(error) => {
                error!(%error, "Error setting up session");
                continue;
            }
        };

        let protocol_task = tokio::spawn(_run_stream(russh_config, stream, handler));

        tokio::spawn(async move {
            if let Err(error) = session.await {
                debug!(%error, "Session ended");
            }
            // make sure the transport dies with the session
            protocol_task.abort();
        });
    }
}

async fn _run_stream<R>(
    config: Arc<russh::server::Config>,
    socket: R,
    handler: ServerHandler,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    let ret = async move {
        let session = russh::server::run_stream(config, socket, handler).await?;
        session.await?;
        Ok(())
    }
    .await;

    if let Err(ref error) = ret {
        error!(%error, "Session failed");
    }

    ret
}

fn make_russh_config(gateway: &Gateway) -> Result<russh::server::Config> {
    let host_key = russh::keys::decode_secret_key(&gateway.host_key, None)
        .context("parsing the gateway host key")?;

    Ok(russh::server::Config {
        server_id: SshId::Standard(ssh_server_id().into()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(
            &[
                MethodKind::PublicKey,
                MethodKind::Password,
                MethodKind::KeyboardInteractive,
            ][..],
        ),
        keys: vec![host_key],
        event_buffer_size: 100,
        nodelay: true,
        preferred: Preferred {
            key: Cow::Borrowed(&[
                Algorithm::Ed25519,
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha512),
                },
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                },
                Algorithm::Rsa { hash: None },
            ]),
            ..<_>::default()
        },
        ..<_>::default()
    })
}
