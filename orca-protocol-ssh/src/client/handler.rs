use orca_core::Services;
use russh::client::{Msg, Session};
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::Channel;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

use crate::known_hosts::{KnownHostValidationResult, KnownHosts};
use crate::{ConnectionError, ForwardedTcpIpParams, TargetAddress};

#[derive(Debug)]
pub enum ClientHandlerEvent {
    ForwardedTcpIp(Channel<Msg>, ForwardedTcpIpParams),
    X11(Channel<Msg>, String, u32),
    /// The backend wants to talk to the client's forwarded agent.
    ForwardedAgent(Channel<Msg>),
    Disconnect,
}

pub struct ClientHandler {
    pub session_id: orca_common::SessionId,
    pub services: Services,
    pub target: TargetAddress,
    pub event_tx: UnboundedSender<ClientHandlerEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHandlerError {
    #[error("connection error")]
    ConnectionError(ConnectionError),

    #[error("SSH")]
    Ssh(#[from] russh::Error),

    #[error("internal error")]
    Internal,
}

impl russh::client::Handler for ClientHandler {
    type Error = ClientHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let gateway = self.services.gateway_snapshot().await;
        if !gateway.verify_host_keys {
            warn!(
                session=%self.session_id,
                host=%self.target.host,
                "backend host key verification is DISABLED, accepting the {} key unchecked",
                server_public_key.algorithm(),
            );
            return Ok(true);
        }

        let known_hosts = KnownHosts::new(&self.services.kv, &self.services.zone);
        match known_hosts
            .validate(&self.target.host, self.target.port, server_public_key)
            .await
        {
            Ok(KnownHostValidationResult::Valid) => Ok(true),
            Ok(KnownHostValidationResult::Invalid {
                key_type,
                key_base64,
            }) => {
                error!(
                    session=%self.session_id,
                    host=%self.target.host,
                    stored_type=%key_type,
                    stored=%key_base64,
                    received_type=%server_public_key.algorithm(),
                    received=%server_public_key.public_key_base64(),
                    "backend host key mismatch, refusing to connect",
                );
                Ok(false)
            }
            Ok(KnownHostValidationResult::Unknown) => {
                info!(
                    session=%self.session_id,
                    host=%self.target.host,
                    "trusting previously unseen {} host key",
                    server_public_key.algorithm(),
                );
                if let Err(error) = known_hosts
                    .trust(&self.target.host, self.target.port, server_public_key)
                    .await
                {
                    error!(?error, session=%self.session_id, "failed to store host key");
                }
                Ok(true)
            }
            Err(error) => {
                error!(?error, session=%self.session_id, "failed to verify host key");
                Err(ClientHandlerError::Internal)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ClientHandlerEvent::ForwardedTcpIp(
            channel,
            ForwardedTcpIpParams {
                connected_address: connected_address.to_string(),
                connected_port,
                originator_address: originator_address.to_string(),
                originator_port,
            },
        ));
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ClientHandlerEvent::X11(
            channel,
            originator_address.to_string(),
            originator_port,
        ));
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self
            .event_tx
            .send(ClientHandlerEvent::ForwardedAgent(channel));
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let _ = self.event_tx.send(ClientHandlerEvent::Disconnect);
        debug!(session=%self.session_id, "Dropped");
    }
}
