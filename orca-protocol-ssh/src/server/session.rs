use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Poll;

use anyhow::{Context, Result};
use bimap::BiMap;
use bytes::Bytes;
use futures::{Future, FutureExt};
use orca_common::helpers::fingerprint;
use orca_common::{OrcaError, Secret, SessionId, User};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::{CryptoVec, MethodKind, MethodSet};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::*;
use uuid::Uuid;

use orca_core::{AuthOutcome, Services};

use super::channel_writer::ChannelWriter;
use super::russh_handler::ServerHandlerEvent;
use crate::cidr::check_backend_access;
use crate::compat::ContextExt;
use crate::{
    ChannelOperation, ConnectParams, DirectTCPIPParams, PtyRequest, RCCommand, RCCommandReply,
    RCEvent, RCState, RemoteClient, ServerChannelId, SshClientError, TargetAddress, X11Request,
};

#[derive(Clone, Debug)]
enum TargetSelection {
    None,
    Selected(TargetAddress),
}

#[derive(Debug)]
enum Event {
    ServerHandler(ServerHandlerEvent),
    Client(RCEvent),
}

enum KeyboardInteractiveState {
    None,
    OtpRequested,
}

/// One proxied client connection. Owns the channel map between the client
/// side and the backend actor, runs the auth callbacks, and mirrors events
/// between the two SSH connections.
///
/// Nothing client-originated reaches the backend before it is connected:
/// the backend actor buffers operations in arrival order and replays them
/// once the dial (triggered by the client's `auth-agent-req`) completes.
pub struct ServerSession {
    pub id: SessionId,
    remote_address: SocketAddr,
    services: Services,
    gateway: orca_common::Gateway,
    session_handle: Option<russh::server::Handle>,
    username: Option<String>,
    auth_user: Option<User>,
    target: TargetSelection,
    channel_map: BiMap<ServerChannelId, Uuid>,
    all_channels: Vec<Uuid>,
    channel_writer: ChannelWriter,
    rc_tx: UnboundedSender<(RCCommand, Option<RCCommandReply>)>,
    rc_abort_tx: UnboundedSender<()>,
    rc_state: RCState,
    event_rx: UnboundedReceiver<Event>,
    keyboard_interactive_state: KeyboardInteractiveState,
}

fn session_debug_tag(id: &SessionId, remote_address: &SocketAddr) -> String {
    format!("[{id} - {remote_address}]")
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", session_debug_tag(&self.id, &self.remote_address))
    }
}

impl ServerSession {
    pub async fn start(
        remote_address: SocketAddr,
        services: &Services,
        mut handler_event_rx: UnboundedReceiver<ServerHandlerEvent>,
    ) -> Result<impl Future<Output = Result<()>>> {
        let id = Uuid::new_v4();

        let _span = info_span!("SSH", session=%id);
        let _enter = _span.enter();

        let gateway = services.gateway_snapshot().await;
        let mut rc_handles = RemoteClient::create(id, services.clone());
        let rc_tx = rc_handles.command_tx.clone();
        let rc_abort_tx = rc_handles.abort_tx.clone();

        let (event_tx, event_rx) = unbounded_channel();

        tokio::spawn({
            let sender = event_tx.clone();
            async move {
                while let Some(e) = handler_event_rx.recv().await {
                    if sender.send(Event::ServerHandler(e)).is_err() {
                        break;
                    }
                }
            }
        });

        tokio::spawn({
            let sender = event_tx;
            async move {
                while let Some(e) = rc_handles.event_rx.recv().await {
                    if sender.send(Event::Client(e)).is_err() {
                        break;
                    }
                }
            }
        });

        let mut this = Self {
            id,
            remote_address,
            services: services.clone(),
            gateway,
            session_handle: None,
            username: None,
            auth_user: None,
            target: TargetSelection::None,
            channel_map: BiMap::new(),
            all_channels: vec![],
            channel_writer: ChannelWriter::new(),
            rc_tx,
            rc_abort_tx,
            rc_state: RCState::NotInitialized,
            event_rx,
            keyboard_interactive_state: KeyboardInteractiveState::None,
        };

        info!(%remote_address, "New connection");

        Ok(async move {
            while let Some(event) = this.get_next_event().await {
                this.handle_event(event).await?;
            }
            debug!("No more events");
            Ok::<_, anyhow::Error>(())
        })
    }

    async fn get_next_event(&mut self) -> Option<Event> {
        self.event_rx.recv().await
    }

    fn make_logging_span(&self) -> tracing::Span {
        let client_ip = self.remote_address.ip().to_string();
        match self.username {
            Some(ref username) => {
                info_span!("SSH", session=%self.id, session_username=%username, %client_ip)
            }
            None => info_span!("SSH", session=%self.id, %client_ip),
        }
    }

    fn map_channel(&self, ch: &ServerChannelId) -> Result<Uuid> {
        self.channel_map
            .get_by_left(ch)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Channel not known"))
    }

    fn map_channel_reverse(&self, ch: &Uuid) -> Result<ServerChannelId> {
        self.channel_map
            .get_by_right(ch)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Channel not known"))
    }

    fn handle_event<'a>(
        &'a mut self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        async move {
            match event {
                Event::Client(RCEvent::Done) => Err(OrcaError::SessionEnd)?,
                Event::ServerHandler(ServerHandlerEvent::Disconnect) => {
                    Err(OrcaError::SessionEnd)?
                }
                Event::ServerHandler(e) => {
                    let span = self.make_logging_span();
                    if let Err(err) = self.handle_server_handler_event(e).instrument(span).await {
                        if is_session_end(&err) {
                            return Err(err);
                        }
                        error!("Server event handler error: {:?}", err);
                    }
                }
                Event::Client(e) => {
                    let span = self.make_logging_span();
                    if let Err(err) = self.handle_remote_event(e).instrument(span).await {
                        if is_session_end(&err) {
                            return Err(err);
                        }
                        error!("Client event handler error: {:?}", err);
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn handle_server_handler_event(&mut self, event: ServerHandlerEvent) -> Result<()> {
        match event {
            ServerHandlerEvent::Authenticated(handle) => {
                self.session_handle = Some(handle.0);
                if let Err(error) = self.setup_target().await {
                    warn!(%error, "Rejecting session");
                    self.request_disconnect().await;
                    self.disconnect_server().await;
                    return Err(OrcaError::SessionEnd.into());
                }
            }

            ServerHandlerEvent::AuthPublicKey(username, key, reply) => {
                let _ = reply.send(self._auth_publickey(username, key).await);
            }

            ServerHandlerEvent::AuthPassword(username, password, reply) => {
                let _ = reply.send(self._auth_otp(username, password).await);
            }

            ServerHandlerEvent::AuthKeyboardInteractive(username, response, reply) => {
                let _ = reply.send(self._auth_keyboard_interactive(username, response).await);
            }

            ServerHandlerEvent::ChannelOpenSession(server_channel_id, reply) => {
                let channel = Uuid::new_v4();
                self.channel_map.insert(server_channel_id, channel);

                info!(%channel, "Opening session channel");
                return match self
                    .send_command_and_wait(RCCommand::Channel(
                        channel,
                        ChannelOperation::OpenSession,
                    ))
                    .await
                {
                    Ok(()) => {
                        self.all_channels.push(channel);
                        let _ = reply.send(true);
                        Ok(())
                    }
                    Err(SshClientError::Russh(russh::Error::ChannelOpenFailure(_))) => {
                        let _ = reply.send(false);
                        Ok(())
                    }
                    Err(x) => Err(x.into()),
                };
            }

            ServerHandlerEvent::ChannelOpenDirectTcpIp(channel, params, reply) => {
                let _ = reply.send(self._channel_open_direct_tcpip(channel, params).await?);
            }

            ServerHandlerEvent::PtyRequest(server_channel_id, request, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestPty(request),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::ShellRequest(server_channel_id, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                if self.rc_state == RCState::NotInitialized {
                    error!(%channel_id, "Shell requested without agent forwarding");
                    let _ = reply.send(false);
                    self.request_disconnect().await;
                    return Ok(());
                }
                info!(%channel_id, "Opening shell");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestShell,
                ));
                let _ = reply.send(true);
            }

            ServerHandlerEvent::ExecRequest(server_channel_id, data, reply) => {
                match self._channel_exec_request(server_channel_id, data).await {
                    Ok(()) => {
                        let _ = reply.send(true);
                    }
                    Err(error) => {
                        warn!(channel=%server_channel_id, %error, "Exec request denied");
                        let _ = reply.send(false);
                    }
                }
            }

            ServerHandlerEvent::SubsystemRequest(server_channel_id, name, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                if self.rc_state == RCState::NotInitialized {
                    error!(%channel_id, "Subsystem requested without agent forwarding");
                    let _ = reply.send(false);
                    self.request_disconnect().await;
                    return Ok(());
                }
                info!(%channel_id, %name, "Requesting subsystem");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestSubsystem(name),
                ));
                let _ = reply.send(true);
            }

            ServerHandlerEvent::EnvRequest(server_channel_id, name, value, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                debug!(channel=%channel_id, %name, %value, "Environment");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestEnv(name, value),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::X11Request(server_channel_id, request, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                debug!(channel=%channel_id, "Requested X11");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestX11(request),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::AgentForward(server_channel_id, reply) => {
                match self._agent_forward(server_channel_id).await {
                    Ok(()) => {
                        let _ = reply.send(true);
                    }
                    Err(error) => {
                        error!(%error, "Agent forwarding rejected");
                        let _ = reply.send(false);
                        self.request_disconnect().await;
                        self.disconnect_server().await;
                        return Err(OrcaError::SessionEnd.into());
                    }
                }
            }

            ServerHandlerEvent::WindowChangeRequest(server_channel_id, request, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::ResizePty(request),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::Signal(server_channel_id, signal, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                debug!(channel=%channel_id, ?signal, "Signal");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::Signal(signal),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::Data(server_channel_id, data, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::Data(data),
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::ExtendedData(server_channel_id, data, code, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::ExtendedData { data, ext: code },
                ));
                let _ = reply.send(());
            }

            ServerHandlerEvent::ChannelEof(server_channel_id, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                debug!(channel=%channel_id, "EOF");
                let _ = self.send_command(RCCommand::Channel(channel_id, ChannelOperation::Eof));
                let _ = reply.send(());
            }

            ServerHandlerEvent::ChannelClose(server_channel_id, reply) => {
                let channel_id = self.map_channel(&server_channel_id)?;
                debug!(channel=%channel_id, "Closing channel");
                let _ = self.send_command(RCCommand::Channel(channel_id, ChannelOperation::Close));
                let _ = reply.send(());
            }

            ServerHandlerEvent::TcpIpForward(address, port, reply) => {
                if !self.gateway.forward_ports {
                    info!(%address, %port, "Remote port forwarding refused by configuration");
                    let _ = reply.send(false);
                    return Ok(());
                }
                info!(%address, %port, "Remote port forwarding requested");
                let _ = self.send_command(RCCommand::ForwardTcpIp(address, port));
                let _ = reply.send(true);
            }

            ServerHandlerEvent::CancelTcpIpForward(address, port, reply) => {
                if !self.gateway.forward_ports {
                    let _ = reply.send(false);
                    return Ok(());
                }
                info!(%address, %port, "Remote port forwarding cancelled");
                let _ = self.send_command(RCCommand::CancelTcpIpForward(address, port));
                let _ = reply.send(true);
            }

            ServerHandlerEvent::Disconnect => (),
        }

        Ok(())
    }

    async fn handle_remote_event(&mut self, event: RCEvent) -> Result<()> {
        match event {
            RCEvent::State(state) => {
                self.rc_state = state;
                match &self.rc_state {
                    RCState::Connected => {
                        info!("Backend ready");
                    }
                    RCState::Disconnected => {
                        self.disconnect_server().await;
                    }
                    _ => {}
                }
            }
            RCEvent::ConnectionError(error) => {
                error!(%error, "Backend connection failed");
            }
            RCEvent::Error(error) => {
                error!(%error, "Backend error");
                self.request_disconnect().await;
            }
            RCEvent::Output(channel, data) => {
                let server_channel_id = self.map_channel_reverse(&channel)?;
                if let Some(session) = self.session_handle.clone() {
                    self.channel_writer.write(
                        session,
                        server_channel_id.0,
                        CryptoVec::from_slice(&data),
                    );
                }
            }
            RCEvent::ExtendedData { channel, data, ext } => {
                let server_channel_id = self.map_channel_reverse(&channel)?;
                if let Some(session) = self.session_handle.clone() {
                    self.channel_writer.write_extended(
                        session,
                        server_channel_id.0,
                        ext,
                        CryptoVec::from_slice(&data),
                    );
                }
            }
            RCEvent::Success(channel) => {
                let server_channel_id = self.map_channel_reverse(&channel)?;
                self.maybe_with_session(|handle| async move {
                    handle
                        .channel_success(server_channel_id.0)
                        .await
                        .context("failed to mirror success")
                })
                .await?;
            }
            RCEvent::ChannelFailure(channel) => {
                let server_channel_id = self.map_channel_reverse(&channel)?;
                self.maybe_with_session(|handle| async move {
                    handle
                        .channel_failure(server_channel_id.0)
                        .await
                        .context("failed to mirror failure")
                })
                .await?;
            }
            RCEvent::Eof(channel) => {
                let _ = self.channel_writer.flush().await;
                let server_channel_id = self.map_channel_reverse(&channel)?;
                self.maybe_with_session(|handle| async move {
                    handle
                        .eof(server_channel_id.0)
                        .await
                        .context("failed to send eof")
                })
                .await?;
            }
            RCEvent::Close(channel) => {
                let _ = self.channel_writer.flush().await;
                let server_channel_id = self.map_channel_reverse(&channel)?;
                let _ = self
                    .maybe_with_session(|handle| async move {
                        handle
                            .close(server_channel_id.0)
                            .await
                            .context("failed to close channel")
                    })
                    .await;
            }
            RCEvent::ExitStatus(channel, code) => {
                let _ = self.channel_writer.flush().await;
                let server_channel_id = self.map_channel_reverse(&channel)?;
                debug!(channel=%channel, %code, "Exit status");
                self.maybe_with_session(|handle| async move {
                    handle
                        .exit_status_request(server_channel_id.0, code)
                        .await
                        .context("failed to send exit status")
                })
                .await?;
            }
            RCEvent::ExitSignal {
                channel,
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                let _ = self.channel_writer.flush().await;
                let server_channel_id = self.map_channel_reverse(&channel)?;
                self.maybe_with_session(|handle| async move {
                    handle
                        .exit_signal_request(
                            server_channel_id.0,
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        )
                        .await
                        .context("failed to send exit signal")?;
                    Ok(())
                })
                .await?;
            }
            RCEvent::ForwardedTcpIp(id, params) => {
                if let Some(session) = &mut self.session_handle {
                    let server_channel = session
                        .channel_open_forwarded_tcpip(
                            params.connected_address,
                            params.connected_port,
                            params.originator_address,
                            params.originator_port,
                        )
                        .await?;

                    self.channel_map
                        .insert(ServerChannelId(server_channel.id()), id);
                    self.all_channels.push(id);
                }
            }
            RCEvent::X11(id, originator_address, originator_port) => {
                if let Some(session) = &mut self.session_handle {
                    let server_channel = session
                        .channel_open_x11(originator_address, originator_port)
                        .await?;

                    self.channel_map
                        .insert(ServerChannelId(server_channel.id()), id);
                    self.all_channels.push(id);
                }
            }
            RCEvent::ForwardedAgent(id) => {
                if let Some(session) = &mut self.session_handle {
                    let server_channel = session.channel_open_agent().await?;

                    self.channel_map
                        .insert(ServerChannelId(server_channel.id()), id);
                    self.all_channels.push(id);
                }
            }
            RCEvent::Done => {}
        }
        Ok(())
    }

    /// Resolve the backend from the SSH username and enforce CIDR policy
    /// right after the handshake; a denial closes the connection before
    /// anything is dialed.
    async fn setup_target(&mut self) -> Result<()> {
        let username = self
            .username
            .clone()
            .context("Invalid session state (no username)")?;
        let target = TargetAddress::parse(&username, &self.gateway.default_host)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        check_backend_access(&target.host, &self.gateway)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!(%target, "Session target");
        self.target = TargetSelection::Selected(target);
        Ok(())
    }

    async fn _auth_publickey(
        &mut self,
        ssh_username: Secret<String>,
        key: PublicKey,
    ) -> russh::server::Auth {
        let username = ssh_username.expose_secret().clone();
        info!(
            "Public key auth as {username} with key {}",
            key.public_key_base64()
        );
        self.username = Some(username);

        let armored = fingerprint::armored(&key);
        match self
            .services
            .auth
            .authenticate_key(&self.id, &armored, &self.gateway)
            .await
        {
            Ok(AuthOutcome::Allowed(user)) => {
                info!(user=%user.id, "Authenticated by public key");
                self.auth_user = Some(user);
                russh::server::Auth::Accept
            }
            Ok(AuthOutcome::OtpRequired) => {
                debug!("2FA enabled, next password check");
                russh::server::Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(
                        &[MethodKind::KeyboardInteractive, MethodKind::Password][..],
                    )),
                    partial_success: false,
                }
            }
            Ok(AuthOutcome::Denied(reason)) => {
                warn!(remote=%self.remote_address, %reason, "Login denied");
                russh::server::Auth::reject()
            }
            Err(error) => {
                // flattened to a bare rejection; details stay server-side
                warn!(remote=%self.remote_address, %error, "Cannot authenticate key");
                russh::server::Auth::reject()
            }
        }
    }

    async fn _auth_otp(
        &mut self,
        ssh_username: Secret<String>,
        otp: Secret<String>,
    ) -> russh::server::Auth {
        self.username = Some(ssh_username.expose_secret().clone());
        match self
            .services
            .auth
            .authenticate_otp(&self.id, &otp, &self.gateway)
            .await
        {
            Ok(AuthOutcome::Allowed(user)) => {
                info!(user=%user.id, "Authenticated by OTP");
                self.auth_user = Some(user);
                russh::server::Auth::Accept
            }
            Ok(AuthOutcome::Denied(reason)) => {
                warn!(remote=%self.remote_address, %reason, "OTP rejected");
                russh::server::Auth::reject()
            }
            Ok(AuthOutcome::OtpRequired) => russh::server::Auth::reject(),
            Err(error) => {
                warn!(remote=%self.remote_address, %error, "Cannot verify OTP");
                russh::server::Auth::reject()
            }
        }
    }

    async fn _auth_keyboard_interactive(
        &mut self,
        ssh_username: Secret<String>,
        response: Option<Secret<String>>,
    ) -> russh::server::Auth {
        match &self.keyboard_interactive_state {
            KeyboardInteractiveState::None => {
                self.keyboard_interactive_state = KeyboardInteractiveState::OtpRequested;
                russh::server::Auth::Partial {
                    name: "Two-factor authentication".into(),
                    instructions: "".into(),
                    prompts: vec![("One-time password: ".into(), true)].into(),
                }
            }
            KeyboardInteractiveState::OtpRequested => {
                self.keyboard_interactive_state = KeyboardInteractiveState::None;
                let Some(otp) = response else {
                    return russh::server::Auth::reject();
                };
                self._auth_otp(ssh_username, otp).await
            }
        }
    }

    /// The agent rendezvous: the first `auth-agent-req` opens a reverse
    /// agent channel to the client and triggers the backend dial; repeats
    /// are no-ops because the backend already exists.
    ///
    /// The channel open must not be awaited here: the russh callback that
    /// delivered the request is still blocked on our reply, and the open
    /// confirmation cannot be read until it returns.
    async fn _agent_forward(&mut self, server_channel_id: ServerChannelId) -> Result<()> {
        self.map_channel(&server_channel_id)?;

        if self.rc_state != RCState::NotInitialized {
            debug!("Repeated agent forwarding request ignored, backend already up");
            return Ok(());
        }

        let TargetSelection::Selected(target) = self.target.clone() else {
            anyhow::bail!("Invalid session state (no target)");
        };

        check_backend_access(&target.host, &self.gateway)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let handle = self
            .session_handle
            .clone()
            .context("Invalid session state")?;

        debug!(%target, "Dialing backend with the forwarded agent");
        self.rc_state = RCState::Connecting;

        let rc_tx = self.rc_tx.clone();
        tokio::spawn(
            async move {
                match handle.channel_open_agent().await {
                    Ok(agent_channel) => {
                        let agent = AgentClient::connect(agent_channel.into_stream());
                        let _ = rc_tx.send((
                            RCCommand::Connect(Box::new(ConnectParams { target, agent })),
                            None,
                        ));
                    }
                    Err(error) => {
                        error!(
                            %error,
                            "Cannot open an agent channel (is an agent running on the client?)"
                        );
                        let _ = rc_tx.send((RCCommand::Disconnect, None));
                    }
                }
            }
            .instrument(Span::current()),
        );

        Ok(())
    }

    async fn _channel_exec_request(
        &mut self,
        server_channel_id: ServerChannelId,
        data: Bytes,
    ) -> Result<()> {
        let channel_id = self.map_channel(&server_channel_id)?;
        if self.rc_state == RCState::NotInitialized {
            anyhow::bail!("exec requested without agent forwarding");
        }
        match std::str::from_utf8(&data) {
            Err(e) => {
                error!(channel=%channel_id, ?data, "Requested exec - invalid UTF-8");
                anyhow::bail!(e)
            }
            Ok(command) => {
                debug!(channel=%channel_id, %command, "Requested exec");
                let _ = self.send_command(RCCommand::Channel(
                    channel_id,
                    ChannelOperation::RequestExec(command.to_string()),
                ));
            }
        }
        Ok(())
    }

    async fn _channel_open_direct_tcpip(
        &mut self,
        channel: ServerChannelId,
        params: DirectTCPIPParams,
    ) -> Result<bool> {
        let uuid = Uuid::new_v4();
        self.channel_map.insert(channel, uuid);

        info!(
            %channel,
            "Opening direct TCP/IP channel from {}:{} to {}:{}",
            params.originator_address,
            params.originator_port,
            params.host_to_connect,
            params.port_to_connect
        );

        match self
            .send_command_and_wait(RCCommand::Channel(
                uuid,
                ChannelOperation::OpenDirectTCPIP(params),
            ))
            .await
        {
            Ok(()) => {
                self.all_channels.push(uuid);
                Ok(true)
            }
            Err(SshClientError::Russh(russh::Error::ChannelOpenFailure(_))) => Ok(false),
            Err(x) => Err(x.into()),
        }
    }

    async fn maybe_with_session<'a, FN, FT, R>(&'a mut self, f: FN) -> Result<Option<R>>
    where
        FN: FnOnce(&'a mut russh::server::Handle) -> FT + 'a,
        FT: futures::Future<Output = Result<R>>,
    {
        if let Some(handle) = &mut self.session_handle {
            return Ok(Some(f(handle).await?));
        }
        Ok(None)
    }

    fn send_command(&mut self, command: RCCommand) -> Result<(), RCCommand> {
        self.rc_tx.send((command, None)).map_err(|e| e.0 .0)
    }

    async fn send_command_and_wait(&mut self, command: RCCommand) -> Result<(), SshClientError> {
        let (tx, rx) = oneshot::channel();
        let mut cmd = match self.rc_tx.send((command, Some(tx))) {
            Ok(_) => PendingCommand::Waiting(rx),
            Err(_) => PendingCommand::Failed,
        };

        loop {
            tokio::select! {
                result = &mut cmd => {
                    return result
                }
                event = self.get_next_event() => {
                    match event {
                        Some(event) => {
                            self.handle_event(event)
                                .await
                                .map_err(|e| SshClientError::Other(e.into()))?
                        }
                        None => Err(SshClientError::MpscError)?,
                    };
                }
            }
        }
    }

    async fn request_disconnect(&mut self) {
        debug!("Disconnecting");
        let _ = self.rc_abort_tx.send(());
        if self.rc_state != RCState::NotInitialized && self.rc_state != RCState::Disconnected {
            let _ = self.send_command(RCCommand::Disconnect);
        }
    }

    async fn disconnect_server(&mut self) {
        let all_channels = std::mem::take(&mut self.all_channels);
        let channels = all_channels
            .into_iter()
            .map(|x| self.map_channel_reverse(&x))
            .filter_map(|x| x.ok())
            .collect::<Vec<_>>();

        let _ = self
            .maybe_with_session(|handle| async move {
                for ch in channels {
                    let _ = handle.close(ch.0).await;
                }
                Ok(())
            })
            .await;

        self.session_handle = None;
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        let _ = self.rc_abort_tx.send(());
        info!("Closed session");
        debug!("Dropped");
    }
}

fn is_session_end(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<OrcaError>(), Some(OrcaError::SessionEnd))
}

pub enum PendingCommand {
    Waiting(oneshot::Receiver<Result<(), SshClientError>>),
    Failed,
}

impl Future for PendingCommand {
    type Output = Result<(), SshClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            PendingCommand::Waiting(ref mut rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => {
                    Poll::Ready(result.unwrap_or(Err(SshClientError::MpscError)))
                }
                Poll::Pending => Poll::Pending,
            },
            PendingCommand::Failed => Poll::Ready(Err(SshClientError::MpscError)),
        }
    }
}
