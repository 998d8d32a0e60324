mod channel_direct_tcpip;
mod channel_session;
mod error;
mod handler;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use channel_direct_tcpip::DirectTCPIPChannel;
use channel_session::SessionChannel;
pub use error::SshClientError;
use futures::pin_mut;
use handler::{ClientHandler, ClientHandlerError, ClientHandlerEvent};
use orca_common::SessionId;
use orca_core::Services;
use russh::client::Handle;
use russh::keys::agent::client::AgentClient;
use russh::{ChannelStream, Sig};
use tokio::net::lookup_host;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::*;
use uuid::Uuid;

use crate::{ChannelOperation, DirectTCPIPParams, ForwardedTcpIpParams, TargetAddress};

/// Agent handle backed by the reverse `auth-agent` channel to the
/// connecting client; signs the backend authentication.
pub type ClientAgent = AgentClient<ChannelStream<russh::server::Msg>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("could not resolve address")]
    Resolve,

    #[error("agent failure: {0}")]
    Agent(String),

    #[error("internal error")]
    Internal,

    #[error("aborted")]
    Aborted,

    #[error("authentication failed")]
    Authentication,
}

#[derive(Debug)]
pub enum RCEvent {
    State(RCState),
    Output(Uuid, Bytes),
    Success(Uuid),
    ChannelFailure(Uuid),
    Eof(Uuid),
    Close(Uuid),
    Error(anyhow::Error),
    ExitStatus(Uuid, u32),
    ExitSignal {
        channel: Uuid,
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    ExtendedData {
        channel: Uuid,
        data: Bytes,
        ext: u32,
    },
    ConnectionError(ConnectionError),
    ForwardedTcpIp(Uuid, ForwardedTcpIpParams),
    X11(Uuid, String, u32),
    ForwardedAgent(Uuid),
    Done,
}

pub type RCCommandReply = oneshot::Sender<Result<(), SshClientError>>;

/// Everything needed to dial the backend: the parsed target and the
/// client's forwarded agent.
pub struct ConnectParams {
    pub target: TargetAddress,
    pub agent: ClientAgent,
}

impl Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectParams({})", self.target)
    }
}

#[derive(Debug)]
pub enum RCCommand {
    Connect(Box<ConnectParams>),
    Channel(Uuid, ChannelOperation),
    ForwardTcpIp(String, u32),
    CancelTcpIpForward(String, u32),
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RCState {
    NotInitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
enum InnerEvent {
    RCCommand(RCCommand, Option<RCCommandReply>),
    ClientHandlerEvent(ClientHandlerEvent),
}

/// Actor owning the backend SSH connection. Channel operations issued
/// before the connection is up are buffered and replayed in arrival order
/// once it is, which keeps early client requests ahead of any exec/shell.
pub struct RemoteClient {
    id: SessionId,
    tx: UnboundedSender<RCEvent>,
    session: Option<Arc<Mutex<Handle<ClientHandler>>>>,
    channel_pipes: Arc<Mutex<HashMap<Uuid, UnboundedSender<ChannelOperation>>>>,
    pending_ops: Vec<(Uuid, ChannelOperation)>,
    pending_forwards: Vec<(String, u32)>,
    state: RCState,
    abort_rx: UnboundedReceiver<()>,
    inner_event_rx: UnboundedReceiver<InnerEvent>,
    inner_event_tx: UnboundedSender<InnerEvent>,
    child_tasks: Vec<JoinHandle<Result<(), SshClientError>>>,
    services: Services,
}

pub struct RemoteClientHandles {
    pub event_rx: UnboundedReceiver<RCEvent>,
    pub command_tx: UnboundedSender<(RCCommand, Option<RCCommandReply>)>,
    pub abort_tx: UnboundedSender<()>,
}

impl RemoteClient {
    pub fn create(id: SessionId, services: Services) -> RemoteClientHandles {
        let (event_tx, event_rx) = unbounded_channel();
        let (command_tx, mut command_rx) = unbounded_channel();
        let (abort_tx, abort_rx) = unbounded_channel();
        let (inner_event_tx, inner_event_rx) = unbounded_channel();

        let this = Self {
            id,
            tx: event_tx,
            session: None,
            channel_pipes: Arc::new(Mutex::new(HashMap::new())),
            pending_ops: vec![],
            pending_forwards: vec![],
            state: RCState::NotInitialized,
            inner_event_rx,
            inner_event_tx: inner_event_tx.clone(),
            child_tasks: vec![],
            services,
            abort_rx,
        };

        tokio::spawn(
            async move {
                while let Some((command, reply)) = command_rx.recv().await {
                    inner_event_tx.send(InnerEvent::RCCommand(command, reply))?
                }
                Ok::<(), anyhow::Error>(())
            }
            .instrument(Span::current()),
        );

        this.start();

        RemoteClientHandles {
            event_rx,
            command_tx,
            abort_tx,
        }
    }

    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(
            async move {
                async {
                    loop {
                        tokio::select! {
                            Some(event) = self.inner_event_rx.recv() => {
                                if self.handle_event(event).await? {
                                    break
                                }
                            }
                            Some(_) = self.abort_rx.recv() => {
                                debug!("Abort requested");
                                self.disconnect().await;
                                break
                            }
                        };
                    }
                    Ok::<(), anyhow::Error>(())
                }
                .await
                .map_err(|error| {
                    error!(?error, "error in command loop");
                    let err = anyhow::anyhow!("Error in command loop: {error}");
                    let _ = self.tx.send(RCEvent::Error(error));
                    err
                })?;
                info!("Client session closed");
                Ok::<(), anyhow::Error>(())
            }
            .instrument(Span::current()),
        )
    }

    async fn handle_event(&mut self, event: InnerEvent) -> Result<bool> {
        match event {
            InnerEvent::RCCommand(command, reply) => {
                let result = self.handle_command(command).await;
                let brk = matches!(result, Ok(true));
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(|_| ()));
                }
                return Ok(brk);
            }
            InnerEvent::ClientHandlerEvent(client_event) => match client_event {
                ClientHandlerEvent::Disconnect => {
                    self._on_disconnect().await?;
                }
                ClientHandlerEvent::ForwardedTcpIp(channel, params) => {
                    info!("New forwarded connection: {params:?}");
                    let id = self.setup_server_initiated_channel(channel).await;
                    let _ = self.tx.send(RCEvent::ForwardedTcpIp(id, params));
                }
                ClientHandlerEvent::X11(channel, originator_address, originator_port) => {
                    info!("New X11 connection from {originator_address}:{originator_port}");
                    let id = self.setup_server_initiated_channel(channel).await;
                    let _ = self
                        .tx
                        .send(RCEvent::X11(id, originator_address, originator_port));
                }
                ClientHandlerEvent::ForwardedAgent(channel) => {
                    debug!("Backend requests the forwarded agent");
                    let id = self.setup_server_initiated_channel(channel).await;
                    let _ = self.tx.send(RCEvent::ForwardedAgent(id));
                }
            },
        }
        Ok(false)
    }

    /// Register a backend-initiated channel and return its internal id; the
    /// server session opens the matching channel towards the client.
    async fn setup_server_initiated_channel(
        &mut self,
        channel: russh::Channel<russh::client::Msg>,
    ) -> Uuid {
        let id = Uuid::new_v4();

        let (tx, rx) = unbounded_channel();
        self.channel_pipes.lock().await.insert(id, tx);

        let channel = DirectTCPIPChannel::new(channel, id, rx, self.tx.clone(), self.id);
        self.child_tasks.push(tokio::spawn(channel.run()));

        id
    }

    async fn handle_command(&mut self, command: RCCommand) -> Result<bool, SshClientError> {
        match command {
            RCCommand::Connect(params) => match self.connect(*params).await {
                Ok(_) => {
                    self.set_state(RCState::Connected)
                        .map_err(SshClientError::other)?;
                    let ops = self.pending_ops.drain(..).collect::<Vec<_>>();
                    for (id, op) in ops {
                        self.apply_channel_op(id, op).await?;
                    }
                    let forwards = self.pending_forwards.drain(..).collect::<Vec<_>>();
                    for (address, port) in forwards {
                        self.tcpip_forward(address, port).await?;
                    }
                }
                Err(e) => {
                    debug!("Connect error: {}", e);
                    let _ = self.tx.send(RCEvent::ConnectionError(e));
                    self.set_disconnected();
                    return Ok(true);
                }
            },
            RCCommand::Channel(channel, op) => {
                self.apply_channel_op(channel, op).await?;
            }
            RCCommand::ForwardTcpIp(address, port) => {
                self.tcpip_forward(address, port).await?;
            }
            RCCommand::CancelTcpIpForward(address, port) => {
                self.cancel_tcpip_forward(address, port).await?;
            }
            RCCommand::Disconnect => {
                self.disconnect().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn set_disconnected(&mut self) {
        self.session = None;
        for (id, op) in self.pending_ops.drain(..) {
            if let ChannelOperation::OpenSession = op {
                let _ = self.tx.send(RCEvent::Close(id));
            }
            if let ChannelOperation::OpenDirectTCPIP { .. } = op {
                let _ = self.tx.send(RCEvent::Close(id));
            }
        }
        let _ = self.set_state(RCState::Disconnected);
        let _ = self.tx.send(RCEvent::Done);
    }

    fn set_state(&mut self, state: RCState) -> Result<(), SshClientError> {
        self.state = state.clone();
        self.tx
            .send(RCEvent::State(state))
            .map_err(|_| SshClientError::MpscError)?;
        Ok(())
    }

    async fn apply_channel_op(
        &mut self,
        channel_id: Uuid,
        op: ChannelOperation,
    ) -> Result<(), SshClientError> {
        if self.state != RCState::Connected {
            self.pending_ops.push((channel_id, op));
            return Ok(());
        }

        match op {
            ChannelOperation::OpenSession => {
                self.open_session(channel_id).await?;
            }
            ChannelOperation::OpenDirectTCPIP(params) => {
                self.open_direct_tcpip(channel_id, params).await?;
            }
            op => {
                let mut channel_pipes = self.channel_pipes.lock().await;
                match channel_pipes.get(&channel_id) {
                    Some(tx) => {
                        if tx.send(op).is_err() {
                            channel_pipes.remove(&channel_id);
                        }
                    }
                    None => debug!(channel=%channel_id, "operation for unknown channel"),
                }
            }
        }
        Ok(())
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<(), ConnectionError> {
        let ConnectParams { target, mut agent } = params;
        let address_str = format!("{}:{}", target.host, target.port);
        let address = match lookup_host(&address_str)
            .await
            .map_err(ConnectionError::Io)
            .and_then(|mut x| x.next().ok_or(ConnectionError::Resolve))
        {
            Ok(address) => address,
            Err(error) => {
                error!(?error, address=%address_str, "Cannot resolve backend address");
                self.set_disconnected();
                return Err(error);
            }
        };

        info!(?address, username=%target.user, "Connecting to backend");

        let config = Arc::new(russh::client::Config::default());
        let (event_tx, mut event_rx) = unbounded_channel();
        let handler = ClientHandler {
            session_id: self.id,
            services: self.services.clone(),
            target: target.clone(),
            event_tx,
        };

        let fut_connect = russh::client::connect(config, address, handler);
        pin_mut!(fut_connect);

        let mut session = tokio::select! {
            Some(_) = self.abort_rx.recv() => {
                info!("Abort requested");
                self.set_disconnected();
                return Err(ConnectionError::Aborted);
            }
            result = &mut fut_connect => match result {
                Ok(session) => session,
                Err(error) => {
                    let connection_error = match error {
                        ClientHandlerError::ConnectionError(e) => e,
                        ClientHandlerError::Ssh(e) => ConnectionError::Ssh(e),
                        ClientHandlerError::Internal => ConnectionError::Internal,
                    };
                    error!(error=?connection_error, "Connection error");
                    return Err(connection_error);
                }
            },
        };

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| ConnectionError::Agent(e.to_string()))?;
        if identities.is_empty() {
            error!("The forwarded agent offered no identities");
            return Err(ConnectionError::Authentication);
        }

        let rsa_hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(ConnectionError::Ssh)?
            .flatten();

        let mut authenticated = false;
        for key in identities {
            let key_str = format!("{} {}", key.algorithm(), key.comment());
            match session
                .authenticate_publickey_with(target.user.clone(), key, rsa_hash, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    debug!(username=%target.user, key=%key_str, "Authenticated with agent key");
                    authenticated = true;
                    break;
                }
                Ok(_) => {
                    debug!(key=%key_str, "Agent key rejected");
                }
                Err(error) => {
                    debug!(key=%key_str, %error, "Agent signing failed");
                }
            }
        }

        if !authenticated {
            error!("Backend rejected every agent identity");
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            return Err(ConnectionError::Authentication);
        }

        self.session = Some(Arc::new(Mutex::new(session)));

        info!(?address, "Connected to backend");

        tokio::spawn({
            let inner_event_tx = self.inner_event_tx.clone();
            async move {
                while let Some(e) = event_rx.recv().await {
                    inner_event_tx.send(InnerEvent::ClientHandlerEvent(e))?
                }
                Ok::<(), anyhow::Error>(())
            }
            .instrument(Span::current())
        });

        Ok(())
    }

    async fn open_session(&mut self, channel_id: Uuid) -> Result<(), SshClientError> {
        if let Some(session) = &self.session {
            let session = session.lock().await;
            let channel = session.channel_open_session().await?;

            // request agent forwarding before any replayed request can
            // reach the channel, so the backend sees it ahead of exec/shell
            if let Err(error) = channel.agent_forward(true).await {
                warn!(channel=%channel_id, %error, "Agent forwarding request failed");
            }

            let (tx, rx) = unbounded_channel();
            self.channel_pipes.lock().await.insert(channel_id, tx);

            let channel = SessionChannel::new(channel, channel_id, rx, self.tx.clone(), self.id);
            self.child_tasks.push(tokio::spawn(channel.run()));
        }
        Ok(())
    }

    async fn open_direct_tcpip(
        &mut self,
        channel_id: Uuid,
        params: DirectTCPIPParams,
    ) -> Result<(), SshClientError> {
        if let Some(session) = &self.session {
            let session = session.lock().await;
            let channel = session
                .channel_open_direct_tcpip(
                    params.host_to_connect,
                    params.port_to_connect,
                    params.originator_address,
                    params.originator_port,
                )
                .await?;

            let (tx, rx) = unbounded_channel();
            self.channel_pipes.lock().await.insert(channel_id, tx);

            let channel =
                DirectTCPIPChannel::new(channel, channel_id, rx, self.tx.clone(), self.id);
            self.child_tasks.push(tokio::spawn(channel.run()));
        }
        Ok(())
    }

    async fn tcpip_forward(&mut self, address: String, port: u32) -> Result<(), SshClientError> {
        if let Some(session) = &self.session {
            let mut session = session.lock().await;
            session.tcpip_forward(address, port).await?;
        } else {
            self.pending_forwards.push((address, port));
        }
        Ok(())
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: String,
        port: u32,
    ) -> Result<(), SshClientError> {
        if let Some(session) = &self.session {
            let session = session.lock().await;
            session.cancel_tcpip_forward(address, port).await?;
        } else {
            self.pending_forwards
                .retain(|x| x.0 != address || x.1 != port);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = &mut self.session {
            let _ = session
                .lock()
                .await
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }
        self.set_disconnected();
    }

    async fn _on_disconnect(&mut self) -> Result<()> {
        self.set_disconnected();
        Ok(())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        for task in self.child_tasks.drain(..) {
            task.abort();
        }
        info!("Closed backend connection");
        debug!("Dropped");
    }
}
