//! Login handshake driver.
//!
//! [`LobbyRunner`] registers observers on a [`LobbyTransport`] and walks the
//! connection through the login sequence: cipher negotiation, credential
//! exchange, service account selection, and the paginated enumeration of
//! worlds, legacy characters, retainers, and characters. Once the final
//! character page arrives the session is logged in and stays open for
//! follow-up requests such as datacenter travel tokens.
//!
//! The transport dispatches segments one at a time, so observer callbacks
//! never race each other; state is still kept under a mutex because the
//! keepalive task and caller-facing getters read it concurrently. Guards are
//! scoped tightly and never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::packet::{PacketHeader, Segment, SegmentType};
use crate::core::{ipc::IpcMessage, unix_time_secs};
use crate::error::{ProtocolError, Result};
use crate::protocol::clientbound::{
    self, CharaMakeReply, Character, Retainer, ServiceAccount, SubscriptionInfo, World,
    XiCharacter,
};
use crate::protocol::session::{LoginSession, VersionInfo};
use crate::protocol::{opcode, serverbound, CharaMakeOperation};
use crate::transport::LobbyTransport;
use crate::utils::timeout::SHUTDOWN_TIMEOUT;

/// Where the handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the server's first keepalive and encrypted hello.
    AwaitingPing,
    /// Credentials sent; waiting for service account pages.
    AwaitingLoginReply,
    /// Account selected; waiting for world, character, and retainer pages.
    AwaitingDistInfo,
    /// Enumeration complete. The connection stays open for requests.
    LoggedIn,
}

/// A datacenter travel token granted for one character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcTravelToken {
    pub token: u32,
    pub world_id: u16,
    pub character_id: u64,
}

/// Outcome broadcast to [`LobbyRunner::wait_logged_in`] waiters. `Failed`
/// is terminal: it is set when the run ends without reaching login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginSignal {
    Pending,
    LoggedIn,
    Failed,
}

struct HandshakeState {
    phase: Phase,
    encryption_started: bool,
    fingerprint: Option<u32>,
    request_number: u32,
    accounts: Vec<ServiceAccount>,
    worlds: Vec<World>,
    xi_characters: Vec<XiCharacter>,
    retainers: Vec<Retainer>,
    characters: Vec<Character>,
    subscription: Option<SubscriptionInfo>,
    pending_replies: HashMap<u32, oneshot::Sender<CharaMakeReply>>,
}

impl HandshakeState {
    fn new() -> Self {
        Self {
            phase: Phase::AwaitingPing,
            encryption_started: false,
            fingerprint: None,
            request_number: 0,
            accounts: Vec::new(),
            worlds: Vec::new(),
            xi_characters: Vec::new(),
            retainers: Vec::new(),
            characters: Vec::new(),
            subscription: None,
            pending_replies: HashMap::new(),
        }
    }

    fn next_request_number(&mut self) -> u32 {
        self.request_number += 1;
        self.request_number
    }
}

/// Drives the login handshake over a transport and exposes the session
/// inventory once logged in.
pub struct LobbyRunner<S = TcpStream> {
    transport: Arc<LobbyTransport<S>>,
    session: LoginSession,
    version: VersionInfo,
    keepalive_interval: Duration,
    state: Arc<StdMutex<HandshakeState>>,
    logged_in: watch::Sender<LoginSignal>,
    keepalive: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S> LobbyRunner<S> {
    pub fn new(
        transport: Arc<LobbyTransport<S>>,
        session: LoginSession,
        version: VersionInfo,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let (logged_in, _) = watch::channel(LoginSignal::Pending);
        Arc::new(Self {
            transport,
            session,
            version,
            keepalive_interval: config.keepalive_interval,
            state: Arc::new(StdMutex::new(HandshakeState::new())),
            logged_in,
            keepalive: StdMutex::new(None),
        })
    }

    /// Current handshake phase.
    pub fn phase(&self) -> Phase {
        self.state
            .lock()
            .map(|s| s.phase)
            .unwrap_or(Phase::AwaitingPing)
    }

    /// Resolves once the handshake reaches [`Phase::LoggedIn`]. Fails if the
    /// run ends (fatal error, cancellation, or drop) before that happens.
    pub async fn wait_logged_in(&self) -> Result<()> {
        let mut rx = self.logged_in.subscribe();
        let signal = *rx
            .wait_for(|s| *s != LoginSignal::Pending)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        match signal {
            LoginSignal::LoggedIn => Ok(()),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn inventory<T>(&self, f: impl FnOnce(&HandshakeState) -> T) -> Result<T> {
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        if state.phase != Phase::LoggedIn {
            return Err(ProtocolError::NotLoggedIn);
        }
        Ok(f(&state))
    }

    /// Service accounts seen during login. Available once logged in.
    pub fn accounts(&self) -> Result<Vec<ServiceAccount>> {
        self.inventory(|s| s.accounts.clone())
    }

    /// Worlds on this datacenter. Available once logged in.
    pub fn worlds(&self) -> Result<Vec<World>> {
        self.inventory(|s| s.worlds.clone())
    }

    /// Legacy-service characters. Available once logged in.
    pub fn xi_characters(&self) -> Result<Vec<XiCharacter>> {
        self.inventory(|s| s.xi_characters.clone())
    }

    /// Retainers on the selected account. Available once logged in.
    pub fn retainers(&self) -> Result<Vec<Retainer>> {
        self.inventory(|s| s.retainers.clone())
    }

    /// Characters on the selected account. Available once logged in.
    pub fn characters(&self) -> Result<Vec<Character>> {
        self.inventory(|s| s.characters.clone())
    }

    /// Subscription details from the character enumeration.
    pub fn subscription(&self) -> Result<SubscriptionInfo> {
        self.inventory(|s| s.subscription.unwrap_or_default())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> LobbyRunner<S> {
    /// Run the handshake: register observers and drive the transport's
    /// receive loop until cancellation, stream closure, or a fatal error.
    /// The keepalive task is stopped before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let segment_observer = {
            let runner = Arc::clone(&self);
            self.transport.subscribe_segments(Arc::new(
                move |header: PacketHeader, segment: Segment| -> BoxFuture<'static, Result<()>> {
                    let runner = Arc::clone(&runner);
                    Box::pin(async move { runner.on_segment(header, segment).await })
                },
            ))?
        };
        let ipc_observer = {
            let runner = Arc::clone(&self);
            self.transport.subscribe_ipc(Arc::new(
                move |header: PacketHeader, message: IpcMessage| -> BoxFuture<'static, Result<()>> {
                    let runner = Arc::clone(&runner);
                    Box::pin(async move { runner.on_ipc(header, message).await })
                },
            ))?
        };

        let result = self.transport.receive_loop(cancel).await;

        self.transport.unsubscribe(segment_observer);
        self.transport.unsubscribe(ipc_observer);
        self.stop_keepalive().await;
        self.drop_pending_replies();
        // wake wait_logged_in callers if the run ended short of login
        self.logged_in.send_if_modified(|signal| {
            if *signal == LoginSignal::Pending {
                *signal = LoginSignal::Failed;
                true
            } else {
                false
            }
        });
        result
    }

    async fn on_segment(&self, _header: PacketHeader, segment: Segment) -> Result<()> {
        match segment.segment_type {
            SegmentType::KeepAlive => self.on_keepalive().await,
            SegmentType::EncryptedData => self.on_encrypted_hello(&segment.payload).await,
            SegmentType::KeepAlivePong => Ok(()),
            other => {
                debug!(segment = ?other, "ignoring unexpected segment");
                Ok(())
            }
        }
    }

    /// The server's first plain keepalive is the cue to negotiate the
    /// cipher; later ones are answered with a pong.
    async fn on_keepalive(&self) -> Result<()> {
        let (start_encryption, fingerprint) = {
            let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
            if state.encryption_started {
                (false, state.fingerprint)
            } else {
                state.encryption_started = true;
                (true, None)
            }
        };

        if start_encryption {
            let key = unix_time_secs();
            self.transport
                .initialize_encryption(&self.version.cipher_phrase, key, self.version.cipher_version)
                .await?;
            self.start_keepalive();
            return Ok(());
        }

        if let Some(fingerprint) = fingerprint {
            self.transport.send_ping(fingerprint, true).await?;
        }
        Ok(())
    }

    /// The encrypted hello carries the connection fingerprint. Answer with
    /// the credential exchange, then a pong. Phases never move backwards, so
    /// a hello arriving after negotiation is ignored.
    async fn on_encrypted_hello(&self, payload: &[u8]) -> Result<()> {
        let fingerprint = clientbound::fingerprint(payload)?;
        let request = {
            let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
            if state.phase != Phase::AwaitingPing {
                debug!("ignoring encrypted hello outside cipher negotiation");
                return Ok(());
            }
            state.fingerprint = Some(fingerprint);
            state.phase = Phase::AwaitingLoginReply;
            state.next_request_number()
        };
        info!(fingerprint = format_args!("{fingerprint:#x}"), "received encrypted hello");

        let payload = serverbound::login_ex(
            request,
            &self.session.session_id,
            self.session.is_steam,
            &self.version,
            self.session.max_expansion,
        )?;
        self.transport
            .send_ipc(fingerprint, opcode::LOGIN_EX, &payload)
            .await?;
        self.transport.send_ping(fingerprint, true).await
    }

    async fn on_ipc(&self, _header: PacketHeader, message: IpcMessage) -> Result<()> {
        match message.opcode() {
            opcode::LOGIN_REPLY => self.on_login_reply(&message.data).await,
            opcode::DIST_WORLD_INFO => self.on_world_info(&message.data),
            opcode::XI_CHARACTER_INFO => self.on_xi_character_info(&message.data),
            opcode::DIST_RETAINER_INFO => self.on_retainer_info(&message.data),
            opcode::SERVICE_LOGIN_REPLY => self.on_service_login_reply(&message.data),
            opcode::CHARA_MAKE_REPLY => self.on_chara_make_reply(&message.data),
            opcode::LOGIN_ERROR => Err(clientbound::login_error(&message.data)?),
            other => {
                debug!(opcode = other, "ignoring unexpected ipc");
                Ok(())
            }
        }
    }

    async fn on_login_reply(&self, payload: &[u8]) -> Result<()> {
        let reply = clientbound::login_reply(payload)?;
        let action = {
            let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
            if state.phase != Phase::AwaitingLoginReply {
                debug!("ignoring login reply outside credential exchange");
                return Ok(());
            }
            state.accounts.extend(reply.accounts);
            if reply.has_more {
                None
            } else if state.accounts.is_empty() {
                return Err(ProtocolError::NoActiveAccounts);
            } else {
                // The enumeration opcodes restart after account selection.
                state.worlds.clear();
                state.xi_characters.clear();
                state.retainers.clear();
                state.characters.clear();
                state.phase = Phase::AwaitingDistInfo;
                let account = state.accounts[0].clone();
                Some((state.next_request_number(), account))
            }
        };

        let Some((request, account)) = action else {
            return Ok(());
        };
        info!(account = account.id, name = %account.name, "selecting service account");
        let payload = serverbound::service_login(request, account.index, account.id);
        let fingerprint = self.current_fingerprint()?;
        self.transport
            .send_ipc(fingerprint, opcode::SERVICE_LOGIN, &payload)
            .await
    }

    fn on_world_info(&self, payload: &[u8]) -> Result<()> {
        let info = clientbound::dist_world_info(payload)?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        if state.phase != Phase::AwaitingDistInfo {
            debug!("ignoring world page outside enumeration");
            return Ok(());
        }
        state.worlds.extend(info.worlds);
        Ok(())
    }

    fn on_xi_character_info(&self, payload: &[u8]) -> Result<()> {
        let info = clientbound::xi_character_info(payload)?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        if state.phase != Phase::AwaitingDistInfo {
            debug!("ignoring legacy character page outside enumeration");
            return Ok(());
        }
        state.xi_characters.extend(info.characters);
        Ok(())
    }

    fn on_retainer_info(&self, payload: &[u8]) -> Result<()> {
        let info = clientbound::dist_retainer_info(payload)?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        if state.phase != Phase::AwaitingDistInfo {
            debug!("ignoring retainer page outside enumeration");
            return Ok(());
        }
        state.retainers.extend(info.retainers);
        Ok(())
    }

    fn on_service_login_reply(&self, payload: &[u8]) -> Result<()> {
        let reply = clientbound::service_login_reply(payload)?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        if state.phase != Phase::AwaitingDistInfo {
            debug!("ignoring character page outside enumeration");
            return Ok(());
        }
        state.subscription = Some(reply.subscription);
        state.characters.extend(reply.characters);
        if !reply.has_more {
            state.phase = Phase::LoggedIn;
            info!(
                characters = state.characters.len(),
                worlds = state.worlds.len(),
                "login complete"
            );
            let _ = self.logged_in.send(LoginSignal::LoggedIn);
        }
        Ok(())
    }

    fn on_chara_make_reply(&self, payload: &[u8]) -> Result<()> {
        let reply = clientbound::chara_make_reply(payload)?;
        let pending = {
            let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
            state.pending_replies.remove(&reply.request_number)
        };
        match pending {
            Some(tx) => {
                // Receiver may have been dropped by a cancelled caller.
                let _ = tx.send(reply);
            }
            None => warn!(
                request = reply.request_number,
                operation = ?reply.operation,
                "reply with no pending request"
            ),
        }
        Ok(())
    }

    /// Request a datacenter travel token for `character` and wait for the
    /// server's reply. Requires [`Phase::LoggedIn`]. Replies correlate by
    /// request number, so concurrent calls are fine even when the server
    /// answers out of order.
    #[instrument(skip_all, fields(character = character.character_id))]
    pub async fn get_travel_token(&self, character: &Character) -> Result<DcTravelToken> {
        let (request, rx) = {
            let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
            if state.phase != Phase::LoggedIn {
                return Err(ProtocolError::NotLoggedIn);
            }
            let request = state.next_request_number();
            let (tx, rx) = oneshot::channel();
            state.pending_replies.insert(request, tx);
            (request, rx)
        };

        let payload =
            serverbound::chara_make_travel_token(request, character.character_id, character.index);
        let send = async {
            let fingerprint = self.current_fingerprint()?;
            self.transport
                .send_ipc(fingerprint, opcode::CHARA_MAKE, &payload)
                .await
        };
        if let Err(e) = send.await {
            if let Ok(mut state) = self.state.lock() {
                state.pending_replies.remove(&request);
            }
            return Err(e);
        }

        let reply = rx.await.map_err(|_| ProtocolError::RequestDropped)?;
        if reply.operation != CharaMakeOperation::DatacenterToken {
            return Err(ProtocolError::UnexpectedOperation(reply.operation.to_u8()));
        }
        Ok(DcTravelToken {
            token: reply.travel_token,
            world_id: reply.visiting_world_id,
            character_id: reply.character_id,
        })
    }

    fn current_fingerprint(&self) -> Result<u32> {
        self.state
            .lock()
            .map_err(|_| lock_poisoned())?
            .fingerprint
            .ok_or(ProtocolError::FingerprintUnknown)
    }

    fn start_keepalive(&self) {
        let Ok(mut slot) = self.keepalive.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let interval = self.keepalive_interval;
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let fingerprint = state
                    .lock()
                    .ok()
                    .and_then(|s| s.fingerprint)
                    .unwrap_or(0);
                if let Err(e) = transport.send_ping(fingerprint, false).await {
                    warn!(error = %e, "keepalive send failed");
                    return;
                }
            }
        });
        *slot = Some((cancel, handle));
    }

    async fn stop_keepalive(&self) {
        let task = match self.keepalive.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("keepalive task did not stop within the shutdown timeout");
            }
        }
    }

    /// Dropping the senders wakes waiting token callers with
    /// [`ProtocolError::RequestDropped`].
    fn drop_pending_replies(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_replies.clear();
        }
    }
}

fn lock_poisoned() -> ProtocolError {
    ProtocolError::Decode("handshake state lock poisoned".into())
}
