//! Per-network controller
//!
//! A [`Server`] owns one network's connection lifecycle: the status
//! machine with its reconnect loop and server rotation, the cancellable
//! dial, the [`IrcClient`] for the live connection, the per-network state
//! mirror and dispatch registries, and the read pump feeding events to
//! both the global and the network dispatchers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use crate::client::{ConnStream, IrcClient};
use crate::commands::Cmds;
use crate::config::Config;
use crate::core_handler::CoreHandler;
use crate::dispatch::{DispatchCore, Dispatcher};
use crate::event::Event;
use crate::message::{names, Message};
use crate::network_info::NetworkInfo;
use crate::state::State;
use crate::store::Store;
use crate::writer::Writer;
use crate::{Error, Result};

/// Status of a network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Connecting,
    Started,
    Reconnecting,
}

/// Reconnect backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Dial timeout per attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Depth of each status listener's queue; slow listeners lose updates
/// rather than stalling the state machine.
const STATUS_QUEUE: usize = 8;

/// Multiplicative backoff, capped.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

struct StatusListener {
    filter: Option<Status>,
    tx: mpsc::Sender<Status>,
}

/// One network's controller.
pub struct Server {
    network_id: String,
    config: Arc<Config>,

    status: Mutex<Status>,
    listeners: Mutex<Vec<StatusListener>>,

    net_info: Arc<RwLock<NetworkInfo>>,
    state: Option<Arc<RwLock<State>>>,
    store: Option<Arc<RwLock<Store>>>,

    global_dispatcher: Arc<Dispatcher>,
    global_cmds: Arc<Cmds>,
    dispatcher: Arc<Dispatcher>,
    cmds: Arc<Cmds>,

    writer: Writer,
    client: Mutex<Option<Arc<IrcClient>>>,
    server_index: AtomicUsize,

    kill: watch::Sender<bool>,
}

impl Server {
    pub(crate) fn new(
        network_id: &str,
        config: Arc<Config>,
        store: Option<Arc<RwLock<Store>>>,
        global_dispatcher: Arc<Dispatcher>,
        global_cmds: Arc<Cmds>,
    ) -> Result<Arc<Self>> {
        let ctx = config.network(network_id);
        let net_info = Arc::new(RwLock::new(NetworkInfo::new()));

        let state = if ctx.no_state() {
            None
        } else {
            let state = State::new(&NetworkInfo::new())?;
            Some(Arc::new(RwLock::new(state)))
        };

        let channels: Vec<String> = ctx.channels().iter().map(|c| c.name.clone()).collect();
        let core = Arc::new(DispatchCore::with_filters(None, Some(channels)));
        let dispatcher = Arc::new(Dispatcher::new(core.clone()));
        let cmds = Arc::new(Cmds::new(ctx.prefix(), core));

        let (kill, _) = watch::channel(false);

        let server = Arc::new(Self {
            network_id: network_id.to_string(),
            config: config.clone(),
            status: Mutex::new(Status::Stopped),
            listeners: Mutex::new(Vec::new()),
            net_info: net_info.clone(),
            state: state.clone(),
            store,
            global_dispatcher,
            global_cmds,
            dispatcher,
            cmds,
            writer: Writer::new(network_id),
            client: Mutex::new(None),
            server_index: AtomicUsize::new(0),
            kill,
        });

        // The framework handler goes in first so its PONG and handshake
        // replies are ahead of user handlers. It manages the state write
        // lock itself, so it registers without the dispatch read guard.
        let handler = CoreHandler::new(network_id, config, net_info, state);
        server.dispatcher.register_unlocked(names::RAW, Arc::new(handler));

        Ok(server)
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cmds(&self) -> &Arc<Cmds> {
        &self.cmds
    }

    pub fn state(&self) -> Option<Arc<RwLock<State>>> {
        self.state.clone()
    }

    pub fn net_info(&self) -> Arc<RwLock<NetworkInfo>> {
        self.net_info.clone()
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    /// Position in the server rotation; advances on each failed attempt.
    pub fn server_index(&self) -> usize {
        self.server_index.load(Ordering::Relaxed)
    }

    /// Subscribe to status transitions, optionally filtered to one target
    /// status. Delivery is best effort over a bounded queue.
    pub fn subscribe_status(&self, filter: Option<Status>) -> mpsc::Receiver<Status> {
        let (tx, rx) = mpsc::channel(STATUS_QUEUE);
        self.listeners.lock().push(StatusListener { filter, tx });
        rx
    }

    fn set_status(&self, status: Status) {
        *self.status.lock() = status;
        self.listeners.lock().retain(|listener| {
            if listener.filter.map(|f| f == status).unwrap_or(true) {
                match listener.tx.try_send(status) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            } else {
                true
            }
        });
    }

    /// Ask the connection (and its reconnect loop) to stop.
    pub fn shutdown(&self) {
        let _ = self.kill.send(true);
    }

    /// The supervisor loop: connect, pump, reconnect with capped backoff,
    /// rotating through the server list on failures.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut shutdown = self.kill.subscribe();
        let mut backoff = self.config.network(&self.network_id).reconnect_timeout();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_status(Status::Connecting);

            match self.connect(&mut shutdown).await {
                Ok(client) => {
                    backoff = self.config.network(&self.network_id).reconnect_timeout();
                    self.writer.attach(client.write_sender()).await;
                    *self.client.lock() = Some(client.clone());
                    client.spawn_workers(true, true);
                    self.set_status(Status::Started);

                    self.dispatch_event(self.synthetic(names::CONNECT).await).await;
                    self.read_pump(&client, &mut shutdown).await;

                    if *shutdown.borrow() {
                        let msg = self.config.network(&self.network_id).quit_message();
                        let _ = client.write(format!("QUIT :{}", msg).as_bytes()).await;
                    }

                    self.writer.detach().await;
                    *self.client.lock() = None;
                    client.close();
                    client.wait().await;

                    self.dispatch_event(self.synthetic(names::DISCONNECT).await).await;
                    if let Some(ref store) = self.store {
                        store.read().await.logout_network(&self.network_id);
                    }
                }
                Err(Error::KilledDuringConnect) => break,
                Err(err) if err.is_temporary() => {
                    warn!(network = %self.network_id, error = %err, "connect failed");
                    self.server_index.fetch_add(1, Ordering::Relaxed);
                    if !self.backoff_wait(&mut shutdown, &mut backoff).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    error!(network = %self.network_id, error = %err, "permanent connect failure");
                    break;
                }
            }

            if *shutdown.borrow() || self.config.network(&self.network_id).no_reconnect() {
                break;
            }
            if !self.backoff_wait(&mut shutdown, &mut backoff).await {
                break;
            }
        }

        self.set_status(Status::Stopped);
    }

    /// Sleep out the reconnect backoff; false when shut down meanwhile.
    async fn backoff_wait(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> bool {
        self.set_status(Status::Reconnecting);
        let wait = *backoff;
        *backoff = next_backoff(*backoff);
        tokio::select! {
            _ = sleep(wait) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn synthetic(&self, name: &str) -> Arc<Event> {
        let info = Arc::new(self.net_info.read().await.clone());
        Arc::new(Event::synthetic(name, self.network_id.clone(), info))
    }

    /// Dial the next server in the rotation. Cancellation through the kill
    /// signal drops the in-flight dial, closing any connection it was
    /// about to produce.
    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Arc<IrcClient>> {
        let ctx = self.config.network(&self.network_id);
        let servers = ctx.servers();
        if servers.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "network {} has no servers",
                self.network_id
            )));
        }
        let address = servers[self.server_index.load(Ordering::Relaxed) % servers.len()].clone();
        let ssl = ctx.ssl();
        let ssl_cert = ctx.ssl_cert();
        let skip_verify = ctx.no_verify_cert();
        info!(network = %self.network_id, host = %address, "connecting");

        let stream = tokio::select! {
            result = dial(address, ssl, ssl_cert, skip_verify) => result?,
            _ = shutdown.changed() => return Err(Error::KilledDuringConnect),
        };

        Ok(Arc::new(IrcClient::new(
            stream,
            self.network_id.clone(),
            ctx.flood_len_penalty(),
            ctx.flood_timeout(),
            ctx.flood_step(),
            ctx.keep_alive(),
        )))
    }

    async fn read_pump(&self, client: &IrcClient, shutdown: &mut watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = client.read_message() => {
                    let Some(bytes) = msg else { break };
                    let line = String::from_utf8_lossy(&bytes).into_owned();
                    let message = match Message::parse(&line) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(network = %self.network_id, error = %err, "dropping unparsable line");
                            continue;
                        }
                    };

                    let info = Arc::new(self.net_info.read().await.clone());
                    let ev = Arc::new(Event::new(message, self.network_id.clone(), info));

                    if let Some(ref state) = self.state {
                        state.write().await.update(&ev);
                    }
                    self.dispatch_event(ev).await;
                }
            }
        }
    }

    async fn dispatch_event(&self, ev: Arc<Event>) {
        let writer = self.writer.clone();
        self.global_dispatcher
            .dispatch(ev.clone(), writer.clone(), self.state.clone());
        self.global_cmds
            .dispatch(ev.clone(), writer.clone(), self.state.clone(), self.store.clone());
        self.dispatcher
            .dispatch(ev.clone(), writer.clone(), self.state.clone());
        self.cmds
            .dispatch(ev, writer, self.state.clone(), self.store.clone());
    }

    /// Wait for every in-flight handler on this network's registries.
    pub async fn wait_for_completion(&self) {
        self.dispatcher.core().wait_for_completion().await;
        self.cmds.core().wait_for_completion().await;
    }
}

async fn dial(
    address: String,
    ssl: bool,
    ssl_cert: Option<PathBuf>,
    skip_verify: bool,
) -> Result<Box<dyn ConnStream>> {
    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::ConnectTemporary(format!("dial timeout: {}", address)))??;

    if !ssl {
        return Ok(Box::new(tcp));
    }

    let config = tls_client_config(ssl_cert, skip_verify)?;
    let connector = TlsConnector::from(Arc::new(config));
    let host = address.split(':').next().unwrap_or(&address).to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| Error::ConnectPermanent(format!("bad server name: {}", e)))?;
    let tls = connector.connect(server_name, tcp).await?;
    Ok(Box::new(tls))
}

fn tls_client_config(ca_file: Option<PathBuf>, skip_verify: bool) -> Result<ClientConfig> {
    if skip_verify {
        return Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    if let Some(path) = ca_file {
        let pem = std::fs::read(&path).map_err(|e| {
            Error::ConnectPermanent(format!("cannot read CA file {}: {}", path.display(), e))
        })?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                Error::ConnectPermanent(format!("bad certificate in {}: {}", path.display(), e))
            })?;
            roots.add(cert)?;
        }
    } else {
        let certs = rustls_native_certs::load_native_certs();
        for err in &certs.errors {
            warn!(error = %err, "error loading native certs");
        }
        for cert in certs.certs {
            let _ = roots.add(cert);
        }
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Accepts every certificate. Only installed when the network is
/// explicitly configured with `no_verify_cert`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
