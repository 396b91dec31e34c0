//! The session engine: handshake, SAS verification, chunked transfer with
//! resume, and failure handling, orchestrated over one negotiated
//! transport.
//!
//! The engine is a serial entity — all mutable state lives behind one
//! mutex, touched either by the caller-facing API or by the frame pump
//! that drains the transport. Pending replies (hello ack, verify ack,
//! resume) are oneshot waiters raced against timeouts.

pub mod events;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::crypto::{
    self, derive_sas, EphemeralHandshakeKey, HandshakeSecrets, Role, SessionCrypto,
};
use crate::device::{DeviceId, GhostCapabilities, NearbyDevice};
use crate::error::{GhostDropError, Result};
use crate::logging::{LogLevel, SessionLog};
use crate::metrics::ProgressTracker;
use crate::protocol::{
    AckPayload, CancelPayload, CompletePayload, DataPayload, Frame, HelloAckPayload, HelloPayload,
    MetadataPayload, ResumePayload, VerifyPayload,
};
use crate::store::{IncomingFile, IncomingStore, ResumeStore, TransferResumeState};
use crate::transport::{FrameTransport, TransportKind};

pub use events::{EventBus, SessionEvent};
pub use state::SessionState;

/// Receive-side context, alive from `Metadata` until `Complete`.
struct ReceiveContext {
    transfer_id: Uuid,
    file_name: String,
    file_size: u64,
    chunk_size: u32,
    sha256: [u8; 32],
    file: IncomingFile,
    last_confirmed: u64,
    progress: ProgressTracker,
}

struct Inner {
    state: SessionState,
    role: Option<Role>,
    transport: Option<Arc<dyn FrameTransport>>,
    transport_kind: Option<TransportKind>,
    crypto: Option<Arc<Mutex<SessionCrypto>>>,
    secrets: Option<HandshakeSecrets>,
    sas: Option<String>,
    remote_capabilities: Option<GhostCapabilities>,
    verified: bool,
    local_confirmed: Option<bool>,
    peer_confirmed: Option<bool>,
    hello_ack_tx: Option<oneshot::Sender<HelloAckPayload>>,
    verify_ack_tx: Option<oneshot::Sender<bool>>,
    resume_tx: Option<oneshot::Sender<ResumePayload>>,
    receive: Option<ReceiveContext>,
    pump: Option<JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            role: None,
            transport: None,
            transport_kind: None,
            crypto: None,
            secrets: None,
            sas: None,
            remote_capabilities: None,
            verified: false,
            local_confirmed: None,
            peer_confirmed: None,
            hello_ack_tx: None,
            verify_ack_tx: None,
            resume_tx: None,
            receive: None,
            pump: None,
        }
    }
}

struct EngineShared {
    device_id: DeviceId,
    config: EngineConfig,
    events: EventBus,
    log: SessionLog,
    resume_store: ResumeStore,
    incoming_store: IncomingStore,
    inner: Mutex<Inner>,
}

/// One pairing + transfer session. Cheap to clone; every clone drives the
/// same session.
#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<EngineShared>,
}

impl SessionEngine {
    pub fn new(
        device_id: DeviceId,
        config: EngineConfig,
        resume_store: ResumeStore,
        incoming_store: IncomingStore,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                device_id,
                config: config.normalised(),
                events: EventBus::default(),
                log: SessionLog::default(),
                resume_store,
                incoming_store,
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn log(&self) -> &SessionLog {
        &self.shared.log
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn sas_code(&self) -> Option<String> {
        self.shared.inner.lock().await.sas.clone()
    }

    pub async fn remote_capabilities(&self) -> Option<GhostCapabilities> {
        self.shared.inner.lock().await.remote_capabilities
    }

    // -----------------------------------------------------------------
    // Discovery-side notifications from the embedding app
    // -----------------------------------------------------------------

    /// Relay a discovery snapshot to event subscribers.
    pub fn publish_nearby(&self, devices: Vec<NearbyDevice>) {
        self.shared
            .events
            .emit(SessionEvent::NearbyDevicesUpdated { devices });
    }

    pub async fn start_scanning(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        self.transition(&mut inner, SessionState::Scanning)
    }

    /// Record the link-layer connection to a chosen device.
    pub async fn device_connected(&self, device: NearbyDevice) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        self.transition(&mut inner, SessionState::Connecting)?;
        inner.remote_capabilities = Some(device.capabilities.normalised());
        self.shared
            .events
            .emit(SessionEvent::Connected { device });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sender flow
    // -----------------------------------------------------------------

    /// Run the sender half of the handshake over a negotiated transport:
    /// send `Hello`, await `HelloAck`, derive secrets and send `Verify`.
    /// Returns the SAS code to show the user.
    pub async fn start_sender(&self, transport: Arc<dyn FrameTransport>) -> Result<String> {
        let key = EphemeralHandshakeKey::generate();
        let nonce = crypto::generate_nonce();
        let session_id = Uuid::new_v4();

        let hello_ack_rx = {
            let mut inner = self.shared.inner.lock().await;
            self.transition(&mut inner, SessionState::Negotiating)?;
            inner.role = Some(Role::Sender);
            self.attach_transport(&mut inner, transport.clone());

            let (tx, rx) = oneshot::channel();
            inner.hello_ack_tx = Some(tx);

            let hello = Frame::Hello(HelloPayload {
                session_id,
                device_id: self.shared.device_id,
                public_key: key.public_bytes().to_vec(),
                nonce,
                capabilities: self.shared.config.capabilities,
            });
            if let Err(err) = transport.send(hello).await {
                inner.hello_ack_tx = None;
                drop(inner);
                return Err(self.fail_with(err.into()).await);
            }
            self.record_log(LogLevel::Info, "hello_sent", json!({"sessionId": session_id}));
            rx
        };

        let ack = match timeout(self.shared.config.hello_timeout, hello_ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(GhostDropError::TransportClosed),
            Err(_) => {
                self.shared.inner.lock().await.hello_ack_tx = None;
                return Err(self.fail_with(GhostDropError::Timeout("hello ack")).await);
            }
        };
        if ack.session_id != session_id {
            return Err(self
                .fail_with(GhostDropError::HandshakeFailed(
                    "hello ack for a different session".into(),
                ))
                .await);
        }

        let shared_secret = match key.agree(&ack.public_key) {
            Ok(secret) => secret,
            Err(err) => return Err(self.fail_with(err).await),
        };
        let secrets = HandshakeSecrets::derive(
            &session_id,
            key.public_bytes(),
            &nonce,
            &ack.public_key,
            &ack.nonce,
            &shared_secret,
        )?;
        let sas = derive_sas(&secrets.transcript_hash);

        {
            let mut inner = self.shared.inner.lock().await;
            inner.crypto = Some(Arc::new(Mutex::new(SessionCrypto::new(
                &secrets,
                Role::Sender,
            )?)));
            inner.sas = Some(sas.clone());

            let verify = Frame::Verify(VerifyPayload {
                transcript_hash: secrets.transcript_hash,
                sas_code: sas.clone(),
            });
            inner.secrets = Some(secrets);
            if let Err(err) = transport.send(verify).await {
                drop(inner);
                return Err(self.fail_with(err.into()).await);
            }
            self.transition(&mut inner, SessionState::Verifying)?;
            self.shared
                .events
                .emit(SessionEvent::HandshakeSas { code: sas.clone() });
            self.shared.events.emit(SessionEvent::VerificationRequired);
            self.record_log(LogLevel::Info, "sas_derived", json!({"sas": sas}));
        }
        Ok(sas)
    }

    // -----------------------------------------------------------------
    // Receiver flow
    // -----------------------------------------------------------------

    /// Start receiving on a transport: advertise and let the frame pump
    /// drive the handshake as the peer's frames arrive.
    pub async fn start_receiver(&self, transport: Arc<dyn FrameTransport>) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        self.transition(&mut inner, SessionState::Advertising)?;
        inner.role = Some(Role::Receiver);
        self.attach_transport(&mut inner, transport);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------

    /// The user's verdict on the SAS comparison. Sends `VerifyAck` and,
    /// when both sides agree, moves the session into `transferring`.
    pub async fn confirm_sas(&self, matched: bool) -> Result<()> {
        let verify_ack_rx = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != SessionState::Verifying {
                return Err(GhostDropError::InvalidStateTransition {
                    from: inner.state,
                    to: SessionState::Transferring,
                });
            }
            let transport = inner
                .transport
                .clone()
                .ok_or(GhostDropError::TransportUnavailable)?;
            if let Err(err) = transport.send(Frame::VerifyAck(matched)).await {
                drop(inner);
                return Err(self.fail_with(err.into()).await);
            }
            inner.local_confirmed = Some(matched);

            if !matched {
                drop(inner);
                self.fail_session("verification rejected by local user").await;
                return Err(GhostDropError::VerificationRejected);
            }

            match inner.peer_confirmed {
                Some(true) => {
                    inner.verified = true;
                    self.transition(&mut inner, SessionState::Transferring)?;
                    return Ok(());
                }
                Some(false) => {
                    drop(inner);
                    self.fail_session("verification rejected by peer").await;
                    return Err(GhostDropError::VerificationRejected);
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.verify_ack_tx = Some(tx);
                    rx
                }
            }
        };

        match timeout(self.shared.config.verify_timeout, verify_ack_rx).await {
            Ok(Ok(true)) => {
                let mut inner = self.shared.inner.lock().await;
                inner.verified = true;
                self.transition(&mut inner, SessionState::Transferring)
            }
            Ok(Ok(false)) => {
                self.fail_session("verification rejected by peer").await;
                Err(GhostDropError::VerificationRejected)
            }
            Ok(Err(_)) => Err(GhostDropError::TransportClosed),
            Err(_) => {
                self.shared.inner.lock().await.verify_ack_tx = None;
                Err(self.fail_with(GhostDropError::Timeout("verify ack")).await)
            }
        }
    }

    // -----------------------------------------------------------------
    // File transfer (sender)
    // -----------------------------------------------------------------

    /// Send one file over the verified session: `Metadata`, wait for the
    /// receiver's `Resume`, stream the remaining chunks, `Complete`.
    pub async fn send_file(
        &self,
        path: &Path,
        mime_type: &str,
        requested_chunk_size: Option<u32>,
    ) -> Result<()> {
        let (transport, crypto, kind) = {
            let inner = self.shared.inner.lock().await;
            if inner.state != SessionState::Transferring {
                return Err(GhostDropError::InvalidStateTransition {
                    from: inner.state,
                    to: SessionState::Transferring,
                });
            }
            (
                inner
                    .transport
                    .clone()
                    .ok_or(GhostDropError::TransportUnavailable)?,
                inner.crypto.clone().ok_or_else(|| {
                    GhostDropError::HandshakeFailed("no session keys".into())
                })?,
                inner.transport_kind.unwrap_or(TransportKind::Gatt),
            )
        };

        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) => return Err(self.fail_with(err.into()).await),
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_string());

        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&Sha256::digest(&data));
        let transfer_id = derive_transfer_id(&sha256, &file_name);
        let chunk_size = self.shared.config.clamp_chunk_size(requested_chunk_size);
        let total_chunks = (data.len() as u64).div_ceil(u64::from(chunk_size));

        // Register the resume waiter before metadata goes out so the
        // reply cannot race past us.
        let resume_rx = {
            let mut inner = self.shared.inner.lock().await;
            let (tx, rx) = oneshot::channel();
            inner.resume_tx = Some(tx);
            rx
        };
        self.send_control(Frame::Metadata(MetadataPayload {
            transfer_id,
            file_name: file_name.clone(),
            file_size: data.len() as u64,
            mime_type: mime_type.to_string(),
            sha256,
            chunk_size,
        }))
        .await?;
        self.record_log(
            LogLevel::Info,
            "metadata_sent",
            json!({"transferId": transfer_id, "fileName": file_name, "chunks": total_chunks}),
        );

        let resume = match timeout(self.shared.config.resume_timeout, resume_rx).await {
            Ok(Ok(resume)) => resume,
            Ok(Err(_)) => return Err(GhostDropError::TransportClosed),
            Err(_) => {
                self.shared.inner.lock().await.resume_tx = None;
                return Err(self.fail_with(GhostDropError::Timeout("resume")).await);
            }
        };
        if resume.transfer_id != transfer_id {
            return Err(self
                .fail_with(GhostDropError::HandshakeFailed(
                    "resume for a different transfer".into(),
                ))
                .await);
        }
        let start_seq = resume_start_sequence(resume.last_confirmed).min(total_chunks);
        if start_seq > 0 {
            self.record_log(
                LogLevel::Info,
                "transfer_resumed",
                json!({"transferId": transfer_id, "startSequence": start_seq}),
            );
        }

        let mut progress = ProgressTracker::new(data.len() as u64, kind);
        let skipped = (start_seq * u64::from(chunk_size)).min(data.len() as u64);
        if skipped > 0 {
            progress.record(skipped);
        }

        for sequence in start_seq..total_chunks {
            // Task-level cancellation check between chunks.
            {
                let inner = self.shared.inner.lock().await;
                match inner.state {
                    SessionState::Transferring => {}
                    SessionState::Cancelled => return Err(GhostDropError::Cancelled),
                    other => {
                        return Err(GhostDropError::InvalidStateTransition {
                            from: other,
                            to: SessionState::Transferring,
                        })
                    }
                }
            }

            let start = (sequence * u64::from(chunk_size)) as usize;
            let end = (start + chunk_size as usize).min(data.len());
            let combined = match crypto
                .lock()
                .await
                .seal_data_payload(sequence, &data[start..end])
            {
                Ok(combined) => combined,
                Err(err) => return Err(self.fail_with(err).await),
            };
            if let Err(err) = transport
                .send(Frame::Data(DataPayload {
                    sequence,
                    payload: combined,
                }))
                .await
            {
                return Err(self.fail_with(err.into()).await);
            }
            self.shared.events.emit(SessionEvent::TransferProgress(
                progress.record((end - start) as u64),
            ));
        }

        self.send_control(Frame::Complete(CompletePayload {
            transfer_id,
            sha256,
        }))
        .await?;

        {
            let mut inner = self.shared.inner.lock().await;
            self.transition(&mut inner, SessionState::Completed)?;
            self.teardown_locked(&mut inner).await;
        }
        self.shared.events.emit(SessionEvent::TransferCompleted {
            file_name: file_name.clone(),
        });
        self.record_log(
            LogLevel::Info,
            "transfer_completed",
            json!({"transferId": transfer_id, "fileName": file_name}),
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cancellation + reset
    // -----------------------------------------------------------------

    /// Cancel the session: best-effort `Cancel` to the peer, transition to
    /// `cancelled`, tear the transport down. Resume state stays on disk.
    pub async fn cancel(&self, reason: &str) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_terminal() {
            return Ok(());
        }
        if let Some(transport) = inner.transport.clone() {
            let frame = Frame::Cancel(CancelPayload {
                reason: reason.to_string(),
            });
            let wire = match (&inner.crypto, inner.verified) {
                (Some(crypto), true) => crypto
                    .lock()
                    .await
                    .seal_frame(&frame)
                    .unwrap_or(frame),
                _ => frame,
            };
            let _ = transport.send(wire).await;
        }
        self.transition(&mut inner, SessionState::Cancelled)?;
        self.record_log(LogLevel::Warn, "session_cancelled", json!({"reason": reason}));
        self.teardown_locked(&mut inner).await;
        Ok(())
    }

    /// Return a terminal session to `idle`, clearing all session material.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        self.transition(&mut inner, SessionState::Idle)?;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        *inner = Inner::new();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Append to the session log and surface the entry to subscribers.
    fn record_log(&self, level: LogLevel, event: &str, details: serde_json::Value) {
        let entry = self.shared.log.record(level, event, details);
        self.shared.events.emit(SessionEvent::Log(entry));
    }

    fn transition(&self, inner: &mut Inner, to: SessionState) -> Result<()> {
        if inner.state == to {
            return Ok(());
        }
        if !inner.state.can_transition_to(to) {
            return Err(GhostDropError::InvalidStateTransition {
                from: inner.state,
                to,
            });
        }
        log::debug!("session state {} -> {}", inner.state, to);
        self.record_log(
            LogLevel::Info,
            "state_changed",
            json!({"from": inner.state.label(), "to": to.label()}),
        );
        inner.state = to;
        self.shared
            .events
            .emit(SessionEvent::StateChanged { state: to });
        Ok(())
    }

    fn attach_transport(&self, inner: &mut Inner, transport: Arc<dyn FrameTransport>) {
        let kind = transport.kind();
        inner.transport = Some(transport.clone());
        inner.transport_kind = Some(kind);
        self.shared
            .events
            .emit(SessionEvent::TransportSelected { transport: kind });
        self.record_log(
            LogLevel::Info,
            "transport_selected",
            json!({"transport": kind.label()}),
        );
        let engine = self.clone();
        inner.pump = Some(tokio::spawn(async move {
            engine.pump(transport).await;
        }));
    }

    async fn teardown_locked(&self, inner: &mut Inner) {
        inner.hello_ack_tx = None;
        inner.verify_ack_tx = None;
        inner.resume_tx = None;
        if let Some(transport) = inner.transport.take() {
            transport.close().await;
        }
        inner.transport_kind = None;
    }

    async fn fail_session(&self, message: &str) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        let _ = self.transition(&mut inner, SessionState::Failed);
        self.record_log(
            LogLevel::Error,
            "transfer_failed",
            json!({"message": message}),
        );
        self.shared.events.emit(SessionEvent::TransferFailed {
            message: message.to_string(),
        });
        self.teardown_locked(&mut inner).await;
    }

    async fn fail_with(&self, err: GhostDropError) -> GhostDropError {
        self.fail_session(&err.to_string()).await;
        err
    }

    /// Send a control frame, sealing it when the session is verified.
    /// `Ack` and `Resume` always go plaintext — idempotent integrity
    /// hints the peer cross-checks against its own bookkeeping.
    async fn send_control(&self, frame: Frame) -> Result<()> {
        let (transport, crypto_for_seal) = {
            let inner = self.shared.inner.lock().await;
            let transport = inner
                .transport
                .clone()
                .ok_or(GhostDropError::TransportUnavailable)?;
            let needs_seal =
                inner.verified && !matches!(frame, Frame::Ack(_) | Frame::Resume(_));
            let crypto = if needs_seal {
                Some(inner.crypto.clone().ok_or_else(|| {
                    GhostDropError::Encryption("no session keys".into())
                })?)
            } else {
                None
            };
            (transport, crypto)
        };
        let wire = match crypto_for_seal {
            Some(crypto) => crypto.lock().await.seal_frame(&frame)?,
            None => frame,
        };
        match transport.send(wire).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_with(err.into()).await),
        }
    }

    // -----------------------------------------------------------------
    // Frame pump
    // -----------------------------------------------------------------

    async fn pump(self, transport: Arc<dyn FrameTransport>) {
        loop {
            match transport.next_frame().await {
                Ok(frame) => {
                    if let Err(err) = self.handle_frame(frame).await {
                        log::warn!("frame handling failed: {err}");
                        self.fail_session(&err.to_string()).await;
                        return;
                    }
                }
                Err(err) => {
                    let terminal = self.shared.inner.lock().await.state.is_terminal();
                    if !terminal {
                        self.fail_session(&GhostDropError::from(err).to_string()).await;
                    }
                    return;
                }
            }
            if self.shared.inner.lock().await.state.is_terminal() {
                return;
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        // Sealed envelopes are opened, then the inner frame is processed
        // as if it had arrived bare.
        let mut frame = frame;
        while matches!(frame, Frame::Encrypted(_)) {
            let crypto = self
                .shared
                .inner
                .lock()
                .await
                .crypto
                .clone()
                .ok_or_else(|| {
                    GhostDropError::HandshakeFailed("sealed frame before handshake".into())
                })?;
            frame = crypto.lock().await.open_frame(&frame)?;
        }

        log::trace!("frame in: {}", frame.label());
        match frame {
            Frame::Hello(hello) => self.on_hello(hello).await,
            Frame::HelloAck(ack) => self.on_hello_ack(ack).await,
            Frame::Verify(verify) => self.on_verify(verify).await,
            Frame::VerifyAck(matched) => self.on_verify_ack(matched).await,
            Frame::Metadata(metadata) => self.on_metadata(metadata).await,
            Frame::Data(data) => self.on_data(data).await,
            Frame::Ack(ack) => {
                // The GATT layer has already fed this into its window;
                // at session level an ACK is progress bookkeeping only.
                log::trace!("ack through seq {}", ack.cumulative);
                Ok(())
            }
            Frame::Resume(resume) => self.on_resume(resume).await,
            Frame::Complete(complete) => self.on_complete(complete).await,
            Frame::Cancel(cancel) => Err(GhostDropError::HandshakeFailed(format!(
                "Peer cancelled: {}",
                cancel.reason
            ))),
            Frame::Ping(token) => {
                log::debug!("ping {token}");
                Ok(())
            }
            Frame::Encrypted(_) => unreachable!("unwrapped above"),
        }
    }

    async fn on_hello(&self, hello: HelloPayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.role != Some(Role::Receiver) {
            return Err(GhostDropError::HandshakeFailed(
                "unexpected hello frame".into(),
            ));
        }
        self.transition(&mut inner, SessionState::Negotiating)?;

        let key = EphemeralHandshakeKey::generate();
        let nonce = crypto::generate_nonce();
        let shared_secret = key.agree(&hello.public_key)?;
        let secrets = HandshakeSecrets::derive(
            &hello.session_id,
            key.public_bytes(),
            &nonce,
            &hello.public_key,
            &hello.nonce,
            &shared_secret,
        )?;
        let sas = derive_sas(&secrets.transcript_hash);

        inner.remote_capabilities = Some(hello.capabilities.normalised());
        inner.crypto = Some(Arc::new(Mutex::new(SessionCrypto::new(
            &secrets,
            Role::Receiver,
        )?)));
        inner.sas = Some(sas.clone());
        inner.secrets = Some(secrets);

        let transport = inner
            .transport
            .clone()
            .ok_or(GhostDropError::TransportUnavailable)?;
        transport
            .send(Frame::HelloAck(HelloAckPayload {
                session_id: hello.session_id,
                public_key: key.public_bytes().to_vec(),
                nonce,
            }))
            .await?;

        self.transition(&mut inner, SessionState::Verifying)?;
        self.shared
            .events
            .emit(SessionEvent::HandshakeSas { code: sas.clone() });
        self.shared.events.emit(SessionEvent::VerificationRequired);
        self.record_log(
            LogLevel::Info,
            "hello_received",
            json!({"sessionId": hello.session_id, "peerDevice": hello.device_id, "sas": sas}),
        );
        Ok(())
    }

    async fn on_hello_ack(&self, ack: HelloAckPayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        match inner.hello_ack_tx.take() {
            Some(tx) => {
                let _ = tx.send(ack);
                Ok(())
            }
            None => Err(GhostDropError::HandshakeFailed(
                "unexpected hello ack".into(),
            )),
        }
    }

    async fn on_verify(&self, verify: VerifyPayload) -> Result<()> {
        let inner = self.shared.inner.lock().await;
        let secrets = inner.secrets.as_ref().ok_or_else(|| {
            GhostDropError::HandshakeFailed("verify before key agreement".into())
        })?;
        if verify.transcript_hash != secrets.transcript_hash {
            return Err(GhostDropError::HandshakeFailed(
                "transcript hash mismatch".into(),
            ));
        }
        if Some(&verify.sas_code) != inner.sas.as_ref() {
            return Err(GhostDropError::HandshakeFailed(
                "authentication code mismatch".into(),
            ));
        }
        self.record_log(LogLevel::Info, "verify_matched", json!({}));
        Ok(())
    }

    async fn on_verify_ack(&self, matched: bool) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        inner.peer_confirmed = Some(matched);
        if let Some(tx) = inner.verify_ack_tx.take() {
            let _ = tx.send(matched);
            return Ok(());
        }
        if !matched {
            return Err(GhostDropError::VerificationRejected);
        }
        if inner.local_confirmed == Some(true) && inner.state == SessionState::Verifying {
            inner.verified = true;
            self.transition(&mut inner, SessionState::Transferring)?;
        }
        Ok(())
    }

    async fn on_metadata(&self, metadata: MetadataPayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.verified || inner.state != SessionState::Transferring {
            return Err(GhostDropError::HandshakeFailed(
                "metadata before verification".into(),
            ));
        }
        if metadata.chunk_size == 0 {
            return Err(GhostDropError::HandshakeFailed("invalid chunk size".into()));
        }

        let last_confirmed = self
            .shared
            .resume_store
            .load(&metadata.transfer_id)
            .map_err(|err| GhostDropError::Io(err.to_string()))?
            .map(|state| state.last_confirmed_sequence)
            .unwrap_or(0);

        let file = self
            .shared
            .incoming_store
            .open(&metadata.transfer_id, &metadata.file_name, metadata.file_size)
            .await
            .map_err(|err| GhostDropError::Io(err.to_string()))?;

        let kind = inner.transport_kind.unwrap_or(TransportKind::Gatt);
        inner.receive = Some(ReceiveContext {
            transfer_id: metadata.transfer_id,
            file_name: metadata.file_name.clone(),
            file_size: metadata.file_size,
            chunk_size: metadata.chunk_size,
            sha256: metadata.sha256,
            file,
            last_confirmed,
            progress: ProgressTracker::new(metadata.file_size, kind),
        });

        let transport = inner
            .transport
            .clone()
            .ok_or(GhostDropError::TransportUnavailable)?;
        transport
            .send(Frame::Resume(ResumePayload {
                transfer_id: metadata.transfer_id,
                last_confirmed,
            }))
            .await?;
        self.record_log(
            LogLevel::Info,
            "metadata_received",
            json!({
                "transferId": metadata.transfer_id,
                "fileName": metadata.file_name,
                "lastConfirmed": last_confirmed,
            }),
        );
        Ok(())
    }

    async fn on_data(&self, data: DataPayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.verified {
            return Err(GhostDropError::HandshakeFailed(
                "data before verification".into(),
            ));
        }
        let crypto = inner.crypto.clone().ok_or_else(|| {
            GhostDropError::HandshakeFailed("data before key agreement".into())
        })?;
        let plaintext = crypto
            .lock()
            .await
            .open_data_payload(data.sequence, &data.payload)?;

        let ctx = inner.receive.as_mut().ok_or_else(|| {
            GhostDropError::HandshakeFailed("data before metadata".into())
        })?;
        let offset = data.sequence * u64::from(ctx.chunk_size);
        ctx.file
            .write_chunk(offset, &plaintext)
            .await
            .map_err(|err| GhostDropError::Io(err.to_string()))?;
        ctx.last_confirmed = ctx.last_confirmed.max(data.sequence);
        let resume_state = TransferResumeState {
            transfer_id: ctx.transfer_id,
            file_name: ctx.file_name.clone(),
            file_size: ctx.file_size,
            sha256_hex: hex::encode(ctx.sha256),
            chunk_size: ctx.chunk_size,
            last_confirmed_sequence: ctx.last_confirmed,
            updated_at: chrono::Utc::now(),
        };
        let ack = AckPayload {
            cumulative: ctx.last_confirmed,
            nack_bitmap: 0,
        };
        let progress = ctx.progress.record(plaintext.len() as u64);

        self.shared
            .resume_store
            .save(&resume_state)
            .map_err(|err| GhostDropError::Io(err.to_string()))?;

        // Best-effort: a lost ACK is recovered by the sender's retry
        // timer, and a sender that completed may already be gone.
        if let Some(transport) = inner.transport.clone() {
            if let Err(err) = transport.send(Frame::Ack(ack)).await {
                log::debug!("ack for sequence {} not delivered: {err}", data.sequence);
            }
        }
        self.shared
            .events
            .emit(SessionEvent::TransferProgress(progress));
        Ok(())
    }

    async fn on_resume(&self, resume: ResumePayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        match inner.resume_tx.take() {
            Some(tx) => {
                let _ = tx.send(resume);
                Ok(())
            }
            None => {
                log::debug!(
                    "ignoring unsolicited resume for transfer {}",
                    resume.transfer_id
                );
                Ok(())
            }
        }
    }

    async fn on_complete(&self, complete: CompletePayload) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let mut ctx = inner.receive.take().ok_or_else(|| {
            GhostDropError::HandshakeFailed("complete before metadata".into())
        })?;
        if ctx.transfer_id != complete.transfer_id {
            return Err(GhostDropError::HandshakeFailed(
                "complete for a different transfer".into(),
            ));
        }

        let digest = ctx
            .file
            .finalize()
            .await
            .map_err(|err| GhostDropError::Io(err.to_string()))?;
        if digest != complete.sha256 {
            // Resume state is left in place: the bytes on disk are still
            // the best starting point for another attempt.
            return Err(GhostDropError::HandshakeFailed(
                "Final SHA256 mismatch".into(),
            ));
        }

        self.shared
            .resume_store
            .delete(&complete.transfer_id)
            .map_err(|err| GhostDropError::Io(err.to_string()))?;
        self.transition(&mut inner, SessionState::Completed)?;
        self.teardown_locked(&mut inner).await;
        self.shared.events.emit(SessionEvent::TransferCompleted {
            file_name: ctx.file_name.clone(),
        });
        self.record_log(
            LogLevel::Info,
            "transfer_completed",
            json!({"transferId": complete.transfer_id, "fileName": ctx.file_name}),
        );
        Ok(())
    }
}

/// A file's transfer identity is stable across retries so the receiver's
/// resume state keys to the same id after a reconnect.
fn derive_transfer_id(sha256: &[u8; 32], file_name: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(sha256);
    hasher.update(file_name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// The receiver reports the highest sequence it has written; everything
/// before that is on disk, so sending resumes just past it. A report of 0
/// is indistinguishable from "nothing yet" and restarts at 0 — rewriting
/// sequence 0 is idempotent.
fn resume_start_sequence(last_confirmed: u64) -> u64 {
    if last_confirmed == 0 {
        0
    } else {
        last_confirmed + 1
    }
}
