//! Transport selection: prefer the L2CAP stream when both sides can run
//! it, fall back to the GATT reliability layer otherwise.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::device::GhostCapabilities;
use crate::error::{GhostDropError, Result};
use crate::transport::{FrameTransport, TransportError, TransportKind};

/// How long an L2CAP channel open may take before we stop waiting on it.
pub const L2CAP_SETUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens one concrete transport. Implemented over the radio adapter by the
/// embedding application; tests use stubs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> std::result::Result<Box<dyn FrameTransport>, TransportError>;
}

/// Choose and start a transport for the session.
///
/// L2CAP is tried only when the remote advertises support and a factory
/// was provided; any setup failure logs and falls back to GATT. The GATT
/// factory failing is terminal.
pub async fn negotiate(
    remote: &GhostCapabilities,
    l2cap: Option<&dyn TransportFactory>,
    gatt: &dyn TransportFactory,
) -> Result<(TransportKind, Box<dyn FrameTransport>)> {
    if remote.supports_l2cap {
        if let Some(factory) = l2cap {
            match timeout(L2CAP_SETUP_TIMEOUT, factory.open()).await {
                Ok(Ok(transport)) => {
                    log::info!("transport negotiated: l2cap");
                    return Ok((TransportKind::L2cap, transport));
                }
                Ok(Err(err)) => {
                    log::warn!("l2cap setup failed, falling back to gatt: {err}");
                }
                Err(_) => {
                    log::warn!(
                        "l2cap setup timed out after {}s, falling back to gatt",
                        L2CAP_SETUP_TIMEOUT.as_secs()
                    );
                }
            }
        }
    }

    let transport = gatt
        .open()
        .await
        .map_err(|err| match err {
            TransportError::Setup(_) => GhostDropError::TransportUnavailable,
            other => other.into(),
        })?;
    log::info!("transport negotiated: gatt");
    Ok((TransportKind::Gatt, transport))
}
