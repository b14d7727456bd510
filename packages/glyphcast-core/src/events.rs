//! Host callback abstraction.
//!
//! The embedding mode (headless server, mirror) observes hub activity through
//! the [`HubEvents`] trait rather than a concrete channel, which keeps the
//! data plane free of any terminal or UI coupling.

use crate::client::{ClientId, ClientInfo};
use crate::error::HubError;

/// Callbacks delivered by the host façade.
///
/// Implementations must be cheap and non-blocking: callbacks fire on worker
/// threads, between loop iterations.
pub trait HubEvents: Send + Sync {
    /// A client completed its handshake and announced itself.
    fn on_client_join(&self, info: &ClientInfo);

    /// A client left or was disconnected; fired before its record is freed.
    fn on_client_leave(&self, client_id: ClientId);

    /// A video frame landed in a client's ingress buffer.
    fn on_frame_received(&self, client_id: ClientId, width: u32, height: u32);

    /// Audio samples landed in a client's ingress ring.
    fn on_audio_received(&self, client_id: ClientId, samples: usize);

    /// A worker observed an error, scoped to a client when known.
    fn on_error(&self, client_id: Option<ClientId>, error: &HubError);
}

/// No-op events for headless deployments and tests.
pub struct NoopHubEvents;

impl HubEvents for NoopHubEvents {
    fn on_client_join(&self, _info: &ClientInfo) {}

    fn on_client_leave(&self, _client_id: ClientId) {}

    fn on_frame_received(&self, _client_id: ClientId, _width: u32, _height: u32) {}

    fn on_audio_received(&self, _client_id: ClientId, _samples: usize) {}

    fn on_error(&self, _client_id: Option<ClientId>, _error: &HubError) {}
}

/// Logs every event at debug level. Useful in development builds.
pub struct LoggingHubEvents;

impl HubEvents for LoggingHubEvents {
    fn on_client_join(&self, info: &ClientInfo) {
        log::debug!("client joined: {} ({:?})", info.id, info.display_name);
    }

    fn on_client_leave(&self, client_id: ClientId) {
        log::debug!("client left: {client_id}");
    }

    fn on_frame_received(&self, client_id: ClientId, width: u32, height: u32) {
        log::debug!("frame from {client_id}: {width}x{height}");
    }

    fn on_audio_received(&self, client_id: ClientId, samples: usize) {
        log::debug!("audio from {client_id}: {samples} samples");
    }

    fn on_error(&self, client_id: Option<ClientId>, error: &HubError) {
        log::debug!("error on {client_id:?}: {error}");
    }
}
