//! The host façade: lifecycle, accept loop, client management, injection and
//! broadcast entry points.
//!
//! A [`Hub`] owns the listening sockets, the client registry, and every
//! worker thread. Per-client workers are supervised by their receive worker;
//! memory participants (in-process peers) get render workers managed here.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::client::{
    Attachment, ClientId, ClientInfo, ClientRecord, ClientRegistry,
};
use crate::config::HostConfig;
use crate::crypto::{load_or_generate_identity, AllowList};
use crate::error::{ErrorCode, HubError};
use crate::events::HubEvents;
use crate::mixer::AudioMixer;
use crate::protocol::control::{ErrorPacket, ServerState};
use crate::protocol::media::rgb_len;
use crate::protocol::PacketType;
use crate::transport::{ClientTransport, TransportSlot};
use crate::workers::{
    run_audio_render_worker, run_receive_worker, run_video_render_worker, send_to_client,
};

/// Accept loop poll interval; bounds how late shutdown can be observed.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Listen backlog.
const LISTEN_BACKLOG: i32 = 64;

/// State shared by the hub and all of its worker threads.
pub struct HubShared {
    pub config: HostConfig,
    pub registry: ClientRegistry,
    /// Process-level stop signal; every blocking wait checks it.
    pub should_exit: AtomicBool,
    /// Gates frame/packet production of the render workers as a group.
    pub render_enabled: AtomicBool,
    pub events: Arc<dyn HubEvents>,
    pub identity: Option<SigningKey>,
    pub allowlist: Option<AllowList>,
    pub mixer: AudioMixer,
    workers: Mutex<WorkerTable>,
}

#[derive(Default)]
struct WorkerTable {
    /// Receive workers (one per socket client); finished handles are reaped
    /// by the accept loop and the remainder joined at stop.
    receive: Vec<JoinHandle<()>>,
    /// Render workers of memory participants, joined at removal or stop.
    memory: HashMap<ClientId, Vec<JoinHandle<()>>>,
}

/// Broadcasts the current `SERVER_STATE` to every ready socket client.
///
/// Enqueued, never sent inline: callers may be worker threads that must not
/// block on a peer's transport.
pub fn broadcast_server_state(shared: &HubShared) {
    let state = ServerState {
        client_count: shared.registry.len() as u32,
        flags: 0,
    }
    .encode();
    for record in shared.registry.snapshot() {
        if record.attachment == Attachment::Network
            && record.session_ready.load(Ordering::Acquire)
            && record.is_active()
        {
            let _ = record
                .egress_audio
                .enqueue(PacketType::ServerState, state.clone(), false);
        }
    }
}

/// The conferencing hub.
pub struct Hub {
    shared: Arc<HubShared>,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    running: bool,
    accept_threads: Vec<JoinHandle<()>>,
    memory_participant: Option<ClientId>,
}

impl Hub {
    /// Creates a hub from a validated configuration. Loads the identity key
    /// and builds the allow-list; both are startup-fatal on failure.
    pub fn new(config: HostConfig, events: Arc<dyn HubEvents>) -> Result<Self, HubError> {
        config
            .validate()
            .map_err(HubError::Startup)?;

        let identity = match &config.identity_key_path {
            Some(path) => Some(
                load_or_generate_identity(path)
                    .map_err(|e| HubError::Startup(format!("identity key: {e}")))?,
            ),
            None => None,
        };
        let allowlist = config
            .client_allowlist
            .as_ref()
            .map(|keys| AllowList::new(keys.iter().copied()));

        let max_clients = config.limits.max_clients;
        Ok(Self {
            shared: Arc::new(HubShared {
                registry: ClientRegistry::new(max_clients),
                should_exit: AtomicBool::new(false),
                render_enabled: AtomicBool::new(true),
                events,
                identity,
                allowlist,
                mixer: AudioMixer::new(true),
                workers: Mutex::new(WorkerTable::default()),
                config,
            }),
            state: Mutex::new(HubState::default()),
        })
    }

    /// Binds the configured listeners and starts the accept loop.
    pub fn start(&self) -> Result<(), HubError> {
        let mut state = self.state.lock();
        if state.running {
            return Err(HubError::InvalidArgument("hub already running".into()));
        }
        self.shared.should_exit.store(false, Ordering::Release);

        let mut listeners = Vec::new();
        if let Some(addr) = self.shared.config.ipv4_bind {
            listeners.push(bind_listener(addr, self.shared.config.port, false)?);
        }
        if let Some(addr) = self.shared.config.ipv6_bind {
            listeners.push(bind_listener(addr, self.shared.config.port, true)?);
        }

        for listener in listeners {
            let shared = self.shared.clone();
            let local = listener
                .local_addr()
                .map_err(|e| HubError::Startup(format!("listener address: {e}")))?;
            let handle = std::thread::Builder::new()
                .name(format!("accept-{local}"))
                .spawn(move || accept_loop(shared, listener))
                .map_err(|e| HubError::Startup(format!("cannot spawn accept loop: {e}")))?;
            state.accept_threads.push(handle);
            log::info!("listening on {local}");
        }
        state.running = true;
        Ok(())
    }

    /// Stops everything: signals shutdown, then joins workers in order
    /// (per-client workers through their receive worker, then accept loops,
    /// then memory-participant workers) and closes the listeners last.
    /// Joins carry no timeout; every blocking wait in the workers is bounded,
    /// so they exit promptly.
    pub fn stop(&self) {
        // Runs even when never started: directly-added clients and memory
        // participants still need their teardown.
        let mut state = self.state.lock();
        state.running = false;

        // Best-effort goodbye before the flags drop the transports.
        for record in self.shared.registry.snapshot() {
            if record.attachment == Attachment::Network
                && record.session_ready.load(Ordering::Acquire)
            {
                let _ = send_to_client(&record, PacketType::ClientLeave, &[], false);
            }
            record.begin_shutdown();
        }

        self.shared.should_exit.store(true, Ordering::Release);

        // Receive workers join their own render/send workers, remove their
        // records, and fire on_client_leave.
        let receive = std::mem::take(&mut self.shared.workers.lock().receive);
        for handle in receive {
            let _ = handle.join();
        }

        for handle in state.accept_threads.drain(..) {
            let _ = handle.join();
        }

        // Memory participants have no receive worker; finish them here.
        let memory = std::mem::take(&mut self.shared.workers.lock().memory);
        for (client_id, handles) in memory {
            for handle in handles {
                let _ = handle.join();
            }
            if self.shared.registry.remove(client_id).is_some() {
                self.shared.events.on_client_leave(client_id);
            }
        }
        state.memory_participant = None;

        log::info!("hub stopped; all workers joined");
    }

    /// Enables frame and packet production in the render workers.
    pub fn start_render(&self) {
        self.shared.render_enabled.store(true, Ordering::Release);
    }

    /// Halts production in the render workers as a group. The workers keep
    /// ticking (cheaply) so a later `start_render` resumes instantly.
    pub fn stop_render(&self) {
        self.shared.render_enabled.store(false, Ordering::Release);
    }

    /// Adds a socket client and spawns its receive worker. Invoked by the
    /// accept loop; public for embedders and tests that carry their own
    /// connections.
    pub fn add_client(&self, stream: TcpStream, addr: SocketAddr) -> Result<ClientId, HubError> {
        add_network_client(&self.shared, stream, addr)
    }

    /// Registers the single in-process peer (e.g. the host's own webcam).
    pub fn add_memory_participant(&self) -> Result<ClientId, HubError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.memory_participant {
            return Err(HubError::InvalidArgument(format!(
                "memory participant {existing} already exists"
            )));
        }

        let id = self.shared.registry.allocate_id();
        let record = Arc::new(ClientRecord::new(
            id,
            None,
            Attachment::Memory,
            TransportSlot::detached(),
            &self.shared.config,
        ));
        record.session_ready.store(true, Ordering::Release);
        {
            let mut profile = record.profile.lock();
            profile.display_name = "local".to_string();
            profile.can_send_video = true;
            profile.can_send_audio = true;
        }
        self.shared.registry.insert(record.clone())?;

        let mut handles = Vec::with_capacity(2);
        let entries: [(&str, fn(Arc<HubShared>, Arc<ClientRecord>)); 2] = [
            ("video-render", run_video_render_worker),
            ("audio-render", run_audio_render_worker),
        ];
        for (name, entry) in entries {
            let shared = self.shared.clone();
            let worker_record = record.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{}", id.0))
                .spawn(move || entry(shared, worker_record))
                .map_err(|e| {
                    HubError::Resource(format!("cannot spawn participant workers: {e}"))
                })?;
            handles.push(handle);
        }
        self.shared.workers.lock().memory.insert(id, handles);
        state.memory_participant = Some(id);

        self.shared.events.on_client_join(&record.info());
        broadcast_server_state(&self.shared);
        Ok(id)
    }

    /// Writes a raw RGB frame directly into a participant's ingress buffer,
    /// bypassing the network.
    pub fn inject_frame(
        &self,
        client_id: ClientId,
        width: u32,
        height: u32,
        rgb: &[u8],
    ) -> Result<(), HubError> {
        let record = self
            .shared
            .registry
            .get(client_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("no client {client_id}")))?;
        let expected = rgb_len(width, height)
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        if rgb.len() != expected {
            return Err(HubError::InvalidArgument(format!(
                "frame payload is {} bytes, expected {expected} for {width}x{height}",
                rgb.len()
            )));
        }

        let mut write = record.ingress_video.begin_write();
        let slot = write.slot();
        slot.data.clear();
        slot.data.extend_from_slice(rgb);
        slot.width = width;
        slot.height = height;
        slot.capture_timestamp_us = unix_micros();
        write
            .commit()
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;

        let _ = record.is_sending_video.compare_exchange(
            false,
            true,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        record.frames_received.fetch_add(1, Ordering::Relaxed);
        self.shared.events.on_frame_received(client_id, width, height);
        Ok(())
    }

    /// Writes PCM samples directly into a participant's ingress ring.
    pub fn inject_audio(&self, client_id: ClientId, samples: &[f32]) -> Result<(), HubError> {
        let record = self
            .shared
            .registry
            .get(client_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("no client {client_id}")))?;
        let _ = record.is_sending_audio.compare_exchange(
            false,
            true,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        record.ingress_audio.write(samples);
        self.shared.events.on_audio_received(client_id, samples.len());
        Ok(())
    }

    /// Disconnects a client. Socket clients tear down through their receive
    /// worker; memory participants are finished inline.
    pub fn remove_client(&self, client_id: ClientId) -> Result<(), HubError> {
        let record = self
            .shared
            .registry
            .get(client_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("no client {client_id}")))?;

        record.begin_shutdown();
        record.transport.half_close();

        if record.attachment == Attachment::Memory {
            let handles = self.shared.workers.lock().memory.remove(&client_id);
            if let Some(handles) = handles {
                for handle in handles {
                    let _ = handle.join();
                }
            }
            if self.shared.registry.remove(client_id).is_some() {
                self.shared.events.on_client_leave(client_id);
                broadcast_server_state(&self.shared);
            }
            let mut state = self.state.lock();
            if state.memory_participant == Some(client_id) {
                state.memory_participant = None;
            }
        }
        Ok(())
    }

    pub fn find_client(&self, client_id: ClientId) -> Option<ClientInfo> {
        self.shared.registry.get(client_id).map(|record| record.info())
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.shared.registry.ids()
    }

    /// Queues a server-composed ASCII frame to every ready socket client,
    /// bypassing the renderer (banners, announcements).
    pub fn broadcast_frame(&self, ascii: &[u8]) {
        let payload = Bytes::copy_from_slice(ascii);
        for record in self.shared.registry.snapshot() {
            if record.attachment == Attachment::Network
                && record.session_ready.load(Ordering::Acquire)
                && record.is_active()
            {
                let _ = record
                    .egress_audio
                    .enqueue(PacketType::AsciiFrame, payload.clone(), false);
            }
        }
    }

    /// Queues a server-composed ASCII frame to one client.
    pub fn send_frame(&self, client_id: ClientId, ascii: &[u8]) -> Result<(), HubError> {
        let record = self
            .shared
            .registry
            .get(client_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("no client {client_id}")))?;
        record
            .egress_audio
            .enqueue(
                PacketType::AsciiFrame,
                Bytes::copy_from_slice(ascii),
                false,
            )
            .map_err(|e| HubError::Resource(e.to_string()))
    }

    /// Swaps the client's transport; once set it supersedes the socket.
    pub fn set_client_transport(
        &self,
        client_id: ClientId,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<(), HubError> {
        let record = self
            .shared
            .registry
            .get(client_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("no client {client_id}")))?;
        record.transport.set_override(transport);
        Ok(())
    }

    /// The most recently composed egress frame for a client. This is how a
    /// mirror embedding reads back the memory participant's view.
    pub fn latest_composed_frame(&self, client_id: ClientId) -> Option<Bytes> {
        let record = self.shared.registry.get(client_id)?;
        let mut slot = crate::buffers::FrameSlot::default();
        if record.egress_video.read_latest(&mut slot) {
            Some(Bytes::from(slot.data))
        } else {
            None
        }
    }

    /// Shared state handle for tests and embedded workers.
    pub fn shared(&self) -> &Arc<HubShared> {
        &self.shared
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        // host_destroy semantics: a dropped hub leaves no threads behind.
        self.stop();
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Registers a socket client and spawns its receive worker.
pub(crate) fn add_network_client(
    shared: &Arc<HubShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<ClientId, HubError> {
    let write_half = stream.try_clone()?;
    let id = shared.registry.allocate_id();
    let record = Arc::new(ClientRecord::new(
        id,
        Some(addr),
        Attachment::Network,
        TransportSlot::from_socket(write_half),
        &shared.config,
    ));
    if let Err(e) = shared.registry.insert(record.clone()) {
        // Resource exhaustion rejects the new client with an error packet;
        // existing clients are unaffected.
        let payload = ErrorPacket {
            code: ErrorCode::ServerFull as u32,
            reason: e.to_string(),
        }
        .encode();
        let _ = send_to_client(&record, PacketType::Error, &payload, true);
        record.transport.half_close();
        return Err(e);
    }

    let worker_shared = shared.clone();
    let worker_record = record.clone();
    let handle = std::thread::Builder::new()
        .name(format!("receive-{}", id.0))
        .spawn(move || run_receive_worker(worker_shared, worker_record, stream))
        .map_err(|e| {
            shared.registry.remove(id);
            HubError::Resource(format!("cannot spawn receive worker: {e}"))
        })?;
    shared.workers.lock().receive.push(handle);

    log::info!("accepted client {id} from {addr}");
    Ok(id)
}

/// Builds one listener with socket2: reuse-address, v6-only for the IPv6
/// listener, non-blocking so the accept loop can poll the shutdown flag.
fn bind_listener(addr: IpAddr, port: u16, v6_only: bool) -> Result<TcpListener, HubError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| HubError::Startup(format!("socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| HubError::Startup(format!("SO_REUSEADDR: {e}")))?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(v6_only)
            .map_err(|e| HubError::Startup(format!("IPV6_V6ONLY: {e}")))?;
    }
    let sock_addr = SocketAddr::new(addr, port);
    socket
        .bind(&sock_addr.into())
        .map_err(|e| HubError::Startup(format!("bind {sock_addr}: {e}")))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| HubError::Startup(format!("listen {sock_addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| HubError::Startup(format!("nonblocking: {e}")))?;
    Ok(socket.into())
}

/// Accepts connections until shutdown, spawning a receive worker for each.
/// The handshake happens in the receive worker, never here.
fn accept_loop(shared: Arc<HubShared>, listener: TcpListener) {
    while !shared.should_exit.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                match add_network_client(&shared, stream, addr) {
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("rejecting {addr}: {e}");
                        shared.events.on_error(None, &e);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                reap_finished(&shared);
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::warn!("accept error: {e}");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::debug!("accept loop exiting");
}

/// Joins receive workers whose clients already left, so the handle table does
/// not grow for the lifetime of the hub.
fn reap_finished(shared: &HubShared) {
    let mut workers = shared.workers.lock();
    let mut index = 0;
    while index < workers.receive.len() {
        if workers.receive[index].is_finished() {
            let handle = workers.receive.swap_remove(index);
            let _ = handle.join();
        } else {
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopHubEvents;

    fn test_config() -> HostConfig {
        HostConfig {
            port: 0,
            ..Default::default()
        }
    }

    fn test_hub() -> Hub {
        Hub::new(test_config(), Arc::new(NoopHubEvents)).unwrap()
    }

    #[test]
    fn invalid_config_is_startup_error() {
        let config = HostConfig {
            ipv4_bind: None,
            ipv6_bind: None,
            ..Default::default()
        };
        assert!(matches!(
            Hub::new(config, Arc::new(NoopHubEvents)),
            Err(HubError::Startup(_))
        ));
    }

    #[test]
    fn memory_participant_is_singular() {
        let hub = test_hub();
        let id = hub.add_memory_participant().unwrap();
        assert!(hub.add_memory_participant().is_err());
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.client_ids(), vec![id]);

        let info = hub.find_client(id).unwrap();
        assert_eq!(info.attachment, Attachment::Memory);
        hub.stop();
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn inject_frame_validates_payload_size() {
        let hub = test_hub();
        let id = hub.add_memory_participant().unwrap();

        assert!(matches!(
            hub.inject_frame(id, 4, 4, &[0u8; 10]),
            Err(HubError::InvalidArgument(_))
        ));
        hub.inject_frame(id, 4, 4, &[0xFFu8; 48]).unwrap();
        let info = hub.find_client(id).unwrap();
        assert!(info.is_sending_video);
        assert_eq!(info.frames_received, 1);
        hub.stop();
    }

    #[test]
    fn inject_audio_marks_sending() {
        let hub = test_hub();
        let id = hub.add_memory_participant().unwrap();
        hub.inject_audio(id, &[0.5f32; 480]).unwrap();
        assert!(hub.find_client(id).unwrap().is_sending_audio);
        hub.stop();
    }

    #[test]
    fn remove_unknown_client_is_an_argument_error() {
        let hub = test_hub();
        assert!(matches!(
            hub.remove_client(ClientId(77)),
            Err(HubError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let hub = test_hub();
        hub.add_memory_participant().unwrap();
        hub.stop();
        hub.stop();
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn start_binds_and_stop_joins() {
        let hub = test_hub();
        hub.start().unwrap();
        assert!(hub.start().is_err());
        hub.stop();
    }
}
