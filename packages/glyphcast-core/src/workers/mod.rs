//! Per-client worker threads.
//!
//! For every socket client the hub runs four workers: receive (handshake,
//! demux, validate, deposit into ingress), video render (personalized ASCII
//! composition), audio render (personalized Opus mix), and send (prioritized
//! egress drain). All of them poll the shutdown flags at least every ~100ms
//! and exit without further work once `active` drops.

pub mod audio;
pub mod pacing;
pub mod receive;
pub mod send;
pub mod video;

pub use audio::run_audio_render_worker;
pub use pacing::AdaptiveSleep;
pub use receive::{disconnect_for_bad_data, run_receive_worker};
pub use send::{run_send_worker, send_to_client};
pub use video::run_video_render_worker;
