//! Per-client video render worker.
//!
//! Composites the latest frames of every *other* sending peer into one
//! personalized ASCII grid at the client's requested rate, and publishes it
//! to the client's egress double buffer. Never renders the client's own feed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::buffers::FrameSlot;
use crate::client::ClientRecord;
use crate::hub::HubShared;
use crate::render::{
    cell_dimensions, compose_grid, grid_dimensions, image_to_cell, placeholder_cell,
    ConvertOptions,
};
use crate::stats::RateLimiter;

/// Lag warnings fire when a tick lands later than this multiple of the
/// target interval.
const LAG_FACTOR: f32 = 1.5;

pub fn run_video_render_worker(shared: Arc<HubShared>, record: Arc<ClientRecord>) {
    let max_fps = shared.config.timing.max_fps;
    let initial_fps = record.render_snapshot().desired_fps.clamp(1, max_fps);
    let mut pacer = super::pacing::AdaptiveSleep::new(fps_period(initial_fps));
    let lag_warnings = RateLimiter::per_second();
    let mut frame_scratch = FrameSlot::default();

    log::debug!("[Client {}] video render worker started", record.id);
    loop {
        let previous_tick = pacer.last_tick();
        if !pacer.tick(0, 0, &shared.should_exit) || !record.is_active() {
            break;
        }
        if !shared.render_enabled.load(Ordering::Acquire) {
            continue;
        }

        // Snapshot this client's geometry and taste before touching peers.
        let snapshot = record.render_snapshot();
        let fps = snapshot.desired_fps.clamp(1, max_fps);
        pacer.set_period(fps_period(fps));

        // Peers currently visible to this client.
        let peers: Vec<Arc<ClientRecord>> = shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|peer| {
                peer.id != record.id
                    && peer.is_active()
                    && peer.is_sending_video.load(Ordering::Acquire)
            })
            .collect();
        let sources = peers.len();
        if sources == 0 {
            // Nothing to show: no publish this tick, egress unchanged.
            continue;
        }

        let (rows, cols) = grid_dimensions(sources);
        let (cell_w, cell_h) =
            cell_dimensions(snapshot.terminal_width, snapshot.terminal_height, rows, cols);
        let options = ConvertOptions {
            color_level: snapshot.color_level,
            render_mode: snapshot.render_mode,
            stretch: snapshot.wants_stretch,
        };

        let mut cells = Vec::with_capacity(sources);
        for peer in &peers {
            let cell = if peer.ingress_video.read_latest(&mut frame_scratch)
                && frame_scratch.data.len()
                    == frame_scratch.width as usize * frame_scratch.height as usize * 3
            {
                image_to_cell(
                    &frame_scratch.data,
                    frame_scratch.width,
                    frame_scratch.height,
                    cell_w,
                    cell_h,
                    &options,
                    &snapshot.palette,
                )
            } else {
                // No frame yet (or a payload/dimension mismatch): show a
                // placeholder of the same cell size instead of dereferencing.
                placeholder_cell(cell_w, cell_h, &peer.display_name())
            };
            cells.push(cell);
        }

        let composed = compose_grid(&cells, rows, cols, cell_w, cell_h);
        {
            let mut write = record.egress_video.begin_write();
            let slot = write.slot();
            slot.data.clear();
            slot.data.extend_from_slice(composed.as_bytes());
            slot.width = snapshot.terminal_width as u32;
            slot.height = snapshot.terminal_height as u32;
            // The count store must precede the commit: the send worker
            // acquires the committed sequence and then loads this count, so
            // the clear-screen barrier lands before the first frame whose
            // layout changed, never one frame late.
            record
                .last_rendered_grid_sources
                .store(sources, Ordering::Release);
            if let Err(e) = write.commit() {
                log::warn!("[Client {}] dropping oversized composed frame: {e}", record.id);
                continue;
            }
        }

        if let Some(interval) = pacer.measured_interval(previous_tick) {
            let target = pacer.period();
            if interval.as_secs_f32() > target.as_secs_f32() * LAG_FACTOR && lag_warnings.fire() {
                log::warn!(
                    "[Client {}] video render lagging: {:?} per frame (target {:?})",
                    record.id,
                    interval,
                    target
                );
            }
        }
    }
    log::debug!("[Client {}] video render worker exiting", record.id);
}

fn fps_period(fps: u8) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}
