//! Engine context: the services shared by the renderer and the application loop.
//!
//! One [`EngineContext`] is created at startup and handed by reference to everything
//! that needs configuration, frame timing or background texture uploads.

use crate::backend::BackendResult;
use crate::resources::TextureUploadPool;
use crate::RendererConfig;
use std::time::Instant;

/// Frame timing.
///
/// [`tick`](Self::tick) is called once at the start of every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    start_time: Instant,
    last_frame_time: Instant,
    frame_number: u64,
    delta_time: f32,
    elapsed_time: f32,
}

impl FrameClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_frame_time: now,
            frame_number: 0,
            delta_time: 0.0,
            elapsed_time: 0.0,
        }
    }

    /// Advance to the next frame
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Advance to the next frame as if it started at `now`
    pub fn tick_at(&mut self, now: Instant) {
        self.delta_time = now
            .saturating_duration_since(self.last_frame_time)
            .as_secs_f32();
        self.elapsed_time = now.saturating_duration_since(self.start_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_number += 1;
    }

    /// Get the current frame number. The first ticked frame is 1.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Get the delta time since last frame in seconds.
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Get the elapsed time since startup in seconds.
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }

    /// Ring-buffer region for the current frame
    pub fn frame_slot(&self, frames_in_flight: u32) -> u32 {
        (self.frame_number % frames_in_flight.max(1) as u64) as u32
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide services, owned by the application root
pub struct EngineContext {
    config: RendererConfig,
    pub clock: FrameClock,
    pub uploads: TextureUploadPool,
}

impl EngineContext {
    /// Validate the configuration and start the services
    pub fn init(config: RendererConfig) -> BackendResult<Self> {
        config.validate().map_err(|err| {
            log::error!("Invalid renderer configuration: {}", err);
            err
        })?;

        let uploads = TextureUploadPool::new(config.max_concurrent_uploads);
        log::info!(
            "Engine context initialized ({} frames in flight, {} upload workers)",
            config.frames_in_flight,
            uploads.worker_count()
        );

        Ok(Self {
            config,
            clock: FrameClock::new(),
            uploads,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Stop the upload workers. Pending uploads resolve as cancelled.
    pub fn shutdown(&mut self) {
        self.uploads.shutdown();
        log::info!(
            "Engine context shut down after {} frames",
            self.clock.frame_number()
        );
    }
}
