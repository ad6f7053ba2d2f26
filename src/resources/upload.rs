//! Background texture decoding
//!
//! Uploads run on a small fixed set of worker threads and never touch the render graph.
//! The renderer polls finished tickets at the start of a frame and copies the decoded
//! pixels into the material texture array.

use super::texture::TextureData;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Texture upload error type
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Invalid pixel data for '{0}'")]
    InvalidData(String),
    #[error("Upload '{0}' was cancelled by pool shutdown")]
    Cancelled(String),
    #[error("Upload worker panicked while processing '{0}'")]
    WorkerPanicked(String),
}

type UploadResult = Result<TextureData, UploadError>;

struct TicketSlot {
    result: Mutex<Option<UploadResult>>,
    ready: Condvar,
}

impl TicketSlot {
    fn complete(&self, result: UploadResult) {
        *self.result.lock() = Some(result);
        self.ready.notify_all();
    }
}

/// Handle to a pending upload
pub struct UploadTicket {
    name: String,
    slot: Arc<TicketSlot>,
}

impl UploadTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the worker has finished
    pub fn wait(self) -> UploadResult {
        let mut result = self.slot.result.lock();
        loop {
            if let Some(done) = result.take() {
                return done;
            }
            self.slot.ready.wait(&mut result);
        }
    }

    /// Take the result if the worker has finished. Returns `None` while pending, and
    /// again after the result has been taken once.
    pub fn try_take(&mut self) -> Option<UploadResult> {
        self.slot.result.lock().take()
    }
}

struct UploadJob {
    name: String,
    bytes: Vec<u8>,
    target_size: u32,
    slot: Arc<TicketSlot>,
}

impl UploadJob {
    fn run(self) {
        let UploadJob {
            name,
            bytes,
            target_size,
            slot,
        } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            TextureData::from_bytes(&bytes, &name)?.resized(target_size)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(UploadError::WorkerPanicked(name.clone())),
        };
        match &result {
            Ok(data) => log::debug!("Decoded texture '{}' ({}x{})", name, data.width, data.height),
            Err(e) => log::warn!("Texture upload '{}' failed: {}", name, e),
        }
        slot.complete(result);
    }
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<UploadJob>,
    shutting_down: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Fixed-size worker pool for decoding and resizing textures
pub struct TextureUploadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TextureUploadPool {
    /// Spawn `min(available_parallelism, max_concurrent_uploads)` workers, at least one
    pub fn new(max_concurrent_uploads: usize) -> Self {
        let hardware = std::thread::available_parallelism().map_or(1, |n| n.get());
        let worker_count = hardware.min(max_concurrent_uploads).max(1);

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("texture-upload-{}", i))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("Failed to spawn texture upload worker {}: {}", i, e),
            }
        }

        log::info!("Texture upload pool started with {} workers", workers.len());
        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue encoded image bytes for decoding and resizing to `target_size` square
    pub fn submit(&self, name: &str, bytes: Vec<u8>, target_size: u32) -> UploadTicket {
        let slot = Arc::new(TicketSlot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let ticket = UploadTicket {
            name: name.to_string(),
            slot: Arc::clone(&slot),
        };

        let job = UploadJob {
            name: name.to_string(),
            bytes,
            target_size,
            slot,
        };

        let mut queue = self.shared.queue.lock();
        if queue.shutting_down || self.workers.is_empty() {
            drop(queue);
            job.slot.complete(Err(UploadError::Cancelled(job.name)));
        } else {
            queue.jobs.push_back(job);
            drop(queue);
            self.shared.available.notify_one();
        }

        ticket
    }

    /// Number of jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Cancel queued jobs and join the workers. Jobs already running finish normally.
    pub fn shutdown(&mut self) {
        let cancelled: Vec<UploadJob> = {
            let mut queue = self.shared.queue.lock();
            queue.shutting_down = true;
            queue.jobs.drain(..).collect()
        };
        self.shared.available.notify_all();

        for job in cancelled {
            job.slot.complete(Err(UploadError::Cancelled(job.name)));
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Texture upload worker terminated abnormally");
            }
        }
    }
}

impl Drop for TextureUploadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutting_down {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encoded_png(size: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(size, size, Rgba([10, 20, 30, 255]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageOutputFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let pool = TextureUploadPool::new(1);
        assert_eq!(pool.worker_count(), 1);

        let pool = TextureUploadPool::new(0);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_decode_and_resize() {
        let pool = TextureUploadPool::new(2);
        let ticket = pool.submit("albedo", encoded_png(8), 4);
        let data = ticket.wait().unwrap();
        assert_eq!((data.width, data.height), (4, 4));
        assert_eq!(&data.data[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_invalid_bytes_report_error() {
        let pool = TextureUploadPool::new(1);
        let ticket = pool.submit("garbage", vec![1, 2, 3, 4], 4);
        assert!(matches!(ticket.wait(), Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_try_take_yields_once() {
        let pool = TextureUploadPool::new(1);
        let mut ticket = pool.submit("once", encoded_png(2), 2);
        let result = loop {
            if let Some(result) = ticket.try_take() {
                break result;
            }
            std::thread::yield_now();
        };
        assert!(result.is_ok());
        assert!(ticket.try_take().is_none());
    }

    #[test]
    fn test_submit_after_shutdown_is_cancelled() {
        let mut pool = TextureUploadPool::new(2);
        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
        let ticket = pool.submit("late", encoded_png(2), 2);
        assert!(matches!(ticket.wait(), Err(UploadError::Cancelled(_))));
    }
}
