//! Per-frame driver for a set of encoder backends.

use std::time::Duration;

use vrlink_encode::{EncodeError, TransferQueue, VideoEncoder, YuvImage};

/// Owns the backends of one stream and feeds them frames.
pub struct Dispatcher {
    encoders: Vec<Box<dyn VideoEncoder>>,
    /// Indices into `encoders`, by group then configuration order.
    order: Vec<usize>,
    keyframe_interval: u32,
    frame: u64,
}

impl Dispatcher {
    /// `keyframe_interval` of 0 forces only the first keyframe.
    #[must_use]
    pub fn new(encoders: Vec<Box<dyn VideoEncoder>>, keyframe_interval: u32) -> Self {
        let mut order: Vec<usize> = (0..encoders.len()).collect();
        // Stable sort keeps configuration order inside a group.
        order.sort_by_key(|&i| encoders[i].settings().group);
        Self {
            encoders,
            order,
            keyframe_interval,
            frame: 0,
        }
    }

    /// Frames dispatched so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frame
    }

    #[must_use]
    pub fn encoders(&self) -> &[Box<dyn VideoEncoder>] {
        &self.encoders
    }

    fn is_keyframe(&self) -> bool {
        self.frame == 0
            || (self.keyframe_interval > 0 && self.frame % u64::from(self.keyframe_interval) == 0)
    }

    /// Copy `source` into every backend and encode it.
    ///
    /// All copies go into one command list that completes before the first
    /// `encode` call.
    ///
    /// # Errors
    ///
    /// Returns the first [`EncodeError`] from submission or from a backend.
    /// Backends after the failing one are not encoded for this frame.
    pub fn dispatch<Q: TransferQueue>(
        &mut self,
        queue: &Q,
        source: &YuvImage,
        pts: Duration,
    ) -> Result<(), EncodeError> {
        let mut commands = queue.begin();
        for encoder in &mut self.encoders {
            encoder.present_image(source, &mut commands);
        }
        queue.submit_and_wait(commands)?;

        let key_frame = self.is_keyframe();
        if key_frame {
            tracing::debug!(frame = self.frame, "Requesting keyframe");
        }
        for &index in &self.order {
            self.encoders[index].encode(key_frame, pts)?;
        }
        self.frame += 1;
        Ok(())
    }

    /// Shut down every backend.
    pub fn shutdown(&mut self) {
        for encoder in &mut self.encoders {
            encoder.shutdown();
        }
        tracing::info!(frames = self.frame, "Encoders stopped");
    }
}
