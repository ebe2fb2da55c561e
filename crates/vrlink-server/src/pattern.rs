//! Synthetic source frames for headless runs.

/// Moving test pattern: a horizontal luma ramp with a bright bar sweeping
/// left to right, over a slowly rotating chroma tint.
pub struct TestPattern {
    width: u32,
    height: u32,
}

impl TestPattern {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[must_use]
    pub fn chroma_len(&self) -> usize {
        (self.width / 2) as usize * (self.height / 2) as usize * 2
    }

    /// Column of the bar's left edge in `frame`.
    #[must_use]
    pub fn bar_position(&self, frame: u64) -> u32 {
        let travel = u64::from(self.width.max(1));
        // The remainder is below `width`.
        #[allow(clippy::cast_possible_truncation)]
        let x = ((frame * 8) % travel) as u32;
        x
    }

    /// Render `frame` into fresh planes.
    #[must_use]
    pub fn render(&self, frame: u64) -> (Vec<u8>, Vec<u8>) {
        let mut luma = vec![0; self.luma_len()];
        let mut chroma = vec![0; self.chroma_len()];
        self.render_into(frame, &mut luma, &mut chroma);
        (luma, chroma)
    }

    /// Render `frame` into existing planes of the right size.
    pub fn render_into(&self, frame: u64, luma: &mut [u8], chroma: &mut [u8]) {
        let w = self.width as usize;
        let bar = self.bar_position(frame) as usize;
        let bar_width = (w / 16).max(2);

        for (y, row) in luma.chunks_exact_mut(w.max(1)).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = if x >= bar && x < bar + bar_width {
                    235
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    let ramp = (16 + (x * 160) / w.max(1) + (y % 64) / 8) as u8;
                    ramp
                };
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let phase = (frame % 256) as u8;
        for texel in chroma.chunks_exact_mut(2) {
            texel[0] = 128u8.wrapping_add(phase / 8);
            texel[1] = 128u8.wrapping_sub(phase / 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planes_match_nv12_sizes() {
        let pattern = TestPattern::new(64, 32);
        let (luma, chroma) = pattern.render(0);
        assert_eq!(luma.len(), 64 * 32);
        assert_eq!(chroma.len(), 32 * 16 * 2);
    }

    #[test]
    fn bar_moves_between_frames() {
        let pattern = TestPattern::new(64, 32);
        let (first, _) = pattern.render(0);
        let (second, _) = pattern.render(1);
        assert_ne!(first, second);
        assert_eq!(first[0], 235);
        assert_eq!(second[8], 235);
        assert_eq!(pattern.bar_position(8), 0);
    }
}
