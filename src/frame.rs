use crate::error::PipelineError;

/// Aspect ratios closer than this are treated as already matching.
const ASPECT_TOLERANCE: f64 = 0.01;

/// A packed RGB24 frame, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    width: usize,
    height: usize,
    data: Box<[u8]>,
}

impl RgbFrame {
    /// A black frame of the given size.
    pub fn new(width: usize, height: usize) -> RgbFrame {
        RgbFrame {
            width,
            height,
            data: vec![0u8; width * height * 3].into_boxed_slice(),
        }
    }

    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Result<RgbFrame, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::frame(format!(
                "frame dimensions {width}x{height} are degenerate"
            )));
        }
        if data.len() != width * height * 3 {
            return Err(PipelineError::frame(format!(
                "frame buffer holds {} bytes, {}x{} RGB needs {}",
                data.len(),
                width,
                height,
                width * height * 3
            )));
        }
        Ok(RgbFrame {
            width,
            height,
            data: data.into_boxed_slice(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> (u8, u8, u8) {
        let base = y * 3 * self.width + x * 3;
        (self.data[base], self.data[base + 1], self.data[base + 2])
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: (u8, u8, u8)) {
        let base = y * 3 * self.width + x * 3;
        if base + 2 < self.data.len() {
            self.data[base] = rgb.0;
            self.data[base + 1] = rgb.1;
            self.data[base + 2] = rgb.2;
        }
    }

    /// Pad onto a black canvas matching the target aspect ratio, content
    /// centered. Returns None when the aspect already matches within
    /// tolerance and no padding is needed.
    pub fn letterboxed(&self, target_width: usize, target_height: usize) -> Option<RgbFrame> {
        let source_aspect = self.width as f64 / self.height as f64;
        let target_aspect = target_width as f64 / target_height as f64;
        if (source_aspect - target_aspect).abs() < ASPECT_TOLERANCE {
            return None;
        }

        let (canvas_width, canvas_height, offset_x, offset_y) = if source_aspect > target_aspect {
            // Wider than the target: bars above and below.
            let canvas_height = (self.width as f64 / target_aspect) as usize;
            (self.width, canvas_height, 0, (canvas_height - self.height) / 2)
        } else {
            // Taller than the target: bars left and right.
            let canvas_width = (self.height as f64 * target_aspect) as usize;
            (canvas_width, self.height, (canvas_width - self.width) / 2, 0)
        };

        let mut canvas = RgbFrame::new(canvas_width, canvas_height);
        let src_stride = self.width * 3;
        let dst_stride = canvas_width * 3;
        for y in 0..self.height {
            let src = y * src_stride;
            let dst = (y + offset_y) * dst_stride + offset_x * 3;
            canvas.data[dst..dst + src_stride].copy_from_slice(&self.data[src..src + src_stride]);
        }
        Some(canvas)
    }

    /// Bilinear resample. Meant for shrinking a frame to the display's
    /// pixel size before quantization; growing happens after quantization
    /// on palette indices instead.
    pub fn resized_bilinear(&self, target_width: usize, target_height: usize) -> RgbFrame {
        if target_width == self.width && target_height == self.height {
            return self.clone();
        }
        let mut out = RgbFrame::new(target_width, target_height);

        // 16.16 fixed point source positions, corners mapped to corners.
        let x_step = if target_width > 1 {
            ((self.width - 1) << 16) / (target_width - 1)
        } else {
            0
        };
        let y_step = if target_height > 1 {
            ((self.height - 1) << 16) / (target_height - 1)
        } else {
            0
        };

        for ty in 0..target_height {
            let sy = ty * y_step;
            let y0 = sy >> 16;
            let y1 = (y0 + 1).min(self.height - 1);
            let fy = sy & 0xFFFF;
            for tx in 0..target_width {
                let sx = tx * x_step;
                let x0 = sx >> 16;
                let x1 = (x0 + 1).min(self.width - 1);
                let fx = sx & 0xFFFF;

                let base = ty * target_width * 3 + tx * 3;
                for channel in 0..3 {
                    let p00 = self.data[y0 * self.width * 3 + x0 * 3 + channel] as usize;
                    let p01 = self.data[y0 * self.width * 3 + x1 * 3 + channel] as usize;
                    let p10 = self.data[y1 * self.width * 3 + x0 * 3 + channel] as usize;
                    let p11 = self.data[y1 * self.width * 3 + x1 * 3 + channel] as usize;
                    let top = (p00 * (0x10000 - fx) + p01 * fx) >> 16;
                    let bottom = (p10 * (0x10000 - fx) + p11 * fx) >> 16;
                    out.data[base + channel] = ((top * (0x10000 - fy) + bottom * fy) >> 16) as u8;
                }
            }
        }
        out
    }
}
