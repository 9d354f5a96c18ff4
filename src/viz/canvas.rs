//! Drawing targets for the panels.
//!
//! [`Canvas`] is the small immediate-mode surface the renderers need (blit,
//! rectangles, lines, circles, text). [`PixelCanvas`] implements it over an
//! owned RGBA buffer.

use std::io::{self, Write};

use crate::error::{Result, VizError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);
    /// Selected-neuron outline.
    pub const HIGHLIGHT: Rgba = Rgba([0, 255, 0, 255]);
    /// Probe marker on the coordinate picker.
    pub const MARKER: Rgba = Rgba([255, 0, 0, 255]);
    pub const LABEL: Rgba = Rgba([204, 204, 204, 255]);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Rgba([r, g, b, 255])
    }
}

/// A text draw call. Software canvases record these instead of rasterizing glyphs.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub color: Rgba,
}

pub trait Canvas: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    /// Resets every pixel to transparent and forgets drawn text.
    fn clear(&mut self);

    /// Copies a `width × height` RGBA block to `(x, y)`, clipping at the edges.
    fn put_rgba(&mut self, x: usize, y: usize, width: usize, height: usize, data: &[u8])
        -> Result<()>;

    fn fill_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: Rgba);

    /// Outline whose bands are centered on the rectangle's edges.
    fn stroke_rect(&mut self, x: f64, y: f64, width: f64, height: f64, line_width: f64, color: Rgba) {
        let half = line_width / 2.0;
        self.fill_rect(x - half, y - half, width + line_width, line_width, color);
        self.fill_rect(x - half, y + height - half, width + line_width, line_width, color);
        self.fill_rect(x - half, y - half, line_width, height + line_width, color);
        self.fill_rect(x + width - half, y - half, line_width, height + line_width, color);
    }

    fn line(&mut self, from: (f64, f64), to: (f64, f64), line_width: f64, color: Rgba) {
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
        let w = line_width.max(1.0);
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let (px, py) = (from.0 + dx * t, from.1 + dy * t);
            self.fill_rect(px - w / 2.0, py - w / 2.0, w, w, color);
        }
    }

    fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: Rgba);

    fn fill_text(&mut self, text: &str, x: f64, y: f64, color: Rgba);
}

/// Owned RGBA framebuffer.
#[derive(Debug, Clone)]
pub struct PixelCanvas {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    labels: Vec<Label>,
}

impl PixelCanvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height * 4],
            labels: Vec::new(),
        }
    }

    pub fn as_rgba(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y * self.width + x) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[at..at + 4]);
        Some(Rgba(px))
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Whether any pixel is non-transparent.
    pub fn is_blank(&self) -> bool {
        self.pixels.chunks_exact(4).all(|px| px[3] == 0)
    }

    /// Writes the canvas as a binary PPM (alpha dropped).
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        let rgb: Vec<u8> = self
            .pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        out.write_all(&rgb)?;
        out.flush()
    }

    /// Pixel index range covering `[from, to)` on an axis of length `len`.
    fn span(from: f64, to: f64, len: usize) -> std::ops::Range<usize> {
        let clamp = |v: f64| v.round().clamp(0.0, len as f64) as usize;
        clamp(from)..clamp(to)
    }
}

impl Canvas for PixelCanvas {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
        self.labels.clear();
    }

    fn put_rgba(
        &mut self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        data: &[u8],
    ) -> Result<()> {
        if data.len() != width * height * 4 {
            return Err(VizError::Canvas(format!(
                "{width}x{height} blit given {} bytes",
                data.len()
            )));
        }
        if x >= self.width || y >= self.height {
            return Ok(());
        }
        let copy_w = width.min(self.width - x);
        for row in 0..height.min(self.height - y) {
            let src = row * width * 4;
            let dst = ((y + row) * self.width + x) * 4;
            self.pixels[dst..dst + copy_w * 4].copy_from_slice(&data[src..src + copy_w * 4]);
        }
        Ok(())
    }

    fn fill_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: Rgba) {
        let xs = Self::span(x, x + width, self.width);
        for py in Self::span(y, y + height, self.height) {
            let row = py * self.width;
            for px in xs.clone() {
                let at = (row + px) * 4;
                self.pixels[at..at + 4].copy_from_slice(&color.0);
            }
        }
    }

    fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: Rgba) {
        let r2 = radius * radius;
        for py in Self::span(cy - radius, cy + radius + 1.0, self.height) {
            for px in Self::span(cx - radius, cx + radius + 1.0, self.width) {
                let (dx, dy) = (px as f64 + 0.5 - cx, py as f64 + 0.5 - cy);
                if dx * dx + dy * dy <= r2 {
                    let at = (py * self.width + px) * 4;
                    self.pixels[at..at + 4].copy_from_slice(&color.0);
                }
            }
        }
    }

    fn fill_text(&mut self, text: &str, x: f64, y: f64, color: Rgba) {
        self.labels.push(Label {
            text: text.to_string(),
            x,
            y,
            color,
        });
    }
}
