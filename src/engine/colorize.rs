//! Value → RGBA mapping shared by every visualization buffer.

/// Raw values outside this range saturate to the end colors.
pub const LUT_RANGE: [f32; 2] = [-2.5, 2.5];
const LUT_SIZE: usize = 512;

const COLOR_STOPS: [[u8; 3]; 11] = [
    [10, 243, 255],
    [18, 194, 227],
    [27, 145, 198],
    [28, 99, 150],
    [22, 58, 83],
    [16, 16, 16],
    [112, 112, 10],
    [207, 207, 3],
    [255, 204, 0],
    [255, 102, 0],
    [255, 0, 0],
];

/// Squashes a raw value into `[-1, 1]` before the gradient lookup.
#[inline]
fn compress(v: f32) -> f32 {
    (v * 0.8).tanh()
}

fn gradient_at(t: f32) -> [u8; 4] {
    let t = t.clamp(0.0, 1.0) * (COLOR_STOPS.len() - 1) as f32;
    let lo = (t.floor() as usize).min(COLOR_STOPS.len() - 2);
    let frac = t - lo as f32;
    let (a, b) = (COLOR_STOPS[lo], COLOR_STOPS[lo + 1]);
    let mix = |i: usize| (a[i] as f32 + (b[i] as f32 - a[i] as f32) * frac) as u8;
    [mix(0), mix(1), mix(2), 255]
}

/// Precomputed lookup table over [`LUT_RANGE`].
#[derive(Debug, Clone)]
pub struct Colorizer {
    lut: Box<[[u8; 4]; LUT_SIZE]>,
}

impl Default for Colorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Colorizer {
    pub fn new() -> Self {
        let [min, max] = LUT_RANGE;
        let mut lut = Box::new([[0u8; 4]; LUT_SIZE]);
        for (i, slot) in lut.iter_mut().enumerate() {
            let x = min + (i as f32 / (LUT_SIZE - 1) as f32) * (max - min);
            *slot = gradient_at((compress(x) + 1.0) / 2.0);
        }
        Self { lut }
    }

    #[inline]
    pub fn color(&self, value: f32) -> [u8; 4] {
        let [min, max] = LUT_RANGE;
        let v = if value.is_nan() { 0.0 } else { value.clamp(min, max) };
        let ix = ((v - min) * (LUT_SIZE - 1) as f32 / (max - min)) as usize;
        self.lut[ix.min(LUT_SIZE - 1)]
    }

    /// One RGBA entry per value, no tile expansion.
    pub fn colors(&self, values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|&v| self.color(v)).collect()
    }

    /// Paints `values` as a row of `tile × tile` squares.
    ///
    /// Pixel `(x, y)` of neuron `i` lives at `y * (n * tile) + i * tile + x`.
    pub fn tiles(&self, values: &[f32], tile: usize) -> Vec<u8> {
        let width = values.len() * tile;
        let mut buf = vec![0u8; width * tile * 4];
        let px: &mut [[u8; 4]] = bytemuck::cast_slice_mut(&mut buf);
        for (i, &v) in values.iter().enumerate() {
            let color = self.color(v);
            for y in 0..tile {
                let start = y * width + i * tile;
                px[start..start + tile].fill(color);
            }
        }
        buf
    }

    /// `width × height` vertical gradient with `range[1]` on the top row.
    pub fn legend(&self, range: [f32; 2], width: usize, height: usize) -> Vec<u8> {
        let [lo, hi] = range;
        let mut buf = vec![0u8; width * height * 4];
        let px: &mut [[u8; 4]] = bytemuck::cast_slice_mut(&mut buf);
        for (y, row) in px.chunks_exact_mut(width.max(1)).enumerate() {
            let t = if height > 1 {
                y as f32 / (height - 1) as f32
            } else {
                0.0
            };
            row.fill(self.color(hi - t * (hi - lo)));
        }
        buf
    }
}
