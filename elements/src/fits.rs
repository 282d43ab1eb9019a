//! FITS I/O and image operators (spec.md §4.2). Pure, stateless operators on
//! [`Frame`] — no device or filesystem state is held across calls beyond the
//! path arguments passed in.
//!
//! Every transform that reduces precision works in `f32` and is only
//! demoted to an integer representation at write time (spec.md §4.2
//! invariant).

use std::collections::BTreeMap;
use std::path::Path;

use canonical_error::{internal_error, invalid_argument_error, CanonicalError};
use fitsio::hdu::HduInfo;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use image::{ImageOutputFormat, Rgb32FImage};

/// The four standard 2x2 Bayer tilings (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl BayerPattern {
    /// Detects a pattern from FITS header keys `BAYERPAT`, and the row/column
    /// offsets `XBAYROFF`/`YBAYROFF` that shift the tiling's phase.
    pub fn from_header(bayerpat: Option<&str>, x_offset: i32, y_offset: i32) -> Option<Self> {
        let base = match bayerpat?.trim().to_ascii_uppercase().as_str() {
            "RGGB" => BayerPattern::Rggb,
            "BGGR" => BayerPattern::Bggr,
            "GRBG" => BayerPattern::Grbg,
            "GBRG" => BayerPattern::Gbrg,
            _ => return None,
        };
        Some(base.shifted(x_offset, y_offset))
    }

    fn shifted(self, x_offset: i32, y_offset: i32) -> Self {
        let shift_x = x_offset.rem_euclid(2);
        let shift_y = y_offset.rem_euclid(2);
        let mut pat = self;
        if shift_x == 1 {
            pat = pat.swap_columns();
        }
        if shift_y == 1 {
            pat = pat.swap_columns().swap_rows_after_column_swap();
        }
        pat
    }

    fn swap_columns(self) -> Self {
        match self {
            BayerPattern::Rggb => BayerPattern::Grbg,
            BayerPattern::Bggr => BayerPattern::Gbrg,
            BayerPattern::Grbg => BayerPattern::Rggb,
            BayerPattern::Gbrg => BayerPattern::Bggr,
        }
    }

    fn swap_rows_after_column_swap(self) -> Self {
        match self {
            BayerPattern::Rggb => BayerPattern::Bggr,
            BayerPattern::Bggr => BayerPattern::Rggb,
            BayerPattern::Grbg => BayerPattern::Gbrg,
            BayerPattern::Gbrg => BayerPattern::Grbg,
        }
    }

    /// Color of the sensor pixel at (row, col), 0-indexed from the tile's
    /// top-left origin.
    fn color_at(self, row: usize, col: usize) -> Channel {
        let even_row = row % 2 == 0;
        let even_col = col % 2 == 0;
        match self {
            BayerPattern::Rggb => match (even_row, even_col) {
                (true, true) => Channel::Red,
                (true, false) => Channel::Green,
                (false, true) => Channel::Green,
                (false, false) => Channel::Blue,
            },
            BayerPattern::Bggr => match (even_row, even_col) {
                (true, true) => Channel::Blue,
                (true, false) => Channel::Green,
                (false, true) => Channel::Green,
                (false, false) => Channel::Red,
            },
            BayerPattern::Grbg => match (even_row, even_col) {
                (true, true) => Channel::Green,
                (true, false) => Channel::Red,
                (false, true) => Channel::Blue,
                (false, false) => Channel::Green,
            },
            BayerPattern::Gbrg => match (even_row, even_col) {
                (true, true) => Channel::Green,
                (true, false) => Channel::Blue,
                (false, true) => Channel::Red,
                (false, false) => Channel::Green,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Red,
    Green,
    Blue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebayerAlgorithm {
    Bilinear,
    Malvar2004,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StretchAlgorithm {
    LinearPercentile,
    PixInsightMtf,
    StdDev,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
}

pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// In-memory representation of a captured or loaded frame (spec.md §3
/// `CameraFrame`). `data` is row-major; for color frames it is
/// channel-interleaved RGB. Always `f32`; normalization to `[0,1]` is a
/// distinct, explicit step (see [`normalize_unit`]) rather than implicit.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub channels: usize, // 1 (mono) or 3 (color)
    pub data: Vec<f32>,
    pub bayer: Option<BayerPattern>,
    pub headers: HeaderMap,
    pub normalized: bool,
}

impl Frame {
    pub fn new_mono(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height);
        Frame {
            width,
            height,
            channels: 1,
            data,
            bayer: None,
            headers: HeaderMap::new(),
            normalized: false,
        }
    }

    pub fn new_color(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height * 3);
        Frame {
            width,
            height,
            channels: 3,
            data,
            bayer: None,
            headers: HeaderMap::new(),
            normalized: false,
        }
    }

    pub fn is_color(&self) -> bool {
        self.channels == 3
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, c: usize, value: f32) {
        self.data[(y * self.width + x) * self.channels + c] = value;
    }

    /// Returns one plane (0 for mono, 0/1/2 for R/G/B) as a standalone mono
    /// frame, sharing no state with `self`.
    pub fn channel_plane(&self, c: usize) -> Frame {
        let mut out = vec![0f32; self.width * self.height];
        for i in 0..self.width * self.height {
            out[i] = self.data[i * self.channels + c];
        }
        Frame::new_mono(self.width, self.height, out)
    }
}

/// Loads the primary HDU of a FITS file, detecting color model from the
/// header and array rank, optionally subtracting a master dark (dimensions
/// must match exactly), optionally debayering, optionally normalizing to
/// `[0,1]`.
pub fn load(
    path: &Path,
    master_dark: Option<&Frame>,
    debayer_algo: Option<DebayerAlgorithm>,
    normalize: bool,
) -> Result<Frame, CanonicalError> {
    let mut fptr = FitsFile::open(path)
        .map_err(|e| internal_error(&format!("opening {}: {}", path.display(), e)))?;
    let hdu = fptr
        .primary_hdu()
        .map_err(|e| internal_error(&format!("reading primary HDU of {}: {}", path.display(), e)))?;

    let shape: Vec<usize> = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } => shape.clone(),
        _ => return Err(internal_error(&format!("{} has no image data in its primary HDU", path.display()))),
    };

    let (height, width, channels) = infer_dims(&shape)?;

    let raw: Vec<f32> = hdu
        .read_image(&mut fptr)
        .map_err(|e| internal_error(&format!("reading image data of {}: {}", path.display(), e)))?;

    let bayerpat: Option<String> = hdu.read_key(&mut fptr, "BAYERPAT").ok();
    let x_off: i32 = hdu.read_key(&mut fptr, "XBAYROFF").unwrap_or(0);
    let y_off: i32 = hdu.read_key(&mut fptr, "YBAYROFF").unwrap_or(0);
    let bayer = if channels == 1 {
        BayerPattern::from_header(bayerpat.as_deref(), x_off, y_off)
    } else {
        None
    };

    let mut headers = HeaderMap::new();
    for key in ["EXPTIME", "GAIN", "DATE-OBS", "RA", "DEC", "SENSOR"] {
        if let Ok(v) = hdu.read_key::<f64>(&mut fptr, key) {
            headers.insert(key.to_string(), HeaderValue::Float(v));
        } else if let Ok(v) = hdu.read_key::<String>(&mut fptr, key) {
            headers.insert(key.to_string(), HeaderValue::Str(v));
        }
    }

    let mut frame = Frame {
        width,
        height,
        channels,
        data: raw,
        bayer,
        headers,
        normalized: false,
    };

    if let Some(dark) = master_dark {
        subtract_dark(&mut frame, dark)?;
    }
    if normalize {
        normalize_unit(&mut frame);
    }
    if let (Some(algo), Some(_)) = (debayer_algo, frame.bayer) {
        frame = debayer(&frame, algo)?;
    }
    Ok(frame)
}

fn infer_dims(shape: &[usize]) -> Result<(usize, usize, usize), CanonicalError> {
    match shape.len() {
        2 => Ok((shape[0], shape[1], 1)),
        3 => {
            // Axis order in the FITS data unit is the reverse of NAXISn
            // numbering; a leading axis of 3 means channel-first storage.
            if shape[0] == 3 {
                Ok((shape[1], shape[2], 3))
            } else if shape[2] == 3 {
                Ok((shape[0], shape[1], 3))
            } else {
                Err(invalid_argument_error("3-D FITS array has no axis of length 3"))
            }
        }
        _ => Err(invalid_argument_error("FITS primary HDU must be 2-D or 3-D")),
    }
}

fn subtract_dark(frame: &mut Frame, dark: &Frame) -> Result<(), CanonicalError> {
    if dark.width != frame.width || dark.height != frame.height || dark.channels != frame.channels {
        return Err(invalid_argument_error("master dark dimensions do not match frame"));
    }
    for (p, d) in frame.data.iter_mut().zip(dark.data.iter()) {
        *p -= *d;
    }
    Ok(())
}

/// Normalizes pixel values from the source bit depth (assumed 16-bit
/// unsigned range if not already marked normalized) to `[0,1]`.
pub fn normalize_unit(frame: &mut Frame) {
    if frame.normalized {
        return;
    }
    const MAX_U16: f32 = 65535.0;
    for p in frame.data.iter_mut() {
        *p /= MAX_U16;
    }
    frame.normalized = true;
}

/// Writes `frame` as a 16-bit integer FITS file. For 3-D (color) frames the
/// channel axis is moved to the leading position, matching the convention
/// `load` expects to read back. Additional header key/value pairs supplied
/// by the caller are written verbatim.
pub fn save_fits(frame: &Frame, path: &Path, extra_headers: &HeaderMap) -> Result<(), CanonicalError> {
    let dims: Vec<usize> = if frame.channels == 1 {
        vec![frame.height, frame.width]
    } else {
        vec![frame.channels, frame.height, frame.width]
    };
    let description = ImageDescription {
        data_type: ImageType::UnsignedShort,
        dimensions: &dims,
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()
        .map_err(|e| internal_error(&format!("creating {}: {}", path.display(), e)))?;
    let hdu = fptr
        .primary_hdu()
        .map_err(|e| internal_error(&format!("opening primary HDU of {}: {}", path.display(), e)))?;

    let demoted = to_u16_channel_first(frame);
    hdu.write_image(&mut fptr, &demoted)
        .map_err(|e| internal_error(&format!("writing image data of {}: {}", path.display(), e)))?;

    for (key, value) in extra_headers {
        match value {
            HeaderValue::Str(s) => {
                let _ = hdu.write_key(&mut fptr, key, s.as_str());
            }
            HeaderValue::Int(i) => {
                let _ = hdu.write_key(&mut fptr, key, *i);
            }
            HeaderValue::Float(f) => {
                let _ = hdu.write_key(&mut fptr, key, *f);
            }
        }
    }
    Ok(())
}

fn to_u16_channel_first(frame: &Frame) -> Vec<u16> {
    let demote = |v: f32| -> u16 {
        let scaled = if frame.normalized { v * 65535.0 } else { v };
        scaled.round().clamp(0.0, 65535.0) as u16
    };
    if frame.channels == 1 {
        frame.data.iter().map(|v| demote(*v)).collect()
    } else {
        let mut out = vec![0u16; frame.data.len()];
        let plane_size = frame.width * frame.height;
        for y in 0..frame.height {
            for x in 0..frame.width {
                for c in 0..3 {
                    out[c * plane_size + y * frame.width + x] = demote(frame.pixel(x, y, c));
                }
            }
        }
        out
    }
}

/// Downscales by an integer factor `k` via non-overlapping `k*k` mean
/// (spec.md §4.2). Color axis, if any, is preserved. `k=1` is the identity.
pub fn bin(frame: &Frame, k: usize) -> Result<Frame, CanonicalError> {
    if k == 0 {
        return Err(invalid_argument_error("bin factor must be >= 1"));
    }
    if k == 1 {
        return Ok(frame.clone());
    }
    let out_w = frame.width / k;
    let out_h = frame.height / k;
    if out_w == 0 || out_h == 0 {
        return Err(invalid_argument_error("bin factor too large for frame dimensions"));
    }
    let mut out = vec![0f32; out_w * out_h * frame.channels];
    let norm = (k * k) as f32;
    for oy in 0..out_h {
        for ox in 0..out_w {
            for c in 0..frame.channels {
                let mut sum = 0f32;
                for dy in 0..k {
                    for dx in 0..k {
                        sum += frame.pixel(ox * k + dx, oy * k + dy, c);
                    }
                }
                out[(oy * out_w + ox) * frame.channels + c] = sum / norm;
            }
        }
    }
    Ok(Frame {
        width: out_w,
        height: out_h,
        channels: frame.channels,
        data: out,
        bayer: None, // binning destroys Bayer phase alignment.
        headers: frame.headers.clone(),
        normalized: frame.normalized,
    })
}

/// Debayers a mono Bayer-pattern frame into a 3-channel color frame.
pub fn debayer(frame: &Frame, algo: DebayerAlgorithm) -> Result<Frame, CanonicalError> {
    let pattern = frame
        .bayer
        .ok_or_else(|| invalid_argument_error("frame has no Bayer pattern to debayer"))?;
    if frame.channels != 1 {
        return Err(invalid_argument_error("only mono frames can be debayered"));
    }
    let (w, h) = (frame.width, frame.height);
    let mut out = vec![0f32; w * h * 3];
    let get = |x: i64, y: i64| -> f32 {
        let cx = x.clamp(0, w as i64 - 1) as usize;
        let cy = y.clamp(0, h as i64 - 1) as usize;
        frame.data[cy * w + cx]
    };
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let native = pattern.color_at(y, x);
            match algo {
                DebayerAlgorithm::Bilinear => {
                    let (r, g, b) = bilinear_interpolate(&get, x as i64, y as i64, pattern);
                    out[idx] = r;
                    out[idx + 1] = g;
                    out[idx + 2] = b;
                }
                DebayerAlgorithm::Malvar2004 => {
                    let (r, g, b) = malvar2004_interpolate(&get, x as i64, y as i64, pattern, native);
                    out[idx] = r;
                    out[idx + 1] = g;
                    out[idx + 2] = b;
                }
            }
        }
    }
    Ok(Frame {
        width: w,
        height: h,
        channels: 3,
        data: out,
        bayer: None,
        headers: frame.headers.clone(),
        normalized: frame.normalized,
    })
}

fn bilinear_interpolate(
    get: &dyn Fn(i64, i64) -> f32,
    x: i64,
    y: i64,
    pattern: BayerPattern,
) -> (f32, f32, f32) {
    let native = pattern.color_at(y as usize, x as usize);
    let avg = |offsets: &[(i64, i64)]| -> f32 {
        let sum: f32 = offsets.iter().map(|(dx, dy)| get(x + dx, y + dy)).sum();
        sum / offsets.len() as f32
    };
    let here = get(x, y);
    let cross = [(-1, 0), (1, 0), (0, -1), (0, 1)];
    let diag = [(-1, -1), (1, -1), (-1, 1), (1, 1)];
    match native {
        Channel::Green => {
            let r = avg(&row_neighbors_of_color(&get, x, y, pattern, Channel::Red));
            let b = avg(&row_neighbors_of_color(&get, x, y, pattern, Channel::Blue));
            (r, here, b)
        }
        Channel::Red => {
            let g = avg(&cross);
            let b = avg(&diag);
            (here, g, b)
        }
        Channel::Blue => {
            let g = avg(&cross);
            let r = avg(&diag);
            (r, g, here)
        }
    }
}

// For a green pixel, the red/blue samples lie one step away along whichever
// of the horizontal/vertical axis holds that color in this tiling.
fn row_neighbors_of_color(
    get: &dyn Fn(i64, i64) -> f32,
    x: i64,
    y: i64,
    pattern: BayerPattern,
    color: Channel,
) -> Vec<(i64, i64)> {
    // Probe: evaluate color_at two cells further out (same color family) to
    // decide axis without going out of bounds logic twice.
    let probe_horiz = pattern.color_at((y as i64).rem_euclid(2) as usize, (x + 1).rem_euclid(2) as usize);
    if probe_horiz == color {
        vec![(x - 1, y), (x + 1, y)].into_iter().map(|(px, py)| (px - x, py - y)).collect()
    } else {
        vec![(x, y - 1), (x, y + 1)].into_iter().map(|(px, py)| (px - x, py - y)).collect()
    }
}

fn malvar2004_interpolate(
    get: &dyn Fn(i64, i64) -> f32,
    x: i64,
    y: i64,
    pattern: BayerPattern,
    native: Channel,
) -> (f32, f32, f32) {
    // Malvar-He-Cutler (2004) 5-tap kernels. Falls back to the bilinear
    // result at the frame border where the full kernel would be undefined;
    // the `get` clamp makes this degrade gracefully rather than panic.
    let c = |dx: i64, dy: i64| get(x + dx, y + dy);
    let here = c(0, 0);
    let cross4 = c(-1, 0) + c(1, 0) + c(0, -1) + c(0, 1);
    let diag4 = c(-1, -1) + c(1, -1) + c(-1, 1) + c(1, 1);
    let axis2_h = c(-2, 0) + c(2, 0);
    let axis2_v = c(0, -2) + c(0, 2);

    match native {
        Channel::Green => {
            // At green sites, R and B are each estimated with the same
            // 5-tap kernel applied along the axis carrying that color.
            let (r_neighbors, b_neighbors) = {
                let red_is_horiz = {
                    let probe = pattern.color_at((y as i64).rem_euclid(2) as usize, (x + 1).rem_euclid(2) as usize);
                    probe == Channel::Red
                };
                if red_is_horiz {
                    (axis2_h, axis2_v)
                } else {
                    (axis2_v, axis2_h)
                }
            };
            let r = (4.0 * here + 2.0 * r_neighbors - cross4 - diag4 / 2.0) / 8.0;
            let b = (4.0 * here + 2.0 * b_neighbors - cross4 - diag4 / 2.0) / 8.0;
            (r.max(0.0), here, b.max(0.0))
        }
        Channel::Red | Channel::Blue => {
            let g = (4.0 * here + 2.0 * cross4 - axis2_h - axis2_v) / 8.0;
            let opposite = (4.0 * here + 3.0 * diag4 / 2.0 - 3.0 * axis2_h / 2.0 - 3.0 * axis2_v / 2.0) / 8.0;
            let g = g.max(0.0);
            if native == Channel::Red {
                (here, g, opposite.max(0.0))
            } else {
                (opposite.max(0.0), g, here)
            }
        }
    }
}

/// Exact-inverse Bayer re-sampling: reconstructs a single mono plane from a
/// color frame by picking, at each sensor location, the channel value the
/// pattern dictates was sampled there (spec.md §4.2/§8 property: "Rebayer
/// of a color image preserves the sampled channel at each Bayer
/// location").
pub fn rebayer(frame: &Frame, pattern: BayerPattern) -> Result<Frame, CanonicalError> {
    if frame.channels != 3 {
        return Err(invalid_argument_error("rebayer requires a 3-channel color frame"));
    }
    let (w, h) = (frame.width, frame.height);
    let mut out = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let channel = match pattern.color_at(y, x) {
                Channel::Red => 0,
                Channel::Green => 1,
                Channel::Blue => 2,
            };
            out[y * w + x] = frame.pixel(x, y, channel);
        }
    }
    Ok(Frame {
        width: w,
        height: h,
        channels: 1,
        data: out,
        bayer: Some(pattern),
        headers: frame.headers.clone(),
        normalized: frame.normalized,
    })
}

/// Computes the ITU-R BT.709 luminance plane of a color frame, used by the
/// stacker to align on luminance before applying the transform per-channel
/// (spec.md §4.6).
pub fn luminance_709(frame: &Frame) -> Result<Frame, CanonicalError> {
    if frame.channels != 3 {
        return Err(invalid_argument_error("luminance requires a 3-channel frame"));
    }
    let mut out = vec![0f32; frame.width * frame.height];
    for i in 0..frame.width * frame.height {
        let r = frame.data[i * 3];
        let g = frame.data[i * 3 + 1];
        let b = frame.data[i * 3 + 2];
        out[i] = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    }
    Ok(Frame::new_mono(frame.width, frame.height, out))
}

/// autoStretch (spec.md §4.2/§4.10): `strength` has algorithm-specific
/// meaning (percentile for linear-percentile, midtone target for MTF,
/// multiplier of sigma for stddev). Operates in `[0,1]` space and returns a
/// `[0,1]` stretched result.
pub fn auto_stretch(frame: &Frame, algo: StretchAlgorithm, strength: f64) -> Frame {
    match algo {
        StretchAlgorithm::LinearPercentile => linear_percentile_stretch(frame, strength),
        StretchAlgorithm::PixInsightMtf => mtf_stretch(frame, strength),
        StretchAlgorithm::StdDev => stddev_stretch(frame, strength),
    }
}

fn percentile(sorted: &[f32], p: f64) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

fn linear_percentile_stretch(frame: &Frame, strength: f64) -> Frame {
    let mut sorted = frame.data.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let lo = percentile(&sorted, 0.01 * (1.0 - strength.clamp(0.0, 1.0)).max(0.0));
    let hi = percentile(&sorted, 1.0 - 0.001);
    stretch_with_bounds(frame, lo, hi)
}

// PixInsight-style midtone transfer function: maps the midpoint of the
// input range to `strength` (the desired midtone), per the standard
// `mtf(x) = (m-1)x / ((2m-1)x - m)` formula with `m = strength`.
fn mtf_stretch(frame: &Frame, strength: f64) -> Frame {
    let m = strength.clamp(0.001, 0.999);
    let out: Vec<f32> = frame
        .data
        .iter()
        .map(|&x| {
            let x = x as f64;
            let denom = (2.0 * m - 1.0) * x - m;
            let y = if denom.abs() < 1e-9 {
                x
            } else {
                (m - 1.0) * x / denom
            };
            y.clamp(0.0, 1.0) as f32
        })
        .collect();
    Frame {
        data: out,
        ..frame.clone()
    }
}

fn stddev_stretch(frame: &Frame, sigma_multiplier: f64) -> Frame {
    let n = frame.data.len().max(1) as f64;
    let mean = frame.data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = frame
        .data
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let sigma = var.sqrt();
    let lo = (mean - sigma_multiplier * sigma).max(0.0) as f32;
    let hi = (mean + sigma_multiplier * sigma).min(1.0) as f32;
    stretch_with_bounds(frame, lo, hi)
}

fn stretch_with_bounds(frame: &Frame, lo: f32, hi: f32) -> Frame {
    let span = (hi - lo).max(1e-6);
    let out: Vec<f32> = frame
        .data
        .iter()
        .map(|&v| ((v - lo) / span).clamp(0.0, 1.0))
        .collect();
    Frame {
        data: out,
        ..frame.clone()
    }
}

/// Clips the lowest `percent` of pixel values to zero (spec.md §4.10
/// `replaceLowestPercentByZero`, also used as the "low-percentile clip"
/// step of the preview pipeline, §4.2).
pub fn clip_lowest_percent(frame: &Frame, percent: f64) -> Frame {
    if percent <= 0.0 {
        return frame.clone();
    }
    let mut sorted = frame.data.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let threshold = percentile(&sorted, (percent / 100.0).clamp(0.0, 1.0));
    let out: Vec<f32> = frame
        .data
        .iter()
        .map(|&v| if v <= threshold { 0.0 } else { v })
        .collect();
    Frame {
        data: out,
        ..frame.clone()
    }
}

/// A small median-filter denoise pass, applied per-channel. Radius-1 (3x3)
/// median, matching the "optional denoise" step named in spec.md §4.2.
pub fn denoise(frame: &Frame) -> Frame {
    let (w, h) = (frame.width, frame.height);
    let mut out = frame.data.clone();
    for c in 0..frame.channels {
        for y in 0..h {
            for x in 0..w {
                let mut window = Vec::with_capacity(9);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nx = (x as i64 + dx).clamp(0, w as i64 - 1) as usize;
                        let ny = (y as i64 + dy).clamp(0, h as i64 - 1) as usize;
                        window.push(frame.pixel(nx, ny, c));
                    }
                }
                window.sort_by(|a, b| a.total_cmp(b));
                out[(y * w + x) * frame.channels + c] = window[window.len() / 2];
            }
        }
    }
    Frame {
        data: out,
        ..frame.clone()
    }
}

/// Clips hot pixels by comparing each pixel against the median of its
/// 8-neighborhood and replacing it with that median when the deviation
/// exceeds `k` neighborhood-MAD sigmas. Not part of the default `load`
/// pipeline; callers opt in explicitly before debayer.
pub fn clip_hot_pixels(frame: &Frame, k: f64) -> Frame {
    let (w, h) = (frame.width, frame.height);
    let mut out = frame.data.clone();
    for c in 0..frame.channels {
        for y in 0..h {
            for x in 0..w {
                let mut neighbors = Vec::with_capacity(8);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = (x as i64 + dx).clamp(0, w as i64 - 1) as usize;
                        let ny = (y as i64 + dy).clamp(0, h as i64 - 1) as usize;
                        neighbors.push(frame.pixel(nx, ny, c) as f64);
                    }
                }
                neighbors.sort_by(|a, b| a.total_cmp(b));
                let median = neighbors[neighbors.len() / 2];
                let sigma = crate::stacking::mad_sigma(&neighbors, median);
                let center = frame.pixel(x, y, c) as f64;
                if sigma > 0.0 && (center - median).abs() > k * sigma {
                    out[(y * w + x) * frame.channels + c] = median as f32;
                }
            }
        }
    }
    Frame {
        data: out,
        ..frame.clone()
    }
}

/// Encodes a `[0,1]`-normalized frame as JPEG/PNG/TIFF according to the
/// file extension of `path`, after running it through the preview pipeline
/// (stretch, low-percentile clip, optional denoise). This is `save preview`
/// from spec.md §4.2, and backs §4.10's `/observation/*image*` endpoints.
pub fn save_preview(
    frame: &Frame,
    path: &Path,
    algo: StretchAlgorithm,
    strength: f64,
    black_point_percent: f64,
    apply_denoise: bool,
) -> Result<(), CanonicalError> {
    let mut working = frame.clone();
    if !working.normalized {
        normalize_unit(&mut working);
    }
    working = auto_stretch(&working, algo, strength);
    working = clip_lowest_percent(&working, black_point_percent);
    if apply_denoise {
        working = denoise(&working);
    }

    let format = match path.extension().and_then(|e| e.to_str()).map(|s| s.to_ascii_lowercase()) {
        Some(ref e) if e == "png" => ImageOutputFormat::Png,
        Some(ref e) if e == "tif" || e == "tiff" => ImageOutputFormat::Tiff,
        _ => ImageOutputFormat::Jpeg(90),
    };

    let img = to_dynamic_image(&working)?;
    let mut file = std::fs::File::create(path)
        .map_err(|e| internal_error(&format!("creating {}: {}", path.display(), e)))?;
    img.write_to(&mut file, format)
        .map_err(|e| internal_error(&format!("encoding {}: {}", path.display(), e)))?;
    Ok(())
}

fn to_dynamic_image(frame: &Frame) -> Result<image::DynamicImage, CanonicalError> {
    if frame.channels == 1 {
        let buf: Vec<u8> = frame.data.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8).collect();
        let img = image::GrayImage::from_raw(frame.width as u32, frame.height as u32, buf)
            .ok_or_else(|| internal_error("mono buffer size mismatch"))?;
        Ok(image::DynamicImage::ImageLuma8(img))
    } else {
        let float_img = Rgb32FImage::from_raw(frame.width as u32, frame.height as u32, frame.data.clone())
            .ok_or_else(|| internal_error("color buffer size mismatch"))?;
        Ok(image::DynamicImage::ImageRgb32F(float_img).to_rgb8().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(w: usize, h: usize) -> Frame {
        let mut data = vec![0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = if (x + y) % 2 == 0 { 0.8 } else { 0.2 };
            }
        }
        Frame::new_mono(w, h, data)
    }

    #[test]
    fn test_bin_identity_at_k1() {
        let f = checkerboard(8, 8);
        let binned = bin(&f, 1).unwrap();
        assert_eq!(binned.data, f.data);
    }

    #[test]
    fn test_bin_composes() {
        let f = checkerboard(16, 16);
        let direct = bin(&f, 4).unwrap();
        let composed = bin(&bin(&f, 2).unwrap(), 2).unwrap();
        assert_eq!(direct.width, composed.width);
        for (a, b) in direct.data.iter().zip(composed.data.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rebayer_preserves_sampled_channel() {
        let w = 8;
        let h = 8;
        let mut color = vec![0f32; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 3;
                color[i] = 1.0; // R
                color[i + 1] = 0.5; // G
                color[i + 2] = 0.25; // B
            }
        }
        let frame = Frame::new_color(w, h, color);
        let mono = rebayer(&frame, BayerPattern::Rggb).unwrap();
        for y in 0..h {
            for x in 0..w {
                let expected = match BayerPattern::Rggb.color_at(y, x) {
                    Channel::Red => 1.0,
                    Channel::Green => 0.5,
                    Channel::Blue => 0.25,
                };
                assert_eq!(mono.data[y * w + x], expected);
            }
        }
    }

    #[test]
    fn test_rebayer_debayer_not_identity() {
        // A single bright point source surrounded by zero: debayering
        // spreads it into neighboring color planes (interpolation), so
        // rebayer(debayer(x)) != x in general.
        let w = 6;
        let h = 6;
        let mut mono = vec![0f32; w * h];
        mono[3 * w + 3] = 1.0;
        let mut frame = Frame::new_mono(w, h, mono);
        frame.bayer = Some(BayerPattern::Rggb);
        let color = debayer(&frame, DebayerAlgorithm::Bilinear).unwrap();
        let back = rebayer(&color, BayerPattern::Rggb).unwrap();
        assert_ne!(back.data, frame.data);
    }

    #[test]
    fn test_clip_lowest_percent_zeroes_low_tail() {
        let data: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let frame = Frame::new_mono(10, 10, data);
        let clipped = clip_lowest_percent(&frame, 10.0);
        let zero_count = clipped.data.iter().filter(|&&v| v == 0.0).count();
        assert!(zero_count >= 9);
    }

    #[test]
    fn test_linear_percentile_stretch_expands_range() {
        let f = checkerboard(10, 10);
        let stretched = linear_percentile_stretch(&f, 0.5);
        let max = stretched.data.iter().cloned().fold(0.0f32, f32::max);
        assert!(max > 0.8);
    }

    #[test]
    fn test_clip_hot_pixels_pulls_single_spike_toward_neighbors() {
        let mut data = vec![100.0f32; 100];
        data[55] = 60_000.0;
        let frame = Frame::new_mono(10, 10, data);
        let cleaned = clip_hot_pixels(&frame, 4.0);
        assert!(cleaned.data[55] < 1_000.0);
        assert_eq!(cleaned.data[0], 100.0);
    }
}
