//! Nodata-aware sampling kernels over byte bands.
//!
//! A pixel with zero opacity never contributes to a smooth kernel: bilinear
//! gives nodata when any corner is transparent, and cubic falls back to
//! bilinear when any of its 16 taps is.

use rayon::prelude::*;

use wx_common::OutputMode;

use crate::encode::{opacity, MAX_VALUE_BYTE, NODATA, TRANSPARENT};
use crate::engine::Raster;
use crate::policy::Resampling;

/// Up to four band values of one pixel.
pub type Pixel = [u8; 4];

pub fn nodata_pixel(mode: OutputMode) -> Pixel {
    match mode {
        OutputMode::SingleBand | OutputMode::ByteAlpha => [NODATA, TRANSPARENT, 0, 0],
        OutputMode::Rgba => [0, 0, 0, 0],
    }
}

/// Fractional source pixel position of a lon/lat, or `None` off the grid.
///
/// Longitudes are tried as given and shifted by a full turn, so 0..360 grids
/// serve -180..180 requests.
pub fn source_position(raster: &Raster, lon: f64, lat: f64) -> Option<(f64, f64)> {
    let b = &raster.bounds;
    if lat < b.min_y || lat > b.max_y {
        return None;
    }
    let lon = [lon, lon + 360.0, lon - 360.0]
        .into_iter()
        .find(|l| *l >= b.min_x && *l <= b.max_x)?;
    let cell_w = b.width() / raster.width as f64;
    let cell_h = b.height() / raster.height as f64;
    let x = ((lon - b.min_x) / cell_w - 0.5).clamp(0.0, (raster.width - 1) as f64);
    let y = ((b.max_y - lat) / cell_h - 0.5).clamp(0.0, (raster.height - 1) as f64);
    Some((x, y))
}

/// Sample all bands at a fractional pixel position.
pub fn sample(raster: &Raster, x: f64, y: f64, resampling: Resampling) -> Pixel {
    match resampling {
        Resampling::Nearest => nearest(raster, x, y),
        Resampling::Bilinear => bilinear(raster, x, y),
        Resampling::Cubic => cubic(raster, x, y),
    }
}

fn pixel_at(raster: &Raster, col: usize, row: usize) -> Pixel {
    let i = row * raster.width + col;
    let mut px = [0u8; 4];
    for (b, band) in raster.bands.iter().enumerate().take(4) {
        px[b] = band[i];
    }
    px
}

fn transparent_at(raster: &Raster, col: usize, row: usize) -> bool {
    opacity(raster.mode, &raster.bands, row * raster.width + col) == TRANSPARENT
}

fn nearest(raster: &Raster, x: f64, y: f64) -> Pixel {
    let col = (x.round() as usize).min(raster.width - 1);
    let row = (y.round() as usize).min(raster.height - 1);
    pixel_at(raster, col, row)
}

fn bilinear(raster: &Raster, x: f64, y: f64) -> Pixel {
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(raster.width - 1);
    let y1 = (y0 + 1).min(raster.height - 1);
    let taps = [(x0, y0), (x1, y0), (x0, y1), (x1, y1)];

    if raster.mode != OutputMode::Rgba && taps.iter().any(|&(c, r)| transparent_at(raster, c, r)) {
        return nodata_pixel(raster.mode);
    }

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let weights = [(1.0 - fx) * (1.0 - fy), fx * (1.0 - fy), (1.0 - fx) * fy, fx * fy];

    let mut out = [0u8; 4];
    for (b, band) in raster.bands.iter().enumerate().take(4) {
        let v: f64 = taps
            .iter()
            .zip(weights)
            .map(|(&(c, r), w)| band[r * raster.width + c] as f64 * w)
            .sum();
        out[b] = clamp_band(raster.mode, b, v);
    }
    out
}

fn cubic(raster: &Raster, x: f64, y: f64) -> Pixel {
    let xi = x.floor() as i64;
    let yi = y.floor() as i64;
    let fx = x - xi as f64;
    let fy = y - yi as f64;
    let clamp_col = |c: i64| c.clamp(0, raster.width as i64 - 1) as usize;
    let clamp_row = |r: i64| r.clamp(0, raster.height as i64 - 1) as usize;

    if raster.mode != OutputMode::Rgba {
        for j in -1..=2 {
            for i in -1..=2 {
                if transparent_at(raster, clamp_col(xi + i), clamp_row(yi + j)) {
                    return bilinear(raster, x, y);
                }
            }
        }
    }

    let mut out = [0u8; 4];
    for (b, band) in raster.bands.iter().enumerate().take(4) {
        let mut rows = [0.0f64; 4];
        for (jj, j) in (-1..=2).enumerate() {
            let r = clamp_row(yi + j);
            let tap = |i: i64| band[r * raster.width + clamp_col(xi + i)] as f64;
            rows[jj] = catmull_rom(tap(-1), tap(0), tap(1), tap(2), fx);
        }
        out[b] = clamp_band(raster.mode, b, catmull_rom(rows[0], rows[1], rows[2], rows[3], fy));
    }
    out
}

fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let a = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let b = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let c = -0.5 * p0 + 0.5 * p2;
    ((a * t + b) * t + c) * t + p1
}

/// Interpolated values must not collide with the sentinel on band 1.
fn clamp_band(mode: OutputMode, band: usize, v: f64) -> u8 {
    let max = if band == 0 && mode != OutputMode::Rgba {
        MAX_VALUE_BYTE
    } else {
        u8::MAX
    };
    v.round().clamp(0.0, max as f64) as u8
}

/// Reduce a raster by an integer factor, block by block.
///
/// Nearest keeps the top-left pixel of each block. Smooth kernels average the
/// opaque pixels of the value band and the opacity of the whole block, so
/// coverage edges fade rather than bleed nodata into values.
pub fn downsample(raster: &Raster, factor: usize, resampling: Resampling) -> (usize, usize, Vec<Vec<u8>>) {
    let factor = factor.max(1);
    let out_w = (raster.width / factor).max(1);
    let out_h = (raster.height / factor).max(1);
    let band_count = raster.bands.len();

    let rows: Vec<Vec<Pixel>> = (0..out_h)
        .into_par_iter()
        .map(|oy| {
            (0..out_w)
                .map(|ox| {
                    let col_span = ox * factor..((ox + 1) * factor).min(raster.width);
                    let row_span = oy * factor..((oy + 1) * factor).min(raster.height);
                    if !resampling.is_smooth() {
                        return pixel_at(raster, col_span.start, row_span.start);
                    }
                    block_mean(raster, col_span, row_span)
                })
                .collect()
        })
        .collect();

    let mut bands = vec![Vec::with_capacity(out_w * out_h); band_count];
    for row in rows {
        for px in row {
            for (b, band) in bands.iter_mut().enumerate() {
                band.push(px[b]);
            }
        }
    }
    (out_w, out_h, bands)
}

fn block_mean(raster: &Raster, cols: std::ops::Range<usize>, rows: std::ops::Range<usize>) -> Pixel {
    let mut sums = [0u64; 4];
    let mut valid = 0u64;
    let mut opacity_sum = 0u64;
    let mut total = 0u64;

    for r in rows {
        for c in cols.clone() {
            let i = r * raster.width + c;
            total += 1;
            if raster.mode == OutputMode::Rgba {
                for (b, band) in raster.bands.iter().enumerate().take(4) {
                    sums[b] += band[i] as u64;
                }
                continue;
            }
            let a = opacity(raster.mode, &raster.bands, i) as u64;
            opacity_sum += a;
            if a > 0 {
                valid += 1;
                sums[0] += raster.bands[0][i] as u64;
            }
        }
    }

    let mean = |sum: u64, n: u64| ((sum as f64) / (n.max(1) as f64)).round() as u8;
    match raster.mode {
        OutputMode::Rgba => [
            mean(sums[0], total),
            mean(sums[1], total),
            mean(sums[2], total),
            mean(sums[3], total),
        ],
        _ if valid == 0 => nodata_pixel(raster.mode),
        OutputMode::SingleBand => [mean(sums[0], valid), 0, 0, 0],
        OutputMode::ByteAlpha => [mean(sums[0], valid), mean(opacity_sum, total), 0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wx_common::BoundingBox;

    fn byte_alpha(width: usize, height: usize, values: Vec<u8>) -> Raster {
        let alpha = values.iter().map(|&v| if v == NODATA { 0 } else { 255 }).collect();
        Raster {
            width,
            height,
            bounds: BoundingBox::new(0.0, 0.0, width as f64, height as f64),
            mode: OutputMode::ByteAlpha,
            bands: vec![values, alpha],
        }
    }

    #[test]
    fn test_source_position_cell_centres() {
        let r = byte_alpha(4, 2, vec![0; 8]);
        assert_eq!(source_position(&r, 0.5, 1.5), Some((0.0, 0.0)));
        assert_eq!(source_position(&r, 3.5, 0.5), Some((3.0, 1.0)));
        assert_eq!(source_position(&r, 5.0, 0.5), None);
        assert_eq!(source_position(&r, 1.0, 3.0), None);
    }

    #[test]
    fn test_source_position_wraps_longitude() {
        let mut r = byte_alpha(360, 1, vec![0; 360]);
        r.bounds = BoundingBox::new(0.0, -1.0, 360.0, 1.0);
        let (x, _) = source_position(&r, -99.5, 0.0).unwrap();
        assert!((x - 260.0).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_never_blends() {
        let r = byte_alpha(2, 1, vec![10, 200]);
        assert_eq!(sample(&r, 0.4, 0.0, Resampling::Nearest)[0], 10);
        assert_eq!(sample(&r, 0.6, 0.0, Resampling::Nearest)[0], 200);
    }

    #[test]
    fn test_bilinear_blends_and_respects_nodata() {
        let r = byte_alpha(2, 2, vec![0, 100, 100, 200]);
        assert_eq!(sample(&r, 0.5, 0.5, Resampling::Bilinear)[0], 100);

        let holes = byte_alpha(2, 2, vec![0, NODATA, 100, 200]);
        assert_eq!(sample(&holes, 0.5, 0.5, Resampling::Bilinear), [NODATA, 0, 0, 0]);
    }

    #[test]
    fn test_cubic_on_flat_field_is_exact() {
        let r = byte_alpha(4, 4, vec![77; 16]);
        assert_eq!(sample(&r, 1.3, 2.7, Resampling::Cubic)[0], 77);
    }

    #[test]
    fn test_smooth_kernel_never_emits_sentinel() {
        let r = byte_alpha(2, 1, vec![254, 254]);
        assert_eq!(sample(&r, 0.5, 0.0, Resampling::Cubic)[0], 254);
    }

    #[test]
    fn test_downsample_mean_ignores_nodata() {
        let r = byte_alpha(2, 2, vec![10, 30, NODATA, NODATA]);
        let (w, h, bands) = downsample(&r, 2, Resampling::Bilinear);
        assert_eq!((w, h), (1, 1));
        assert_eq!(bands[0], vec![20]);
        // half the block is transparent
        assert_eq!(bands[1], vec![128]);

        let empty = byte_alpha(2, 2, vec![NODATA; 4]);
        assert_eq!(downsample(&empty, 2, Resampling::Bilinear).2[0], vec![NODATA]);
    }

    #[test]
    fn test_downsample_nearest_keeps_categories() {
        let r = byte_alpha(4, 2, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let (w, h, bands) = downsample(&r, 2, Resampling::Nearest);
        assert_eq!((w, h), (2, 1));
        assert_eq!(bands[0], vec![1, 3]);
    }

    #[test]
    fn test_downsample_never_below_one_pixel() {
        let r = byte_alpha(3, 3, vec![5; 9]);
        let (w, h, _) = downsample(&r, 64, Resampling::Bilinear);
        assert_eq!((w, h), (1, 1));
    }
}
