//! In-process raster engine.
//!
//! Keeps the pipeline runnable without a native GIS toolkit. Rasters are
//! stored in a private single-file format: magic, a JSON header, then the
//! base bands followed by every overview plane. Files are replaced with
//! write-temp-then-rename, so a reader never sees a half-built pyramid.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use wx_common::{BoundingBox, OutputMode};

use crate::encode::opacity;
use crate::engine::{BandMetadata, Raster, RasterEngine, RasterMetadata, ReprojectRequest};
use crate::error::{EncodingError, EngineFault, Result};
use crate::policy::Resampling;
use crate::resample::{downsample, nodata_pixel, sample, source_position};

const MAGIC: &[u8; 8] = b"WXRT\x01\0\0\0";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverviewSet {
    bands: Vec<usize>,
    levels: Vec<u32>,
    resampling: Resampling,
    /// A mask plane follows the band planes at every level.
    with_mask: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    width: usize,
    height: usize,
    bounds: BoundingBox,
    mode: OutputMode,
    resampling: Option<Resampling>,
    overview_sets: Vec<OverviewSet>,
}

/// A decoded file: header, base planes and overview planes.
struct Stored {
    header: Header,
    base: Vec<Vec<u8>>,
    /// `[set][level][plane]`
    overviews: Vec<Vec<Vec<Vec<u8>>>>,
}

impl Stored {
    fn raster(&self) -> Raster {
        Raster {
            width: self.header.width,
            height: self.header.height,
            bounds: self.header.bounds,
            mode: self.header.mode,
            bands: self.base.clone(),
        }
    }
}

fn level_dims(width: usize, height: usize, level: u32) -> (usize, usize) {
    let f = level.max(1) as usize;
    ((width / f).max(1), (height / f).max(1))
}

#[derive(Debug, Clone)]
pub struct LocalRasterEngine {
    mask_overviews: bool,
}

impl Default for LocalRasterEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRasterEngine {
    pub fn new() -> Self {
        Self { mask_overviews: true }
    }

    /// An engine whose full-pass overview builder rejects masked rasters.
    pub fn without_mask_overviews() -> Self {
        Self { mask_overviews: false }
    }

    fn load(&self, path: &Path) -> Result<Stored> {
        let data = std::fs::read(path).map_err(EncodingError::io(path))?;
        decode_file(path, &data)
    }

    fn save(&self, path: &Path, stored: &Stored) -> Result<()> {
        let data = encode_file(path, stored)?;
        let temp = temp_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(EncodingError::io(parent))?;
        }
        std::fs::write(&temp, &data).map_err(EncodingError::io(&temp))?;
        if let Err(e) = std::fs::rename(&temp, path) {
            std::fs::remove_file(&temp).ok();
            return Err(EncodingError::io(path)(e));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
}

fn check_raster(path: &Path, raster: &Raster) -> Result<()> {
    if raster.width == 0 || raster.height == 0 {
        return Err(EncodingError::engine(
            "write",
            path,
            EngineFault::Failed(format!("empty raster {}x{}", raster.width, raster.height)),
        ));
    }
    if raster.bands.len() != raster.mode.band_count() {
        return Err(EncodingError::UnsupportedBandLayout {
            bands: raster.bands.len(),
        });
    }
    if raster.bands.iter().any(|b| b.len() != raster.pixel_count()) {
        return Err(EncodingError::engine(
            "write",
            path,
            EngineFault::Failed("band length does not match raster size".into()),
        ));
    }
    Ok(())
}

fn encode_file(path: &Path, stored: &Stored) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&stored.header).map_err(|e| EncodingError::Format {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(&header);
    for plane in &stored.base {
        buf.put_slice(plane);
    }
    for set in &stored.overviews {
        for level in set {
            for plane in level {
                buf.put_slice(plane);
            }
        }
    }
    Ok(buf.to_vec())
}

fn decode_file(path: &Path, data: &[u8]) -> Result<Stored> {
    let malformed = |detail: &str| EncodingError::Format {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    let mut buf = data;
    if buf.remaining() < MAGIC.len() + 4 || &buf[..MAGIC.len()] != MAGIC {
        return Err(malformed("not a raster file"));
    }
    buf.advance(MAGIC.len());
    let header_len = buf.get_u32_le() as usize;
    if buf.remaining() < header_len {
        return Err(malformed("truncated header"));
    }
    let header: Header =
        serde_json::from_slice(&buf[..header_len]).map_err(|e| malformed(&e.to_string()))?;
    buf.advance(header_len);

    let mut take = |len: usize| -> Result<Vec<u8>> {
        if buf.remaining() < len {
            return Err(malformed("truncated band data"));
        }
        let plane = buf[..len].to_vec();
        buf.advance(len);
        Ok(plane)
    };

    let pixels = header.width * header.height;
    let base = (0..header.mode.band_count())
        .map(|_| take(pixels))
        .collect::<Result<Vec<_>>>()?;

    let mut overviews = Vec::with_capacity(header.overview_sets.len());
    for set in &header.overview_sets {
        let planes = set.bands.len() + usize::from(set.with_mask);
        let mut levels = Vec::with_capacity(set.levels.len());
        for &level in &set.levels {
            let (w, h) = level_dims(header.width, header.height, level);
            levels.push((0..planes).map(|_| take(w * h)).collect::<Result<Vec<_>>>()?);
        }
        overviews.push(levels);
    }

    Ok(Stored {
        header,
        base,
        overviews,
    })
}

impl RasterEngine for LocalRasterEngine {
    fn write(&self, path: &Path, raster: &Raster) -> Result<()> {
        check_raster(path, raster)?;
        let stored = Stored {
            header: Header {
                width: raster.width,
                height: raster.height,
                bounds: raster.bounds,
                mode: raster.mode,
                resampling: None,
                overview_sets: Vec::new(),
            },
            base: raster.bands.clone(),
            overviews: Vec::new(),
        };
        self.save(path, &stored)
    }

    fn read(&self, path: &Path) -> Result<Raster> {
        Ok(self.load(path)?.raster())
    }

    fn reproject(&self, request: &ReprojectRequest<'_>) -> Result<()> {
        let src = self.load(request.src)?.raster();
        let (width, height) = request.dst_size;
        if width == 0 || height == 0 || !request.dst_bounds.is_valid() {
            return Err(EncodingError::InvalidBounds(format!(
                "{}x{} over {:?}",
                width, height, request.dst_bounds
            )));
        }
        if src.mode != request.nodata {
            return Err(EncodingError::engine(
                "reproject",
                request.src,
                EngineFault::Failed(format!(
                    "source is {:?}, caller expected {:?}",
                    src.mode, request.nodata
                )),
            ));
        }

        let b = request.dst_bounds;
        let cell_w = b.width() / width as f64;
        let cell_h = b.height() / height as f64;
        let band_count = src.bands.len();
        let empty = nodata_pixel(src.mode);

        let rows: Vec<Vec<u8>> = (0..height)
            .into_par_iter()
            .map(|row| {
                let lat = b.max_y - (row as f64 + 0.5) * cell_h;
                let mut out = Vec::with_capacity(width * band_count);
                for col in 0..width {
                    let lon = b.min_x + (col as f64 + 0.5) * cell_w;
                    let px = source_position(&src, lon, lat)
                        .map(|(x, y)| sample(&src, x, y, request.resampling))
                        .unwrap_or(empty);
                    out.extend_from_slice(&px[..band_count]);
                }
                out
            })
            .collect();

        let mut bands = vec![Vec::with_capacity(width * height); band_count];
        for row in rows {
            for px in row.chunks_exact(band_count) {
                for (band, v) in bands.iter_mut().zip(px) {
                    band.push(*v);
                }
            }
        }

        debug!(
            src = %request.src.display(),
            dst = %request.dst.display(),
            width,
            height,
            resampling = %request.resampling,
            "Reprojected raster"
        );
        self.save(
            request.dst,
            &Stored {
                header: Header {
                    width,
                    height,
                    bounds: b,
                    mode: src.mode,
                    resampling: Some(request.resampling),
                    overview_sets: Vec::new(),
                },
                base: bands,
                overviews: Vec::new(),
            },
        )
    }

    fn build_overviews(
        &self,
        path: &Path,
        resampling: Resampling,
        levels: &[u32],
        bands: Option<&[usize]>,
    ) -> Result<()> {
        let mut stored = self.load(path)?;
        let mode = stored.header.mode;
        let band_count = mode.band_count();
        let selected: Vec<usize> = bands.map(<[usize]>::to_vec).unwrap_or_else(|| (0..band_count).collect());

        if levels.is_empty() || levels.iter().any(|&l| l < 2) {
            return Err(EncodingError::engine(
                "build_overviews",
                path,
                EngineFault::Failed(format!("invalid overview levels {:?}", levels)),
            ));
        }
        if let Some(&bad) = selected.iter().find(|&&b| b >= band_count) {
            return Err(EncodingError::engine(
                "build_overviews",
                path,
                EngineFault::Failed(format!("band {} out of range", bad)),
            ));
        }

        let has_mask = mode != OutputMode::Rgba;
        let full_pass = bands.is_none();
        if full_pass && has_mask && !self.mask_overviews {
            return Err(EncodingError::engine("build_overviews", path, EngineFault::MaskUnsupported));
        }
        for set in &stored.header.overview_sets {
            if let Some(&band) = selected.iter().find(|b| set.bands.contains(*b)) {
                return Err(EncodingError::engine(
                    "build_overviews",
                    path,
                    EngineFault::OverviewConflict { band },
                ));
            }
        }

        let with_mask = full_pass && has_mask;
        let raster = stored.raster();
        let planes: Vec<Vec<Vec<u8>>> = levels
            .par_iter()
            .map(|&level| {
                let (w, h, down) = downsample(&raster, level as usize, resampling);
                let mut planes: Vec<Vec<u8>> = selected.iter().map(|&b| down[b].clone()).collect();
                if with_mask {
                    planes.push((0..w * h).map(|i| opacity(mode, &down, i)).collect());
                }
                planes
            })
            .collect();

        stored.header.overview_sets.push(OverviewSet {
            bands: selected.clone(),
            levels: levels.to_vec(),
            resampling,
            with_mask,
        });
        stored.overviews.push(planes);

        debug!(path = %path.display(), bands = ?selected, with_mask, "Built overviews");
        self.save(path, &stored)
    }

    fn clear_overviews(&self, path: &Path) -> Result<()> {
        let mut stored = self.load(path)?;
        stored.header.overview_sets.clear();
        stored.overviews.clear();
        self.save(path, &stored)
    }

    fn metadata(&self, path: &Path) -> Result<RasterMetadata> {
        let header = self.load(path)?.header;
        let alpha_band = match header.mode {
            OutputMode::SingleBand => None,
            OutputMode::ByteAlpha => Some(1),
            OutputMode::Rgba => Some(3),
        };
        let bands = (0..header.mode.band_count())
            .map(|index| {
                let sets: Vec<&OverviewSet> = header
                    .overview_sets
                    .iter()
                    .filter(|s| s.bands.contains(&index))
                    .collect();
                BandMetadata {
                    index,
                    is_alpha: alpha_band == Some(index),
                    overview_sets: sets.len(),
                    overview_levels: sets.first().map(|s| s.levels.clone()).unwrap_or_default(),
                }
            })
            .collect();
        Ok(RasterMetadata {
            width: header.width,
            height: header.height,
            mode: header.mode,
            bands,
            mask_overviews: header.overview_sets.iter().any(|s| s.with_mask),
            resampling: header.resampling,
            overview_resampling: header.overview_sets.first().map(|s| s.resampling),
        })
    }

    fn supports_mask_overviews(&self) -> bool {
        self.mask_overviews
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster() -> Raster {
        let values: Vec<u8> = (0..16).map(|i| if i == 5 { 255 } else { i as u8 * 10 }).collect();
        let alpha = values.iter().map(|&v| if v == 255 { 0 } else { 255 }).collect();
        Raster {
            width: 4,
            height: 4,
            bounds: BoundingBox::new(-100.0, 30.0, -96.0, 34.0),
            mode: OutputMode::ByteAlpha,
            bands: vec![values, alpha],
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tif");
        let engine = LocalRasterEngine::new();
        engine.write(&path, &raster()).unwrap();
        assert_eq!(engine.read(&path).unwrap(), raster());

        let meta = engine.metadata(&path).unwrap();
        assert_eq!(meta.band_count(), 2);
        assert!(meta.bands[1].is_alpha);
        assert_eq!(meta.resampling, None);
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        std::fs::write(&path, b"GIF89a").unwrap();
        assert!(matches!(
            LocalRasterEngine::new().read(&path),
            Err(EncodingError::Format { .. })
        ));
    }

    #[test]
    fn test_reproject_identity_extent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.tif");
        let dst = dir.path().join("dst.tif");
        let engine = LocalRasterEngine::new();
        engine.write(&src, &raster()).unwrap();
        engine
            .reproject(&ReprojectRequest {
                src: &src,
                dst: &dst,
                dst_bounds: raster().bounds,
                dst_size: (4, 4),
                resampling: Resampling::Nearest,
                nodata: OutputMode::ByteAlpha,
            })
            .unwrap();
        let out = engine.read(&dst).unwrap();
        assert_eq!(out.bands, raster().bands);
        assert_eq!(engine.metadata(&dst).unwrap().resampling, Some(Resampling::Nearest));
    }

    #[test]
    fn test_reproject_outside_source_is_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.tif");
        let dst = dir.path().join("dst.tif");
        let engine = LocalRasterEngine::new();
        engine.write(&src, &raster()).unwrap();
        engine
            .reproject(&ReprojectRequest {
                src: &src,
                dst: &dst,
                dst_bounds: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
                dst_size: (2, 2),
                resampling: Resampling::Bilinear,
                nodata: OutputMode::ByteAlpha,
            })
            .unwrap();
        let out = engine.read(&dst).unwrap();
        assert_eq!(out.bands[0], vec![255; 4]);
        assert_eq!(out.bands[1], vec![0; 4]);
    }

    #[test]
    fn test_overviews_conflict_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tif");
        let engine = LocalRasterEngine::new();
        engine.write(&path, &raster()).unwrap();

        engine.build_overviews(&path, Resampling::Bilinear, &[2, 4], None).unwrap();
        let meta = engine.metadata(&path).unwrap();
        assert!(meta.mask_overviews);
        assert!(meta.bands.iter().all(|b| b.overview_sets == 1 && b.overview_levels == vec![2, 4]));

        let err = engine
            .build_overviews(&path, Resampling::Bilinear, &[2, 4], Some(&[0]))
            .unwrap_err();
        assert_eq!(err.fault(), Some(&EngineFault::OverviewConflict { band: 0 }));

        engine.clear_overviews(&path).unwrap();
        let meta = engine.metadata(&path).unwrap();
        assert!(meta.bands.iter().all(|b| b.overview_sets == 0));
        assert!(!meta.mask_overviews);
        // base level untouched
        assert_eq!(engine.read(&path).unwrap(), raster());
    }

    #[test]
    fn test_mask_unsupported_only_for_full_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tif");
        let engine = LocalRasterEngine::without_mask_overviews();
        engine.write(&path, &raster()).unwrap();

        let err = engine
            .build_overviews(&path, Resampling::Nearest, &[2], None)
            .unwrap_err();
        assert_eq!(err.fault(), Some(&EngineFault::MaskUnsupported));

        engine.build_overviews(&path, Resampling::Nearest, &[2], Some(&[0])).unwrap();
        engine.build_overviews(&path, Resampling::Nearest, &[2], Some(&[1])).unwrap();
        let meta = engine.metadata(&path).unwrap();
        assert!(meta.bands.iter().all(|b| b.overview_sets == 1));
        assert!(!meta.mask_overviews);
    }
}
