//! Synthetic decoded fields with predictable values.
//!
//! Every generator returns a [`DecodedField`] on [`TEST_BOUNDS`] unless told
//! otherwise, row-major north to south.

use ingestion::DecodedField;
use wx_common::BoundingBox;

/// Outer edges of the synthetic grid: roughly CONUS.
pub const TEST_BOUNDS: BoundingBox = BoundingBox {
    min_x: -130.0,
    min_y: 20.0,
    max_x: -60.0,
    max_y: 55.0,
};

/// A field whose cell value is `col * 1000 + row`.
///
/// ```
/// use test_utils::indexed_field;
///
/// let field = indexed_field("t", 10, 5);
/// assert_eq!(field.get(1, 0), 1000.0);
/// assert_eq!(field.get(0, 1), 1.0);
/// ```
pub fn indexed_field(var_id: &str, width: usize, height: usize) -> DecodedField {
    let values = (0..height)
        .flat_map(|row| (0..width).map(move |col| (col * 1000 + row) as f32))
        .collect();
    DecodedField::new(var_id, width, height, TEST_BOUNDS, values)
}

/// Every cell set to `value`.
pub fn constant_field(var_id: &str, width: usize, height: usize, value: f32) -> DecodedField {
    DecodedField::new(var_id, width, height, TEST_BOUNDS, vec![value; width * height])
}

/// 2 m temperature in Kelvin: cold in the north-west, warm in the
/// south-east, spanning 250..310 K.
pub fn temperature_field(width: usize, height: usize) -> DecodedField {
    gradient_field("tmp2m", width, height, 250.0, 310.0).with_units("K")
}

/// Reflectivity in dBZ from -10 (west) to 70 (east), so the western part is
/// below any display threshold.
pub fn reflectivity_field(width: usize, height: usize) -> DecodedField {
    let values = (0..height)
        .flat_map(|_| {
            (0..width).map(move |col| -10.0 + 80.0 * col as f32 / (width.max(2) - 1) as f32)
        })
        .collect();
    DecodedField::new("refc", width, height, TEST_BOUNDS, values).with_units("dBZ")
}

/// u and v wind components in m/s, each constant, with differing level
/// coordinates as a real decoder reports them.
pub fn wind_components(width: usize, height: usize, u: f32, v: f32) -> (DecodedField, DecodedField) {
    (
        constant_field("ugrd10m", width, height, u)
            .with_units("m/s")
            .with_coord("heightAboveGround", 10.0),
        constant_field("vgrd10m", width, height, v)
            .with_units("m/s")
            .with_coord("level", 10.0),
    )
}

/// A categorical 0/1 flag set where `set(col, row)` holds.
pub fn flag_field(
    var_id: &str,
    width: usize,
    height: usize,
    set: impl Fn(usize, usize) -> bool,
) -> DecodedField {
    let values = (0..height)
        .flat_map(|row| (0..width).map(move |col| (row, col)))
        .map(|(row, col)| if set(col, row) { 1.0 } else { 0.0 })
        .collect();
    DecodedField::new(var_id, width, height, TEST_BOUNDS, values)
}

/// Linear gradient along the grid diagonal.
pub fn gradient_field(var_id: &str, width: usize, height: usize, lo: f32, hi: f32) -> DecodedField {
    let span = (width + height).saturating_sub(2).max(1) as f32;
    let values = (0..height)
        .flat_map(|row| (0..width).map(move |col| lo + (hi - lo) * (row + col) as f32 / span))
        .collect();
    DecodedField::new(var_id, width, height, TEST_BOUNDS, values)
}

/// Replace every `nth` value with `NaN`, starting at index 0.
pub fn with_missing(mut field: DecodedField, nth: usize) -> DecodedField {
    for v in field.values.iter_mut().step_by(nth.max(1)) {
        *v = f32::NAN;
    }
    field
}
