//! Shared test utilities for the weather tile workspace.
//!
//! - [`generators`]: synthetic decoded fields.
//! - [`scripted`]: scripted provider and decoder fakes.
//! - [`fixtures`]: temporary stores, staged frames and a manual clock.
//! - [`paths`]: optional on-disk test data.
//!
//! Used from each crate's `tests/` directory:
//!
//! ```ignore
//! use test_utils::{ScriptedProvider, TestStore, temperature_field};
//! ```

pub mod fixtures;
pub mod generators;
pub mod paths;
pub mod scripted;

pub use fixtures::*;
pub use generators::*;
pub use paths::*;
pub use scripted::*;

/// Resolve an optional data file via [`find_test_file`], or print a skip
/// notice and return from the test.
///
/// ```ignore
/// let path = test_utils::require_test_file!("gfs_tmp2m.grib2");
/// ```
#[macro_export]
macro_rules! require_test_file {
    ($name:expr) => {{
        match $crate::find_test_file($name) {
            Some(path) => path,
            None => {
                eprintln!(
                    "SKIPPED: Test file '{}' not found. Set TEST_DATA_DIR to run it.",
                    $name
                );
                return;
            }
        }
    }};
}

/// Assert two numbers are within `epsilon`, comparing as `f64`.
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}
