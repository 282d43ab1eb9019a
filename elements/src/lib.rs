//! Pure, stateless algorithms shared by the observation engine: astrometry,
//! image I/O and pixel operators, autofocus curve fitting, stacking
//! statistics, and rolling value statistics. Nothing in this crate touches
//! a device, the filesystem beyond FITS/image paths passed in by the
//! caller, or wall-clock time other than what's handed to it as an
//! argument.

pub mod align;
pub mod astro_util;
pub mod fits;
pub mod focus;
pub mod stacking;
pub mod value_stats;
