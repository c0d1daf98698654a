//! Wheelhouse converts Python wheel distributions into conda packages and
//! maintains a channel of such packages mirrored from an upstream index. The
//! conversion is a single streaming pass: the wheel is never fully held in
//! memory, per-file hashes are computed during the copy, and PEP 508
//! environment markers are translated into conda selector expressions. This
//! crate is the library; the `wheelhouse_bin` crate provides the CLI on top
//! of it.

#![deny(missing_docs)]

pub mod types;

pub mod archive;
pub mod channel;
pub mod closure;
pub mod convert;
pub mod index;
pub mod markers;
pub mod state;
pub mod sync;

mod utils;

pub use convert::{convert_wheel, ConversionResult, ConvertError, OutputLocation, WheelSource};
pub use markers::{marker_to_condition, Condition, MarkerError};
pub use pep440_rs::{Version, VersionSpecifiers};
pub use pep508_rs::Requirement;
