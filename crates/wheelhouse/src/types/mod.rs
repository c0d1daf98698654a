//! Core types shared across the library: package names, wheel filenames, and
//! the metadata records parsed out of a wheel archive.

mod entry_points;
mod package_name;
mod rfc822ish;
mod wheel_filename;
mod wheel_metadata;

pub use entry_points::{EntryPoints, ParseEntryPointsError};
pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};
pub use rfc822ish::{RFC822ish, RFC822ishError};
pub use wheel_filename::{ParseWheelFilenameError, WheelFilename};
pub use wheel_metadata::{WheelMetadata, WheelMetadataError};
