//! Clients for the upstream package index and the cross-ecosystem name
//! mapping service.

mod mapping;
mod pypi;

pub use mapping::{MappingClient, DEFAULT_MAPPING_URL};
pub use pypi::{PyPiClient, PyPiError, PyPiRelease, WheelInfo, DEFAULT_INDEX_URL};
