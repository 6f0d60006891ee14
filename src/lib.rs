mod hash_table;
pub mod instrumentation_profile;
pub mod summary;
pub mod util;

pub use crate::instrumentation_profile::binary_writer::{InstrProfWriter, WriterOptions};
pub use crate::instrumentation_profile::error::InstrProfError;
pub use crate::instrumentation_profile::indexed_profile::IndexedProfileReader;
pub use crate::instrumentation_profile::{open, open_with_remapper, parse_bytes};
