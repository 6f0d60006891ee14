use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::indexed_profile::*;
use crate::instrumentation_profile::remapping::NameRemapper;
use nom::{error::VerboseError, IResult};
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::path::Path;
use tracing::debug;

pub mod binary_writer;
pub mod error;
pub mod indexed_profile;
pub mod memprof;
pub mod remapping;
pub mod stats;
pub mod summary;
pub mod symtab;
pub mod temporal;
pub mod types;
pub mod value_prof;

pub type ParseResult<'a, T> = IResult<&'a [u8], T, VerboseError<&'a [u8]>>;

pub const fn get_num_padding_bytes(len: u64) -> u8 {
    7 & (8 - (len % 8) as u8)
}

pub fn open(filename: impl AsRef<Path>) -> io::Result<IndexedProfileReader> {
    open_with_remapper(filename, None)
}

/// Opens a profile, lookups that miss fall back to names that `remapper` considers equivalent.
pub fn open_with_remapper(
    filename: impl AsRef<Path>,
    remapper: Option<Box<dyn NameRemapper>>,
) -> io::Result<IndexedProfileReader> {
    let mut buffer = Vec::new();
    let mut f = File::open(filename.as_ref())?;
    f.read_to_end(&mut buffer)?;
    debug!(
        "Read {} bytes from {}",
        buffer.len(),
        filename.as_ref().display()
    );
    if !has_format(buffer.as_slice()) {
        return Err(InstrProfError::UnrecognizedFormat.into());
    }
    Ok(IndexedProfileReader::create(buffer, remapper)?)
}

pub fn parse_bytes(data: &[u8]) -> Result<IndexedProfileReader, InstrProfError> {
    if has_format(data) {
        IndexedProfileReader::create(data.to_vec(), None)
    } else {
        Err(InstrProfError::UnrecognizedFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(get_num_padding_bytes(0), 0);
        assert_eq!(get_num_padding_bytes(1), 7);
        assert_eq!(get_num_padding_bytes(7), 1);
        assert_eq!(get_num_padding_bytes(16), 0);
    }

    #[test]
    fn unrecognized_data() {
        assert_eq!(
            parse_bytes(b"not a profile").unwrap_err(),
            InstrProfError::UnrecognizedFormat
        );
        assert_eq!(
            parse_bytes(&[]).unwrap_err(),
            InstrProfError::UnrecognizedFormat
        );
    }
}
