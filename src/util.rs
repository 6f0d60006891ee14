use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::{get_num_padding_bytes, ParseResult};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::multi::count;
use nom::number::complete::le_u64;
use std::convert::TryFrom;
use std::io::{Read, Write};

/// Separates the names inside a name string blob.
pub const INSTR_PROF_NAME_SEP: char = '\u{1}';

pub fn parse_leb128(input: &[u8]) -> ParseResult<u64> {
    let mut bytes = input;
    match leb128::read::unsigned(&mut bytes) {
        Ok(x) => Ok((bytes, x)),
        Err(_) => Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::Eof,
        ))),
    }
}

fn write_leb128(out: &mut Vec<u8>, value: u64) {
    // Writing into a vec can't fail
    let _ = leb128::write::unsigned(out, value);
}

/// Reads one `uncompressed_len, compressed_len, bytes` record. A compressed length of zero means
/// the bytes are stored as is.
pub fn parse_string_ref(input: &[u8]) -> Result<(&[u8], String), InstrProfError> {
    let (input, uncompressed_size) = parse_leb128(input)?;
    let (input, compressed_size) = parse_leb128(input)?;
    let uncompressed_size =
        usize::try_from(uncompressed_size).map_err(|_| InstrProfError::Malformed)?;
    let compressed_size = usize::try_from(compressed_size).map_err(|_| InstrProfError::Malformed)?;
    if compressed_size != 0 {
        let compressed = input
            .get(..compressed_size)
            .ok_or(InstrProfError::Malformed)?;
        let mut decoder = ZlibDecoder::new(compressed);
        let mut output = vec![];
        decoder
            .read_to_end(&mut output)
            .map_err(|_| InstrProfError::UncompressFailed)?;
        if output.len() != uncompressed_size {
            return Err(InstrProfError::UncompressFailed);
        }
        let name = String::from_utf8(output).map_err(|_| InstrProfError::Malformed)?;
        Ok((&input[compressed_size..], name))
    } else {
        let bytes = input
            .get(..uncompressed_size)
            .ok_or(InstrProfError::Malformed)?;
        let name = std::str::from_utf8(bytes).map_err(|_| InstrProfError::Malformed)?;
        Ok((&input[uncompressed_size..], name.to_string()))
    }
}

/// Joins `names` into a single name string record, compressing it with zlib if asked to.
pub fn collect_name_strings<S: AsRef<str>>(
    names: &[S],
    compress: bool,
) -> Result<Vec<u8>, InstrProfError> {
    let joined = names
        .iter()
        .map(|x| x.as_ref())
        .collect::<Vec<&str>>()
        .join(&INSTR_PROF_NAME_SEP.to_string());
    let mut out = vec![];
    write_leb128(&mut out, joined.len() as u64);
    if compress && !joined.is_empty() {
        let mut encoder = ZlibEncoder::new(vec![], Compression::best());
        encoder
            .write_all(joined.as_bytes())
            .map_err(|_| InstrProfError::CompressFailed)?;
        let compressed = encoder
            .finish()
            .map_err(|_| InstrProfError::CompressFailed)?;
        write_leb128(&mut out, compressed.len() as u64);
        out.extend_from_slice(&compressed);
    } else {
        write_leb128(&mut out, 0);
        out.extend_from_slice(joined.as_bytes());
    }
    Ok(out)
}

/// Reads every name out of a sequence of name string records. Records may be followed by zero
/// padding.
pub fn parse_name_strings(mut input: &[u8]) -> Result<Vec<String>, InstrProfError> {
    let mut names = vec![];
    while !input.is_empty() {
        let (bytes, joined) = parse_string_ref(input)?;
        names.extend(
            joined
                .split(INSTR_PROF_NAME_SEP)
                .filter(|x| !x.is_empty())
                .map(|x| x.to_string()),
        );
        let padding = bytes.iter().take_while(|x| **x == 0).count();
        input = &bytes[padding..];
    }
    Ok(names)
}

/// Parses a little endian `u64` length followed by that many `u64`s.
pub(crate) fn parse_u64_array(input: &[u8]) -> ParseResult<Vec<u64>> {
    let (input, len) = le_u64(input)?;
    if len > (input.len() / 8) as u64 {
        return Err(nom::Err::Failure(VerboseError::from_error_kind(
            input,
            ErrorKind::Count,
        )));
    }
    count(le_u64, len as usize)(input)
}

pub(crate) fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64_array(out: &mut Vec<u8>, values: &[u64]) {
    write_u64(out, values.len() as u64);
    for value in values {
        write_u64(out, *value);
    }
}

/// Zero pads `out` to the next multiple of 8 bytes.
pub(crate) fn pad_to_alignment(out: &mut Vec<u8>) {
    let padding = get_num_padding_bytes(out.len() as u64) as usize;
    out.resize(out.len() + padding, 0);
}

/// Bounds checked view of `data` starting at `offset`.
pub(crate) fn slice_from(data: &[u8], offset: u64) -> Result<&[u8], InstrProfError> {
    usize::try_from(offset)
        .ok()
        .and_then(|offset| data.get(offset..))
        .ok_or(InstrProfError::Malformed)
}
