use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, Error> {
    rmp_serde::encode::to_vec(val).map_err(|e| Error::Encoding(e.to_string()))
}

/// Encode a value into a writer, used to feed hashes without an intermediate buffer.
pub fn encode_writer<T: Serialize + ?Sized, W: std::io::Write>(
    w: &mut W,
    val: &T,
) -> Result<(), Error> {
    rmp_serde::encode::write(w, val).map_err(|e| Error::Encoding(e.to_string()))
}

/// Decode a value produced by [encode].
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}
