use std::{fmt, io::Write};

use ck_meow::Meow;
use serde::{Deserialize, Serialize};

use crate::{error::Error, serde::encode_writer};

const COMMIT_LEN: usize = 32;

struct MeowWriter<'a>(&'a mut Meow);

impl<'a> Write for MeowWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.ad(buf, true);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Represents a commitment to some value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment([u8; COMMIT_LEN]);

impl AsRef<[u8]> for Commitment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

/// Commit to an arbitrary serializable value, under a domain separation label.
///
/// The commitment is deterministic: the same label and value always produce
/// the same output, which is what lets independent parties compare them.
pub fn commit<T: Serialize + ?Sized>(label: &[u8], val: &T) -> Result<Commitment, Error> {
    let mut meow = Meow::new(label);

    meow.ad(&[], false);
    encode_writer(&mut MeowWriter(&mut meow), val)?;

    let mut out = [0u8; COMMIT_LEN];
    meow.prf(&mut out, false);

    Ok(Commitment(out))
}
