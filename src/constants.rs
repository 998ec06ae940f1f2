/// Length of a session identifier, in bytes.
pub const SESSION_ID_LEN: usize = 32;

/// Length of a message digest accepted for signing, in bytes.
pub const DIGEST_LEN: usize = 32;

/// Length of a BIP32 chain code, in bytes.
pub const CHAIN_CODE_LEN: usize = 32;

/// First hardened derivation index.
pub const HARDENED_OFFSET: u32 = 1 << 31;

pub const SIGN_CONTEXT_LABEL: &[u8] = b"tsm-client v0.1.0 sign context";
pub const ESCROW_BINDING_LABEL: &[u8] = b"tsm-client v0.1.0 escrow binding";
pub const ESCROW_KDF_INFO: &[u8] = b"tsm-client v0.1.0 escrow envelope";
