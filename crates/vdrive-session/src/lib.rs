//! vdrive-session: envelope processing and control-operation dispatch.
//!
//! Every inbound BLE envelope drives exactly one transition: decode, verify,
//! decrypt, replay-check, dispatch. The response envelope is always produced
//! and always signed, even on error paths.

mod handler;
mod session;

pub use handler::Handler;
pub use session::Session;

use vdrive_crypto::CipherKind;
use vdrive_proto::Cipher;

pub(crate) fn cipher_from_wire(cipher: Cipher) -> CipherKind {
    match cipher {
        Cipher::None => CipherKind::None,
        Cipher::Aes128CbcPlain => CipherKind::Aes128CbcPlain,
        Cipher::Aes128CbcEssiv => CipherKind::Aes128CbcEssiv,
        Cipher::Aes128XtsPlain => CipherKind::Aes128XtsPlain,
        Cipher::Aes256XtsPlain => CipherKind::Aes256XtsPlain,
    }
}

pub(crate) fn cipher_to_wire(kind: CipherKind) -> Cipher {
    match kind {
        CipherKind::None => Cipher::None,
        CipherKind::Aes128CbcPlain => Cipher::Aes128CbcPlain,
        CipherKind::Aes128CbcEssiv => Cipher::Aes128CbcEssiv,
        CipherKind::Aes128XtsPlain => Cipher::Aes128XtsPlain,
        CipherKind::Aes256XtsPlain => Cipher::Aes256XtsPlain,
    }
}
