//! End-to-end handshake scenarios against an emulated mobile companion:
//! first-boot pairing, session establishment, unlock, replay rejection.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hkdf::Hkdf;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use tokio::sync::Notify;

use vdrive_core::soft::{MemDisk, SoftElement, SoftLeds};
use vdrive_crypto::persist::CONF_BLOCKS_V2;
use vdrive_crypto::{seal, sign, Keyring};
use vdrive_fde::{Drive, BLOCK_SIZE_MULTIPLIER};
use vdrive_proto::wire::{
    Cipher, Envelope, ErrorCode, KeyExchange, Message, OpCode, Signature, Status,
};
use vdrive_session::Handler;

const PAIRING_NONCE: u64 = 0xDEADBEEF00C0FFEE;

struct Rig {
    handler: Handler,
    drive: Arc<Drive>,
    leds: Arc<SoftLeds>,
}

async fn pairing_rig() -> Rig {
    let se = Arc::new(SoftElement::new([3u8; 32]));
    let mmc = Arc::new(MemDisk::new(CONF_BLOCKS_V2 as u64 + 16, 512));
    let sd = Arc::new(MemDisk::new(2048, 512));

    let mut keyring = Keyring::with_conf_lba(se, mmc, 0);
    keyring.init(false).await.unwrap();
    // fresh long-term key for this pairing advertisement
    keyring.new_longterm_key();

    let drive = Arc::new(Drive::new(sd, BLOCK_SIZE_MULTIPLIER));
    let leds = Arc::new(SoftLeds::default());

    let mut handler = Handler::new(
        keyring,
        drive.clone(),
        leds.clone(),
        Arc::new(Notify::new()),
        "0.4.0",
    );
    handler.start_pairing(PAIRING_NONCE);

    Rig { handler, drive, leds }
}

/// Emulated mobile companion.
struct Mobile {
    longterm: SecretKey,
    ephemeral: SecretKey,
    session_key: Option<[u8; 32]>,
    ts: i64,
}

impl Mobile {
    fn new() -> Self {
        Self {
            longterm: SecretKey::random(&mut OsRng),
            ephemeral: SecretKey::random(&mut OsRng),
            session_key: None,
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_millis() as i64,
        }
    }

    fn longterm_pub(&self) -> Vec<u8> {
        self.longterm
            .public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    fn ephemeral_pub(&self) -> Vec<u8> {
        self.ephemeral
            .public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    fn next_ts(&mut self) -> i64 {
        self.ts += 1000;
        self.ts
    }

    fn envelope(&self, msg: &Message, signer: Option<&SecretKey>) -> Vec<u8> {
        let message = msg.to_bytes();

        let signature = signer.map(|key| {
            let sig = sign::sign(key, &message).unwrap();
            Signature {
                data: sig.digest.to_vec(),
                r: sig.r.to_vec(),
                s: sig.s.to_vec(),
            }
        });

        Envelope { message, signature }.to_bytes()
    }

    fn pair_envelope(&mut self, nonce: u64) -> Vec<u8> {
        let kex = KeyExchange {
            key: self.longterm_pub(),
            nonce,
        };

        let msg = Message {
            timestamp: self.next_ts(),
            response: false,
            op_code: OpCode::Pair as i32,
            error: 0,
            payload: kex.to_bytes(),
        };

        // pairing trust comes from the QR nonce, not a signature
        self.envelope(&msg, None)
    }

    fn session_envelope(&mut self) -> Vec<u8> {
        let kex = KeyExchange {
            key: self.ephemeral_pub(),
            nonce: 0,
        };

        let msg = Message {
            timestamp: self.next_ts(),
            response: false,
            op_code: OpCode::Session as i32,
            error: 0,
            payload: kex.to_bytes(),
        };

        let longterm = self.longterm.clone();
        self.envelope(&msg, Some(&longterm))
    }

    /// Derive the session key from the device's SESSION reply.
    fn complete_session(&mut self, reply: &[u8]) {
        let env = Envelope::from_bytes(reply).unwrap();
        let msg = Message::from_bytes(&env.message).unwrap();
        assert_eq!(msg.error, ErrorCode::Null as i32, "session refused");

        let kex = KeyExchange::from_bytes(&msg.payload).unwrap();
        let armory_pub = PublicKey::from_public_key_der(&kex.key).unwrap();

        let shared =
            p256::ecdh::diffie_hellman(self.ephemeral.to_nonzero_scalar(), armory_pub.as_affine());

        let hk = Hkdf::<Sha256>::new(Some(&kex.nonce.to_be_bytes()), shared.raw_secret_bytes());
        let mut key = [0u8; 32];
        hk.expand(&[], &mut key).unwrap();

        self.session_key = Some(key);
    }

    /// Build an in-session operation envelope (encrypted, ephemeral-signed).
    fn op_envelope(&mut self, op: OpCode, payload: Vec<u8>) -> Vec<u8> {
        let ts = self.next_ts();
        self.op_envelope_at(op, payload, ts)
    }

    fn op_envelope_at(&mut self, op: OpCode, payload: Vec<u8>, timestamp: i64) -> Vec<u8> {
        let key = self.session_key.expect("no session");

        let msg = Message {
            timestamp,
            response: false,
            op_code: op as i32,
            error: 0,
            payload: seal::ofb_encrypt(&key, &payload).unwrap(),
        };

        let ephemeral = self.ephemeral.clone();
        self.envelope(&msg, Some(&ephemeral))
    }

    fn decrypt_reply(&self, reply: &[u8]) -> Message {
        let env = Envelope::from_bytes(reply).unwrap();
        let mut msg = Message::from_bytes(&env.message).unwrap();

        if !msg.payload.is_empty() {
            msg.payload = seal::ofb_decrypt(&self.session_key.unwrap(), &msg.payload).unwrap();
        }

        msg
    }
}

fn reply_error(reply: &[u8]) -> i32 {
    let env = Envelope::from_bytes(reply).unwrap();
    Message::from_bytes(&env.message).unwrap().error
}

async fn paired_rig() -> (Rig, Mobile) {
    let mut rig = pairing_rig().await;
    let mut mobile = Mobile::new();

    let reply = rig.handler.handle_envelope(&mobile.pair_envelope(PAIRING_NONCE)).await;
    assert_eq!(reply_error(&reply), ErrorCode::Null as i32);

    (rig, mobile)
}

async fn session_rig() -> (Rig, Mobile) {
    let (mut rig, mut mobile) = paired_rig().await;

    let reply = rig.handler.handle_envelope(&mobile.session_envelope()).await;
    mobile.complete_session(&reply);

    (rig, mobile)
}

#[tokio::test]
async fn first_boot_pairing() {
    let (rig, mobile) = paired_rig().await;

    assert_eq!(rig.handler.keyring.conf.mobile_longterm, mobile.longterm_pub());
    assert!(!rig.handler.session.pairing_mode);

    // a follow-up envelope without a valid long-term signature is rejected
    let mut rig = rig;
    let mut mobile = mobile;
    let msg = Message {
        timestamp: mobile.next_ts(),
        response: false,
        op_code: OpCode::Status as i32,
        error: 0,
        payload: Vec::new(),
    };
    let unsigned = mobile.envelope(&msg, None);

    let reply = rig.handler.handle_envelope(&unsigned).await;
    assert_eq!(reply_error(&reply), ErrorCode::InvalidMessage as i32);
}

#[tokio::test]
async fn pair_rejects_nonce_mismatch() {
    let mut rig = pairing_rig().await;
    let mut mobile = Mobile::new();

    let reply = rig
        .handler
        .handle_envelope(&mobile.pair_envelope(PAIRING_NONCE ^ 1))
        .await;

    assert_eq!(
        reply_error(&reply),
        ErrorCode::PairingKeyNegotiationFailed as i32
    );
    assert!(rig.handler.session.pairing_mode);
    assert!(rig.handler.keyring.conf.mobile_longterm.is_empty());
}

#[tokio::test]
async fn pairing_mode_refuses_other_opcodes() {
    let mut rig = pairing_rig().await;
    let mut mobile = Mobile::new();

    let msg = Message {
        timestamp: mobile.next_ts(),
        response: false,
        op_code: OpCode::Status as i32,
        error: 0,
        payload: Vec::new(),
    };
    let env = mobile.envelope(&msg, None);

    let reply = rig.handler.handle_envelope(&env).await;
    assert_eq!(reply_error(&reply), ErrorCode::InvalidMessage as i32);
}

#[tokio::test(start_paused = true)]
async fn session_and_unlock() {
    let (mut rig, mut mobile) = session_rig().await;
    assert!(rig.handler.session.active);

    let kex = KeyExchange {
        key: vdrive_crypto::random(32),
        nonce: 0,
    };
    let unlock = mobile.op_envelope(OpCode::Unlock, kex.to_bytes());

    let started = tokio::time::Instant::now();
    let reply = rig.handler.handle_envelope(&unlock).await;

    // rate limit: an unlock takes at least one second end-to-end
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));

    assert_eq!(reply_error(&reply), ErrorCode::Null as i32);
    assert!(rig.drive.is_ready());
    assert!(rig.leds.is_on(vdrive_core::Led::White));
}

#[tokio::test(start_paused = true)]
async fn unlock_with_short_key_fails_locked() {
    let (mut rig, mut mobile) = session_rig().await;

    let kex = KeyExchange {
        key: vec![0u8; 8],
        nonce: 0,
    };
    let reply = rig
        .handler
        .handle_envelope(&mobile.op_envelope(OpCode::Unlock, kex.to_bytes()))
        .await;

    assert_eq!(reply_error(&reply), ErrorCode::InvalidMessage as i32);
    assert!(!rig.drive.is_ready());
    assert!(!rig.leds.is_on(vdrive_core::Led::White));
}

#[tokio::test(start_paused = true)]
async fn lock_clears_ready() {
    let (mut rig, mut mobile) = session_rig().await;

    let kex = KeyExchange {
        key: vdrive_crypto::random(32),
        nonce: 0,
    };
    rig.handler
        .handle_envelope(&mobile.op_envelope(OpCode::Unlock, kex.to_bytes()))
        .await;
    assert!(rig.drive.is_ready());

    let reply = rig
        .handler
        .handle_envelope(&mobile.op_envelope(OpCode::Lock, Vec::new()))
        .await;

    assert_eq!(reply_error(&reply), ErrorCode::Null as i32);
    assert!(!rig.drive.is_ready());
    assert!(!rig.drive.cipher_on());
    assert!(!rig.leds.is_on(vdrive_core::Led::White));
}

#[tokio::test]
async fn status_reports_capacity_and_lock_state() {
    let (mut rig, mut mobile) = session_rig().await;

    let reply = rig
        .handler
        .handle_envelope(&mobile.op_envelope(OpCode::Status, Vec::new()))
        .await;

    let msg = mobile.decrypt_reply(&reply);
    assert_eq!(msg.error, ErrorCode::Null as i32);

    let status = Status::from_bytes(&msg.payload).unwrap();
    assert_eq!(status.version, "0.4.0");
    assert_eq!(status.capacity, 2048 * 512);
    assert!(status.locked);
    assert_eq!(
        status.configuration.unwrap().cipher,
        Cipher::Aes128CbcPlain as i32
    );
}

#[tokio::test]
async fn replay_is_rejected_without_state_change() {
    let (mut rig, mut mobile) = session_rig().await;

    let envelope = mobile.op_envelope(OpCode::Status, Vec::new());

    let first = rig.handler.handle_envelope(&envelope).await;
    assert_eq!(reply_error(&first), ErrorCode::Null as i32);

    let floor = rig.handler.session.last;

    // identical envelope again: same timestamp, must be refused
    let second = rig.handler.handle_envelope(&envelope).await;
    assert_eq!(reply_error(&second), ErrorCode::InvalidMessage as i32);
    assert_eq!(rig.handler.session.last, floor);
    assert!(!rig.drive.is_ready());
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let (mut rig, mut mobile) = session_rig().await;

    let current = mobile.next_ts();
    let fresh = rig
        .handler
        .handle_envelope(&mobile.op_envelope_at(OpCode::Status, Vec::new(), current))
        .await;
    assert_eq!(reply_error(&fresh), ErrorCode::Null as i32);

    let stale = rig
        .handler
        .handle_envelope(&mobile.op_envelope_at(OpCode::Status, Vec::new(), current - 1))
        .await;
    assert_eq!(reply_error(&stale), ErrorCode::InvalidMessage as i32);
}

#[tokio::test]
async fn operation_without_session_is_invalid_session() {
    let (mut rig, mut mobile) = paired_rig().await;

    // signed with the long-term key, but no SESSION handshake happened
    let msg = Message {
        timestamp: mobile.next_ts(),
        response: false,
        op_code: OpCode::Status as i32,
        error: 0,
        payload: Vec::new(),
    };
    let longterm = mobile.longterm.clone();
    let env = mobile.envelope(&msg, Some(&longterm));

    let reply = rig.handler.handle_envelope(&env).await;
    assert_eq!(reply_error(&reply), ErrorCode::InvalidSession as i32);
}

#[tokio::test]
async fn session_rekey_invalidates_previous_ephemerals() {
    let (mut rig, mut mobile) = session_rig().await;
    let old_key = mobile.session_key.unwrap();
    let old_ephemeral = mobile.ephemeral.clone();

    // re-key with a fresh ephemeral
    mobile.ephemeral = SecretKey::random(&mut OsRng);
    let reply = rig.handler.handle_envelope(&mobile.session_envelope()).await;
    mobile.complete_session(&reply);

    assert_ne!(mobile.session_key.unwrap(), old_key);

    // an envelope signed with the superseded ephemeral no longer verifies
    mobile.session_key = Some(old_key);
    let msg = Message {
        timestamp: mobile.next_ts(),
        response: false,
        op_code: OpCode::Status as i32,
        error: 0,
        payload: seal::ofb_encrypt(&old_key, &[]).unwrap(),
    };
    let env = mobile.envelope(&msg, Some(&old_ephemeral));

    let reply = rig.handler.handle_envelope(&env).await;
    assert_eq!(reply_error(&reply), ErrorCode::InvalidMessage as i32);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let (mut rig, mut mobile) = session_rig().await;

    let mut envelope = mobile.op_envelope(OpCode::Status, Vec::new());
    // flip a byte inside the signed message
    envelope[10] ^= 0x01;

    let reply = rig.handler.handle_envelope(&envelope).await;
    assert_eq!(reply_error(&reply), ErrorCode::InvalidMessage as i32);
}

#[tokio::test]
async fn configuration_requires_locked_drive() {
    let (mut rig, mut mobile) = session_rig().await;

    let settings = vdrive_proto::wire::Configuration {
        cipher: Cipher::Aes256XtsPlain as i32,
    };
    let reply = rig
        .handler
        .handle_envelope(&mobile.op_envelope(OpCode::Configuration, settings.to_bytes()))
        .await;

    assert_eq!(reply_error(&reply), ErrorCode::Null as i32);
    assert_eq!(
        rig.handler.keyring.conf.settings.cipher,
        vdrive_crypto::CipherKind::Aes256XtsPlain
    );
}
