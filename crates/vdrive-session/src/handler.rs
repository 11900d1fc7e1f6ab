use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use vdrive_core::{Led, Leds, VdriveError, VdriveResult};
use vdrive_crypto::sign::EcdsaSig;
use vdrive_crypto::{CipherKind, KeyIndex, Keyring};
use vdrive_fde::Drive;
use vdrive_proto::wire::{
    Configuration, Envelope, ErrorCode, KeyExchange, Message, OpCode, Signature, Status,
};

use crate::session::{now_ms, Session};
use crate::{cipher_from_wire, cipher_to_wire};

/// Drives one BLE peer: envelope pipeline plus opcode handlers.
pub struct Handler {
    pub keyring: Keyring,
    pub session: Session,
    drive: Arc<Drive>,
    leds: Arc<dyn Leds>,
    /// Fired when a pairing concludes (PAIR accepted, or pairing disk ejected)
    pairing_complete: Arc<Notify>,
    /// Serializes UNLOCK attempts; held across the rate-limit sleep
    unlock_gate: Arc<Mutex<()>>,
    revision: String,
}

impl Handler {
    pub fn new(
        keyring: Keyring,
        drive: Arc<Drive>,
        leds: Arc<dyn Leds>,
        pairing_complete: Arc<Notify>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            keyring,
            session: Session::default(),
            drive,
            leds,
            pairing_complete,
            unlock_gate: Arc::new(Mutex::new(())),
            revision: revision.into(),
        }
    }

    /// Enter pairing-advertising state with a fresh nonce.
    pub fn start_pairing(&mut self, nonce: u64) {
        self.session.pairing_mode = true;
        self.session.pairing_nonce = nonce;
    }

    /// Process one reassembled envelope and produce the signed response
    /// envelope. An empty return means no response could be produced
    /// (signing or encryption of the response itself failed).
    pub async fn handle_envelope(&mut self, req: &[u8]) -> Vec<u8> {
        let mut res = Message {
            response: true,
            ..Default::default()
        };

        match self.parse_envelope(req) {
            Ok(req_msg) => {
                res.op_code = req_msg.op_code;
                self.dispatch(&req_msg, &mut res).await;
            }
            Err(VdriveError::InvalidSession) => {
                debug!("envelope rejected: no active session");
                res.set_error(ErrorCode::InvalidSession);
            }
            Err(e) => {
                debug!("envelope rejected: {e}");
                res.set_error(ErrorCode::InvalidMessage);
            }
        }

        self.finalize(res)
    }

    /// Decode → (re-key on SESSION) → verify → decrypt → replay-check.
    fn parse_envelope(&mut self, buf: &[u8]) -> VdriveResult<Message> {
        let env = Envelope::from_bytes(buf)?;
        let mut msg = Message::from_bytes(&env.message)?;
        let op = msg.op_code();

        // a SESSION opcode always re-keys: previous session material is gone
        if op == OpCode::Session {
            self.keyring.clear_session_keys();
            self.session.reset();
        }

        if !self.session.pairing_mode && self.keyring.has_mobile_longterm() {
            let sig = env
                .signature
                .as_ref()
                .ok_or_else(|| VdriveError::InvalidMessage("unsigned envelope".into()))?;

            let sig = EcdsaSig::from_wire(&sig.data, &sig.r, &sig.s)?;
            self.keyring.verify(&env.message, &sig, self.session.active)?;
        }

        if op != OpCode::Pair && op != OpCode::Session && !self.session.pairing_mode {
            if !self.session.active {
                return Err(VdriveError::InvalidSession);
            }

            msg.payload = self.keyring.decrypt_session(&msg.payload)?;
        }

        if msg.timestamp <= self.session.last {
            return Err(VdriveError::InvalidMessage("stale timestamp".into()));
        }

        self.session.last = msg.timestamp;

        Ok(msg)
    }

    /// Stamp, encrypt and sign the response. SESSION activation happens only
    /// once the response is signed.
    fn finalize(&mut self, mut res: Message) -> Vec<u8> {
        res.response = true;
        res.timestamp = self.session.time();

        let op = res.op_code();

        if op != OpCode::Pair && op != OpCode::Session {
            match self.keyring.encrypt_session(&res.payload) {
                Ok(payload) => res.payload = payload,
                Err(e) => {
                    warn!("response encryption failed: {e}");
                    return Vec::new();
                }
            }
        }

        let message = res.to_bytes();

        let sig = match self.keyring.sign(&message, self.session.active) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("response signing failed: {e}");
                return Vec::new();
            }
        };

        if op == OpCode::Session && res.error == ErrorCode::Null as i32 {
            self.session.active = true;
        }

        Envelope {
            message,
            signature: Some(Signature {
                data: sig.digest.to_vec(),
                r: sig.r.to_vec(),
                s: sig.s.to_vec(),
            }),
        }
        .to_bytes()
    }

    async fn dispatch(&mut self, req: &Message, res: &mut Message) {
        if self.session.pairing_mode {
            if req.op_code() != OpCode::Pair {
                res.set_error(ErrorCode::InvalidMessage);
                return;
            }

            self.pair(req, res).await;
            return;
        }

        if !self.keyring.has_mobile_longterm() {
            res.set_error(ErrorCode::InvalidMessage);
            return;
        }

        if req.op_code() == OpCode::Session {
            self.new_session(req, res);
            return;
        }

        if !self.session.active {
            res.set_error(ErrorCode::InvalidSession);
            return;
        }

        match req.op_code() {
            OpCode::Unlock => self.unlock(req, res).await,
            OpCode::Lock => self.lock(res),
            OpCode::Status => self.status(res),
            OpCode::Configuration => self.configuration(req, res).await,
            _ => res.set_error(ErrorCode::InvalidMessage),
        }
    }

    /// PAIR: bind the peer's long-term key, rotate our own, persist both.
    async fn pair(&mut self, req: &Message, res: &mut Message) {
        let Ok(kex) = KeyExchange::from_bytes(&req.payload) else {
            res.set_error(ErrorCode::InvalidMessage);
            return;
        };

        let result = self.pair_inner(&kex).await;

        if result.is_err() {
            res.set_error(ErrorCode::PairingKeyNegotiationFailed);
            return;
        }

        info!("pairing complete");
        self.session.pairing_mode = false;
        self.pairing_complete.notify_waiters();
    }

    async fn pair_inner(&mut self, kex: &KeyExchange) -> VdriveResult<()> {
        if kex.nonce != self.session.pairing_nonce {
            return Err(VdriveError::Keyring("pairing nonce mismatch".into()));
        }

        self.keyring.import(KeyIndex::MdLongterm, false, &kex.key)?;

        // The pairing holds: overwrite the previous keyring with the UA
        // long-term key generated for this advertisement, then persist the
        // received peer key.
        self.keyring.init(true).await?;
        self.keyring.conf.mobile_longterm = kex.key.clone();
        self.keyring.save().await
    }

    /// SESSION: ECDH key agreement, skew capture, ephemeral reply.
    fn new_session(&mut self, req: &Message, res: &mut Message) {
        let Ok(kex) = KeyExchange::from_bytes(&req.payload) else {
            res.set_error(ErrorCode::InvalidMessage);
            return;
        };

        match self.session_inner(req, &kex) {
            Ok(reply) => res.payload = reply.to_bytes(),
            Err(e) => {
                debug!("session negotiation failed: {e}");
                self.keyring.clear_session_keys();
                self.session.reset();
                res.set_error(ErrorCode::SessionKeyNegotiationFailed);
            }
        }
    }

    fn session_inner(&mut self, req: &Message, kex: &KeyExchange) -> VdriveResult<KeyExchange> {
        self.keyring.import(KeyIndex::MdEphemeral, false, &kex.key)?;

        let nonce = vdrive_crypto::random(8);
        self.keyring.new_session_keys(&nonce)?;

        let key = self.keyring.export(KeyIndex::UaEphemeral, false)?;

        self.session.skew_ms = req.timestamp - now_ms();

        Ok(KeyExchange {
            key,
            nonce: u64::from_be_bytes(nonce.try_into().expect("8 byte nonce")),
        })
    }

    /// UNLOCK: derive the BEK from the supplied material and arm the FDE
    /// pipeline. Serialized and padded to at least one second per attempt.
    async fn unlock(&mut self, req: &Message, res: &mut Message) {
        let gate = self.unlock_gate.clone();
        let _gate = gate.lock().await;

        let outcome = self.unlock_inner(req, res);

        let ready = outcome.is_ok();
        self.leds.set(Led::White, ready);

        // rate limit unlock attempts
        tokio::time::sleep(Duration::from_secs(1)).await;

        if ready {
            info!(cipher = ?self.keyring.conf.settings.cipher, "drive unlocked");
        }
    }

    fn unlock_inner(&mut self, req: &Message, res: &mut Message) -> VdriveResult<()> {
        self.drive.lock();

        let kex = KeyExchange::from_bytes(&req.payload).map_err(|e| {
            res.set_error(ErrorCode::InvalidMessage);
            e
        })?;

        if kex.key.len() < 16 {
            res.set_error(ErrorCode::InvalidMessage);
            return Err(VdriveError::InvalidMessage("short unlock key".into()));
        }

        let kind = self.keyring.conf.settings.cipher;

        let cipher = self.keyring.set_cipher(kind, &kex.key).map_err(|e| {
            res.set_error(ErrorCode::UnlockFailed);
            e
        })?;

        self.drive.unlock(cipher);
        Ok(())
    }

    /// LOCK: invalidate the drive no matter what.
    fn lock(&mut self, res: &mut Message) {
        self.drive.lock();

        let result = self.keyring.set_cipher(CipherKind::None, &[0u8; 16]);
        self.leds.set(Led::White, false);

        if result.is_err() {
            res.set_error(ErrorCode::GenericError);
        } else {
            info!("drive locked");
        }
    }

    fn status(&self, res: &mut Message) {
        let info = self.drive.physical_info();

        let status = Status {
            version: self.revision.clone(),
            capacity: info.capacity(),
            locked: !self.drive.is_ready(),
            configuration: Some(Configuration {
                cipher: cipher_to_wire(self.keyring.conf.settings.cipher) as i32,
            }),
        };

        res.payload = status.to_bytes();
    }

    /// CONFIGURATION: replace settings; only accepted while locked.
    async fn configuration(&mut self, req: &Message, res: &mut Message) {
        let settings = Configuration::from_bytes(&req.payload);

        let (Ok(settings), false) = (settings, self.drive.is_ready()) else {
            res.set_error(ErrorCode::InvalidMessage);
            return;
        };

        self.keyring.conf.settings.cipher = cipher_from_wire(settings.cipher());

        if let Err(e) = self.keyring.save().await {
            warn!("configuration persist failed: {e}");
        }
    }
}
