//! # Frame Cipher
//!
//! Stream obfuscation applied to encrypted frames.
//!
//! Every encrypted payload is XORed with three things: a session key (either the
//! static key or a per-frame key derived from the MD5 key table), a row of one
//! of ten salt tables, and the salt entry for the frame's ordinal. A terminator
//! footer is appended before the transform and checked after it, and a 3-byte
//! trailer tells the receiver which derived key was used.
//!
//! ```text
//! sealed payload = XOR(plaintext ++ footer) ++ [selector trailer(3)]
//! footer         = 0x00            (static key)
//!                | 0x00, opcode    (derived key)
//! ```
//!
//! Client dialog opcodes (0x39, 0x3A) additionally carry a 6-byte dialog header
//! and a second XOR stream, opened after the generic pass.

use std::borrow::Cow;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use rand::Rng;

use crate::core::packet::{Direction, EncryptMethod, Frame};
use crate::error::{constants, ProtocolError, Result};

/// Static key handed to clients before they authenticate.
pub const DEFAULT_KEY: &[u8] = b"UrkcnItnI";

/// Number of salt tables; valid seeds are `0..SALT_SEEDS`.
pub const SALT_SEEDS: u8 = 10;

pub const KEY_TABLE_LEN: usize = 1024;
pub const DERIVED_KEY_LEN: usize = 9;
pub const TRAILER_LEN: usize = 3;
pub const DIALOG_HEADER_LEN: usize = 6;

/// Client opcodes whose payload carries the dialog layer.
pub const DIALOG_OPCODES: [u8; 2] = [0x39, 0x3A];

static SALT_TABLES: Lazy<[[u8; 256]; SALT_SEEDS as usize]> = Lazy::new(|| {
    let mut tables = [[0u8; 256]; SALT_SEEDS as usize];
    for (seed, table) in tables.iter_mut().enumerate() {
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (salt_value(seed, i as i32) & 0xFF) as u8;
        }
    }
    tables
});

fn salt_value(seed: usize, i: i32) -> i32 {
    let alternating = if i % 2 != 0 { -1 } else { 1 };
    match seed {
        0 => i,
        1 => alternating * ((i + 1) / 2) + 128,
        2 => 255 - i,
        3 => alternating * ((255 - i) / 2) + 128,
        4 => (i / 16) * (i / 16),
        5 => 2 * i % 256,
        6 => 255 - 2 * i % 256,
        7 => {
            if i > 127 {
                2 * i - 256
            } else {
                255 - 2 * i
            }
        }
        8 => {
            if i > 127 {
                511 - 2 * i
            } else {
                2 * i
            }
        }
        _ => 255 - ((i - 128) / 8 * ((i - 128) / 8)) % 256,
    }
}

/// Salt table for `seed`.
pub fn salt_table(seed: u8) -> Result<&'static [u8; 256]> {
    SALT_TABLES
        .get(seed as usize)
        .ok_or(ProtocolError::InvalidSeed(seed))
}

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for byte in digest.iter() {
        // Writing into a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// 1024-byte table the per-frame keys are drawn from.
///
/// Generated from the authenticated character name, so it only exists once a
/// session has completed the join handoff.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTable(Box<[u8; KEY_TABLE_LEN]>);

impl KeyTable {
    pub fn generate(seed: &str) -> Self {
        let mut text = md5_hex(seed.as_bytes());
        text = md5_hex(text.as_bytes());
        for _ in 0..31 {
            let next = md5_hex(text.as_bytes());
            text.push_str(&next);
        }

        let mut table = Box::new([0u8; KEY_TABLE_LEN]);
        table.copy_from_slice(&text.as_bytes()[..KEY_TABLE_LEN]);
        Self(table)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Key selected by a frame trailer.
    pub fn derive_key(&self, selector: KeySelector) -> [u8; DERIVED_KEY_LEN] {
        let b = selector.b_rand as usize;
        let s = selector.s_rand as usize;
        let mut key = [0u8; DERIVED_KEY_LEN];
        for (i, slot) in key.iter_mut().enumerate() {
            *slot = self.0[(i * (9 * i + s * s) + b) % KEY_TABLE_LEN];
        }
        key
    }
}

impl fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTable").finish_non_exhaustive()
    }
}

/// The pair of random values carried in a frame trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySelector {
    pub b_rand: u16,
    pub s_rand: u8,
}

impl KeySelector {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            b_rand: rng.random_range(256..65533),
            s_rand: rng.random_range(100..255),
        }
    }

    fn masks(producer: Direction) -> (u8, u8, u8) {
        match producer {
            Direction::Server => (0x74, 0x24, 0x64),
            Direction::Client => (0x70, 0x23, 0x74),
        }
    }

    /// Trailer bytes as written by `producer`.
    pub fn encode(self, producer: Direction) -> [u8; TRAILER_LEN] {
        let (lo, mid, hi) = Self::masks(producer);
        [
            (self.b_rand & 0xFF) as u8 ^ lo,
            self.s_rand ^ mid,
            (self.b_rand >> 8) as u8 ^ hi,
        ]
    }

    pub fn decode(trailer: [u8; TRAILER_LEN], producer: Direction) -> Self {
        let (lo, mid, hi) = Self::masks(producer);
        Self {
            b_rand: u16::from_be_bytes([trailer[2] ^ hi, trailer[0] ^ lo]),
            s_rand: trailer[1] ^ mid,
        }
    }
}

/// The XOR pass shared by sealing and opening.
pub fn transform(data: &mut [u8], key: &[u8], salt: &[u8; 256], ordinal: u8) {
    if key.is_empty() {
        return;
    }
    let ordinal = ordinal as usize;
    for (i, byte) in data.iter_mut().enumerate() {
        let row = (i / key.len()) % salt.len();
        *byte ^= key[i % key.len()];
        *byte ^= salt[row];
        if row != ordinal {
            *byte ^= salt[ordinal];
        }
    }
}

/// Key material for one session.
#[derive(Debug, Clone)]
pub struct Cipher {
    seed: u8,
    key: Vec<u8>,
    table: Option<Arc<KeyTable>>,
}

impl Cipher {
    pub fn new(seed: u8, key: impl Into<Vec<u8>>) -> Result<Self> {
        salt_table(seed)?;
        let key = key.into();
        if key.is_empty() {
            return Err(ProtocolError::KeysNotEstablished(constants::ERR_KEY_MISSING));
        }
        Ok(Self {
            seed,
            key,
            table: None,
        })
    }

    /// Seed 0 with the well-known pre-login key.
    pub fn lobby_default() -> Self {
        Self {
            seed: 0,
            key: DEFAULT_KEY.to_vec(),
            table: None,
        }
    }

    pub fn with_key_table(mut self, table: KeyTable) -> Self {
        self.table = Some(Arc::new(table));
        self
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_table(&self) -> Option<&KeyTable> {
        self.table.as_deref()
    }

    /// Whether frames using `method` can be sealed and opened.
    pub fn supports(&self, method: EncryptMethod) -> bool {
        method != EncryptMethod::Md5Key || self.table.is_some()
    }

    fn key_for(&self, method: EncryptMethod, selector: KeySelector) -> Result<Cow<'_, [u8]>> {
        match method {
            EncryptMethod::Md5Key => {
                let table = self.table.as_ref().ok_or(ProtocolError::KeysNotEstablished(
                    constants::ERR_KEY_TABLE_MISSING,
                ))?;
                Ok(Cow::Owned(table.derive_key(selector).to_vec()))
            }
            _ => Ok(Cow::Borrowed(&self.key)),
        }
    }

    /// Encrypt `frame` for the wire, stamping `ordinal`.
    ///
    /// Frames whose opcode is not encrypted are returned unchanged.
    pub fn seal<R: Rng + ?Sized>(&self, frame: &Frame, ordinal: u8, rng: &mut R) -> Result<Frame> {
        let method = frame.encrypt_method();
        if !method.is_encrypted() {
            return Ok(frame.clone());
        }

        let mut data = frame.payload.clone();
        if frame.direction == Direction::Client && DIALOG_OPCODES.contains(&frame.opcode) {
            generate_dialog_header(&mut data, rng)?;
            encrypt_dialog(&mut data)?;
        }

        data.push(0x00);
        if method == EncryptMethod::Md5Key {
            data.push(frame.opcode);
        }

        let selector = KeySelector::random(rng);
        let key = self.key_for(method, selector)?;
        transform(&mut data, &key, salt_table(self.seed)?, ordinal);
        data.extend_from_slice(&selector.encode(frame.direction));

        Ok(Frame {
            ordinal,
            payload: data,
            ..frame.clone()
        })
    }

    /// Decrypt a sealed frame and verify its footer.
    pub fn open(&self, frame: &Frame) -> Result<Frame> {
        let method = frame.encrypt_method();
        if !method.is_encrypted() {
            return Ok(frame.clone());
        }
        if frame.payload.len() < TRAILER_LEN {
            return Err(ProtocolError::MalformedFrame(constants::ERR_TRAILER_MISSING));
        }

        let split = frame.payload.len() - TRAILER_LEN;
        let trailer = [
            frame.payload[split],
            frame.payload[split + 1],
            frame.payload[split + 2],
        ];
        let selector = KeySelector::decode(trailer, frame.direction);
        let key = self.key_for(method, selector)?;

        let mut data = frame.payload[..split].to_vec();
        transform(&mut data, &key, salt_table(self.seed)?, frame.ordinal);

        let footer: &[u8] = match method {
            EncryptMethod::Md5Key => &[0x00, frame.opcode],
            _ => &[0x00],
        };
        if !data.ends_with(footer) {
            return Err(ProtocolError::IntegrityFailure(frame.opcode));
        }
        data.truncate(data.len() - footer.len());

        if frame.direction == Direction::Client && DIALOG_OPCODES.contains(&frame.opcode) {
            decrypt_dialog(&mut data)?;
        }

        Ok(Frame {
            payload: data,
            ..frame.clone()
        })
    }
}

const fn dialog_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static DIALOG_CRC_TABLE: [u16; 256] = dialog_crc_table();

/// Checksum stored in the dialog header.
pub fn dialog_crc(body: &[u8]) -> u16 {
    body.iter().fold(0u16, |crc, &byte| {
        byte as u16 ^ (crc << 8) ^ DIALOG_CRC_TABLE[(crc >> 8) as usize]
    })
}

fn dialog_stream(data: &[u8]) -> (u8, u8) {
    let x_prime = data[0].wrapping_sub(0x2D);
    let x = data[1] ^ x_prime;
    (x.wrapping_add(0x72), x.wrapping_add(0x28))
}

fn check_dialog_len(data: &[u8], length: usize) -> Result<()> {
    if data.len() < DIALOG_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(constants::ERR_DIALOG_HEADER));
    }
    if 4 + length > data.len() {
        return Err(ProtocolError::MalformedFrame(constants::ERR_DIALOG_LENGTH));
    }
    Ok(())
}

/// Fill the first six bytes of `data` with a fresh dialog header.
pub fn generate_dialog_header<R: Rng + ?Sized>(data: &mut [u8], rng: &mut R) -> Result<()> {
    if data.len() < DIALOG_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(constants::ERR_DIALOG_HEADER));
    }
    let crc = dialog_crc(&data[DIALOG_HEADER_LEN..]);
    let length = (data.len() - 4) as u16;
    data[0] = rng.random();
    data[1] = rng.random();
    data[2..4].copy_from_slice(&length.to_be_bytes());
    data[4..6].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

pub fn encrypt_dialog(data: &mut [u8]) -> Result<()> {
    if data.len() < DIALOG_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(constants::ERR_DIALOG_HEADER));
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    check_dialog_len(data, length)?;

    let (y, z) = dialog_stream(data);
    data[2] ^= y;
    data[3] ^= y.wrapping_add(1);
    for i in 0..length {
        data[4 + i] ^= z.wrapping_add(i as u8);
    }
    Ok(())
}

pub fn decrypt_dialog(data: &mut [u8]) -> Result<()> {
    if data.len() < DIALOG_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(constants::ERR_DIALOG_HEADER));
    }
    let (y, z) = dialog_stream(data);
    let length = u16::from_be_bytes([data[2] ^ y, data[3] ^ y.wrapping_add(1)]) as usize;
    check_dialog_len(data, length)?;

    data[2] ^= y;
    data[3] ^= y.wrapping_add(1);
    for i in 0..length {
        data[4 + i] ^= z.wrapping_add(i as u8);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn salt_tables_match_reference_values() {
        let t0 = salt_table(0).unwrap();
        assert_eq!(t0[0], 0);
        assert_eq!(t0[255], 255);

        let t1 = salt_table(1).unwrap();
        assert_eq!(&t1[..4], &[128, 127, 129, 126]);

        let t2 = salt_table(2).unwrap();
        assert_eq!(t2[0], 255);

        let t4 = salt_table(4).unwrap();
        assert_eq!(t4[255], 225);

        let t7 = salt_table(7).unwrap();
        assert_eq!((t7[0], t7[128]), (255, 0));

        let t9 = salt_table(9).unwrap();
        assert_eq!((t9[0], t9[128]), (255, 255));

        assert!(matches!(salt_table(10), Err(ProtocolError::InvalidSeed(10))));
    }

    #[test]
    fn key_table_is_chained_md5_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");

        let table = KeyTable::generate("Aisling");
        let first = md5_hex(md5_hex(b"Aisling").as_bytes());
        assert_eq!(&table.as_bytes()[..32], first.as_bytes());
        assert_eq!(
            &table.as_bytes()[32..64],
            md5_hex(first.as_bytes()).as_bytes()
        );
        assert!(table.as_bytes().iter().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn derived_key_indexes_table() {
        let table = KeyTable::generate("Aisling");
        let selector = KeySelector {
            b_rand: 1000,
            s_rand: 100,
        };
        let key = table.derive_key(selector);
        assert_eq!(key[0], table.as_bytes()[1000 % 1024]);
        assert_eq!(key[1], table.as_bytes()[(9 + 10_000 + 1000) % 1024]);
    }

    #[test]
    fn selector_trailer_masks_depend_on_producer() {
        let selector = KeySelector {
            b_rand: 0x1234,
            s_rand: 0x99,
        };
        let server = selector.encode(Direction::Server);
        assert_eq!(server, [0x34 ^ 0x74, 0x99 ^ 0x24, 0x12 ^ 0x64]);
        assert_eq!(KeySelector::decode(server, Direction::Server), selector);

        let client = selector.encode(Direction::Client);
        assert_eq!(client, [0x34 ^ 0x70, 0x99 ^ 0x23, 0x12 ^ 0x74]);
        assert_eq!(KeySelector::decode(client, Direction::Client), selector);
    }

    #[test]
    fn static_key_known_answer() {
        // Seed 0 salt is the identity, so with ordinal 0 the first key block
        // is XORed with the key alone.
        let cipher = Cipher::lobby_default();
        let mut rng = StdRng::seed_from_u64(7);
        let sealed = cipher
            .seal(&Frame::server(0x0A, vec![0x10]), 0, &mut rng)
            .unwrap();
        assert_eq!(sealed.payload[0], 0x10 ^ b'U');
        assert_eq!(sealed.payload[1], b'r');
        assert_eq!(sealed.payload.len(), 1 + 1 + TRAILER_LEN);
    }

    #[test]
    fn seal_then_open_both_methods() {
        let cipher = Cipher::new(3, b"abcdefghi".to_vec())
            .unwrap()
            .with_key_table(KeyTable::generate("Aisling"));
        let mut rng = StdRng::seed_from_u64(42);

        for opcode in [0x0A_u8, 0x3B, 0x33] {
            let frame = Frame::server(opcode, b"payload bytes".to_vec());
            let sealed = cipher.seal(&frame, 17, &mut rng).unwrap();
            assert_ne!(sealed.payload, frame.payload);
            let opened = cipher.open(&sealed).unwrap();
            assert_eq!(opened.payload, frame.payload);
            assert_eq!(opened.ordinal, 17);
        }
    }

    #[test]
    fn corrupted_footer_is_detected() {
        let cipher = Cipher::lobby_default();
        let mut rng = StdRng::seed_from_u64(1);
        let frame = Frame::client(0x57, vec![0x00, 0x00]);
        let mut sealed = cipher.seal(&frame, 4, &mut rng).unwrap();
        sealed.payload[2] ^= 0xFF;
        assert!(matches!(
            cipher.open(&sealed),
            Err(ProtocolError::IntegrityFailure(0x57))
        ));
    }

    #[test]
    fn derived_key_requires_table() {
        let cipher = Cipher::lobby_default();
        let mut rng = StdRng::seed_from_u64(1);
        let frame = Frame::client(0x45, vec![1, 2]);
        assert!(!cipher.supports(frame.encrypt_method()));
        assert!(matches!(
            cipher.seal(&frame, 0, &mut rng),
            Err(ProtocolError::KeysNotEstablished(_))
        ));
    }

    #[test]
    fn dialog_layer_round_trips() {
        let cipher = Cipher::lobby_default();
        let mut rng = StdRng::seed_from_u64(9);
        let mut payload = vec![0u8; DIALOG_HEADER_LEN];
        payload.extend_from_slice(b"\x01\x00\x00\x00\x05menu");
        let frame = Frame::client(0x3A, payload.clone());

        let sealed = cipher.seal(&frame, 2, &mut rng).unwrap();
        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(&opened.payload[DIALOG_HEADER_LEN..], &payload[DIALOG_HEADER_LEN..]);

        let length = u16::from_be_bytes([opened.payload[2], opened.payload[3]]) as usize;
        assert_eq!(length, payload.len() - 4);
        let crc = u16::from_be_bytes([opened.payload[4], opened.payload[5]]);
        assert_eq!(crc, dialog_crc(&payload[DIALOG_HEADER_LEN..]));
    }

    #[test]
    fn dialog_rejects_short_payloads() {
        let mut data = vec![0u8; 4];
        assert!(decrypt_dialog(&mut data).is_err());
    }

    #[test]
    fn crc_table_is_ccitt() {
        assert_eq!(DIALOG_CRC_TABLE[1], 0x1021);
        assert_eq!(DIALOG_CRC_TABLE[16], 0x1231);
        assert_eq!(DIALOG_CRC_TABLE[255], 0x1EF0);
    }
}
