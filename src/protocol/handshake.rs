//! # Handshake & Tier Handoff
//!
//! Wire formats and built-in handlers for the pre-game key exchange.
//!
//! ## Flow
//! ```text
//! lobby:  accept  ──▶ 0x7E welcome
//!         0x00    ──▶ 0x00 crypto params (seed, key)
//!         0x57    ──▶ 0x56 server table       (client table out of date)
//!                 ──▶ 0x03 redirect to login  (otherwise)
//! login/world:
//!         0x10 join (seed, key, name, redirect id) ──▶ redirect claimed, keys adopted
//! ```
//!
//! The join itself is consumed by the session core (see
//! [`Session::handle_join`](crate::service::session::Session::handle_join));
//! this module only knows how the frames look.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::core::packet::Frame;
use crate::core::wire::{FrameReader, FrameWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::service::session::Session;
use crate::service::tier::{ProtocolTier, Tier, TierBuilder};
use crate::utils::crypto::Cipher;

/// Opcodes sent by clients that the core understands.
pub mod client_op {
    pub const VERSION: u8 = 0x00;
    pub const JOIN: u8 = 0x10;
    pub const BYTE_HEARTBEAT_ECHO: u8 = 0x45;
    pub const REQUEST_SERVER_TABLE: u8 = 0x57;
    pub const TICK_HEARTBEAT_ECHO: u8 = 0x75;
}

/// Opcodes the core sends.
pub mod server_op {
    pub const CRYPTO_PARAMS: u8 = 0x00;
    pub const REDIRECT: u8 = 0x03;
    pub const SYSTEM_MESSAGE: u8 = 0x0A;
    pub const BYTE_HEARTBEAT: u8 = 0x3B;
    pub const SERVER_TABLE: u8 = 0x56;
    pub const TICK_HEARTBEAT: u8 = 0x68;
    pub const WELCOME: u8 = 0x7E;
}

/// System message kind shown in the client's message box.
pub const SYSTEM_WITH_OVERHEAD: u8 = 3;

pub const ABUSE_MESSAGE: &str =
    "You have been automatically disconnected due to server abuse. Goodbye!";

/// Name carried by the lobby-to-login redirect, before any character is known.
pub const LOBBY_REDIRECT_NAME: &str = "socket";

pub fn welcome_frame() -> Frame {
    let mut w = FrameWriter::new();
    w.u8(0x1B).raw_str("CONNECTED SERVER\n");
    Frame::server(server_op::WELCOME, w.finish())
}

pub fn crypto_params_frame(table_crc: u32, cipher: &Cipher) -> Frame {
    let mut w = FrameWriter::new();
    w.u8(0x00)
        .u32(table_crc)
        .u8(cipher.seed())
        .u8(cipher.key().len() as u8)
        .bytes(cipher.key());
    Frame::server(server_op::CRYPTO_PARAMS, w.finish())
}

pub fn system_message(kind: u8, text: &str) -> Frame {
    let mut w = FrameWriter::new();
    w.u8(kind).string16(text);
    Frame::server(server_op::SYSTEM_MESSAGE, w.finish())
}

/// Server list handed out by the lobby, already in client format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTable {
    /// Checksum clients compare against their cached copy
    pub crc: u32,
    pub data: Vec<u8>,
}

impl ServerTable {
    pub fn to_frame(&self) -> Frame {
        let len = self.data.len().min(u16::MAX as usize);
        let mut w = FrameWriter::with_capacity(len + 2);
        w.u16(len as u16).bytes(&self.data[..len]);
        Frame::server(server_op::SERVER_TABLE, w.finish())
    }
}

/// Contents of a 0x03 redirect frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTicket {
    pub address: Ipv4Addr,
    pub port: u16,
    pub seed: u8,
    pub key: Vec<u8>,
    pub name: String,
    pub id: u32,
}

impl RedirectTicket {
    /// Bytes after the length field: seed, key, name and id with their prefixes.
    pub fn fields_len(&self) -> usize {
        self.key.len() + self.name.len() + 7
    }

    /// Whether the ticket encodes without truncating the key or name.
    pub fn fits(&self) -> bool {
        self.fields_len() <= u8::MAX as usize
    }

    pub fn to_frame(&self) -> Frame {
        let mut octets = self.address.octets();
        octets.reverse();
        let key_len = self.key.len().min(u8::MAX as usize);
        let name_len = self.name.len().min(u8::MAX as usize);
        let remaining = (key_len + name_len + 7).min(u8::MAX as usize) as u8;

        let mut w = FrameWriter::new();
        w.bytes(&octets)
            .u16(self.port)
            .u8(remaining)
            .u8(self.seed)
            .u8(key_len as u8)
            .bytes(&self.key[..key_len])
            .string8(&self.name)
            .u32(self.id);
        Frame::server(server_op::REDIRECT, w.finish())
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut r = frame.reader();
        let mut octets = [0u8; 4];
        octets.copy_from_slice(r.bytes(4)?);
        octets.reverse();
        let port = r.u16()?;
        let _remaining = r.u8()?;
        let seed = r.u8()?;
        let key_len = r.u8()? as usize;
        let key = r.bytes(key_len)?.to_vec();
        let name = r.string8()?;
        let id = r.u32()?;
        Ok(Self {
            address: Ipv4Addr::from(octets),
            port,
            seed,
            key,
            name,
            id,
        })
    }
}

/// Contents of a 0x10 join frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJoin {
    pub seed: u8,
    pub key: Vec<u8>,
    pub name: String,
    pub redirect_id: u32,
}

impl ClientJoin {
    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut r: FrameReader<'_> = frame.reader();
        let seed = r.u8()?;
        let key_len = r.u8()? as usize;
        let key = r.bytes(key_len)?.to_vec();
        let name = r.string8()?;
        let redirect_id = r.u32()?;
        Ok(Self {
            seed,
            key,
            name,
            redirect_id,
        })
    }

    /// The join a client sends after following `ticket`.
    pub fn from_ticket(ticket: &RedirectTicket) -> Self {
        Self {
            seed: ticket.seed,
            key: ticket.key.clone(),
            name: ticket.name.clone(),
            redirect_id: ticket.id,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let key_len = self.key.len().min(u8::MAX as usize);
        let mut w = FrameWriter::new();
        w.u8(self.seed)
            .u8(key_len as u8)
            .bytes(&self.key[..key_len])
            .string8(&self.name)
            .u32(self.redirect_id);
        Frame::client(client_op::JOIN, w.finish())
    }
}

/// Result of presenting a join to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The redirect matched and was consumed; the session adopted its keys.
    Accepted {
        redirect_id: u32,
        source: ProtocolTier,
    },
    /// No pending redirect matched the presented credentials.
    Rejected { redirect_id: u32 },
    /// The session already claimed a redirect; nothing was consumed.
    AlreadyAuthenticated { redirect_id: u32 },
}

/// Install the lobby greeting and handlers on `builder`.
///
/// Clients whose server table is current are redirected to `login`.
pub fn install_lobby(builder: TierBuilder, login: Arc<Tier>, table: Arc<ServerTable>) -> TierBuilder {
    let version_table = Arc::clone(&table);
    builder
        .welcome(welcome_frame())
        .handler(client_op::VERSION, move |session, frame| {
            client_version(session, frame, &version_table)
        })
        .handler(client_op::REQUEST_SERVER_TABLE, move |session, frame| {
            request_server_table(session, frame, &table, &login)
        })
}

#[instrument(skip_all, fields(connection_id = session.id()))]
fn client_version(session: &Arc<Session>, frame: &Frame, table: &ServerTable) -> Result<Vec<Frame>> {
    if let Ok(version) = frame.reader().u16() {
        debug!(version, "client version");
    }
    let cipher = session
        .cipher()
        .ok_or(ProtocolError::KeysNotEstablished(constants::ERR_KEY_MISSING))?;
    Ok(vec![crypto_params_frame(table.crc, &cipher)])
}

#[instrument(skip_all, fields(connection_id = session.id()))]
fn request_server_table(
    session: &Arc<Session>,
    frame: &Frame,
    table: &ServerTable,
    login: &Tier,
) -> Result<Vec<Frame>> {
    let mut r = frame.reader();
    if r.u8()? == 1 {
        debug!(len = table.data.len(), "sending server table");
        return Ok(vec![table.to_frame()]);
    }

    let server = r.u8().unwrap_or(0);
    let redirect_id = session.redirect(login, LOBBY_REDIRECT_NAME)?;
    info!(server, redirect_id, "redirecting to login");
    Ok(Vec::new())
}
