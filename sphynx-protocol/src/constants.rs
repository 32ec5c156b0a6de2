//! Wire constants for the handshake and transport chunk framing.
//!
//! Values here are bit-exact with the original implementation's
//! `sphynx::Common` header (see `DESIGN.md`), not invented.

/// Magic value opening every handshake packet.
pub const PROTOCOL_MAGIC: u32 = 0xC47D_0001;

/// Handshake packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    C2sHello = 85,
    S2cCookie = 24,
    C2sChallenge = 9,
    S2cAnswer = 108,
    S2cError = 162,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            85 => Some(Self::C2sHello),
            24 => Some(Self::S2cCookie),
            9 => Some(Self::C2sChallenge),
            108 => Some(Self::S2cAnswer),
            162 => Some(Self::S2cError),
            _ => None,
        }
    }
}

/// Reasons a server or client rejects or aborts a handshake in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeError {
    ClientOutOfMemory = 0,
    ClientInvalidKey = 1,
    ClientServerAddr = 2,
    ClientBrokenPipe = 3,
    ClientTimeout = 4,
    WrongKey = 0x7f,
    ServerFull = 0xa6,
    Tampering = 0xcc,
    Blocked = 0xb7,
    Shutdown = 0x3a,
    ServerError = 0x1f,
}

impl HandshakeError {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ClientOutOfMemory),
            1 => Some(Self::ClientInvalidKey),
            2 => Some(Self::ClientServerAddr),
            3 => Some(Self::ClientBrokenPipe),
            4 => Some(Self::ClientTimeout),
            0x7f => Some(Self::WrongKey),
            0xa6 => Some(Self::ServerFull),
            0xcc => Some(Self::Tampering),
            0xb7 => Some(Self::Blocked),
            0x3a => Some(Self::Shutdown),
            0x1f => Some(Self::ServerError),
            _ => None,
        }
    }
}

/// Runtime (post-handshake) disconnect reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    UserExit = 0,
    Timeout = 1,
    Tampering = 2,
    BrokenPipe = 3,
    Silent = 4,
}

pub const NUM_STREAMS: usize = 4;
pub const NUM_UNRELIABLE_STREAMS: usize = 16;
pub const BULK_STREAM: u8 = 3;
pub const MAX_MESSAGE_SIZE: usize = 65535;
pub const TRANSPORT_OVERHEAD: usize = 2;
pub const TIMEOUT_DISCONNECT_MS: i64 = 15_000;
pub const SILENCE_LIMIT_MS: i64 = 4_357;

/// Super-opcode of a reliable transport chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperOpcode {
    Data = 0,
    Frag = 1,
    Ack = 2,
    Internal = 3,
}

impl SuperOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v & 0b11 {
            0 => Some(Self::Data),
            1 => Some(Self::Frag),
            2 => Some(Self::Ack),
            3 => Some(Self::Internal),
            _ => unreachable!(),
        }
    }
}

/// INTERNAL super-opcode sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InternalOpcode {
    MtuProbe = 0,
    MtuSet = 1,
    TimePing = 2,
    TimePong = 3,
    Disco = 4,
}

impl InternalOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::MtuProbe),
            1 => Some(Self::MtuSet),
            2 => Some(Self::TimePing),
            3 => Some(Self::TimePong),
            4 => Some(Self::Disco),
            _ => None,
        }
    }
}

pub const MTU_FLOOR: usize = 576 - 28;
pub const MTU_CEILING: usize = 1500 - 28;

pub const COOKIE_BYTES: usize = 4;
pub const COOKIE_EPOCH_MS: i64 = 5_000;
pub const CONNECTION_FLOOD_THRESHOLD: u32 = 10;
