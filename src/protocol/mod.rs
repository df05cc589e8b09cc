//! Lobby protocol messages and the login handshake.
//!
//! `clientbound` and `serverbound` hold the opcode payload layouts for the
//! subset of the protocol the login flow needs; `runner` drives the
//! handshake state machine over a transport; `session` holds the inputs an
//! external login provider supplies.

pub mod clientbound;
pub mod runner;
pub mod serverbound;
pub mod session;

/// Opcode selector values for the login flow, as they appear on the wire.
pub mod opcode {
    /// Clientbound, fatal: structured login rejection.
    pub const LOGIN_ERROR: u16 = 2;
    /// Serverbound: select a service account.
    pub const SERVICE_LOGIN: u16 = 3;
    /// Serverbound: session credentials and version report.
    pub const LOGIN_EX: u16 = 5;
    /// Serverbound: character operations, including the travel token request.
    pub const CHARA_MAKE: u16 = 11;
    /// Clientbound, paginated: service accounts.
    pub const LOGIN_REPLY: u16 = 12;
    /// Clientbound, paginated: characters plus subscription info.
    pub const SERVICE_LOGIN_REPLY: u16 = 13;
    /// Clientbound: reply to a CHARA_MAKE request.
    pub const CHARA_MAKE_REPLY: u16 = 14;
    /// Clientbound, paginated: worlds.
    pub const DIST_WORLD_INFO: u16 = 21;
    /// Clientbound, paginated: legacy-service characters.
    pub const XI_CHARACTER_INFO: u16 = 22;
    /// Clientbound, paginated: retainers.
    pub const DIST_RETAINER_INFO: u16 = 23;
}

/// Operation tag inside CharaMake requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharaMakeOperation {
    ReserveName,
    MakeChara,
    RenameChara,
    DeleteChara,
    MoveChara,
    RemakeRetainer,
    RemakeChara,
    SettingsUploadBegin,
    SettingsUpload,
    WorldVisit,
    DatacenterToken,
    Disconnect,
    RetrieveCharaMakeData,
    Unknown(u8),
}

impl CharaMakeOperation {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x1 => Self::ReserveName,
            0x2 => Self::MakeChara,
            0x3 => Self::RenameChara,
            0x4 => Self::DeleteChara,
            0x5 => Self::MoveChara,
            0x6 => Self::RemakeRetainer,
            0x7 => Self::RemakeChara,
            0x8 => Self::SettingsUploadBegin,
            0xC => Self::SettingsUpload,
            0xE => Self::WorldVisit,
            0xF => Self::DatacenterToken,
            0x13 => Self::Disconnect,
            0x15 => Self::RetrieveCharaMakeData,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReserveName => 0x1,
            Self::MakeChara => 0x2,
            Self::RenameChara => 0x3,
            Self::DeleteChara => 0x4,
            Self::MoveChara => 0x5,
            Self::RemakeRetainer => 0x6,
            Self::RemakeChara => 0x7,
            Self::SettingsUploadBegin => 0x8,
            Self::SettingsUpload => 0xC,
            Self::WorldVisit => 0xE,
            Self::DatacenterToken => 0xF,
            Self::Disconnect => 0x13,
            Self::RetrieveCharaMakeData => 0x15,
            Self::Unknown(other) => other,
        }
    }
}
