//! Inputs supplied by external collaborators.
//!
//! The OAuth login provider, version caches, and patch services that produce
//! these values live outside this crate; the handshake only consumes them.

use crate::error::{ProtocolError, Result};

/// Length the server requires of a session id, in ASCII bytes.
pub const SESSION_ID_LEN: usize = 32;

/// Credentials from an external login provider.
#[derive(Debug, Clone)]
pub struct LoginSession {
    /// 32-byte ASCII session identifier.
    pub session_id: String,
    /// Whether the account authenticated through Steam.
    pub is_steam: bool,
    /// Number of expansion versions the account is entitled to report.
    pub max_expansion: usize,
}

impl LoginSession {
    pub fn new(session_id: impl Into<String>, is_steam: bool, max_expansion: usize) -> Result<Self> {
        let session_id = session_id.into();
        if session_id.len() != SESSION_ID_LEN || !session_id.is_ascii() {
            return Err(ProtocolError::ConfigError(format!(
                "session id must be {SESSION_ID_LEN} ASCII bytes"
            )));
        }
        Ok(Self {
            session_id,
            is_steam,
            max_expansion,
        })
    }
}

/// An executable the client reports to the server during login:
/// name, size, and SHA-1 digest.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub file_name: String,
    pub file_size: u64,
    /// Lowercase hex SHA-1 of the file contents, computed externally.
    pub sha1_hex: String,
}

impl FileReport {
    pub fn new(file_name: impl Into<String>, file_size: u64, sha1_hex: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            sha1_hex: sha1_hex.into(),
        }
    }

    /// Render the `name/size/sha1` form the version report uses.
    pub fn report(&self) -> String {
        format!(
            "{}/{}/{}",
            self.file_name,
            self.file_size,
            self.sha1_hex.to_lowercase()
        )
    }
}

/// Version identity of the client build being reported to the server.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Handshake phrase for cipher key derivation (32 ASCII bytes).
    pub cipher_phrase: String,
    /// Protocol version mixed into cipher key derivation.
    pub cipher_version: u32,
    /// Login protocol version stamped into the credential exchange.
    pub login_version: u16,
    /// Report for the game executable.
    pub game_exe: FileReport,
    /// Expansion version strings, newest client format.
    pub ex_versions: Vec<String>,
}

impl VersionInfo {
    /// The expansion versions this session may report, capped by the
    /// account's entitlement.
    pub fn entitled_versions(&self, max_expansion: usize) -> &[String] {
        &self.ex_versions[..self.ex_versions.len().min(max_expansion)]
    }
}
