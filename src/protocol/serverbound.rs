//! Serverbound payload builders.
//!
//! Every builder emits the exact fixed-width little-endian layout the server
//! expects, with reserved regions zero-filled. Sizes are load-bearing: the
//! server rejects (or worse, desynchronizes on) payloads of the wrong width.

use bytes::BufMut;

use crate::core::{unix_time_secs, write_fixed_ascii};
use crate::crypto::PHRASE_LEN;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::{FileReport, VersionInfo};
use crate::protocol::CharaMakeOperation;

/// Wire size of the ping payload.
pub const PING_SIZE: usize = 8;

/// Wire size of the EncryptionInit segment payload.
pub const ENCRYPTION_INIT_SIZE: usize = 616;

/// Wire size of the LoginEx (opcode 5) payload.
pub const LOGIN_EX_SIZE: usize = 1144;

/// Wire size of the ServiceLogin (opcode 3) payload.
pub const SERVICE_LOGIN_SIZE: usize = 24;

/// Wire size of the CharaMake (opcode 11) payload.
pub const CHARA_MAKE_SIZE: usize = 496;

/// Width of the version report field inside LoginEx.
const VERSION_REPORT_LEN: usize = 192;

/// Characters kept of each expansion version string in the report; the
/// trailing "part" section is truncated off.
const EX_VERSION_PREFIX: usize = 15;

/// Keepalive ping: fingerprint plus a second-resolution timestamp.
pub fn ping(fingerprint: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PING_SIZE);
    buf.put_u32_le(fingerprint);
    buf.put_u32_le(unix_time_secs());
    buf
}

/// EncryptionInit segment payload: phrase at offset 36, key at offset 100,
/// everything else reserved-zero.
pub fn encryption_init(phrase: &str, key: u32) -> Result<Vec<u8>> {
    if phrase.len() != PHRASE_LEN || !phrase.is_ascii() {
        return Err(ProtocolError::Cipher(format!(
            "handshake phrase must be {PHRASE_LEN} ASCII bytes"
        )));
    }
    let mut buf = vec![0u8; ENCRYPTION_INIT_SIZE];
    buf[36..36 + PHRASE_LEN].copy_from_slice(phrase.as_bytes());
    buf[100..104].copy_from_slice(&key.to_le_bytes());
    Ok(buf)
}

/// Render the version report: the executable report followed by each
/// expansion version (truncated to its date prefix), '+'-joined.
pub fn version_report(game_exe: &FileReport, ex_versions: &[String]) -> String {
    let mut report = game_exe.report();
    for version in ex_versions {
        report.push('+');
        report.push_str(&version[..version.len().min(EX_VERSION_PREFIX)]);
    }
    report
}

/// LoginEx (opcode 5): session id, platform flags, and the version report.
///
/// Layout: request_number @0, lang code @8, login version @10, platform
/// constants @12/@14, steam flag @16, session id @18 (64-byte field),
/// version report @82 (192-byte field), zero to 1144.
pub fn login_ex(
    request_number: u32,
    session_id: &str,
    is_steam: bool,
    version: &VersionInfo,
    max_expansion: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; LOGIN_EX_SIZE];
    buf[0..4].copy_from_slice(&request_number.to_le_bytes());
    buf[8..10].copy_from_slice(&1000u16.to_le_bytes());
    buf[10..12].copy_from_slice(&version.login_version.to_le_bytes());
    buf[12..14].copy_from_slice(&4944u16.to_le_bytes());
    buf[14..16].copy_from_slice(&18u16.to_le_bytes());
    buf[16..18].copy_from_slice(&u16::from(is_steam).to_le_bytes());

    write_fixed_ascii(&mut buf[18..82], session_id).ok_or_else(|| {
        ProtocolError::ConfigError("session id does not fit its wire field".into())
    })?;

    let report = version_report(&version.game_exe, version.entitled_versions(max_expansion));
    write_fixed_ascii(&mut buf[82..82 + VERSION_REPORT_LEN], &report).ok_or_else(|| {
        ProtocolError::ConfigError(format!(
            "version report is {} bytes, exceeding the {VERSION_REPORT_LEN}-byte wire field",
            report.len()
        ))
    })?;

    Ok(buf)
}

/// ServiceLogin (opcode 3): select a service account by index and id.
pub fn service_login(request_number: u32, account_index: u8, account_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SERVICE_LOGIN_SIZE);
    buf.put_u32_le(request_number);
    buf.put_u32_le(0);
    buf.put_u8(account_index);
    buf.put_u8(1); // login param, low nibble; proto version zero in the high
    buf.put_u16_le(0);
    buf.put_u32_le(0);
    buf.put_u64_le(account_id);
    buf
}

/// CharaMake (opcode 11) requesting a datacenter travel token for one
/// character. The name and customization regions stay zero for this
/// operation.
pub fn chara_make_travel_token(
    request_number: u32,
    character_id: u64,
    character_index: u8,
) -> Vec<u8> {
    let mut buf = vec![0u8; CHARA_MAKE_SIZE];
    buf[0..4].copy_from_slice(&request_number.to_le_bytes());
    buf[8..16].copy_from_slice(&character_id.to_le_bytes());
    buf[24] = character_index;
    buf[25] = CharaMakeOperation::DatacenterToken.to_u8();
    buf
}
