//! Clientbound payload decoders.
//!
//! Each decoder enforces the exact payload size its opcode carries before
//! reading any field; a mismatch means the connection has desynchronized and
//! the payload cannot be trusted. Entry lists are sliced to the advertised
//! count and, where the server pads the list with blank slots, filtered by a
//! zero-id sentinel.

use crate::core::read_fixed_string;
use crate::error::{ProtocolError, Result};
use crate::protocol::CharaMakeOperation;

/// Expected payload size of an EncryptedData segment.
pub const ENCRYPTED_DATA_SIZE: usize = 640;

/// Expected payload size of a LoginReply (opcode 12).
pub const LOGIN_REPLY_SIZE: usize = 656;

/// Expected payload size of a DistWorldInfo (opcode 21).
pub const DIST_WORLD_INFO_SIZE: usize = 528;

/// Expected payload size of a XiCharacterInfo (opcode 22).
pub const XI_CHARACTER_INFO_SIZE: usize = 496;

/// Expected payload size of a DistRetainerInfo (opcode 23).
pub const DIST_RETAINER_INFO_SIZE: usize = 536;

/// Expected payload size of a ServiceLoginReply (opcode 13).
pub const SERVICE_LOGIN_REPLY_SIZE: usize = 2472;

/// Expected payload size of a LoginError (opcode 2).
pub const LOGIN_ERROR_SIZE: usize = 536;

/// Expected payload size of a CharaMakeReply (opcode 14).
pub const CHARA_MAKE_REPLY_SIZE: usize = 2568;

fn check_size(what: &'static str, expected: usize, payload: &[u8]) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::size_mismatch(what, expected, payload.len()));
    }
    Ok(())
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Extract the connection fingerprint from an EncryptedData payload.
pub fn fingerprint(payload: &[u8]) -> Result<u32> {
    check_size("EncryptedData", ENCRYPTED_DATA_SIZE, payload)?;
    Ok(u32_at(payload, 0))
}

/// One service account from a LoginReply page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub id: u64,
    pub index: u8,
    pub param: u8,
    pub status: u16,
    pub name: String,
}

/// A LoginReply page: up to eight service accounts.
#[derive(Debug, Clone)]
pub struct LoginReply {
    pub sequence: u64,
    pub has_more: bool,
    pub accounts: Vec<ServiceAccount>,
}

/// Decode a LoginReply (opcode 12).
///
/// Unlike the other paginated opcodes, a SET low bit here means more pages
/// follow. Accounts are sliced to the advertised count without sentinel
/// filtering; the server sends only real entries.
pub fn login_reply(payload: &[u8]) -> Result<LoginReply> {
    check_size("LoginReply", LOGIN_REPLY_SIZE, payload)?;
    let sequence = u64_at(payload, 0);
    let flags = payload[8];
    let count = payload[9] as usize;

    let mut accounts = Vec::with_capacity(count.min(8));
    for entry in payload[16..].chunks_exact(80).take(count.min(8)) {
        accounts.push(ServiceAccount {
            id: u64_at(entry, 0),
            index: entry[8],
            param: entry[9],
            status: u16_at(entry, 10),
            name: read_fixed_string(&entry[12..76]),
        });
    }

    Ok(LoginReply {
        sequence,
        has_more: flags & 1 != 0,
        accounts,
    })
}

/// One world from a DistWorldInfo page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct World {
    pub id: u16,
    pub index: u16,
    pub param1: u8,
    pub status1: u32,
    pub status2: u32,
    pub access_mode: u32,
    pub name: String,
}

/// A DistWorldInfo page: up to six worlds.
#[derive(Debug, Clone)]
pub struct DistWorldInfo {
    pub sequence: u64,
    pub has_more: bool,
    pub worlds: Vec<World>,
}

/// Decode a DistWorldInfo (opcode 21). Blank slots carry a zero world id
/// and are dropped.
pub fn dist_world_info(payload: &[u8]) -> Result<DistWorldInfo> {
    check_size("DistWorldInfo", DIST_WORLD_INFO_SIZE, payload)?;
    let sequence = u64_at(payload, 0);
    let flags = payload[8];

    let mut worlds = Vec::new();
    for entry in payload[24..].chunks_exact(84).take(6) {
        let id = u16_at(entry, 0);
        if id == 0 {
            continue;
        }
        worlds.push(World {
            id,
            index: u16_at(entry, 2),
            param1: entry[4],
            status1: u32_at(entry, 8),
            status2: u32_at(entry, 12),
            access_mode: u32_at(entry, 16),
            name: read_fixed_string(&entry[20..84]),
        });
    }

    Ok(DistWorldInfo {
        sequence,
        has_more: flags & 1 == 0,
        worlds,
    })
}

/// One legacy-service character from a XiCharacterInfo page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XiCharacter {
    pub id: u32,
    pub index: u8,
    pub world_param: u8,
    pub status: u16,
    pub name: String,
}

/// A XiCharacterInfo page: up to twelve entries.
#[derive(Debug, Clone)]
pub struct XiCharacterInfo {
    pub sequence: u64,
    pub has_more: bool,
    pub characters: Vec<XiCharacter>,
}

/// Decode a XiCharacterInfo (opcode 22). Blank slots carry a zero id.
pub fn xi_character_info(payload: &[u8]) -> Result<XiCharacterInfo> {
    check_size("XiCharacterInfo", XI_CHARACTER_INFO_SIZE, payload)?;
    let sequence = u64_at(payload, 0);
    let flags = payload[8];

    let mut characters = Vec::new();
    for entry in payload[16..].chunks_exact(40).take(12) {
        let id = u32_at(entry, 0);
        if id == 0 {
            continue;
        }
        characters.push(XiCharacter {
            id,
            index: entry[4],
            world_param: entry[5],
            status: u16_at(entry, 6),
            name: read_fixed_string(&entry[8..40]),
        });
    }

    Ok(XiCharacterInfo {
        sequence,
        has_more: flags & 1 == 0,
        characters,
    })
}

/// One retainer from a DistRetainerInfo page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retainer {
    pub id: u64,
    pub owner_character_id: u64,
    pub slot: u8,
    pub param1: u8,
    pub status: u16,
    pub param2: u32,
    pub name: String,
}

/// A DistRetainerInfo page: up to nine entries.
#[derive(Debug, Clone)]
pub struct DistRetainerInfo {
    pub sequence: u64,
    pub has_more: bool,
    pub retainers: Vec<Retainer>,
}

/// Decode a DistRetainerInfo (opcode 23). Blank slots carry a zero id.
pub fn dist_retainer_info(payload: &[u8]) -> Result<DistRetainerInfo> {
    check_size("DistRetainerInfo", DIST_RETAINER_INFO_SIZE, payload)?;
    let sequence = u64_at(payload, 0);
    let flags = payload[8];

    let mut retainers = Vec::new();
    for entry in payload[32..].chunks_exact(56).take(9) {
        let id = u64_at(entry, 0);
        if id == 0 {
            continue;
        }
        retainers.push(Retainer {
            id,
            owner_character_id: u64_at(entry, 8),
            slot: entry[16],
            param1: entry[17],
            status: u16_at(entry, 18),
            param2: u32_at(entry, 20),
            name: read_fixed_string(&entry[24..56]),
        });
    }

    Ok(DistRetainerInfo {
        sequence,
        has_more: flags & 1 == 0,
        retainers,
    })
}

/// Subscription details carried on every ServiceLoginReply page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionInfo {
    pub veteran_rank: u8,
    pub days_subscribed: u32,
    pub days_remaining: u32,
    pub days_until_next_veteran_rank: u32,
    pub max_character_count: u16,
    pub max_character_list: u16,
    pub entitled_expansion: u32,
}

/// One character from a ServiceLoginReply page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub player_id: u64,
    pub character_id: u64,
    pub index: u8,
    pub param: u8,
    pub status: u16,
    pub param2: u32,
    pub world_id: u16,
    pub home_world_id: u16,
    pub last_backup: u32,
    pub name: String,
    pub world_name: String,
    pub home_world_name: String,
    /// Appearance and state details, JSON as the server sends it.
    pub detail_json: String,
    pub settings_hash: [u8; 20],
}

/// A ServiceLoginReply page: up to two characters plus subscription info.
#[derive(Debug, Clone)]
pub struct ServiceLoginReply {
    pub sequence: u64,
    pub has_more: bool,
    pub subscription: SubscriptionInfo,
    pub characters: Vec<Character>,
}

/// Decode a ServiceLoginReply (opcode 13). Blank slots carry a zero
/// character id.
pub fn service_login_reply(payload: &[u8]) -> Result<ServiceLoginReply> {
    check_size("ServiceLoginReply", SERVICE_LOGIN_REPLY_SIZE, payload)?;
    let sequence = u64_at(payload, 0);
    let flags = payload[8];

    let subscription = SubscriptionInfo {
        veteran_rank: payload[45],
        days_subscribed: u32_at(payload, 48),
        days_remaining: u32_at(payload, 52),
        days_until_next_veteran_rank: u32_at(payload, 56),
        max_character_count: u16_at(payload, 60),
        max_character_list: u16_at(payload, 62),
        entitled_expansion: u32_at(payload, 64),
    };

    let mut characters = Vec::new();
    for entry in payload[80..].chunks_exact(1184).take(2) {
        let character_id = u64_at(entry, 8);
        if character_id == 0 {
            continue;
        }
        let mut settings_hash = [0u8; 20];
        settings_hash.copy_from_slice(&entry[1164..1184]);
        characters.push(Character {
            player_id: u64_at(entry, 0),
            character_id,
            index: entry[16],
            param: entry[17],
            status: u16_at(entry, 18),
            param2: u32_at(entry, 20),
            world_id: u16_at(entry, 24),
            home_world_id: u16_at(entry, 26),
            last_backup: u32_at(entry, 28),
            name: read_fixed_string(&entry[44..76]),
            world_name: read_fixed_string(&entry[76..108]),
            home_world_name: read_fixed_string(&entry[108..140]),
            detail_json: read_fixed_string(&entry[140..1164]),
            settings_hash,
        });
    }

    Ok(ServiceLoginReply {
        sequence,
        has_more: flags & 1 == 0,
        subscription,
        characters,
    })
}

/// Decode a LoginError (opcode 2) into the crate error it represents.
pub fn login_error(payload: &[u8]) -> Result<ProtocolError> {
    check_size("LoginError", LOGIN_ERROR_SIZE, payload)?;
    let code = u16_at(payload, 8);
    let param = u32_at(payload, 12);
    let sheet_row = u16_at(payload, 16);
    let message_size = u16_at(payload, 18) as usize;
    let message_end = 20 + message_size.min(516);
    let message = read_fixed_string(&payload[20..message_end]);
    Ok(ProtocolError::LoginError {
        code,
        param,
        row: sheet_row,
        message,
    })
}

/// A CharaMakeReply (opcode 14), correlated back to its request by
/// request number.
#[derive(Debug, Clone)]
pub struct CharaMakeReply {
    pub request_number: u32,
    pub operation: CharaMakeOperation,
    pub character_id: u64,
    pub visiting_world_id: u16,
    pub travel_token: u32,
}

/// Decode a CharaMakeReply (opcode 14).
pub fn chara_make_reply(payload: &[u8]) -> Result<CharaMakeReply> {
    check_size("CharaMakeReply", CHARA_MAKE_REPLY_SIZE, payload)?;
    Ok(CharaMakeReply {
        request_number: u32_at(payload, 0),
        operation: CharaMakeOperation::from_u8(payload[10]),
        character_id: u64_at(payload, 56),
        visiting_world_id: u16_at(payload, 72),
        travel_token: u32_at(payload, 88),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn put_name(buf: &mut [u8], off: usize, name: &str) {
        buf[off..off + name.len()].copy_from_slice(name.as_bytes());
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert!(login_reply(&[0u8; 100]).is_err());
        assert!(dist_world_info(&[0u8; 100]).is_err());
        assert!(service_login_reply(&[0u8; 100]).is_err());
        assert!(fingerprint(&[0u8; 4]).is_err());
    }

    #[test]
    fn fingerprint_reads_leading_word() {
        let mut payload = vec![0u8; ENCRYPTED_DATA_SIZE];
        put_u32(&mut payload, 0, 0xCAFE_F00D);
        assert_eq!(fingerprint(&payload).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn login_reply_slices_to_count_and_reads_more_flag() {
        let mut payload = vec![0u8; LOGIN_REPLY_SIZE];
        put_u64(&mut payload, 0, 7);
        payload[8] = 1; // more pages follow
        payload[9] = 2;
        for (i, name) in ["First Account", "Second Account"].iter().enumerate() {
            let base = 16 + i * 80;
            put_u64(&mut payload, base, 100 + i as u64);
            payload[base + 8] = i as u8;
            put_name(&mut payload, base + 12, name);
        }
        // garbage in a slot beyond the count must not leak through
        put_u64(&mut payload, 16 + 2 * 80, 999);

        let reply = login_reply(&payload).unwrap();
        assert_eq!(reply.sequence, 7);
        assert!(reply.has_more);
        assert_eq!(reply.accounts.len(), 2);
        assert_eq!(reply.accounts[0].id, 100);
        assert_eq!(reply.accounts[1].name, "Second Account");
    }

    #[test]
    fn dist_world_info_filters_blank_slots() {
        let mut payload = vec![0u8; DIST_WORLD_INFO_SIZE];
        put_u64(&mut payload, 0, 1);
        payload[8] = 1; // final page for this opcode
        let base = 24 + 84; // slot 0 left blank on purpose
        put_u16(&mut payload, base, 55);
        put_u16(&mut payload, base + 2, 3);
        put_u32(&mut payload, base + 8, 2);
        put_name(&mut payload, base + 20, "Gilgamesh");

        let info = dist_world_info(&payload).unwrap();
        assert!(!info.has_more);
        assert_eq!(info.worlds.len(), 1);
        assert_eq!(info.worlds[0].id, 55);
        assert_eq!(info.worlds[0].index, 3);
        assert_eq!(info.worlds[0].status1, 2);
        assert_eq!(info.worlds[0].name, "Gilgamesh");
    }

    #[test]
    fn dist_world_info_page_flag_sits_before_the_padding_words() {
        let mut payload = vec![0u8; DIST_WORLD_INFO_SIZE];
        payload[8] = 1; // final page
        put_u32(&mut payload, 16, 0xFFFF_FFFF); // padding, not the flag
        assert!(!dist_world_info(&payload).unwrap().has_more);

        payload[8] = 0;
        assert!(dist_world_info(&payload).unwrap().has_more);
    }

    #[test]
    fn dist_retainer_info_page_flag_sits_before_the_slot_counts() {
        let mut payload = vec![0u8; DIST_RETAINER_INFO_SIZE];
        payload[8] = 1; // final page
        put_u16(&mut payload, 16, 9); // contracted count, not the flag
        assert!(!dist_retainer_info(&payload).unwrap().has_more);

        payload[8] = 0;
        assert!(dist_retainer_info(&payload).unwrap().has_more);
    }

    #[test]
    fn xi_character_info_clear_flag_means_more() {
        let mut payload = vec![0u8; XI_CHARACTER_INFO_SIZE];
        payload[8] = 0;
        let info = xi_character_info(&payload).unwrap();
        assert!(info.has_more);
        assert!(info.characters.is_empty());

        payload[8] = 1;
        assert!(!xi_character_info(&payload).unwrap().has_more);
    }

    #[test]
    fn dist_retainer_info_reads_entries() {
        let mut payload = vec![0u8; DIST_RETAINER_INFO_SIZE];
        payload[8] = 1;
        let base = 32;
        put_u64(&mut payload, base, 0xAA);
        put_u64(&mut payload, base + 8, 0xBB);
        payload[base + 16] = 2;
        put_u16(&mut payload, base + 18, 1);
        put_name(&mut payload, base + 24, "Retainer Name");

        let info = dist_retainer_info(&payload).unwrap();
        assert_eq!(info.retainers.len(), 1);
        let retainer = &info.retainers[0];
        assert_eq!(retainer.id, 0xAA);
        assert_eq!(retainer.owner_character_id, 0xBB);
        assert_eq!(retainer.slot, 2);
        assert_eq!(retainer.name, "Retainer Name");
    }

    #[test]
    fn service_login_reply_reads_subscription_and_characters() {
        let mut payload = vec![0u8; SERVICE_LOGIN_REPLY_SIZE];
        put_u64(&mut payload, 0, 3);
        payload[8] = 1; // final page
        payload[45] = 4; // veteran rank
        put_u32(&mut payload, 48, 900);
        put_u32(&mut payload, 52, 30);
        put_u16(&mut payload, 60, 8);
        put_u32(&mut payload, 64, 5);

        let base = 80 + 1184; // slot 0 blank
        put_u64(&mut payload, base, 0x10);
        put_u64(&mut payload, base + 8, 0x20);
        payload[base + 16] = 1;
        put_u16(&mut payload, base + 24, 55);
        put_u16(&mut payload, base + 26, 40);
        put_name(&mut payload, base + 44, "Some Hero");
        put_name(&mut payload, base + 76, "Gilgamesh");
        put_name(&mut payload, base + 108, "Sargatanas");
        put_name(&mut payload, base + 140, "{\"content\":[]}");
        payload[base + 1164] = 0xEE;

        let reply = service_login_reply(&payload).unwrap();
        assert!(!reply.has_more);
        assert_eq!(reply.subscription.veteran_rank, 4);
        assert_eq!(reply.subscription.days_subscribed, 900);
        assert_eq!(reply.subscription.max_character_count, 8);
        assert_eq!(reply.subscription.entitled_expansion, 5);
        assert_eq!(reply.characters.len(), 1);
        let character = &reply.characters[0];
        assert_eq!(character.player_id, 0x10);
        assert_eq!(character.character_id, 0x20);
        assert_eq!(character.world_id, 55);
        assert_eq!(character.home_world_id, 40);
        assert_eq!(character.name, "Some Hero");
        assert_eq!(character.world_name, "Gilgamesh");
        assert_eq!(character.detail_json, "{\"content\":[]}");
        assert_eq!(character.settings_hash[0], 0xEE);
    }

    #[test]
    fn login_error_carries_code_and_message() {
        let mut payload = vec![0u8; LOGIN_ERROR_SIZE];
        put_u16(&mut payload, 8, 3101);
        put_u32(&mut payload, 12, 77);
        put_u16(&mut payload, 16, 13006);
        let message = "A system error has occurred.";
        put_u16(&mut payload, 18, message.len() as u16);
        put_name(&mut payload, 20, message);

        match login_error(&payload).unwrap() {
            ProtocolError::LoginError {
                code,
                param,
                row,
                message,
            } => {
                assert_eq!(code, 3101);
                assert_eq!(param, 77);
                assert_eq!(row, 13006);
                assert_eq!(message, "A system error has occurred.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn chara_make_reply_layout() {
        let mut payload = vec![0u8; CHARA_MAKE_REPLY_SIZE];
        put_u32(&mut payload, 0, 42);
        payload[10] = CharaMakeOperation::DatacenterToken.to_u8();
        put_u64(&mut payload, 56, 0x1234);
        put_u16(&mut payload, 72, 99);
        put_u32(&mut payload, 88, 0xDEAD_0001);

        let reply = chara_make_reply(&payload).unwrap();
        assert_eq!(reply.request_number, 42);
        assert_eq!(reply.operation, CharaMakeOperation::DatacenterToken);
        assert_eq!(reply.character_id, 0x1234);
        assert_eq!(reply.visiting_world_id, 99);
        assert_eq!(reply.travel_token, 0xDEAD_0001);
    }
}
