//! End-to-end login flow tests against a scripted lobby server speaking over
//! an in-memory duplex stream.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use lobby_protocol::core::ipc::{encode_ipc, IpcMessage};
use lobby_protocol::core::packet::{
    ConnectionType, Packet, PacketHeader, Segment, SegmentType, PACKET_HEADER_SIZE,
    PACKET_MARKER_1, PACKET_MARKER_2,
};
use lobby_protocol::crypto::LobbyCipher;
use lobby_protocol::protocol::runner::{LobbyRunner, Phase};
use lobby_protocol::protocol::session::{FileReport, LoginSession, VersionInfo};
use lobby_protocol::transport::LobbyTransport;
use lobby_protocol::{LobbyConfig, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const CIPHER_VERSION: u32 = 7000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

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

async fn read_packet(stream: &mut DuplexStream) -> Packet {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let decoded = PacketHeader::decode(&header).unwrap();
    let mut full = header.to_vec();
    full.resize(decoded.size as usize, 0);
    stream.read_exact(&mut full[PACKET_HEADER_SIZE..]).await.unwrap();
    Packet::decode(&full).unwrap()
}

async fn send_packet(stream: &mut DuplexStream, packet: &Packet) {
    stream.write_all(&packet.encode()).await.unwrap();
}

fn ipc_packet(cipher: &LobbyCipher, opcode: u16, payload: &[u8]) -> Packet {
    let mut data = encode_ipc(opcode, payload);
    cipher.encipher(&mut data).unwrap();
    Packet::new(
        ConnectionType::None,
        vec![Segment::new(SegmentType::Ipc, data)],
    )
}

fn decode_ipc(cipher: &LobbyCipher, segment: &Segment) -> IpcMessage {
    let mut data = segment.payload.clone();
    cipher.decipher(&mut data).unwrap();
    IpcMessage::from_segment_payload(&data).unwrap()
}

fn keepalive_packet() -> Packet {
    Packet::new(
        ConnectionType::None,
        vec![Segment::new(SegmentType::KeepAlive, vec![0u8; 8])],
    )
}

fn encrypted_hello(cipher: &LobbyCipher, fingerprint: u32) -> Packet {
    let mut payload = vec![0u8; 640];
    put_u32(&mut payload, 0, fingerprint);
    cipher.encipher(&mut payload).unwrap();
    Packet::new(
        ConnectionType::None,
        vec![Segment::new(SegmentType::EncryptedData, payload)],
    )
}

fn login_reply_page(sequence: u64, more: bool, accounts: &[(u64, &str)]) -> Vec<u8> {
    let mut payload = vec![0u8; 656];
    put_u64(&mut payload, 0, sequence);
    payload[8] = u8::from(more);
    payload[9] = accounts.len() as u8;
    for (i, (id, name)) in accounts.iter().enumerate() {
        let base = 16 + i * 80;
        put_u64(&mut payload, base, *id);
        payload[base + 8] = i as u8;
        put_name(&mut payload, base + 12, name);
    }
    payload
}

fn world_page(more: bool, worlds: &[(u16, &str)]) -> Vec<u8> {
    let mut payload = vec![0u8; 528];
    payload[8] = u8::from(!more);
    for (i, (id, name)) in worlds.iter().enumerate() {
        let base = 24 + i * 84;
        put_u16(&mut payload, base, *id);
        put_u16(&mut payload, base + 2, i as u16);
        put_name(&mut payload, base + 20, name);
    }
    payload
}

fn xi_character_page(more: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 496];
    payload[8] = u8::from(!more);
    payload
}

fn retainer_page(more: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 536];
    payload[8] = u8::from(!more);
    payload
}

fn character_page(more: bool, characters: &[(u64, u64, u16, &str)]) -> Vec<u8> {
    let mut payload = vec![0u8; 2472];
    payload[8] = u8::from(!more);
    payload[45] = 7; // veteran rank
    put_u32(&mut payload, 48, 900); // days subscribed
    put_u16(&mut payload, 60, 8); // max character count
    for (i, (player_id, character_id, world_id, name)) in characters.iter().enumerate() {
        let base = 80 + i * 1184;
        put_u64(&mut payload, base, *player_id);
        put_u64(&mut payload, base + 8, *character_id);
        payload[base + 16] = i as u8;
        put_u16(&mut payload, base + 24, *world_id);
        put_u16(&mut payload, base + 26, *world_id);
        put_name(&mut payload, base + 44, name);
        put_name(&mut payload, base + 76, "Gilgamesh");
        put_name(&mut payload, base + 108, "Gilgamesh");
    }
    payload
}

fn login_error_payload(code: u16, message: &str) -> Vec<u8> {
    let mut payload = vec![0u8; 536];
    put_u16(&mut payload, 8, code);
    put_u16(&mut payload, 18, message.len() as u16);
    put_name(&mut payload, 20, message);
    payload
}

fn chara_make_reply_payload(request: u32, character_id: u64, world_id: u16, token: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 2568];
    put_u32(&mut payload, 0, request);
    payload[10] = 0xF; // datacenter token operation
    put_u64(&mut payload, 56, character_id);
    put_u16(&mut payload, 72, world_id);
    put_u32(&mut payload, 88, token);
    payload
}

fn test_runner(
    transport: Arc<LobbyTransport<DuplexStream>>,
) -> Arc<LobbyRunner<DuplexStream>> {
    let session = LoginSession::new("a1b2c3d4e5f6a7b8c9d0a1b2c3d4e5f6", false, 2).unwrap();
    let version = VersionInfo {
        cipher_phrase: "0123456789abcdef0123456789abcdef".into(),
        cipher_version: CIPHER_VERSION,
        login_version: 7000,
        game_exe: FileReport::new("game_dx11.exe", 48641808, "1c4d47684f5f25e8d173"),
        ex_versions: vec![
            "2024.11.19.0000.0000".into(),
            "2024.12.07.0000.0000".into(),
        ],
    };
    // keep the client's keepalive ticker out of the scripted exchanges
    let config = LobbyConfig::default_with_overrides(|c| {
        c.client.keepalive_interval = std::time::Duration::from_secs(60);
    });
    LobbyRunner::new(transport, session, version, &config.client)
}

/// Walk the server side of cipher negotiation and the credential exchange,
/// returning the negotiated cipher.
async fn negotiate(server: &mut DuplexStream, fingerprint: u32) -> LobbyCipher {
    // a plain keepalive cues the client to announce its cipher inputs
    send_packet(server, &keepalive_packet()).await;
    let init = read_packet(server).await;
    assert_eq!(init.segments[0].segment_type, SegmentType::EncryptionInit);
    let payload = &init.segments[0].payload;
    assert_eq!(payload.len(), 616);
    let phrase = std::str::from_utf8(&payload[36..68]).unwrap();
    let key = u32::from_le_bytes(payload[100..104].try_into().unwrap());
    let cipher = LobbyCipher::new(phrase, key, CIPHER_VERSION).unwrap();

    // the encrypted hello assigns the fingerprint; the client answers with
    // credentials, then a pong
    send_packet(server, &encrypted_hello(&cipher, fingerprint)).await;
    let login = read_packet(server).await;
    assert_eq!(login.header.marker1, PACKET_MARKER_1);
    assert_eq!(login.header.marker2, PACKET_MARKER_2);
    assert!(login.header.timestamp_ms > 0);
    let message = decode_ipc(&cipher, &login.segments[0]);
    assert_eq!(message.opcode(), 5);
    assert_eq!(message.data.len(), 1144);
    assert_eq!(
        u32::from_le_bytes(message.data[0..4].try_into().unwrap()),
        1,
        "credential exchange carries the first request number"
    );
    assert_eq!(&message.data[18..50], b"a1b2c3d4e5f6a7b8c9d0a1b2c3d4e5f6");

    let pong = read_packet(server).await;
    assert_eq!(pong.segments[0].segment_type, SegmentType::KeepAlivePong);
    cipher
}

#[tokio::test]
async fn full_login_flow_with_out_of_order_travel_tokens() {
    init_tracing();
    let (client, mut server) = tokio::io::duplex(65536);
    let transport = Arc::new(LobbyTransport::new());
    transport.attach(client).await;
    let runner = test_runner(Arc::clone(&transport));

    let cancel = CancellationToken::new();
    let driver = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(cancel).await })
    };

    let cipher = negotiate(&mut server, 0x0BAD_F00D).await;

    // two account pages; the client selects the first account it saw
    let page1 = login_reply_page(1, true, &[(101, "First"), (102, "Second")]);
    send_packet(&mut server, &ipc_packet(&cipher, 12, &page1)).await;
    let page2 = login_reply_page(2, false, &[(103, "Third")]);
    send_packet(&mut server, &ipc_packet(&cipher, 12, &page2)).await;

    let selection = read_packet(&mut server).await;
    let message = decode_ipc(&cipher, &selection.segments[0]);
    assert_eq!(message.opcode(), 3);
    assert_eq!(
        u32::from_le_bytes(message.data[0..4].try_into().unwrap()),
        2
    );
    assert_eq!(
        u64::from_le_bytes(message.data[16..24].try_into().unwrap()),
        101
    );

    // enumeration: worlds, no legacy characters, no retainers, one character
    let worlds = world_page(false, &[(55, "Gilgamesh"), (56, "Sargatanas")]);
    send_packet(&mut server, &ipc_packet(&cipher, 21, &worlds)).await;
    send_packet(&mut server, &ipc_packet(&cipher, 22, &xi_character_page(false))).await;
    send_packet(&mut server, &ipc_packet(&cipher, 23, &retainer_page(false))).await;
    // the first character slot is an empty sentinel entry and must be dropped
    let characters = character_page(false, &[(0, 0, 0, ""), (5, 0x77, 55, "Some Hero")]);
    send_packet(&mut server, &ipc_packet(&cipher, 13, &characters)).await;

    runner.wait_logged_in().await.unwrap();
    assert_eq!(runner.phase(), Phase::LoggedIn);

    // a stray world page after login must not disturb the inventory
    let stray = world_page(false, &[(99, "Phantom")]);
    send_packet(&mut server, &ipc_packet(&cipher, 21, &stray)).await;
    // and a stray encrypted hello must not restart the credential exchange;
    // the next packets the server reads below must be the token requests
    send_packet(&mut server, &encrypted_hello(&cipher, 0xFFFF_FFFF)).await;

    // two concurrent token requests, answered in reverse order
    let character = runner.characters().unwrap()[0].clone();
    let server_task = tokio::spawn(async move {
        let first = read_packet(&mut server).await;
        let first = decode_ipc(&cipher, &first.segments[0]);
        assert_eq!(first.opcode(), 11);
        assert_eq!(first.data[25], 0xF);
        let second = read_packet(&mut server).await;
        let second = decode_ipc(&cipher, &second.segments[0]);

        let req1 = u32::from_le_bytes(first.data[0..4].try_into().unwrap());
        let req2 = u32::from_le_bytes(second.data[0..4].try_into().unwrap());
        // a reply with an unknown request number resolves neither caller
        let bogus = chara_make_reply_payload(0xFFFF, 0x77, 99, 0xDEAD);
        send_packet(&mut server, &ipc_packet(&cipher, 14, &bogus)).await;
        let reply2 = chara_make_reply_payload(req2, 0x77, 99, 0x1000_0000 + req2);
        send_packet(&mut server, &ipc_packet(&cipher, 14, &reply2)).await;
        let reply1 = chara_make_reply_payload(req1, 0x77, 99, 0x1000_0000 + req1);
        send_packet(&mut server, &ipc_packet(&cipher, 14, &reply1)).await;
        server
    });

    let (a, b) = tokio::join!(
        runner.get_travel_token(&character),
        runner.get_travel_token(&character)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut tokens = [a.token, b.token];
    tokens.sort_unstable();
    assert_eq!(tokens, [0x1000_0003, 0x1000_0004]);
    assert_eq!(a.world_id, 99);
    assert_eq!(a.character_id, 0x77);
    assert_eq!(runner.phase(), Phase::LoggedIn);

    // inventory reflects every page, and only the pages from enumeration
    let accounts = runner.accounts().unwrap();
    assert_eq!(
        accounts.iter().map(|a| a.id).collect::<Vec<_>>(),
        vec![101, 102, 103]
    );
    let worlds = runner.worlds().unwrap();
    assert_eq!(
        worlds.iter().map(|w| w.name.as_str()).collect::<Vec<_>>(),
        vec!["Gilgamesh", "Sargatanas"]
    );
    assert!(runner.xi_characters().unwrap().is_empty());
    assert!(runner.retainers().unwrap().is_empty());
    let characters = runner.characters().unwrap();
    assert_eq!(characters.len(), 1);
    assert_eq!(characters[0].name, "Some Hero");
    assert_eq!(characters[0].world_name, "Gilgamesh");
    let subscription = runner.subscription().unwrap();
    assert_eq!(subscription.veteran_rank, 7);
    assert_eq!(subscription.days_subscribed, 900);
    assert_eq!(subscription.max_character_count, 8);

    // the server hanging up at a packet boundary ends the run cleanly
    let server = server_task.await.unwrap();
    drop(server);
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn login_error_terminates_the_run() {
    init_tracing();
    let (client, mut server) = tokio::io::duplex(65536);
    let transport = Arc::new(LobbyTransport::new());
    transport.attach(client).await;
    let runner = test_runner(Arc::clone(&transport));

    let driver = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(CancellationToken::new()).await })
    };
    // a caller already waiting for login must be woken when the run fails
    let waiter = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.wait_logged_in().await })
    };

    let cipher = negotiate(&mut server, 0x1111_2222).await;
    let error = login_error_payload(3101, "The session has expired.");
    send_packet(&mut server, &ipc_packet(&cipher, 2, &error)).await;

    match driver.await.unwrap() {
        Err(ProtocolError::LoginError { code, message, .. }) => {
            assert_eq!(code, 3101);
            assert_eq!(message, "The session has expired.");
        }
        other => panic!("expected a login error, got {other:?}"),
    }
    assert_ne!(runner.phase(), Phase::LoggedIn);
    assert!(matches!(
        waiter.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(matches!(
        runner.wait_logged_in().await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn empty_account_list_is_fatal() {
    init_tracing();
    let (client, mut server) = tokio::io::duplex(65536);
    let transport = Arc::new(LobbyTransport::new());
    transport.attach(client).await;
    let runner = test_runner(Arc::clone(&transport));

    let driver = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(CancellationToken::new()).await })
    };

    let cipher = negotiate(&mut server, 0x3333_4444).await;
    let empty = login_reply_page(1, false, &[]);
    send_packet(&mut server, &ipc_packet(&cipher, 12, &empty)).await;

    assert!(matches!(
        driver.await.unwrap(),
        Err(ProtocolError::NoActiveAccounts)
    ));
}

#[tokio::test]
async fn cancellation_stops_the_driver_cleanly() {
    init_tracing();
    let (client, _server) = tokio::io::duplex(1024);
    let transport = Arc::new(LobbyTransport::new());
    transport.attach(client).await;
    let runner = test_runner(Arc::clone(&transport));

    let cancel = CancellationToken::new();
    let driver = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(cancel).await })
    };

    cancel.cancel();
    driver.await.unwrap().unwrap();
}
