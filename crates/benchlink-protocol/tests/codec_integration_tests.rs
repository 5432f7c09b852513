//! Integration tests for RecordCodec with Tokio streams.
//!
//! These tests drive request/reply exchanges through framed duplex streams
//! the same way a stub and a handler talk over TCP.

use benchlink_core::{Address, Error, FaultKind};
use benchlink_protocol::{RecordCodec, Reply, Request, Settings, Verb, decode_settings};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

/// Helper function to create a framed duplex stream for testing.
fn create_framed_duplex(
    buffer_size: usize,
) -> (
    Framed<DuplexStream, RecordCodec>,
    Framed<DuplexStream, RecordCodec>,
) {
    let (client, server) = tokio::io::duplex(buffer_size);
    let client_framed = Framed::new(client, RecordCodec::new());
    let server_framed = Framed::new(server, RecordCodec::new());
    (client_framed, server_framed)
}

fn address() -> Address {
    Address::new("GPIB0::1::INSTR").unwrap()
}

#[tokio::test]
async fn test_query_exchange() {
    let (mut client, mut server) = create_framed_duplex(1024);

    client
        .send(Request::query(address(), "*IDN?").to_string())
        .await
        .unwrap();

    let record = server.next().await.unwrap().unwrap();
    let request = Request::parse(&record).unwrap();
    assert_eq!(request.verb, Verb::Query);
    assert_eq!(request.payload(), Some("*IDN?"));

    let reply = Reply::success(
        request.verb,
        Some("Stanford_Research_Systems,SR830,s/n12345,ver1.07".to_string()),
    );
    server.send(reply.to_string()).await.unwrap();

    let record = client.next().await.unwrap().unwrap();
    let data = Reply::parse(&record, Verb::Query)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(
        data.as_deref(),
        Some("Stanford_Research_Systems,SR830,s/n12345,ver1.07")
    );
}

#[tokio::test]
async fn test_multiline_payload_survives_framing() {
    let (mut client, mut server) = create_framed_duplex(1024);

    client
        .send(Request::write(address(), "*RST\n*CLS\n").to_string())
        .await
        .unwrap();
    client
        .send(Request::read(address()).to_string())
        .await
        .unwrap();

    let first = Request::parse(&server.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(first.payload(), Some("*RST\n*CLS\n"));

    let second = Request::parse(&server.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(second.verb, Verb::Read);
}

#[tokio::test]
async fn test_conf_settings_exchange() {
    let (mut client, mut server) = create_framed_duplex(1024);

    let mut settings = Settings::new();
    settings.insert("timeout".to_string(), 10_000.into());
    settings.insert("write_termination".to_string(), "\r\n".into());

    client
        .send(Request::conf(address(), &settings).unwrap().to_string())
        .await
        .unwrap();

    let request = Request::parse(&server.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(request.verb, Verb::Conf);
    let decoded = decode_settings(request.required_payload().unwrap()).unwrap();
    assert_eq!(decoded, settings);
}

#[tokio::test]
async fn test_error_reply_exchange() {
    let (mut client, mut server) = create_framed_duplex(1024);

    let reply = Reply::failure(&Error::UnknownVerb("FROB".to_string()));
    server.send(reply.to_string()).await.unwrap();

    let record = client.next().await.unwrap().unwrap();
    let err = Reply::parse(&record, Verb::Write)
        .unwrap()
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
    assert_eq!(err.description(), "Unknown verb: FROB");
}

#[tokio::test]
async fn test_small_buffer_split_writes() {
    // 8-byte pipe forces every frame through several partial reads
    let (mut client, mut server) = create_framed_duplex(8);

    let records: Vec<String> = (0..5)
        .map(|i| Request::write(address(), format!("FREQ {i}E3")).to_string())
        .collect();

    let expected = records.clone();
    let writer = tokio::spawn(async move {
        for record in records {
            client.send(record).await.unwrap();
        }
    });

    for want in expected {
        let got = server.next().await.unwrap().unwrap();
        assert_eq!(got, want);
    }

    writer.await.unwrap();
}

#[tokio::test]
async fn test_stream_ends_cleanly_on_close() {
    let (client, mut server) = create_framed_duplex(1024);
    drop(client);
    assert!(server.next().await.is_none());
}

#[tokio::test]
async fn test_truncated_frame_at_eof_is_error() {
    let (mut raw_client, server) = tokio::io::duplex(1024);
    let mut server = Framed::new(server, RecordCodec::new());

    // header promises 16 bytes, only 3 arrive before EOF
    raw_client.write_all(&[0, 0, 0, 16, b'O', b'P', b'E']).await.unwrap();
    drop(raw_client);

    let result = server.next().await.unwrap();
    assert!(result.is_err());
}
