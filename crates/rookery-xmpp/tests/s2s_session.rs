//! Outgoing session negotiation against a scripted remote peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use rookery_xmpp::{CapturingSink, OutgoingRegistry, S2sConfig, StartTlsPolicy};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn read_until(socket: &mut TcpStream, buffer: &mut String, needle: &str) -> String {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    loop {
        if let Some(position) = buffer.find(needle) {
            let end = position + needle.len();
            let consumed: String = buffer.drain(..end).collect();
            return consumed;
        }
        let mut chunk = [0u8; 2048];
        let n = timeout(deadline - tokio::time::Instant::now(), socket.read(&mut chunk))
            .await
            .expect("peer read timed out")
            .expect("peer read failed");
        assert!(n > 0, "initiator closed while waiting for {:?}", needle);
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
}

/// Read the initiator's stream opening; returns the raw tag (without the
/// XML declaration that precedes it).
async fn read_stream_open(socket: &mut TcpStream, buffer: &mut String) -> String {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    loop {
        if let Some(start) = buffer.find("<stream:stream") {
            if let Some(offset) = buffer[start..].find('>') {
                let end = start + offset + 1;
                let consumed: String = buffer.drain(..end).collect();
                return consumed[consumed.find("<stream:stream").expect("tag present")..]
                    .to_string();
            }
        }
        let mut chunk = [0u8; 2048];
        let n = timeout(deadline - tokio::time::Instant::now(), socket.read(&mut chunk))
            .await
            .expect("peer read timed out")
            .expect("peer read failed");
        assert!(n > 0, "initiator closed before stream opening");
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
}

fn message(from: &str, to: &str, body: &str) -> Element {
    format!(
        "<message xmlns='jabber:server' from='{}' to='{}'><body>{}</body></message>",
        from, to, body
    )
    .parse()
    .expect("valid xml")
}

async fn bind_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, addr)
}

#[tokio::test]
async fn dialback_negotiation_flushes_queue_in_order() {
    let (listener, addr) = bind_listener().await;
    let sink = Arc::new(CapturingSink::new());
    let registry = OutgoingRegistry::new(S2sConfig::default(), sink.clone());
    registry.add_static_route("b.example", vec![addr]);

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buffer = String::new();

        let open = read_stream_open(&mut socket, &mut buffer).await;
        assert!(open.contains("xmlns='jabber:server'"));
        assert!(open.contains("xmlns:db='jabber:server:dialback'"));
        assert!(open.contains("to='b.example'"));
        assert!(open.contains("version='1.0'"));

        socket
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:stream='http://etherx.jabber.org/streams' \
                  xmlns:db='jabber:server:dialback' id='peer-sid-1' version='1.0'>\
                  <stream:features>\
                  <dialback xmlns='urn:xmpp:features:dialback'/>\
                  </stream:features>",
            )
            .await
            .expect("write");

        let result = read_until(&mut socket, &mut buffer, "</db:result>").await;
        assert!(result.contains("from='a.example'"));
        assert!(result.contains("to='b.example'"));
        let key_start = result.find('>').expect("open tag end") + 1;
        let key_end = result.find("</db:result>").expect("close tag");
        let key = result[key_start..key_end].to_string();
        assert!(!key.is_empty());

        socket
            .write_all(b"<db:result from='b.example' to='a.example' type='valid'/>")
            .await
            .expect("write");

        // The queued stanzas must arrive in enqueue order.
        for expected in ["first", "second", "third"] {
            let stanza = read_until(&mut socket, &mut buffer, "</message>").await;
            assert!(
                stanza.contains(expected),
                "expected body {:?} in {:?}",
                expected,
                stanza
            );
        }
        key
    });

    for body in ["first", "second", "third"] {
        registry
            .send(
                "a.example",
                "b.example",
                message("user@a.example", "friend@b.example", body),
            )
            .await
            .expect("accepted");
    }

    let key = timeout(Duration::from_secs(10), peer)
        .await
        .expect("peer finished")
        .expect("peer task");

    // The asserted key is the one the registry stored for the pair.
    let pair = rookery_xmpp::SessionKey::new("a.example", "b.example");
    assert!(registry.has_key(&pair, &key));
    // Nothing was bounced.
    assert!(sink.is_empty());
}

#[tokio::test]
async fn starttls_required_but_disabled_falls_back_to_legacy_dialback() {
    let (listener, addr) = bind_listener().await;
    let sink = Arc::new(CapturingSink::new());
    let config = S2sConfig {
        use_starttls: StartTlsPolicy::Disabled,
        ..Default::default()
    };
    let registry = OutgoingRegistry::new(config, sink.clone());
    registry.add_static_route("b.example", vec![addr]);

    let peer = tokio::spawn(async move {
        // First connection: advertise mandatory STARTTLS.
        {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buffer = String::new();
            let open = read_stream_open(&mut socket, &mut buffer).await;
            assert!(open.contains("version='1.0'"));

            socket
                .write_all(
                    b"<stream:stream xmlns='jabber:server' \
                      xmlns:stream='http://etherx.jabber.org/streams' \
                      xmlns:db='jabber:server:dialback' id='tls-sid' version='1.0'>\
                      <stream:features>\
                      <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
                      </stream:features>",
                )
                .await
                .expect("write");

            // The initiator gives up on this stream and reconnects.
            let mut rest = Vec::new();
            let _ = timeout(IO_TIMEOUT, socket.read_to_end(&mut rest)).await;
        }

        // Second connection: pre-1.0 opening, straight to dialback.
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buffer = String::new();
        let open = read_stream_open(&mut socket, &mut buffer).await;
        assert!(
            !open.contains("version="),
            "fallback opening must be pre-1.0: {:?}",
            open
        );

        socket
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:db='jabber:server:dialback' id='legacy-sid'>",
            )
            .await
            .expect("write");

        let result = read_until(&mut socket, &mut buffer, "</db:result>").await;
        assert!(result.contains("to='b.example'"));
        socket
            .write_all(b"<db:result from='b.example' to='a.example' type='valid'/>")
            .await
            .expect("write");

        let stanza = read_until(&mut socket, &mut buffer, "</message>").await;
        assert!(stanza.contains("fallback-body"));
    });

    registry
        .send(
            "a.example",
            "b.example",
            message("user@a.example", "friend@b.example", "fallback-body"),
        )
        .await
        .expect("accepted");

    timeout(Duration::from_secs(10), peer)
        .await
        .expect("peer finished")
        .expect("peer task");
    assert!(sink.is_empty());
}

#[tokio::test]
async fn verifier_session_reports_outcome_and_skips_registry() {
    let (listener, addr) = bind_listener().await;
    let sink = Arc::new(CapturingSink::new());
    let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
    registry.add_static_route("b.example", vec![addr]);

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buffer = String::new();
        read_stream_open(&mut socket, &mut buffer).await;

        socket
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:db='jabber:server:dialback' id='authoritative-sid' version='1.0'>",
            )
            .await
            .expect("write");

        let verify = read_until(&mut socket, &mut buffer, "</db:verify>").await;
        assert!(verify.contains("id='original-sid'"));
        assert!(verify.contains(">key-under-test</db:verify>"));

        socket
            .write_all(
                b"<db:verify from='b.example' to='a.example' \
                  id='original-sid' type='valid'/>",
            )
            .await
            .expect("write");
    });

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    registry.spawn_verifier(
        "a.example",
        "b.example",
        "incoming-7",
        "key-under-test",
        "original-sid",
        reply_tx,
    );

    let outcome = timeout(Duration::from_secs(10), reply_rx.recv())
        .await
        .expect("verdict in time")
        .expect("channel open");
    assert_eq!(outcome.request_id, "incoming-7");
    assert!(outcome.valid);
    assert_eq!(outcome.local, "a.example");
    assert_eq!(outcome.remote, "b.example");

    // Verifier sub-sessions never take the pair slot.
    let pair = rookery_xmpp::SessionKey::new("a.example", "b.example");
    assert!(registry.get_connections(&pair).is_empty());

    peer.await.expect("peer task");
}

#[tokio::test]
async fn established_stream_answers_verify_requests() {
    let (listener, addr) = bind_listener().await;
    let sink = Arc::new(CapturingSink::new());
    let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
    registry.add_static_route("b.example", vec![addr]);

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buffer = String::new();
        read_stream_open(&mut socket, &mut buffer).await;

        socket
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:db='jabber:server:dialback' id='peer-sid-2' version='1.0'>\
                  <stream:features>\
                  <dialback xmlns='urn:xmpp:features:dialback'/>\
                  </stream:features>",
            )
            .await
            .expect("write");

        let result = read_until(&mut socket, &mut buffer, "</db:result>").await;
        let key_start = result.find('>').expect("open tag end") + 1;
        let key_end = result.find("</db:result>").expect("close tag");
        let key = result[key_start..key_end].to_string();

        socket
            .write_all(b"<db:result from='b.example' to='a.example' type='valid'/>")
            .await
            .expect("write");
        read_until(&mut socket, &mut buffer, "</message>").await;

        // Echo the key back as a verification request on the same stream.
        let request = format!(
            "<db:verify from='b.example' to='a.example' id='whatever-sid'>{}</db:verify>",
            key
        );
        socket
            .write_all(request.as_bytes())
            .await
            .expect("write");

        let answer = read_until(&mut socket, &mut buffer, "/>").await;
        assert!(answer.contains("db:verify"));
        assert!(answer.contains("type='valid'"));

        // A wrong key is refused.
        socket
            .write_all(
                b"<db:verify from='b.example' to='a.example' \
                  id='whatever-sid'>bogus</db:verify>",
            )
            .await
            .expect("write");
        let answer = read_until(&mut socket, &mut buffer, "/>").await;
        assert!(answer.contains("type='invalid'"));
    });

    registry
        .send(
            "a.example",
            "b.example",
            message("user@a.example", "friend@b.example", "probe"),
        )
        .await
        .expect("accepted");

    timeout(Duration::from_secs(10), peer)
        .await
        .expect("peer finished")
        .expect("peer task");
}
