//! End-to-end tests: a real client talks to the listener over TCP and the
//! relay delivers to a mock upstream.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::time::Duration;

use tokio::{io::AsyncReadExt, net::TcpStream};

use pretty_assertions::assert_eq;
use smtp_relay::{auth::encode_plain, client::SmtpClient};
use support::{
    harness::{SEND_FROM, SERVER_NAME},
    RelayHarness, SmtpCommand,
};

const MESSAGE: &[&str] = &[
    "From: someone@workstation.local",
    "To: y@example.com",
    "Bcc: hidden@example.com",
    "Subject: Quarterly report",
    "",
    "Hello,",
    "..a line that starts with a dot",
    ".",
];

#[tokio::test]
async fn authenticated_message_is_relayed() {
    let harness = RelayHarness::builder()
        .with_credentials("user", "secret")
        .build()
        .await
        .expect("Failed to build test harness");

    let (mut client, greeting) = harness.connect().await.unwrap();
    assert_eq!(greeting, format!("220 {SERVER_NAME} ESMTP test relay"));

    let ehlo = client.command("EHLO client.local").await.unwrap();
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN XOAUTH2"), "{ehlo}");

    assert_eq!(
        client
            .command(&format!("AUTH PLAIN {}", encode_plain("user", "secret")))
            .await
            .unwrap(),
        "235 2.7.0 Authentication successful"
    );
    assert_eq!(
        client.command("MAIL FROM:<someone@workstation.local>").await.unwrap(),
        "250 2.1.0 Ok"
    );
    assert_eq!(
        client.command("RCPT TO:<y@example.com>").await.unwrap(),
        "250 2.1.5 Ok"
    );
    assert!(client.command("DATA").await.unwrap().starts_with("354"));

    for line in &MESSAGE[..MESSAGE.len() - 1] {
        client.send(line).await.unwrap();
    }
    assert_eq!(
        client.command(MESSAGE[MESSAGE.len() - 1]).await.unwrap(),
        "250 2.0.0 Ok: relayed"
    );
    assert_eq!(client.command("QUIT").await.unwrap(), "221 2.0.0 Bye");

    let messages = harness
        .wait_for_messages(1, Duration::from_secs(5))
        .await
        .expect("Failed to deliver message");
    let content = String::from_utf8(messages[0].clone()).unwrap();

    assert!(content.contains(&format!("From: {SEND_FROM}\r\n")), "{content}");
    assert!(content.contains("To: y@example.com\r\n"), "{content}");
    assert!(content.contains("Subject: Quarterly report\r\n"), "{content}");
    assert!(content.contains("\r\n.a line that starts with a dot\r\n"), "{content}");
    assert!(!content.contains("hidden@example.com"), "{content}");

    let commands = harness.mock().commands().await;
    assert!(commands.contains(&SmtpCommand::MailFrom(format!("FROM:<{SEND_FROM}>"))));
    assert!(commands.contains(&SmtpCommand::RcptTo("TO:<y@example.com>".to_string())));
    assert!(commands.contains(&SmtpCommand::RcptTo("TO:<hidden@example.com>".to_string())));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrong_password_then_mail_is_refused() {
    let harness = RelayHarness::builder()
        .with_credentials("user", "secret")
        .build()
        .await
        .unwrap();

    let (mut client, _) = harness.connect().await.unwrap();
    client.command("EHLO client.local").await.unwrap();

    assert_eq!(
        client
            .command(&format!("AUTH PLAIN {}", encode_plain("user", "wrong")))
            .await
            .unwrap(),
        "535 5.7.8 Error: Invalid username or password"
    );
    assert_eq!(
        client.command("MAIL FROM:<someone@workstation.local>").await.unwrap(),
        "530 5.7.0 Error: authentication Required"
    );

    // LOGIN with the right credentials still works afterwards
    assert_eq!(
        client.command("AUTH LOGIN dXNlcg==").await.unwrap(),
        "334 UGFzc3dvcmQ6"
    );
    assert_eq!(
        client.command("c2VjcmV0").await.unwrap(),
        "235 2.7.0 Authentication successful"
    );

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_message_is_not_relayed() {
    let harness = RelayHarness::builder().with_max_size(128).build().await.unwrap();

    let (mut client, _) = harness.connect().await.unwrap();
    let ehlo = client.command("EHLO client.local").await.unwrap();
    assert!(ehlo.contains("SIZE 128"), "{ehlo}");

    assert!(client
        .command("MAIL FROM:<a@workstation.local> SIZE=4096")
        .await
        .unwrap()
        .starts_with("552"));

    client.command("MAIL FROM:<a@workstation.local>").await.unwrap();
    client.command("RCPT TO:<y@example.com>").await.unwrap();
    client.command("DATA").await.unwrap();
    client.send("To: y@example.com").await.unwrap();
    client.send("").await.unwrap();
    for _ in 0..8 {
        client.send(&"x".repeat(64)).await.unwrap();
    }
    assert_eq!(
        client.command(".").await.unwrap(),
        "552 5.3.4 Error: message exceeds fixed maximum message size 128"
    );

    // The session carries on
    assert_eq!(client.command("NOOP").await.unwrap(), "250 2.0.0 Ok");
    client.command("QUIT").await.unwrap();

    assert_eq!(harness.mock().connections(), 0);
    assert!(harness.mock().messages().await.is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn upstream_rejection_is_permanent() {
    let harness = RelayHarness::builder()
        .with_upstream_rcpt_rejection()
        .build()
        .await
        .unwrap();

    let (mut client, _) = harness.connect().await.unwrap();
    client.command("HELO client.local").await.unwrap();
    client.command("MAIL FROM:<a@workstation.local>").await.unwrap();
    client.command("RCPT TO:<y@example.com>").await.unwrap();
    client.command("DATA").await.unwrap();
    client.send("To: y@example.com").await.unwrap();
    client.send("").await.unwrap();
    client.send("body").await.unwrap();

    let reply = client.command(".").await.unwrap();
    assert!(reply.starts_with("554 5.0.0 Invalid recipient: 550"), "{reply}");

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_limit_is_enforced() {
    let harness = RelayHarness::builder().with_max_clients(1).build().await.unwrap();

    let (mut first, greeting) = harness.connect().await.unwrap();
    assert!(greeting.starts_with("220"));

    let (mut second, rejection) = harness.connect().await.unwrap();
    assert_eq!(
        rejection,
        format!("421 {SERVER_NAME} Too many connected clients, try again in a moment")
    );
    assert!(second.closed().await);

    // The slot frees up once the first client leaves
    first.command("QUIT").await.unwrap();
    assert!(first.closed().await);

    let mut greeting = String::new();
    for _ in 0..20 {
        let (_client, reply) = harness.connect().await.unwrap();
        greeting = reply;
        if greeting.starts_with("220") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(greeting.starts_with("220"), "{greeting}");

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_idle_sessions() {
    let harness = RelayHarness::builder().build().await.unwrap();

    let (mut client, _) = harness.connect().await.unwrap();
    client.command("EHLO client.local").await.unwrap();

    harness.shutdown().await.unwrap();

    assert_eq!(client.reply().await.unwrap(), "421 Server shutting down");
    assert!(client.closed().await);
}

#[tokio::test]
async fn implicit_tls_listener_relays() {
    let harness = RelayHarness::builder()
        .with_implicit_tls()
        .build()
        .await
        .unwrap();

    let mut client = SmtpClient::connect_tls(&harness.addr().to_string(), "localhost".to_string())
        .await
        .expect("TLS handshake with the listener");
    assert!(client.is_tls());
    assert_eq!(client.read_greeting().await.unwrap().code, 220);

    let ehlo = client.ehlo("client.local").await.unwrap();
    assert!(!ehlo.has_capability("STARTTLS"), "{ehlo:?}");

    assert_eq!(client.mail_from("a@workstation.local").await.unwrap().code, 250);
    assert_eq!(client.rcpt_to("y@example.com").await.unwrap().code, 250);
    assert_eq!(client.data().await.unwrap().code, 354);
    let reply = client
        .send_data(b"To: y@example.com\r\nSubject: over tls\r\n\r\nhello\r\n")
        .await
        .unwrap();
    assert_eq!(reply.code, 250, "{reply:?}");
    client.quit().await.unwrap();

    let messages = harness
        .wait_for_messages(1, Duration::from_secs(5))
        .await
        .unwrap();
    let content = String::from_utf8(messages[0].clone()).unwrap();
    assert!(content.contains("Subject: over tls\r\n"), "{content}");

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_tls_client_gives_up_its_slot() {
    let harness = RelayHarness::builder()
        .with_implicit_tls()
        .with_max_clients(1)
        .with_socket_timeout_ms(300)
        .build()
        .await
        .unwrap();

    // Never sends a ClientHello
    let mut silent = TcpStream::connect(harness.addr()).await.unwrap();

    let mut closed = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut closed))
        .await
        .expect("the listener should drop a client that never negotiates");
    assert_eq!(read.unwrap_or(0), 0);

    let mut greeting = None;
    for _ in 0..20 {
        let connected =
            SmtpClient::connect_tls(&harness.addr().to_string(), "localhost".to_string()).await;
        if let Ok(mut client) = connected {
            greeting = client.read_greeting().await.ok();
            if greeting.is_some() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(greeting.map(|reply| reply.code), Some(220));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn upstream_hang_up_between_messages() {
    let harness = RelayHarness::builder()
        .with_upstream_hang_up()
        .build()
        .await
        .unwrap();

    for subject in ["first", "second"] {
        let (mut client, _) = harness.connect().await.unwrap();
        client.command("EHLO client.local").await.unwrap();
        client.command("MAIL FROM:<a@workstation.local>").await.unwrap();
        client.command("RCPT TO:<y@example.com>").await.unwrap();
        client.command("DATA").await.unwrap();
        client.send("To: y@example.com").await.unwrap();
        client.send(&format!("Subject: {subject}")).await.unwrap();
        client.send("").await.unwrap();
        client.send("body").await.unwrap();
        assert_eq!(client.command(".").await.unwrap(), "250 2.0.0 Ok: relayed");
        client.command("QUIT").await.unwrap();
    }

    let messages = harness
        .wait_for_messages(2, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(harness.mock().connections(), 2);

    harness.shutdown().await.unwrap();
}
