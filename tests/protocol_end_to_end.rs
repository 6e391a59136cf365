//! End-to-end coverage over the real TCP transport: two full `Protocol`
//! instances, each with its own bound listener, talking over loopback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peerway::transport::tcp::TcpChannelTemplate;
use peerway::{
    Address, ChannelTemplate, DiscoveryInformation, EndpointId, Frame, FrameBody,
    IntersectingPolicy, ProtocolConfig, ProtocolDescription, ProtocolInformation, ProtocolVersion,
    Protocol,
};

fn loopback_placeholder() -> Address {
    Address::Tcp("127.0.0.1:0".parse().unwrap())
}

/// Bind a fresh `Protocol` to an OS-assigned loopback port and return it
/// alongside the address it ends up publishing.
async fn spin_up(subjects: &[&str], config: ProtocolConfig) -> (Arc<Protocol>, Address) {
    let description = ProtocolDescription::new(subjects.iter().map(|s| s.to_string()));
    let version = ProtocolVersion::new(1, 0);
    let template: Arc<dyn ChannelTemplate> = Arc::new(TcpChannelTemplate::new("127.0.0.1", 0));
    let policy = Arc::new(IntersectingPolicy {
        local: description.clone(),
    });

    let mut by_version = HashMap::new();
    by_version.insert(
        version,
        ProtocolInformation {
            version,
            message_address: loopback_placeholder(),
            data_address: loopback_placeholder(),
        },
    );

    let protocol = Arc::new(Protocol::new(
        EndpointId::generate(),
        DiscoveryInformation {
            discovery_address: loopback_placeholder(),
        },
        description,
        by_version,
        template,
        policy,
        config,
    ));
    protocol.open(&[version]).await.expect("open");
    let (_, info) = protocol
        .local_connection_points()
        .await
        .into_iter()
        .next()
        .expect("one published connection point");
    (protocol, info.message_address)
}

#[tokio::test]
async fn two_peers_handshake_then_exchange_request_response() {
    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;

    let b_for_echo = b.clone();
    b.on_arrival(
        "echo-success",
        Arc::new(|frame: &Frame| matches!(frame.body, FrameBody::Success)),
        Arc::new(move |frame: Frame| {
            let b = b_for_echo.clone();
            Box::pin(async move {
                let _ = b.reply_to(&frame, FrameBody::Success, 1).await;
            })
        }),
        false,
    )
    .await
    .expect("install echo responder");

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;

    // Allow the handshake to converge before sending application traffic.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let reply = a
        .send_and_wait(b.local_id(), FrameBody::Success, 3, Duration::from_secs(2))
        .await
        .expect("reply from peer");
    assert!(matches!(reply.body, FrameBody::Success));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn incompatible_subjects_never_approve() {
    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["ledger"], ProtocolConfig::default()).await;

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = a
        .send_and_wait(b.local_id(), FrameBody::Success, 1, Duration::from_millis(500))
        .await;
    assert!(result.is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn data_transfer_pulls_a_file_from_a_peer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let served_path = dir.path().join("payload.bin");
    let payload = vec![7u8; 4096];
    tokio::fs::write(&served_path, &payload).await.expect("write payload");

    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;

    struct FixedResolver {
        path: std::path::PathBuf,
    }
    #[async_trait::async_trait]
    impl peerway::DataRequestResolver for FixedResolver {
        async fn resolve(&self, _peer: EndpointId, _hint: &str) -> Option<std::path::PathBuf> {
            Some(self.path.clone())
        }
    }
    b.respond_to_data_requests(Arc::new(FixedResolver { path: served_path }))
        .await
        .expect("install resolver");

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let dest = dir.path().join("downloaded.bin");
    let downloaded = a
        .transfer_data(
            b.local_id(),
            "payload",
            dest.clone(),
            None,
            3,
            Duration::from_secs(5),
        )
        .await
        .expect("transfer completes");

    let bytes = tokio::fs::read(&downloaded).await.expect("read downloaded file");
    assert_eq!(bytes, payload);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn peer_loss_mid_wait_cancels_outstanding_waiters() {
    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let a_for_wait = a.clone();
    let b_id = b.local_id();
    let waiting = tokio::spawn(async move {
        a_for_wait
            .send_and_wait(b_id, FrameBody::Success, 1, Duration::from_secs(5))
            .await
    });

    // Give the send a moment to land, then tear b down; its farewell frame
    // should cancel a's outstanding waiter instead of leaving it hanging.
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiter resolves instead of hanging forever")
        .expect("waiter task did not panic");
    assert!(result.is_err());

    a.close().await;
}

#[tokio::test]
async fn graceful_disconnect_makes_the_peer_immediately_unreachable() {
    // Consecutive-miss eviction itself has dedicated coverage in
    // `monitor`'s own unit tests; this checks the other path out of the
    // registry: a peer that signs off cleanly is removed as soon as its
    // `EndpointDisconnect` arrives, without waiting out the keep-alive cycle.
    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    b.close().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = a.send_to(b.local_id(), FrameBody::Success, 1).await;
    assert!(result.is_err());

    a.close().await;
}

#[tokio::test]
async fn unknown_frame_type_gets_a_default_response() {
    // No filter and no last-chance handler installed on b: the crate's own
    // default fallback should still answer with `UnknownMessageType`.
    let (a, _a_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;
    let (b, b_addr) = spin_up(&["chat"], ProtocolConfig::default()).await;

    a.connect_to(
        b.local_id(),
        DiscoveryInformation {
            discovery_address: b_addr,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let reply = a
        .send_and_wait(
            b.local_id(),
            FrameBody::Failure {
                reason: "application-defined request b has no filter for".to_string(),
            },
            1,
            Duration::from_secs(2),
        )
        .await
        .expect("last-chance fallback still answers");
    assert!(matches!(reply.body, FrameBody::UnknownMessageType));

    a.close().await;
    b.close().await;
}
