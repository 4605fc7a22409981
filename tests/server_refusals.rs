//! Refusal paths of the acceptor: every rejected association receives a
//! structured reason before the transport closes

use std::sync::Arc;
use std::time::Duration;

use assoc::transport::{AssociationChannel, AssociationRequest, FramedChannel, Pdu};
use assoc::{
    AssocConfig, AssocError, AssocScp, AssocScu, ClientAssociation, ProfileStore, RefusalReason,
    RemoteNode, VERIFICATION_SOP_CLASS,
};

const CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const IMPLICIT_LE: &str = "1.2.840.10008.1.2";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn verification_store() -> Arc<ProfileStore> {
    let mut store = ProfileStore::new();
    store.add_transfer_syntax("TS", IMPLICIT_LE).unwrap();
    store
        .add_presentation_context("Ctx", VERIFICATION_SOP_CLASS, "TS")
        .unwrap();
    store.add_profile("Default", "Ctx", None, None).unwrap();
    Arc::new(store)
}

fn server_config(port: u16) -> AssocConfig {
    AssocConfig {
        local_aet: "TEST_SCP".to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        port,
        accept_timeout_ms: Some(100),
        max_workers: 4,
        profile: "Default".to_string(),
        ..Default::default()
    }
}

fn client_scu(store: Arc<ProfileStore>) -> AssocScu {
    let config = AssocConfig {
        local_aet: "TEST_SCU".to_string(),
        ..Default::default()
    };
    AssocScu::new(config, store)
}

async fn open_with_retry(
    scu: &AssocScu,
    node: &RemoteNode,
    profile: &str,
) -> Result<ClientAssociation, AssocError> {
    let mut last = None;
    for _ in 0..50 {
        match scu.open(node, profile).await {
            Err(AssocError::Network(e)) => {
                last = Some(e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
    panic!("SCP never came up: {:?}", last);
}

async fn connect_with_retry(port: u16) -> tokio::net::TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("SCP never came up on port {}", port);
}

#[tokio::test]
async fn forced_refuse_rejects_everything() {
    let port = free_port();
    let config = AssocConfig {
        forced_refuse: true,
        ..server_config(port)
    };
    let scp = AssocScp::new(config, verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("TEST_SCP", "127.0.0.1", port);
    let err = open_with_retry(&scu, &node, "Default").await.unwrap_err();
    assert!(matches!(
        err,
        AssocError::Refused(RefusalReason::ServiceRefused)
    ));

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_application_context_is_refused() {
    let port = free_port();
    let scp = AssocScp::new(server_config(port), verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let stream = connect_with_retry(port).await;
    let mut channel = FramedChannel::new(stream, "test", 65536);
    channel
        .send(Pdu::Request(AssociationRequest {
            application_context: "9.9.9".to_string(),
            calling_ae: "TEST_SCU".to_string(),
            called_ae: "TEST_SCP".to_string(),
            max_message_size: 65536,
            contexts: vec![],
            extended: vec![],
        }))
        .await
        .unwrap();
    match channel.recv().await.unwrap().unwrap() {
        Pdu::Reject { reason } => {
            assert_eq!(reason, RefusalReason::ApplicationContextNotSupported)
        }
        other => panic!("expected reject, got {:?}", other),
    }

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn wrong_called_ae_is_refused() {
    let port = free_port();
    let scp = AssocScp::new(server_config(port), verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("SOMEONE_ELSE", "127.0.0.1", port);
    let err = open_with_retry(&scu, &node, "Default").await.unwrap_err();
    assert!(matches!(
        err,
        AssocError::Refused(RefusalReason::CalledAeNotRecognized)
    ));

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn echo_called_aet_accepts_any_called_ae() {
    let port = free_port();
    let config = AssocConfig {
        echo_called_aet: true,
        ..server_config(port)
    };
    let scp = AssocScp::new(config, verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("ANY_NAME_GOES", "127.0.0.1", port);
    let association = open_with_retry(&scu, &node, "Default").await.unwrap();
    // The acceptor answers with the AE title the peer called
    assert_eq!(association.peer_ae(), "ANY_NAME_GOES");
    association.release().await.unwrap();

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn calling_ae_verifier_filters_peers() {
    let port = free_port();
    let scp = AssocScp::new(server_config(port), verification_store())
        .with_calling_ae_verifier(|calling| calling == "TRUSTED");
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("TEST_SCP", "127.0.0.1", port);
    let err = open_with_retry(&scu, &node, "Default").await.unwrap_err();
    assert!(matches!(
        err,
        AssocError::Refused(RefusalReason::CallingAeNotRecognized)
    ));

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn no_common_contexts_is_refused() {
    let port = free_port();
    let scp = AssocScp::new(server_config(port), verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    // The client only knows an abstract syntax the server does not serve
    let mut store = ProfileStore::new();
    store.add_transfer_syntax("TS", IMPLICIT_LE).unwrap();
    store
        .add_presentation_context("Ctx", CT_STORAGE, "TS")
        .unwrap();
    store.add_profile("Default", "Ctx", None, None).unwrap();

    let scu = client_scu(Arc::new(store));
    let node = RemoteNode::new("TEST_SCP", "127.0.0.1", port);
    let err = open_with_retry(&scu, &node, "Default").await.unwrap_err();
    assert!(matches!(
        err,
        AssocError::Refused(RefusalReason::NoAcceptablePresentationContexts)
    ));

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn overloaded_pool_refuses_and_recovers() {
    let port = free_port();
    let config = AssocConfig {
        max_workers: 1,
        ..server_config(port)
    };
    let scp = AssocScp::new(config, verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("TEST_SCP", "127.0.0.1", port);

    // First association occupies the only worker
    let mut first = open_with_retry(&scu, &node, "Default").await.unwrap();
    assert!(first.echo().await.unwrap());

    // Second one is refused while the worker is busy
    let err = scu.open(&node, "Default").await.unwrap_err();
    assert!(matches!(
        err,
        AssocError::Refused(RefusalReason::TooManyConnections)
    ));

    // Releasing the first association frees the worker for reuse; the
    // worker may need a moment to finish its bookkeeping
    first.release().await.unwrap();
    let mut second = None;
    for _ in 0..50 {
        match scu.open(&node, "Default").await {
            Ok(association) => {
                second = Some(association);
                break;
            }
            Err(AssocError::Refused(RefusalReason::TooManyConnections)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    second.expect("worker was never reused").release().await.unwrap();

    stop.request_stop();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_drains_in_flight_sessions() {
    let port = free_port();
    let scp = AssocScp::new(server_config(port), verification_store());
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = client_scu(verification_store());
    let node = RemoteNode::new("TEST_SCP", "127.0.0.1", port);
    let mut association = open_with_retry(&scu, &node, "Default").await.unwrap();

    // Stop while a session is in flight; the running association keeps
    // working until released
    stop.request_stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.is_finished());
    assert!(association.echo().await.unwrap());
    association.release().await.unwrap();

    server.await.unwrap().unwrap();

    // Nothing is listening any more
    assert!(
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err()
    );
}
