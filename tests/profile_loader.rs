//! A profile configuration file driving a live acceptor

use std::sync::Arc;
use std::time::Duration;

use assoc::loader::load_profiles_file;
use assoc::{
    AssocConfig, AssocError, AssocScp, AssocScu, ClientAssociation, ProfileStore, RemoteNode, Role,
    VERIFICATION_SOP_CLASS,
};

const CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";
const IMPLICIT_LE: &str = "1.2.840.10008.1.2";

const SERVER_CFG: &str = r#"
# Acceptor profile: verification plus CT storage, storage answered as SCP,
# with an extended negotiation payload on the storage class

[[TransferSyntaxes]]
[Uncompressed]
TransferSyntax1 = 1.2.840.10008.1.2.1
TransferSyntax2 = 1.2.840.10008.1.2

[[PresentationContexts]]
[StorageAndEcho]
PresentationContext1 = 1.2.840.10008.1.1\Uncompressed
PresentationContext2 = 1.2.840.10008.5.1.4.1.1.2\Uncompressed

[[RoleSelection]]
[StorageRoles]
Role1 = 1.2.840.10008.5.1.4.1.1.2\SCP

[[ExtendedNegotiation]]
[StorageOptions]
ExtendedNegotiation1 = 1.2.840.10008.5.1.4.1.1.2\01 02 03

[[Profiles]]
[Archive]
PresentationContexts = StorageAndEcho
Roles = StorageRoles
ExtendedNegotiation = StorageOptions
"#;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn client_store() -> Arc<ProfileStore> {
    let mut store = ProfileStore::new();
    store.add_transfer_syntax("TS", EXPLICIT_LE).unwrap();
    store.add_transfer_syntax("TS", IMPLICIT_LE).unwrap();
    store
        .add_presentation_context("Ctx", VERIFICATION_SOP_CLASS, "TS")
        .unwrap();
    store
        .add_presentation_context("Ctx", CT_STORAGE, "TS")
        .unwrap();
    store.add_role("Roles", CT_STORAGE, Role::Both).unwrap();
    store
        .add_profile("Push", "Ctx", Some("Roles"), None)
        .unwrap();
    Arc::new(store)
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

#[tokio::test]
async fn config_file_drives_roles_and_extended_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("archive.cfg");
    std::fs::write(&cfg_path, SERVER_CFG).unwrap();

    let mut store = ProfileStore::new();
    load_profiles_file(&cfg_path, &mut store).unwrap();
    assert!(store.is_server_profile("Archive"));

    let port = free_port();
    let config = AssocConfig {
        local_aet: "ARCHIVE".to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        port,
        accept_timeout_ms: Some(100),
        profile: "Archive".to_string(),
        ..Default::default()
    };
    let scp = AssocScp::new(config, Arc::new(store));
    let stop = scp.stop_handle();
    let server = tokio::spawn(scp.run());

    let scu = AssocScu::new(
        AssocConfig {
            local_aet: "MODALITY".to_string(),
            ..Default::default()
        },
        client_store(),
    );
    let node = RemoteNode::new("ARCHIVE", "127.0.0.1", port);
    let mut association = open_with_retry(&scu, &node, "Push").await.unwrap();

    // The storage context comes back with the configured SCP role: the
    // client proposed BOTH, the acceptor preferred SCP
    let storage = association
        .accepted_contexts()
        .iter()
        .find(|c| c.abstract_syntax == CT_STORAGE)
        .expect("storage context accepted");
    assert_eq!(storage.role, Role::Scp);
    assert_eq!(storage.transfer_syntax, EXPLICIT_LE);

    // The extended payload configured in the file reaches the client
    assert_eq!(association.extended().len(), 1);
    assert_eq!(association.extended()[0].abstract_syntax, CT_STORAGE);
    assert_eq!(&association.extended()[0].data[..], &[0x01, 0x02, 0x03]);

    assert!(association.echo().await.unwrap());
    association.release().await.unwrap();

    stop.request_stop();
    server.await.unwrap().unwrap();
}
