// End-to-end reconciliation of a SCIM directory into a file-backed identity store

use base64::Engine;
use dirsync::invalidation::InvalidationChannel;
use dirsync::secrets::SecretCipher;
use dirsync::store::{IdentityStore, SqliteIdentityStore};
use mockito::{Mock, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;
use sync_manager::service::registry_factory;
use sync_manager::{
    ProviderContext, SourceConfig, SourceStore, SqliteSourceStore, SyncReport, SyncService,
};
use tempfile::TempDir;

const USERS_PATH: &str = "/scim/v2/Users?startIndex=1&count=100";

struct Harness {
    _dir: TempDir,
    service: SyncService,
    sources: Arc<SqliteSourceStore>,
    identities: Arc<SqliteIdentityStore>,
}

fn harness(server_url: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    let cipher = SecretCipher::from_base64_key(&key).unwrap();

    let sources =
        Arc::new(SqliteSourceStore::new(dir.path().join("sources.db"), Some(cipher)).unwrap());
    sources
        .save_source(&SourceConfig {
            owner: "admin".to_string(),
            name: "okta-scim".to_string(),
            organization: "acme".to_string(),
            provider_type: "SCIM".to_string(),
            host: format!("{}/scim/v2", server_url),
            password: "scim-bearer-token".to_string(),
            is_enabled: true,
            ..Default::default()
        })
        .unwrap();
    let identities = Arc::new(SqliteIdentityStore::new(dir.path().join("identity.db")).unwrap());

    let service = SyncService::new(
        sources.clone(),
        identities.clone(),
        InvalidationChannel::disabled("pod-e2e".to_string()),
        registry_factory(ProviderContext {
            tunnel: None,
            http_timeout: Duration::from_secs(5),
        }),
        100,
    );
    Harness {
        _dir: dir,
        service,
        sources,
        identities,
    }
}

async fn mock_users(server: &mut ServerGuard, alice_email: &str) -> Mock {
    let body = format!(
        r#"{{
            "totalResults": 2,
            "Resources": [
                {{"id": "2819c223", "userName": "alice", "displayName": "Alice Jensen",
                  "emails": [{{"value": "{}", "primary": true}}], "active": true}},
                {{"id": "902c246b", "userName": "bob", "name": {{"givenName": "Bob", "familyName": "Ng"}},
                  "emails": [{{"value": "bob@acme.io"}}], "active": false}}
            ]
        }}"#,
        alice_email
    );
    server
        .mock("GET", USERS_PATH)
        .match_header("authorization", "Bearer scim-bearer-token")
        .with_status(200)
        .with_header("content-type", "application/scim+json")
        .with_body(body)
        .create_async()
        .await
}

fn counts(report: &SyncReport) -> (usize, usize, usize) {
    (report.inserted, report.updated, report.skipped)
}

/// Insert, then patch one drifted user, then settle.
#[tokio::test]
async fn test_scim_runs_insert_update_settle() {
    let mut server = Server::new_async().await;
    let h = harness(&server.url());

    let mock = mock_users(&mut server, "alice@acme.io").await;
    let first = h.service.run_sync_once("admin/okta-scim").await.unwrap();
    assert_eq!(counts(&first), (2, 0, 0));
    mock.remove_async().await;

    let _drifted = mock_users(&mut server, "alice.jensen@acme.io").await;
    let second = h.service.run_sync_once("admin/okta-scim").await.unwrap();
    assert_eq!(counts(&second), (0, 1, 1));

    let third = h.service.run_sync_once("admin/okta-scim").await.unwrap();
    assert_eq!(counts(&third), (0, 0, 2));

    let users = h.identities.find_users("acme").unwrap();
    let alice = users.iter().find(|s| s.user.name == "alice").unwrap();
    assert_eq!(alice.user.email, "alice.jensen@acme.io");
    assert_eq!(alice.user.properties["registerSource"], "acme/okta-scim");
    let bob = users.iter().find(|s| s.user.name == "bob").unwrap();
    assert_eq!(bob.user.display_name, "Bob Ng");
    assert!(bob.user.is_forbidden);

    let source = h.sources.get_source("admin/okta-scim").unwrap().unwrap();
    assert!(source.last_sync_time.is_some());
    assert!(source.error_text.is_empty());
    assert_eq!(source.password, "scim-bearer-token");
}

/// A rejected token fails the run, records it and leaves the store untouched.
#[tokio::test]
async fn test_scim_rejected_token() {
    let mut server = Server::new_async().await;
    let h = harness(&server.url());
    let _mock = server
        .mock("GET", USERS_PATH)
        .with_status(401)
        .with_body(r#"{"detail":"invalid token"}"#)
        .create_async()
        .await;

    let err = h.service.run_sync_once("admin/okta-scim").await.unwrap_err();
    assert!(err.is_configuration());

    assert!(h.identities.find_users("acme").unwrap().is_empty());
    let source = h.sources.get_source("admin/okta-scim").unwrap().unwrap();
    assert!(source.last_sync_time.is_none());
    assert!(source.error_text.starts_with('['));
    assert!(source.error_text.contains("401"));
}

/// Upstream 5xx is transient.
#[tokio::test]
async fn test_scim_server_error_is_transient() {
    let mut server = Server::new_async().await;
    let h = harness(&server.url());
    let _mock = server.mock("GET", USERS_PATH).with_status(503).create_async().await;

    let err = h.service.run_sync_once("admin/okta-scim").await.unwrap_err();
    assert_eq!(err.kind(), "transient_network");
}
