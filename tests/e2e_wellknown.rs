//! End-to-end discovery endpoint tests

mod common;

use common::{subscribe, RemoteInstance, TestRelay};

#[tokio::test]
async fn actor_document_exposes_the_signing_key() {
    let relay = TestRelay::spawn().await;

    let actor: serde_json::Value = relay
        .client
        .get(relay.url("/actor"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(actor["type"], "Service");
    assert_eq!(actor["id"], "https://relay.example.com/actor");
    assert_eq!(actor["preferredUsername"], "relay");
    assert_eq!(
        actor["endpoints"]["sharedInbox"],
        "https://relay.example.com/inbox"
    );

    let pem = actor["publicKey"]["publicKeyPem"].as_str().unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    assert_eq!(
        actor["publicKey"]["id"],
        "https://relay.example.com/actor#main-key"
    );
}

#[tokio::test]
async fn webfinger_resolves_the_relay_account_only() {
    let relay = TestRelay::spawn().await;

    let response = relay
        .client
        .get(relay.url("/.well-known/webfinger?resource=acct:relay@relay.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let jrd: serde_json::Value = response.json().await.unwrap();
    assert_eq!(jrd["subject"], "acct:relay@relay.example.com");
    assert_eq!(jrd["links"][0]["href"], "https://relay.example.com/actor");

    let response = relay
        .client
        .get(relay.url("/.well-known/webfinger?resource=acct:someone@relay.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn nodeinfo_discovery_links_to_the_document() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    subscribe(&relay, &remote, "https://a.example/f/1").await;

    let links: serde_json::Value = relay
        .client
        .get(relay.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        links["links"][0]["href"],
        "https://relay.example.com/nodeinfo/2.0.json"
    );

    let nodeinfo: serde_json::Value = relay
        .client
        .get(relay.url("/nodeinfo/2.0.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(nodeinfo["version"], "2.0");
    assert_eq!(nodeinfo["software"]["name"], "ap-relay");
    assert_eq!(nodeinfo["protocols"][0], "activitypub");
    assert_eq!(nodeinfo["openRegistrations"], true);
    assert_eq!(nodeinfo["metadata"]["peers"][0], remote.domain);
}

#[tokio::test]
async fn followers_collection_lists_subscribed_actors() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    subscribe(&relay, &remote, "https://a.example/f/1").await;

    for path in ["/followers", "/following"] {
        let collection: serde_json::Value = relay
            .client
            .get(relay.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(collection["totalItems"], 1);
        assert_eq!(collection["items"][0], remote.actor_iri);
    }

    let outbox: serde_json::Value = relay
        .client
        .get(relay.url("/outbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outbox["totalItems"], 0);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let relay = TestRelay::spawn().await;

    let response = relay
        .client
        .get(relay.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert!(body.contains("relay_"));
}
