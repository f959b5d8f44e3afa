//! End-to-end management API tests

mod common;

use common::{subscribe, RemoteInstance, TestRelay};

#[tokio::test]
async fn domain_ban_requires_a_token() {
    let relay = TestRelay::spawn().await;

    // without a token
    let response = relay
        .client
        .post(relay.url("/api/v1/domain_ban"))
        .json(&serde_json::json!({"domain": "bad.example"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // with a valid token
    let token = relay.create_token().await;
    let response = relay
        .client
        .post(relay.url("/api/v1/domain_ban"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"domain": "bad.example", "reason": "spam"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let ban = relay
        .state
        .store
        .get_domain_ban("bad.example")
        .await
        .unwrap()
        .expect("ban row present");
    assert_eq!(ban.reason.as_deref(), Some("spam"));
}

#[tokio::test]
async fn banning_a_domain_removes_its_subscription() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    subscribe(&relay, &remote, "https://a.example/f/1").await;

    let token = relay.create_token().await;
    let response = relay
        .client
        .post(relay.url("/api/v1/domain_ban"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"domain": remote.domain}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(relay
        .state
        .store
        .get_inbox(&remote.domain)
        .await
        .unwrap()
        .is_none());

    // banning the same domain again conflicts
    let response = relay
        .client
        .post(relay.url("/api/v1/domain_ban"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"domain": remote.domain}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn login_issues_a_usable_token() {
    let relay = TestRelay::spawn().await;
    relay
        .state
        .store
        .put_user("admin", "correct horse", None)
        .await
        .unwrap();

    // wrong password
    let response = relay
        .client
        .post(relay.url("/api/v1/token"))
        .json(&serde_json::json!({"username": "admin", "password": "nope"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // correct password
    let response = relay
        .client
        .post(relay.url("/api/v1/token"))
        .json(&serde_json::json!({"username": "admin", "password": "correct horse"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("user-token="));

    let body: serde_json::Value = response.json().await.unwrap();
    let code = body["code"].as_str().unwrap().to_string();

    // the token authenticates config reads
    let response = relay
        .client
        .get(relay.url("/api/v1/config"))
        .bearer_auth(&code)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // revoking it cuts access
    let response = relay
        .client
        .delete(relay.url("/api/v1/token"))
        .bearer_auth(&code)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = relay
        .client
        .get(relay.url("/api/v1/config"))
        .bearer_auth(&code)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn config_updates_flow_through_to_policy() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    let token = relay.create_token().await;

    // turn the whitelist gate on
    let response = relay
        .client
        .post(relay.url("/api/v1/config"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"key": "whitelist-enabled", "value": "true"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // a follow from an unlisted domain bounces
    let follow = remote.follow_activity("https://a.example/f/1");
    let response = remote
        .post_activity(&relay.client, &relay.url("/inbox"), &follow)
        .await;
    assert_eq!(response.status(), 403);

    // whitelist the domain and retry
    let response = relay
        .client
        .post(relay.url("/api/v1/whitelist"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"domain": remote.domain}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let follow = remote.follow_activity("https://a.example/f/2");
    let response = remote
        .post_activity(&relay.client, &relay.url("/inbox"), &follow)
        .await;
    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn approval_required_parks_follows_until_accepted() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    let token = relay.create_token().await;

    relay
        .state
        .store
        .put_config("approval-required", "true")
        .await
        .unwrap();

    let follow = remote.follow_activity("https://a.example/f/1");
    let response = remote
        .post_activity(&relay.client, &relay.url("/inbox"), &follow)
        .await;
    assert_eq!(response.status(), 202);

    // parked: no Accept yet, not part of the subscriber set
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(remote.deliveries().is_empty());
    assert!(relay.state.store.get_inboxes().await.unwrap().is_empty());

    let pending: Vec<serde_json::Value> = relay
        .client
        .get(relay.url("/api/v1/request"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    // admin accepts; the subscriber activates and gets its Accept
    let response = relay
        .client
        .post(relay.url("/api/v1/request"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"domain": remote.domain, "accept": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let row = relay
        .state
        .store
        .get_inbox(&remote.domain)
        .await
        .unwrap()
        .unwrap();
    assert!(row.accepted);

    // Accept plus the follow-back (software is unknown, so not mastodon)
    let deliveries = remote.wait_for_deliveries(2, 5000).await;
    assert!(deliveries
        .iter()
        .any(|activity| activity["type"] == "Accept"));
}

#[tokio::test]
async fn instance_add_sends_an_outbound_follow() {
    let relay = TestRelay::spawn().await;
    let remote = RemoteInstance::spawn().await;
    let token = relay.create_token().await;

    let response = relay
        .client
        .post(relay.url("/api/v1/instance"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "actor": remote.actor_iri,
            "inbox": remote.inbox_iri,
            "software": "activityrelay"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let row = relay
        .state
        .store
        .get_inbox(&remote.domain)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.software.as_deref(), Some("activityrelay"));
    assert!(row.followid.is_some());

    let deliveries = remote.wait_for_deliveries(1, 5000).await;
    assert_eq!(deliveries[0]["type"], "Follow");
    assert_eq!(deliveries[0]["object"], remote.actor_iri);

    // adding the same instance twice conflicts
    let response = relay
        .client
        .post(relay.url("/api/v1/instance"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "actor": remote.actor_iri,
            "inbox": remote.inbox_iri
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn software_ban_relays_token_expands() {
    let relay = TestRelay::spawn().await;
    let token = relay.create_token().await;

    let response = relay
        .client
        .post(relay.url("/api/v1/software_ban"))
        .bearer_auth(&token)
        .json(&serde_json::json!({"name": "RELAYS", "reason": "no relay chains"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let created: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(created.len(), 4);

    let bans = relay.state.store.get_software_bans().await.unwrap();
    let names: Vec<&str> = bans.iter().map(|ban| ban.name.as_str()).collect();
    for expected in ["activityrelay", "activity-relay", "aoderelay", "feditools-relay"] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }
}

#[tokio::test]
async fn deleting_a_user_invalidates_its_tokens() {
    let relay = TestRelay::spawn().await;
    let admin_token = relay.create_token().await;

    // create a second user and log it in
    let response = relay
        .client
        .post(relay.url("/api/v1/user"))
        .bearer_auth(&admin_token)
        .json(&serde_json::json!({"username": "alice", "password": "wonderland1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = relay
        .client
        .post(relay.url("/api/v1/token"))
        .json(&serde_json::json!({"username": "alice", "password": "wonderland1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let alice_token = body["code"].as_str().unwrap().to_string();

    // user listing never leaks hashes
    let users: Vec<serde_json::Value> = relay
        .client
        .get(relay.url("/api/v1/user"))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(users.iter().all(|user| user.get("hash").is_none()));

    // deleting alice kills her token
    let response = relay
        .client
        .delete(relay.url("/api/v1/user"))
        .bearer_auth(&admin_token)
        .json(&serde_json::json!({"username": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = relay
        .client
        .get(relay.url("/api/v1/config"))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
