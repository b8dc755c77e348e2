mod common;

use common::{spawn_balancer, spawn_origin, BalancerOptions};
use serde_json::{json, Value};

#[tokio::test]
async fn liveness_endpoint_reports_ok() {
    let balancer = spawn_balancer(&[], BalancerOptions::default()).await;

    let response = reqwest::get(balancer.url("/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn list_backends_reports_registry_state() {
    let origin = spawn_origin("ok").await;
    let balancer = spawn_balancer(&[origin], BalancerOptions::default()).await;

    let servers: Value = reqwest::get(balancer.url("/servers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let servers = servers.as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["url"], format!("http://{}/", origin));
    assert_eq!(servers[0]["active"], true);
    assert_eq!(servers[0]["in_flight"], 0);
    assert!(servers[0].get("last_response_time_ms").is_some());
    assert!(servers[0].get("last_checked").is_some());
}

#[tokio::test]
async fn added_backend_appears_exactly_once_and_serves_traffic() {
    let origin = spawn_origin("added").await;
    let balancer = spawn_balancer(&[], BalancerOptions::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(balancer.url("/servers"))
        .json(&json!({ "url": format!("http://{}", origin) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let servers: Value = client
        .get(balancer.url("/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let expected = format!("http://{}/", origin);
    let matches = servers
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["url"] == expected)
        .count();
    assert_eq!(matches, 1);

    // New backends start active and receive traffic immediately.
    let response = client.get(balancer.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "added");
}

#[tokio::test]
async fn duplicate_add_fails_and_leaves_size_unchanged() {
    let origin = spawn_origin("ok").await;
    let balancer = spawn_balancer(&[origin], BalancerOptions::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(balancer.url("/servers"))
        .json(&json!({ "url": format!("http://{}", origin) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    assert_eq!(balancer.registry.len().await, 1);
}

#[tokio::test]
async fn invalid_url_is_rejected() {
    let balancer = spawn_balancer(&[], BalancerOptions::default()).await;

    let client = reqwest::Client::new();
    for bad in ["not a url", "ftp://example.com", ""] {
        let response = client
            .post(balancer.url("/servers"))
            .json(&json!({ "url": bad }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "url {:?} should be rejected", bad);
    }

    // Malformed JSON body
    let response = client
        .post(balancer.url("/servers"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    assert_eq!(balancer.registry.len().await, 0);
}

#[tokio::test]
async fn remove_backend_round_trip() {
    let origin = spawn_origin("ok").await;
    let balancer = spawn_balancer(&[origin], BalancerOptions::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .delete(balancer.url("/servers"))
        .json(&json!({ "url": format!("http://{}", origin) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(balancer.registry.len().await, 0);

    // Removing again reports not found.
    let response = client
        .delete(balancer.url("/servers"))
        .json(&json!({ "url": format!("http://{}", origin) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
