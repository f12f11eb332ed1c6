use httpmock::prelude::*;
use spotguard::imds::ImdsClient;

const TOKEN_PATH: &str = "/latest/api/token";
const TERMINATION_PATH: &str = "/latest/meta-data/spot/termination-time";

// ---------------------------------------------------------------------------
// Test 1: detection arms the probe and caches a token
// ---------------------------------------------------------------------------
#[tokio::test]
async fn detect_fetches_a_token() {
    let server = MockServer::start();
    let token_mock = server.mock(|when, then| {
        when.method(PUT)
            .path(TOKEN_PATH)
            .header("X-aws-ec2-metadata-token-ttl-seconds", "21600");
        then.status(200).body("tok-1");
    });

    let client = ImdsClient::detect(&server.base_url()).await.unwrap();
    assert!(client.is_some());
    token_mock.assert();
}

// ---------------------------------------------------------------------------
// Test 2: unreachable metadata service disables the probe
// ---------------------------------------------------------------------------
#[tokio::test]
async fn detect_unreachable_disables_the_probe() {
    // Nothing listens on the discard port.
    let client = ImdsClient::detect("http://127.0.0.1:9").await.unwrap();
    assert!(client.is_none());
}

// ---------------------------------------------------------------------------
// Test 3: 404 means no preemption notice
// ---------------------------------------------------------------------------
#[tokio::test]
async fn not_notified_on_404() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(200).body("tok-1");
    });
    server.mock(|when, then| {
        when.method(GET)
            .path(TERMINATION_PATH)
            .header("X-aws-ec2-metadata-token", "tok-1");
        then.status(404);
    });

    let mut client = ImdsClient::detect(&server.base_url()).await.unwrap().unwrap();
    assert!(!client.termination_notified().await.unwrap());
}

// ---------------------------------------------------------------------------
// Test 4: 200 means the notice is up
// ---------------------------------------------------------------------------
#[tokio::test]
async fn notified_on_200() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(200).body("tok-1");
    });
    server.mock(|when, then| {
        when.method(GET).path(TERMINATION_PATH);
        then.status(200).body("2026-08-02T12:34:56Z");
    });

    let mut client = ImdsClient::detect(&server.base_url()).await.unwrap().unwrap();
    assert!(client.termination_notified().await.unwrap());
}

// ---------------------------------------------------------------------------
// Test 5: a 401 refreshes the token exactly once and retries
// ---------------------------------------------------------------------------
#[tokio::test]
async fn stale_token_is_refreshed_once() {
    let server = MockServer::start();

    let mut stale_token = server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(200).body("stale");
    });
    server.mock(|when, then| {
        when.method(GET)
            .path(TERMINATION_PATH)
            .header("X-aws-ec2-metadata-token", "stale");
        then.status(401);
    });
    server.mock(|when, then| {
        when.method(GET)
            .path(TERMINATION_PATH)
            .header("X-aws-ec2-metadata-token", "fresh");
        then.status(200).body("2026-08-02T12:34:56Z");
    });

    let mut client = ImdsClient::detect(&server.base_url()).await.unwrap().unwrap();

    // The next token request hands out the fresh one.
    stale_token.delete();
    let fresh_token = server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(200).body("fresh");
    });

    assert!(client.termination_notified().await.unwrap());
    fresh_token.assert();
}

// ---------------------------------------------------------------------------
// Test 6: a second 401 after the refresh surfaces an error
// ---------------------------------------------------------------------------
#[tokio::test]
async fn second_401_is_an_error() {
    let server = MockServer::start();
    let token_mock = server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(200).body("tok-1");
    });
    let termination_mock = server.mock(|when, then| {
        when.method(GET).path(TERMINATION_PATH);
        then.status(401);
    });

    let mut client = ImdsClient::detect(&server.base_url()).await.unwrap().unwrap();
    assert!(client.termination_notified().await.is_err());

    // One fetch at detection, one refresh; one probe, one retry.
    token_mock.assert_hits(2);
    termination_mock.assert_hits(2);
}

// ---------------------------------------------------------------------------
// Test 7: token endpoint refusing with a status is a hard error
// ---------------------------------------------------------------------------
#[tokio::test]
async fn token_rejection_surfaces() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT).path(TOKEN_PATH);
        then.status(403);
    });

    assert!(ImdsClient::detect(&server.base_url()).await.is_err());
}
