// Retrieval strategies: bypass, network-first, cache-first and the fallback chain.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Method;

use offline_proxy_engine::engine::channel::{ClientMessage, WorkerMessage};
use offline_proxy_engine::engine::interceptor::Served;
use offline_proxy_engine::engine::worker::ShellWorker;
use offline_proxy_engine::source::traits::FetchRequest;

use common::{identity, test_config, url, StubNetwork};

async fn started_worker(net: &Arc<StubNetwork>) -> ShellWorker {
    let worker = ShellWorker::new(test_config(1), net.clone()).unwrap();
    worker.start().await.unwrap();
    worker
}

fn get(path: &str) -> FetchRequest {
    FetchRequest::get(url(path))
}

fn navigate(path: &str) -> FetchRequest {
    let mut req = get(path);
    req.headers
        .insert(ACCEPT, HeaderValue::from_static("text/html,*/*;q=0.8"));
    req
}

#[tokio::test]
async fn test_bypass_never_touches_cache() {
    let net = StubNetwork::with_shell("v1");
    net.serve("/data.db", "application/octet-stream", "rows");
    let worker = started_worker(&net).await;
    let store = worker.store().clone();
    let before = store.total_entries();

    let resp = worker.fetch(get("/data.db"), None).await.unwrap();
    assert_eq!(resp.served, Served::Bypassed);
    assert_eq!(resp.response.body, Bytes::from_static(b"rows"));
    assert_eq!(net.calls_for("/data.db"), 1);
    assert_eq!(store.total_entries(), before);

    // Network failure propagates as-is and still leaves the cache alone.
    net.set_online(false);
    assert!(worker.fetch(get("/data.db"), None).await.is_err());
    assert!(worker.fetch(get("/api/items"), None).await.is_err());
    assert_eq!(store.total_entries(), before);
    for name in store.list_generations() {
        assert!(store.lookup(&name, &identity("/data.db")).is_none());
        assert!(store.lookup(&name, &identity("/api/items")).is_none());
    }
}

#[tokio::test]
async fn test_network_first_writes_through_then_falls_back() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let active = worker.store().active_generation().unwrap();

    net.serve("/index.html", "text/html", "<html>fresh</html>");
    let resp = worker.fetch(navigate("/index.html"), None).await.unwrap();
    assert_eq!(resp.served, Served::Network);
    assert_eq!(resp.response.body, Bytes::from_static(b"<html>fresh</html>"));
    let cached = worker
        .store()
        .lookup(&active, &identity("/index.html"))
        .unwrap();
    assert_eq!(cached.payload, Bytes::from_static(b"<html>fresh</html>"));

    net.set_online(false);
    let resp = worker.fetch(navigate("/index.html"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
    assert_eq!(resp.response.body, Bytes::from_static(b"<html>fresh</html>"));

    // Uncached markup falls back to the offline document.
    let resp = worker.fetch(navigate("/settings.html"), None).await.unwrap();
    assert_eq!(resp.served, Served::OfflineDocument);
    assert_eq!(resp.response.body, Bytes::from_static(b"<html>fresh</html>"));
}

#[tokio::test]
async fn test_network_first_timeout_counts_as_failure() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;

    net.set_delay(Some(Duration::from_secs(2)));
    let started = Instant::now();
    let resp = worker.fetch(navigate("/index.html"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_total_unavailability_is_synthetic_503() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let (session, _rx) = worker.connect();

    let reply = worker
        .handle_message(session, ClientMessage::ClearCache)
        .unwrap();
    assert_eq!(reply, Some(WorkerMessage::CacheCleared { success: true }));

    net.set_online(false);
    let resp = worker.fetch(navigate("/index.html"), None).await.unwrap();
    assert_eq!(resp.served, Served::Unavailable);
    assert_eq!(resp.response.status, 503);
    assert_eq!(resp.response.body, Bytes::from_static(b"Offline"));

    let resp = worker.fetch(get("/fonts/a.woff2"), None).await.unwrap();
    assert_eq!(resp.served, Served::Unavailable);
    assert_eq!(resp.response.status, 503);
}

#[tokio::test]
async fn test_cache_first_hit_revalidates_in_background() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let active = worker.store().active_generation().unwrap();
    let calls_before = net.calls_for("/styles.css");

    net.serve("/styles.css", "text/css", "body{/*refreshed*/}");
    let resp = worker.fetch(get("/styles.css"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
    assert_eq!(resp.response.body, Bytes::from_static(b"body{/*v1*/}"));

    assert!(net.wait_for_calls("/styles.css", calls_before + 1).await);

    let mut refreshed = false;
    for _ in 0..200 {
        let entry = worker
            .store()
            .lookup(&active, &identity("/styles.css"))
            .unwrap();
        if entry.payload == Bytes::from_static(b"body{/*refreshed*/}") {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed);
    assert_eq!(worker.store().list_generations(), vec![active]);
}

#[tokio::test]
async fn test_cache_first_revalidation_failure_is_discarded() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let calls_before = net.calls_for("/styles.css");

    net.set_online(false);
    let resp = worker.fetch(get("/styles.css"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
    assert!(net.wait_for_calls("/styles.css", calls_before + 1).await);

    let resp = worker.fetch(get("/styles.css"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
    assert_eq!(resp.response.body, Bytes::from_static(b"body{/*v1*/}"));
}

#[tokio::test]
async fn test_cache_first_miss_fetches_and_writes_through() {
    let net = StubNetwork::with_shell("v1");
    net.serve("/fonts/inter.woff2", "font/woff2", "glyphs");
    let worker = started_worker(&net).await;
    let active = worker.store().active_generation().unwrap();

    let resp = worker.fetch(get("/fonts/inter.woff2"), None).await.unwrap();
    assert_eq!(resp.served, Served::Network);
    assert!(worker
        .store()
        .lookup(&active, &identity("/fonts/inter.woff2"))
        .is_some());

    let resp = worker.fetch(get("/fonts/inter.woff2"), None).await.unwrap();
    assert_eq!(resp.served, Served::Cache);
}

#[tokio::test]
async fn test_non_200_is_returned_but_not_cached() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let active = worker.store().active_generation().unwrap();

    let resp = worker.fetch(get("/missing.txt"), None).await.unwrap();
    assert_eq!(resp.served, Served::Network);
    assert_eq!(resp.response.status, 404);
    assert!(worker
        .store()
        .lookup(&active, &identity("/missing.txt"))
        .is_none());
}

#[tokio::test]
async fn test_non_get_and_foreign_requests_pass_through() {
    let net = StubNetwork::with_shell("v1");
    let worker = started_worker(&net).await;
    let before = worker.store().total_entries();

    let mut post = get("/index.html");
    post.method = Method::POST;
    post.body = Some(Bytes::from_static(b"form=1"));
    let resp = worker.fetch(post, None).await.unwrap();
    assert_eq!(resp.served, Served::PassThrough);

    let foreign = FetchRequest::get(reqwest::Url::parse("https://cdn.example.com/lib.js").unwrap());
    let resp = worker.fetch(foreign, None).await.unwrap();
    assert_eq!(resp.served, Served::PassThrough);

    let vendor =
        FetchRequest::get(reqwest::Url::parse("https://fcm.googleapis.com/fcm/token").unwrap());
    let resp = worker.fetch(vendor, None).await.unwrap();
    assert_eq!(resp.served, Served::Bypassed);

    assert_eq!(worker.store().total_entries(), before);
    assert_eq!(worker.stats().bypassed, 1);
}
