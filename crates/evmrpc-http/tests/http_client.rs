//! HTTP transport against a local mockito server.

use std::time::{Duration, Instant};

use mockito::{Matcher, Server};
use serde_json::{json, Value};

use evmrpc_core::{
    CancelExt, CancellationToken, IdGenerator, JsonRpcRequest, MethodFilter, RpcId, RpcTransport,
    RpcTransportExt, TransportConfig, TransportError, TransportKind,
};
use evmrpc_http::{BatchConfig, HttpClientConfig, HttpRequestInfo, HttpResponseInfo, HttpRpcClient};

fn fast_config() -> HttpClientConfig {
    HttpClientConfig {
        transport: TransportConfig::new(TransportKind::Http).with_retry(2, Duration::from_millis(1)),
        ..Default::default()
    }
}

fn reply(id: u64, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

#[tokio::test]
async fn typed_call_decodes_result() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Regex(r#""method"\s*:\s*"eth_chainId""#.to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(reply(1, json!("0x1")))
        .create_async()
        .await;

    let client = HttpRpcClient::new(server.url(), fast_config()).unwrap();
    let chain_id: String = client.call("eth_chainId", vec![]).await.unwrap();
    assert_eq!(chain_id, "0x1");
    mock.assert_async().await;
}

#[tokio::test]
async fn retryable_status_is_attempted_retry_count_plus_one_times() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(503)
        .with_body("unavailable")
        .expect(3)
        .create_async()
        .await;

    let client = HttpRpcClient::new(server.url(), fast_config()).unwrap();
    let err = client
        .send(JsonRpcRequest::method("eth_blockNumber", vec![]))
        .await
        .unwrap_err();
    match err {
        TransportError::Http { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "unavailable");
        }
        other => panic!("unexpected {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn method_not_found_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32601, "message": "the method does not exist" }
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let client = HttpRpcClient::new(server.url(), fast_config()).unwrap();
    let err = client
        .send(JsonRpcRequest::method("eth_foo", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32601));
    assert!(!err.to_string().is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn filtered_method_never_reaches_the_server() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", "/").expect(0).create_async().await;

    let mut config = fast_config();
    config.transport = config
        .transport
        .with_methods(MethodFilter::exclude(["eth_sendRawTransaction"]));
    let client = HttpRpcClient::new(server.url(), config).unwrap();

    let err = client
        .send(JsonRpcRequest::method("eth_sendRawTransaction", vec![json!("0x00")]))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MethodNotSupported { .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn userinfo_becomes_basic_auth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .with_body(reply(1, json!("0x10")))
        .create_async()
        .await;

    let url = server.url().replacen("http://", "http://user:pass@", 1);
    let client = HttpRpcClient::new(&url, fast_config()).unwrap();
    assert!(!client.url().contains("pass@"));

    let block: String = client.call("eth_blockNumber", vec![]).await.unwrap();
    assert_eq!(block, "0x10");
    mock.assert_async().await;
}

#[tokio::test]
async fn extra_headers_are_sent() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("x-api-key", "k1")
        .with_status(200)
        .with_body(reply(1, json!("0x1")))
        .create_async()
        .await;

    let config = HttpClientConfig {
        headers: vec![("x-api-key".into(), "k1".into())],
        ..fast_config()
    };
    let client = HttpRpcClient::new(server.url(), config).unwrap();
    let _: String = client.call("eth_chainId", vec![]).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn raw_mode_hands_back_node_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "id": 42,
                "error": { "code": 3, "message": "execution reverted", "data": "0x08c379a0" }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let mut config = fast_config();
    config.transport = config.transport.with_raw(true);
    let client = HttpRpcClient::new(server.url(), config).unwrap();

    let resp = client
        .send(JsonRpcRequest::new(42u64, "eth_call", vec![]))
        .await
        .unwrap();
    let error = resp.error.unwrap();
    assert_eq!(error.code, 3);
    assert_eq!(error.data, Some(json!("0x08c379a0")));
}

#[tokio::test]
async fn hooks_observe_each_post() {
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use std::sync::Arc;

    let mut server = Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(reply(1, json!("0x1")))
        .create_async()
        .await;

    let requests = Arc::new(AtomicUsize::new(0));
    let status = Arc::new(AtomicU16::new(0));
    let config = HttpClientConfig {
        on_request: Some({
            let requests = requests.clone();
            Arc::new(move |info: &HttpRequestInfo<'_>| {
                assert!(info.body.contains("eth_chainId"));
                requests.fetch_add(1, Ordering::SeqCst);
            })
        }),
        on_response: Some({
            let status = status.clone();
            Arc::new(move |info: &HttpResponseInfo<'_>| status.store(info.status, Ordering::SeqCst))
        }),
        ..fast_config()
    };
    let client = HttpRpcClient::new(server.url(), config).unwrap();
    let _: String = client.call("eth_chainId", vec![]).await.unwrap();

    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(status.load(Ordering::SeqCst), 200);
}

#[tokio::test]
async fn concurrent_calls_share_one_batch_post() {
    let mut server = Server::new_async().await;
    // Wire ids come from the client's generator in scheduling order;
    // the reply lists them out of order on purpose.
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#"^\["#.to_string()))
        .with_status(200)
        .with_body(
            json!([
                { "jsonrpc": "2.0", "id": 101, "result": "0xb" },
                { "jsonrpc": "2.0", "id": 100, "result": "0xa" }
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let config = HttpClientConfig {
        batch: Some(BatchConfig {
            batch_size: 2,
            wait: Duration::from_secs(60),
        }),
        ids: IdGenerator::starting_at(100),
        ..fast_config()
    };
    let client = HttpRpcClient::new(server.url(), config).unwrap();

    let (a, b) = tokio::join!(
        client.send(JsonRpcRequest::new("first", "eth_getBalance", vec![])),
        client.send(JsonRpcRequest::new("second", "eth_getCode", vec![])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, RpcId::from("first"));
    assert_eq!(a.result.unwrap(), "0xa");
    assert_eq!(b.id, RpcId::from("second"));
    assert_eq!(b.result.unwrap(), "0xb");
    mock.assert_async().await;
}

#[tokio::test]
async fn explicit_batch_is_one_post() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body(
            json!([
                { "jsonrpc": "2.0", "id": 1, "result": "0x1" },
                { "jsonrpc": "2.0", "id": 2, "result": "0x2" }
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let client = HttpRpcClient::new(server.url(), fast_config()).unwrap();
    let replies = client
        .send_batch(vec![
            JsonRpcRequest::new(1u64, "eth_chainId", vec![]),
            JsonRpcRequest::new(2u64, "net_version", vec![]),
        ])
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(503)
        .create_async()
        .await;

    let config = HttpClientConfig {
        transport: TransportConfig::new(TransportKind::Http).with_retry(5, Duration::from_secs(10)),
        ..Default::default()
    };
    let client = HttpRpcClient::new(server.url(), config).unwrap();
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
    }

    let started = Instant::now();
    let err = client
        .send(JsonRpcRequest::method("eth_blockNumber", vec![]))
        .with_cancel(&token)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
