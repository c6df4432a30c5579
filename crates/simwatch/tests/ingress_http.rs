//! End-to-end tests for the HTTP control surface: raw requests in, JSON
//! acknowledgements out, typed requests buffered for the supervisor.

use std::sync::Arc;

use simwatch::ingress::{IngressServer, RequestBuffers};
use simwatch::session::GameState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestIngress {
    addr: std::net::SocketAddr,
    buffers: Arc<RequestBuffers>,
    cancel: CancellationToken,
}

impl TestIngress {
    async fn start() -> Self {
        let buffers = Arc::new(RequestBuffers::new());
        let server = IngressServer::bind(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(Arc::clone(&buffers), cancel.clone()));
        Self {
            addr,
            buffers,
            cancel,
        }
    }

    /// POST a form body and return the raw HTTP response.
    async fn post(&self, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}

impl Drop for TestIngress {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn set_month_is_acknowledged_and_buffered() {
    let ingress = TestIngress::start().await;

    let response = ingress
        .post("/Watchdog/SetMonth", "game_session_token=T1&month=5")
        .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""success":1"#));

    let pending = ingress.buffers.drain_set_month();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].game_session_token, "T1");
    assert_eq!(pending[0].month, 5);
}

#[tokio::test]
async fn update_state_is_acknowledged_and_buffered() {
    let ingress = TestIngress::start().await;

    let body = concat!(
        "game_session_token=T2",
        "&game_session_api=http%3A%2F%2Fplatform%2Fapi%2F",
        "&game_state=Pause",
        "&api_access_token=acc",
        "&api_access_recovery_token=rec",
        "&required_simulations=%5B%5D",
        "&month=0",
    );
    let response = ingress.post("/Watchdog/UpdateState", body).await;
    assert!(response.contains(r#""success":1"#));

    let pending = ingress.buffers.drain_update_state();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].game_session_token, "T2");
    assert_eq!(pending[0].game_state, GameState::Pause);
    assert!(pending[0].required_simulations.is_empty());
}

#[tokio::test]
async fn malformed_request_is_rejected_and_not_buffered() {
    let ingress = TestIngress::start().await;

    let response = ingress
        .post("/Watchdog/SetMonth", "game_session_token=T1&month=soon")
        .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""success":0"#));
    assert!(response.contains("Request incomplete"));

    assert!(ingress.buffers.drain_set_month().is_empty());
}

#[tokio::test]
async fn oversized_body_is_rejected_and_not_buffered() {
    let ingress = TestIngress::start().await;

    // Valid fields up front, padded past the body limit: the request must
    // be rejected whole, not truncated into something parseable.
    let mut body = String::from("game_session_token=T1&month=5&padding=");
    body.push_str(&"x".repeat(300 * 1024));
    let response = ingress.post("/Watchdog/SetMonth", &body).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""success":0"#));
    assert!(response.contains("too large"));

    assert!(ingress.buffers.drain_set_month().is_empty());

    // The listener is still serving after the oversized request.
    let response = ingress
        .post("/Watchdog/SetMonth", "game_session_token=T1&month=5")
        .await;
    assert!(response.contains(r#""success":1"#));
}

#[tokio::test]
async fn unmatched_path_gets_404() {
    let ingress = TestIngress::start().await;

    let response = ingress.post("/Watchdog/DoesNotExist", "a=1").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    let response = ingress.post("/other/SetMonth", "a=1").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn sequential_requests_all_land() {
    let ingress = TestIngress::start().await;

    for month in 0..5 {
        let body = format!("game_session_token=T1&month={month}");
        let response = ingress.post("/Watchdog/SetMonth", &body).await;
        assert!(response.contains(r#""success":1"#));
    }

    let months: Vec<i32> = ingress
        .buffers
        .drain_set_month()
        .into_iter()
        .map(|r| r.month)
        .collect();
    assert_eq!(months, vec![0, 1, 2, 3, 4]);
}
