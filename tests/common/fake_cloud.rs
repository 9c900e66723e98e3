//! In-process fake of the identity and compute services.
//!
//! Two listeners stand in for the identity and compute ports. Responses are
//! routed by method and path; unrouted requests get `404`. Every request is
//! recorded for assertions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use kvtestbed::CloudConfig;

/// Tenant identifier returned by the fake identity service.
pub const TENANT_ID: &str = "tenant-1";
/// Token returned by the fake identity service.
pub const TOKEN_ID: &str = "token-1";

/// Request observed by the fake.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|err| panic!("request body is not JSON ({err}): {}", self.body))
    }
}

#[derive(Clone, Debug)]
struct Route {
    method: String,
    path: String,
    status: u16,
    body: String,
}

#[derive(Debug, Default)]
struct State {
    routes: Vec<Route>,
    requests: Vec<RecordedRequest>,
}

/// Running fake cloud.
#[derive(Clone, Debug)]
pub struct FakeCloud {
    identity_port: u16,
    compute_port: u16,
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    /// Starts both listeners with a successful token route installed.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let identity_port = listen(Arc::clone(&state)).await;
        let compute_port = listen(Arc::clone(&state)).await;
        let cloud = Self {
            identity_port,
            compute_port,
            state,
        };
        cloud.route(
            "POST",
            "/v2.0/tokens",
            200,
            serde_json::json!({
                "access": {"token": {"id": TOKEN_ID, "tenant": {"id": TENANT_ID}}}
            }),
        );
        cloud
    }

    /// Answers `method path` with `status` and `body`. Later routes win.
    pub fn route(&self, method: &str, path: &str, status: u16, body: serde_json::Value) {
        let body = if body.is_null() {
            String::new()
        } else {
            body.to_string()
        };
        self.lock().routes.insert(
            0,
            Route {
                method: method.to_owned(),
                path: path.to_owned(),
                status,
                body,
            },
        );
    }

    /// Answers a compute `method` on `path` below the tenant prefix.
    pub fn compute(&self, method: &str, path: &str, status: u16, body: serde_json::Value) {
        self.route(method, &format!("/v2/{TENANT_ID}/{path}"), status, body);
    }

    /// Requests observed so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Requests matching `method` and `path`.
    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.path == path)
            .collect()
    }

    /// Configuration pointing at this fake with valid credentials.
    pub fn config(&self) -> CloudConfig {
        CloudConfig {
            username: Some(String::from("tester")),
            password: Some(String::from("s3cret")),
            url: Some(String::from("http://127.0.0.1/")),
            tenant_name: Some(String::from("storage-ci")),
            identity_port: self.identity_port,
            compute_port: self.compute_port,
            image_name: String::from("storage-node"),
            key_name: String::from("ci"),
            networks: String::from("vmnet"),
            request_timeout_secs: 5,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn listen(state: Arc<Mutex<State>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, Arc::clone(&state)));
        }
    });
    port
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let route = {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.requests.push(request.clone());
        guard
            .routes
            .iter()
            .find(|route| route.method == request.method && route.path == request.path)
            .cloned()
    };
    let (status, body) = route.map_or_else(
        || (404, String::from(r#"{"itemNotFound": {"code": 404}}"#)),
        |route| (route.status, route.body),
    );
    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        reason(status),
        body.len()
    );
    stream.write_all(response.as_bytes()).await.ok();
    stream.shutdown().await.ok();
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    let head_end = loop {
        if let Some(position) = find_head_end(&buffer) {
            break position;
        }
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(chunk.get(..read)?);
    };

    let head = String::from_utf8_lossy(buffer.get(..head_end)?).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_owned();
    let path = request_line.next()?.to_owned();
    let headers: BTreeMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or_default();
    let body_start = head_end + 4;
    while buffer.len() < body_start + length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(chunk.get(..read)?);
    }
    let body = String::from_utf8_lossy(buffer.get(body_start..)?).into_owned();

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

const fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Error",
    }
}
