//! Inbound HTTP control surface.
//!
//! The platform drives the watchdog through form-encoded POSTs under the
//! `/Watchdog/` path prefix. The listener is deliberately minimal: one
//! accept task handles connections fully sequentially, because a handler
//! only parses the body, appends a typed request to a buffer, and answers
//! with a small JSON acknowledgement — requests are never applied here. The
//! supervisor loop drains the buffers on its own tick.
//!
//! Endpoints are a closed set dispatched by path suffix ([`Endpoint`]);
//! unmatched paths get a 404. A malformed body is rejected with
//! `{"success":0,…}` and never buffered.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiToken;
use crate::session::GameState;

/// Fixed path prefix all control endpoints live under.
pub const API_PATH_PREFIX: &str = "/Watchdog/";

/// Guard against nonsense bodies; real requests are a few hundred bytes.
const MAX_BODY_BYTES: usize = 256 * 1024;

const INCOMPLETE_REQUEST: &str = "Request incomplete. Missing required fields";

const BODY_TOO_LARGE: &str = "Request body too large";

/// A buffered `SetMonth` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMonthRequest {
    pub game_session_token: String,
    pub month: i32,
}

/// One requested simulation in an `UpdateState` body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationRequest {
    pub simulation_type: String,
    /// Empty means "latest available".
    #[serde(default)]
    pub simulation_version: String,
}

/// A buffered `UpdateState` request.
#[derive(Debug, Clone)]
pub struct UpdateStateRequest {
    pub game_session_token: String,
    /// Platform API root for this session.
    pub game_session_api: String,
    pub game_state: GameState,
    pub access_token: ApiToken,
    pub recovery_token: ApiToken,
    pub required_simulations: Vec<SimulationRequest>,
    pub month: i32,
}

/// Pending-request buffers shared between the HTTP task (appends) and the
/// supervisor loop (drains). Drain-then-clear happens atomically under the
/// lock, so nothing is lost or applied twice.
#[derive(Debug, Default)]
pub struct RequestBuffers {
    set_month: Mutex<Vec<SetMonthRequest>>,
    update_state: Mutex<Vec<UpdateStateRequest>>,
}

impl RequestBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_set_month(&self, request: SetMonthRequest) {
        self.set_month
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }

    pub fn push_update_state(&self, request: UpdateStateRequest) {
        self.update_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }

    /// Take all pending `SetMonth` requests, leaving the buffer empty.
    pub fn drain_set_month(&self) -> Vec<SetMonthRequest> {
        std::mem::take(&mut *self.set_month.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Take all pending `UpdateState` requests, leaving the buffer empty.
    pub fn drain_update_state(&self) -> Vec<UpdateStateRequest> {
        std::mem::take(
            &mut *self
                .update_state
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }
}

/// The registered endpoints, dispatched by the path suffix after
/// [`API_PATH_PREFIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    SetMonth,
    UpdateState,
}

impl Endpoint {
    fn from_suffix(suffix: &str) -> Option<Self> {
        if suffix.eq_ignore_ascii_case("SetMonth") {
            Some(Self::SetMonth)
        } else if suffix.eq_ignore_ascii_case("UpdateState") {
            Some(Self::UpdateState)
        } else {
            None
        }
    }

    /// Parse the form body into a typed request and buffer it.
    fn handle(self, form: &HashMap<String, String>, buffers: &RequestBuffers) -> Result<(), String> {
        match self {
            Self::SetMonth => {
                buffers.push_set_month(parse_set_month(form)?);
            }
            Self::UpdateState => {
                buffers.push_update_state(parse_update_state(form)?);
            }
        }
        Ok(())
    }
}

fn parse_set_month(form: &HashMap<String, String>) -> Result<SetMonthRequest, String> {
    let game_session_token = form
        .get("game_session_token")
        .ok_or(INCOMPLETE_REQUEST)?
        .clone();
    let month = form
        .get("month")
        .and_then(|m| m.parse::<i32>().ok())
        .ok_or(INCOMPLETE_REQUEST)?;
    Ok(SetMonthRequest {
        game_session_token,
        month,
    })
}

fn parse_update_state(form: &HashMap<String, String>) -> Result<UpdateStateRequest, String> {
    let field = |name: &str| form.get(name).cloned().ok_or(INCOMPLETE_REQUEST);

    let game_session_token = field("game_session_token")?;
    let game_session_api = field("game_session_api")?;
    let game_state = GameState::parse(&field("game_state")?);
    let access_token = ApiToken::parse_lenient(&field("api_access_token")?);
    let recovery_token = ApiToken::parse_lenient(&field("api_access_recovery_token")?);
    let month = field("month")?
        .parse::<i32>()
        .map_err(|_| INCOMPLETE_REQUEST.to_string())?;

    let required_simulations: Vec<SimulationRequest> =
        serde_json::from_str(&field("required_simulations")?)
            .map_err(|e| format!("Could not parse required_simulations: {e}"))?;

    Ok(UpdateStateRequest {
        game_session_token,
        game_session_api,
        game_state,
        access_token,
        recovery_token,
        required_simulations,
        month,
    })
}

/// Decode an `application/x-www-form-urlencoded` body into a key→value map.
fn parse_form(body: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        values.insert(decode(key), decode(value));
    }
    values
}

/// The HTTP listener for the control surface.
pub struct IngressServer {
    listener: TcpListener,
}

impl IngressServer {
    /// Bind the control surface on all interfaces at `port`. Port 0 picks a
    /// free port (used by tests).
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(
            "Starting REST API at http://+:{}{API_PATH_PREFIX}",
            listener.local_addr()?.port()
        );
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and handle connections one at a time until cancelled.
    ///
    /// Sequential handling is fine here: a handler never blocks on anything
    /// but the socket itself, and buffering keeps it out of the supervisor's
    /// way.
    pub async fn serve(self, buffers: std::sync::Arc<RequestBuffers>, cancel: CancellationToken) {
        info!("Control-surface accept loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Control surface cancelled");
                    return;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Handling request from {addr}");
                            if let Err(e) = handle_connection(stream, &buffers).await {
                                warn!("Control-surface connection error: {e}");
                            }
                        }
                        Err(e) => {
                            warn!("Control-surface accept error: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    buffers: &RequestBuffers,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let target = request_line.split_whitespace().nth(1).unwrap_or("");
    let path = target.split('?').next().unwrap_or("");

    // Headers: only Content-Length matters to us.
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let endpoint = match_endpoint(path);
    let Some(endpoint) = endpoint else {
        debug!("No endpoint for {path}, returning 404");
        return write_response(reader.into_inner(), "404 Not Found", "").await;
    };

    if content_length > MAX_BODY_BYTES {
        debug!("Rejecting {endpoint:?} request with {content_length} byte body");
        discard_body(&mut reader, content_length).await?;
        let ack =
            serde_json::json!({ "success": 0, "message": BODY_TOO_LARGE }).to_string();
        return write_response(reader.into_inner(), "200 OK", &ack).await;
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    let body = String::from_utf8_lossy(&body);
    let form = parse_form(&body);

    let (success, message) = match endpoint.handle(&form, buffers) {
        Ok(()) => (1, String::new()),
        Err(message) => {
            debug!("Rejected {endpoint:?} request: {message}");
            (0, message)
        }
    };

    let ack = serde_json::json!({ "success": success, "message": message }).to_string();
    write_response(reader.into_inner(), "200 OK", &ack).await
}

/// Read and throw away an oversized body so the acknowledgement is not
/// written into a half-sent request.
async fn discard_body(
    reader: &mut BufReader<TcpStream>,
    mut remaining: usize,
) -> std::io::Result<()> {
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let limit = remaining.min(scratch.len());
        let n = reader.read(&mut scratch[..limit]).await?;
        if n == 0 {
            break;
        }
        remaining -= n;
    }
    Ok(())
}

fn match_endpoint(path: &str) -> Option<Endpoint> {
    let prefix = path
        .to_ascii_lowercase()
        .find(&API_PATH_PREFIX.to_ascii_lowercase())?;
    let suffix = &path[prefix + API_PATH_PREFIX.len()..];
    Endpoint::from_suffix(suffix)
}

async fn write_response(
    mut stream: TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_decoding_handles_escapes_and_plus() {
        let form = parse_form("a=1&token=ab%3Dcd&name=two+words&empty=");
        assert_eq!(form["a"], "1");
        assert_eq!(form["token"], "ab=cd");
        assert_eq!(form["name"], "two words");
        assert_eq!(form["empty"], "");
    }

    #[test]
    fn endpoint_matching_is_prefix_and_suffix_based() {
        assert_eq!(match_endpoint("/Watchdog/SetMonth"), Some(Endpoint::SetMonth));
        assert_eq!(
            match_endpoint("/Watchdog/UpdateState"),
            Some(Endpoint::UpdateState)
        );
        assert_eq!(match_endpoint("/watchdog/setmonth"), Some(Endpoint::SetMonth));
        assert_eq!(match_endpoint("/Watchdog/Unknown"), None);
        assert_eq!(match_endpoint("/other/SetMonth"), None);
    }

    #[test]
    fn set_month_requires_all_fields() {
        let ok = parse_form("game_session_token=T1&month=5");
        let request = parse_set_month(&ok).unwrap();
        assert_eq!(request.game_session_token, "T1");
        assert_eq!(request.month, 5);

        let missing = parse_form("game_session_token=T1");
        assert_eq!(parse_set_month(&missing).unwrap_err(), INCOMPLETE_REQUEST);

        let bad_month = parse_form("game_session_token=T1&month=soon");
        assert_eq!(parse_set_month(&bad_month).unwrap_err(), INCOMPLETE_REQUEST);
    }

    #[test]
    fn update_state_parses_a_full_body() {
        let body = concat!(
            "game_session_token=T1",
            "&game_session_api=http%3A%2F%2Fhost%2Fapi%2F",
            "&game_state=Play",
            "&api_access_token=%7B%22token%22%3A%22acc%22%7D",
            "&api_access_recovery_token=raw-recovery",
            "&required_simulations=%5B%7B%22simulation_type%22%3A%22MEL%22%2C%22simulation_version%22%3A%221.0.0%22%7D%5D",
            "&month=7",
        );
        let request = parse_update_state(&parse_form(body)).unwrap();
        assert_eq!(request.game_session_token, "T1");
        assert_eq!(request.game_session_api, "http://host/api/");
        assert_eq!(request.game_state, GameState::Play);
        assert_eq!(request.access_token.as_str(), "acc");
        assert_eq!(request.recovery_token.as_str(), "raw-recovery");
        assert_eq!(request.required_simulations.len(), 1);
        assert_eq!(request.required_simulations[0].simulation_type, "MEL");
        assert_eq!(request.month, 7);
    }

    #[test]
    fn update_state_rejects_malformed_simulation_list() {
        let mut form = parse_form(
            "game_session_token=T1&game_session_api=a&game_state=Play\
             &api_access_token=t&api_access_recovery_token=r&month=0",
        );
        form.insert("required_simulations".to_string(), "not json".to_string());
        assert!(parse_update_state(&form)
            .unwrap_err()
            .contains("required_simulations"));
    }

    #[test]
    fn drain_clears_the_buffer() {
        let buffers = RequestBuffers::new();
        buffers.push_set_month(SetMonthRequest {
            game_session_token: "T1".to_string(),
            month: 1,
        });
        buffers.push_set_month(SetMonthRequest {
            game_session_token: "T1".to_string(),
            month: 2,
        });

        let drained = buffers.drain_set_month();
        assert_eq!(drained.len(), 2);
        assert!(buffers.drain_set_month().is_empty());
    }

    #[test]
    fn concurrent_appends_are_never_lost() {
        use std::sync::Arc;

        let buffers = Arc::new(RequestBuffers::new());
        let writer = {
            let buffers = Arc::clone(&buffers);
            std::thread::spawn(move || {
                for month in 0..1000 {
                    buffers.push_set_month(SetMonthRequest {
                        game_session_token: "T1".to_string(),
                        month,
                    });
                }
            })
        };

        let mut seen = 0;
        while seen < 1000 {
            seen += buffers.drain_set_month().len();
            if writer.is_finished() {
                seen += buffers.drain_set_month().len();
                break;
            }
        }
        writer.join().unwrap();
        seen += buffers.drain_set_month().len();
        assert_eq!(seen, 1000);
    }
}
