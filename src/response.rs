use std::fmt;
use std::io::{Cursor, Read};

use log::{debug, warn};
use tiny_http::{Header, Request, Response, StatusCode};

use crate::arg::Settings;
use crate::backend::BackendError;

pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Response payload. File and archive bodies stream from a reader; small
/// generated bodies are byte buffers.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Reader {
        r: Box<dyn Read + Send>,
        len: Option<usize>,
    },
}

/// A fully described HTTP response, decoupled from the server library so
/// handlers can be driven directly in tests.
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl GatewayResponse {
    pub fn empty(status: u16) -> GatewayResponse {
        GatewayResponse {
            status,
            headers: vec![],
            body: Body::Empty,
        }
    }

    pub fn text(status: u16, body: String) -> GatewayResponse {
        GatewayResponse::empty(status)
            .with_header("Content-Type", CONTENT_TYPE_TEXT)
            .with_body(Body::Bytes(body.into_bytes()))
    }

    pub fn html(status: u16, body: String) -> GatewayResponse {
        GatewayResponse::empty(status)
            .with_header("Content-Type", CONTENT_TYPE_HTML)
            .with_body(Body::Bytes(body.into_bytes()))
    }

    pub fn redirect(status: u16, location: &str) -> GatewayResponse {
        GatewayResponse::empty(status).with_header("Location", location)
    }

    pub fn with_body(mut self, body: Body) -> GatewayResponse {
        self.body = body;
        self
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn with_header(mut self, name: &str, value: &str) -> GatewayResponse {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set a header, replacing existing entries with the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Merge headers in front of the response's own; headers the response
    /// already carries win over merged ones of the same name.
    pub fn merge_headers(mut self, headers: &[(String, String)]) -> GatewayResponse {
        let mut merged: Vec<(String, String)> = vec![];
        for (k, v) in headers {
            if self.header(k).is_none() {
                merged.push((k.clone(), v.clone()));
            }
        }
        merged.append(&mut self.headers);
        self.headers = merged;
        self
    }
}

/// Map a backend error onto a status code, falling back to the call site's
/// default for anything without a dedicated mapping.
pub fn status_for(err: &BackendError, default: u16) -> u16 {
    match err {
        BackendError::Offline => 503,
        BackendError::DeadlineExceeded | BackendError::Cancelled => 408,
        BackendError::NoLink(_) => 404,
        BackendError::NotFound(_) => 404,
        _ => default,
    }
}

/// Plain-text error body of the form `<prefix>: <err>`.
pub fn error_body(status: u16, prefix: &str, err: &dyn fmt::Display) -> GatewayResponse {
    if status >= 500 {
        warn!("server error: {}: {}", prefix, err);
    }
    GatewayResponse::text(status, format!("{}: {}", prefix, err))
}

pub fn web_error(prefix: &str, err: &BackendError, default: u16) -> GatewayResponse {
    error_body(status_for(err, default), prefix, err)
}

/// The user-configured headers merged into every response, plus a Server
/// header identifying the daemon.
pub fn user_headers(settings: &Settings) -> Vec<(String, String)> {
    let mut headers = settings.headers.clone();
    headers.push((
        String::from("Server"),
        format!("dagway/{}, tiny_http (Rust)", env!("CARGO_PKG_VERSION")),
    ));
    headers
}

/// Response to an OPTIONS preflight: the user headers and nothing else.
pub fn preflight(settings: &Settings) -> GatewayResponse {
    let mut res = GatewayResponse::empty(200);
    res.headers = user_headers(settings);
    debug!("served options request");
    res
}

/// Write a finished response back to the client. A scheduled redirect
/// (Location header present) upgrades a default 200 to a 301 so upstream
/// layers can stream a body to non-following clients.
pub fn respond(req: Request, mut res: GatewayResponse) {
    if res.status == 200 && res.header("Location").is_some() {
        debug!("scheduled redirect, upgrading status to 301");
        res.status = 301;
    }

    let mut headers: Vec<Header> = vec![];
    for (k, v) in &res.headers {
        match Header::from_bytes(k.as_bytes(), v.as_bytes()) {
            Ok(h) => headers.push(h),
            Err(_) => debug!("dropping malformed header {}", k),
        }
    }

    let status = StatusCode(res.status);
    let result = match res.body {
        Body::Empty => req.respond(Response::new(status, headers, std::io::empty(), Some(0), None)),
        Body::Bytes(data) => {
            let len = data.len();
            req.respond(Response::new(status, headers, Cursor::new(data), Some(len), None))
        }
        Body::Reader { r, len } => req.respond(Response::new(status, headers, r, len, None)),
    };
    if let Err(e) = result {
        // the client going away mid-body is ordinary churn
        debug!("response aborted: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::{status_for, web_error, Body, GatewayResponse};
    use crate::backend::BackendError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&BackendError::Offline, 500), 503);
        assert_eq!(status_for(&BackendError::DeadlineExceeded, 500), 408);
        assert_eq!(status_for(&BackendError::NoLink(String::from("x")), 500), 404);
        assert_eq!(status_for(&BackendError::NotDagNode, 400), 400);
        assert_eq!(status_for(&BackendError::Other(String::from("x")), 500), 500);
    }

    #[test]
    fn test_error_body_shape() {
        let res = web_error("resolve /ipfs/x", &BackendError::Offline, 500);
        assert_eq!(res.status, 503);
        match res.body {
            Body::Bytes(b) => assert_eq!(
                String::from_utf8(b).unwrap(),
                "resolve /ipfs/x: backend is offline or has no route"
            ),
            _ => panic!("want bytes body"),
        }
    }

    #[test]
    fn test_merge_headers_prefers_own() {
        let res = GatewayResponse::empty(200)
            .with_header("Content-Type", "text/html")
            .merge_headers(&[
                (String::from("Content-Type"), String::from("text/plain")),
                (String::from("X-Extra"), String::from("1")),
            ]);
        assert_eq!(res.header("Content-Type"), Some("text/html"));
        assert_eq!(res.header("X-Extra"), Some("1"));
    }

    #[test]
    fn test_set_header_replaces() {
        let mut res = GatewayResponse::empty(200).with_header("Etag", "\"a\"");
        res.set_header("Etag", "\"b\"");
        assert_eq!(res.headers.iter().filter(|(k, _)| k == "Etag").count(), 1);
        assert_eq!(res.header("etag"), Some("\"b\""));
    }
}
