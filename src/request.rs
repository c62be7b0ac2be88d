use std::fmt::Write as FmtWrite;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use html_escape::{encode_double_quoted_attribute, encode_text};
use log::debug;
use percent_encoding::percent_decode_str;
use tiny_http::Method;
use url::Url;

use crate::arg::Settings;
use crate::backend::{Backend, BackendError, Context, UnixfsNode};
use crate::block;
use crate::file::{serve_file, FileQuery};
use crate::listing;
use crate::metrics;
use crate::path::{join_url, LogicalPath, IPFS_PATH_PREFIX, IPNS_PATH_PREFIX};
use crate::response::{
    error_body, preflight, user_headers, web_error, Body, GatewayResponse,
};
use crate::writable;

/// Hard per-request ceiling. The backend is expected to enforce its own,
/// shorter deadlines; this is the last-resort circuit breaker.
const REQUEST_DEADLINE: Duration = Duration::from_secs(3600);

const RAW_CONTENT_TYPE: &str = "application/vnd.ipld.raw";
const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car";

const PRETTY_404_FILE: &str = "ipfs-404.html";

/// An incoming request, decoupled from the server library. `gw_hostname`
/// is set by an upstream hostname rewriter when one is in play.
pub struct GatewayRequest<'a> {
    pub method: Method,
    /// Raw request URL: percent-encoded path plus optional query.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: &'a mut dyn Read,
    pub gw_hostname: Option<String>,
}

impl<'a> GatewayRequest<'a> {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Query parameters the gateway understands.
#[derive(Default)]
pub struct Query {
    pub uri: Option<String>,
    pub format: Option<String>,
    pub filename: Option<String>,
    pub download: bool,
    pub go_get: bool,
}

fn parse_query(raw: &str) -> Query {
    let mut query = Query::default();
    for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
        match k.as_ref() {
            "uri" => query.uri = Some(v.to_string()),
            "format" => query.format = Some(v.to_string()),
            "filename" => query.filename = Some(v.to_string()),
            "download" => query.download = v == "true",
            "go-get" => query.go_get = v == "1",
            _ => {}
        }
    }
    query
}

/// Everything the read-path responders need to know about the request.
pub struct ReadRequest {
    pub head: bool,
    /// Decoded path, query stripped.
    pub url_path: String,
    /// Presentation path: the sub-path prefix (if any) plus the decoded
    /// path. All generated URLs are built from this.
    pub original_url_path: String,
    pub raw_query: String,
    pub query: Query,
    pub if_none_match: Option<String>,
    pub range: Option<String>,
    pub gw_hostname: Option<String>,
}

/// Dispatch a request by method, honoring the writable switch.
pub fn process(
    settings: &Settings,
    backend: &Arc<dyn Backend>,
    req: &mut GatewayRequest,
) -> GatewayResponse {
    let ctx = Context::with_timeout(REQUEST_DEADLINE);
    match req.method.clone() {
        Method::Get => get_or_head(settings, backend, &ctx, req, false),
        Method::Head => get_or_head(settings, backend, &ctx, req, true),
        Method::Options => preflight(settings),
        Method::Post if settings.writable => writable::post(settings, backend.as_ref(), &ctx, req),
        Method::Put if settings.writable => writable::put(settings, backend.as_ref(), &ctx, req),
        Method::Delete if settings.writable => {
            writable::delete(settings, backend.as_ref(), &ctx, req)
        }
        Method::Post | Method::Put | Method::Delete => method_not_allowed(&req.method),
        other => {
            if settings.writable {
                GatewayResponse::text(
                    400,
                    format!("Method {} not allowed: bad request for {}", other, req.url),
                )
            } else {
                method_not_allowed(&other)
            }
        }
    }
}

fn method_not_allowed(method: &Method) -> GatewayResponse {
    GatewayResponse::text(
        405,
        format!("Method {} not allowed: read only access", method),
    )
    .with_header("Allow", "GET")
    .with_header("Allow", "HEAD")
    .with_header("Allow", "OPTIONS")
}

fn get_or_head(
    settings: &Settings,
    backend: &Arc<dyn Backend>,
    ctx: &Context,
    req: &GatewayRequest,
    head: bool,
) -> GatewayResponse {
    let begin = Instant::now();
    let (escaped_path, raw_query) = match req.url.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (req.url.clone(), String::new()),
    };
    let url_path = match percent_decode_str(&escaped_path).decode_utf8() {
        Ok(v) => v.to_string(),
        Err(e) => return error_body(400, "invalid path encoding", &e),
    };
    let query = parse_query(&raw_query);
    debug!("http request received for {}", url_path);

    // A reverse proxy mounting the gateway under a sub-path signals it
    // through this header; only allowlisted values are honored.
    let mut prefix = String::new();
    if let Some(header) = req.header("X-Ipfs-Gateway-Prefix") {
        for allowed in &settings.prefixes {
            if header == allowed || header.starts_with(&format!("{}/", allowed)) {
                prefix = header.to_string();
                break;
            }
        }
    }
    let original_url_path = format!("{}{}", prefix, url_path);

    // ?uri=: target of navigator.registerProtocolHandler
    if let Some(uri) = &query.uri {
        let parsed = match Url::parse(uri) {
            Ok(v) => v,
            Err(e) => return error_body(400, "failed to parse uri query parameter", &e),
        };
        let scheme = parsed.scheme();
        if scheme != "ipfs" && scheme != "ipns" {
            return error_body(
                400,
                "uri query parameter scheme must be ipfs or ipns",
                &scheme,
            );
        }
        let mut target = join_url(&[&prefix, scheme, parsed.host_str().unwrap_or(""), parsed.path()]);
        if let Some(q) = parsed.query() {
            let _ = write!(target, "?{}", q);
        }
        debug!("uri param redirect to {}", target);
        return GatewayResponse::redirect(301, &target);
    }

    // a page must not install itself as a service worker for a whole
    // namespace root
    if req.header("Service-Worker") == Some("script") && is_namespace_root(&url_path) {
        return error_body(
            400,
            "navigator.serviceWorker",
            &"registration is not allowed for this scope",
        );
    }

    let logical = match LogicalPath::from_str(&url_path) {
        Ok(v) => v,
        Err(e) => {
            if prefix.is_empty() {
                if let Some(res) = fixup_superfluous_namespace(&url_path, &raw_query) {
                    debug!("redundant namespace fixup for {}", url_path);
                    return res;
                }
            }
            return error_body(400, "invalid ipfs path", &e);
        }
    };

    let resolved = match backend.resolve_path(ctx, &logical) {
        Ok(v) => v,
        Err(BackendError::Offline) => {
            return web_error(&format!("resolve {}", escaped_path), &BackendError::Offline, 503);
        }
        Err(e) => {
            if let Some(res) = serve_pretty_404(backend.as_ref(), ctx, req, &logical) {
                return res;
            }
            return web_error(&format!("resolve {}", escaped_path), &e, 404);
        }
    };

    // finish early when the client already has the payload; suffix match
    // covers both the plain CID ETag and the DirIndex variant
    let etag_suffix = format!("{}\"", resolved.cid);
    if let Some(inm) = req.header("If-None-Match") {
        if inm.ends_with(&etag_suffix) {
            return GatewayResponse::empty(304);
        }
    }

    let mut std_headers = user_headers(settings);
    std_headers.push((String::from("X-Ipfs-Path"), url_path.clone()));
    match roots_header(backend.as_ref(), ctx, &logical) {
        Ok(roots) => std_headers.push((String::from("X-Ipfs-Roots"), roots)),
        // should never happen, the path itself resolved a moment ago
        Err(e) => return web_error("error while resolving X-Ipfs-Roots", &e, 500),
    }

    if let Some(ctype) = explicit_content_type(&query, req) {
        let res = match ctype.as_str() {
            RAW_CONTENT_TYPE => block::serve_raw(backend.as_ref(), ctx, &resolved.cid),
            CAR_CONTENT_TYPE | "application/vnd.ipld.car; version=1" => {
                block::serve_car(backend, ctx, &resolved.cid)
            }
            "application/vnd.ipld.car; version=2" => error_body(
                400,
                "failed to respond with requested content type",
                &"unsupported CARv2 format, try again with CARv1",
            ),
            other => error_body(
                400,
                "failed to respond with requested content type",
                &format!("unsupported format {:?}", other),
            ),
        };
        return res.merge_headers(&std_headers);
    }

    let node = match backend.unixfs_get(ctx, &resolved) {
        Ok(v) => v,
        Err(e) => {
            return web_error(&format!("fetch {}", escaped_path), &e, 404)
                .merge_headers(&std_headers);
        }
    };
    metrics::unixfs_get_latency().observe(logical.namespace().as_str(), begin.elapsed());

    let rreq = ReadRequest {
        head,
        url_path,
        original_url_path,
        raw_query,
        query,
        if_none_match: req.header("If-None-Match").map(|v| v.to_string()),
        range: req.header("Range").map(|v| v.to_string()),
        gw_hostname: req.gw_hostname.clone(),
    };

    let res = match node {
        UnixfsNode::File(f) => {
            let query = FileQuery {
                filename: rreq.query.filename.clone(),
                download: rreq.query.download,
            };
            serve_file(&logical, &resolved.cid, f, &query, rreq.range.as_deref())
        }
        UnixfsNode::Directory(d) => {
            listing::serve_dir(backend.as_ref(), ctx, &rreq, &resolved, d, &std_headers)
        }
        UnixfsNode::Symlink(_) | UnixfsNode::Unknown => {
            error_body(500, "internal", &"unsupported entry type")
        }
    };
    res.merge_headers(&std_headers)
}

fn is_namespace_root(url_path: &str) -> bool {
    let rest = match url_path
        .strip_prefix(IPFS_PATH_PREFIX)
        .or_else(|| url_path.strip_prefix(IPNS_PATH_PREFIX))
    {
        Some(v) => v,
        None => return false,
    };
    !rest.is_empty() && !rest.contains('/')
}

/// One resolution per non-empty path segment, joined with commas. The
/// per-segment granularity lets HTTP caches invalidate subtrees
/// independently.
fn roots_header(
    backend: &dyn Backend,
    ctx: &Context,
    logical: &LogicalPath,
) -> Result<String, BackendError> {
    let mut roots: Vec<String> = vec![];
    for prefix in logical.prefixes() {
        let resolved = backend.resolve_path(ctx, &prefix)?;
        roots.push(resolved.cid.to_string());
    }
    Ok(roots.join(","))
}

/// Explicit response format from `?format=` or the Accept header.
fn explicit_content_type(query: &Query, req: &GatewayRequest) -> Option<String> {
    match query.format.as_deref() {
        Some("raw") => return Some(String::from(RAW_CONTENT_TYPE)),
        Some("car") => return Some(String::from(CAR_CONTENT_TYPE)),
        _ => {}
    }
    let accept = req.header("Accept")?;
    if accept.starts_with("application/vnd.") {
        return Some(accept.to_string());
    }
    None
}

/// Walk from the full path up to the root looking for a user-authored 404
/// page, for clients that accept HTML.
fn serve_pretty_404(
    backend: &dyn Backend,
    ctx: &Context,
    req: &GatewayRequest,
    logical: &LogicalPath,
) -> Option<GatewayResponse> {
    let ctype = preferred_404_type(&req.header_values("Accept"))?;
    for prefix in logical.prefixes().into_iter().rev() {
        let candidate = prefix.join(PRETTY_404_FILE);
        let resolved = match backend.resolve_path(ctx, &candidate) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let file = match backend.unixfs_get(ctx, &resolved) {
            Ok(UnixfsNode::File(f)) => f,
            _ => continue,
        };
        let size = file.size?;
        debug!("using pretty 404 file at {}", candidate);
        let r = match file.body {
            crate::backend::FileBody::Seekable(r) => {
                Box::new(crate::backend::SeekableReader(r)) as Box<dyn Read + Send>
            }
            crate::backend::FileBody::Stream(r) => r,
        };
        return Some(
            GatewayResponse::empty(404)
                .with_header("Content-Type", ctype)
                .with_body(Body::Reader {
                    r,
                    len: Some(size as usize),
                }),
        );
    }
    None
}

/// The presence of anything HTML-shaped in Accept is enough; no q-value
/// weighting.
fn preferred_404_type(accept_headers: &[&str]) -> Option<&'static str> {
    for header in accept_headers {
        for entry in header.split(',') {
            let ctype = entry.splitn(2, ';').next().unwrap_or("").trim();
            match ctype {
                "*/*" | "text/*" | "text/html" => return Some("text/html"),
                _ => {}
            }
        }
    }
    None
}

/// Recover from `/ipfs/ipfs/...` and `/ipfs/ipns/...` with an HTML error
/// page that names the canonical path and refreshes to it.
fn fixup_superfluous_namespace(url_path: &str, raw_query: &str) -> Option<GatewayResponse> {
    if !(url_path.starts_with("/ipfs/ipfs/") || url_path.starts_with("/ipfs/ipns/")) {
        return None;
    }
    let intended = url_path.strip_prefix("/ipfs")?;
    LogicalPath::from_str(intended).ok()?;

    let mut intended_url = intended.to_string();
    if !raw_query.is_empty() {
        // the page is HTML, re-encode the query before interpolating
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(url::form_urlencoded::parse(raw_query.as_bytes()))
            .finish();
        let _ = write!(intended_url, "?{}", encoded);
    }

    let message = format!(
        "invalid path: {:?} should be {:?}",
        url_path, intended
    );
    let mut body = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = write!(
        body,
        "<meta http-equiv=\"refresh\" content=\"10;url={}\" />\n",
        encode_double_quoted_attribute(&intended_url)
    );
    let _ = write!(
        body,
        "<link rel=\"canonical\" href=\"{}\" />\n</head>\n<body>\n",
        encode_double_quoted_attribute(&intended_url)
    );
    let _ = write!(body, "<pre>{}</pre>\n", encode_text(&message));
    let _ = write!(
        body,
        "<pre>(if a redirect does not happen in 10 seconds, use {} instead)</pre>\n",
        encode_text(&format!("{:?}", intended))
    );
    body.push_str("</body>\n</html>\n");
    Some(GatewayResponse::html(400, body))
}

#[cfg(test)]
mod tests {
    use super::{process, GatewayRequest};
    use crate::arg::Settings;
    use crate::backend::Backend;
    use crate::cid::Cid;
    use crate::listing::dir_etag;
    use crate::memdag::MemDag;
    use crate::response::{Body, GatewayResponse};
    use std::io::Read;
    use std::sync::Arc;
    use tiny_http::Method;

    fn run(
        settings: &Settings,
        dag: &Arc<MemDag>,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
    ) -> GatewayResponse {
        let backend: Arc<dyn Backend> = dag.clone();
        let mut body = std::io::empty();
        let mut req = GatewayRequest {
            method,
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: &mut body,
            gw_hostname: None,
        };
        process(settings, &backend, &mut req)
    }

    fn body_string(body: Body) -> String {
        match body {
            Body::Empty => String::new(),
            Body::Bytes(v) => String::from_utf8(v).unwrap(),
            Body::Reader { mut r, .. } => {
                let mut out = String::new();
                r.read_to_string(&mut out).unwrap();
                out
            }
        }
    }

    fn settings() -> Settings {
        Settings::new()
    }

    /// root dir with bar=hello under it
    fn seed(dag: &MemDag) -> (Cid, Cid) {
        let bar = dag.add_file_bytes(b"hello");
        let root = dag.add_dir(&[("bar", bar.clone())]);
        (root, bar)
    }

    #[test]
    fn test_get_file() {
        let dag = Arc::new(MemDag::new());
        let (root, bar) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/bar", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Etag"), Some(bar.etag().as_str()));
        assert_eq!(
            res.header("Cache-Control"),
            Some("public, max-age=29030400, immutable")
        );
        assert_eq!(
            res.header("X-Ipfs-Path"),
            Some(format!("/ipfs/{}/bar", root).as_str())
        );
        match &res.body {
            Body::Reader { len, .. } => assert_eq!(*len, Some(5)),
            _ => panic!("want streamed body"),
        }
        assert_eq!(body_string(res.body), "hello");
    }

    #[test]
    fn test_roots_header() {
        let dag = Arc::new(MemDag::new());
        let bar = dag.add_file_bytes(b"hello");
        let sub = dag.add_dir(&[("bar", bar.clone())]);
        let root = dag.add_dir(&[("sub", sub.clone())]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/sub/bar", root),
            &[],
        );
        let roots = res.header("X-Ipfs-Roots").unwrap();
        let want = format!("{},{},{}", root, sub, bar);
        assert_eq!(roots, want);
    }

    #[test]
    fn test_etag_suffix_match() {
        let dag = Arc::new(MemDag::new());
        let (root, bar) = seed(&dag);
        let url = format!("/ipfs/{}/bar", root);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &url,
            &[("If-None-Match", bar.etag().as_str())],
        );
        assert_eq!(res.status, 304);
        assert!(matches!(res.body, Body::Empty));

        // the DirIndex form of the same suffix also matches
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &url,
            &[("If-None-Match", &format!("\"DirIndex-xyz_CID-{}\"", bar))],
        );
        assert_eq!(res.status, 304);
    }

    #[test]
    fn test_dir_listing() {
        let dag = Arc::new(MemDag::new());
        let (root, bar) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Content-Type"), Some("text/html"));
        assert_eq!(res.header("Etag"), Some(dir_etag(&root).as_str()));
        let page = body_string(res.body);
        assert!(page.contains(">bar</a>"));
        assert!(page.contains(&bar.short()));
        assert!(page.contains("5 B"));
        // at the DAG root there is nothing to go up to
        assert!(!page.contains(">..</a>"));
    }

    #[test]
    fn test_dir_listing_etag_match() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let etag = dir_etag(&root);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("If-None-Match", etag.as_str())],
        );
        assert_eq!(res.status, 304);
    }

    #[test]
    fn test_index_redirect_preserves_query() {
        let dag = Arc::new(MemDag::new());
        let idx = dag.add_file_bytes(b"<html>index</html>");
        let root = dag.add_dir(&[("index.html", idx)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}?x=1", root),
            &[],
        );
        assert_eq!(res.status, 302);
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}/?x=1", root).as_str())
        );
    }

    #[test]
    fn test_index_served_with_slash() {
        let dag = Arc::new(MemDag::new());
        let idx = dag.add_file_bytes(b"<html>index</html>");
        let root = dag.add_dir(&[("index.html", idx)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/", root),
            &[],
        );
        assert_eq!(res.status, 200);
        // caching headers carry the directory's identifier
        assert_eq!(res.header("Etag"), Some(root.etag().as_str()));
        assert_eq!(body_string(res.body), "<html>index</html>");
    }

    #[test]
    fn test_index_served_for_go_get() {
        let dag = Arc::new(MemDag::new());
        let idx = dag.add_file_bytes(b"<html>index</html>");
        let root = dag.add_dir(&[("index.html", idx)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}?go-get=1", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert_eq!(body_string(res.body), "<html>index</html>");
    }

    #[test]
    fn test_superfluous_namespace() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/ipfs/{}?q=1", root),
            &[],
        );
        assert_eq!(res.status, 400);
        assert_eq!(res.header("Content-Type"), Some("text/html"));
        let page = body_string(res.body);
        assert!(page.contains(&format!("href=\"/ipfs/{}?q=1\"", root)));
        assert!(page.contains("http-equiv=\"refresh\""));
    }

    #[test]
    fn test_uri_query_param() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let target = format!("ipfs://{}?q=1", root);
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("uri", &target)
            .finish();
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/?{}", encoded),
            &[],
        );
        assert_eq!(res.status, 301);
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}?q=1", root).as_str())
        );
    }

    #[test]
    fn test_uri_query_param_bad_scheme() {
        let dag = Arc::new(MemDag::new());
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            "/ipfs/?uri=https%3A%2F%2Fexample.net",
            &[],
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_service_worker_guard() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("Service-Worker", "script")],
        );
        assert_eq!(res.status, 400);
        // below the root it is allowed
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/bar", root),
            &[("Service-Worker", "script")],
        );
        assert_eq!(res.status, 200);
    }

    #[test]
    fn test_pretty_404() {
        let dag = Arc::new(MemDag::new());
        let err_page = dag.add_file_bytes(b"<html>lost</html>");
        let root = dag.add_dir(&[("ipfs-404.html", err_page)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/deep/path", root),
            &[("Accept", "text/html")],
        );
        assert_eq!(res.status, 404);
        assert_eq!(res.header("Content-Type"), Some("text/html"));
        assert_eq!(body_string(res.body), "<html>lost</html>");
    }

    #[test]
    fn test_pretty_404_needs_html_accept() {
        let dag = Arc::new(MemDag::new());
        let err_page = dag.add_file_bytes(b"<html>lost</html>");
        let root = dag.add_dir(&[("ipfs-404.html", err_page)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/deep/path", root),
            &[("Accept", "application/json")],
        );
        assert_eq!(res.status, 404);
        let body = body_string(res.body);
        assert!(body.starts_with("resolve "));
    }

    #[test]
    fn test_plain_404_without_pretty_file() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/missing", root),
            &[("Accept", "text/html")],
        );
        assert_eq!(res.status, 404);
    }

    #[test]
    fn test_offline_maps_to_503() {
        let dag = Arc::new(MemDag::new());
        let res = run(&settings(), &dag, Method::Get, "/ipns/unknown.name", &[]);
        assert_eq!(res.status, 503);
    }

    #[test]
    fn test_format_raw() {
        let dag = Arc::new(MemDag::new());
        let (root, bar) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}/bar?format=raw", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Content-Type"), Some("application/vnd.ipld.raw"));
        assert_eq!(
            res.header("Content-Disposition"),
            Some(format!("attachment; filename=\"{}.bin\"", bar).as_str())
        );
    }

    #[test]
    fn test_format_car() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}?format=car", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert_eq!(
            res.header("Content-Type"),
            Some("application/vnd.ipld.car; version=1")
        );
        assert_eq!(res.header("X-Content-Type-Options"), Some("nosniff"));
    }

    #[test]
    fn test_carv2_rejected() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("Accept", "application/vnd.ipld.car; version=2")],
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_unknown_vendor_format_rejected() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("Accept", "application/vnd.something.else")],
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_read_only_method_not_allowed() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Post,
            &format!("/ipfs/{}", root),
            &[],
        );
        assert_eq!(res.status, 405);
        let allow: Vec<&str> = res
            .headers
            .iter()
            .filter(|(k, _)| k == "Allow")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(allow, vec!["GET", "HEAD", "OPTIONS"]);
    }

    #[test]
    fn test_options_returns_user_headers_only() {
        let dag = Arc::new(MemDag::new());
        let mut settings = Settings::new();
        settings.headers.push((
            String::from("Access-Control-Allow-Origin"),
            String::from("*"),
        ));
        let res = run(&settings, &dag, Method::Options, "/ipfs/whatever", &[]);
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Access-Control-Allow-Origin"), Some("*"));
        assert!(matches!(res.body, Body::Empty));
    }

    #[test]
    fn test_user_headers_on_responses() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let mut settings = Settings::new();
        settings.headers.push((
            String::from("Access-Control-Allow-Origin"),
            String::from("*"),
        ));
        let res = run(
            &settings,
            &dag,
            Method::Get,
            &format!("/ipfs/{}/bar", root),
            &[],
        );
        assert_eq!(res.header("Access-Control-Allow-Origin"), Some("*"));
        assert!(res.header("Server").is_some());
    }

    #[test]
    fn test_prefix_header_honored_when_allowed() {
        let dag = Arc::new(MemDag::new());
        let idx = dag.add_file_bytes(b"<html>index</html>");
        let root = dag.add_dir(&[("index.html", idx)]);
        let mut settings = Settings::new();
        settings.prefixes.push(String::from("/gw"));
        let res = run(
            &settings,
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("X-Ipfs-Gateway-Prefix", "/gw")],
        );
        assert_eq!(res.status, 302);
        assert_eq!(
            res.header("Location"),
            Some(format!("/gw/ipfs/{}/", root).as_str())
        );
    }

    #[test]
    fn test_prefix_header_ignored_when_not_allowed() {
        let dag = Arc::new(MemDag::new());
        let idx = dag.add_file_bytes(b"<html>index</html>");
        let root = dag.add_dir(&[("index.html", idx)]);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            &format!("/ipfs/{}", root),
            &[("X-Ipfs-Gateway-Prefix", "/evil")],
        );
        assert_eq!(res.status, 302);
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}/", root).as_str())
        );
    }

    #[test]
    fn test_head_on_listing_has_no_body() {
        let dag = Arc::new(MemDag::new());
        let (root, _) = seed(&dag);
        let res = run(
            &settings(),
            &dag,
            Method::Head,
            &format!("/ipfs/{}", root),
            &[],
        );
        assert_eq!(res.status, 200);
        assert!(res.header("Etag").is_some());
        assert!(matches!(res.body, Body::Empty));
    }

    #[test]
    fn test_invalid_path() {
        let dag = Arc::new(MemDag::new());
        let res = run(&settings(), &dag, Method::Get, "/ipfs/notacid", &[]);
        assert_eq!(res.status, 400);
        assert!(body_string(res.body).starts_with("invalid ipfs path:"));
    }

    #[test]
    fn test_mutable_namespace_headers() {
        let dag = Arc::new(MemDag::new());
        let file = dag.add_file_bytes(b"hello");
        let root = dag.add_dir(&[("f.txt", file)]);
        dag.publish("example.net", &root);
        let res = run(
            &settings(),
            &dag,
            Method::Get,
            "/ipns/example.net/f.txt",
            &[],
        );
        assert_eq!(res.status, 200);
        assert!(res.header("Last-Modified").is_some());
        assert!(res.header("Cache-Control").is_none());
    }
}
