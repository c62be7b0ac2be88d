use std::fmt::Write;

use bytesize::ByteSize;
use html_escape::{encode_double_quoted_attribute, encode_text};
use log::debug;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::backend::{Backend, BackendError, Context, DirNode, ResolvedPath, UnixfsNode};
use crate::file::{serve_file, FileQuery};
use crate::path::join_url;
use crate::request::ReadRequest;
use crate::response::{error_body, web_error, Body, GatewayResponse, CONTENT_TYPE_HTML};

const LISTING_STYLE: &str = "body{font-family:system-ui,sans-serif;margin:2rem;color:#222}\
table{width:100%;border-collapse:collapse}\
th,td{padding:.4rem .6rem;text-align:left;border-bottom:1px solid #ddd}\
th{background:#f5f5f5}\
td.hash,span.chip{font-family:monospace;font-size:.9em;color:#555}";

/// Fingerprint of the listing markup. Part of the directory ETag so caches
/// drop stale listings when the page itself changes.
static ASSETS_HASH: Lazy<String> = Lazy::new(|| {
    let mut h = Sha256::new();
    h.update(LISTING_STYLE.as_bytes());
    hex::encode(h.finalize())[..16].to_string()
});

/// One row of a rendered directory listing.
pub struct DirectoryItem {
    pub name: String,
    pub path: String,
    pub cid: String,
    pub short_cid: String,
    pub size: String,
}

pub fn dir_etag(cid: &crate::cid::Cid) -> String {
    format!("\"DirIndex-{}_CID-{}\"", &*ASSETS_HASH, cid)
}

/// Serve a UnixFS directory: redirect to or render its `index.html` when it
/// has one, fall back to a generated HTML listing otherwise.
pub fn serve_dir(
    backend: &dyn Backend,
    ctx: &Context,
    rreq: &ReadRequest,
    resolved: &ResolvedPath,
    dir: DirNode,
    std_headers: &[(String, String)],
) -> GatewayResponse {
    let logical = &resolved.path;
    let idx_logical = logical.join("index.html");
    match backend.resolve_path(ctx, &idx_logical) {
        Ok(idx_resolved) => {
            let without_slash = !rreq.url_path.ends_with('/');
            if without_slash && !rreq.query.go_get {
                // force browsers to resolve relative links against the
                // directory, preserving the query
                let mut target = format!("{}/", rreq.original_url_path);
                if !rreq.raw_query.is_empty() {
                    target.push('?');
                    target.push_str(&rreq.raw_query);
                }
                debug!("index.html redirect to {}", target);
                return GatewayResponse::redirect(302, &target);
            }
            let idx = match backend.unixfs_get(ctx, &idx_resolved) {
                Ok(UnixfsNode::File(f)) => f,
                Ok(_) => {
                    return error_body(500, "index.html", &"not a file");
                }
                Err(e) => return web_error("index.html", &e, 500),
            };
            debug!("serving index.html for {}", logical);
            let query = FileQuery {
                filename: rreq.query.filename.clone(),
                download: rreq.query.download,
            };
            // the directory's identifier drives the caching headers
            return serve_file(&idx_logical, &resolved.cid, idx, &query, rreq.range.as_deref());
        }
        Err(BackendError::NoLink(_)) => {
            debug!("no index.html under {}", logical);
        }
        Err(e) => return web_error("index.html", &e, 500),
    }

    // an upstream layer may have scheduled a redirect already; honor it
    // instead of rendering a body it would only confuse
    if std_headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("Location"))
    {
        return GatewayResponse::empty(301);
    }

    let mut res = GatewayResponse::empty(200).with_header("Content-Type", CONTENT_TYPE_HTML);
    let etag = dir_etag(&resolved.cid);
    res.set_header("Etag", &etag);
    if rreq.if_none_match.as_deref() == Some(etag.as_str()) {
        res.status = 304;
        return res;
    }
    if rreq.head {
        return res;
    }

    let mut items: Vec<DirectoryItem> = vec![];
    for entry in dir.entries {
        let entry = match entry {
            Ok(v) => v,
            Err(e) => return error_body(500, "directory listing", &e),
        };
        let size = match entry.size {
            Some(v) => ByteSize(v).to_string(),
            None => String::from("?"),
        };
        // a child that cannot be resolved cannot be linked, give up on
        // the whole listing
        let child = match backend.resolve_path(ctx, &logical.join(&entry.name)) {
            Ok(v) => v,
            Err(e) => return error_body(500, "directory listing", &e),
        };
        items.push(DirectoryItem {
            path: join_url(&[&rreq.original_url_path, &entry.name]),
            name: entry.name,
            cid: child.cid.to_string(),
            short_cid: child.cid.short(),
            size,
        });
    }

    let back_link = back_link(&rreq.url_path, &rreq.original_url_path);
    let gw_url = rreq
        .gw_hostname
        .as_ref()
        .map(|h| format!("//{}", h))
        .unwrap_or_default();
    let dnslink = has_dnslink_origin(&gw_url, &rreq.url_path);
    let dir_size = dir
        .size
        .map(|v| ByteSize(v).to_string())
        .unwrap_or_else(|| String::from("?"));

    let page = render_listing(
        &rreq.url_path,
        &rreq.original_url_path,
        &resolved.cid.to_string(),
        &dir_size,
        &gw_url,
        dnslink,
        back_link.as_deref(),
        &items,
    );
    res.with_body(Body::Bytes(page.into_bytes()))
}

/// The `..` target, or nothing when the listing is already at the root of
/// its DAG.
fn back_link(url_path: &str, original_url_path: &str) -> Option<String> {
    let split: Vec<&str> = url_path.split('/').collect();
    match split.len() {
        3 => None,
        4 if split[3].is_empty() => None,
        _ => {
            if original_url_path.ends_with('/') {
                Some(format!("{}./..", original_url_path))
            } else {
                Some(format!("{}/..", original_url_path))
            }
        }
    }
}

/// Whether the gateway hostname is serving this path as a DNSLink origin.
/// Display-only.
fn has_dnslink_origin(gw_url: &str, url_path: &str) -> bool {
    match gw_url.strip_prefix("//") {
        Some(host) if !host.is_empty() => url_path.starts_with(&format!("/ipns/{}", host)),
        _ => false,
    }
}

fn render_breadcrumbs(out: &mut String, url_path: &str, original_url_path: &str) {
    let prefix_len = original_url_path.len().saturating_sub(url_path.len());
    let prefix = &original_url_path[..prefix_len];
    let segments: Vec<&str> = url_path.split('/').filter(|v| !v.is_empty()).collect();
    let mut acc = String::from(prefix);
    for (i, seg) in segments.iter().enumerate() {
        acc.push('/');
        acc.push_str(seg);
        if i == 0 {
            // the namespace itself is not a resolvable page
            let _ = write!(out, "/{}", encode_text(seg));
        } else {
            let _ = write!(
                out,
                "/<a href=\"{}\">{}</a>",
                encode_double_quoted_attribute(&acc),
                encode_text(seg)
            );
        }
    }
}

fn render_listing(
    url_path: &str,
    original_url_path: &str,
    hash: &str,
    size: &str,
    gw_url: &str,
    dnslink: bool,
    back_link: Option<&str>,
    items: &[DirectoryItem],
) -> String {
    let mut body = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = write!(
        body,
        "<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n",
        encode_text(url_path),
        LISTING_STYLE
    );
    body.push_str("<h1>Index of ");
    render_breadcrumbs(&mut body, url_path, original_url_path);
    body.push_str("</h1>\n");
    if dnslink {
        body.push_str("<p><span class=\"chip\">DNSLink</span></p>\n");
    }
    let _ = write!(
        body,
        "<p><span class=\"chip\">{}</span> \u{2022} {}</p>\n",
        encode_text(hash),
        encode_text(size)
    );
    body.push_str("<table>\n<tr><th>Name</th><th>Hash</th><th>Size</th></tr>\n");
    if let Some(back) = back_link {
        let _ = write!(
            body,
            "<tr><td><a href=\"{}\">..</a></td><td></td><td></td></tr>\n",
            encode_double_quoted_attribute(back)
        );
    }
    for item in items {
        let _ = write!(
            body,
            "<tr><td><a href=\"{}\">{}</a></td>\
             <td class=\"hash\"><a href=\"{}/ipfs/{}\">{}</a></td>\
             <td>{}</td></tr>\n",
            encode_double_quoted_attribute(&item.path),
            encode_text(&item.name),
            encode_double_quoted_attribute(gw_url),
            encode_double_quoted_attribute(&item.cid),
            encode_text(&item.short_cid),
            encode_text(&item.size)
        );
    }
    body.push_str("</table>\n</body>\n</html>\n");
    body
}

#[cfg(test)]
mod tests {
    use super::{back_link, dir_etag, has_dnslink_origin, render_listing, DirectoryItem};
    use crate::cid::Cid;

    #[test]
    fn test_dir_etag_shape() {
        let cid = Cid::from_block(b"dir");
        let etag = dir_etag(&cid);
        assert!(etag.starts_with("\"DirIndex-"));
        assert!(etag.ends_with(&format!("_CID-{}\"", cid)));
    }

    #[test]
    fn test_back_link() {
        let cid = Cid::from_block(b"dir").to_string();
        let root = format!("/ipfs/{}", cid);
        assert_eq!(back_link(&root, &root), None);
        let root_slash = format!("/ipfs/{}/", cid);
        assert_eq!(back_link(&root_slash, &root_slash), None);
        let sub = format!("/ipfs/{}/docs", cid);
        assert_eq!(back_link(&sub, &sub), Some(format!("{}/..", sub)));
        let sub_slash = format!("/ipfs/{}/docs/", cid);
        assert_eq!(back_link(&sub_slash, &sub_slash), Some(format!("{}./..", sub_slash)));
    }

    #[test]
    fn test_back_link_keeps_prefix() {
        let cid = Cid::from_block(b"dir").to_string();
        let logical = format!("/ipfs/{}/docs", cid);
        let prefixed = format!("/gw{}", logical);
        assert_eq!(back_link(&logical, &prefixed), Some(format!("{}/..", prefixed)));
    }

    #[test]
    fn test_dnslink_origin() {
        assert!(has_dnslink_origin(
            "//example.net",
            "/ipns/example.net/docs"
        ));
        assert!(!has_dnslink_origin("//example.net", "/ipns/other.net"));
        assert!(!has_dnslink_origin("", "/ipns/example.net"));
    }

    #[test]
    fn test_render_escapes_names() {
        let items = vec![DirectoryItem {
            name: String::from("<script>.txt"),
            path: String::from("/ipfs/x/%3Cscript%3E.txt"),
            cid: String::from("abcd"),
            short_cid: String::from("abcd"),
            size: String::from("5 B"),
        }];
        let page = render_listing("/ipfs/x", "/ipfs/x", "abcd", "?", "", false, None, &items);
        assert!(page.contains("&lt;script&gt;.txt"));
        assert!(!page.contains("<script>.txt"));
    }

    #[test]
    fn test_render_back_link_row() {
        let page = render_listing(
            "/ipfs/x/sub",
            "/ipfs/x/sub",
            "abcd",
            "?",
            "",
            false,
            Some("/ipfs/x/sub/.."),
            &[],
        );
        assert!(page.contains("href=\"/ipfs/x/sub/..\""));
    }
}
