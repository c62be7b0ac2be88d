use std::io::{Read, Seek, SeekFrom};
use std::time::SystemTime;

use log::debug;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::backend::{FileBody, FileNode, SeekableReader};
use crate::cid::Cid;
use crate::path::LogicalPath;
use crate::response::{Body, GatewayResponse};

pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=29030400, immutable";

/// Bytes sniffed from the head of a file when the name has no recognized
/// extension.
const SNIFF_LEN: usize = 512;

/// Characters escaped inside Content-Disposition filename parameters.
const FILENAME_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b'\\')
    .add(b';')
    .add(b'/')
    .add(b'?')
    .add(b'#');

/// Query parameters the file responder honors.
pub struct FileQuery {
    /// `?filename=<n>`, overrides the name used for type detection and
    /// triggers a Content-Disposition header.
    pub filename: Option<String>,
    /// `?download=true`, forces `attachment` disposition.
    pub download: bool,
}

/// Serve a UnixFS file. `file_cid` drives the caching headers and is the
/// directory's identifier when the file is a directory's `index.html`.
pub fn serve_file(
    logical: &LogicalPath,
    file_cid: &Cid,
    file: FileNode,
    query: &FileQuery,
    range_header: Option<&str>,
) -> GatewayResponse {
    let mut res = GatewayResponse::empty(200);
    add_cache_headers(&mut res, logical, file_cid);

    let mut name = logical.filename().unwrap_or("").to_string();
    if let Some(v) = &query.filename {
        name = v.clone();
        let disposition = if query.download { "attachment" } else { "inline" };
        set_content_disposition(&mut res, &name, disposition);
    }

    let size = file.size;
    let (ctype, body) = detect_type(&name, file.body);
    res.set_header("Content-Type", &ctype);

    match body {
        DetectedBody::Seekable(r) => serve_seekable(res, r, size, range_header),
        DetectedBody::Stream(r) => res.with_body(Body::Reader {
            r,
            len: size.map(|v| v as usize),
        }),
    }
}

/// Caching policy: immutable namespaces are cacheable forever, mutable
/// ones get a Last-Modified of now so heuristic caches refresh reasonably.
pub fn add_cache_headers(res: &mut GatewayResponse, logical: &LogicalPath, cid: &Cid) {
    res.set_header("Etag", &cid.etag());
    if logical.mutable() {
        res.set_header("Last-Modified", &httpdate::fmt_http_date(SystemTime::now()));
    } else {
        res.set_header("Cache-Control", IMMUTABLE_CACHE_CONTROL);
    }
}

/// Content-Disposition with both an ASCII-sanitized and a UTF-8 encoded
/// filename parameter.
pub fn set_content_disposition(res: &mut GatewayResponse, filename: &str, disposition: &str) {
    let ascii_name: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let ascii = utf8_percent_encode(&ascii_name, FILENAME_ESCAPE).to_string();
    let utf8 = utf8_percent_encode(filename, FILENAME_ESCAPE).to_string();
    res.set_header(
        "Content-Disposition",
        &format!("{}; filename=\"{}\"; filename*=UTF-8''{}", disposition, ascii, utf8),
    );
}

enum DetectedBody {
    Seekable(SeekableReader),
    Stream(Box<dyn Read + Send>),
}

/// Pick a content type from the name's extension, or sniff the head of the
/// body. Sniffing a seekable body rewinds it; a plain stream gets its
/// sniffed head chained back on.
fn detect_type(name: &str, body: FileBody) -> (String, DetectedBody) {
    let typed = |body: FileBody| match body {
        FileBody::Seekable(r) => DetectedBody::Seekable(SeekableReader(r)),
        FileBody::Stream(r) => DetectedBody::Stream(r),
    };
    if let Some(mime) = mime_guess::from_path(name).first() {
        return (mime.to_string(), typed(body));
    }

    let mut head = [0u8; SNIFF_LEN];
    match typed(body) {
        DetectedBody::Seekable(mut r) => {
            let n = read_head(&mut r, &mut head);
            let ctype = sniff(&head[..n]);
            if r.seek(SeekFrom::Start(0)).is_err() {
                // cannot rewind after all, degrade to a plain stream
                let prefix = std::io::Cursor::new(head[..n].to_vec());
                return (ctype, DetectedBody::Stream(Box::new(prefix.chain(r))));
            }
            (ctype, DetectedBody::Seekable(r))
        }
        DetectedBody::Stream(mut r) => {
            let n = read_head(&mut r, &mut head);
            let prefix = std::io::Cursor::new(head[..n].to_vec());
            (sniff(&head[..n]), DetectedBody::Stream(Box::new(prefix.chain(r))))
        }
    }
}

fn read_head(r: &mut dyn Read, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}

/// Minimal content sniffer over the first bytes of a body.
fn sniff(head: &[u8]) -> String {
    let mut trimmed = head;
    while let Some((first, rest)) = trimmed.split_first() {
        if first.is_ascii_whitespace() {
            trimmed = rest;
        } else {
            break;
        }
    }
    let lower: Vec<u8> = trimmed
        .iter()
        .take(32)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    for tag in ["<!doctype html", "<html", "<head", "<body", "<script"].iter() {
        if lower.starts_with(tag.as_bytes()) {
            return String::from("text/html; charset=utf-8");
        }
    }
    if head.starts_with(b"%PDF-") {
        return String::from("application/pdf");
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return String::from("image/png");
    }
    if head.starts_with(b"\xff\xd8\xff") {
        return String::from("image/jpeg");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return String::from("image/gif");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP" {
        return String::from("image/webp");
    }
    if std::str::from_utf8(head).is_ok() {
        return String::from("text/plain; charset=utf-8");
    }
    String::from("application/octet-stream")
}

fn serve_seekable(
    mut res: GatewayResponse,
    mut r: SeekableReader,
    size: Option<u64>,
    range_header: Option<&str>,
) -> GatewayResponse {
    let size = match size {
        Some(v) => v,
        None => {
            return res.with_body(Body::Reader {
                r: Box::new(r),
                len: None,
            });
        }
    };
    res.set_header("Accept-Ranges", "bytes");

    match parse_range(range_header, size) {
        Ok(Some((start, end))) => {
            if r.seek(SeekFrom::Start(start)).is_err() {
                return res.with_body(Body::Reader {
                    r: Box::new(r),
                    len: Some(size as usize),
                });
            }
            debug!("serving range {}-{}/{}", start, end, size);
            let len = (end - start + 1) as usize;
            res.status = 206;
            res.set_header("Content-Range", &format!("bytes {}-{}/{}", start, end, size));
            res.with_body(Body::Reader {
                r: Box::new(r.take(len as u64)),
                len: Some(len),
            })
        }
        Ok(None) => res.with_body(Body::Reader {
            r: Box::new(r),
            len: Some(size as usize),
        }),
        Err(_) => {
            res.status = 416;
            res.set_header("Content-Range", &format!("bytes */{}", size));
            res.with_body(Body::Empty)
        }
    }
}

struct Unsatisfiable;

/// Parse a single-range `bytes=` header against a known size. Malformed
/// headers are ignored; syntactically fine but unsatisfiable ones error.
fn parse_range(value: Option<&str>, size: u64) -> Result<Option<(u64, u64)>, Unsatisfiable> {
    let value = match value {
        Some(v) => v,
        None => return Ok(None),
    };
    let range = match value.strip_prefix("bytes=") {
        Some(v) => v,
        None => return Ok(None),
    };
    if range.contains(',') {
        // multiple ranges are not supported, serve the whole body
        return Ok(None);
    }
    if size == 0 {
        return Err(Unsatisfiable);
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = match end_part.parse() {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        if suffix == 0 {
            return Err(Unsatisfiable);
        }
        (size.saturating_sub(suffix), size - 1)
    } else {
        let start: u64 = match start_part.parse() {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let end: u64 = if end_part.is_empty() {
            size.saturating_sub(1)
        } else {
            match end_part.parse() {
                Ok(v) => v,
                Err(_) => return Ok(None),
            }
        };
        (start, end)
    };

    if start > end || start >= size {
        return Err(Unsatisfiable);
    }
    Ok(Some((start, end.min(size - 1))))
}
