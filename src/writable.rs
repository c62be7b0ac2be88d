use std::str::FromStr;

use log::{debug, info};
use percent_encoding::percent_decode_str;

use crate::arg::Settings;
use crate::backend::{Backend, BackendError, Codec, Context, NodeKind};
use crate::cid::Cid;
use crate::path::{join_url, WritePath};
use crate::request::GatewayRequest;
use crate::response::{error_body, user_headers, web_error, GatewayResponse};

/// 201 with the new root in both the IPFS-Hash header and a redirect.
fn created(settings: &Settings, cid: &Cid, location: &str) -> GatewayResponse {
    let mut res = GatewayResponse::empty(201);
    res.headers = user_headers(settings);
    res.set_header("IPFS-Hash", cid.as_str());
    res.set_header("Location", location);
    info!("new root {}, redirect to {}", cid, location);
    res
}

/// POST: import the request body as a fresh root.
pub fn post(
    settings: &Settings,
    backend: &dyn Backend,
    ctx: &Context,
    req: &mut GatewayRequest,
) -> GatewayResponse {
    let added = match backend.unixfs_add(ctx, req.body) {
        Ok(v) => v,
        Err(e) => return web_error("writable: could not create DAG from request", &e, 500),
    };
    created(
        settings,
        &added.cid,
        &join_url(&["/ipfs", added.cid.as_str()]),
    )
}

/// Decoded path of a writable request, which must name an entry inside an
/// existing root.
fn parse_write_path(req: &GatewayRequest) -> Result<WritePath, GatewayResponse> {
    let path_part = req.url.split('?').next().unwrap_or("");
    let decoded = percent_decode_str(path_part)
        .decode_utf8()
        .map_err(|e| error_body(400, "writable: failed to parse the path", &e))?;
    let wp = WritePath::from_str(&decoded)
        .map_err(|e| error_body(400, "writable: failed to parse the path", &e))?;
    if wp.interior.is_empty() {
        return Err(GatewayResponse::text(400, String::from("writable: empty path")));
    }
    Ok(wp)
}

/// Load the root node for a writable operation; only structured DAG nodes
/// can be spliced.
fn load_root(
    backend: &dyn Backend,
    ctx: &Context,
    root: &Cid,
) -> Result<crate::backend::DagNode, GatewayResponse> {
    let node = backend
        .dag_get(ctx, root)
        .map_err(|e| web_error("writable: failed to resolve root", &e, 500))?;
    if node.codec != Codec::DagNode {
        return Err(error_body(
            400,
            "writable: cannot write through this root",
            &BackendError::NotDagNode,
        ));
    }
    Ok(node)
}

/// PUT: splice the request body into an existing root at the interior
/// path, creating parent directories as needed.
pub fn put(
    settings: &Settings,
    backend: &dyn Backend,
    ctx: &Context,
    req: &mut GatewayRequest,
) -> GatewayResponse {
    let wp = match parse_write_path(req) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let (dir, filename) = wp.dir_and_name();
    debug!("put {} into {} of {}", filename, dir, wp.root);

    let new_file = match backend.unixfs_add(ctx, req.body) {
        Ok(v) => v,
        Err(e) => return web_error("writable: could not create DAG from request", &e, 500),
    };
    let root = match load_root(backend, ctx, &wp.root) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let mut session = match backend.writable_session(ctx, root) {
        Ok(v) => v,
        Err(e) => return web_error("writable: failed to open session", &e, 400),
    };

    if !dir.is_empty() {
        if let Err(e) = session.mkdir(dir, true) {
            return web_error("writable: failed to create directory", &e, 500);
        }
    }
    match session.lookup(dir) {
        Ok(NodeKind::Directory) => {}
        Ok(_) => {
            return GatewayResponse::text(
                400,
                String::from("writable: target directory is not a directory"),
            );
        }
        Err(e) => return web_error("writable: failed to look up directory", &e, 500),
    }
    match session.unlink(dir, filename) {
        Ok(()) | Err(BackendError::NotFound(_)) => {}
        Err(e) => return web_error("writable: failed to replace existing file", &e, 400),
    }
    if let Err(e) = session.add_child(dir, filename, &new_file.cid) {
        return web_error("writable: failed to link file into directory", &e, 500);
    }
    let final_cid = match session.finalize() {
        Ok(v) => v,
        Err(e) => return web_error("writable: failed to finalize", &e, 500),
    };

    created(
        settings,
        &final_cid,
        &join_url(&["/ipfs", final_cid.as_str(), &wp.interior]),
    )
}

/// DELETE: unlink the interior path from an existing root. A missing
/// entry is not an error, the result is the same tree.
pub fn delete(
    settings: &Settings,
    backend: &dyn Backend,
    ctx: &Context,
    req: &mut GatewayRequest,
) -> GatewayResponse {
    let wp = match parse_write_path(req) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let (dir, filename) = wp.dir_and_name();
    debug!("delete {} from {} of {}", filename, dir, wp.root);

    let root = match load_root(backend, ctx, &wp.root) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let mut session = match backend.writable_session(ctx, root) {
        Ok(v) => v,
        Err(e) => return web_error("writable: failed to open session", &e, 400),
    };

    match session.lookup(dir) {
        Ok(NodeKind::Directory) => {}
        Ok(_) => {
            return error_body(500, "writable: parent is not a directory", &dir);
        }
        Err(e) => return web_error("writable: failed to look up parent", &e, 500),
    }
    match session.unlink(dir, filename) {
        Ok(()) | Err(BackendError::NotFound(_)) => {}
        Err(e) => return web_error("writable: failed to remove file", &e, 500),
    }
    let final_cid = match session.finalize() {
        Ok(v) => v,
        Err(e) => return web_error("writable: failed to finalize", &e, 500),
    };

    created(
        settings,
        &final_cid,
        &join_url(&["/ipfs", final_cid.as_str(), dir]),
    )
}

#[cfg(test)]
mod tests {
    use crate::arg::Settings;
    use crate::backend::Backend;
    use crate::memdag::MemDag;
    use crate::request::{process, GatewayRequest};
    use crate::response::{Body, GatewayResponse};
    use std::io::Read;
    use std::str::FromStr;
    use std::sync::Arc;
    use tiny_http::Method;

    fn writable_settings() -> Settings {
        let mut settings = Settings::new();
        settings.writable = true;
        settings
    }

    fn run(
        settings: &Settings,
        dag: &Arc<MemDag>,
        method: Method,
        url: &str,
        body: &[u8],
    ) -> GatewayResponse {
        let mut body = std::io::Cursor::new(body.to_vec());
        let backend: Arc<dyn Backend> = dag.clone();
        let mut req = GatewayRequest {
            method,
            url: url.to_string(),
            headers: vec![],
            body: &mut body,
            gw_hostname: None,
        };
        process(settings, &backend, &mut req)
    }

    fn get_body(settings: &Settings, dag: &Arc<MemDag>, url: &str) -> (u16, Vec<u8>) {
        let res = run(settings, dag, Method::Get, url, b"");
        let status = res.status;
        let body = match res.body {
            Body::Empty => vec![],
            Body::Bytes(v) => v,
            Body::Reader { mut r, .. } => {
                let mut out = vec![];
                r.read_to_end(&mut out).unwrap();
                out
            }
        };
        (status, body)
    }

    #[test]
    fn test_post_then_get() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let res = run(&settings, &dag, Method::Post, "/ipfs/", b"fresh content");
        assert_eq!(res.status, 201);
        let hash = res.header("IPFS-Hash").unwrap().to_string();
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}", hash).as_str())
        );

        let (status, body) = get_body(&settings, &dag, &format!("/ipfs/{}", hash));
        assert_eq!(status, 200);
        assert_eq!(body, b"fresh content");
    }

    #[test]
    fn test_put_splices_file() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let keep = dag.add_file_bytes(b"keep me");
        let root = dag.add_dir(&[("keep.txt", keep)]);

        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/dir/file.txt", root),
            b"xyz",
        );
        assert_eq!(res.status, 201);
        let new_root = res.header("IPFS-Hash").unwrap().to_string();
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}/dir/file.txt", new_root).as_str())
        );

        let (status, body) =
            get_body(&settings, &dag, &format!("/ipfs/{}/dir/file.txt", new_root));
        assert_eq!(status, 200);
        assert_eq!(body, b"xyz");
        // the untouched sibling still reads back under the new root
        let (status, body) = get_body(&settings, &dag, &format!("/ipfs/{}/keep.txt", new_root));
        assert_eq!(status, 200);
        assert_eq!(body, b"keep me");
    }

    #[test]
    fn test_put_replaces_existing() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let old = dag.add_file_bytes(b"old");
        let root = dag.add_dir(&[("f.txt", old)]);

        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/f.txt", root),
            b"new",
        );
        assert_eq!(res.status, 201);
        let new_root = res.header("IPFS-Hash").unwrap().to_string();
        let (status, body) = get_body(&settings, &dag, &format!("/ipfs/{}/f.txt", new_root));
        assert_eq!(status, 200);
        assert_eq!(body, b"new");
    }

    #[test]
    fn test_put_needs_interior_path() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let root = dag.add_dir(&[]);
        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}", root),
            b"x",
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_put_rejects_raw_root() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let raw = dag.put_block(b"\x00\x01".to_vec());
        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/f.txt", raw),
            b"x",
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_put_target_must_be_directory() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let file = dag.add_file_bytes(b"flat");
        let root = dag.add_dir(&[("flat.txt", file)]);
        // flat.txt is a file, nothing can be spliced below it
        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/flat.txt/inner.txt", root),
            b"x",
        );
        assert!(res.status == 400 || res.status == 500);
    }

    #[test]
    fn test_delete_unlinks() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let a = dag.add_file_bytes(b"aaa");
        let b = dag.add_file_bytes(b"bbb");
        let sub = dag.add_dir(&[("a.txt", a), ("b.txt", b)]);
        let root = dag.add_dir(&[("sub", sub)]);

        let res = run(
            &settings,
            &dag,
            Method::Delete,
            &format!("/ipfs/{}/sub/a.txt", root),
            b"",
        );
        assert_eq!(res.status, 201);
        let new_root = res.header("IPFS-Hash").unwrap().to_string();
        assert_eq!(
            res.header("Location"),
            Some(format!("/ipfs/{}/sub", new_root).as_str())
        );

        let (status, _) = get_body(&settings, &dag, &format!("/ipfs/{}/sub/a.txt", new_root));
        assert_eq!(status, 404);
        let (status, body) = get_body(&settings, &dag, &format!("/ipfs/{}/sub/b.txt", new_root));
        assert_eq!(status, 200);
        assert_eq!(body, b"bbb");
    }

    #[test]
    fn test_delete_missing_entry_is_fine() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let root = dag.add_dir(&[]);
        let res = run(
            &settings,
            &dag,
            Method::Delete,
            &format!("/ipfs/{}/absent.txt", root),
            b"",
        );
        assert_eq!(res.status, 201);
        // unlinking nothing reproduces the same tree
        let new_root = res.header("IPFS-Hash").unwrap();
        assert_eq!(new_root, root.as_str());
    }

    #[test]
    fn test_concurrent_roots_diverge() {
        let dag = Arc::new(MemDag::new());
        let settings = writable_settings();
        let root = dag.add_dir(&[]);
        let res_a = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/a.txt", root),
            b"a",
        );
        let res_b = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/b.txt", root),
            b"b",
        );
        let root_a = res_a.header("IPFS-Hash").unwrap();
        let root_b = res_b.header("IPFS-Hash").unwrap();
        // both started from the same root, neither sees the other
        assert_ne!(root_a, root_b);
        let (status, _) = get_body(&settings, &dag, &format!("/ipfs/{}/b.txt", root_a));
        assert_eq!(status, 404);
    }

    #[test]
    fn test_writable_path_must_be_immutable_namespace() {
        let dag = Arc::new(MemDag::new());
        let root = dag.add_dir(&[]);
        dag.publish("example.net", &root);
        let settings = writable_settings();
        let res = run(
            &settings,
            &dag,
            Method::Put,
            "/ipns/example.net/f.txt",
            b"x",
        );
        assert_eq!(res.status, 400);
    }

    #[test]
    fn test_settings_reject_when_read_only() {
        let dag = Arc::new(MemDag::new());
        let settings = Settings::new();
        let root = dag.add_dir(&[]);
        let res = run(
            &settings,
            &dag,
            Method::Put,
            &format!("/ipfs/{}/f.txt", root),
            b"x",
        );
        assert_eq!(res.status, 405);
    }

    #[test]
    fn test_cid_parse_helper() {
        // the write path rejects roots that do not parse as identifiers
        assert!(crate::path::WritePath::from_str("/ipfs/nothex/f.txt").is_err());
    }
}
