use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use log::debug;

use crate::backend::{Backend, Context};
use crate::cid::Cid;
use crate::file::IMMUTABLE_CACHE_CONTROL;
use crate::response::{web_error, Body, GatewayResponse};

/// Chunks in flight between the archive writer thread and the response
/// body. Small, the channel is the backpressure.
const CAR_CHANNEL_DEPTH: usize = 16;

/// Serve the raw bytes of a single block.
pub fn serve_raw(backend: &dyn Backend, ctx: &Context, cid: &Cid) -> GatewayResponse {
    let data = match backend.raw_block(ctx, cid) {
        Ok(v) => v,
        Err(e) => return web_error("block get", &e, 500),
    };
    debug!("serving raw block {}", cid);
    GatewayResponse::empty(200)
        .with_header("Content-Type", "application/vnd.ipld.raw")
        .with_header("Etag", &cid.etag())
        .with_header("Cache-Control", IMMUTABLE_CACHE_CONTROL)
        .with_header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}.bin\"", cid),
        )
        .with_body(Body::Bytes(data))
}

/// Stream a v1 archive of the DAG rooted at `cid`. The backend pushes
/// frames from its own thread; dropping the response body tears the
/// channel down and the backend observes the broken pipe.
pub fn serve_car(backend: &Arc<dyn Backend>, ctx: &Context, cid: &Cid) -> GatewayResponse {
    let (tx, rx) = sync_channel::<Vec<u8>>(CAR_CHANNEL_DEPTH);
    let backend = backend.clone();
    let ctx = ctx.clone();
    let root = cid.clone();
    thread::spawn(move || {
        let mut out = ChannelWriter { tx };
        if let Err(e) = backend.car_stream(&ctx, &root, &mut out) {
            // headers are long gone, the client sees a truncated body
            debug!("car stream for {} aborted: {}", root, e);
        }
    });

    GatewayResponse::empty(200)
        .with_header("Content-Type", "application/vnd.ipld.car; version=1")
        .with_header("Etag", &cid.etag())
        .with_header("X-Content-Type-Options", "nosniff")
        .with_header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}.car\"", cid),
        )
        .with_body(Body::Reader {
            r: Box::new(ChannelReader {
                rx,
                pending: vec![],
                off: 0,
            }),
            len: None,
        })
}

struct ChannelWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    off: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.off >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.off = 0;
                }
                // writer gone: end of archive
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.off);
        buf[..n].copy_from_slice(&self.pending[self.off..self.off + n]);
        self.off += n;
        Ok(n)
    }
}
