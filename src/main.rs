use std::panic;
use std::sync::Arc;
use std::thread;

use log::{error, info};
use tiny_http::{Request, Server};

use dagway::arg::Settings;
use dagway::backend::Backend;
use dagway::memdag::MemDag;
use dagway::request::{process, GatewayRequest};
use dagway::response::respond;

fn main() {
    env_logger::init();

    let settings = Arc::new(Settings::from_args());
    let backend: Arc<dyn Backend> = Arc::new(MemDag::new());

    let addr = format!("{}:{}", settings.host, settings.port);
    let srv = match Server::http(&addr) {
        Ok(v) => v,
        Err(e) => {
            error!("cannot bind {}: {}", addr, e);
            return;
        }
    };
    info!("serving on {}, writable: {}", addr, settings.writable);

    loop {
        let req = match srv.recv() {
            Ok(v) => v,
            Err(e) => {
                error!("{}", e);
                break;
            }
        };
        let settings = settings.clone();
        let backend = backend.clone();
        thread::spawn(move || handle(&settings, &backend, req));
    }
}

/// One request, one thread. A panicking handler is logged and its
/// connection dropped; peer requests are unaffected.
fn handle(settings: &Settings, backend: &Arc<dyn Backend>, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_string();
    info!("processing request {} for {}", method, url);

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|h| (h.field.as_str().to_string(), h.value.as_str().to_string()))
        .collect();

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut greq = GatewayRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body: req.as_reader(),
            gw_hostname: None,
        };
        process(settings, backend, &mut greq)
    }));

    match result {
        Ok(res) => respond(req, res),
        Err(e) => {
            let msg = if let Some(v) = e.downcast_ref::<&str>() {
                (*v).to_string()
            } else if let Some(v) = e.downcast_ref::<String>() {
                v.clone()
            } else {
                String::from("unknown panic payload")
            };
            error!(
                "panic in gateway handler for {} {}: {}\n{}",
                method,
                url,
                msg,
                std::backtrace::Backtrace::force_capture()
            );
            // whatever was already written stays; dropping the request
            // aborts the stream without touching other connections
        }
    }
}
