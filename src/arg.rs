use clap::{App, Arg, ArgMatches};

use log::error;

/// Runtime configuration of the gateway daemon.
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Enables POST, PUT and DELETE.
    pub writable: bool,
    /// Headers merged into every response (CORS lives here).
    pub headers: Vec<(String, String)>,
    /// Allowed values for the X-Ipfs-Gateway-Prefix header.
    pub prefixes: Vec<String>,
}

const BIND_HOST: &str = "0.0.0.0";
const BIND_PORT: u16 = 8080;

impl Settings {
    pub fn new() -> Settings {
        Settings {
            host: BIND_HOST.to_string(),
            port: BIND_PORT,
            writable: false,
            headers: vec![],
            prefixes: vec![],
        }
    }

    fn bind_from_args(&mut self, arg: &ArgMatches) {
        match arg.value_of("host") {
            Some(v) => {
                self.host = v.to_string();
            }
            _ => {}
        };

        match arg.value_of("port") {
            Some(v) => match u16::from_str_radix(v, 10) {
                Ok(port) => {
                    self.port = port;
                }
                Err(e) => {
                    error!("invalid port {}: {}", v, e);
                }
            },
            _ => {}
        };

        if arg.is_present("writable") {
            self.writable = true;
        }

        if let Some(values) = arg.values_of("header") {
            for v in values {
                match v.split_once(':') {
                    Some((name, value)) => {
                        self.headers
                            .push((name.trim().to_string(), value.trim().to_string()));
                    }
                    None => {
                        error!("malformed header flag: {}", v);
                    }
                }
            }
        }

        if let Some(values) = arg.values_of("prefix") {
            for v in values {
                self.prefixes.push(v.to_string());
            }
        }
    }

    pub fn from_args() -> Settings {
        let mut o = App::new("dagway");
        o = o.version(env!("CARGO_PKG_VERSION"));
        o = o.arg(
            Arg::with_name("host")
                .long("host")
                .short("h")
                .value_name("Host or ip to bind server to")
                .takes_value(true),
        );
        o = o.arg(
            Arg::with_name("port")
                .long("port")
                .short("p")
                .value_name("Port to bind server to")
                .takes_value(true),
        );
        o = o.arg(
            Arg::with_name("writable")
                .long("writable")
                .short("w")
                .help("Enable POST, PUT and DELETE")
                .takes_value(false),
        );
        o = o.arg(
            Arg::with_name("header")
                .long("header")
                .short("H")
                .value_name("Header to add to every response, as name:value")
                .takes_value(true)
                .multiple(true),
        );
        o = o.arg(
            Arg::with_name("prefix")
                .long("prefix")
                .value_name("Allowed sub-path prefix")
                .takes_value(true)
                .multiple(true),
        );

        let arg_matches = o.get_matches();
        let mut settings = Settings::new();
        settings.bind_from_args(&arg_matches);
        settings
    }
}
