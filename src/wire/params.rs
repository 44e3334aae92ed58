//! Endpoint addresses and the comma-separated parameter-string syntax.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tools::error::{Error, Result};

/// Default container buffer size in bytes.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 100_000;
/// Default number of containers the dispatch ring holds.
pub(crate) const DEFAULT_ACTIVE_CONTAINERS: usize = 50;
/// Default limit on concurrently connected consumers.
pub(crate) const DEFAULT_MAX_CLIENTS: usize = 64;
/// Default auto-flush period.
pub(crate) const DEFAULT_AUTOFLUSH: Duration = Duration::from_millis(500);

/// Transport flavor and address of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointAddr {
    /// TCP socket. Senders listen on the port (any interface); receivers
    /// connect to `host:port`.
    Tcp {
        /// Remote host (receivers) or bind interface (senders).
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Local (unix-domain) socket, identified by a string id expanded into
    /// a conventional filesystem path.
    Unix {
        /// Socket id.
        id: String,
    },
}

impl EndpointAddr {
    /// Filesystem path of a unix-socket endpoint.
    pub fn socket_path(&self) -> Option<PathBuf> {
        match self {
            EndpointAddr::Unix { id } => Some(PathBuf::from(format!("/tmp/telemux-{}.sock", id))),
            EndpointAddr::Tcp { .. } => None,
        }
    }
}

/// Configuration of an output endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Where to listen.
    pub addr: EndpointAddr,
    /// Container buffer size in bytes.
    pub buffer_size: usize,
    /// Number of containers the dispatch ring holds.
    pub active_containers: usize,
    /// Limit on concurrently connected consumers.
    pub max_clients: usize,
    /// Blocking admission: the producer waits for the slowest consumer
    /// instead of dropping containers for laggards.
    pub blocking: bool,
    /// Period after which a non-empty active container is flushed.
    pub autoflush: Duration,
}

impl SenderConfig {
    /// Configuration listening on a TCP port with all defaults.
    pub fn tcp(port: u16) -> Self {
        SenderConfig {
            addr: EndpointAddr::Tcp {
                host: "0.0.0.0".to_owned(),
                port,
            },
            buffer_size: DEFAULT_BUFFER_SIZE,
            active_containers: DEFAULT_ACTIVE_CONTAINERS,
            max_clients: DEFAULT_MAX_CLIENTS,
            blocking: false,
            autoflush: DEFAULT_AUTOFLUSH,
        }
    }

    /// Configuration listening on a unix socket with all defaults.
    pub fn unix(id: &str) -> Self {
        SenderConfig {
            addr: EndpointAddr::Unix { id: id.to_owned() },
            ..SenderConfig::tcp(0)
        }
    }

    /// Parse a parameter string: a leading transport token (`tcp` or
    /// `unix`), the port or socket id, then optional comma-separated
    /// options `buffer_size=N`, `active_containers=N`, `max_clients=N` and
    /// `blocking_mode`.
    ///
    /// Example: `"tcp:7000,buffer_size=50000,max_clients=8,blocking_mode"`.
    pub fn parse(params: &str) -> Result<Self> {
        let (addr, rest) = parse_addr(params, true)?;
        let mut cfg = SenderConfig {
            addr,
            ..SenderConfig::tcp(0)
        };
        for opt in rest {
            match opt.split_once('=') {
                Some(("buffer_size", v)) => {
                    cfg.buffer_size = v
                        .parse()
                        .map_err(|_| Error::spec(format!("bad buffer_size {:?}", v)))?;
                }
                Some(("active_containers", v)) => {
                    cfg.active_containers = v
                        .parse()
                        .map_err(|_| Error::spec(format!("bad active_containers {:?}", v)))?;
                }
                Some(("max_clients", v)) => {
                    cfg.max_clients = v
                        .parse()
                        .map_err(|_| Error::spec(format!("bad max_clients {:?}", v)))?;
                }
                Some(("autoflush_ms", v)) => {
                    let ms: u64 = v
                        .parse()
                        .map_err(|_| Error::spec(format!("bad autoflush_ms {:?}", v)))?;
                    cfg.autoflush = Duration::from_millis(ms);
                }
                None if opt == "blocking_mode" => cfg.blocking = true,
                _ => return Err(Error::spec(format!("unknown parameter {:?}", opt))),
            }
        }
        if cfg.active_containers == 0 || cfg.max_clients == 0 {
            return Err(Error::spec(
                "active_containers and max_clients must be positive",
            ));
        }
        Ok(cfg)
    }
}

/// Configuration of an input endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Where to connect.
    pub addr: EndpointAddr,
}

impl ReceiverConfig {
    /// Configuration connecting to a TCP endpoint.
    pub fn tcp(host: &str, port: u16) -> Self {
        ReceiverConfig {
            addr: EndpointAddr::Tcp {
                host: host.to_owned(),
                port,
            },
        }
    }

    /// Configuration connecting to a unix-socket endpoint.
    pub fn unix(id: &str) -> Self {
        ReceiverConfig {
            addr: EndpointAddr::Unix { id: id.to_owned() },
        }
    }

    /// Parse a parameter string: `"tcp:HOST:PORT"` or `"unix:ID"`.
    pub fn parse(params: &str) -> Result<Self> {
        let (addr, rest) = parse_addr(params, false)?;
        if let Some(opt) = rest.first() {
            return Err(Error::spec(format!("unknown parameter {:?}", opt)));
        }
        Ok(ReceiverConfig { addr })
    }
}

/// Split the leading `transport:address` token off a parameter string.
fn parse_addr(params: &str, sender_side: bool) -> Result<(EndpointAddr, Vec<String>)> {
    let mut tokens = params.split(',').map(str::trim);
    let head = tokens
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::spec("empty endpoint parameter string"))?;
    let rest: Vec<String> = tokens
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();

    let (flavor, addr) = head
        .split_once(':')
        .ok_or_else(|| Error::spec(format!("missing transport token in {:?}", head)))?;
    match flavor {
        "tcp" | "t" => {
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => (host.to_owned(), port),
                None if sender_side => ("0.0.0.0".to_owned(), addr),
                None => ("127.0.0.1".to_owned(), addr),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| Error::spec(format!("bad port {:?}", addr)))?;
            Ok((EndpointAddr::Tcp { host, port }, rest))
        }
        "unix" | "u" => {
            if addr.is_empty() {
                return Err(Error::spec("missing unix socket id"));
            }
            Ok((
                EndpointAddr::Unix {
                    id: addr.to_owned(),
                },
                rest,
            ))
        }
        other => Err(Error::spec(format!("unknown transport {:?}", other))),
    }
}
