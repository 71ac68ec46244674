//! Where the shim listens for task-control requests.
//!
//! containerd passes the shim a socket address on the command line. It is
//! usually a bare absolute path; `unix://` and loopback `tcp://` forms are
//! accepted too, the latter for local debugging.

use std::path::PathBuf;
use std::str::FromStr;

/// Listen address of the control socket.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    /// 127.0.0.1 on `port`
    Tcp { port: u16 },

    /// Unix socket at `socket_path`, replaced if stale
    Unix { socket_path: PathBuf },
}

impl Transport {
    /// Parse a `--socket` value.
    pub fn from_uri(address: &str) -> Result<Self, String> {
        match address.split_once("://") {
            Some(("unix", "")) => Err(format!("socket address '{}' has no path", address)),
            Some(("unix", path)) => Ok(Transport::Unix {
                socket_path: PathBuf::from(path),
            }),
            Some(("tcp", host_port)) => {
                let (_, port) = host_port
                    .rsplit_once(':')
                    .ok_or_else(|| format!("socket address '{}' has no port", address))?;
                let port = port
                    .parse()
                    .map_err(|e| format!("bad port in socket address '{}': {}", address, e))?;
                Ok(Transport::Tcp { port })
            }
            None if address.starts_with('/') => Ok(Transport::Unix {
                socket_path: PathBuf::from(address),
            }),
            _ => Err(format!(
                "unsupported socket address '{}': use an absolute path, unix://PATH or tcp://127.0.0.1:PORT",
                address
            )),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp { port } => write!(f, "tcp://127.0.0.1:{}", port),
            Transport::Unix { socket_path } => write!(f, "unix://{}", socket_path.display()),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(path: &str) -> Transport {
        Transport::Unix {
            socket_path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_containerd_bare_path() {
        let t = Transport::from_uri("/run/containerd/s/abc").unwrap();
        assert_eq!(t, unix("/run/containerd/s/abc"));
        assert_eq!(t.to_string(), "unix:///run/containerd/s/abc");
    }

    #[test]
    fn test_unix_scheme_round_trips_through_display() {
        let t: Transport = "unix:///run/gvshim/c1.sock".parse().unwrap();
        assert_eq!(t, unix("/run/gvshim/c1.sock"));
        assert_eq!(t.to_string().parse::<Transport>().unwrap(), t);
    }

    #[test]
    fn test_loopback_tcp() {
        let t = Transport::from_uri("tcp://127.0.0.1:7070").unwrap();
        assert_eq!(t, Transport::Tcp { port: 7070 });
    }

    #[test]
    fn test_bad_addresses() {
        assert!(Transport::from_uri("vsock://2695").is_err());
        assert!(Transport::from_uri("unix://").is_err());
        assert!(Transport::from_uri("tcp://127.0.0.1").is_err());
        assert!(Transport::from_uri("tcp://127.0.0.1:http").is_err());
        assert!(Transport::from_uri("relative/shim.sock").is_err());
    }
}
