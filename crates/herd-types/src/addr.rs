//! Address helpers used when reading and reporting `host:port` pairs.

use crate::Error;

/// Split an address into host and port, falling back to `default_port` when
/// the address carries none.
pub fn split_host_port(address: &str, default_port: u16) -> Result<(String, u16), Error> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(Error::Server(format!("address ({address}) has no host")));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Server(format!("address ({address}) has a bad port")))?;
            Ok((host.to_string(), port))
        }
        None if address.is_empty() => {
            Err(Error::Server("address cannot be empty".into()))
        }
        None => Ok((address.to_string(), default_port)),
    }
}

/// Combine host and port back into the canonical `host:port` form.
pub fn combine_host_port(host: &str, port: u16) -> String {
    let host = if host == "127.0.0.1" { "localhost" } else { host };
    format!("{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_with_and_without_port() {
        assert_eq!(
            split_host_port("db1:3307", 3306).unwrap(),
            ("db1".to_string(), 3307)
        );
        assert_eq!(
            split_host_port("db1", 3306).unwrap(),
            ("db1".to_string(), 3306)
        );
        assert!(split_host_port(":3307", 3306).is_err());
        assert!(split_host_port("db1:notaport", 3306).is_err());
        assert!(split_host_port("", 3306).is_err());
    }

    #[test]
    fn combine_normalizes_loopback() {
        assert_eq!(combine_host_port("127.0.0.1", 32274), "localhost:32274");
        assert_eq!(combine_host_port("db1", 3306), "db1:3306");
    }
}
