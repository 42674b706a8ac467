//! Layered configuration.
//!
//! Three layers, later ones winning: built-in defaults, the site-wide file,
//! an optional override file, then `-p section.name=value` command-line
//! parameters. The result is a plain struct; nothing downstream touches the
//! parser again.

use std::time::Duration;

use config::{Config, File, FileFormat};

use herd_types::Error;

/// Site-wide configuration file, read when present.
pub const SITE_CONFIG: &str = "/etc/herd/herd.toml";

/// Everything the daemon reads from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HerdConfig {
    /// `host:port` the RPC server binds.
    pub address: String,
    /// RPC session count reported by the node.
    pub rpc_threads: usize,
    /// Executor worker pool size.
    pub workers: usize,
    /// Seconds a terminal procedure is kept before the sweep removes it.
    pub retention: Duration,
    /// Seconds between failure detector probe rounds.
    pub detector_period: Duration,
    /// Consecutive probe failures before a server is declared down.
    pub failures_to_down: u32,
    /// SQLite database path, or `:memory:`.
    pub database: String,
    /// Initial log filter.
    pub log_level: String,
    /// Log file path; stderr when unset.
    pub log_file: Option<String>,
    /// Seconds clients may cache responses.
    pub ttl: u64,
}

impl HerdConfig {
    /// Load configuration from the given files plus `-p` overrides.
    ///
    /// `site` defaults to [`SITE_CONFIG`] and is optional on disk; `extra`
    /// must exist when named. Any malformed value aborts startup.
    pub fn load(
        site: Option<&str>,
        extra: Option<&str>,
        params: &[String],
    ) -> Result<Self, Error> {
        let mut builder = Config::builder()
            .set_default("protocol.xmlrpc.address", "localhost:32274")
            .map_err(config_err)?
            .set_default("protocol.xmlrpc.threads", 5_i64)
            .map_err(config_err)?
            .set_default("protocol.xmlrpc.ttl", 1_i64)
            .map_err(config_err)?
            .set_default("executor.workers", 4_i64)
            .map_err(config_err)?
            .set_default("executor.retention", 3600_i64)
            .map_err(config_err)?
            .set_default("failure_detector.period", 1.0_f64)
            .map_err(config_err)?
            .set_default("failure_detector.failures_to_down", 2_i64)
            .map_err(config_err)?
            .set_default("storage.database", "herd.db")
            .map_err(config_err)?
            .set_default("logging.level", "info")
            .map_err(config_err)?;

        builder = builder.add_source(
            File::with_name(site.unwrap_or(SITE_CONFIG))
                .format(FileFormat::Toml)
                .required(site.is_some()),
        );
        if let Some(extra) = extra {
            builder = builder.add_source(File::with_name(extra).format(FileFormat::Toml));
        }
        for param in params {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                Error::Config(format!("parameter ({param}) is not section.name=value"))
            })?;
            builder = builder
                .set_override(key.trim(), value.trim())
                .map_err(config_err)?;
        }

        let config = builder.build().map_err(config_err)?;
        let herd = Self {
            address: config
                .get_string("protocol.xmlrpc.address")
                .map_err(config_err)?,
            rpc_threads: get_usize(&config, "protocol.xmlrpc.threads")?,
            workers: get_usize(&config, "executor.workers")?,
            retention: Duration::from_secs(
                config.get_int("executor.retention").map_err(config_err)? as u64,
            ),
            detector_period: Duration::from_secs_f64(
                config
                    .get_float("failure_detector.period")
                    .map_err(config_err)?,
            ),
            failures_to_down: config
                .get_int("failure_detector.failures_to_down")
                .map_err(config_err)? as u32,
            database: config.get_string("storage.database").map_err(config_err)?,
            log_level: config.get_string("logging.level").map_err(config_err)?,
            log_file: config.get_string("logging.url").ok(),
            ttl: config.get_int("protocol.xmlrpc.ttl").map_err(config_err)? as u64,
        };
        herd.validate()?;
        Ok(herd)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.address.contains(':') {
            return Err(Error::Config(format!(
                "protocol.xmlrpc.address ({}) is not host:port",
                self.address
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("executor.workers must be positive".into()));
        }
        if self.detector_period.is_zero() {
            return Err(Error::Config(
                "failure_detector.period must be positive".into(),
            ));
        }
        if self.failures_to_down == 0 {
            return Err(Error::Config(
                "failure_detector.failures_to_down must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn get_usize(config: &Config, key: &str) -> Result<usize, Error> {
    let value = config.get_int(key).map_err(config_err)?;
    usize::try_from(value).map_err(|_| Error::Config(format!("{key} must be non-negative")))
}

fn config_err(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_any_file() {
        let cfg = HerdConfig::load(None, None, &[]).unwrap();
        assert_eq!(cfg.address, "localhost:32274");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.failures_to_down, 2);
        assert_eq!(cfg.detector_period, Duration::from_secs(1));
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.log_file.is_none());
    }

    #[test]
    fn files_and_params_layer_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site.toml");
        std::fs::File::create(&site)
            .unwrap()
            .write_all(
                b"[protocol.xmlrpc]\naddress = \"0.0.0.0:4000\"\n\
                  [executor]\nworkers = 8\n",
            )
            .unwrap();
        let extra = dir.path().join("extra.toml");
        std::fs::File::create(&extra)
            .unwrap()
            .write_all(b"[executor]\nworkers = 16\n")
            .unwrap();

        let cfg = HerdConfig::load(
            Some(site.to_str().unwrap()),
            Some(extra.to_str().unwrap()),
            &["failure_detector.period=0.5".to_string()],
        )
        .unwrap();
        assert_eq!(cfg.address, "0.0.0.0:4000");
        // The override file beats the site file, the parameter beats both.
        assert_eq!(cfg.workers, 16);
        assert_eq!(cfg.detector_period, Duration::from_millis(500));
    }

    #[test]
    fn malformed_values_abort() {
        assert!(matches!(
            HerdConfig::load(None, None, &["notanassignment".to_string()]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            HerdConfig::load(None, None, &["executor.workers=0".to_string()]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            HerdConfig::load(
                None,
                None,
                &["protocol.xmlrpc.address=noport".to_string()]
            ),
            Err(Error::Config(_))
        ));
    }
}
