//! Manual `--flag=value` command-line parsing, in the reference node's
//! style: read everything into a map first, then pull typed fields out
//! of it with one small accessor per flag.

use std::collections::HashMap;

#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub redis_port: Option<u16>,
    pub redis_host: Option<String>,
    pub db_path: String,
    pub discovery_port: u16,
    pub log_file: String,
}

impl ServerConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let map = parse_flags(args)?;

        let port = get_required(&map, "port")?.parse::<u16>().map_err(|e| format!("--port: {e}"))?;
        let db_path = get_required(&map, "db-path")?.to_string();

        let redis_port = match map.get("redis-port") {
            Some(v) => Some(v.parse::<u16>().map_err(|e| format!("--redis-port: {e}"))?),
            None => None,
        };
        let redis_host = map.get("redis-host").cloned();

        let discovery_port = match map.get("discovery-port") {
            Some(v) => v.parse::<u16>().map_err(|e| format!("--discovery-port: {e}"))?,
            None => crate::discovery::DEFAULT_DISCOVERY_PORT,
        };

        let log_file = map.get("log-file").cloned().unwrap_or_else(|| "beacon.log".to_string());

        // --posix-queue is a legacy flag, accepted and ignored.

        Ok(ServerConfig { port, redis_port, redis_host, db_path, discovery_port, log_file })
    }
}

fn parse_flags(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in args {
        let Some(rest) = arg.strip_prefix("--") else {
            return Err(format!("unrecognized argument '{arg}', expected --flag=value"));
        };
        match rest.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                map.insert(rest.to_string(), "1".to_string());
            }
        }
    }
    Ok(map)
}

fn get_required<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str, String> {
    map.get(key).map(String::as_str).ok_or_else(|| format!("missing required flag --{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_flags() {
        let args: Vec<String> =
            vec!["--port=25000".to_string(), "--db-path=/tmp/beacon-db".to_string()];
        let config = ServerConfig::from_args(&args).unwrap();
        assert_eq!(config.port, 25000);
        assert_eq!(config.db_path, "/tmp/beacon-db");
        assert_eq!(config.discovery_port, crate::discovery::DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn missing_required_flag_is_an_error() {
        let args: Vec<String> = vec!["--port=25000".to_string()];
        assert!(ServerConfig::from_args(&args).is_err());
    }

    #[test]
    fn legacy_posix_queue_flag_is_accepted() {
        let args: Vec<String> = vec![
            "--port=25000".to_string(),
            "--db-path=/tmp/beacon-db".to_string(),
            "--posix-queue=0".to_string(),
        ];
        assert!(ServerConfig::from_args(&args).is_ok());
    }
}
