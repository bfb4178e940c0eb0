use std::path::PathBuf;

use clap::Parser;

/// Small offset reserved for the listening socket, the signal channel and
/// stdio, subtracted from the descriptor soft limit to derive
/// `max_connections` (see [`Config::resolve`]).
const RESERVED_DESCRIPTORS: u64 = 3;

const DEFAULT_PORT: u16 = 9001;

/// `chatd` command-line surface: `-p/--port`, `-l/--log`, and clap's
/// generated `-h/--help`.
#[derive(Parser, Debug)]
#[command(name = "chatd", about = "Multi-client broadcast chat server (BCP)")]
pub struct Args {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Redirect log output to this file instead of stdout.
    #[arg(short, long, value_name = "PATH")]
    pub log: Option<PathBuf>,
}

/// Resolved boot-time configuration, derived from `Args` plus the process's
/// file-descriptor soft limit.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_path: Option<PathBuf>,
    pub max_connections: usize,
}

impl Config {
    /// Builds a `Config` from parsed CLI args, deriving `max_connections`
    /// from `RLIMIT_NOFILE`'s current soft limit minus
    /// [`RESERVED_DESCRIPTORS`].
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let soft_limit = current_nofile_soft_limit()?;
        let max_connections = soft_limit.saturating_sub(RESERVED_DESCRIPTORS) as usize;
        if max_connections == 0 {
            return Err(ConfigError::DescriptorCeilingTooLow { soft_limit });
        }
        Ok(Self { port: args.port, log_path: args.log, max_connections })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to query RLIMIT_NOFILE: {0}")]
    RlimitQuery(#[source] std::io::Error),

    #[error(
        "RLIMIT_NOFILE soft limit ({soft_limit}) leaves no room for connections after reserving {RESERVED_DESCRIPTORS} descriptors"
    )]
    DescriptorCeilingTooLow { soft_limit: u64 },
}

/// Queries the process's current `RLIMIT_NOFILE` soft limit via
/// `getrlimit(2)`.
fn current_nofile_soft_limit() -> Result<u64, ConfigError> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `limit` is a valid, fully-initialised `libc::rlimit` and its
    // address is passed as the sole output parameter `getrlimit` writes to.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(ConfigError::RlimitQuery(std::io::Error::last_os_error()));
    }
    Ok(limit.rlim_cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_derives_max_connections_from_rlimit() {
        let args = Args { port: 12345, log: None };
        let config = Config::resolve(args).unwrap();
        assert_eq!(config.port, 12345);
        assert!(config.max_connections > 0);
    }

    #[test]
    fn default_port_matches_spec() {
        let args = Args::parse_from(["chatd"]);
        assert_eq!(args.port, DEFAULT_PORT);
        assert!(args.log.is_none());
    }

    #[test]
    fn parses_short_flags() {
        let args = Args::parse_from(["chatd", "-p", "7000", "-l", "/tmp/chat.log"]);
        assert_eq!(args.port, 7000);
        assert_eq!(args.log, Some(PathBuf::from("/tmp/chat.log")));
    }
}
