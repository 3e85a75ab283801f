//! Launch configuration from the environment.
//!
//! Everything that tunes a guest comes in through `HERMIT_*` environment
//! variables; the command line carries nothing but the image path. This
//! module parses them once at startup into a typed [`Config`] so the rest of
//! the hypervisor never touches `std::env`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

/// Default guest memory size (512 MiB).
pub const DEFAULT_GUEST_SIZE: u64 = 0x2000_0000;

/// TCP port used for migration traffic on both sides.
pub const MIGRATION_PORT: u16 = 1337;

/// Errors produced while reading the launch configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid size '{0}' (expected a number with optional K/M/G/T/P/E suffix)")]
    InvalidSize(String),

    #[error("invalid value '{1}' for {0}")]
    InvalidValue(&'static str, String),

    #[error("failed to read migration parameter file: {0}")]
    ParamFile(#[source] std::io::Error),
}

/// How much of the guest memory a migration transfers in its final pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationMode {
    /// Every byte of guest memory.
    #[default]
    CompleteDump,
    /// Only pages the guest has touched.
    IncrementalDump,
}

/// Whether a migration pre-copies memory while the guest keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationType {
    /// Freeze first, then transfer.
    #[default]
    Cold,
    /// Iterative pre-copy, then a short stop-and-copy.
    Live,
}

/// Migration tuning negotiated with the peer before any memory moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationParams {
    pub mode: MigrationMode,
    pub type_: MigrationType,
    /// RDMA only: register memory on-demand instead of up front.
    pub use_odp: bool,
    /// RDMA only: prefetch registered regions.
    pub prefetch: bool,
}

impl MigrationParams {
    /// Parse the `HERMIT_MIGRATION_PARAMS` file: `key: value` lines with the
    /// keys `mode`, `type`, `use-odp` and `prefetch`. Unknown values fall
    /// back to the defaults with a warning, unknown keys are ignored.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::ParamFile)?;
        let mut params = Self::default();

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "mode" => match value {
                    "complete-dump" => params.mode = MigrationMode::CompleteDump,
                    "incremental-dump" => params.mode = MigrationMode::IncrementalDump,
                    other => warn_unknown("mode", other),
                },
                "type" => match value {
                    "cold" => params.type_ = MigrationType::Cold,
                    "live" => params.type_ = MigrationType::Live,
                    other => warn_unknown("type", other),
                },
                "use-odp" => params.use_odp = value != "0",
                "prefetch" => params.prefetch = value != "0",
                _ => {}
            }
        }

        Ok(params)
    }
}

fn warn_unknown(key: &str, value: &str) {
    tracing::warn!("migration {key} '{value}' not supported, falling back to default");
}

/// Everything the launcher learned from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Guest memory size in bytes (`HERMIT_MEM`).
    pub guest_size: u64,
    /// Number of vCPUs (`HERMIT_CPUS`).
    pub ncores: u32,
    /// Verbose diagnostics and guest UART pass-through (`HERMIT_VERBOSE`).
    pub verbose: bool,
    /// TAP interface name; networking is enabled when set (`HERMIT_NETIF`).
    pub netif: Option<String>,
    /// Guest IPv4 address written to the boot header (`HERMIT_IP`).
    pub ip: Option<Ipv4Addr>,
    /// Gateway address written to the boot header (`HERMIT_GATEWAY`).
    pub gateway: Option<Ipv4Addr>,
    /// Network mask written to the boot header (`HERMIT_MASK`).
    pub mask: Option<Ipv4Addr>,
    /// Checkpoint interval in seconds, 0 disables (`HERMIT_CHECKPOINT`).
    pub checkpoint_interval: u32,
    /// Full instead of incremental checkpoints (`HERMIT_FULLCHECKPOINT`).
    pub full_checkpoint: bool,
    /// Start as migration destination (`HERMIT_MIGRATION_SERVER`).
    pub migration_server: bool,
    /// Destination address for an outgoing migration (`HERMIT_MIGRATION_SUPPORT`).
    pub migration_target: Option<String>,
    /// Migration tuning (`HERMIT_MIGRATION_PARAMS` file).
    pub migration_params: MigrationParams,
    /// Enable the in-process debug stub (`HERMIT_DEBUG`).
    pub debug: bool,
    /// Advise the kernel that guest memory is mergeable (`HERMIT_MERGEABLE`).
    pub mergeable: bool,
    /// Back guest memory with transparent huge pages (`HERMIT_HUGEPAGE`,
    /// enabled unless explicitly set to 0).
    pub hugepage: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let guest_size = match std::env::var("HERMIT_MEM") {
            Ok(s) => memparse(&s).ok_or(ConfigError::InvalidSize(s))?,
            Err(_) => DEFAULT_GUEST_SIZE,
        };

        let ncores = match std::env::var("HERMIT_CPUS") {
            Ok(s) => s
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue("HERMIT_CPUS", s))?,
            Err(_) => 1,
        };

        let migration_params = match std::env::var("HERMIT_MIGRATION_PARAMS") {
            Ok(path) => MigrationParams::from_file(&PathBuf::from(path))?,
            Err(_) => MigrationParams::default(),
        };

        Ok(Self {
            guest_size,
            ncores,
            verbose: env_flag("HERMIT_VERBOSE"),
            netif: std::env::var("HERMIT_NETIF").ok(),
            ip: parse_addr("HERMIT_IP")?,
            gateway: parse_addr("HERMIT_GATEWAY")?,
            mask: parse_addr("HERMIT_MASK")?,
            checkpoint_interval: match std::env::var("HERMIT_CHECKPOINT") {
                Ok(s) => s
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidValue("HERMIT_CHECKPOINT", s))?,
                Err(_) => 0,
            },
            full_checkpoint: env_flag("HERMIT_FULLCHECKPOINT"),
            migration_server: std::env::var("HERMIT_MIGRATION_SERVER").is_ok(),
            migration_target: std::env::var("HERMIT_MIGRATION_SUPPORT").ok(),
            migration_params,
            debug: env_flag("HERMIT_DEBUG"),
            mergeable: env_flag("HERMIT_MERGEABLE"),
            // Huge pages are on by default; "0" opts out.
            hugepage: std::env::var("HERMIT_HUGEPAGE").map_or(true, |v| v != "0"),
        })
    }
}

/// A variable that is "on" when set to anything but 0.
fn env_flag(name: &str) -> bool {
    std::env::var(name).map_or(false, |v| v != "0")
}

fn parse_addr(name: &'static str) -> Result<Option<Ipv4Addr>, ConfigError> {
    match std::env::var(name) {
        Ok(s) => s
            .parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name, s)),
        Err(_) => Ok(None),
    }
}

/// Parse a memory size with an optional K/M/G/T/P/E suffix (powers of 1024).
///
/// Accepts decimal, `0x` hexadecimal and `0` octal prefixes, matching the
/// kernel's `memparse`. Returns `None` for malformed input.
pub fn memparse(input: &str) -> Option<u64> {
    let s = input.trim();

    let (number, suffix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        let pos = hex
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(hex.len());
        (u64::from_str_radix(hex.get(..pos)?, 16).ok()?, &hex[pos..])
    } else {
        let pos = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let digits = s.get(..pos)?;
        let number = if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8).ok()?
        } else {
            digits.parse::<u64>().ok()?
        };
        (number, &s[pos..])
    };

    let shift = match suffix {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        "T" | "t" => 40,
        "P" | "p" => 50,
        "E" | "e" => 60,
        _ => return None,
    };

    number.checked_shl(shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memparse_plain() {
        assert_eq!(memparse("1234"), Some(1234));
        assert_eq!(memparse("0x1000"), Some(0x1000));
    }

    #[test]
    fn test_memparse_suffixes() {
        assert_eq!(memparse("1K"), Some(1024));
        assert_eq!(memparse("512M"), Some(512 << 20));
        assert_eq!(memparse("8G"), Some(8 << 30));
        assert_eq!(memparse("2t"), Some(2 << 40));
    }

    #[test]
    fn test_memparse_rejects_garbage() {
        assert_eq!(memparse(""), None);
        assert_eq!(memparse("12Q"), None);
        assert_eq!(memparse("G"), None);
    }

    #[test]
    fn test_migration_params_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "mode: incremental-dump").unwrap();
        writeln!(f, "type: live").unwrap();
        writeln!(f, "use-odp: 1").unwrap();
        writeln!(f, "prefetch: 0").unwrap();

        let params = MigrationParams::from_file(&f.path().to_path_buf()).unwrap();
        assert_eq!(params.mode, MigrationMode::IncrementalDump);
        assert_eq!(params.type_, MigrationType::Live);
        assert!(params.use_odp);
        assert!(!params.prefetch);
    }

    #[test]
    fn test_migration_params_defaults_on_unknown() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "mode: warp-speed").unwrap();

        let params = MigrationParams::from_file(&f.path().to_path_buf()).unwrap();
        assert_eq!(params.mode, MigrationMode::CompleteDump);
        assert_eq!(params.type_, MigrationType::Cold);
    }
}
