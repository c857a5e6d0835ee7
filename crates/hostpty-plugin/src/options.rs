//! Plugin configuration: built-in defaults, an optional TOML file, then
//! command-line flags, each layer overriding the previous one.
//!
//! ```toml
//! kubelet_socket = "/var/lib/kubelet/device-plugins/kubelet.sock"
//! listen_socket = "/var/lib/kubelet/device-plugins/hostpty.sock"
//! pts_socket_dir = "/var/run/hostpty/pts"
//! max_pty = 10
//! shell = "bash"
//! log = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use hostpty_proto::deviceplugin::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET};
use serde::Deserialize;

pub const DEFAULT_LISTEN_SOCKET_NAME: &str = "hostpty.sock";
pub const DEFAULT_PTS_SOCKET_DIR: &str = "/var/run/hostpty/pts";
pub const DEFAULT_MAX_PTY: u8 = 10;
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_LOG_LEVEL: &str = "error";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Registration socket of the node agent.
    pub kubelet_socket: PathBuf,
    /// Socket this plugin serves the device-plugin API on.
    pub listen_socket: PathBuf,
    /// Root directory of the per-device session sockets.
    pub pts_socket_dir: PathBuf,
    /// Number of devices advertised, `pts0` to `pts{max_pty-1}`.
    pub max_pty: u8,
    pub shell: String,
    pub log: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            kubelet_socket: PathBuf::from(KUBELET_SOCKET),
            listen_socket: Path::new(DEVICE_PLUGIN_PATH).join(DEFAULT_LISTEN_SOCKET_NAME),
            pts_socket_dir: PathBuf::from(DEFAULT_PTS_SOCKET_DIR),
            max_pty: DEFAULT_MAX_PTY,
            shell: DEFAULT_SHELL.to_string(),
            log: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Options {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the config file if one was given, then the flags.
    pub fn resolve(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut options = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        options.apply(&args.overrides);
        Ok(options)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.kubelet_socket {
            self.kubelet_socket = v.clone();
        }
        if let Some(v) = &overrides.listen_socket {
            self.listen_socket = v.clone();
        }
        if let Some(v) = &overrides.pts_socket_dir {
            self.pts_socket_dir = v.clone();
        }
        if let Some(v) = overrides.max_pty {
            self.max_pty = v;
        }
        if let Some(v) = &overrides.shell {
            self.shell = v.clone();
        }
        if let Some(v) = &overrides.log {
            self.log = v.clone();
        }
    }
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub kubelet_socket: Option<PathBuf>,
    pub listen_socket: Option<PathBuf>,
    pub pts_socket_dir: Option<PathBuf>,
    pub max_pty: Option<u8>,
    pub shell: Option<String>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub overrides: Overrides,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(CliArgs),
    Help,
    Version,
}

pub fn print_help() {
    eprintln!("pty-device-plugin - exclusive host shells for containers");
    eprintln!();
    eprintln!("Usage: pty-device-plugin [OPTIONS]");
    eprintln!();
    eprintln!("  -k, --kubelet-unix-sock <PATH>        Node agent registration socket");
    eprintln!("                                        (default: {KUBELET_SOCKET})");
    eprintln!("  -l, --plugin-listen-unix-sock <PATH>  Socket to serve the device-plugin API on");
    eprintln!("                                        (default: {DEVICE_PLUGIN_PATH}{DEFAULT_LISTEN_SOCKET_NAME})");
    eprintln!("  -d, --pts-unix-sock-dir <DIR>         Directory for per-session sockets");
    eprintln!("                                        (default: {DEFAULT_PTS_SOCKET_DIR})");
    eprintln!("  -m, --max-pty <N>                     Number of PTY devices to advertise (default: {DEFAULT_MAX_PTY})");
    eprintln!("  -s, --shell <CMD>                     Shell started for each session (default: {DEFAULT_SHELL})");
    eprintln!("  -c, --config <FILE>                   TOML config file; reloaded on change");
    eprintln!("      --log <LEVEL>                     debug, info, warning or error (default: {DEFAULT_LOG_LEVEL})");
    eprintln!("  -v, --version                         Show version");
    eprintln!("  -h, --help                            Show this help");
    eprintln!();
    eprintln!("SIGHUP hands the listening sockets to a freshly started copy of this binary.");
}

/// Parse the arguments after the program name.
pub fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut parsed = CliArgs::default();
    let mut i = 0;

    while i < args.len() {
        let (flag, inline) = match args[i].split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (args[i].as_str(), None),
        };
        let mut value = || -> Result<String, String> {
            if let Some(v) = &inline {
                return Ok(v.clone());
            }
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("missing value for {flag}"))
        };

        match flag {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-k" | "--kubelet-unix-sock" => {
                parsed.overrides.kubelet_socket = Some(value()?.into());
            }
            "-l" | "--plugin-listen-unix-sock" => {
                parsed.overrides.listen_socket = Some(value()?.into());
            }
            "-d" | "--pts-unix-sock-dir" => {
                parsed.overrides.pts_socket_dir = Some(value()?.into());
            }
            "-m" | "--max-pty" => {
                let raw = value()?;
                let count = raw
                    .parse::<u8>()
                    .map_err(|_| format!("--max-pty expects 0-255, got {raw}"))?;
                parsed.overrides.max_pty = Some(count);
            }
            "-s" | "--shell" => parsed.overrides.shell = Some(value()?),
            "-c" | "--config" => parsed.config = Some(value()?.into()),
            "--log" => {
                let level = value()?;
                hostpty_runtime::logging::parse_level(&level)?;
                parsed.overrides.log = Some(level);
            }
            other => return Err(format!("unknown argument: {other}. Use -h for help.")),
        }
        i += 1;
    }

    Ok(Command::Run(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(
            options.listen_socket,
            PathBuf::from("/var/lib/kubelet/device-plugins/hostpty.sock")
        );
        assert_eq!(options.pts_socket_dir, PathBuf::from("/var/run/hostpty/pts"));
        assert_eq!(options.max_pty, 10);
        assert_eq!(options.shell, "sh");
        assert_eq!(options.log, "error");
    }

    #[test]
    fn test_parse_flags() {
        let cmd = parse_args(args(&[
            "-m",
            "3",
            "--shell=bash",
            "-d",
            "/tmp/pts",
            "--log",
            "warning",
        ]))
        .unwrap();
        let Command::Run(cli) = cmd else {
            panic!("expected run");
        };
        assert_eq!(cli.overrides.max_pty, Some(3));
        assert_eq!(cli.overrides.shell.as_deref(), Some("bash"));
        assert_eq!(cli.overrides.pts_socket_dir, Some(PathBuf::from("/tmp/pts")));
        assert_eq!(cli.overrides.log.as_deref(), Some("warning"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args(&["--max-pty", "300"])).is_err());
        assert!(parse_args(args(&["--shell"])).is_err());
        assert!(parse_args(args(&["--log", "chatty"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
        assert_eq!(parse_args(args(&["-v"])), Ok(Command::Version));
        assert_eq!(parse_args(args(&["-m", "2", "-h"])), Ok(Command::Help));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostpty.toml");
        fs::write(&path, "shell = \"bash\"\nmax_pty = 4\nlog = \"info\"\n").unwrap();

        let cmd = parse_args(args(&["-c", path.to_str().unwrap(), "-m", "2"])).unwrap();
        let Command::Run(cli) = cmd else {
            panic!("expected run");
        };
        let options = Options::resolve(&cli).unwrap();
        assert_eq!(options.shell, "bash");
        assert_eq!(options.max_pty, 2);
        assert_eq!(options.log, "info");
        // Untouched keys keep their defaults.
        assert_eq!(options.pts_socket_dir, PathBuf::from(DEFAULT_PTS_SOCKET_DIR));
    }

    #[test]
    fn test_bad_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "max_pty = \"many\"\n").unwrap();
        assert!(matches!(Options::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Options::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
