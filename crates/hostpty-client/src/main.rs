use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context;
use hostpty_proto::terminal::SOCK_FILE_ENV;
use hostpty_runtime::{logging, version};

mod raw;
mod relay;
mod session;
mod stdin;

const NAME: &str = "pty-client";

#[derive(Debug, Default, PartialEq)]
struct ClientArgs {
    sock: Option<PathBuf>,
    log: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(ClientArgs),
    Help,
    Version,
}

fn print_help() {
    println!("{NAME} - attach this terminal to a host PTY session");
    println!();
    println!("USAGE:");
    println!("    {NAME} [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -s, --sock <PATH>     Session socket (default: ${SOCK_FILE_ENV})");
    println!("        --log <LEVEL>     Log level: trace, debug, info, warn, error (default: error)");
    println!("    -h, --help            Print help information");
    println!("    -v, --version         Print version information");
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut parsed = ClientArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match flag.as_str() {
            "-s" | "--sock" => parsed.sock = Some(PathBuf::from(value("--sock")?)),
            "--log" => parsed.log = Some(value("--log")?),
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Command::Run(parsed))
}

/// The `--sock` flag wins over the environment.
fn resolve_socket(flag: Option<PathBuf>, env: Option<OsString>) -> Option<PathBuf> {
    flag.or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("{}", version::info(NAME));
            return Ok(());
        }
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    let level = args.log.as_deref().unwrap_or("error");
    logging::init(logging::parse_level(level).map_err(anyhow::Error::msg)?);

    let socket = resolve_socket(args.sock, std::env::var_os(SOCK_FILE_ENV))
        .with_context(|| format!("no session socket: pass --sock or set {SOCK_FILE_ENV}"))?;
    session::run(&socket).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(
            parse(&["-s", "/var/run/hostpty/pts/pts0", "--log=debug"]),
            Ok(Command::Run(ClientArgs {
                sock: Some(PathBuf::from("/var/run/hostpty/pts/pts0")),
                log: Some("debug".to_string()),
            }))
        );
        assert_eq!(parse(&["--sock=/tmp/s"]).map(|c| matches!(c, Command::Run(_))), Ok(true));
        assert_eq!(parse(&["-h"]), Ok(Command::Help));
        assert_eq!(parse(&["--version"]), Ok(Command::Version));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&["--sock"]).unwrap_err().contains("requires a value"));
        assert!(parse(&["--bogus"]).unwrap_err().contains("unknown argument"));
    }

    #[test]
    fn test_socket_flag_beats_env() {
        let env = Some(OsString::from("/from/env"));
        assert_eq!(
            resolve_socket(Some(PathBuf::from("/from/flag")), env.clone()),
            Some(PathBuf::from("/from/flag"))
        );
        assert_eq!(resolve_socket(None, env), Some(PathBuf::from("/from/env")));
        assert_eq!(resolve_socket(None, Some(OsString::new())), None);
        assert_eq!(resolve_socket(None, None), None);
    }
}
