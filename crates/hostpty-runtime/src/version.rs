/// One-line build description printed by `--version`.
///
/// The git commit is taken from `HOSTPTY_GIT_COMMIT` at build time when the
/// release pipeline sets it.
pub fn info(binary: &str) -> String {
    let commit = option_env!("HOSTPTY_GIT_COMMIT").unwrap_or("unknown");
    format!(
        "{binary} {} (commit {commit}, {}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_names_binary_and_version() {
        let line = info("pty-client");
        assert!(line.starts_with("pty-client "));
        assert!(line.contains(env!("CARGO_PKG_VERSION")));
        assert!(line.contains(std::env::consts::ARCH));
    }
}
