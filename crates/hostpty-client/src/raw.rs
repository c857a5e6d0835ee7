use std::io;

/// Keeps the local terminal in raw mode until dropped.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        restore();
    }
}

/// Put the local terminal back into cooked mode.
pub fn restore() {
    if let Err(err) = crossterm::terminal::disable_raw_mode() {
        log::warn!("restore terminal failed: {err}");
    }
}
