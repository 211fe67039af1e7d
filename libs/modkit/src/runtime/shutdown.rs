//! OS signal waiting for the runner.

/// Resolve once the process is asked to stop. Returns the signal name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
        };
        Ok(name)
    }

    #[cfg(windows)]
    {
        use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_shutdown};
        let mut c = ctrl_c()?;
        let mut br = ctrl_break()?;
        let mut cl = ctrl_close()?;
        let mut sh = ctrl_shutdown()?;
        let name = tokio::select! {
            _ = c.recv() => "CTRL_C",
            _ = br.recv() => "CTRL_BREAK",
            _ = cl.recv() => "CTRL_CLOSE",
            _ = sh.recv() => "CTRL_SHUTDOWN",
        };
        Ok(name)
    }
}
