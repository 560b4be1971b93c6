use anyhow::Result;

/// Resolves with the name of the first termination signal delivered to the process.
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = hup.recv() => "SIGHUP",
        };
        Ok(name)
    }

    #[cfg(windows)]
    {
        use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_shutdown};

        let mut c = ctrl_c()?;
        let mut brk = ctrl_break()?;
        let mut close = ctrl_close()?;
        let mut sd = ctrl_shutdown()?;
        let name = tokio::select! {
            _ = c.recv() => "CTRL_C",
            _ = brk.recv() => "CTRL_BREAK",
            _ = close.recv() => "CTRL_CLOSE",
            _ = sd.recv() => "CTRL_SHUTDOWN",
        };
        Ok(name)
    }

    #[cfg(not(any(unix, windows)))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("CTRL_C")
    }
}
