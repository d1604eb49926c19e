/// Signal bridge: SIGINT (Ctrl-C) and SIGTERM fire the same token a service
/// exit does, so an operator interrupt ends the session the same way.
use crate::token::CancelToken;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

/// Install handlers for SIGINT and SIGTERM and forward the first one
/// received to `token`. The task ends early if the token fires for any
/// other reason.
///
/// Handlers are registered before this returns, so a signal raised right
/// after the call is not lost.
pub fn install(token: CancelToken) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = recv(&mut interrupt) => "SIGINT",
            _ = recv(&mut terminate) => "SIGTERM",
            _ = token.cancelled() => return,
        };
        tracing::info!(signal = name, "received signal");
        token.trigger(&format!("received {name}"));
    }))
}

async fn recv(stream: &mut Signal) {
    if stream.recv().await.is_none() {
        // The driver is gone; never report a signal that did not arrive.
        std::future::pending::<()>().await;
    }
}
