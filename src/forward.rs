//! Local TCP forwards: every socket accepted on `listen` is dialed through to
//! the agent registered as `key`.

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ForwardConfig;
use crate::manager::ConnectionManager;

/// Bind `forward.listen` and serve it until `cancel` fires.
pub async fn bind(
    manager: ConnectionManager,
    forward: ForwardConfig,
    cancel: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(&forward.listen).await?;
    info!(
        listen = %forward.listen,
        key = %forward.key,
        "Forwarding local port to agent"
    );
    let span = info_span!("revdial_forward", key = %forward.key);
    Ok(tokio::spawn(
        serve(listener, manager, forward.key, cancel).instrument(span),
    ))
}

/// Accept loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    manager: ConnectionManager,
    key: String,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
            () = cancel.cancelled() => break,
        };
        debug!(peer = %peer, "Forward connection accepted");
        let manager = manager.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { forward_one(socket, &manager, &key, &cancel).await }
                .instrument(info_span!("forward_conn", peer = %peer)),
        );
    }
}

async fn forward_one(
    mut socket: TcpStream,
    manager: &ConnectionManager,
    key: &str,
    cancel: &CancellationToken,
) {
    let mut conn = match manager.dial_cancellable(key, cancel).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(key, error = %e, retryable = e.is_retryable(), "Dial failed, closing local socket");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut socket, &mut conn).await {
        Ok((up, down)) => debug!(id = conn.id(), up, down, "Forward closed"),
        Err(e) => debug!(id = conn.id(), error = %e, "Forward ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DialerConfig;
    use crate::manager::ManagerConfig;
    use crate::protocol::ControlMessage;
    use crate::stream::Connection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_forward_splices_through_dial() {
        let manager = ConnectionManager::new(ManagerConfig::default(), DialerConfig::default());
        let (_dialer, mut control_rx) = manager.connect("fwd").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(listener, manager.clone(), "fwd".into(), cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let Some(ControlMessage::ConnReady { id }) = control_rx.recv().await else {
            panic!("expected conn-ready");
        };
        let (near, mut agent) = tokio::io::duplex(1024);
        manager
            .deliver("fwd", &id, Connection::from_duplex("fwd", id.clone(), near))
            .unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        agent.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_closes_socket_when_no_agent() {
        let manager = ConnectionManager::new(ManagerConfig::default(), DialerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, manager, "absent".into(), cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        cancel.cancel();
    }
}
