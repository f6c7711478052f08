use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::Authenticator;
use crate::config::StreamConfig;
use crate::module::IqModule;
use crate::stream::{Stream, StreamHandle};
use crate::transport::SocketTransport;

/// Builds the modules of each new stream, in dispatch order.
pub type ModuleFactory = Arc<dyn Fn(&StreamHandle) -> Vec<Box<dyn IqModule>> + Send + Sync>;

/// Accepts client connections and runs one [`Stream`] per connection.
///
/// ```no_run
/// use std::sync::Arc;
/// use xmpp_c2s::auth::PlainAuthenticator;
/// use xmpp_c2s::module::ping::Ping;
/// use xmpp_c2s::{IqModule, PingConfig, Server, StreamConfig, StreamHandle};
///
/// # async fn run() -> std::io::Result<()> {
/// let listener = tokio::net::TcpListener::bind("[::]:5222").await?;
/// let server = Server::new(
///     StreamConfig::new("jackal.im"),
///     Arc::new(PlainAuthenticator::new(|user, password| user == "ortuman" && password == "1234")),
///     Arc::new(|handle: &StreamHandle| {
///         vec![Box::new(Ping::new(PingConfig::default(), handle.clone())) as Box<dyn IqModule>]
///     }),
/// );
/// server.serve(listener).await
/// # }
/// ```
pub struct Server {
    config: Arc<StreamConfig>,
    authenticator: Arc<dyn Authenticator>,
    modules: ModuleFactory,
}

impl Server {
    /// Create a server for the streams described by `config`.
    pub fn new(
        config: StreamConfig,
        authenticator: Arc<dyn Authenticator>,
        modules: ModuleFactory,
    ) -> Self {
        Server {
            config: Arc::new(config),
            authenticator,
            modules,
        }
    }

    /// Accept connections on `listener` until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        log::info!(
            "Serving {} on {}",
            self.config.domain,
            listener.local_addr()?
        );
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            let transport = SocketTransport::new(socket, self.config.max_stanza_size);
            let modules = Arc::clone(&self.modules);
            let stream = Stream::new(
                transport,
                Arc::clone(&self.config),
                Arc::clone(&self.authenticator),
                move |handle| modules(handle),
            );
            tokio::spawn(async move {
                log::debug!("Accepted connection from {}", peer);
                match stream.run().await {
                    Ok(()) => log::debug!("Connection from {} closed", peer),
                    Err(e) => log::info!("Connection from {} terminated: {}", peer, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PlainAuthenticator;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_serve() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(
            StreamConfig::new("jackal.im"),
            Arc::new(PlainAuthenticator::new(|_, _| true).allow_insecure()),
            Arc::new(|_: &StreamHandle| Vec::new()),
        );
        let task = tokio::spawn(async move { server.serve(listener).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"<?xml version='1.0'?><stream:stream to='jackal.im' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>")
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("PLAIN</mechanism>") {
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
        let received = String::from_utf8(received).unwrap();
        assert!(received.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(received.contains("from='jackal.im'"));

        client.write_all(b"</stream:stream>").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(String::from_utf8(rest).unwrap().ends_with("</stream:stream>"));

        task.abort();
    }
}
