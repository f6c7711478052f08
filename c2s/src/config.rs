use core::time::Duration;

use tokio_rustls::TlsAcceptor;

/// Compression level used once XEP-0138 compression has been negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Let zlib pick its default trade-off.
    #[default]
    Default,
    /// Favour speed over ratio.
    Fast,
    /// Favour ratio over speed.
    Best,
    /// Store only; still framed as a zlib stream.
    NoCompression,
}

impl From<CompressionLevel> for flate2::Compression {
    fn from(level: CompressionLevel) -> flate2::Compression {
        match level {
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Best => flate2::Compression::best(),
            CompressionLevel::NoCompression => flate2::Compression::none(),
        }
    }
}

/// Configuration shared by all client streams of one listener.
#[derive(Clone)]
pub struct StreamConfig {
    /// The domain served by this listener. Stream headers addressed to
    /// another domain are refused with `host-unknown`.
    pub domain: String,

    /// Ceiling on the size in bytes of any single incoming element.
    pub max_stanza_size: usize,

    /// TLS acceptor used for STARTTLS. STARTTLS is not offered without one.
    pub tls: Option<TlsAcceptor>,

    /// Refuse to authenticate clients before they negotiated TLS.
    pub tls_required: bool,

    /// Offer zlib compression after authentication, at the given level.
    pub compression: Option<CompressionLevel>,

    /// Time the client has to get from the TCP connection to a bound
    /// resource.
    pub negotiation_timeout: Duration,
}

impl StreamConfig {
    /// Configuration for `domain` with defaults for everything else: no TLS,
    /// no compression, a 32 KiB element ceiling and a ten second negotiation
    /// timeout.
    pub fn new<S: Into<String>>(domain: S) -> Self {
        Self {
            domain: domain.into(),
            max_stanza_size: 32 * 1024,
            tls: None,
            tls_required: false,
            compression: None,
            negotiation_timeout: Duration::from_secs(10),
        }
    }

    /// Offer STARTTLS with the given acceptor, optionally making it
    /// mandatory before authentication.
    pub fn with_tls(mut self, acceptor: TlsAcceptor, required: bool) -> Self {
        self.tls = Some(acceptor);
        self.tls_required = required;
        self
    }

    /// Offer stream compression.
    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.compression = Some(level);
        self
    }

    /// Change the element size ceiling.
    pub fn with_max_stanza_size(mut self, max_stanza_size: usize) -> Self {
        self.max_stanza_size = max_stanza_size;
        self
    }

    /// Change the negotiation timeout.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

/// Configuration of the XEP-0199 ping module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingConfig {
    /// Whether to probe the client with pings. Incoming pings are answered
    /// regardless.
    pub send: bool,

    /// Interval between two probes.
    pub send_interval: Duration,
}

impl PingConfig {
    /// Time the client has to answer a probe before the stream is closed with
    /// `connection-timeout`.
    pub fn pong_timeout(&self) -> Duration {
        self.send_interval / 3
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            send: false,
            send_interval: Duration::from_secs(60),
        }
    }
}
