use crate::{
    driver::{
        dave::{MediaSecurityOverlay, Passthrough},
        CryptoMode,
    },
    input::Transcoder,
};
use std::{fmt, sync::Arc, time::Duration};

/// Builds a fresh overlay instance for each connection attempt.
pub type OverlayFactory = Arc<dyn Fn() -> Box<dyn MediaSecurityOverlay> + Send + Sync>;

/// Configuration for drivers and calls.
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// Preferred tagging mode for voice packet encryption.
    ///
    /// Defaults to [`CryptoMode::Aes256Gcm`]. Negotiation may fall back to
    /// another offered mode, and the server's session description always has
    /// the final say.
    ///
    /// [`CryptoMode::Aes256Gcm`]: CryptoMode::Aes256Gcm
    pub crypto_mode: CryptoMode,
    /// Time to wait for the main gateway to reply with connection information
    /// after a join request.
    ///
    /// Defaults to 10 seconds. If set to `None`, joins will never time out.
    pub gateway_timeout: Option<Duration>,
    /// Maximum time for an attempted voice connection, from websocket dial
    /// through key delivery.
    ///
    /// Defaults to 10 seconds. If set to `None`, connections will never time
    /// out.
    pub driver_timeout: Option<Duration>,
    /// Number of consecutive reconnect failures tolerated before the session
    /// is closed.
    ///
    /// Defaults to 5.
    pub retry_limit: u8,
    /// Name and argument shape of the external transcoder.
    pub transcoder: Transcoder,
    /// Factory for the E2EE media overlay attached to each connection.
    ///
    /// Defaults to the protocol-version-0 [`Passthrough`] stub.
    pub overlay: OverlayFactory,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("crypto_mode", &self.crypto_mode)
            .field("gateway_timeout", &self.gateway_timeout)
            .field("driver_timeout", &self.driver_timeout)
            .field("retry_limit", &self.retry_limit)
            .field("transcoder", &self.transcoder)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crypto_mode: CryptoMode::Aes256Gcm,
            gateway_timeout: Some(Duration::from_secs(10)),
            driver_timeout: Some(Duration::from_secs(10)),
            retry_limit: 5,
            transcoder: Transcoder::default(),
            overlay: Arc::new(|| Box::<Passthrough>::default() as Box<dyn MediaSecurityOverlay>),
        }
    }
}

impl Config {
    /// Sets this `Config`'s preferred cryptographic tagging scheme.
    #[must_use]
    pub fn crypto_mode(mut self, crypto_mode: CryptoMode) -> Self {
        self.crypto_mode = crypto_mode;
        self
    }

    /// Sets this `Config`'s timeout for joining a voice channel.
    #[must_use]
    pub fn gateway_timeout(mut self, gateway_timeout: Option<Duration>) -> Self {
        self.gateway_timeout = gateway_timeout;
        self
    }

    /// Sets this `Config`'s timeout for establishing a voice connection.
    #[must_use]
    pub fn driver_timeout(mut self, driver_timeout: Option<Duration>) -> Self {
        self.driver_timeout = driver_timeout;
        self
    }

    /// Sets this `Config`'s tolerance for consecutive reconnect failures.
    #[must_use]
    pub fn retry_limit(mut self, retry_limit: u8) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets this `Config`'s transcoder shape.
    #[must_use]
    pub fn transcoder(mut self, transcoder: Transcoder) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Sets this `Config`'s overlay factory.
    #[must_use]
    pub fn overlay(mut self, overlay: OverlayFactory) -> Self {
        self.overlay = overlay;
        self
    }
}
