//! Interfaces to the two inbound channels, the sensor controller's serial
//! line and the social message stream.

pub(crate) mod serial;
pub(crate) mod social;

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub(crate) enum TransportError {
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serial IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line oriented link to the sensor controller.
///
/// Neither method may block waiting for the controller to send something.
pub(crate) trait TelemetryTransport: Send {
    /// Whether there is anything to read right now.
    fn data_available(&mut self) -> Result<bool, TransportError>;

    /// Returns the next complete line, or `None` if only part of one has arrived.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// One post from the social stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundMessage {
    /// Platform identifier of the post, used to thread replies.
    pub(crate) id: String,
    pub(crate) sender: String,
    pub(crate) text: String,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Message stream closed by server")]
    Closed,
}

/// Live stream of posts matching the configured search term.
///
/// Implementations reconnect on the next call after returning an error.
#[async_trait]
pub(crate) trait MessageSource: Send {
    async fn next_message(&mut self) -> Result<InboundMessage, SourceError>;
}
