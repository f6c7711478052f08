use std::sync::{Arc, Mutex};

use jid::FullJid;
use minidom::Element;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::stream_error::StreamError;

/// Requests queued for the task running a [`Stream`][`super::Stream`].
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// Write the element, in queue order.
    Send(Element),
    /// Terminate the stream with the condition.
    Disconnect(StreamError),
}

struct Info {
    domain: String,
    jid: Mutex<Option<FullJid>>,
}

/// Cloneable handle to a running [`Stream`][`super::Stream`].
///
/// Everything written through a handle is queued and written by the stream
/// task in the order it was queued, interleaved with the stream's own
/// replies.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<StreamCommand>,
    info: Arc<Info>,
}

impl StreamHandle {
    pub(crate) fn new(
        domain: String,
        jid: Option<FullJid>,
    ) -> (StreamHandle, mpsc::UnboundedReceiver<StreamCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = StreamHandle {
            tx,
            info: Arc::new(Info {
                domain,
                jid: Mutex::new(jid),
            }),
        };
        (handle, rx)
    }

    /// Queue `elem` for writing.
    ///
    /// Fails with [`Error::Disconnected`] if the stream is gone.
    pub fn send_element(&self, elem: Element) -> Result<(), Error> {
        self.tx
            .send(StreamCommand::Send(elem))
            .map_err(|_| Error::Disconnected)
    }

    /// Terminate the stream with `reason`.
    ///
    /// Elements queued before are still written. Has no effect on a stream
    /// which is already gone.
    pub fn disconnect(&self, reason: StreamError) {
        if self.tx.send(StreamCommand::Disconnect(reason)).is_err() {
            log::trace!("disconnect({}) on a closed stream", reason);
        }
    }

    /// The domain served by the stream.
    pub fn domain(&self) -> &str {
        &self.info.domain
    }

    /// The JID bound to the stream, once resource binding completed.
    pub fn jid(&self) -> Option<FullJid> {
        match self.info.jid.lock() {
            Ok(jid) => jid.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the stream is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn set_jid(&self, jid: FullJid) {
        match self.info.jid.lock() {
            Ok(mut slot) => *slot = Some(jid),
            Err(poisoned) => *poisoned.into_inner() = Some(jid),
        }
    }
}
