//! A detached [`StreamHandle`] for testing modules without a transport.

use jid::FullJid;
use minidom::Element;
use tokio::sync::mpsc;

use super::handle::{StreamCommand, StreamHandle};
use crate::stream_error::StreamError;

/// Collects what modules write through its [`StreamHandle`].
pub struct MockStream {
    handle: StreamHandle,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    disconnected: Option<StreamError>,
}

impl MockStream {
    /// A stream serving `domain`, already bound to `jid` if given.
    pub fn new<S: Into<String>>(domain: S, jid: Option<FullJid>) -> Self {
        let (handle, commands) = StreamHandle::new(domain.into(), jid);
        MockStream {
            handle,
            commands,
            disconnected: None,
        }
    }

    /// A handle writing to this stream.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Wait for the next element written. `None` once the stream was
    /// disconnected; nothing written afterwards is returned.
    pub async fn fetch_element(&mut self) -> Option<Element> {
        if self.disconnected.is_some() {
            return None;
        }
        match self.commands.recv().await? {
            StreamCommand::Send(elem) => Some(elem),
            StreamCommand::Disconnect(reason) => {
                self.disconnected = Some(reason);
                None
            }
        }
    }

    /// The next element written, without waiting.
    pub fn try_fetch_element(&mut self) -> Option<Element> {
        if self.disconnected.is_some() {
            return None;
        }
        match self.commands.try_recv().ok()? {
            StreamCommand::Send(elem) => Some(elem),
            StreamCommand::Disconnect(reason) => {
                self.disconnected = Some(reason);
                None
            }
        }
    }

    /// Wait until a module disconnects the stream and return the reason.
    ///
    /// Elements written in the meantime are discarded.
    pub async fn wait_disconnection(&mut self) -> Option<StreamError> {
        while self.disconnected.is_none() {
            match self.commands.recv().await? {
                StreamCommand::Send(elem) => {
                    log::trace!("discarding {:?} while waiting for disconnection", elem);
                }
                StreamCommand::Disconnect(reason) => self.disconnected = Some(reason),
            }
        }
        self.disconnected
    }

    /// The reason the stream was disconnected with, if it was.
    pub fn disconnection(&self) -> Option<StreamError> {
        self.disconnected
    }
}
