//! In-process stream source.

use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::{anyhow, Result};

use super::{SourceEvent, StreamInfo, StreamSource};

/// Source fed through a `FeedHandle`.
pub struct ChannelSource {
    label: String,
    rx: Option<Receiver<SourceEvent>>,
    closed: bool,
}

/// Producer side of a `ChannelSource`. Cloneable; all clones feed the same source.
#[derive(Clone)]
pub struct FeedHandle {
    tx: Sender<SourceEvent>,
}

impl ChannelSource {
    pub fn new(label: &str) -> (Self, FeedHandle) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                label: label.to_string(),
                rx: Some(rx),
                closed: false,
            },
            FeedHandle { tx },
        )
    }
}

impl StreamSource for ChannelSource {
    fn describe(&self) -> StreamInfo {
        StreamInfo {
            kind: "channel".to_string(),
            url: None,
        }
    }

    fn open(&mut self) -> Result<Receiver<SourceEvent>> {
        if self.closed {
            return Err(anyhow!("channel source '{}' already closed", self.label));
        }
        self.rx
            .take()
            .ok_or_else(|| anyhow!("channel source '{}' already opened", self.label))
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx = None;
    }
}

impl FeedHandle {
    /// Push one chunk. Returns false once the source side is gone.
    pub fn push(&self, chunk: impl Into<Vec<u8>>) -> bool {
        self.tx.send(SourceEvent::Data(chunk.into())).is_ok()
    }

    /// Report that the producer failed.
    pub fn fail(&self, message: &str) -> bool {
        self.tx
            .send(SourceEvent::ExitWithError(message.to_string()))
            .is_ok()
    }

    /// Report a clean end of stream.
    pub fn finish(&self) -> bool {
        self.tx.send(SourceEvent::Closed).is_ok()
    }
}
