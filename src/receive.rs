//! Consumer-facing handles for inbound audio.
//!
//! Each remote stream is decoded by its own transcoder child; the resulting
//! PCM frames are fanned out to every attached [`ReceiveStream`]. What a
//! consumer does with them (playback, transcription, persistence) is their
//! own concern.

use crate::id::UserId;
use bytes::Bytes;
use parking_lot::Mutex;

/// One 20 ms frame of decoded audio from a remote user.
#[derive(Clone, Debug)]
pub struct PcmFrame {
    /// RTP stream the frame arrived on.
    pub ssrc: u32,
    /// The speaking user, where the SSRC has been mapped.
    pub user_id: Option<UserId>,
    /// Raw s16-LE 48 kHz stereo PCM.
    pub pcm: Bytes,
}

/// Fan-out point between decoder children and attached streams.
#[derive(Debug, Default)]
pub(crate) struct StreamHub {
    senders: Mutex<Vec<flume::Sender<PcmFrame>>>,
}

impl StreamHub {
    pub(crate) fn attach(&self) -> ReceiveStream {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        ReceiveStream { rx }
    }

    pub(crate) fn push(&self, frame: &PcmFrame) {
        self.senders
            .lock()
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.senders.lock().is_empty()
    }
}

/// A live stream of decoded audio frames from every user in the channel.
///
/// Dropping (or [`close`]-ing) the stream detaches it; the session keeps
/// running.
///
/// [`close`]: Self::close
pub struct ReceiveStream {
    rx: flume::Receiver<PcmFrame>,
}

impl ReceiveStream {
    /// Receives the next frame from any user.
    ///
    /// Returns `None` once the session has closed and the buffer drained.
    pub async fn recv(&self) -> Option<PcmFrame> {
        self.rx.recv_async().await.ok()
    }

    /// Receives the next frame attributed to `user_id`, discarding others.
    pub async fn recv_from(&self, user_id: UserId) -> Option<PcmFrame> {
        loop {
            let frame = self.recv().await?;
            if frame.user_id == Some(user_id) {
                return Some(frame);
            }
        }
    }

    /// Receives a frame if one is already buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<PcmFrame> {
        self.rx.try_recv().ok()
    }

    /// Detaches this stream from the session.
    pub fn close(self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn frames_fan_out_to_attached_streams() {
        let hub = StreamHub::default();
        let a = hub.attach();
        let b = hub.attach();

        hub.push(&PcmFrame {
            ssrc: 7,
            user_id: Some(UserId::from(1)),
            pcm: Bytes::from_static(&[0, 1]),
        });

        assert_eq!(a.recv().await.unwrap().ssrc, 7);
        assert_eq!(b.recv().await.unwrap().ssrc, 7);
    }

    #[tokio::test]
    async fn user_filter_discards_other_frames() {
        let hub = StreamHub::default();
        let stream = hub.attach();

        for (ssrc, user) in [(1u32, 10u64), (2, 20), (3, 10)] {
            hub.push(&PcmFrame {
                ssrc,
                user_id: Some(UserId::from(user)),
                pcm: Bytes::new(),
            });
        }

        let frame = stream.recv_from(UserId::from(20)).await.unwrap();
        assert_eq!(frame.ssrc, 2);
    }

    #[test]
    fn closed_streams_are_pruned() {
        let hub = StreamHub::default();
        let stream = hub.attach();
        assert!(hub.has_listeners());

        stream.close();
        hub.push(&PcmFrame {
            ssrc: 1,
            user_id: None,
            pcm: Bytes::new(),
        });
        assert!(!hub.has_listeners());
    }
}
