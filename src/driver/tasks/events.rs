use super::message::{EventMessage, Interconnect};
use crate::{
    events::VoiceEvent,
    id::UserId,
};
use flume::{Receiver, Sender};
use tracing::{instrument, trace};

struct Subscriber {
    tx: Sender<VoiceEvent>,
    user_filter: Option<UserId>,
}

impl Subscriber {
    fn wants(&self, event: &VoiceEvent) -> bool {
        match self.user_filter {
            None => true,
            Some(user) => matches!(
                event,
                VoiceEvent::Speaking(update) if update.user_id == Some(user)
            ),
        }
    }
}

#[instrument(skip(_interconnect, evt_rx))]
pub(crate) async fn runner(_interconnect: Interconnect, evt_rx: Receiver<EventMessage>) {
    let mut subscribers: Vec<Subscriber> = Vec::new();

    while let Ok(msg) = evt_rx.recv_async().await {
        match msg {
            EventMessage::Fire(event) => {
                subscribers.retain(|sub| {
                    if sub.wants(&event) {
                        sub.tx.send(event.clone()).is_ok()
                    } else {
                        !sub.tx.is_disconnected()
                    }
                });
            },
            EventMessage::Subscribe(tx, user_filter) => {
                subscribers.push(Subscriber { tx, user_filter });
            },
            EventMessage::Poison => break,
        }
    }

    trace!("Event processor exited.");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::SpeakingUpdate;
    use crate::model::SpeakingState;

    fn interconnect() -> (Interconnect, flume::Receiver<EventMessage>) {
        let (evt_tx, evt_rx) = flume::unbounded();
        let ic = Interconnect {
            core: flume::unbounded().0,
            events: evt_tx,
            pipeline: flume::unbounded().0,
        };
        (ic, evt_rx)
    }

    fn speaking(user: u64, ssrc: u32) -> VoiceEvent {
        VoiceEvent::Speaking(SpeakingUpdate {
            user_id: Some(UserId::from(user)),
            ssrc,
            speaking: SpeakingState::MICROPHONE,
        })
    }

    #[tokio::test]
    async fn user_filters_narrow_delivery() {
        let (ic, evt_rx) = interconnect();
        tokio::spawn(runner(ic.clone(), evt_rx));

        let (all_tx, all_rx) = flume::unbounded();
        let (one_tx, one_rx) = flume::unbounded();
        ic.events
            .send(EventMessage::Subscribe(all_tx, None))
            .unwrap();
        ic.events
            .send(EventMessage::Subscribe(one_tx, Some(UserId::from(2))))
            .unwrap();

        ic.events
            .send(EventMessage::Fire(speaking(1, 100)))
            .unwrap();
        ic.events
            .send(EventMessage::Fire(speaking(2, 200)))
            .unwrap();
        ic.events.send(EventMessage::Fire(VoiceEvent::Resumed)).unwrap();

        // The unfiltered stream sees everything, in order.
        assert!(matches!(
            all_rx.recv_async().await.unwrap(),
            VoiceEvent::Speaking(s) if s.ssrc == 100
        ));
        assert!(matches!(
            all_rx.recv_async().await.unwrap(),
            VoiceEvent::Speaking(s) if s.ssrc == 200
        ));
        assert!(matches!(
            all_rx.recv_async().await.unwrap(),
            VoiceEvent::Resumed
        ));

        // The filtered stream sees only its user's speaking updates.
        assert!(matches!(
            one_rx.recv_async().await.unwrap(),
            VoiceEvent::Speaking(s) if s.ssrc == 200
        ));
        assert!(one_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscribers_are_dropped() {
        let (ic, evt_rx) = interconnect();
        tokio::spawn(runner(ic.clone(), evt_rx));

        let (tx, rx) = flume::unbounded();
        ic.events.send(EventMessage::Subscribe(tx, None)).unwrap();
        drop(rx);

        // Firing into a dead subscriber must simply prune it.
        ic.events.send(EventMessage::Fire(VoiceEvent::Resumed)).unwrap();
        ic.events.send(EventMessage::Poison).unwrap();
    }
}
