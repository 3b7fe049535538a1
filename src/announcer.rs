use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::identity::LocalIdentityProvider;
use crate::packet::PacketDto;
use crate::packet_sender::PacketSender;
use crate::shutdown::ShutdownSignal;

/// Periodically broadcasts the local node's identity so that other nodes can discover it and
///  pick up changes to it. Announcements are unreliable: a lost announcement is superseded by
///  the next one.
pub struct Announcer {
    identity: Arc<dyn LocalIdentityProvider>,
    sender: PacketSender,
    interval: Option<Duration>,
    shutdown: ShutdownSignal,
}

impl Announcer {
    pub fn new(identity: Arc<dyn LocalIdentityProvider>, sender: PacketSender, interval: Option<Duration>, shutdown: ShutdownSignal) -> Announcer {
        Announcer {
            identity,
            sender,
            interval,
            shutdown,
        }
    }

    /// Broadcast the current local identity once
    pub async fn announce_once(&self) -> anyhow::Result<()> {
        let packet = PacketDto::announcement(self.identity.local_identity());
        trace!("announcing {:?}", packet);
        self.sender.send(&packet).await
    }

    /// Announce until shutdown. Send errors are logged, and do not terminate the loop.
    pub async fn run(self) {
        info!("starting announce loop, interval {:?}", self.interval);
        let mut stop_signal = self.shutdown.clone();

        loop {
            select! {
                biased;
                _ = stop_signal.cancelled() => break,
                r = self.announce_once() => {
                    if let Err(e) = r {
                        warn!("error announcing local identity: {}", e);
                    }
                }
            }

            match self.interval {
                Some(interval) => {
                    select! {
                        _ = stop_signal.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }

        debug!("announce loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;
    use crate::acknowledgement::AcknowledgementCoordinator;
    use crate::config::CourierConfig;
    use crate::identity::{Identity, LocalIdentity};
    use crate::packet::PacketBody;
    use crate::shutdown::ShutdownToken;
    use crate::stats::TransportStats;
    use crate::transport::MockDatagramBroadcaster;
    use super::*;

    fn announcer(broadcaster: MockDatagramBroadcaster, identity: Arc<LocalIdentity>, interval: Option<Duration>, shutdown: &ShutdownToken) -> Announcer {
        let sender = PacketSender::new(
            Arc::new(CourierConfig::default_ipv4()),
            Arc::new(broadcaster),
            AcknowledgementCoordinator::new(),
            shutdown.subscribe(),
            Arc::new(TransportStats::new()),
        );
        Announcer::new(identity, sender, interval, shutdown.subscribe())
    }

    #[tokio::test]
    async fn test_announce_once_sends_current_identity() {
        let identity = Arc::new(LocalIdentity::random("announced"));
        identity.set_attribute("role", "worker");
        let expected: Identity = identity.local_identity();

        let mut broadcaster = MockDatagramBroadcaster::new();
        broadcaster.expect_broadcast()
            .once()
            .returning(move |datagram| {
                let packet = PacketDto::deser(datagram).unwrap();
                assert_eq!(packet.sender_id, expected.id);
                assert_eq!(packet.receiver_id, None);
                assert!(!packet.is_reliable());
                assert_eq!(packet.body, PacketBody::Announcement(crate::packet::AnnouncementDto { identity: expected.clone() }));
                Ok(())
            });

        let shutdown = ShutdownToken::new();
        announcer(broadcaster, identity, None, &shutdown).announce_once().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_announces_per_interval_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_mock = count.clone();
        let mut broadcaster = MockDatagramBroadcaster::new();
        broadcaster.expect_broadcast()
            .returning(move |_| {
                count_in_mock.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let shutdown = ShutdownToken::new();
        let announcer = announcer(broadcaster, Arc::new(LocalIdentity::random("a")), Some(Duration::from_secs(1)), &shutdown);
        let handle = tokio::spawn(announcer.run());

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        shutdown.signal_stop();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_send_errors() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_mock = count.clone();
        let mut broadcaster = MockDatagramBroadcaster::new();
        broadcaster.expect_broadcast()
            .returning(move |_| {
                count_in_mock.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("network is unreachable"))
            });

        let shutdown = ShutdownToken::new();
        let announcer = announcer(broadcaster, Arc::new(LocalIdentity::random("a")), Some(Duration::from_secs(1)), &shutdown);
        let handle = tokio::spawn(announcer.run());

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        shutdown.signal_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_without_interval_stops_on_shutdown() {
        let mut broadcaster = MockDatagramBroadcaster::new();
        broadcaster.expect_broadcast()
            .returning(|_| Ok(()));

        let shutdown = ShutdownToken::new();
        let announcer = announcer(broadcaster, Arc::new(LocalIdentity::random("a")), None, &shutdown);
        let handle = tokio::spawn(announcer.run());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        shutdown.signal_stop();
        time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_identity_changes_are_picked_up() {
        let identity = Arc::new(LocalIdentity::random("before"));
        let id = identity.id();

        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let names_in_mock = names.clone();
        let mut broadcaster = MockDatagramBroadcaster::new();
        broadcaster.expect_broadcast()
            .times(2)
            .returning(move |datagram| {
                if let PacketBody::Announcement(a) = PacketDto::deser(datagram).unwrap().body {
                    names_in_mock.lock().unwrap().push((a.identity.name, a.identity.revision));
                }
                Ok(())
            });

        let shutdown = ShutdownToken::new();
        let announcer = announcer(broadcaster, identity.clone(), None, &shutdown);
        announcer.announce_once().await.unwrap();
        identity.set_name("after");
        announcer.announce_once().await.unwrap();

        let names = names.lock().unwrap();
        assert_eq!(names[0].0, "before");
        assert_eq!(names[1].0, "after");
        assert_eq!(names[1].1, names[0].1.wrapping_add(1));
        assert_eq!(identity.id(), id);
    }
}
