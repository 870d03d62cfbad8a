use crate::events::{Event, EventBus};
use attire_asyncutils::Throttle;
use attire_config::{SpeedUnit, TransferSettings};
use tokio::sync::watch;

/// Bytes per second each active download may use: the configured total
/// divided evenly between `in_use` downloads. Zero means unlimited.
///
/// A negative total can only come from a broken configuration; it's logged
/// and treated as unlimited.
pub fn budget_per_slot(limit: i64, unit: SpeedUnit, in_use: usize) -> u64 {
    if limit == 0 {
        return 0;
    }
    let total = limit.saturating_mul(unit.bytes());
    let Ok(total) = u64::try_from(total) else {
        tracing::warn!(limit, ?unit, "Negative bandwidth limit; downloads are unlimited");
        return 0;
    };
    let slots = u64::try_from(in_use.max(1)).unwrap_or(u64::MAX);
    // Never round a real limit down to "unlimited".
    (total / slots).max(1)
}

/// Keeps the throttle shared by every active download in step with slot
/// occupancy and configuration.
pub(crate) struct Bandwidth {
    throttle: Throttle,
    settings: watch::Receiver<TransferSettings>,
    events: EventBus,
}

impl Bandwidth {
    pub(crate) fn new(settings: watch::Receiver<TransferSettings>, events: EventBus) -> Self {
        let bandwidth = Self { throttle: Throttle::unlimited(), settings, events };
        bandwidth.recompute(0);
        bandwidth
    }

    pub(crate) fn throttle(&self) -> Throttle {
        self.throttle.clone()
    }

    pub(crate) fn budget(&self, in_use: usize) -> u64 {
        let settings = self.settings.borrow();
        budget_per_slot(settings.speed_limit, settings.speed_unit, in_use)
    }

    pub(crate) fn recompute(&self, in_use: usize) {
        let budget = self.budget(in_use);
        if self.throttle.get() == budget {
            return;
        }
        self.throttle.set(budget);
        tracing::debug!(bytes_per_second = budget, in_use, "Download bandwidth share changed");
        self.events.publish(Event::BandwidthChanged { bytes_per_second: budget });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unlimited(0, SpeedUnit::Mebibytes, 3, 0)]
    #[case::single(1000, SpeedUnit::Bytes, 1, 1000)]
    #[case::idle_counts_as_one(1000, SpeedUnit::Bytes, 0, 1000)]
    #[case::divided(1000, SpeedUnit::Bytes, 4, 250)]
    #[case::kibibytes(2, SpeedUnit::Kibibytes, 2, 1024)]
    #[case::mebibytes(1, SpeedUnit::Mebibytes, 1, 1_048_576)]
    #[case::tiny_share(3, SpeedUnit::Bytes, 10, 1)]
    #[case::negative(-100, SpeedUnit::Bytes, 1, 0)]
    #[case::saturating(i64::MAX, SpeedUnit::Mebibytes, 1, i64::MAX as u64)]
    fn test_budget_per_slot(#[case] limit: i64, #[case] unit: SpeedUnit, #[case] in_use: usize, #[case] expected: u64) {
        assert_eq!(budget_per_slot(limit, unit, in_use), expected);
    }

    #[test]
    fn test_release_raises_share() {
        let settings = TransferSettings { speed_limit: 1200, ..TransferSettings::default() };
        let (_sender, receiver) = watch::channel(settings);
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let bandwidth = Bandwidth::new(receiver, events);
        let throttle = bandwidth.throttle();

        bandwidth.recompute(3);
        assert_eq!(throttle.get(), 400);
        bandwidth.recompute(2);
        assert_eq!(throttle.get(), 600);
        bandwidth.recompute(2);

        let published: Vec<_> = std::iter::from_fn(|| subscriber.try_recv().ok()).collect();
        assert_eq!(
            published,
            vec![
                Event::BandwidthChanged { bytes_per_second: 1200 },
                Event::BandwidthChanged { bytes_per_second: 400 },
                Event::BandwidthChanged { bytes_per_second: 600 },
            ]
        );
    }

    #[test]
    fn test_follows_configuration() {
        let (sender, receiver) = watch::channel(TransferSettings::default());
        let bandwidth = Bandwidth::new(receiver, EventBus::default());
        assert_eq!(bandwidth.throttle().get(), 0);
        sender.send_modify(|settings| {
            settings.speed_limit = 1;
            settings.speed_unit = SpeedUnit::Kibibytes;
        });
        bandwidth.recompute(1);
        assert_eq!(bandwidth.throttle().get(), 1024);
    }
}
