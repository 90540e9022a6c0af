use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by each worker flavor. The worker consumes the tick and turns it
/// into `TickerEvents`, this way we decouple the policy from the loop.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Look at the global injector before the local queue on the next pass.
        const POP_GLOBAL_QUEUE = 1;

        /// The dispatcher was shut down, leave the worker loop.
        const SHUTDOWN = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EveryThird;

    impl TickerData for EveryThird {
        type Context = ();

        fn update_and_check(&mut self, _: &(), tick: u32) -> TickerEvents {
            if tick.is_multiple_of(3) {
                TickerEvents::POP_GLOBAL_QUEUE
            } else {
                TickerEvents::empty()
            }
        }
    }

    #[test]
    fn test_ticker_counts_ticks() {
        let mut ticker = Ticker::new();
        let events = (0..6)
            .map(|_| ticker.tick(&(), &mut EveryThird))
            .filter(|e| e.contains(TickerEvents::POP_GLOBAL_QUEUE))
            .count();

        assert_eq!(events, 2);
    }
}
