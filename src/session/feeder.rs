//! The MDI queue (spec §4.4): one-off commands interleaved with job
//! streaming. Disjoint in time from the Sender — the Feeder only drains
//! while the Workflow is not Running.

use std::collections::VecDeque;

/// One queued command line, optionally tagged with a caller-defined scope
/// (e.g. which client or macro submitted it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedItem {
    pub text: String,
    pub context: Option<String>,
}

impl FeedItem {
    pub fn new(text: impl Into<String>) -> Self {
        FeedItem {
            text: text.into(),
            context: None,
        }
    }

    pub fn with_context(text: impl Into<String>, context: impl Into<String>) -> Self {
        FeedItem {
            text: text.into(),
            context: Some(context.into()),
        }
    }
}

/// FIFO of [`FeedItem`]s, drained one at a time with an ack round-trip
/// between each dispatch.
#[derive(Default)]
pub struct Feeder {
    queue: VecDeque<FeedItem>,
    awaiting_ack: bool,
}

impl Feeder {
    pub fn new() -> Self {
        Feeder::default()
    }

    pub fn feed(&mut self, items: impl IntoIterator<Item = FeedItem>) {
        self.queue.extend(items);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Dispatch the head item iff the workflow is not Running and no prior
    /// feeder line is still awaiting its ack.
    pub fn next(&mut self, workflow_running: bool) -> Option<FeedItem> {
        if workflow_running || self.awaiting_ack {
            return None;
        }
        let item = self.queue.front().cloned();
        if item.is_some() {
            self.awaiting_ack = true;
        }
        item
    }

    /// Pop the head item, freeing the Feeder to dispatch the next one.
    pub fn ack(&mut self) -> Option<FeedItem> {
        self.awaiting_ack = false;
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_while_not_running_and_not_awaiting_ack() {
        let mut f = Feeder::new();
        f.feed([FeedItem::new("M3 S1000"), FeedItem::new("M5")]);

        assert_eq!(f.next(true), None); // workflow running, feeder parked

        let first = f.next(false).unwrap();
        assert_eq!(first.text, "M3 S1000");
        assert_eq!(f.next(false), None); // already awaiting ack

        assert_eq!(f.ack().unwrap().text, "M3 S1000");
        let second = f.next(false).unwrap();
        assert_eq!(second.text, "M5");
    }

    #[test]
    fn context_is_preserved() {
        let mut f = Feeder::new();
        f.feed([FeedItem::with_context("G10 L20 P1 X0", "client-7")]);
        let item = f.next(false).unwrap();
        assert_eq!(item.context.as_deref(), Some("client-7"));
    }

    #[test]
    fn empty_feeder_yields_nothing() {
        let mut f = Feeder::new();
        assert!(f.is_empty());
        assert_eq!(f.next(false), None);
    }
}
