//! Item sources: where a run pulls its `(item, index)` pairs from.
//!
//! Three origins share one interface. A *bounded* source wraps a sequence
//! of known length; a *streaming* source wraps a channel that is closed by
//! a [`Feed::Stop`] sentinel (or by disconnecting); a *generator* source
//! calls a function until it returns the sentinel.
//!
//! Pulls are serialized by an internal mutex. Indices are handed out in
//! pull order, starting at zero, and never reused. Once the origin reports
//! exhaustion the source remembers it and never touches the origin again.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

/// How often a blocked streaming pull wakes up to check for a halted run.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One unit of work plus the index it was assigned when pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub item: T,
    pub index: usize,
}

/// A value fed into a streaming or generator source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed<T> {
    Item(T),
    /// Reserved sentinel: no more items will follow.
    Stop,
}

impl<T> From<Option<T>> for Feed<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(item) => Self::Item(item),
            None => Self::Stop,
        }
    }
}

enum Origin<'a, T> {
    Bounded {
        items: Box<dyn Iterator<Item = T> + Send + 'a>,
        size: usize,
    },
    Streaming(Receiver<Feed<T>>),
    Generator(Box<dyn FnMut() -> Feed<T> + Send + 'a>),
}

struct Cursor<'a, T> {
    origin: Origin<'a, T>,
    next_index: usize,
    exhausted: bool,
}

/// A synchronized supplier of work items.
pub struct ItemSource<'a, T> {
    cursor: Mutex<Cursor<'a, T>>,
    size: Option<usize>,
}

impl<'a, T: Send + 'a> ItemSource<'a, T> {
    fn from_origin(origin: Origin<'a, T>) -> Self {
        let size = match &origin {
            Origin::Bounded { size, .. } => Some(*size),
            Origin::Streaming(_) | Origin::Generator(_) => None,
        };
        Self {
            cursor: Mutex::new(Cursor {
                origin,
                next_index: 0,
                exhausted: false,
            }),
            size,
        }
    }

    /// A source over a sequence of known length.
    pub fn bounded<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator + Send + 'a,
    {
        let items = items.into_iter();
        let size = items.len();
        Self::from_origin(Origin::Bounded {
            items: Box::new(items),
            size,
        })
    }

    /// A source fed through a channel. Ends at [`Feed::Stop`] or when every
    /// sender has been dropped.
    pub fn streaming(receiver: Receiver<Feed<T>>) -> Self {
        Self::from_origin(Origin::Streaming(receiver))
    }

    /// A source that calls `generate` (under the source lock) until it
    /// returns [`Feed::Stop`].
    pub fn generator<F>(generate: F) -> Self
    where
        F: FnMut() -> Feed<T> + Send + 'a,
    {
        Self::from_origin(Origin::Generator(Box::new(generate)))
    }

    /// Number of items, known only for bounded sources.
    pub fn known_size(&self) -> Option<usize> {
        self.size
    }

    /// Pull the next item, or `None` once the source is exhausted.
    pub fn next(&self) -> Option<WorkItem<T>> {
        self.pull(&|| false)
    }

    /// Pull the next item. A streaming pull that is blocked on an empty
    /// channel gives up (without marking the source exhausted) as soon as
    /// `halted` returns true.
    pub(crate) fn pull(&self, halted: &dyn Fn() -> bool) -> Option<WorkItem<T>> {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cursor.exhausted {
            return None;
        }

        let item = match &mut cursor.origin {
            Origin::Bounded { items, .. } => items.next(),
            Origin::Generator(generate) => match generate() {
                Feed::Item(item) => Some(item),
                Feed::Stop => None,
            },
            Origin::Streaming(receiver) => loop {
                match receiver.recv_timeout(STREAM_POLL_INTERVAL) {
                    Ok(Feed::Item(item)) => break Some(item),
                    Ok(Feed::Stop) | Err(RecvTimeoutError::Disconnected) => break None,
                    Err(RecvTimeoutError::Timeout) => {
                        if halted() {
                            return None;
                        }
                    }
                }
            },
        };

        match item {
            Some(item) => {
                let index = cursor.next_index;
                cursor.next_index += 1;
                Some(WorkItem { item, index })
            }
            None => {
                cursor.exhausted = true;
                None
            }
        }
    }
}

impl<'a, T: Send + 'a> From<Vec<T>> for ItemSource<'a, T> {
    fn from(items: Vec<T>) -> Self {
        Self::bounded(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drain<'a, T: Send + 'a>(source: &ItemSource<'a, T>) -> Vec<WorkItem<T>> {
        std::iter::from_fn(|| source.next()).collect()
    }

    #[test]
    fn test_bounded_indices_follow_position() {
        let source = ItemSource::bounded(vec!["a", "b", "c"]);
        assert_eq!(source.known_size(), Some(3));

        let pulled = drain(&source);
        let indices: Vec<_> = pulled.iter().map(|w| w.index).collect();
        let items: Vec<_> = pulled.iter().map(|w| w.item).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(items, vec!["a", "b", "c"]);
        assert!(source.next().is_none());
    }

    #[test]
    fn test_bounded_over_range() {
        let source = ItemSource::bounded(1..10);
        assert_eq!(source.known_size(), Some(9));
        assert_eq!(drain(&source).len(), 9);
    }

    #[test]
    fn test_streaming_stops_at_sentinel() {
        let (tx, rx) = unbounded();
        tx.send(Feed::Item(1)).unwrap();
        tx.send(Feed::Item(2)).unwrap();
        tx.send(Feed::Stop).unwrap();
        tx.send(Feed::Item(3)).unwrap();

        let source = ItemSource::streaming(rx);
        assert_eq!(source.known_size(), None);
        let items: Vec<_> = drain(&source).into_iter().map(|w| w.item).collect();
        assert_eq!(items, vec![1, 2]);
        // Exhaustion is cached: the queued 3 is never read.
        assert!(source.next().is_none());
    }

    #[test]
    fn test_streaming_ends_on_disconnect() {
        let (tx, rx) = unbounded();
        tx.send(Feed::Item("x")).unwrap();
        drop(tx);

        let source = ItemSource::streaming(rx);
        assert_eq!(drain(&source).len(), 1);
    }

    #[test]
    fn test_streaming_pull_gives_up_when_halted() {
        let (tx, rx) = unbounded::<Feed<i32>>();
        let source = ItemSource::streaming(rx);

        assert!(source.pull(&|| true).is_none());

        // Not marked exhausted: later items are still delivered.
        tx.send(Feed::Item(5)).unwrap();
        assert_eq!(source.next().map(|w| w.item), Some(5));
    }

    #[test]
    fn test_generator_not_called_after_stop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut remaining = vec![1, 2, 3];

        let source = ItemSource::generator(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            remaining.pop().into()
        });

        let items: Vec<_> = drain(&source).into_iter().map(|w| w.item).collect();
        assert_eq!(items, vec![3, 2, 1]);
        assert!(source.next().is_none());
        assert!(source.next().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_pulls_assign_unique_indices() {
        let source = ItemSource::bounded(0..1000);
        let mut seen: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Some(work) = source.next() {
                            assert_eq!(work.item, work.index);
                            mine.push(work.index);
                        }
                        mine
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}
