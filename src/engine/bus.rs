// Per-session event bus: bounded, non-blocking publish to at most one subscriber.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::events::ProgressEvent;

/// Push `event` into a bounded queue. When full, the oldest `Progress` is
/// evicted first, then the oldest event; a terminal event is never evicted.
fn push_bounded(queue: &mut VecDeque<ProgressEvent>, event: ProgressEvent, capacity: usize) {
    if queue.len() >= capacity {
        let victim = queue
            .iter()
            .position(|e| matches!(e, ProgressEvent::Progress { .. }))
            .or_else(|| queue.iter().position(|e| !e.is_terminal()));
        if let Some(index) = victim {
            queue.remove(index);
        }
    }
    queue.push_back(event);
}

struct ChannelState {
    events: VecDeque<ProgressEvent>,
    closed: bool,
}

/// Queue between the bus and one subscriber.
struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl Channel {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                events: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: ProgressEvent, capacity: usize) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = event.is_terminal();
            push_bounded(&mut state.events, event, capacity);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    fn contains_terminal(&self) -> bool {
        self.state.lock().events.iter().any(ProgressEvent::is_terminal)
    }

    async fn recv(&self) -> Option<ProgressEvent> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            // Single consumer: a notify_one issued before we park leaves a permit.
            self.notify.notified().await;
        }
    }
}

struct BusInner {
    subscriber: Option<(u64, Arc<Channel>)>,
    backlog: VecDeque<ProgressEvent>,
    terminal: Option<ProgressEvent>,
    terminal_delivered: bool,
    next_id: u64,
}

pub struct EventBus {
    key: String,
    capacity: usize,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(key: &str, capacity: usize) -> Self {
        Self {
            key: key.to_string(),
            capacity: capacity.max(1),
            inner: Mutex::new(BusInner {
                subscriber: None,
                backlog: VecDeque::new(),
                terminal: None,
                terminal_delivered: false,
                next_id: 0,
            }),
        }
    }

    /// Publish without blocking. Returns false once the stream has ended.
    pub fn publish(&self, event: ProgressEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            trace!("bus {} finished, dropping {:?}", self.key, event);
            return false;
        }
        if event.is_terminal() {
            inner.terminal = Some(event.clone());
        }
        match &inner.subscriber {
            Some((_, channel)) => channel.push(event, self.capacity),
            None => push_bounded(&mut inner.backlog, event, self.capacity),
        }
        true
    }

    /// Attach a subscriber, replacing (and superseding) any existing one.
    ///
    /// Events published while nobody was attached are replayed first. A
    /// subscriber arriving after the end still receives the terminal event.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if let Some((old_id, old)) = inner.subscriber.take() {
            debug!("bus {} subscriber {} superseded by {}", self.key, old_id, id);
            old.push(ProgressEvent::Superseded, self.capacity);
        }

        let channel = Arc::new(Channel::new());
        for event in inner.backlog.drain(..) {
            channel.push(event, self.capacity);
        }
        if let Some(terminal) = &inner.terminal {
            if inner.terminal_delivered {
                // One terminal event per session lifetime.
                channel.close();
            } else if !channel.contains_terminal() {
                channel.push(terminal.clone(), self.capacity);
            }
        }
        inner.subscriber = Some((id, channel.clone()));
        debug!("bus {} subscriber {} attached", self.key, id);

        Subscription {
            key: self.key.clone(),
            id,
            channel,
            bus: Arc::downgrade(self),
            finished: false,
            on_detach: None,
        }
    }

    /// Detach subscriber `id`. No-op if it was already replaced.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        match &inner.subscriber {
            Some((current, channel)) if *current == id => {
                channel.close();
                inner.subscriber = None;
                debug!("bus {} subscriber {} detached", self.key, id);
                true
            }
            _ => false,
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.inner.lock().subscriber.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Whether some subscriber has consumed the terminal event.
    pub fn terminal_delivered(&self) -> bool {
        self.inner.lock().terminal_delivered
    }

    fn mark_terminal_delivered(&self) {
        self.inner.lock().terminal_delivered = true;
    }
}

/// One attached subscriber's view of a session's events.
///
/// Holds no ownership of the session. Dropping it detaches from the bus on
/// every exit path.
pub struct Subscription {
    key: String,
    id: u64,
    channel: Arc<Channel>,
    bus: Weak<EventBus>,
    finished: bool,
    on_detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `hook` after this subscription detaches.
    pub fn on_detach<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_detach = Some(Box::new(hook));
    }

    /// Next event, or `None` after the terminal event has been returned.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        match self.channel.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    if !matches!(event, ProgressEvent::Superseded) {
                        if let Some(bus) = self.bus.upgrade() {
                            bus.mark_terminal_delivered();
                        }
                    }
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Convert into a `Stream` that ends after the terminal event.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
        if let Some(hook) = self.on_detach.take() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    fn progress(percent: f64) -> ProgressEvent {
        ProgressEvent::Progress { percent }
    }

    async fn drain(sub: Subscription) -> Vec<ProgressEvent> {
        tokio::time::timeout(Duration::from_secs(1), sub.into_stream().collect())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_and_end_after_complete() {
        let bus = Arc::new(EventBus::new("a", 16));
        let sub = bus.subscribe();

        assert!(bus.publish(progress(10.0)));
        assert!(bus.publish(ProgressEvent::Error {
            message: "retrying".to_string()
        }));
        assert!(bus.publish(ProgressEvent::Complete { exit_code: Some(0) }));
        assert!(!bus.publish(progress(99.0)));

        let events = drain(sub).await;
        assert_eq!(
            events,
            vec![
                progress(10.0),
                ProgressEvent::Error {
                    message: "retrying".to_string()
                },
                ProgressEvent::Complete { exit_code: Some(0) },
            ]
        );
        assert!(bus.terminal_delivered());
    }

    #[tokio::test]
    async fn test_backlog_replayed_to_late_subscriber() {
        let bus = Arc::new(EventBus::new("a", 16));
        bus.publish(progress(10.0));
        bus.publish(ProgressEvent::Complete { exit_code: Some(0) });
        assert!(!bus.terminal_delivered());

        let events = drain(bus.subscribe()).await;
        assert_eq!(
            events,
            vec![progress(10.0), ProgressEvent::Complete { exit_code: Some(0) }]
        );

        // The terminal event was consumed, so a later subscriber gets an empty stream.
        let events = drain(bus.subscribe()).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_undelivered_terminal_replayed_after_detach() {
        let bus = Arc::new(EventBus::new("a", 16));
        let mut early = bus.subscribe();
        bus.publish(progress(40.0));
        assert_eq!(early.next().await, Some(progress(40.0)));
        drop(early);

        bus.publish(ProgressEvent::Complete { exit_code: Some(0) });
        assert!(bus.is_finished());
        assert!(!bus.terminal_delivered());

        let events = drain(bus.subscribe()).await;
        assert_eq!(events, vec![ProgressEvent::Complete { exit_code: Some(0) }]);
        assert!(bus.terminal_delivered());
    }

    #[tokio::test]
    async fn test_second_subscriber_supersedes_first() {
        let bus = Arc::new(EventBus::new("a", 16));
        let mut first = bus.subscribe();
        bus.publish(progress(5.0));

        let second = bus.subscribe();
        bus.publish(progress(6.0));
        bus.publish(ProgressEvent::Complete { exit_code: Some(0) });

        assert_eq!(first.next().await, Some(progress(5.0)));
        assert_eq!(first.next().await, Some(ProgressEvent::Superseded));
        assert_eq!(first.next().await, None);
        drop(first);

        // Dropping the superseded subscription must not detach the new one.
        assert!(bus.has_subscriber());
        let events = drain(second).await;
        assert_eq!(
            events,
            vec![progress(6.0), ProgressEvent::Complete { exit_code: Some(0) }]
        );
    }

    #[tokio::test]
    async fn test_full_queue_evicts_progress_not_terminal() {
        let bus = Arc::new(EventBus::new("a", 3));
        let sub = bus.subscribe();
        bus.publish(progress(1.0));
        bus.publish(ProgressEvent::Error {
            message: "e".to_string(),
        });
        bus.publish(progress(2.0));
        bus.publish(progress(3.0));
        bus.publish(ProgressEvent::Complete { exit_code: Some(1) });

        let events = drain(sub).await;
        assert_eq!(
            events,
            vec![
                ProgressEvent::Error {
                    message: "e".to_string()
                },
                progress(3.0),
                ProgressEvent::Complete { exit_code: Some(1) },
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_detaches_and_runs_hook() {
        let bus = Arc::new(EventBus::new("a", 4));
        let detached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut sub = bus.subscribe();
        let flag = detached.clone();
        sub.on_detach(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        assert!(bus.has_subscriber());

        drop(sub);
        assert!(!bus.has_subscriber());
        assert!(detached.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_waiting_subscriber_is_woken() {
        let bus = Arc::new(EventBus::new("a", 4));
        let mut sub = bus.subscribe();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(ProgressEvent::Cancelled);
        });

        let event = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert_eq!(event, Some(ProgressEvent::Cancelled));
        assert_eq!(sub.next().await, None);
    }
}
