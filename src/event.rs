//! Double-buffered event bus.
//!
//! Each event type owns a `current` and a `next` buffer. Publishing appends
//! to `next`; consumers borrow `current`. One buffer swap per tick (end of
//! the `PostSimulation` phase) makes events published in tick T visible to
//! consumers in tick T+1, never earlier.

use std::any::{Any, TypeId};

use ahash::AHashMap;

/// Marker for event payloads; unmanaged (Copy) and managed (object) events
/// share the same channel mechanism.
pub trait Event: Send + Sync + 'static {}

/// Automatically implement Event for all valid types
impl<T: Send + Sync + 'static> Event for T {}

/// Type-erased double-buffered channel
trait AnyEventChannel: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Swap buffers, clearing the former `current`.
    fn swap(&mut self);
    fn current_len(&self) -> usize;
    fn pending_len(&self) -> usize;
}

struct EventChannel<E: Event> {
    current: Vec<E>,
    next: Vec<E>,
}

impl<E: Event> Default for EventChannel<E> {
    fn default() -> Self {
        Self {
            current: Vec::new(),
            next: Vec::new(),
        }
    }
}

impl<E: Event> AnyEventChannel for EventChannel<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
        self.next.clear();
    }

    fn current_len(&self) -> usize {
        self.current.len()
    }

    fn pending_len(&self) -> usize {
        self.next.len()
    }
}

/// Per-type double-buffered event queues
pub struct EventBus {
    channels: AHashMap<TypeId, Box<dyn AnyEventChannel>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            channels: AHashMap::new(),
        }
    }

    /// Append an event to the `next` buffer; visible after the next swap.
    pub fn publish<E: Event>(&mut self, event: E) {
        let channel = self
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(EventChannel::<E>::default()));
        let channel = channel
            .as_any_mut()
            .downcast_mut::<EventChannel<E>>()
            .expect("event channel type mismatch");
        channel.next.push(event);
    }

    /// Borrow the `current` buffer: events published in the previous tick.
    pub fn read<E: Event>(&self) -> &[E] {
        self.channels
            .get(&TypeId::of::<E>())
            .and_then(|channel| channel.as_any().downcast_ref::<EventChannel<E>>())
            .map(|channel| channel.current.as_slice())
            .unwrap_or(&[])
    }

    /// Swap every channel, clearing the former `current` buffers.
    pub fn swap_buffers(&mut self) {
        for channel in self.channels.values_mut() {
            channel.swap();
        }
    }

    /// Events currently readable across all types
    pub fn current_count(&self) -> usize {
        self.channels.values().map(|c| c.current_len()).sum()
    }

    /// Events waiting for the next swap across all types
    pub fn pending_count(&self) -> usize {
        self.channels.values().map(|c| c.pending_len()).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Damage(u32);

    #[derive(Debug, PartialEq)]
    struct Chat(String);

    #[test]
    fn test_events_visible_after_swap_only() {
        let mut bus = EventBus::new();
        bus.publish(Damage(7));
        assert!(bus.read::<Damage>().is_empty());

        bus.swap_buffers();
        assert_eq!(bus.read::<Damage>(), &[Damage(7)]);

        // Next swap clears the former current
        bus.swap_buffers();
        assert!(bus.read::<Damage>().is_empty());
    }

    #[test]
    fn test_publish_order_preserved() {
        let mut bus = EventBus::new();
        for i in 0..5 {
            bus.publish(Damage(i));
        }
        bus.swap_buffers();
        let seen: Vec<u32> = bus.read::<Damage>().iter().map(|d| d.0).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_managed_events_use_object_queues() {
        let mut bus = EventBus::new();
        bus.publish(Chat("hello".into()));
        bus.publish(Damage(1));
        bus.swap_buffers();
        assert_eq!(bus.read::<Chat>(), &[Chat("hello".into())]);
        assert_eq!(bus.current_count(), 2);
        assert_eq!(bus.pending_count(), 0);
    }
}
