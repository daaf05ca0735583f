//! Interconnect message transport.
//!
//! Point-to-point channels between hierarchy modules. Each (src, dst) pair
//! owns a FIFO link with bounded occupancy; messages arrive after a
//! size-dependent latency, in order, and are never lost. Senders that find
//! the link full get a deferred-retry event instead of blocking.

use std::collections::{HashMap, VecDeque};

use crate::esim::EventQueue;

/// Index of a node inside one network.
pub type NodeId = usize;
/// Handle of an in-flight message.
pub type MsgId = u64;

/// An in-flight message on a link.
#[derive(Clone, Copy, Debug)]
pub struct Message {
    /// Source node.
    pub src: NodeId,
    /// Destination node.
    pub dst: NodeId,
    /// Payload size in bytes (header included by the caller).
    pub size: u32,
    /// Simulated time at which the message reaches `dst`.
    pub arrival: u64,
}

struct Link {
    busy_until: u64,
    in_flight: VecDeque<MsgId>,
}

/// One switched point-to-point network (e.g. the channel between a row of
/// L1 modules and the L2 below them).
pub struct Network {
    /// Network name, for trace output.
    pub name: String,
    /// Link transfer width in bytes per cycle.
    pub width: u32,
    /// Fixed per-message latency in cycles.
    pub latency: u64,
    /// Maximum messages queued on one link before senders are deferred.
    pub capacity: usize,
    node_names: Vec<String>,
    links: HashMap<(NodeId, NodeId), Link>,
    msgs: HashMap<MsgId, Message>,
    next_msg: MsgId,
    /// Total messages delivered, for statistics.
    pub delivered: u64,
    /// Total sends that had to be deferred for lack of link space.
    pub deferrals: u64,
}

impl Network {
    /// Creates an empty network.
    pub fn new(name: &str, width: u32, latency: u64, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            width,
            latency,
            capacity,
            node_names: Vec::new(),
            links: HashMap::new(),
            msgs: HashMap::new(),
            next_msg: 0,
            delivered: 0,
            deferrals: 0,
        }
    }

    /// Registers an end node and returns its id.
    pub fn add_node(&mut self, name: &str) -> NodeId {
        self.node_names.push(name.to_string());
        self.node_names.len() - 1
    }

    /// Number of end nodes.
    pub fn node_count(&self) -> usize {
        self.node_names.len()
    }

    /// Name of a node.
    pub fn node_name(&self, node: NodeId) -> &str {
        &self.node_names[node]
    }

    /// Cycles to push `size` bytes down a link.
    fn transit_time(&self, size: u32) -> u64 {
        let transfers = (u64::from(size) + u64::from(self.width) - 1) / u64::from(self.width);
        self.latency + transfers
    }

    /// Attempts to place a message on the (src, dst) link.
    ///
    /// On success, `on_done` is scheduled for `stack` at the transmission
    /// completion time and the message handle is returned. If the link is
    /// full, `on_defer` is scheduled for when space frees up and `None` is
    /// returned; the caller retries from the deferred event.
    #[allow(clippy::too_many_arguments)]
    pub fn try_send<K: Copy + Eq>(
        &mut self,
        queue: &mut EventQueue<K>,
        src: NodeId,
        dst: NodeId,
        size: u32,
        on_done: K,
        on_defer: K,
        stack: u64,
    ) -> Option<MsgId> {
        let now = queue.now();
        let transit = self.transit_time(size);
        let link = self.links.entry((src, dst)).or_insert(Link {
            busy_until: 0,
            in_flight: VecDeque::new(),
        });

        if link.in_flight.len() >= self.capacity {
            // Retry when the head-of-line message has drained.
            let head = link.in_flight.front().copied();
            let free_at = head
                .and_then(|id| self.msgs.get(&id))
                .map(|m| m.arrival)
                .unwrap_or(now + 1)
                .max(now + 1);
            self.deferrals += 1;
            log::trace!(
                "net {}: link {}->{} full, deferring stack {}",
                self.name,
                src,
                dst,
                stack
            );
            queue.schedule(on_defer, stack, free_at - now);
            return None;
        }

        let arrival = link.busy_until.max(now) + transit;
        link.busy_until = arrival;

        let id = self.next_msg;
        self.next_msg += 1;
        self.msgs.insert(
            id,
            Message {
                src,
                dst,
                size,
                arrival,
            },
        );
        link.in_flight.push_back(id);
        queue.schedule(on_done, stack, arrival - now);
        Some(id)
    }

    /// Acknowledges delivery at the destination, retiring the message from
    /// its link. Delivery is FIFO per link; acknowledging out of order is a
    /// transport bug.
    pub fn receive(&mut self, node: NodeId, msg: MsgId) {
        let m = match self.msgs.remove(&msg) {
            Some(m) => m,
            None => panic!("net {}: receive of unknown message {}", self.name, msg),
        };
        assert_eq!(m.dst, node, "net {}: message {} received at wrong node", self.name, msg);
        let link = self
            .links
            .get_mut(&(m.src, m.dst))
            .expect("link of in-flight message");
        match link.in_flight.front() {
            Some(&head) if head == msg => {
                link.in_flight.pop_front();
            }
            _ => panic!("net {}: out-of-order receive on {}->{}", self.name, m.src, m.dst),
        }
        self.delivered += 1;
    }

    /// Looks up an in-flight message.
    pub fn message(&self, msg: MsgId) -> Option<&Message> {
        self.msgs.get(&msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Kind {
        Done,
        Defer,
    }

    /// Two messages on one link arrive in send order, the second delayed
    /// behind the first (FIFO occupancy).
    #[test]
    fn per_link_fifo_and_serialisation() {
        let mut q: EventQueue<Kind> = EventQueue::new();
        let mut net = Network::new("test", 8, 2, 8);
        let a = net.add_node("a");
        let b = net.add_node("b");

        let m0 = net.try_send(&mut q, a, b, 8, Kind::Done, Kind::Defer, 0).unwrap();
        let m1 = net.try_send(&mut q, a, b, 8, Kind::Done, Kind::Defer, 1).unwrap();

        let t0 = net.message(m0).unwrap().arrival;
        let t1 = net.message(m1).unwrap().arrival;
        assert!(t1 > t0, "second message serialises behind the first");

        q.advance();
        assert_eq!(q.pop_due().unwrap().stack, 0);
        net.receive(b, m0);
        q.advance();
        assert_eq!(q.pop_due().unwrap().stack, 1);
        net.receive(b, m1);
        assert_eq!(net.delivered, 2);
    }

    /// A full link defers the sender instead of dropping the message.
    #[test]
    fn congested_link_defers() {
        let mut q: EventQueue<Kind> = EventQueue::new();
        let mut net = Network::new("test", 8, 1, 1);
        let a = net.add_node("a");
        let b = net.add_node("b");

        let m0 = net.try_send(&mut q, a, b, 64, Kind::Done, Kind::Defer, 0).unwrap();
        assert!(net.try_send(&mut q, a, b, 8, Kind::Done, Kind::Defer, 1).is_none());
        assert_eq!(net.deferrals, 1);

        // The defer event fires once the first message has drained.
        q.advance();
        let ev = q.pop_due().unwrap();
        assert_eq!((ev.kind, ev.stack), (Kind::Done, 0));
        net.receive(b, m0);
        q.advance();
        let ev = q.pop_due().unwrap();
        assert_eq!((ev.kind, ev.stack), (Kind::Defer, 1));
    }
}
