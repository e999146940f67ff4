use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use super::error::TransportError;
use super::message::{Envelope, Message};

/// Completion handle for a non-blocking send.
///
/// Dropping the handle abandons the completion, it never blocks.
#[derive(Debug)]
pub struct SendRequest {
    dest: usize,
    completion: Receiver<Result<(), TransportError>>,
}

impl SendRequest {
    pub fn new(dest: usize, completion: Receiver<Result<(), TransportError>>) -> Self {
        Self { dest, completion }
    }

    pub fn dest(&self) -> usize {
        self.dest
    }

    /// Block until the send has completed (or failed)
    pub fn wait(self) -> Result<(), TransportError> {
        match self.completion.recv() {
            Ok(result) => result,
            Err(_) => Err(TransportError::Disconnected(self.dest)),
        }
    }
}

/// Point to point messaging between the ranks of a pool. Rank 0 is the collector.
pub trait Transport {
    fn rank(&self) -> usize;

    fn pool_size(&self) -> usize;

    /// Queue a message for `dest` and return immediately
    fn isend(&mut self, dest: usize, message: Message) -> Result<SendRequest, TransportError>;

    /// Block until a message arrives from any rank
    fn recv_any(&mut self) -> Result<Envelope, TransportError>;

    /// Like recv_any, but give up after `timeout`
    fn recv_any_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError>;

    /// Return a message if one is already waiting. Never blocks.
    fn poll(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// What travels over a channel: the message plus the sender's completion slot
#[derive(Debug)]
struct Packet {
    envelope: Envelope,
    ack: Sender<Result<(), TransportError>>,
}

impl Packet {
    /// Complete the sender's request and hand back the envelope
    fn deliver(self) -> Envelope {
        // the sender may have dropped its request, nothing to do then
        let _ = self.ack.send(Ok(()));
        self.envelope
    }
}

/// A pool of ranks living as threads in one process, linked by mpsc channels.
///
/// A send completes once the destination has taken the message out of its inbox.
#[derive(Debug)]
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<Sender<Packet>>,
    inbox: Receiver<Packet>,
}

impl ChannelTransport {
    /// Build the endpoints of a fully connected pool. Element k is rank k.
    pub fn pool(pool_size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..pool_size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn pool_size(&self) -> usize {
        self.peers.len()
    }

    fn isend(&mut self, dest: usize, message: Message) -> Result<SendRequest, TransportError> {
        let peer = self
            .peers
            .get(dest)
            .ok_or(TransportError::InvalidRank(dest))?;
        let (ack, completion) = channel();
        let packet = Packet {
            envelope: Envelope::new(self.rank, message),
            ack,
        };
        peer.send(packet)
            .map_err(|_| TransportError::Disconnected(dest))?;
        Ok(SendRequest::new(dest, completion))
    }

    fn recv_any(&mut self) -> Result<Envelope, TransportError> {
        self.inbox
            .recv()
            .map(Packet::deliver)
            .map_err(|_| TransportError::Disconnected(self.rank))
    }

    fn recv_any_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet.deliver())),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }

    fn poll(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.try_recv() {
            Ok(packet) => Ok(Some(packet.deliver())),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_completes_on_receipt() {
        let mut pool = ChannelTransport::pool(2);
        let mut worker = pool.pop().unwrap();
        let mut collector = pool.pop().unwrap();
        assert_eq!((collector.rank(), worker.rank()), (0, 1));
        assert_eq!(worker.pool_size(), 2);

        let request = worker.isend(0, Message::End).unwrap();
        let envelope = collector.recv_any().unwrap();
        assert_eq!(envelope, Envelope::new(1, Message::End));
        request.wait().unwrap();
    }

    #[test]
    fn test_poll_never_blocks() {
        let mut pool = ChannelTransport::pool(2);
        let mut worker = pool.pop().unwrap();
        let mut collector = pool.pop().unwrap();
        assert!(worker.poll().unwrap().is_none());
        assert!(collector
            .recv_any_timeout(Duration::from_millis(5))
            .unwrap()
            .is_none());
        let _ = collector.isend(1, Message::Terminate).unwrap();
        assert_eq!(
            worker.poll().unwrap(),
            Some(Envelope::new(0, Message::Terminate))
        );
    }

    #[test]
    fn test_unreceived_send_fails_when_peer_drops() {
        let mut pool = ChannelTransport::pool(2);
        let mut worker = pool.pop().unwrap();
        let collector = pool.pop().unwrap();
        let request = worker.isend(0, Message::End).unwrap();
        drop(collector);
        assert!(matches!(
            request.wait(),
            Err(TransportError::Disconnected(0))
        ));
        assert!(matches!(
            worker.isend(7, Message::End),
            Err(TransportError::InvalidRank(7))
        ));
    }
}
