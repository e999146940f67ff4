use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::Value;

use super::error::BroadcastError;

pub const SNAPSHOT_TOPIC: &str = "snapshot";
pub const FRAME_TOPIC: &str = "frame";
const RESET_COMMAND: &str = "reset";
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Requests subscribers can send back to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Reset,
}

/// Where the aggregated data goes. Implemented by the TCP broadcaster, and by
/// recorders in tests.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), BroadcastError>;

    /// Next pending control request, if any. Never blocks.
    fn poll_control(&mut self) -> Option<ControlRequest>;
}

/// Frame layout: topic length (u32 BE), topic, payload length (u32 BE), JSON payload
pub fn encode_broadcast(topic: &str, payload: &Value) -> Result<Vec<u8>, BroadcastError> {
    let body = serde_json::to_vec(payload)?;
    let mut bytes = Vec::with_capacity(8 + topic.len() + body.len());
    bytes.write_u32::<BigEndian>(topic.len() as u32)?;
    bytes.write_all(topic.as_bytes())?;
    bytes.write_u32::<BigEndian>(body.len() as u32)?;
    bytes.write_all(&body)?;
    Ok(bytes)
}

/// Read one broadcast frame, as a subscriber would
pub fn read_broadcast<R: Read>(reader: &mut R) -> Result<(String, Value), BroadcastError> {
    let topic_length = reader.read_u32::<BigEndian>()? as usize;
    let mut topic = vec![0; topic_length];
    reader.read_exact(&mut topic)?;
    let payload_length = reader.read_u32::<BigEndian>()? as usize;
    let mut payload = vec![0; payload_length];
    reader.read_exact(&mut payload)?;
    Ok((
        String::from_utf8_lossy(&topic).into_owned(),
        serde_json::from_slice(&payload)?,
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct SlotState {
    /// At most one unsent message per topic, oldest topic first
    pending: VecDeque<(String, Arc<Vec<u8>>)>,
    closed: bool,
}

/// Latest-value mailbox with a high-water mark of one message per topic
#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    /// Store a message, replacing any unsent one on the same topic. Returns true if one
    /// was replaced.
    fn offer(&self, topic: &str, message: Arc<Vec<u8>>) -> bool {
        let mut state = lock(&self.state);
        let replaced = match state.pending.iter().position(|(t, _)| t == topic) {
            Some(idx) => {
                state.pending[idx].1 = message;
                true
            }
            None => {
                state.pending.push_back((topic.to_string(), message));
                false
            }
        };
        self.ready.notify_one();
        replaced
    }

    /// Block until there is a message to send; None once closed
    fn take(&self) -> Option<Arc<Vec<u8>>> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some((_, message)) = state.pending.pop_front() {
                return Some(message);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[derive(Debug)]
struct Subscriber {
    peer: SocketAddr,
    slot: Arc<Slot>,
    stream: TcpStream,
}

impl Subscriber {
    fn close(&self) {
        self.slot.close();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn write_loop(mut stream: TcpStream, slot: Arc<Slot>, peer: SocketAddr) {
    while let Some(message) = slot.take() {
        if let Err(e) = stream.write_all(&message).and_then(|_| stream.flush()) {
            log::info!("Subscriber {peer} went away: {e}");
            slot.close();
            return;
        }
    }
}

/// Reads commands until the subscriber hangs up, then closes its slot
fn control_loop(
    stream: TcpStream,
    slot: Arc<Slot>,
    control: Sender<ControlRequest>,
    peer: SocketAddr,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        match line.trim() {
            RESET_COMMAND => {
                log::info!("Subscriber {peer} requested a reset");
                if control.send(ControlRequest::Reset).is_err() {
                    break;
                }
            }
            "" => (),
            other => log::warn!("Subscriber {peer} sent unknown command {other:?}"),
        }
    }
    slot.close();
}

fn accept_loop(
    listener: TcpListener,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    control: Sender<ControlRequest>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = add_subscriber(stream, peer, &subscribers, &control) {
                    log::warn!("Could not set up subscriber {peer}: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("Broadcaster stopped accepting subscribers: {e}");
                return;
            }
        }
    }
}

fn add_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    subscribers: &Mutex<Vec<Subscriber>>,
    control: &Sender<ControlRequest>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let slot = Arc::new(Slot::default());

    let writer_stream = stream.try_clone()?;
    let writer_slot = slot.clone();
    std::thread::spawn(move || write_loop(writer_stream, writer_slot, peer));

    let reader_stream = stream.try_clone()?;
    let reader_slot = slot.clone();
    let control = control.clone();
    std::thread::spawn(move || control_loop(reader_stream, reader_slot, control, peer));

    log::info!("Subscriber {peer} connected");
    lock(subscribers).push(Subscriber { peer, slot, stream });
    Ok(())
}

/// Publishes aggregated data to every connected subscriber over TCP.
///
/// Each subscriber gets its own writer thread and a mailbox holding one message per
/// topic, so a slow client only ever misses intermediate updates of a topic and never
/// slows the collector.
#[derive(Debug)]
pub struct Broadcaster {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    control: Receiver<ControlRequest>,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn bind(endpoint: &str) -> Result<Self, BroadcastError> {
        let listener = TcpListener::bind(endpoint)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("Broadcasting on {local_addr}");

        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (control_tx, control) = channel();
        let acceptor = {
            let subscribers = subscribers.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || accept_loop(listener, subscribers, control_tx, shutdown))
        };

        Ok(Self {
            local_addr,
            subscribers,
            control,
            shutdown,
            acceptor: Some(acceptor),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Messages replaced before a subscriber could receive them
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Publish for Broadcaster {
    fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), BroadcastError> {
        let message = Arc::new(encode_broadcast(topic, payload)?);
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| {
            if subscriber.slot.is_closed() {
                log::debug!("Removing subscriber {}", subscriber.peer);
                return false;
            }
            true
        });
        for subscriber in subscribers.iter() {
            if subscriber.slot.offer(topic, message.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn poll_control(&mut self) -> Option<ControlRequest> {
        self.control.try_recv().ok()
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for subscriber in lock(&self.subscribers).drain(..) {
            subscriber.close();
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_slot_keeps_only_latest() {
        let slot = Slot::default();
        assert!(!slot.offer(FRAME_TOPIC, Arc::new(vec![1])));
        assert!(slot.offer(FRAME_TOPIC, Arc::new(vec![2])));
        assert_eq!(slot.take().unwrap().as_ref(), &vec![2]);
        slot.close();
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_frames_do_not_displace_snapshots() {
        let slot = Slot::default();
        assert!(!slot.offer(SNAPSHOT_TOPIC, Arc::new(vec![1])));
        assert!(!slot.offer(FRAME_TOPIC, Arc::new(vec![2])));
        assert!(slot.offer(FRAME_TOPIC, Arc::new(vec![3])));
        assert!(slot.offer(FRAME_TOPIC, Arc::new(vec![4])));
        assert_eq!(slot.take().unwrap().as_ref(), &vec![1]);
        assert_eq!(slot.take().unwrap().as_ref(), &vec![4]);
    }

    #[test]
    fn test_frame_layout() {
        let bytes = encode_broadcast("frame", &json!({"a": 1})).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..9], b"frame");
        assert_eq!(&bytes[9..13], &[0, 0, 0, 7]);
        assert_eq!(&bytes[13..], br#"{"a":1}"#);
    }

    #[test]
    fn test_subscriber_receives_and_controls() {
        let mut broadcaster = Broadcaster::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(broadcaster.local_addr()).unwrap();
        wait_for(|| broadcaster.subscriber_count() == 1);

        broadcaster
            .publish(SNAPSHOT_TOPIC, &json!({"num_events": 3}))
            .unwrap();
        let (topic, payload) = read_broadcast(&mut client).unwrap();
        assert_eq!(topic, SNAPSHOT_TOPIC);
        assert_eq!(payload["num_events"], 3);

        client.write_all(b"reset\n").unwrap();
        let start = Instant::now();
        while broadcaster.poll_control().is_none() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_departed_subscriber_is_removed() {
        let mut broadcaster = Broadcaster::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(broadcaster.local_addr()).unwrap();
        wait_for(|| broadcaster.subscriber_count() == 1);
        drop(client);

        let start = Instant::now();
        while broadcaster.subscriber_count() > 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            broadcaster.publish(FRAME_TOPIC, &json!({})).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
