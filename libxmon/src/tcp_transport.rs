use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{
    channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
};
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::TransportError;
use super::message::{read_frame, write_frame, write_hello, Envelope, Message, WireFrame};
use super::transport::{SendRequest, Transport};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

type Outgoing = (Message, Sender<Result<(), TransportError>>);
type Inbox = SyncSender<Result<Envelope, TransportError>>;

/// Envelopes held between the socket readers and the rank that owns them. Once full,
/// readers stop reading and the peers' writes back up onto their sockets.
fn inbox_capacity(pool_size: usize) -> usize {
    pool_size.max(1)
}

/// One socket to a peer, with a reader thread feeding the shared inbox and a writer
/// thread draining the outgoing queue.
#[derive(Debug)]
struct Link {
    outgoing: Sender<Outgoing>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    fn spawn(
        stream: TcpStream,
        local_rank: usize,
        peer_rank: usize,
        inbox: Inbox,
    ) -> Result<Self, TransportError> {
        let read_stream = stream.try_clone()?;
        let reader = std::thread::spawn(move || read_loop(read_stream, peer_rank, inbox));

        let (outgoing, queue) = channel::<Outgoing>();
        let writer = std::thread::spawn(move || write_loop(stream, local_rank, queue));

        Ok(Self {
            outgoing,
            reader: Some(reader),
            writer: Some(writer),
        })
    }
}

fn read_loop(stream: TcpStream, peer_rank: usize, inbox: Inbox) {
    let mut reader = BufReader::new(stream);
    let mut retired = false;
    loop {
        match read_frame(&mut reader) {
            Ok(WireFrame::Message(mut envelope)) => {
                // the link knows who is on the other end
                if envelope.source != peer_rank {
                    log::warn!(
                        "Rank {peer_rank} sent a frame claiming to be from rank {}",
                        envelope.source
                    );
                    envelope.source = peer_rank;
                }
                retired |= envelope.message.is_retirement();
                if inbox.send(Ok(envelope)).is_err() {
                    return;
                }
            }
            Ok(WireFrame::Hello(rank)) => {
                log::warn!("Ignoring repeated hello from rank {rank}");
            }
            Err(TransportError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                if !retired {
                    let _ = inbox.send(Err(TransportError::Disconnected(peer_rank)));
                }
                return;
            }
            Err(e) => {
                let _ = inbox.send(Err(e));
                return;
            }
        }
    }
}

fn write_loop(stream: TcpStream, local_rank: usize, queue: Receiver<Outgoing>) {
    let mut writer = BufWriter::new(stream);
    while let Ok((message, ack)) = queue.recv() {
        let result = write_frame(&mut writer, local_rank, &message);
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            return;
        }
    }
    if let Ok(stream) = writer.into_inner() {
        let _ = stream.shutdown(std::net::Shutdown::Write);
    }
}

/// One OS process per rank. The collector listens, workers connect and announce their
/// rank with a hello frame. Only worker <-> collector links exist.
///
/// A send completes once the frame has been written to the socket. The inbox is
/// bounded, so a rank that stops receiving eventually stalls its peers' sends.
#[derive(Debug)]
pub struct TcpTransport {
    rank: usize,
    pool_size: usize,
    /// Indexed by peer rank; the collector holds one per worker, a worker only slot 0
    links: Vec<Option<Link>>,
    inbox: Receiver<Result<Envelope, TransportError>>,
}

impl TcpTransport {
    /// Listen on `address` and wait until every worker of the pool has connected
    pub fn collector(address: &str, pool_size: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        log::info!(
            "Collector listening on {} for {} worker(s)",
            listener.local_addr()?,
            pool_size.saturating_sub(1)
        );
        Self::accept_workers(listener, pool_size)
    }

    /// Accept workers on an already bound listener
    pub fn accept_workers(listener: TcpListener, pool_size: usize) -> Result<Self, TransportError> {
        let (inbox_tx, inbox) = sync_channel(inbox_capacity(pool_size));
        let mut links: Vec<Option<Link>> = (0..pool_size).map(|_| None).collect();
        let mut connected = 0;
        while connected < pool_size.saturating_sub(1) {
            let (mut stream, peer) = listener.accept()?;
            let rank = match read_frame(&mut stream)? {
                WireFrame::Hello(rank) => rank,
                WireFrame::Message(envelope) => {
                    return Err(TransportError::Handshake(format!(
                        "{peer} sent {} before announcing its rank",
                        envelope.message.name()
                    )))
                }
            };
            if rank == 0 || rank >= pool_size {
                return Err(TransportError::InvalidRank(rank));
            }
            if links[rank].is_some() {
                return Err(TransportError::Handshake(format!(
                    "rank {rank} connected twice"
                )));
            }
            log::info!("Worker rank {rank} connected from {peer}");
            links[rank] = Some(Link::spawn(stream, 0, rank, inbox_tx.clone())?);
            connected += 1;
        }
        Ok(Self {
            rank: 0,
            pool_size,
            links,
            inbox,
        })
    }

    /// Connect to the collector at `address` as `rank`, retrying while it comes up
    pub fn worker(address: &str, rank: usize, pool_size: usize) -> Result<Self, TransportError> {
        if rank == 0 || rank >= pool_size {
            return Err(TransportError::InvalidRank(rank));
        }
        let mut attempt = 0;
        let mut stream = loop {
            match TcpStream::connect(address) {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    log::debug!("Connection to collector at {address} failed ({e}); retrying");
                    attempt += 1;
                    std::thread::sleep(CONNECT_BACKOFF);
                }
                Err(e) => return Err(TransportError::IOError(e)),
            }
        };
        stream.set_nodelay(true)?;
        write_hello(&mut stream, rank)?;

        let (inbox_tx, inbox) = sync_channel(inbox_capacity(pool_size));
        let mut links: Vec<Option<Link>> = (0..pool_size).map(|_| None).collect();
        links[0] = Some(Link::spawn(stream, rank, 0, inbox_tx)?);
        Ok(Self {
            rank,
            pool_size,
            links,
            inbox,
        })
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn isend(&mut self, dest: usize, message: Message) -> Result<SendRequest, TransportError> {
        let link = self
            .links
            .get(dest)
            .and_then(|l| l.as_ref())
            .ok_or(TransportError::InvalidRank(dest))?;
        let (ack, completion) = channel();
        link.outgoing
            .send((message, ack))
            .map_err(|_| TransportError::Disconnected(dest))?;
        Ok(SendRequest::new(dest, completion))
    }

    fn recv_any(&mut self) -> Result<Envelope, TransportError> {
        self.inbox
            .recv()
            .map_err(|_| TransportError::Disconnected(self.rank))?
    }

    fn recv_any_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(result) => result.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }

    fn poll(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.try_recv() {
            Ok(result) => result.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }
}

impl Drop for TcpTransport {
    /// Flush queued frames before the sockets go away
    fn drop(&mut self) {
        for link in self.links.iter_mut().flatten() {
            let (closed, _) = channel();
            link.outgoing = closed;
            if let Some(writer) = link.writer.take() {
                let _ = writer.join();
            }
            // the reader ends on its own once the peer closes
            drop(link.reader.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PeakList, ProcessedFrame};
    use ndarray::Array2;
    use std::collections::BTreeMap;

    #[test]
    fn test_tcp_pool_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let worker_address = address.clone();
        let worker = std::thread::spawn(move || {
            let mut transport = TcpTransport::worker(&worker_address, 1, 2).unwrap();
            let terminate = transport.recv_any().unwrap();
            assert_eq!(terminate, Envelope::new(0, Message::Terminate));
            transport.isend(0, Message::Terminated).unwrap().wait().unwrap();
        });

        let mut collector = TcpTransport::accept_workers(listener, 2).unwrap();
        collector.isend(1, Message::Terminate).unwrap().wait().unwrap();
        let ack = collector
            .recv_any_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(ack, Envelope::new(1, Message::Terminated));
        worker.join().unwrap();
    }

    fn large_frame(index: usize) -> ProcessedFrame {
        ProcessedFrame {
            event_id: format!("large//{index}"),
            timestamp: 0.0,
            peak_list: PeakList::default(),
            hit: false,
            saturated: false,
            beam_energy: None,
            detector_distance: None,
            metrics: BTreeMap::new(),
            detector_image: Some(Array2::zeros((400, 400))),
        }
    }

    #[test]
    fn test_unreceived_messages_stall_the_sender() {
        const SENDS: usize = 64;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (progress_tx, progress) = channel();
        let worker = std::thread::spawn(move || {
            let mut transport = TcpTransport::worker(&address, 1, 2).unwrap();
            for index in 0..SENDS {
                let message = Message::Result(Box::new(large_frame(index)));
                transport.isend(0, message).unwrap().wait().unwrap();
                progress_tx.send(index).unwrap();
            }
            transport.isend(0, Message::End).unwrap().wait().unwrap();
        });

        let mut collector = TcpTransport::accept_workers(listener, 2).unwrap();
        std::thread::sleep(Duration::from_millis(1000));
        let completed = progress.try_iter().count();
        assert!(
            completed < SENDS,
            "every send completed while the collector was not receiving"
        );

        for index in 0..SENDS {
            let envelope = collector
                .recv_any_timeout(Duration::from_secs(10))
                .unwrap()
                .unwrap();
            match envelope.message {
                Message::Result(frame) => assert_eq!(frame.event_id, format!("large//{index}")),
                other => panic!("expected a result, got {}", other.name()),
            }
        }
        let end = collector
            .recv_any_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_eq!(end, Envelope::new(1, Message::End));
        worker.join().unwrap();
    }

    #[test]
    fn test_source_rank_comes_from_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let impostor = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(address).unwrap();
            write_hello(&mut stream, 1).unwrap();
            // claims to be rank 2 on rank 1's link
            write_frame(&mut stream, 2, &Message::End).unwrap();
            stream
        });

        let mut collector = TcpTransport::accept_workers(listener, 2).unwrap();
        let envelope = collector
            .recv_any_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(envelope, Envelope::new(1, Message::End));
        drop(impostor.join().unwrap());
    }

    #[test]
    fn test_worker_rank_is_checked() {
        assert!(matches!(
            TcpTransport::worker("127.0.0.1:1", 0, 4),
            Err(TransportError::InvalidRank(0))
        ));
    }
}
