use crate::constants::{FLOOD_DEBOUNCE_SECONDS, MAX_DATAGRAM_SIZE, RESPONSE_TIMEOUT_SECONDS};
use crate::networking::messages::DatagramMessage;
use crate::networking::offer_gate::OfferGate;
use crate::networking::peer_info::PeerInfo;
use crate::networking::tcp_transfer::TransferService;
use crate::storage::chunk_store::ChunkStore;
use crate::storage::location_table::LocationTable;
use log::{debug, error, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

///
/// The UdpService is the unreliable side of the node: one datagram socket
/// carrying the three discovery-protocol messages. The socket is owned here
/// and shared by the receive loop and every sender task; each inbound
/// datagram is dispatched on its own task, so handlers only touch state
/// behind the per-file locks of the store, the location table and the
/// offer gate.
///
pub struct UdpService {
    socket: UdpSocket,
    local_peer: PeerInfo,
    link_speed: u32,
    neighbors: Mutex<Vec<PeerInfo>>,
    gate: Arc<OfferGate>,
    store: Arc<ChunkStore>,
    locations: Arc<LocationTable>,
    transfers: Arc<TransferService>,
}

impl UdpService {
    /// Wraps an already-bound datagram socket. `local_peer` is the identity
    /// this node advertises as the original requester of its own searches;
    /// its ip is also what the loop-suppression rule compares against.
    pub fn new(
        socket: UdpSocket,
        local_peer: PeerInfo,
        link_speed: u32,
        store: Arc<ChunkStore>,
        locations: Arc<LocationTable>,
        transfers: Arc<TransferService>,
    ) -> UdpService {
        UdpService {
            socket,
            local_peer,
            link_speed,
            neighbors: Mutex::new(Vec::new()),
            gate: Arc::new(OfferGate::new()),
            store,
            locations,
            transfers,
        }
    }

    pub fn local_peer(&self) -> PeerInfo {
        self.local_peer
    }

    /// Installs the fixed neighbor set. Called once at startup, after every
    /// node of the topology is known.
    pub fn set_neighbors(&self, neighbors: Vec<PeerInfo>) {
        *self.neighbors.lock().unwrap() = neighbors;
        info!(target: "discovery", "Neighbor set configured");
    }

    fn neighbors_snapshot(&self) -> Vec<PeerInfo> {
        self.neighbors.lock().unwrap().clone()
    }

    /// Receive loop. Every datagram gets its own dispatch task so that a
    /// debounced re-flood never blocks the socket.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(target: "discovery", "Datagram service running as {}", self.local_peer);
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match self.socket.recv_from(&mut buffer).await {
                    Ok((len, source)) => {
                        let raw = String::from_utf8_lossy(&buffer[..len]).into_owned();
                        let service = Arc::clone(&self);
                        tokio::spawn(async move { service.dispatch(raw, source).await });
                    }
                    Err(e) => {
                        error!(target: "discovery", "Datagram receive failed: {}", e);
                    }
                }
            }
        })
    }

    async fn dispatch(&self, raw: String, source: SocketAddr) {
        let message = match DatagramMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                error!(target: "discovery", "Dropping datagram from {}: {}", source, e);
                return;
            }
        };

        match message {
            DatagramMessage::Discovery {
                file_name,
                total_chunks,
                ttl,
                requester,
            } => {
                self.handle_discovery(file_name, total_chunks, ttl, requester, source)
                    .await;
            }
            DatagramMessage::Offer {
                file_name,
                link_speed,
                chunk_ids,
            } => self.handle_offer(file_name, link_speed, chunk_ids, source),
            DatagramMessage::Request {
                file_name,
                chunk_ids,
            } => self.handle_request(file_name, chunk_ids, source),
        }
    }

    /// A discovery from somewhere in the network. Offer what we hold
    /// directly to the original requester, then keep the flood going while
    /// the TTL allows. The offer always goes out before the debounce sleep
    /// so the requester records us even when our neighbors answer faster.
    async fn handle_discovery(
        &self,
        file_name: String,
        total_chunks: u32,
        ttl: u32,
        requester: PeerInfo,
        source: SocketAddr,
    ) {
        if requester.address.ip() == self.local_peer.address.ip() {
            // Our own search has come back around a topology loop.
            return;
        }

        info!(
            target: "discovery",
            "Discovery for '{}' (ttl {}) via {}, requester {}",
            file_name, ttl, source, requester
        );

        let available = self.store.available_chunks(&file_name);
        if available.is_empty() {
            info!(target: "discovery", "No chunks of '{}' held locally", file_name);
        } else {
            self.send_offer(&file_name, available, requester).await;
        }

        if ttl > 0 {
            sleep(Duration::from_secs(FLOOD_DEBOUNCE_SECONDS)).await;
            let reflood = DatagramMessage::Discovery {
                file_name,
                total_chunks,
                ttl: ttl - 1,
                requester,
            };
            self.broadcast(&reflood).await;
        }
    }

    /// An offer in response to one of our own discoveries. Recorded only
    /// while the response window is open; the peer address is the
    /// datagram's source address, never anything claimed in the payload.
    fn handle_offer(&self, file_name: String, link_speed: u32, chunk_ids: Vec<u32>, source: SocketAddr) {
        if !self.gate.is_open(&file_name) {
            debug!(
                target: "offer",
                "Offer for '{}' from {} outside the response window, dropped",
                file_name, source
            );
            return;
        }

        info!(
            target: "offer",
            "Offer from {} for '{}': {} chunks at {} B/s",
            source, file_name, chunk_ids.len(), link_speed
        );
        self.locations
            .store_offer(&file_name, &chunk_ids, PeerInfo::new(source), link_speed);
    }

    /// A peer asking for chunks we hold. Delivery happens over the stream
    /// transport on its own task, towards the requester's derived stream
    /// address.
    fn handle_request(&self, file_name: String, chunk_ids: Vec<u32>, source: SocketAddr) {
        info!(
            target: "request",
            "Request from {} for {} chunks of '{}'",
            source, chunk_ids.len(), file_name
        );

        let dest = PeerInfo::new(source).stream_address();
        let transfers = Arc::clone(&self.transfers);
        tokio::spawn(async move {
            transfers.send_chunks(&file_name, &chunk_ids, dest).await;
        });
    }

    /// The originating discovery send of a search: broadcast to the
    /// neighbors, then open the offer gate and arm the response-window
    /// timer. Returns the timer task; awaiting it is how the coordinator
    /// blocks until the window has elapsed and the gate is closed again.
    pub async fn start_discovery(
        &self,
        file_name: &str,
        total_chunks: u32,
        ttl: u32,
    ) -> JoinHandle<()> {
        let message = DatagramMessage::Discovery {
            file_name: file_name.to_string(),
            total_chunks,
            ttl,
            requester: self.local_peer,
        };
        self.broadcast(&message).await;

        self.gate.open(file_name);
        info!(
            target: "discovery",
            "Response window for '{}' open for {}s",
            file_name, RESPONSE_TIMEOUT_SECONDS
        );

        let gate = Arc::clone(&self.gate);
        let file = file_name.to_string();
        tokio::spawn(async move {
            sleep(Duration::from_secs(RESPONSE_TIMEOUT_SECONDS)).await;
            gate.close(&file);
            info!(target: "discovery", "Response window for '{}' closed", file);
        })
    }

    async fn send_offer(&self, file_name: &str, chunk_ids: Vec<u32>, dest: PeerInfo) {
        info!(
            target: "offer",
            "Offering {} chunks of '{}' to {}",
            chunk_ids.len(), file_name, dest
        );
        let message = DatagramMessage::Offer {
            file_name: file_name.to_string(),
            link_speed: self.link_speed,
            chunk_ids,
        };
        self.send_to(&message, dest.address).await;
    }

    /// Sends one request per selected peer with that peer's chunk list.
    pub async fn send_request(&self, file_name: &str, assignments: &HashMap<PeerInfo, Vec<u32>>) {
        for (peer, chunk_ids) in assignments {
            info!(
                target: "request",
                "Requesting chunks {:?} of '{}' from {}",
                chunk_ids, file_name, peer
            );
            let message = DatagramMessage::Request {
                file_name: file_name.to_string(),
                chunk_ids: chunk_ids.clone(),
            };
            self.send_to(&message, peer.address).await;
        }
    }

    async fn broadcast(&self, message: &DatagramMessage) {
        for neighbor in self.neighbors_snapshot() {
            self.send_to(message, neighbor.address).await;
        }
    }

    /// Best-effort datagram send. Failures are logged and skipped; the
    /// transport offers no acknowledgement anyway.
    async fn send_to(&self, message: &DatagramMessage, dest: SocketAddr) {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(target: "discovery", "Cannot encode {}: {}", message, e);
                return;
            }
        };
        match self.socket.send_to(encoded.as_bytes(), dest).await {
            Ok(_) => debug!(target: "discovery", "Sent to {}: {}", dest, encoded),
            Err(e) => error!(target: "discovery", "Send to {} failed: {}", dest, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CONTROL_MESSAGE_SIZE;
    use crate::networking::messages::ControlHeader;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Fixture {
        service: Arc<UdpService>,
        store: Arc<ChunkStore>,
        locations: Arc<LocationTable>,
        _dir: TempDir,
    }

    /// A service on an ephemeral 127.0.0.1 port, advertising that address
    /// as its own. Peers that must not look like this node live on other
    /// loopback addresses.
    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(dir.path(), 1));
        store.load_local().await.unwrap();
        let locations = Arc::new(LocationTable::new());
        let transfers = Arc::new(
            TransferService::bind("127.0.0.1:0".parse().unwrap(), 1 << 20, Arc::clone(&store))
                .unwrap(),
        );

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_peer = PeerInfo::new(socket.local_addr().unwrap());

        let service = Arc::new(UdpService::new(
            socket,
            local_peer,
            1500,
            Arc::clone(&store),
            Arc::clone(&locations),
            transfers,
        ));
        Arc::clone(&service).run();

        Fixture {
            service,
            store,
            locations,
            _dir: dir,
        }
    }

    async fn recv_text(socket: &UdpSocket, wait: Duration) -> Option<String> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        match timeout(wait, socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buffer[..len]).into_owned()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_discovery_answered_with_offer_to_requester() {
        let fixture = fixture().await;
        fixture.store.save_chunk("f.bin", 0, b"a").await.unwrap();
        fixture.store.save_chunk("f.bin", 2, b"b").await.unwrap();

        // The "requester" lives on a different loopback address, so the
        // loop-suppression rule does not apply.
        let requester = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        let requester_addr = requester.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery = format!("DISCOVERY f.bin 4 0 {}", requester_addr);
        sender
            .send_to(discovery.as_bytes(), fixture.service.socket.local_addr().unwrap())
            .await
            .unwrap();

        let offer = recv_text(&requester, Duration::from_secs(2)).await.unwrap();
        assert_eq!(offer, "RESPONSE f.bin 1500 0 2");
    }

    #[tokio::test]
    async fn test_discovery_reflooded_with_decremented_ttl() {
        let fixture = fixture().await;
        let neighbor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fixture
            .service
            .set_neighbors(vec![PeerInfo::new(neighbor.local_addr().unwrap())]);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                b"DISCOVERY f.bin 4 2 127.0.0.2:9999",
                fixture.service.socket.local_addr().unwrap(),
            )
            .await
            .unwrap();

        // The re-flood is debounced by one second and keeps the original
        // requester untouched.
        let reflooded = recv_text(&neighbor, Duration::from_secs(3)).await.unwrap();
        assert_eq!(reflooded, "DISCOVERY f.bin 4 1 127.0.0.2:9999");
    }

    #[tokio::test]
    async fn test_ttl_zero_is_not_reflooded() {
        let fixture = fixture().await;
        let neighbor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fixture
            .service
            .set_neighbors(vec![PeerInfo::new(neighbor.local_addr().unwrap())]);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                b"DISCOVERY f.bin 4 0 127.0.0.2:9999",
                fixture.service.socket.local_addr().unwrap(),
            )
            .await
            .unwrap();

        assert!(recv_text(&neighbor, Duration::from_millis(1800)).await.is_none());
    }

    #[tokio::test]
    async fn test_own_discovery_is_suppressed() {
        let fixture = fixture().await;
        fixture.store.save_chunk("f.bin", 0, b"a").await.unwrap();

        let requester = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let neighbor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fixture
            .service
            .set_neighbors(vec![PeerInfo::new(neighbor.local_addr().unwrap())]);

        // orig_ip matches the node's own ip: no offer, no re-flood.
        let discovery = format!("DISCOVERY f.bin 4 2 {}", requester.local_addr().unwrap());
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(discovery.as_bytes(), fixture.service.socket.local_addr().unwrap())
            .await
            .unwrap();

        assert!(recv_text(&requester, Duration::from_millis(500)).await.is_none());
        assert!(recv_text(&neighbor, Duration::from_millis(1800)).await.is_none());
    }

    #[tokio::test]
    async fn test_offer_dropped_while_gate_closed() {
        let fixture = fixture().await;
        fixture.locations.initialize("f.bin", 4);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                b"RESPONSE f.bin 900 0 1",
                fixture.service.socket.local_addr().unwrap(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(fixture.locations.select_peers("f.bin").is_empty());
    }

    #[tokio::test]
    async fn test_offer_recorded_under_source_address_while_gate_open() {
        let fixture = fixture().await;
        fixture.locations.initialize("f.bin", 4);
        fixture.service.gate.open("f.bin");

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();
        sender
            .send_to(
                b"RESPONSE f.bin 900 0 1",
                fixture.service.socket.local_addr().unwrap(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(300)).await;
        let selected = fixture.locations.select_peers("f.bin");
        assert_eq!(selected[&PeerInfo::new(sender_addr)], vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unknown_command_is_dropped() {
        let fixture = fixture().await;
        fixture.locations.initialize("f.bin", 4);
        fixture.service.gate.open("f.bin");

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"GOSSIP f.bin 900 0", fixture.service.socket.local_addr().unwrap())
            .await
            .unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(fixture.locations.select_peers("f.bin").is_empty());
    }

    #[tokio::test]
    async fn test_request_delivers_chunks_to_derived_stream_port() {
        let fixture = fixture().await;
        fixture.store.save_chunk("f.bin", 0, b"hello").await.unwrap();

        // The requester's stream listener must sit at its udp port + 1000.
        let requester = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = requester.local_addr().unwrap().port();
        let stream = TcpListener::bind(("127.0.0.1", udp_port + 1000))
            .await
            .expect("derived stream port busy, rerun");

        requester
            .send_to(b"REQUEST f.bin 0", fixture.service.socket.local_addr().unwrap())
            .await
            .unwrap();

        let (mut inbound, _) = timeout(Duration::from_secs(2), stream.accept())
            .await
            .unwrap()
            .unwrap();
        let mut record = [0u8; CONTROL_MESSAGE_SIZE];
        inbound.read_exact(&mut record).await.unwrap();
        let header = ControlHeader::decode(&record).unwrap();
        assert_eq!(header.chunk_id, 0);
        assert_eq!(header.chunk_size, 5);

        let mut payload = [0u8; 5];
        inbound.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn test_start_discovery_broadcasts_and_opens_gate() {
        let fixture = fixture().await;
        let neighbor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fixture
            .service
            .set_neighbors(vec![PeerInfo::new(neighbor.local_addr().unwrap())]);

        let _window = fixture.service.start_discovery("f.bin", 4, 3).await;

        assert!(fixture.service.gate.is_open("f.bin"));
        let sent = recv_text(&neighbor, Duration::from_secs(2)).await.unwrap();
        let expected = format!("DISCOVERY f.bin 4 3 {}", fixture.service.local_peer());
        assert_eq!(sent, expected);
    }
}
