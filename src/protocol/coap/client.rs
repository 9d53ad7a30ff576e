//! Confirmable exchanges over a connected UDP socket

use std::{
    io::ErrorKind,
    net::{ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use coap_lite::{MessageClass, MessageType, Packet};
use rand::Rng;
use tracing::{debug, trace};

use crate::{
    config::CoapConfig,
    error::{Error, Result},
};

// Large enough for any datagram a constrained server sends
const MAX_DATAGRAM: usize = 1280;

const ACK_RANDOM_FACTOR: f64 = 1.5;

#[derive(Debug)]
pub(crate) enum Received {
    Packet(Packet),
    Timeout,
    Shutdown,
}

/// One endpoint talking to one server
#[derive(Debug)]
pub(crate) struct CoapClient {
    socket: UdpSocket,
    config: CoapConfig,
    shutdown: Arc<AtomicBool>,
    next_message_id: u16,
    buf: Vec<u8>,
}

impl CoapClient {
    pub(crate) fn connect(host: &str, port: u16, config: CoapConfig) -> Result<Self> {
        let peer = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidUri {
                uri: format!("coap://{host}:{port}"),
                reason: "host does not resolve".into(),
            })?;

        let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        debug!(%peer, local = ?socket.local_addr().ok(), "CoAP client connected");

        Ok(Self {
            socket,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_message_id: rand::random(),
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Flag stopping the client at its next poll
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub(crate) fn config(&self) -> &CoapConfig {
        &self.config
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }

    /// Send `request` as a confirmable message and wait for its response
    ///
    /// Returns `None` when the client is shut down before the exchange completes.
    pub(crate) fn exchange(&mut self, request: &mut Packet) -> Result<Option<Packet>> {
        request.header.set_type(MessageType::Confirmable);
        request.header.message_id = self.message_id();
        let message_id = request.header.message_id;
        let token = request.get_token().to_vec();
        let bytes = request.to_bytes()?;

        let factor = rand::thread_rng().gen_range(1.0..ACK_RANDOM_FACTOR);
        let mut timeout = self.config.ack_timeout.mul_f64(factor);
        let mut retransmissions = 0;
        let mut acknowledged = false;

        self.socket.send(&bytes)?;
        let mut deadline = Instant::now() + timeout;

        loop {
            let packet = match self.receive_until(deadline)? {
                Received::Shutdown => return Ok(None),
                Received::Timeout if acknowledged => {
                    return Err(Error::Coap(format!(
                        "no response to message {message_id} within the exchange lifetime"
                    )))
                }
                Received::Timeout if retransmissions >= self.config.max_retransmit => {
                    return Err(Error::Coap(format!(
                        "message {message_id} not acknowledged after {retransmissions} retransmissions"
                    )))
                }
                Received::Timeout => {
                    retransmissions += 1;
                    timeout *= 2;
                    trace!(message_id, retransmissions, ?timeout, "retransmitting");
                    self.socket.send(&bytes)?;
                    deadline = Instant::now() + timeout;
                    continue;
                }
                Received::Packet(packet) => packet,
            };

            let same_id = packet.header.message_id == message_id;
            match packet.header.get_type() {
                MessageType::Acknowledgement if same_id => match packet.header.code {
                    MessageClass::Empty => {
                        trace!(message_id, "empty acknowledgement, awaiting separate response");
                        acknowledged = true;
                        deadline = Instant::now() + self.config.exchange_lifetime;
                    }
                    MessageClass::Response(_) => return Ok(Some(packet)),
                    code => {
                        return Err(Error::Coap(format!(
                            "acknowledgement of message {message_id} carries {code}"
                        )))
                    }
                },
                MessageType::Reset if same_id => {
                    return Err(Error::Coap(format!("message {message_id} rejected with reset")))
                }
                MessageType::Confirmable | MessageType::NonConfirmable
                    if packet.get_token() == token.as_slice() =>
                {
                    if let MessageType::Confirmable = packet.header.get_type() {
                        self.acknowledge(&packet)?;
                    }
                    return Ok(Some(packet));
                }
                MessageType::Confirmable => {
                    trace!(message_id = packet.header.message_id, "rejecting unexpected message");
                    self.reset(&packet)?;
                }
                _ => trace!(message_id = packet.header.message_id, "ignoring unrelated message"),
            }
        }
    }

    /// Wait up to `wait` for the next datagram
    pub(crate) fn receive(&mut self, wait: Duration) -> Result<Received> {
        self.receive_until(Instant::now() + wait)
    }

    fn receive_until(&mut self, deadline: Instant) -> Result<Received> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(Received::Shutdown);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Received::Timeout);
            }

            // Bounded by the poll interval so a shutdown is noticed quickly
            let wait = (deadline - now)
                .min(self.config.poll_interval)
                .max(Duration::from_millis(1));
            self.socket.set_read_timeout(Some(wait))?;

            match self.socket.recv(&mut self.buf) {
                Ok(len) => match Packet::from_bytes(&self.buf[..len]) {
                    Ok(packet) => return Ok(Received::Packet(packet)),
                    Err(err) => debug!(error = %err, "dropping malformed datagram"),
                },
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn acknowledge(&self, message: &Packet) -> Result<()> {
        self.send_empty(MessageType::Acknowledgement, message.header.message_id)
    }

    pub(crate) fn reset(&self, message: &Packet) -> Result<()> {
        self.send_empty(MessageType::Reset, message.header.message_id)
    }

    fn send_empty(&self, ty: MessageType, message_id: u16) -> Result<()> {
        let mut packet = Packet::new();
        packet.header.set_type(ty);
        packet.header.code = MessageClass::Empty;
        packet.header.message_id = message_id;

        self.socket.send(&packet.to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{net::SocketAddr, thread};

    use coap_lite::{RequestType, ResponseType};

    use super::*;

    fn fast_config() -> CoapConfig {
        CoapConfig {
            ack_timeout: Duration::from_millis(100),
            max_retransmit: 2,
            exchange_lifetime: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn server() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn recv(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0; MAX_DATAGRAM];
        let (len, peer) = socket.recv_from(&mut buf).unwrap();
        (Packet::from_bytes(&buf[..len]).unwrap(), peer)
    }

    fn get() -> Packet {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.set_token(vec![1, 2, 3, 4]);
        packet
    }

    #[test]
    fn retransmits_until_acknowledged() {
        let (socket, port) = server();
        let handle = thread::spawn(move || {
            let (first, _) = recv(&socket);
            let (second, peer) = recv(&socket);
            assert_eq!(first.header.message_id, second.header.message_id);

            let mut response = Packet::new();
            response.header.set_type(MessageType::Acknowledgement);
            response.header.message_id = second.header.message_id;
            response.header.code = MessageClass::Response(ResponseType::Content);
            response.set_token(second.get_token().to_vec());
            socket
                .send_to(&response.to_bytes().unwrap(), peer)
                .unwrap();
        });

        let mut client = CoapClient::connect("127.0.0.1", port, fast_config()).unwrap();
        let response = client.exchange(&mut get()).unwrap().unwrap();
        assert_eq!(
            response.header.code,
            MessageClass::Response(ResponseType::Content)
        );
        handle.join().unwrap();
    }

    #[test]
    fn gives_up_after_max_retransmit() {
        let (socket, port) = server();
        let handle = thread::spawn(move || {
            // initial transmission plus two retransmissions
            for _ in 0..3 {
                recv(&socket);
            }
        });

        let mut client = CoapClient::connect("127.0.0.1", port, fast_config()).unwrap();
        assert!(matches!(client.exchange(&mut get()), Err(Error::Coap(_))));
        handle.join().unwrap();
    }

    #[test]
    fn acknowledgement_with_request_code_is_rejected() {
        let (socket, port) = server();
        let handle = thread::spawn(move || {
            let (request, peer) = recv(&socket);

            let mut ack = Packet::new();
            ack.header.set_type(MessageType::Acknowledgement);
            ack.header.message_id = request.header.message_id;
            ack.header.code = MessageClass::Request(RequestType::Get);
            ack.set_token(request.get_token().to_vec());
            socket.send_to(&ack.to_bytes().unwrap(), peer).unwrap();
        });

        let mut client = CoapClient::connect("127.0.0.1", port, fast_config()).unwrap();
        assert!(matches!(client.exchange(&mut get()), Err(Error::Coap(_))));
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_interrupts_exchange() {
        let (_socket, port) = server();
        let mut client = CoapClient::connect("127.0.0.1", port, fast_config()).unwrap();
        client.shutdown_flag().store(true, Ordering::SeqCst);

        assert!(client.exchange(&mut get()).unwrap().is_none());
    }
}
