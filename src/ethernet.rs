/*! Ethernet adapter: UDP datagrams or TCP byte streams.

UDP mode binds a local port, optionally joins multicast groups, and
delivers one chunk per datagram with the remote address in the chunk
metadata. TCP connects as a client when a host is configured,
otherwise listens and adopts the first accepted connection. TCP chunks
are whatever the OS delivers; no re-framing is attempted.
*/
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::adapter::{
    Adapter, AdapterStats, EthProtocol, Handle, HandleCore, OpenOptions, POLL, RxCallback,
    SubscriptionId,
};
use crate::device::{DeviceInfo, DeviceType};
use crate::frame::TransportMeta;
use crate::simulator::{SimHandle, SimTraffic, SimulatorConfig};
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

/// The Ethernet adapter.
pub struct EthernetAdapter;

impl Adapter for EthernetAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Ethernet
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        // Interface enumeration is not portable without extra OS
        // plumbing; expose the wildcard interface and the simulator.
        Ok(vec![
            DeviceInfo::new("eth:any", "All interfaces", DeviceType::Ethernet)
                .with_path("0.0.0.0"),
            DeviceInfo::simulator(DeviceType::Ethernet),
        ])
    }

    fn open(&self, device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
        if device.is_simulator() {
            return Ok(SimHandle::spawn(
                device.clone(),
                SimTraffic::EfuseAdc,
                &SimulatorConfig::loopback(),
                options,
            ));
        }
        match options.eth_protocol.unwrap_or(EthProtocol::Udp) {
            EthProtocol::Udp => open_udp(device, options),
            EthProtocol::Tcp => open_tcp(device, options),
            EthProtocol::Raw => Err(Error::UnsupportedOption("ethProtocol=raw".into())),
        }
    }

    fn create_simulator(&self, config: &SimulatorConfig) -> Result<Arc<dyn Handle>> {
        Ok(SimHandle::spawn(
            DeviceInfo::simulator(DeviceType::Ethernet),
            SimTraffic::EfuseAdc,
            config,
            &OpenOptions::default(),
        ))
    }
}

struct UdpHandle {
    core: Arc<HandleCore>,
    socket: UdpSocket,
    target: Option<SocketAddr>,
}

fn open_udp(device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
    let port = options.eth_port.unwrap_or(0);
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    socket.set_read_timeout(Some(POLL))?;
    for group in options.eth_multicast.iter().flatten() {
        let group: Ipv4Addr = group
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad multicast group {group:?}")))?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        debug!("joined multicast group {group}");
    }
    let target = match &options.eth_host {
        Some(host) => Some(
            (host.as_str(), options.eth_port.unwrap_or(0))
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::Transport(format!("cannot resolve {host}")))?,
        ),
        None => None,
    };
    let core = HandleCore::new(device.clone());
    let reader = socket.try_clone()?;
    let c = core.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 65536];
        while !c.is_closed() {
            match reader.recv_from(&mut buf) {
                Ok((n, addr)) => c.deliver(&buf[..n], Some(TransportMeta::Udp { addr })),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("UDP recv failed: {e}");
                    c.record_error();
                    break;
                }
            }
        }
    });
    info!("{}: UDP socket bound on port {port}", device.id);
    Ok(Arc::new(UdpHandle {
        core,
        socket,
        target,
    }))
}

impl Handle for UdpHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let Some(target) = self.target else {
            self.core.record_error();
            return Err(Error::Transport("no remote host configured".into()));
        };
        self.socket.send_to(data, target).map_err(|e| {
            self.core.record_error();
            Error::Transport(format!("UDP send: {e}"))
        })?;
        self.core.record_tx(data.len());
        Ok(())
    }

    fn subscribe(&self, callback: RxCallback) -> SubscriptionId {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.unsubscribe(id)
    }

    fn set_options(&self, _options: &OpenOptions) -> Result<()> {
        self.core.ensure_open()
    }

    fn close(&self) -> Result<()> {
        self.core.mark_closed();
        Ok(())
    }

    fn stats(&self) -> AdapterStats {
        self.core.snapshot()
    }
}

struct TcpHandle {
    core: Arc<HandleCore>,
    stream: Mutex<Option<TcpStream>>,
}

fn open_tcp(device: &DeviceInfo, options: &OpenOptions) -> Result<Arc<dyn Handle>> {
    let port = options.eth_port.unwrap_or(0);
    let core = HandleCore::new(device.clone());
    match &options.eth_host {
        Some(host) => {
            // Client mode.
            let stream = TcpStream::connect((host.as_str(), port))
                .map_err(|e| Error::Transport(format!("TCP connect {host}:{port}: {e}")))?;
            stream.set_read_timeout(Some(POLL))?;
            let reader = stream.try_clone()?;
            let c = core.clone();
            std::thread::spawn(move || read_loop(&c, reader));
            info!("{}: TCP connected to {host}:{port}", device.id);
            Ok(Arc::new(TcpHandle {
                core,
                stream: Mutex::new(Some(stream)),
            }))
        }
        None => {
            // Passive mode: adopt the first accepted connection.
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            listener.set_nonblocking(true)?;
            let handle = Arc::new(TcpHandle {
                core: core.clone(),
                stream: Mutex::new(None),
            });
            let accept_handle = handle.clone();
            std::thread::spawn(move || {
                loop {
                    if core.is_closed() {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            info!("TCP peer {peer} connected");
                            if stream.set_read_timeout(Some(POLL)).is_err() {
                                core.record_error();
                                return;
                            }
                            let reader = match stream.try_clone() {
                                Ok(r) => r,
                                Err(e) => {
                                    warn!("TCP clone failed: {e}");
                                    core.record_error();
                                    return;
                                }
                            };
                            *accept_handle.stream.lock().unwrap() = Some(stream);
                            read_loop(&core, reader);
                            return;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(POLL);
                        }
                        Err(e) => {
                            warn!("TCP accept failed: {e}");
                            core.record_error();
                            return;
                        }
                    }
                }
            });
            info!("{}: TCP listening on port {port}", device.id);
            Ok(handle)
        }
    }
}

/// Deliver whatever the OS hands us, one chunk per read.
fn read_loop(core: &HandleCore, mut stream: TcpStream) {
    let mut buf = [0u8; READ_CHUNK];
    while !core.is_closed() {
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!("{}: TCP peer disconnected", core.device().id);
                core.record_error();
                return;
            }
            Ok(n) => core.deliver(&buf[..n], None),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("{}: TCP read failed: {e}", core.device().id);
                core.record_error();
                return;
            }
        }
    }
}

impl Handle for TcpHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let mut guard = self.stream.lock().unwrap();
        let Some(stream) = guard.as_mut() else {
            self.core.record_error();
            return Err(Error::Transport("no peer connected".into()));
        };
        stream.write_all(data).map_err(|e| {
            self.core.record_error();
            Error::Transport(format!("TCP write: {e}"))
        })?;
        self.core.record_tx(data.len());
        Ok(())
    }

    fn subscribe(&self, callback: RxCallback) -> SubscriptionId {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.unsubscribe(id)
    }

    fn set_options(&self, _options: &OpenOptions) -> Result<()> {
        self.core.ensure_open()
    }

    fn close(&self) -> Result<()> {
        if self.core.mark_closed() {
            self.stream.lock().unwrap().take();
        }
        Ok(())
    }

    fn stats(&self) -> AdapterStats {
        self.core.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn eth_device() -> DeviceInfo {
        DeviceInfo::new("eth:any", "All interfaces", DeviceType::Ethernet).with_path("0.0.0.0")
    }

    #[test]
    fn udp_datagram_per_chunk() -> anyhow::Result<()> {
        let mut options = OpenOptions {
            eth_protocol: Some(EthProtocol::Udp),
            eth_port: Some(0),
            ..Default::default()
        };
        // Bind an ephemeral sender socket first so we know our peer.
        let sender = UdpSocket::bind("127.0.0.1:0")?;
        // Pick a free port for the handle by binding and dropping.
        let probe = UdpSocket::bind("127.0.0.1:0")?;
        let port = probe.local_addr()?.port();
        drop(probe);
        options.eth_port = Some(port);

        let h = EthernetAdapter.open(&eth_device(), &options)?;
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let metas = Arc::new(Mutex::new(Vec::new()));
        let (c, m) = (chunks.clone(), metas.clone());
        h.subscribe(Box::new(move |bytes, meta| {
            c.lock().unwrap().push(bytes.to_vec());
            m.lock().unwrap().push(meta.transport.clone());
        }));
        let sender_port = sender.local_addr()?.port();
        sender.send_to(&[1, 2, 3], ("127.0.0.1", port))?;
        sender.send_to(&[4, 5], ("127.0.0.1", port))?;
        std::thread::sleep(Duration::from_millis(150));
        let got = chunks.lock().unwrap().clone();
        assert_eq!(got, vec![vec![1, 2, 3], vec![4, 5]]);
        let metas = metas.lock().unwrap();
        assert!(matches!(
            &metas[0],
            Some(TransportMeta::Udp { addr }) if addr.port() == sender_port
        ));
        let s = h.stats();
        assert_eq!(s.messages_rx, 2);
        assert_eq!(s.bytes_rx, 5);
        h.close()?;
        Ok(())
    }

    #[test]
    fn udp_write_needs_target() -> anyhow::Result<()> {
        let options = OpenOptions {
            eth_protocol: Some(EthProtocol::Udp),
            eth_port: Some(0),
            ..Default::default()
        };
        let h = EthernetAdapter.open(&eth_device(), &options)?;
        assert!(h.write(&[1]).is_err());
        assert_eq!(h.stats().errors, 1);
        h.close()?;
        Ok(())
    }

    #[test]
    fn tcp_client_reads_chunks() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[10, 20, 30]).unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[0xEE]);
        });
        let options = OpenOptions {
            eth_protocol: Some(EthProtocol::Tcp),
            eth_host: Some("127.0.0.1".into()),
            eth_port: Some(port),
            ..Default::default()
        };
        let h = EthernetAdapter.open(&eth_device(), &options)?;
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let c = chunks.clone();
        h.subscribe(Box::new(move |bytes, _| {
            c.lock().unwrap().push(bytes.to_vec());
        }));
        h.write(&[0xEE])?;
        std::thread::sleep(Duration::from_millis(150));
        let got: Vec<u8> = chunks.lock().unwrap().concat();
        assert_eq!(got, vec![10, 20, 30]);
        h.close()?;
        assert!(matches!(h.write(&[1]), Err(Error::Closed)));
        Ok(())
    }

    #[test]
    fn tcp_listener_adopts_first_connection() -> anyhow::Result<()> {
        let probe = TcpListener::bind("127.0.0.1:0")?;
        let port = probe.local_addr()?.port();
        drop(probe);
        let options = OpenOptions {
            eth_protocol: Some(EthProtocol::Tcp),
            eth_port: Some(port),
            ..Default::default()
        };
        let h = EthernetAdapter.open(&eth_device(), &options)?;
        // No peer yet: writes fail without closing the handle.
        assert!(h.write(&[1]).is_err());
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let c = chunks.clone();
        h.subscribe(Box::new(move |bytes, _| {
            c.lock().unwrap().push(bytes.to_vec());
        }));
        let mut peer = TcpStream::connect(("127.0.0.1", port))?;
        std::thread::sleep(Duration::from_millis(100));
        peer.write_all(&[42])?;
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(chunks.lock().unwrap().concat(), vec![42]);
        h.write(&[7])?;
        let mut buf = [0u8; 4];
        let n = peer.read(&mut buf)?;
        assert_eq!(&buf[..n], &[7]);
        h.close()?;
        Ok(())
    }

    #[test]
    fn raw_protocol_rejected() {
        let options = OpenOptions {
            eth_protocol: Some(EthProtocol::Raw),
            ..Default::default()
        };
        assert!(matches!(
            EthernetAdapter.open(&eth_device(), &options),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn list_has_simulator() {
        let devices = EthernetAdapter.list_devices().unwrap();
        assert!(devices.iter().any(|d| d.is_simulator()));
    }
}
