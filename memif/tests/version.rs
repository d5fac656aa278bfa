//! Version negotiation against a hand-rolled peer.
//!
//! Both real endpoints in this test binary share one protocol version,
//! so the incompatible-HELLO path is exercised with a raw
//! sequenced-packet socket speaking the codec directly.

use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use memif::core::control::{ControlMsg, Hello};
use memif::core::MSG_SIZE;
use memif::{Port, PortConfig, PortEventHandler, Socket};
use socket2::{Domain, SockAddr, Type};

const WAIT: Duration = Duration::from_secs(5);

struct Events {
    disconnected: crossbeam_channel::Sender<()>,
}

impl PortEventHandler for Events {
    fn on_connected(&self, _port: &Port) -> memif::Result<()> {
        panic!("must not connect to an incompatible server");
    }

    fn on_disconnected(&self, _port: &Port) -> memif::Result<()> {
        let _ = self.disconnected.send(());
        Ok(())
    }
}

fn recv_msg(sock: &socket2::Socket) -> [u8; MSG_SIZE] {
    let mut buf = [MaybeUninit::<u8>::uninit(); MSG_SIZE];
    let n = sock.recv(&mut buf).unwrap();
    assert_eq!(n, MSG_SIZE, "short control message");
    let mut raw = [0u8; MSG_SIZE];
    for (dst, src) in raw.iter_mut().zip(&buf) {
        *dst = unsafe { src.assume_init() };
    }
    raw
}

#[test]
fn incompatible_hello_version_closes_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v1.sock");

    // A fake server that only speaks a future protocol version.
    let listener = socket2::Socket::new(Domain::UNIX, Type::SEQPACKET, None).unwrap();
    listener.bind(&SockAddr::unix(&path).unwrap()).unwrap();
    listener.listen(1).unwrap();

    let (dtx, drx) = unbounded();
    let handler: Arc<dyn PortEventHandler> = Arc::new(Events { disconnected: dtx });
    let socket = Socket::new("test-client", Some(path.clone())).unwrap();
    let port = socket
        .add_port(PortConfig::new(0, "memif_c0", handler))
        .unwrap();
    socket.start_polling();
    port.request_connection().unwrap();

    let (peer, _addr) = listener.accept().unwrap();
    let hello = ControlMsg::Hello(Hello {
        name: "future-server".into(),
        version_min: 0x0300,
        version_max: 0x0300,
        max_region: 255,
        max_ring_m2s: 255,
        max_ring_s2m: 255,
        max_log2_ring_size: 14,
    });
    peer.send(&hello.encode()).unwrap();

    // The client answers with DISCONNECT carrying the exact reason.
    let raw = recv_msg(&peer);
    match ControlMsg::decode(&raw).unwrap() {
        ControlMsg::Disconnect(msg) => {
            assert_eq!(msg.reason, "incompatible memif version");
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }

    // Locally the error surfaces on the socket's error channel and the
    // port never reports connected.
    let err = socket.errors().recv_timeout(WAIT).unwrap();
    assert!(
        err.to_string().contains("incompatible memif version"),
        "unexpected error: {err}"
    );
    drx.recv_timeout(WAIT).expect("disconnected callback");
    assert!(!port.is_connected());
    assert!(!port.is_connecting());
}
