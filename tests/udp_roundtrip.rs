#![allow(clippy::unwrap_used)]

//! End-to-end UDP round trip over a real kernel socket (scenario S6): a datagram sent to a
//! virtual listener's subnet address arrives with the client's chosen destination recovered as
//! `laddr`, and the reply sent back through the virtual packet conn is observed with that same
//! address as its source.
//!
//! Needs `CAP_NET_RAW`/root for `SO_BINDTODEVICE`, like the teacher crate's own `ebpf_ipv4`
//! loopback integration test.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bindtodevice_dispatch::{
    InterfaceListenerId, ListenerOptions, Manager, ManagerConfig, OsInterfaceStorage, Subnet,
};
use tokio::net::UdpSocket;

#[tokio::test]
#[ignore = "Needs root"]
async fn udp_datagram_round_trips_with_original_destination_as_source() {
    let manager = Manager::new(ManagerConfig::default(), Arc::new(OsInterfaceStorage));

    let id = InterfaceListenerId::new("lo-test");
    manager
        .add(id.clone(), "lo", 15353, ListenerOptions::default())
        .unwrap();

    let subnet = Subnet::new(Ipv4Addr::new(127, 0, 0, 0).into(), 8).unwrap();
    let config = manager.listen_config(&id, subnet).unwrap();
    let packet_conn = config.listen_packet();

    manager
        .start(Arc::new(|err| panic!("unexpected bind error: {err}")))
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.2:0").await.unwrap();
    let server_addr = "127.0.0.3:15353".parse().unwrap();
    client.send_to(b"hello", server_addr).await.unwrap();

    let mut buf = [0u8; 512];
    let session = packet_conn.read_from_session(&mut buf).await.unwrap();
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(session.laddr, server_addr);

    packet_conn
        .write_to_session(b"world", session)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        let mut reply = [0u8; 512];
        let (n, from) = client.recv_from(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"world");
        assert_eq!(from, server_addr);
    })
    .await
    .unwrap();

    manager.shutdown().unwrap();
}
