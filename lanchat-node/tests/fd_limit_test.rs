//! Transport under descriptor exhaustion. Lowers RLIMIT_NOFILE for the whole
//! process, so it lives in its own test binary.
#![cfg(target_os = "linux")]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lanchat_node::{events, Config, NodeEvent, Outbound, TransportService};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn nofile_limit() -> libc::rlimit {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) }, 0);
    lim
}

fn set_nofile_limit(lim: &libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, lim) }, 0);
}

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[tokio::test]
async fn accept_survives_descriptor_exhaustion() {
    let (tx, mut rx) = events::channel(64);
    let mut service = TransportService::new(
        Config {
            username: "alice".into(),
            discovery_port: 0,
            transport_port: 0,
            ..Config::default()
        },
        tx,
    );
    service.start().await.unwrap();
    let port = service.local_addr().unwrap().port();

    let original = nofile_limit();
    let squeezed = libc::rlimit {
        rlim_cur: (open_descriptors() + 16) as libc::rlim_t,
        rlim_max: original.rlim_max,
    };
    set_nofile_limit(&squeezed);

    // Blocking connects keep the accept task parked until every descriptor is
    // taken, so the queued connections can only be accepted into EMFILE.
    let mut clients = Vec::new();
    for _ in 0..256 {
        match std::net::TcpStream::connect((LOCALHOST, port)) {
            Ok(s) => clients.push(s),
            Err(_) => break,
        }
    }
    assert!(!clients.is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(service.is_running());

    drop(clients);
    set_nofile_limit(&original);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(service.is_running());

    Outbound::new("bob", port)
        .send_text(LOCALHOST, "after the squeeze")
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    match got {
        Ok(Some(NodeEvent::Message(m))) => assert_eq!(m.text_body(), Some("after the squeeze")),
        other => panic!("expected message event, got {:?}", other),
    }
}
