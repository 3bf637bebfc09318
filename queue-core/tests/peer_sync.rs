//! Peer Mode Integration Tests
//!
//! Drives several sync agents over an in-process peer mesh:
//! - Convergence through the host
//! - Host handover when the host leaves
//! - Local commands held after leaving the mesh

use queue_core::{
    ClimbRef, ConnectionState, PeerMesh, QueueDelta, QueueItem, SyncAgent, Transport,
};

fn add(uuid: &str) -> QueueDelta {
    QueueDelta::AddItem {
        item: QueueItem::with_uuid(uuid, ClimbRef::new(format!("climb-{uuid}"), "Problem", 40)),
        position: None,
    }
}

fn poll_all(agents: &mut [&mut SyncAgent]) {
    for _ in 0..3 {
        for agent in agents.iter_mut() {
            agent.poll();
        }
    }
}

#[test]
fn test_three_peers_converge() {
    let mesh = PeerMesh::new("wall");
    let mut a = SyncAgent::new(mesh.join("a").expect("join a"));
    let mut b = SyncAgent::new(mesh.join("b").expect("join b"));
    let mut c = SyncAgent::new(mesh.join("c").expect("join c"));
    poll_all(&mut [&mut a, &mut b, &mut c]);

    a.dispatch(add("1")).expect("a add");
    b.dispatch(add("2")).expect("b add");
    c.dispatch(add("3")).expect("c add");
    b.dispatch(QueueDelta::SetCurrent {
        item: Some(QueueItem::with_uuid("2", ClimbRef::new("climb-2", "Problem", 40))),
        should_add_to_queue: false,
    })
    .expect("b set current");
    poll_all(&mut [&mut a, &mut b, &mut c]);

    let authoritative = mesh.state();
    for agent in [&a, &b, &c] {
        assert_eq!(agent.confirmed(), &authoritative);
        assert_eq!(agent.view(), &authoritative);
        assert!(agent.pending().is_empty());
    }
    assert_eq!(authoritative.queue.len(), 3);
    assert_eq!(authoritative.current_uuid(), Some("2"));
}

#[test]
fn test_host_handover_keeps_queue() {
    let mesh = PeerMesh::new("wall");
    let mut host = SyncAgent::new(mesh.join("host").expect("join"));
    let mut guest = SyncAgent::new(mesh.join("guest").expect("join"));
    poll_all(&mut [&mut host, &mut guest]);

    host.dispatch(add("1")).expect("add");
    poll_all(&mut [&mut host, &mut guest]);

    mesh.leave("host");
    poll_all(&mut [&mut host, &mut guest]);
    assert_eq!(host.connection_state(), ConnectionState::Disconnected);
    assert_eq!(mesh.host_id().as_deref(), Some("guest"));

    guest.dispatch(add("2")).expect("add after handover");
    guest.poll();
    assert_eq!(guest.confirmed().queue.len(), 2);
    assert!(guest.pending().is_empty());
}

#[test]
fn test_departed_peer_keeps_local_commands() {
    let mesh = PeerMesh::new("wall");
    let _host = mesh.join("host").expect("join");
    let transport = mesh.join("guest").expect("join");
    let mut guest = SyncAgent::new(transport.clone());
    guest.poll();
    assert!(guest.is_live());

    mesh.leave("guest");
    guest.poll();
    assert!(!transport.is_connected());

    guest.dispatch(add("offline")).expect("offline add");
    assert_eq!(guest.view().queue.len(), 1);
    assert_eq!(guest.pending().unsent().count(), 1);
    assert!(mesh.state().queue.is_empty());
}
