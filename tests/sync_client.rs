//
// The sync client driven over an in-process channel, with the control plane played by a thread.
//
use std::sync::Arc;
use std::thread;

use vxwing::config::SyncConfig;
use vxwing::maps::{MapMirror, MirrorError, NoMirror};
use vxwing::policy::{PolicyKey, PolicyValue};
use vxwing::store::PolicyStore;
use vxwing::sync::{ChannelTransport, SyncClient, WatchRequest, WatchResponse};

mod common;
use common::{key, neighbor, update};

/// Remembers what it was asked to mirror, optionally failing every call.
#[derive(Default)]
struct Recorder {
    calls: Vec<(PolicyKey, PolicyValue)>,
    fail: bool,
}

impl MapMirror for Recorder {
    fn mirror(&mut self, key: &PolicyKey, value: &PolicyValue) -> Result<(), MirrorError> {
        self.calls.push((key.clone(), value.clone()));
        if self.fail {
            return Err(MirrorError::Mismatch(key.to_string()));
        }
        Ok(())
    }
}

fn request() -> WatchRequest {
    WatchRequest::from_config(&SyncConfig {
        group: String::from("group9"),
        ..Default::default()
    })
}

#[test]
fn stream_is_applied_in_order() {
    let (transport, server) = ChannelTransport::pair();
    let store = Arc::new(PolicyStore::new());
    let a = key(42, [10, 0, 0, 5]);
    let b = key(42, [10, 0, 0, 6]);

    let control = {
        let (a, b) = (a.clone(), b.clone());
        thread::spawn(move || {
            let req = server.subscription().unwrap();
            assert_eq!(req.group, "group9");
            assert_eq!(req.tables.len(), 2);

            server.send(WatchResponse {
                updates: vec![update(&a, 3, neighbor(1)), update(&b, 1, neighbor(7))],
            });
            server.send(WatchResponse {
                updates: vec![
                    update(&a, 2, neighbor(2)),
                    update(&b, 2, PolicyValue::Deleted),
                    update(&a, 3, neighbor(1)),
                ],
            });
            // dropping the server closes the stream
        })
    };

    let mut client = SyncClient::new(transport, store.clone(), Recorder::default(), request());
    let stats = client.run().unwrap();
    control.join().unwrap();

    assert_eq!(stats.responses, 2);
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.stale, 2);
    assert_eq!(stats.mirror_failures, 0);

    let (version, value) = store.get(&a).unwrap();
    assert_eq!((version, &*value), (3, &neighbor(1)));
    let (version, value) = store.get(&b).unwrap();
    assert_eq!(version, 2);
    assert!(value.is_deleted());

    assert_eq!(client.last_seen(&a), Some(3));
    assert_eq!(client.last_seen(&b), Some(2));

    // Only accepted updates reach the kernel maps, in acceptance order.
    let calls = &client.mirror().calls;
    assert_eq!(
        calls,
        &vec![
            (a.clone(), neighbor(1)),
            (b.clone(), neighbor(7)),
            (b, PolicyValue::Deleted),
        ]
    );
}

#[test]
fn mirror_failures_are_counted_not_fatal() {
    let (transport, server) = ChannelTransport::pair();
    let store = Arc::new(PolicyStore::new());
    let k = key(5, [10, 5, 0, 1]);

    server.send(WatchResponse {
        updates: vec![update(&k, 1, neighbor(1)), update(&k, 2, neighbor(2))],
    });
    drop(server);

    let recorder = Recorder {
        fail: true,
        ..Default::default()
    };
    let mut client = SyncClient::new(transport, store.clone(), recorder, request());
    let stats = client.run().unwrap();

    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.mirror_failures, 2);
    assert_eq!(store.version(&k), Some(2));
}

#[test]
fn subscribing_to_a_gone_control_plane_fails() {
    let (transport, server) = ChannelTransport::pair();
    drop(server);

    let store = Arc::new(PolicyStore::new());
    let mut client = SyncClient::new(transport, store.clone(), NoMirror, request());
    // The subscription cannot be delivered once the control plane is gone.
    assert!(client.run().is_err());
    assert!(store.is_empty());
}

#[test]
fn dataplane_reads_while_control_plane_writes() {
    let (transport, server) = ChannelTransport::pair();
    let store = Arc::new(PolicyStore::new());
    let k = key(42, [10, 0, 0, 5]);

    let sync = {
        let store = store.clone();
        thread::spawn(move || SyncClient::new(transport, store, NoMirror, request()).run())
    };

    server.subscription().unwrap();
    for v in 1..=200u64 {
        server.send(WatchResponse {
            updates: vec![update(&k, v, neighbor((v % 250) as u8))],
        });
    }
    drop(server);

    let mut last = 0;
    loop {
        let v = store.version(&k).unwrap_or(0);
        assert!(v >= last);
        last = v;
        if v == 200 {
            break;
        }
        thread::yield_now();
    }

    let stats = sync.join().unwrap().unwrap();
    assert_eq!(stats.accepted, 200);
}
