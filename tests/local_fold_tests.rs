//! Local buffer callback folding tests

use profbudget_core::config::ControllerConfig;
use profbudget_core::id::{PeerId, Timestamp};
use profbudget_core::update::{ChunkMeta, Delta, UpdateMessage};
use profbudget_host::local::Drained;
use profbudget_host::{
    in_process_channel, LocalSlot, LocalSource, PeerRegistry, RecordingLocalSource,
    RegistryState,
};
use std::sync::Arc;
use std::thread;

const HOST: PeerId = PeerId::new(0);
const REMOTE: PeerId = PeerId::new(7);

fn delta(unreleased: u64, chunks: &[(u64, u64)]) -> UpdateMessage {
    UpdateMessage::Delta(Delta {
        unreleased_bytes: unreleased,
        newly_released: chunks
            .iter()
            .map(|&(ms, size)| ChunkMeta::new(Timestamp::from_millis(ms), size))
            .collect(),
        ..Default::default()
    })
}

fn active_registry(budget: u64) -> (PeerRegistry, Arc<RecordingLocalSource>) {
    let local = Arc::new(RecordingLocalSource::new());
    let mut reg = PeerRegistry::new(
        HOST,
        Some(local.clone() as Arc<dyn LocalSource>),
        ControllerConfig::default(),
    );
    let (ch, _peer) = in_process_channel();
    reg.peer_connected(REMOTE, Arc::new(ch)).expect("Connect failed");
    reg.sampling_started(budget);
    assert_eq!(reg.state(), RegistryState::Active);
    (reg, local)
}

#[test]
fn test_concurrent_callbacks_fold_every_chunk() {
    let source = Arc::new(RecordingLocalSource::new());
    let slot = LocalSlot::new();
    slot.attach();
    source.set_update_callback(Some(slot.callback()));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                for i in 0..50u64 {
                    source.emit(delta(t, &[(t * 1_000 + i, 1)]));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("Thread panicked");
    }

    let Drained::Update(UpdateMessage::Delta(d)) = slot.drain() else {
        panic!("expected a folded delta");
    };
    assert_eq!(d.newly_released.len(), 400);
    assert_eq!(d.newly_released_bytes(), 400);
    assert_eq!(slot.drain(), Drained::Nothing);
}

#[test]
fn test_pending_local_update_lands_before_the_remote_one() {
    let (mut reg, local) = active_registry(100);

    local.emit(delta(0, &[(1, 60)]));
    local.emit(delta(0, &[(3, 30)]));
    assert_eq!(reg.controller().unwrap().total_bytes(), 0);

    // 90 local + 20 remote is over budget; the local chunk at t=1 is oldest.
    reg.deliver_update(REMOTE, delta(0, &[(2, 20)]))
        .expect("Update failed");
    assert_eq!(local.destroyed(), vec![Timestamp::from_millis(1)]);
    assert_eq!(reg.controller().unwrap().total_bytes(), 50);
}

#[test]
fn test_flush_applies_without_a_remote_update() {
    let (mut reg, local) = active_registry(1_000);
    local.emit(delta(250, &[]));
    reg.flush_local();
    let snap = reg.snapshot();
    assert_eq!(snap.unreleased_total, 250);
}

#[test]
fn test_local_final_detaches_the_controller() {
    let (mut reg, local) = active_registry(100);
    local.emit(delta(0, &[(1, 50)]));
    reg.flush_local();
    assert_eq!(reg.controller().unwrap().total_bytes(), 50);

    // Replacing the callback tells the old listener it is done.
    local.set_update_callback(None);
    reg.deliver_update(REMOTE, delta(0, &[(2, 500)]))
        .expect("Update failed");

    let ctl = reg.controller().unwrap();
    assert!(ctl.is_detached());
    assert_eq!(ctl.total_bytes(), 0);
    assert!(local.destroyed().is_empty());
}

#[test]
fn test_stop_applies_pending_then_unhooks() {
    let (mut reg, local) = active_registry(1_000);
    local.emit(delta(10, &[(1, 10)]));
    reg.sampling_stopped();
    assert_eq!(reg.state(), RegistryState::Idle);
    assert!(!local.has_callback());

    // Nothing listens any more; emitting is harmless.
    local.emit(delta(99, &[]));
    assert!(reg.controller().is_none());
}
