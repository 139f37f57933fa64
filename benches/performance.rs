use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use profbudget_core::id::{PeerId, Timestamp};
use profbudget_core::update::{ChunkMeta, Delta, UpdateMessage};
use profbudget_core::wire::{decode_line, encode_line};
use profbudget_mem::{BudgetController, Eviction};

const PEERS: u64 = 8;

/// A steady stream of releases from every peer; each chunk finishes 1ms after the last.
fn make_updates(rounds: u64, chunks_per_update: u64) -> Vec<(PeerId, UpdateMessage)> {
    let mut clock = 0;
    let mut out = Vec::with_capacity((rounds * PEERS) as usize);
    for round in 0..rounds {
        for p in 0..PEERS {
            let newly_released = (0..chunks_per_update)
                .map(|_| {
                    clock += 1;
                    ChunkMeta::new(Timestamp::from_millis(clock), 64 * 1024)
                })
                .collect();
            out.push((
                PeerId::new(p + 1),
                UpdateMessage::Delta(Delta {
                    unreleased_bytes: (round % 16) * 4096,
                    released_bytes_total: 0,
                    oldest_done: None,
                    newly_released,
                }),
            ));
        }
    }
    out
}

fn bench_eviction_loop(c: &mut Criterion) {
    let updates = make_updates(256, 4);
    // Room for roughly a quarter of everything released.
    let budget = 256 * PEERS * 4 * 64 * 1024 / 4;
    c.bench_function("controller_updates_with_eviction", |b| {
        b.iter_batched(
            || updates.clone(),
            |updates| {
                let mut ctl = BudgetController::new(budget);
                let mut evictions: Vec<Eviction> = Vec::new();
                for (peer, msg) in updates {
                    let _ = ctl.handle_update(peer, msg, &mut evictions);
                }
                evictions.len()
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_wire_decode(c: &mut Criterion) {
    let lines: Vec<String> = make_updates(16, 16)
        .into_iter()
        .filter_map(|(_, msg)| encode_line(msg).ok())
        .collect();
    c.bench_function("wire_decode_line", |b| {
        b.iter(|| {
            lines
                .iter()
                .filter_map(|l| decode_line(l).ok())
                .count()
        })
    });
}

criterion_group!(controller, bench_eviction_loop, bench_wire_decode);
criterion_main!(controller);
