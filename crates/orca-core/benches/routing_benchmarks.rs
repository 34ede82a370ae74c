use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use orca_core::{ReservationCollection, ReservationCoordinator, ReservationManager, SystemMap};
use orca_schema::{LabwareId, LocationName, ResourceName, ThreadId};
use std::sync::Arc;

const SIDE: usize = 8;

fn cell(row: usize, col: usize) -> LocationName {
    LocationName::new(format!("cell_{row}_{col}"))
}

/// An 8x8 grid where each row and each column is served by its own arm.
fn grid() -> SystemMap {
    let mut map = SystemMap::new();
    for row in 0..SIDE {
        let positions: Vec<LocationName> = (0..SIDE).map(|col| cell(row, col)).collect();
        map.add_transporter(&ResourceName::new(format!("row_arm_{row}")), &positions)
            .unwrap();
    }
    for col in 0..SIDE {
        let positions: Vec<LocationName> = (0..SIDE).map(|row| cell(row, col)).collect();
        map.add_transporter(&ResourceName::new(format!("col_arm_{col}")), &positions)
            .unwrap();
    }
    map
}

fn bench_shortest_any_paths(c: &mut Criterion) {
    let map = grid();
    let (src, dst) = (cell(0, 0), cell(SIDE - 1, SIDE - 1));
    c.bench_function("shortest_any_paths_8x8_corner_to_corner", |b| {
        b.iter(|| map.get_all_shortest_any_paths(&src, &dst).unwrap());
    });
}

fn bench_shortest_available_paths(c: &mut Criterion) {
    let map = grid();
    for i in 1..SIDE - 1 {
        map.get_location(&cell(i, i))
            .unwrap()
            .notify_placed(&LabwareId::generate())
            .unwrap();
    }
    let (src, dst) = (cell(0, 0), cell(SIDE - 1, SIDE - 1));
    c.bench_function("shortest_available_paths_8x8_diagonal_blocked", |b| {
        b.iter(|| map.get_all_shortest_available_paths(&src, &dst).unwrap());
    });
}

fn bench_deadlock_resolution_paths(c: &mut Criterion) {
    let map = grid();
    let src = cell(SIDE / 2, SIDE / 2);
    c.bench_function("deadlock_resolution_paths_8x8", |b| {
        b.iter(|| map.get_shortest_paths_to_deadlock_resolution(&src).unwrap());
    });
}

/// 32 collections competing for the first row of the grid.
fn bench_tick(c: &mut Criterion) {
    let map = Arc::new(grid());
    c.bench_function("coordinator_tick_32_contending", |b| {
        b.iter_batched(
            || {
                let manager = Arc::new(ReservationManager::new(Arc::clone(&map)));
                let coordinator = ReservationCoordinator::new(manager);
                let pending: Vec<_> = (0..32)
                    .map(|i| {
                        let candidates = (0..SIDE).map(|col| cell(0, (col + i) % SIDE));
                        let collection = ReservationCollection::new(
                            ThreadId::generate(),
                            Some(LabwareId::generate()),
                            candidates,
                        );
                        coordinator.submit_reservation_request(collection).unwrap()
                    })
                    .collect();
                (coordinator, pending)
            },
            |(coordinator, _pending)| coordinator.tick(),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_shortest_any_paths,
    bench_shortest_available_paths,
    bench_deadlock_resolution_paths,
    bench_tick,
);
criterion_main!(benches);
