// SPDX-FileCopyrightText: 2026 Flowtrack contributors
// SPDX-License-Identifier: GPL-3.0-or-later

#![cfg(feature = "bench")]

use criterion::{criterion_group, criterion_main, Criterion, BenchmarkId};
use std::hint::black_box;

#[macro_use]
#[path = "../src/log.rs"]
mod log;

#[path = "../src/opt.rs"]
mod opt;

#[path = "../src/pkt/flowtab.rs"]
pub mod flowtab;

use flowtab::{FlowKey, FlowTab, MAX_PROBES};

fn key(i: u32) -> FlowKey {
    FlowKey {
        src_ip: 0x0a00_0000 | i,
        dst_ip: 0x0808_0808,
        src_port: 40000,
        dst_port: 53,
        proto: 17,
    }
}

fn bench_flowtab_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("FlowTab_Core");

    let mut tab = FlowTab::new();
    let hot = key(1);
    tab.process_flow(hot, 0).unwrap();

    group.bench_function("process_flow_hit", |b| {
        b.iter(|| {
            _ = tab.process_flow(black_box(hot), black_box(1));
        })
    });

    let keys: Vec<FlowKey> = (0..4096).map(key).collect();
    let mut tab = FlowTab::new();
    let mut i = 0;

    group.bench_function("process_flow_churn", |b| {
        b.iter(|| {
            _ = tab.process_flow(black_box(keys[i % keys.len()]), 0);
            i += 1;
        })
    });

    group.finish();
}

/// Worst-case probe walks: every key hashes to the same slot, so a
/// refresh of the n-th key traverses n occupied slots.
pub fn bench_probe_depth(c: &mut Criterion) {
    fn collide(_: &FlowKey) -> u32 {
        0
    }

    let mut group = c.benchmark_group("FlowTab_Collisions");

    for &depth in &[1usize, 4, 16, MAX_PROBES] {
        let mut tab = FlowTab::with_hash(collide);
        for n in 0..depth as u32 {
            tab.process_flow(key(n), 0).unwrap();
        }

        let deepest = key(depth as u32 - 1);
        group.bench_function(BenchmarkId::new("refresh_at_depth", depth), |b| {
            b.iter(|| {
                _ = tab.process_flow(black_box(deepest), black_box(1));
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_flowtab_operations, bench_probe_depth);
criterion_main!(benches);
