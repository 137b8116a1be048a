use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ember_mem::PhysicalMemory;
use ember_mmu::{AccessType, Mmu, CR0_PG, PTE_P, PTE_RW};

fn criterion_config() -> Criterion {
    match std::env::var("EMBER_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

const PAGES: u32 = 64;

fn setup() -> (Mmu, PhysicalMemory) {
    let mut mem = PhysicalMemory::new(0x20_0000).expect("alloc guest RAM");
    let pd = 0x1000u64;
    let pt = 0x2000u64;
    mem.try_write_u32(pd, (pt | PTE_P | PTE_RW) as u32)
        .expect("write PDE");
    for i in 0..u64::from(PAGES) {
        let paddr = 0x10_0000 + i * 0x1000;
        mem.try_write_u32(pt + i * 4, (paddr | PTE_P | PTE_RW) as u32)
            .expect("write PTE");
    }
    let mut mmu = Mmu::new();
    mmu.set_cr3(pd as u32);
    mmu.set_cr0(CR0_PG | 1);
    (mmu, mem)
}

fn bench_tlb(c: &mut Criterion) {
    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(u64::from(PAGES)));

    group.bench_function("hit", |b| {
        let (mut mmu, mut mem) = setup();
        for i in 0..PAGES {
            let _ = mmu.translate(&mut mem, i << 12, AccessType::Read, 0);
        }
        b.iter(|| {
            for i in 0..PAGES {
                black_box(mmu.translate(&mut mem, black_box(i << 12), AccessType::Read, 0))
                    .ok();
            }
        })
    });

    group.bench_function("walk_after_cr3_write", |b| {
        let (mut mmu, mut mem) = setup();
        b.iter(|| {
            mmu.set_cr3(0x1000);
            for i in 0..PAGES {
                black_box(mmu.translate(&mut mem, black_box(i << 12), AccessType::Read, 0))
                    .ok();
            }
        })
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb
}
criterion_main!(benches);
