//! Scheduler micro-benchmarks: creation, yield, and tick costs.

use kthreads::{Kernel, KernelConfig, PRI_DEFAULT};
use std::time::Instant;

fn noop(_aux: usize) {}

fn main() {
    println!("=== kthreads scheduler benchmarks ===\n");

    println!("Benchmark 1: thread creation");
    let mut kernel = Kernel::new(KernelConfig::DEFAULT);
    kernel.init().unwrap();
    kernel.start().unwrap();
    let start = Instant::now();
    let mut created: u32 = 0;
    while kernel.create("worker", PRI_DEFAULT, noop, 0).is_ok() {
        created += 1;
    }
    let elapsed = start.elapsed();
    println!("created {} threads in {:?}", created, elapsed);
    println!("average per thread: {:?}\n", elapsed / created);

    println!("Benchmark 2: yield round-robin");
    const YIELDS: u32 = 100_000;
    let start = Instant::now();
    for _ in 0..YIELDS {
        kernel.yield_now();
    }
    let elapsed = start.elapsed();
    println!("{} yields in {:?}", YIELDS, elapsed);
    println!("average per yield: {:?}\n", elapsed / YIELDS);

    println!("Benchmark 3: timer tick with sleepers");
    let mut kernel = Kernel::new(KernelConfig::DEFAULT);
    kernel.init().unwrap();
    kernel.start().unwrap();
    for i in 0..8usize {
        kernel.create("sleeper", PRI_DEFAULT + 1, noop, i).unwrap();
    }
    // The first create preempted main, so the processor is on the
    // sleeper band; park them across staggered deadlines so the tick
    // path has queue work to do.
    for i in 0..8i64 {
        kernel.sleep(50 + i * 25);
    }
    const TICKS: u32 = 100_000;
    let start = Instant::now();
    for _ in 0..TICKS {
        kernel.tick();
    }
    let elapsed = start.elapsed();
    println!("{} ticks in {:?}", TICKS, elapsed);
    println!("average per tick: {:?}", elapsed / TICKS);
    let stats = kernel.stats();
    println!(
        "context switches: {}, idle ticks: {}",
        stats.context_switches, stats.idle_ticks
    );
}
