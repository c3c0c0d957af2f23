//! End-to-end latency for store/get operations on a simulated testnet.
//!
//! Every lookup waits on actor wake ups (the poll interval), so the useful
//! signal is the relative difference between runs, not absolute values.
//!
//! Run: `cargo bench --bench latency`

use std::time::{Duration, Instant};

use kadtrie::{Dht, Testnet};

fn main() {
    println!("latency\n");

    for size in [10, 50] {
        let builder = Dht::builder()
            .request_timeout(Duration::from_millis(500))
            .poll_interval(Duration::from_millis(10));
        let testnet = Testnet::with_builder(size, builder).unwrap();
        let nodes = &testnet.nodes;

        // STORE
        let samples = 20;
        let mut timings = Vec::with_capacity(samples);

        for i in 0..samples {
            let key = format!("bench_{size}_{i}");
            let start = Instant::now();
            let _ = nodes[i % size].store(key.as_bytes(), b"bench_payload");
            timings.push(start.elapsed());
        }

        println!("store ({size} nodes)");
        print_stats(&timings);

        // Let the last stores land
        std::thread::sleep(Duration::from_millis(100));

        // GET
        let mut timings = Vec::with_capacity(samples);
        let mut misses = 0;

        for i in 0..samples {
            let key = format!("bench_{size}_{i}");
            let reader = (i + 1) % size;
            let start = Instant::now();
            let result = nodes[reader].get(key.as_bytes()).unwrap();
            timings.push(start.elapsed());
            if result.is_none() {
                misses += 1;
            }
        }

        println!("get ({size} nodes, {misses} misses)");
        print_stats(&timings);
    }
}

fn print_stats(timings: &[Duration]) {
    let mut us: Vec<_> = timings.iter().map(|d| d.as_micros()).collect();
    us.sort_unstable();
    let n = us.len();
    let mean = us.iter().sum::<u128>() / n as u128;

    println!(
        "n={n} min={:.2}ms mean={:.2}ms p50={:.2}ms p95={:.2}ms max={:.2}ms\n",
        us[0] as f64 / 1000.0,
        mean as f64 / 1000.0,
        us[n / 2] as f64 / 1000.0,
        us[n * 95 / 100] as f64 / 1000.0,
        us[n - 1] as f64 / 1000.0,
    );
}
