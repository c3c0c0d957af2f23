//! Spin up a network of peers on a simulated network, store a few values,
//! knock some peers offline and read the values back.
//!
//! Run: `cargo run --example simulate -- --nodes 50 --k 8`

use std::time::{Duration, Instant};

use clap::Parser;
use tracing::Level;

use kadtrie::{Dht, Testnet};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of peers in the network
    #[arg(long, default_value_t = 30)]
    nodes: usize,
    /// Bucket capacity
    #[arg(long, default_value_t = 8)]
    k: usize,
    /// Concurrent queries per lookup
    #[arg(long, default_value_t = 3)]
    alpha: usize,
    /// Width of the key space in bits
    #[arg(long, default_value_t = 160)]
    bits: u8,
    /// Number of values to store and read back
    #[arg(long, default_value_t = 10)]
    values: usize,
    /// Number of peers to shut down before reading
    #[arg(long, default_value_t = 5)]
    offline: usize,
    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
    /// Show debug logs
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let builder = Dht::builder()
        .k(cli.k)
        .alpha(cli.alpha)
        .key_space_bits(cli.bits)
        .request_timeout(Duration::from_millis(cli.timeout))
        .poll_interval(Duration::from_millis(10));

    let start = Instant::now();
    let testnet = Testnet::with_builder(cli.nodes, builder).expect("failed to create testnet");
    println!(
        "Created {} peers in {:?}",
        testnet.nodes.len(),
        start.elapsed()
    );

    for dht in testnet.nodes.iter().take(5) {
        let info = dht.info().expect("peer stopped");
        println!(
            "  {} at {}: {} nodes in {} buckets",
            info.id(),
            info.local_addr(),
            info.routing_tree_size(),
            info.buckets()
        );
    }

    let nodes = &testnet.nodes;

    println!("\n=== STORE ===");
    for i in 0..cli.values {
        let key = format!("key-{i}");
        let value = format!("value-{i}");
        let stored_at = nodes[i % nodes.len()]
            .store(key.as_bytes(), value.as_bytes())
            .expect("peer stopped");

        println!("{key} stored at {} peers", stored_at.len());
    }

    std::thread::sleep(Duration::from_millis(100));

    println!("\n=== OFFLINE ===");
    let offline = cli.offline.min(nodes.len().saturating_sub(1));
    for dht in nodes.iter().rev().take(offline) {
        println!("shutting down {}", dht.id());
        dht.shutdown();
    }

    println!("\n=== GET ===");
    let online = nodes.len() - offline;
    let mut found = 0;
    for i in 0..cli.values {
        let key = format!("key-{i}");
        let reader = &nodes[(i + 1) % online];

        let start = Instant::now();
        let value = reader.get(key.as_bytes()).expect("peer stopped");

        match value {
            Some(value) => {
                found += 1;
                println!(
                    "{key} = {:?} in {:?}",
                    String::from_utf8_lossy(&value),
                    start.elapsed()
                );
            }
            None => println!("{key} not found in {:?}", start.elapsed()),
        }
    }

    println!("\nFound {found}/{} values", cli.values);
}
