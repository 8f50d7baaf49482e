//! Black-box load generator for the WebSocket endpoint.
//!
//! Checks the open-file limit, ramps up `--bots` concurrent clients, keeps
//! them reading for `--duration` seconds and prints a throughput, latency and
//! memory report.

use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::StreamExt;
use tokio_tungstenite::connect_async;

#[derive(Debug, Parser)]
#[command(name = "loadtest", about = "Connection capacity and throughput benchmark")]
struct Args {
    /// Number of concurrent bots to spawn
    #[arg(short = 'n', long = "bots", default_value_t = 3000)]
    bots: u64,

    /// Milliseconds delay between spawns
    #[arg(long, default_value_t = 15)]
    ramp: u64,

    /// How long to run the test (in seconds) after ramping
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// WebSocket endpoint to attack
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicI64,
    failed: AtomicU64,
    messages: AtomicU64,
    connected: AtomicU64,
    handshake_ms: AtomicU64,
}

struct Report {
    total_time: Duration,
    target: u64,
    active: i64,
    connected: u64,
    failed: u64,
    messages: u64,
    avg_handshake_ms: f64,
    throughput: f64,
    memory_used: Option<u64>,
}

impl Report {
    fn diagnosis(&self) -> String {
        if self.failed > 0 {
            format!("Hit a wall. OS prevented {} connections.", self.failed)
        } else if self.connected < self.target {
            "Some bots didn't finish connecting. Ramp-up time was cut short.".to_string()
        } else {
            "Clean run. The server handled the target load.".to_string()
        }
    }

    fn print(&self) {
        println!("\n=================================================================");
        println!(" LIVE BENCHMARK RESULTS");
        println!("=================================================================");
        println!("  • Total Test Duration:       {}s", self.total_time.as_secs());
        println!("  • Successful Connections:    {}/{}", self.connected, self.target);
        println!("  • Still Connected:           {}", self.active);
        println!("  • Failed Connections:        {}", self.failed);
        println!("  • Avg Handshake Latency:     {:.2} ms\n", self.avg_handshake_ms);
        println!("  • Total Messages Received:   {}", self.messages);
        println!("  • Peak Throughput:           {:.2} msgs/sec\n", self.throughput);
        match self.memory_used {
            Some(used) => {
                println!("  • Tester Memory Used:        {} MB", used / 1024 / 1024);
                println!(
                    "  • Memory per Connection:     ~{:.2} KB",
                    memory_per_connection_kb(used, self.active)
                );
            }
            None => println!("  • Tester Memory Used:        unavailable"),
        }
        println!("\n[ DIAGNOSIS ]");
        println!("  {}", self.diagnosis());
        println!("=================================================================\n");
    }
}

/// Soft limit on open file descriptors, what `ulimit -n` reports.
#[cfg(unix)]
fn open_file_limit() -> Option<u64> {
    rlimit::getrlimit(rlimit::Resource::NOFILE).ok().map(|(soft, _)| soft)
}

#[cfg(not(unix))]
fn open_file_limit() -> Option<u64> {
    None
}

fn file_limit_warning(bots: u64, limit: u64) -> Option<String> {
    (bots > limit).then(|| {
        format!(
            "WARNING: You are asking for {} bots, but OS only allows {} open files.",
            bots, limit
        )
    })
}

/// Delay before bot `index` dials; also the full ramp-up when `index` is the bot count.
fn ramp_delay(index: u64, ramp_ms: u64) -> Duration {
    Duration::from_millis(index.saturating_mul(ramp_ms))
}

fn resident_memory() -> Option<u64> {
    memory_stats::memory_stats().map(|stats| stats.physical_mem as u64)
}

fn memory_per_connection_kb(used: u64, active: i64) -> f64 {
    if active > 0 {
        used as f64 / active as f64 / 1024.0
    } else {
        0.0
    }
}

async fn run_bot(id: u64, args: Arc<Args>, counters: Arc<Counters>) {
    tokio::time::sleep(ramp_delay(id, args.ramp)).await;

    let dial_start = Instant::now();
    let (mut ws_stream, _) = match connect_async(args.url.as_str()).await {
        Ok(conn) => conn,
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let handshake = u64::try_from(dial_start.elapsed().as_millis()).unwrap_or(u64::MAX);
    counters.active.fetch_add(1, Ordering::Relaxed);
    counters.connected.fetch_add(1, Ordering::Relaxed);
    counters.handshake_ms.fetch_add(handshake, Ordering::Relaxed);

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(message) if message.is_text() => {
                counters.messages.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    counters.active.fetch_sub(1, Ordering::Relaxed);
}

#[tokio::main]
async fn main() {
    let args = Arc::new(Args::parse());
    let counters = Arc::new(Counters::default());

    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    println!("\n=================================================================");
    println!(" TICKSTREAM : DYNAMIC CAPACITY & BENCHMARK TOOL");
    println!("=================================================================");
    println!("\n[ ENVIRONMENT LIMITS ]");
    println!("  • CPU Cores:                 {}", cores);
    match open_file_limit() {
        Some(limit) => {
            println!("  • Active OS File Limit:      {} (ulimit -n)", limit);
            if let Some(warning) = file_limit_warning(args.bots, limit) {
                println!("  ⚠️ {}", warning);
            }
        }
        None => println!("  • Active OS File Limit:      unknown"),
    }

    let base_memory = resident_memory();

    println!("\n[ STARTING LOAD TEST ]");
    println!("  • Target:                    {}", args.url);
    println!("  • Target Connections:        {}", args.bots);
    println!("  • Ramp-up delay:             {} ms/bot", args.ramp);

    let attack_start = Instant::now();

    for id in 0..args.bots {
        tokio::spawn(run_bot(id, args.clone(), counters.clone()));

        if id % 100 == 0 && id > 0 {
            print!("\r  -> Spawning bots: {}/{}", id, args.bots);
            let _ = std::io::stdout().flush();
        }
    }
    println!("\r  -> Spawning bots: {}/{} (Done)", args.bots, args.bots);

    let ramp_up = ramp_delay(args.bots, args.ramp);
    println!("  -> Waiting {:?} for all bots to connect...", ramp_up);
    println!("  -> Then collecting data for {} seconds...", args.duration);

    tokio::time::sleep(ramp_up).await;
    // Throughput is measured over the stable window only, not the ramp-up.
    let messages_before = counters.messages.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    let connected = counters.connected.load(Ordering::Relaxed);
    let messages = counters.messages.load(Ordering::Relaxed);
    let avg_handshake_ms = if connected > 0 {
        counters.handshake_ms.load(Ordering::Relaxed) as f64 / connected as f64
    } else {
        0.0
    };
    let throughput = if args.duration > 0 {
        (messages - messages_before) as f64 / args.duration as f64
    } else {
        0.0
    };
    let memory_used = match (base_memory, resident_memory()) {
        (Some(base), Some(peak)) => Some(peak.saturating_sub(base)),
        _ => None,
    };

    Report {
        total_time: attack_start.elapsed(),
        target: args.bots,
        active: counters.active.load(Ordering::Relaxed),
        connected,
        failed: counters.failed.load(Ordering::Relaxed),
        messages,
        avg_handshake_ms,
        throughput,
        memory_used,
    }
    .print();
}
