use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use valet::engine::Engine;
use valet::model::{LotId, UserId};
use valet::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn bench_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("valet_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("stress.wal");
    let _ = std::fs::remove_file(&path);
    path
}

async fn setup(engine: &Engine) -> Vec<LotId> {
    let capacities = [1u32, 1, 1, 1, 1, 5, 5, 5, 10, 10];
    let mut lots = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        let id = engine
            .create_lot(
                format!("Lot {i}"),
                format!("{i} Bench Street"),
                "560001".into(),
                40.0,
                cap,
            )
            .await
            .unwrap();
        lots.push(id.id);
    }
    println!("  created {} lots", lots.len());
    lots
}

async fn phase1_sequential(engine: &Engine, lot: LotId) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let user = UserId(1_000 + i as u64);
        let t = Instant::now();
        let booking = engine
            .reserve(user, lot, format!("KA-01-{i:04}"))
            .await
            .unwrap();
        engine.release(booking.id, user).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = (n * 2) as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} reserve+release pairs in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("cycle latency", &mut latencies);
}

async fn phase2_concurrent(engine: Arc<Engine>, lots: &[LotId]) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = engine.clone();
        let lot = lots[i % lots.len()];
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let user = UserId((10_000 + i * 1_000 + j) as u64);
                // A full lot is expected under contention; only the
                // winner releases.
                if let Ok(b) = engine.reserve(user, lot, format!("KA-02-{j:04}")).await {
                    engine.release(b.id, user).await.unwrap();
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} cycles = {total} total in {:.2}s = {ops:.0} cycles/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(engine: Arc<Engine>, lots: &[LotId]) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // Writers churn bookings in the background.
    let mut writer_handles = Vec::new();
    for w in 0..5usize {
        let engine = engine.clone();
        let stop = stop.clone();
        let lot = lots[5 + w % 5];
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0u64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let user = UserId(100_000 + w as u64 * 10_000 + i);
                if let Ok(b) = engine.reserve(user, lot, format!("KA-03-{i:04}")).await {
                    let _ = engine.release(b.id, user).await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        let lot = lots[r % lots.len()];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let occ = engine.occupancy(lot).await.unwrap();
                assert!(occ.available + occ.occupied > 0);
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("occupancy query", &mut all_latencies);
}

async fn phase4_replay(path: PathBuf) {
    let t = Instant::now();
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let lots = engine.list_lots().await;
    println!(
        "  replayed {} lots in {:.2}ms",
        lots.len(),
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    let path = bench_wal_path();

    println!("=== valet stress benchmark ===");
    println!("wal: {}\n", path.display());

    println!("[setup]");
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
    let lots = setup(&engine).await;

    println!("\n[phase 1] sequential reserve/release throughput");
    phase1_sequential(&engine, lots[9]).await; // cap=10 lot

    println!("\n[phase 2] concurrent cycles across lots");
    phase2_concurrent(engine.clone(), &lots).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(engine.clone(), &lots).await;

    println!("\n[phase 4] WAL replay");
    drop(engine);
    phase4_replay(path).await;

    println!("\n=== benchmark complete ===");
}
