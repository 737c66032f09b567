use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};

use courtbook::catalog::InMemoryCatalog;
use courtbook::engine::{Engine, EngineConfig};
use courtbook::identity::{StaticDirectory, UserRecord};
use courtbook::model::{Facility, FacilityId, FacilityStatus, Role};
use courtbook::notify::LogSender;
use courtbook::wire;

const USERS: usize = 64;

fn user(i: usize) -> (String, String) {
    (format!("U{i:03}"), format!("tok-{i:03}"))
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date")
}

/// Serve an in-process courtbook with `USERS` students and a small set of
/// facilities: `hall` (capacity 10), `court` (1) and `lab` (5).
async fn start_server() -> SocketAddr {
    let catalog = InMemoryCatalog::new();
    for (id, capacity) in [("hall", 10), ("court", 1), ("lab", 5)] {
        catalog
            .upsert(Facility {
                id: FacilityId::new(id),
                name: id.to_string(),
                kind: "bench".into(),
                label: None,
                max_capacity: capacity,
                status: FacilityStatus::Open,
            })
            .expect("upsert facility");
    }

    let directory = StaticDirectory::new();
    for i in 0..USERS {
        let (id, token) = user(i);
        directory
            .add(UserRecord {
                id: id.clone(),
                name: format!("Bench {id}"),
                role: Role::Student,
                token,
            })
            .expect("add user");
    }

    let engine = Arc::new(Engine::ephemeral(
        Arc::new(catalog),
        Arc::new(LogSender),
        EngineConfig {
            lock_wait: Duration::from_secs(1),
            ..EngineConfig::default()
        },
    ));
    let factory = Arc::new(wire::CourtbookFactory::new(engine, Arc::new(directory)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, i: usize) -> tokio_postgres::Client {
    let (id, token) = user(i % USERS);
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("courtbook")
        .user(&id)
        .password(&token);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn reserve_sql(facility: &str, date: NaiveDate, hour: u32) -> String {
    format!(
        "INSERT INTO reservations (facility_id, date, start_time, end_time) \
         VALUES ('{facility}', '{date}', '{hour:02}:00', '{:02}:00')",
        hour + 1
    )
}

async fn phase1_sequential(addr: SocketAddr) {
    let client = connect(addr, 0).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // One reservation per day, so a single member never repeats a start.
    for i in 0..n {
        let date = base_date() + Days::new(i as u64);
        let t = Instant::now();
        client
            .simple_query(&reserve_sql("hall", date, 9))
            .await
            .expect("reserve");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended_slot(addr: SocketAddr) {
    let n_tasks = USERS;
    let date = base_date() - Days::new(1);
    let admitted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let admitted = admitted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, i).await;
            let t = Instant::now();
            if client.simple_query(&reserve_sql("lab", date, 14)).await.is_ok() {
                admitted.fetch_add(1, Ordering::Relaxed);
            }
            t.elapsed()
        }));
    }

    let mut latencies = Vec::with_capacity(n_tasks);
    for h in handles {
        if let Ok(latency) = h.await {
            latencies.push(latency);
        }
    }

    let ok = admitted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} members racing for one capacity-5 slot: {ok} admitted in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    if ok != 5 {
        println!("  WARNING: expected exactly 5 admissions");
    }
    print_latency("admission latency", &mut latencies);
}

async fn phase3_concurrent_spread(addr: SocketAddr) {
    let n_tasks = 16;
    let n_per_task = 100;
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, i).await;
            let mut latencies = Vec::with_capacity(n_per_task);
            for j in 0..n_per_task {
                let date = base_date() + Days::new(5000 + j as u64);
                let hour = 8 + (i as u32 % 12);
                let t = Instant::now();
                let _ = client.simple_query(&reserve_sql("court", date, hour)).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        if let Ok(latencies) = h.await {
            all.extend(latencies);
        }
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} ops = {total} ops in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut all);
}

async fn phase4_read_under_load(addr: SocketAddr) {
    let date = base_date() + Days::new(9000);
    let writer = tokio::spawn(async move {
        let client = connect(addr, 1).await;
        for hour in 0..24 {
            let _ = client.simple_query(&reserve_sql("hall", date, hour)).await;
        }
    });

    let reader = connect(addr, 2).await;
    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let sql = format!("SELECT * FROM availability WHERE facility_id = 'hall' AND date = '{date}'");
    for _ in 0..n {
        let t = Instant::now();
        reader.simple_query(&sql).await.expect("availability");
        latencies.push(t.elapsed());
    }
    let _ = writer.await;

    print_latency("availability latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== courtbook stress benchmark ===");
    let addr = start_server().await;
    println!("target: {addr}\n");

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(addr).await;

    println!("\n[phase 2] contended slot");
    phase2_contended_slot(addr).await;

    println!("\n[phase 3] concurrent admissions across partitions");
    phase3_concurrent_spread(addr).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(addr).await;

    println!("\n=== benchmark complete ===");
}
