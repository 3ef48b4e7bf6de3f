use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn connect(host: &str, port: u16, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("openlend")
        .user(user)
        .password("openlend");

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

/// Register a user through the open directory and return their id.
async fn register(host: &str, port: u16, name: &str) -> Ulid {
    let client = connect(host, port, "anonymous").await;
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{id}', '{name}', '{name}.{id}@example.com')"
        ))
        .await
        .unwrap();
    id
}

/// List an item owned by `owner` and return its id.
async fn list_item(host: &str, port: u16, owner: Ulid, name: &str) -> Ulid {
    let client = connect(host, port, &owner.to_string()).await;
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{id}', '{name}', 'bench item', true)"
        ))
        .await
        .unwrap();
    id
}

async fn phase1_sequential(host: &str, port: u16) {
    let owner = register(host, port, "seq_owner").await;
    let booker = register(host, port, "seq_booker").await;
    let item = list_item(host, port, owner, "seq_drill").await;

    let client = connect(host, port, &booker.to_string()).await;
    let base = now_ms() + HOUR;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let bid = Ulid::new();
        let s = base + (i as i64) * HOUR;
        let e = s + HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{bid}', '{item}', {s}, {e})"#
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let owner = register(host, port, "conc_owner").await;
    let mut items = Vec::new();
    for i in 0..n_tasks {
        items.push(list_item(host, port, owner, &format!("conc_item{i}")).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();

    for (i, item) in items.into_iter().enumerate() {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let booker = register(&host, port, &format!("conc_booker{i}")).await;
            let client = connect(&host, port, &booker.to_string()).await;
            let base = now_ms() + HOUR;

            for j in 0..n_per_task {
                let bid = Ulid::new();
                let s = base + (j as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{bid}', '{item}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
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
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let owner = register(host, port, "read_owner").await;
    let booker = register(host, port, "read_booker").await;
    let item = list_item(host, port, owner, "read_drill").await;

    // Pre-populate bookings for the listing to chew on
    let setup_client = connect(host, port, &booker.to_string()).await;
    let base = now_ms() + HOUR;
    for i in 0..500 {
        let bid = Ulid::new();
        let s = base + (i as i64) * HOUR;
        setup_client
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{bid}', '{item}', {s}, {})"#,
                s + HOUR
            ))
            .await
            .unwrap();
    }

    // Background writer keeps appending while we measure reads
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let host = host.to_string();
        let stop = stop.clone();
        let booker = booker.to_string();
        tokio::spawn(async move {
            let client = connect(&host, port, &booker).await;
            let mut i = 600i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let bid = Ulid::new();
                let s = base + i * HOUR;
                let _ = client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{bid}', '{item}', {s}, {})"#,
                        s + HOUR
                    ))
                    .await;
                i += 1;
            }
        })
    };

    let reader = connect(host, port, &booker.to_string()).await;
    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        reader
            .simple_query("SELECT * FROM bookings WHERE state = 'FUTURE' LIMIT 50")
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = writer.await;

    print_latency("read latency under write load", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 20;

    let owner = register(host, port, "storm_owner").await;
    let item = list_item(host, port, owner, "storm_drill").await;

    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let booker = register(&host, port, &format!("storm_booker{i}")).await;
            let client = connect(&host, port, &booker.to_string()).await;
            let base = now_ms() + HOUR;

            for j in 0..ops_per_conn {
                let bid = Ulid::new();
                let s = base + (j as i64) * HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{bid}', '{item}', {s}, {})"#,
                        s + HOUR
                    ))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("OPENLEND_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("OPENLEND_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid OPENLEND_PORT");

    println!("=== openlend stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
