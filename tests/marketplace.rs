use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use openlend::engine::Engine;
use openlend::wire;

// ── Test infrastructure ──────────────────────────────────────

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("openlend_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("openlend.wal")).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "openlend".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

/// Connect with a session identity. Pass a non-ULID user (e.g. "anonymous")
/// to get a connection without one.
async fn connect_as(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("openlend")
        .user(user)
        .password("openlend");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Register a user through the open directory and return their id.
async fn register(addr: SocketAddr, name: &str) -> Ulid {
    let client = connect_as(addr, "anonymous").await;
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{id}', '{name}', '{name}.{id}@example.com')"
        ))
        .await
        .unwrap();
    id
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

// ── End-to-end scenarios ─────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, _engine) = start_test_server().await;

    let owner = register(addr, "anna").await;
    let booker = register(addr, "bob").await;

    let owner_client = connect_as(addr, &owner.to_string()).await;
    let booker_client = connect_as(addr, &booker.to_string()).await;

    let item = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{item}', 'drill', 'cordless drill', true)"
        ))
        .await
        .unwrap();

    // Booker reserves tomorrow
    let now = now_ms();
    let booking = Ulid::new();
    booker_client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{booking}', '{item}', {}, {})"#,
            now + HOUR,
            now + DAY,
        ))
        .await
        .unwrap();

    let rows = data_rows(
        booker_client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("WAITING"));
    assert_eq!(rows[0].get("item_name"), Some("drill"));
    assert_eq!(rows[0].get("booker_id"), Some(booker.to_string().as_str()));

    // Owner approves
    owner_client
        .batch_execute(&format!("UPDATE bookings SET approved = true WHERE id = '{booking}'"))
        .await
        .unwrap();

    let rows = data_rows(
        owner_client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("APPROVED"));

    // Second approval is a conflict, not a no-op
    let again = owner_client
        .batch_execute(&format!("UPDATE bookings SET approved = true WHERE id = '{booking}'"))
        .await;
    let msg = again.unwrap_err().to_string();
    assert!(msg.contains("already"), "unexpected error: {msg}");
}

#[tokio::test]
async fn unavailable_item_rejects_booking() {
    let (addr, _engine) = start_test_server().await;
    let owner = register(addr, "anna").await;
    let booker = register(addr, "bob").await;

    let owner_client = connect_as(addr, &owner.to_string()).await;
    let item = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{item}', 'drill', 'in repair', false)"
        ))
        .await
        .unwrap();

    let booker_client = connect_as(addr, &booker.to_string()).await;
    let now = now_ms();
    let result = booker_client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{}', '{item}', {}, {})"#,
            Ulid::new(),
            now + HOUR,
            now + DAY,
        ))
        .await;
    assert!(result.is_err());

    // Nothing was written
    let rows = data_rows(
        booker_client
            .simple_query("SELECT * FROM bookings WHERE role = 'booker'")
            .await
            .unwrap(),
    );
    assert!(rows.is_empty());
}

#[tokio::test]
async fn third_party_cannot_see_a_booking() {
    let (addr, _engine) = start_test_server().await;
    let owner = register(addr, "anna").await;
    let booker = register(addr, "bob").await;
    let stranger = register(addr, "carol").await;

    let owner_client = connect_as(addr, &owner.to_string()).await;
    let item = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{item}', 'drill', 'cordless', true)"
        ))
        .await
        .unwrap();

    let booker_client = connect_as(addr, &booker.to_string()).await;
    let now = now_ms();
    let booking = Ulid::new();
    booker_client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{booking}', '{item}', {}, {})"#,
            now + HOUR,
            now + DAY,
        ))
        .await
        .unwrap();

    let stranger_client = connect_as(addr, &stranger.to_string()).await;
    let denied = stranger_client
        .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
        .await;
    let msg = denied.unwrap_err().to_string();
    assert!(msg.contains("not a party"), "unexpected error: {msg}");
}

#[tokio::test]
async fn state_listing_and_unknown_state() {
    let (addr, _engine) = start_test_server().await;
    let owner = register(addr, "anna").await;
    let booker = register(addr, "bob").await;

    let owner_client = connect_as(addr, &owner.to_string()).await;
    let item = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{item}', 'drill', 'cordless', true)"
        ))
        .await
        .unwrap();

    let booker_client = connect_as(addr, &booker.to_string()).await;
    let now = now_ms();
    for i in 1..=3 {
        booker_client
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, item_id, start, "end") VALUES ('{}', '{item}', {}, {})"#,
                Ulid::new(),
                now + i * DAY,
                now + i * DAY + HOUR,
            ))
            .await
            .unwrap();
    }

    let future = data_rows(
        booker_client
            .simple_query("SELECT * FROM bookings WHERE role = 'booker' AND state = 'FUTURE'")
            .await
            .unwrap(),
    );
    assert_eq!(future.len(), 3);

    let waiting = data_rows(
        booker_client
            .simple_query("SELECT * FROM bookings WHERE state = 'WAITING' LIMIT 2")
            .await
            .unwrap(),
    );
    assert_eq!(waiting.len(), 2);

    let past = data_rows(
        booker_client
            .simple_query("SELECT * FROM bookings WHERE state = 'PAST'")
            .await
            .unwrap(),
    );
    assert!(past.is_empty());

    // Owner role sees the same bookings from the other side
    let as_owner = data_rows(
        owner_client
            .simple_query("SELECT * FROM bookings WHERE role = 'owner' AND state = 'ALL'")
            .await
            .unwrap(),
    );
    assert_eq!(as_owner.len(), 3);

    let unknown = booker_client
        .simple_query("SELECT * FROM bookings WHERE state = 'SOMETIME'")
        .await;
    let msg = unknown.unwrap_err().to_string();
    assert!(msg.contains("Unknown state: SOMETIME"), "unexpected error: {msg}");
}

#[tokio::test]
async fn commands_needing_identity_reject_anonymous_sessions() {
    let (addr, _engine) = start_test_server().await;
    let client = connect_as(addr, "anonymous").await;

    // The directory is open...
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{id}', 'anna', 'anna.{id}@example.com')"
        ))
        .await
        .unwrap();

    // ...but acting in the marketplace is not
    let result = client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{}', 'drill', 'cordless', true)",
            Ulid::new()
        ))
        .await;
    let msg = result.unwrap_err().to_string();
    assert!(msg.contains("session identity"), "unexpected error: {msg}");
}

#[tokio::test]
async fn user_directory_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect_as(addr, "anonymous").await;

    let anna = Ulid::new();
    let bob = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{anna}', 'anna', 'anna@example.com')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{bob}', 'bob', 'bob@example.com')"
        ))
        .await
        .unwrap();

    // Duplicate email is refused
    let dup = client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{}', 'mallory', 'anna@example.com')",
            Ulid::new()
        ))
        .await;
    assert!(dup.is_err());

    let listed = data_rows(client.simple_query("SELECT * FROM users").await.unwrap());
    assert_eq!(listed.len(), 2);

    client
        .batch_execute(&format!("UPDATE users SET name = 'anne' WHERE id = '{anna}'"))
        .await
        .unwrap();
    let one = data_rows(
        client
            .simple_query(&format!("SELECT * FROM users WHERE id = '{anna}'"))
            .await
            .unwrap(),
    );
    assert_eq!(one[0].get("name"), Some("anne"));

    client
        .batch_execute(&format!("DELETE FROM users WHERE id = '{bob}'"))
        .await
        .unwrap();
    let gone = client
        .simple_query(&format!("SELECT * FROM users WHERE id = '{bob}'"))
        .await;
    assert!(gone.is_err());
}

#[tokio::test]
async fn catalog_search_and_comment_gate() {
    let (addr, _engine) = start_test_server().await;
    let owner = register(addr, "anna").await;
    let renter = register(addr, "bob").await;

    let owner_client = connect_as(addr, &owner.to_string()).await;
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{}', 'Power Drill', '800W hammer drill', true)",
            Ulid::new()
        ))
        .await
        .unwrap();
    let hidden = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available) VALUES ('{hidden}', 'old drill', 'parts only', false)"
        ))
        .await
        .unwrap();

    // Search is open to anonymous browsers and skips unavailable items
    let anon = connect_as(addr, "anonymous").await;
    let hits = data_rows(
        anon.simple_query("SELECT * FROM items WHERE search = 'drill'")
            .await
            .unwrap(),
    );
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get("name"), Some("Power Drill"));

    // Owner's own catalog lists both
    let mine = data_rows(owner_client.simple_query("SELECT * FROM items").await.unwrap());
    assert_eq!(mine.len(), 2);

    // No completed booking yet, so commenting is refused
    let renter_client = connect_as(addr, &renter.to_string()).await;
    let refused = renter_client
        .batch_execute(&format!(
            "INSERT INTO comments (id, item_id, text) VALUES ('{}', '{hidden}', 'rented this last month')",
            Ulid::new()
        ))
        .await;
    let msg = refused.unwrap_err().to_string();
    assert!(msg.contains("no completed booking"), "unexpected error: {msg}");
}

#[tokio::test]
async fn requests_fan_out_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let asker = register(addr, "anna").await;
    let responder = register(addr, "bob").await;

    let asker_client = connect_as(addr, &asker.to_string()).await;
    let request = Ulid::new();
    asker_client
        .batch_execute(&format!(
            "INSERT INTO requests (id, description) VALUES ('{request}', 'need a ladder for the weekend')"
        ))
        .await
        .unwrap();

    // Responder browses other people's requests and lists an item for it
    let responder_client = connect_as(addr, &responder.to_string()).await;
    let feed = data_rows(
        responder_client
            .simple_query("SELECT * FROM requests WHERE scope = 'all'")
            .await
            .unwrap(),
    );
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].get("id"), Some(request.to_string().as_str()));

    let ladder = Ulid::new();
    responder_client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description, available, request_id) VALUES ('{ladder}', 'ladder', '3m aluminium', true, '{request}')"
        ))
        .await
        .unwrap();

    // The asker sees the response attached to their request
    let own = data_rows(
        asker_client
            .simple_query("SELECT * FROM requests")
            .await
            .unwrap(),
    );
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].get("items"), Some("1"));

    let responses = data_rows(
        asker_client
            .simple_query(&format!("SELECT * FROM items WHERE request_id = '{request}'"))
            .await
            .unwrap(),
    );
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].get("name"), Some("ladder"));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("openlend_restart_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("openlend.wal");

    let owner = Ulid::new();
    let booker = Ulid::new();
    let item = Ulid::new();
    let booking = Ulid::new();
    let now = now_ms();
    {
        let engine = Engine::new(wal.clone()).unwrap();
        engine
            .create_user(owner, "anna".into(), "anna@example.com".into())
            .await
            .unwrap();
        engine
            .create_user(booker, "bob".into(), "bob@example.com".into())
            .await
            .unwrap();
        engine
            .create_item(item, owner, "drill".into(), "cordless".into(), true, None)
            .await
            .unwrap();
        engine
            .create_booking(
                booking,
                booker,
                item,
                openlend::model::Window::new(now + HOUR, now + DAY),
            )
            .await
            .unwrap();
        engine.decide_booking(owner, booking, true).await.unwrap();
    }

    // Fresh process, same WAL, served over the wire
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Arc::new(Engine::new(wal).unwrap());
    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "openlend".to_string(), None).await;
            });
        }
    });

    let client = connect_as(addr, &booker.to_string()).await;
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("APPROVED"));
}
