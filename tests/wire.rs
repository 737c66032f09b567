use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use courtbook::catalog::InMemoryCatalog;
use courtbook::engine::{Engine, EngineConfig};
use courtbook::identity::{StaticDirectory, UserRecord};
use courtbook::model::{Facility, FacilityId, FacilityStatus, Role};
use courtbook::notify::LogSender;
use courtbook::wire;

// ── Test infrastructure ──────────────────────────────────────

const DAY: &str = "2024-05-06";

fn directory() -> StaticDirectory {
    let dir = StaticDirectory::new();
    for (id, name, role, token) in [
        ("SW01", "Aina", Role::Student, "tok-aina"),
        ("SW02", "Bala", Role::Student, "tok-bala"),
        ("ADM1", "Warden", Role::Admin, "tok-warden"),
    ] {
        dir.add(UserRecord {
            id: id.into(),
            name: name.into(),
            role,
            token: token.into(),
        })
        .unwrap();
    }
    dir
}

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let catalog = InMemoryCatalog::new();
    catalog
        .upsert(Facility {
            id: FacilityId::new("court"),
            name: "Court".into(),
            kind: "badminton".into(),
            label: None,
            max_capacity: 2,
            status: FacilityStatus::Open,
        })
        .unwrap();
    let engine = Arc::new(Engine::ephemeral(
        Arc::new(catalog),
        Arc::new(LogSender),
        EngineConfig::default(),
    ));
    let factory = Arc::new(wire::CourtbookFactory::new(engine, Arc::new(directory())));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("courtbook")
        .user(user)
        .password(password);
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str, password: &str) -> tokio_postgres::Client {
    try_connect(addr, user, password).await.unwrap()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn reserve(client: &tokio_postgres::Client, start: &str, end: &str) -> Result<String, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            "INSERT INTO reservations (facility_id, date, start_time, end_time) \
             VALUES ('court', '{DAY}', '{start}', '{end}')"
        ))
        .await?;
    let row = rows(messages).into_iter().next().unwrap();
    assert_eq!(row.get("status"), Some("pending"));
    Ok(row.get("id").unwrap().to_string())
}

fn code(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.code()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn login_resolves_profile() {
    let addr = start_test_server().await;
    let client = connect(addr, "SW01", "tok-aina").await;
    let profile = query(&client, "SELECT * FROM profile").await;
    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].get("user_id"), Some("SW01"));
    assert_eq!(profile[0].get("name"), Some("Aina"));
    assert_eq!(profile[0].get("role"), Some("student"));
}

#[tokio::test]
async fn bad_credentials_rejected() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "SW01", "tok-bala").await.is_err());
    assert!(try_connect(addr, "nobody", "anything").await.is_err());
}

#[tokio::test]
async fn reserve_until_full_then_capacity_error() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;
    let bala = connect(addr, "SW02", "tok-bala").await;

    reserve(&aina, "08:00", "09:00").await.unwrap();
    reserve(&bala, "08:30", "09:30").await.unwrap();

    let full = query(
        &aina,
        &format!("SELECT * FROM availability WHERE facility_id = 'court' AND date = '{DAY}'"),
    )
    .await;
    assert_eq!(full.len(), 1);
    assert_eq!(full[0].get("start_time"), Some("08:00"));
    assert_eq!(full[0].get("end_time"), Some("09:00"));

    let admin = connect(addr, "ADM1", "tok-warden").await;
    let err = reserve(&admin, "08:15", "08:45").await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::EXCLUSION_VIOLATION));

    // Back-to-back with both reservations still fits.
    reserve(&admin, "09:30", "10:00").await.unwrap();
}

#[tokio::test]
async fn invalid_interval_and_duplicate_errors() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;

    let err = reserve(&aina, "10:00", "10:00").await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    reserve(&aina, "10:00", "11:00").await.unwrap();
    let err = reserve(&aina, "10:00", "10:30").await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn approval_and_cancellation_roles() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;
    let bala = connect(addr, "SW02", "tok-bala").await;
    let admin = connect(addr, "ADM1", "tok-warden").await;

    let id = reserve(&aina, "13:00", "14:00").await.unwrap();
    let approve = format!("INSERT INTO approvals (reservation_id) VALUES ('{id}')");

    let err = aina.simple_query(&approve).await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
    admin.simple_query(&approve).await.unwrap();

    let mine = query(&aina, "SELECT * FROM reservations").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("status"), Some("confirmed"));
    assert!(query(&bala, "SELECT * FROM reservations").await.is_empty());

    let cancel = format!("DELETE FROM reservations WHERE id = '{id}'");
    let err = bala.simple_query(&cancel).await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
    aina.simple_query(&cancel).await.unwrap();
    let err = aina.simple_query(&cancel).await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::NO_DATA_FOUND));

    let history = query(&admin, "SELECT * FROM reservations WHERE include_cancelled = true").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn facilities_overview_lists_catalog() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;
    reserve(&aina, "15:00", "16:00").await.unwrap();

    let overview = query(&aina, &format!("SELECT * FROM facilities WHERE date = '{DAY}'")).await;
    assert_eq!(overview.len(), 1);
    assert_eq!(overview[0].get("id"), Some("court"));
    assert_eq!(overview[0].get("max_capacity"), Some("2"));
    assert_eq!(overview[0].get("occupancy"), Some("1"));
}

#[tokio::test]
async fn unknown_facility_and_bad_sql() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;

    let err = aina
        .simple_query(&format!("SELECT * FROM availability WHERE facility_id = 'moon' AND date = '{DAY}'"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::UNDEFINED_OBJECT));

    let err = aina.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;
    let bala = connect(addr, "SW02", "tok-bala").await;
    reserve(&aina, "11:00", "12:00").await.unwrap();
    reserve(&bala, "11:00", "12:00").await.unwrap();

    let rows = aina
        .query(
            "SELECT * FROM availability WHERE facility_id = $1 AND date = $2",
            &[&"court", &DAY],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let start: String = rows[0].get("start_time");
    assert_eq!(start, "11:00");
}

#[tokio::test]
async fn bound_label_keeps_dollar_text() {
    let addr = start_test_server().await;
    let aina = connect(addr, "SW01", "tok-aina").await;

    let rows = aina
        .query(
            "INSERT INTO reservations (facility_id, date, start_time, end_time, label) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&"court", &DAY, &"17:00", &"18:00", &"x$1y"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let label: String = rows[0].get("requester_name");
    assert_eq!(label, "x$1y");
    let facility: String = rows[0].get("facility_id");
    assert_eq!(facility, "court");
}
