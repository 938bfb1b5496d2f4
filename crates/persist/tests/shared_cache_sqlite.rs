mod common;

use common::{seed, server, server_with, text};
use persist_core::{CacheIsolation, Entity, EntityRef, PrimaryKey, Value, sync};
use persist_query::{CacheRetrieveMode, CacheStoreMode, DatabaseQuery, apply_hints, hints};
use persist_session::{ServerSession, SessionConfig};
use std::collections::HashMap;
use std::sync::Arc;

fn read_employee(
    server: &ServerSession,
    id: i64,
    retrieve: CacheRetrieveMode,
    store: CacheStoreMode,
) -> EntityRef {
    let mut query = DatabaseQuery::clone(&server.read_object_query("Employee").unwrap());
    query.set_cache_retrieve_mode(retrieve);
    query.set_cache_store_mode(store);
    query
        .execute(server, &[Value::BigInt(id)])
        .unwrap()
        .into_object()
        .unwrap()
        .expect("employee exists")
}

fn key(id: i64) -> PrimaryKey {
    PrimaryKey::single(id)
}

#[test]
fn cache_mode_matrix() {
    let (server, conn) = server();
    seed(&conn);
    let cached = server.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();

    // Another client renames the employee without storing into the cache.
    {
        let properties =
            HashMap::from([(hints::CACHE_STORE_MODE.to_string(), "BYPASS".to_string())]);
        let mut uow = server.acquire_unit_of_work(properties);
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        sync::write(&working).set("name", "Augusta");
        let stats = uow.commit().unwrap();
        assert_eq!(stats.merged, 0);
        assert_eq!(stats.skipped, 1);
    }
    assert!(Arc::ptr_eq(
        &server.cache().get("Employee", &key(1)).unwrap(),
        &cached
    ));
    assert_eq!(text(&cached, "name").as_deref(), Some("Ada"));

    // USE/BYPASS answers from the cache, stale state included.
    let hit = read_employee(&server, 1, CacheRetrieveMode::Use, CacheStoreMode::Bypass);
    assert!(Arc::ptr_eq(&hit, &cached));
    assert_eq!(text(&hit, "name").as_deref(), Some("Ada"));

    // BYPASS/BYPASS reads the database and leaves the cache alone.
    let detached = read_employee(&server, 1, CacheRetrieveMode::Bypass, CacheStoreMode::Bypass);
    assert!(!Arc::ptr_eq(&detached, &cached));
    assert_eq!(text(&detached, "name").as_deref(), Some("Augusta"));
    let again = read_employee(&server, 1, CacheRetrieveMode::Use, CacheStoreMode::Use);
    assert!(Arc::ptr_eq(&again, &cached));
    assert_eq!(text(&again, "name").as_deref(), Some("Ada"));

    // BYPASS/USE reads the database and overwrites the cached instance.
    let stored = read_employee(&server, 1, CacheRetrieveMode::Bypass, CacheStoreMode::Use);
    assert!(Arc::ptr_eq(&stored, &cached));
    assert_eq!(text(&stored, "name").as_deref(), Some("Augusta"));
    let after = read_employee(&server, 1, CacheRetrieveMode::Use, CacheStoreMode::Use);
    assert!(Arc::ptr_eq(&after, &cached));
    assert_eq!(text(&after, "name").as_deref(), Some("Augusta"));
}

#[test]
fn session_defaults_apply_when_the_query_says_nothing() {
    let config = SessionConfig::new().retrieve_mode(CacheRetrieveMode::Bypass);
    let (server, conn) = server_with(config);
    seed(&conn);
    let first = server.find("Employee", &[Value::BigInt(2)]).unwrap().unwrap();
    conn.execute_raw("UPDATE employees SET name = 'Hopper' WHERE id = 2")
        .unwrap();
    let second = server.find("Employee", &[Value::BigInt(2)]).unwrap().unwrap();
    assert_eq!(text(&second, "name").as_deref(), Some("Hopper"));
    assert!(Arc::ptr_eq(&first, &second));

    // An explicit query setting beats the session default.
    conn.execute_raw("UPDATE employees SET name = 'Grace' WHERE id = 2")
        .unwrap();
    let hit = read_employee(&server, 2, CacheRetrieveMode::Use, CacheStoreMode::Use);
    assert_eq!(text(&hit, "name").as_deref(), Some("Hopper"));
}

#[test]
fn isolation_propagates_to_owners_of_isolated_targets() {
    let (server, conn) = server();
    let project = server.project_arc();
    assert_eq!(
        project.require("Account").unwrap().cache_isolation(),
        CacheIsolation::Isolated
    );
    assert_eq!(
        project.require("Payment").unwrap().cache_isolation(),
        CacheIsolation::Protected
    );
    assert!(!project.is_shared_isolation("Payment"));
    assert!(project.is_shared_isolation("Employee"));
    assert!(project.is_shared_isolation("Department"));

    conn.execute_raw("INSERT INTO accounts (id, holder) VALUES (1, 'Ada')")
        .unwrap();
    let account = server.find("Account", &[Value::BigInt(1)]).unwrap().unwrap();
    assert_eq!(text(&account, "holder").as_deref(), Some("Ada"));
    assert!(!server.cache().contains("Account", &key(1)));

    // Every read of an isolated type is a new instance.
    let again = server.find("Account", &[Value::BigInt(1)]).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&account, &again));
}

#[test]
fn protected_relationships_are_kept_out_of_the_shared_copy() {
    let (server, _conn) = server();
    {
        let mut uow = server.acquire_unit_of_work(HashMap::new());
        uow.register_new_object(Entity::new("Account").with("id", 1i64).with("holder", "Ada"))
            .unwrap();
        let mut payment = Entity::new("Payment").with("id", 10i64).with("amount", 25.0);
        payment.set_reference_key("account", Value::BigInt(1));
        uow.register_new_object(payment).unwrap();
        uow.commit().unwrap();
    }

    assert!(!server.cache().contains("Account", &key(1)));
    let entry = server.cache().lookup("Payment", &key(10)).expect("payment cached");
    assert!(sync::read(&entry.object).get("account").is_none());
    assert_eq!(
        entry.protected_foreign_keys.get("account"),
        Some(&Value::BigInt(1))
    );

    // A server read resolves the relationship without publishing it.
    let account = server
        .load_reference(&entry.object, "account")
        .unwrap()
        .expect("account found");
    assert_eq!(text(&account, "holder").as_deref(), Some("Ada"));
    assert!(sync::read(&entry.object).get("account").is_none());

    // A unit of work gets the relationship back on its working copy.
    let uow = server.acquire_unit_of_work(HashMap::new());
    let working = uow.find("Payment", &[Value::BigInt(10)]).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&working, &entry.object));
    assert_eq!(
        sync::read(&working).reference("account").and_then(|h| h.key()),
        Some(&Value::BigInt(1))
    );
    let account = uow.load_reference(&working, "account").unwrap().unwrap();
    assert_eq!(text(&account, "holder").as_deref(), Some("Ada"));
    assert!(sync::read(&entry.object).get("account").is_none());
}

#[test]
fn delete_evicts_whatever_the_store_mode() {
    for store in ["USE", "BYPASS", "REFRESH"] {
        let (server, conn) = server();
        seed(&conn);
        server.find("Employee", &[Value::BigInt(3)]).unwrap().unwrap();
        assert!(server.cache().contains("Employee", &key(3)));

        let properties = HashMap::from([(hints::CACHE_STORE_MODE.to_string(), store.to_string())]);
        let mut uow = server.acquire_unit_of_work(properties);
        let doomed = uow.find("Employee", &[Value::BigInt(3)]).unwrap().unwrap();
        uow.delete_object(&doomed).unwrap();
        uow.commit().unwrap();

        assert!(!server.cache().contains("Employee", &key(3)), "store mode {store}");
        let gone = DatabaseQuery::jpql("SELECT COUNT(e) FROM Employee e WHERE e.id = 3")
            .unwrap()
            .execute(&server, &[])
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(gone[0].get(0).and_then(Value::as_i64), Some(0));
    }
}

#[test]
fn refresh_preserves_identity() {
    let (server, conn) = server();
    seed(&conn);
    let cached = server.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
    conn.execute_raw("UPDATE employees SET name = 'Lovelace', salary = 150.0 WHERE id = 1")
        .unwrap();

    let mut query = DatabaseQuery::clone(&server.read_object_query("Employee").unwrap());
    apply_hints(
        &mut query,
        &HashMap::from([(hints::REFRESH.to_string(), "true".to_string())]),
    )
    .unwrap();
    let refreshed = query
        .execute(&server, &[Value::BigInt(1)])
        .unwrap()
        .into_object()
        .unwrap()
        .unwrap();

    assert!(Arc::ptr_eq(&refreshed, &cached));
    assert_eq!(text(&cached, "name").as_deref(), Some("Lovelace"));
    assert_eq!(sync::read(&cached).value("salary"), Some(&Value::Double(150.0)));

    // Store mode REFRESH behaves the same.
    conn.execute_raw("UPDATE employees SET name = 'Byron' WHERE id = 1")
        .unwrap();
    let again = read_employee(&server, 1, CacheRetrieveMode::Use, CacheStoreMode::Refresh);
    assert!(Arc::ptr_eq(&again, &cached));
    assert_eq!(text(&cached, "name").as_deref(), Some("Byron"));
}

#[test]
fn committed_changes_reach_the_cache() {
    let (server, conn) = server();
    seed(&conn);
    let before = server.find("Employee", &[Value::BigInt(2)]).unwrap().unwrap();

    let mut uow = server.acquire_unit_of_work(HashMap::new());
    let working = uow.find("Employee", &[Value::BigInt(2)]).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&working, &before));
    sync::write(&working).set("name", "Hopper");
    assert_eq!(text(&before, "name").as_deref(), Some("Grace"));
    uow.commit().unwrap();

    let after = server.find("Employee", &[Value::BigInt(2)]).unwrap().unwrap();
    assert_eq!(text(&after, "name").as_deref(), Some("Hopper"));
    assert_eq!(sync::read(&after).value("version"), Some(&Value::BigInt(2)));
}
