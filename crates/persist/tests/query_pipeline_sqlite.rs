mod common;

use common::{seed, server, text};
use persist_core::{TriState, Value};
use persist_query::{
    Call, DatabaseQuery, Expression, QueryMechanism, QueryResult, QuerySession, TranslationRow,
};
use std::sync::{Arc, Barrier};

fn by_name() -> DatabaseQuery {
    DatabaseQuery::jpql("SELECT e FROM Employee e WHERE e.name = :name").expect("parse JPQL")
}

#[test]
fn concurrent_first_executions_prepare_once() {
    let (server, conn) = server();
    seed(&conn);
    server.add_named_query("Employee.byName", by_name());
    let query = server.named_query("Employee.byName").unwrap();
    assert!(!query.is_prepared());

    let barrier = Barrier::new(8);
    let calls = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    query
                        .check_prepare(&server, &TranslationRow::new().with("name", "Ada"), false)
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(server.profiler().stats().prepares, 1);
    assert!(calls.iter().all(|c| Arc::ptr_eq(c, &calls[0])));

    // Executing afterwards reuses the prepared call.
    let result = query.execute(&server, &[Value::Text("Ada".into())]).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(server.profiler().stats().prepares, 1);
    assert!(Arc::ptr_eq(&query.prepared_call().unwrap(), &calls[0]));
}

#[test]
fn sql_affecting_setters_unprepare() {
    let (server, conn) = server();
    seed(&conn);
    let args = [Value::Text("Ada".into())];

    let prepared = || {
        let query = by_name();
        query.execute(&server, &args).unwrap();
        assert!(query.is_prepared());
        query
    };

    let mut q = prepared();
    q.set_selection_criteria(Expression::attr("name").equal(Expression::param("name")));
    assert!(!q.is_prepared());
    // Re-prepared on the next execution with the same result.
    assert_eq!(q.execute(&server, &args).unwrap().len(), 1);
    assert!(q.is_prepared());

    let mut q = prepared();
    q.set_call(Call::sql("SELECT id, name, salary, version, dept_id, city, zip FROM employees WHERE name = #name"));
    assert!(!q.is_prepared());
    let found = q.execute(&server, &args).unwrap().into_objects().unwrap();
    assert_eq!(text(&found[0], "name").as_deref(), Some("Ada"));

    let mut q = prepared();
    q.set_hint_string(Some("/* reporting */".into()));
    assert!(!q.is_prepared());

    let mut q = prepared();
    q.set_should_bind_all_parameters(TriState::False);
    assert!(!q.is_prepared());

    let mut q = prepared();
    q.set_should_cache_statement(TriState::True);
    assert!(!q.is_prepared());

    let mut q = prepared();
    q.set_query_mechanism(QueryMechanism::Expression);
    assert!(!q.is_prepared());
}

#[test]
fn concurrent_executions_of_a_named_query_keep_their_arguments() {
    let (server, conn) = server();
    seed(&conn);
    server.add_named_query("Employee.byName", by_name());
    let query = server.named_query("Employee.byName").unwrap();
    let names = ["Ada", "Grace", "Edsger"];

    let barrier = Barrier::new(names.len() * 4);
    std::thread::scope(|s| {
        for round in 0..4 {
            for name in names {
                let (query, server, barrier) = (&query, &server, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        let found = query
                            .execute(server, &[Value::Text(name.into())])
                            .unwrap()
                            .into_objects()
                            .unwrap();
                        assert_eq!(found.len(), 1, "round {round}");
                        assert_eq!(text(&found[0], "name").as_deref(), Some(name));
                    }
                });
            }
        }
    });

    // The shared query never carried a translation row of its own.
    assert!(query.translation_row().is_none());
    assert!(!query.is_execution_clone());
    assert_eq!(server.profiler().stats().prepares, 1);
}

#[test]
fn bulk_update_runs_and_invalidates_cached_instances() {
    let (server, conn) = server();
    seed(&conn);
    let ada = server.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
    assert!(server.cache().contains("Employee", &persist_core::PrimaryKey::single(1i64)));

    let raise = DatabaseQuery::jpql("UPDATE Employee e SET e.salary = e.salary * 2 WHERE e.id = :id")
        .unwrap();
    let result = raise.execute(&server, &[Value::BigInt(1)]).unwrap();
    assert!(matches!(result, QueryResult::RowCount(1)));
    assert!(!server.cache().contains("Employee", &persist_core::PrimaryKey::single(1i64)));

    let reread = server.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&ada, &reread));
    assert_eq!(
        persist_core::sync::read(&reread).value("salary"),
        Some(&Value::Double(200.0))
    );
}

#[test]
fn report_queries_return_rows() {
    let (server, conn) = server();
    seed(&conn);
    let count = DatabaseQuery::jpql("SELECT COUNT(e) FROM Employee e").unwrap();
    let rows = count.execute(&server, &[]).unwrap().into_rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0).and_then(Value::as_i64), Some(3));
}
