use pg_nlq::{
    config::{ExplainPolicy, SecurityConfig},
    error::{ErrorCode, QueryError},
    validator::SqlValidator
};

fn validator() -> SqlValidator {
    SqlValidator::new(&SecurityConfig::default())
}

fn validator_with(config: SecurityConfig) -> SqlValidator {
    SqlValidator::new(&config)
}

fn assert_violation(result: Result<(), QueryError>, fragment: &str) {
    match result {
        Err(err) => {
            assert_eq!(err.code(), ErrorCode::SecurityViolation);
            assert!(
                err.to_string().contains(fragment),
                "expected '{}' in '{}'",
                fragment,
                err
            );
        }
        Ok(()) => panic!("expected a security violation containing '{}'", fragment)
    }
}

#[test]
fn accepts_plain_select() {
    assert!(validator().validate("SELECT id, name FROM users").is_ok());
}

#[test]
fn accepts_select_with_joins_and_aggregates() {
    let sql = "SELECT u.id, count(o.id) AS orders \
               FROM users u JOIN orders o ON o.user_id = u.id \
               WHERE u.active GROUP BY u.id HAVING count(o.id) > 3 \
               ORDER BY orders DESC LIMIT 10";
    assert!(validator().validate(sql).is_ok());
}

#[test]
fn accepts_cte_over_select() {
    let sql = "WITH recent AS (SELECT * FROM orders WHERE created_at > now() - interval '7 days') \
               SELECT count(*) FROM recent";
    assert!(validator().validate(sql).is_ok());
}

#[test]
fn accepts_union_intersect_except() {
    let v = validator();
    assert!(v.validate("SELECT id FROM a UNION SELECT id FROM b").is_ok());
    assert!(v.validate("SELECT id FROM a INTERSECT SELECT id FROM b").is_ok());
    assert!(v.validate("SELECT id FROM a EXCEPT SELECT id FROM b").is_ok());
}

#[test]
fn rejects_empty_input() {
    let err = validator().validate("   ").unwrap_err();
    assert_eq!(err.code(), ErrorCode::SqlParse);
}

#[test]
fn rejects_unparseable_input() {
    let err = validator().validate("SELECT FROM WHERE").unwrap_err();
    assert_eq!(err.code(), ErrorCode::SqlParse);
}

#[test]
fn rejects_multiple_statements() {
    assert_violation(
        validator().validate("SELECT 1; SELECT 2"),
        "Multiple SQL statements"
    );
}

#[test]
fn allows_trailing_semicolon() {
    assert!(validator().validate("SELECT 1;").is_ok());
}

#[test]
fn rejects_dml_statements() {
    let v = validator();
    assert_violation(v.validate("INSERT INTO users VALUES (1)"), "INSERT");
    assert_violation(v.validate("UPDATE users SET name = 'x'"), "UPDATE");
    assert_violation(v.validate("DELETE FROM orders"), "DELETE");
}

#[test]
fn rejects_ddl_statements() {
    let v = validator();
    assert_violation(v.validate("CREATE TABLE t (id INT)"), "CREATE");
    assert_violation(v.validate("DROP TABLE users"), "DROP");
    assert_violation(v.validate("TRUNCATE users"), "TRUNCATE");
}

#[test]
fn rejects_grant_and_other_commands() {
    let v = validator();
    assert!(v.validate("GRANT SELECT ON users TO intern").is_err());
    assert!(v.validate("COPY users TO '/tmp/out'").is_err());
}

#[test]
fn rejects_writable_cte() {
    let v = validator();
    let sql = "WITH gone AS (DELETE FROM orders RETURNING id) SELECT count(*) FROM gone";
    assert!(v.validate(sql).is_err());
}

#[test]
fn explain_disabled_rejects_all_explains() {
    let v = validator();
    assert_violation(
        v.validate("EXPLAIN SELECT * FROM users"),
        "EXPLAIN statements are not allowed"
    );
}

#[test]
fn explain_only_permits_plain_explain() {
    let v = validator_with(SecurityConfig {
        explain_policy: ExplainPolicy::ExplainOnly,
        ..Default::default()
    });
    assert!(v.validate("EXPLAIN SELECT * FROM users").is_ok());
    assert_violation(
        v.validate("EXPLAIN ANALYZE SELECT * FROM users"),
        "EXPLAIN ANALYZE is not allowed"
    );
}

#[test]
fn explain_analyze_policy_permits_both() {
    let v = validator_with(SecurityConfig {
        explain_policy: ExplainPolicy::ExplainAnalyze,
        ..Default::default()
    });
    assert!(v.validate("EXPLAIN SELECT 1").is_ok());
    assert!(v.validate("EXPLAIN ANALYZE SELECT 1").is_ok());
}

#[test]
fn explain_analyze_of_dml_is_rejected_under_any_policy() {
    let v = validator_with(SecurityConfig {
        explain_policy: ExplainPolicy::ExplainAnalyze,
        ..Default::default()
    });
    assert_violation(v.validate("EXPLAIN ANALYZE DELETE FROM orders"), "DELETE");
}

#[test]
fn rejects_blocked_functions() {
    let v = validator();
    assert_violation(v.validate("SELECT pg_sleep(10)"), "pg_sleep");
    assert_violation(v.validate("SELECT PG_SLEEP(10)"), "pg_sleep");
    assert_violation(
        v.validate("SELECT pg_read_file('/etc/passwd')"),
        "pg_read_file"
    );
}

#[test]
fn rejects_schema_qualified_blocked_function() {
    assert_violation(
        validator().validate("SELECT pg_catalog.pg_sleep(1)"),
        "pg_sleep"
    );
}

#[test]
fn rejects_blocked_function_inside_subquery() {
    assert_violation(
        validator().validate("SELECT 1 WHERE EXISTS (SELECT pg_sleep(5))"),
        "pg_sleep"
    );
}

#[test]
fn rejects_blocked_table() {
    let v = validator_with(SecurityConfig {
        blocked_tables: vec![String::from("secrets")],
        ..Default::default()
    });
    assert_violation(v.validate("SELECT * FROM secrets"), "secrets");
    assert_violation(v.validate("SELECT * FROM Secrets"), "secrets");
    assert_violation(v.validate("SELECT * FROM public.secrets"), "secrets");
}

#[test]
fn rejects_blocked_table_in_join_and_subquery() {
    let v = validator_with(SecurityConfig {
        blocked_tables: vec![String::from("audit_log")],
        ..Default::default()
    });
    assert_violation(
        v.validate("SELECT * FROM users u JOIN audit_log a ON a.user_id = u.id"),
        "audit_log"
    );
    assert_violation(
        v.validate("SELECT * FROM users WHERE id IN (SELECT user_id FROM audit_log)"),
        "audit_log"
    );
    assert_violation(
        v.validate("WITH x AS (SELECT * FROM audit_log) SELECT count(*) FROM x"),
        "audit_log"
    );
}

#[test]
fn rejects_blocked_bare_column() {
    let v = validator_with(SecurityConfig {
        blocked_columns: vec![String::from("password_hash")],
        ..Default::default()
    });
    assert_violation(v.validate("SELECT password_hash FROM users"), "password_hash");
    assert_violation(
        v.validate("SELECT * FROM users WHERE password_hash = 'x'"),
        "password_hash"
    );
}

#[test]
fn rejects_blocked_qualified_column() {
    let v = validator_with(SecurityConfig {
        blocked_columns: vec![String::from("users.ssn")],
        ..Default::default()
    });
    assert_violation(v.validate("SELECT users.ssn FROM users"), "users.ssn");
    // An unqualified reference to a differently-qualified block entry passes.
    assert!(v.validate("SELECT ssn FROM applicants").is_ok());
}

#[test]
fn allows_unblocked_statement_with_deny_lists_set() {
    let v = validator_with(SecurityConfig {
        blocked_tables:  vec![String::from("secrets")],
        blocked_columns: vec![String::from("users.password_hash")],
        ..Default::default()
    });
    assert!(v.validate("SELECT id, email FROM users").is_ok());
}

#[test]
fn normalize_produces_canonical_text() {
    let v = validator();
    let normalized = v.normalize("select   id\nfrom users   where id=1").unwrap();
    assert_eq!(normalized, "SELECT id FROM users WHERE id = 1");
}

#[test]
fn extract_tables_is_sorted_and_deduplicated() {
    let v = validator();
    let tables = v
        .extract_tables(
            "SELECT * FROM orders o JOIN users u ON u.id = o.user_id \
             WHERE o.user_id IN (SELECT id FROM users)"
        )
        .unwrap();
    assert_eq!(tables, vec!["orders", "users"]);
}

#[test]
fn extract_tables_sees_through_ctes_and_derived_tables() {
    let v = validator();
    let tables = v
        .extract_tables(
            "WITH r AS (SELECT * FROM orders) \
             SELECT * FROM (SELECT * FROM products) p, r"
        )
        .unwrap();
    assert!(tables.contains(&String::from("orders")));
    assert!(tables.contains(&String::from("products")));
}

#[test]
fn extract_tables_stable_under_normalize() {
    let v = validator();
    for sql in [
        "select id from users where id = 1",
        "SELECT u.id FROM users u JOIN orders o ON o.user_id = u.id",
        "WITH x AS (SELECT * FROM a) SELECT * FROM x, b"
    ] {
        let normalized = v.normalize(sql).unwrap();
        assert_eq!(
            v.extract_tables(&normalized).unwrap(),
            v.extract_tables(sql).unwrap()
        );
    }
}
