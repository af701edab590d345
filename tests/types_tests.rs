use pg_nlq::{
    error::{ErrorCode, QueryError},
    types::{QueryData, QueryRequest, QueryResponse, ReturnType}
};

#[test]
fn error_codes_serialize_to_stable_strings() {
    let cases = [
        (ErrorCode::ServerNotInitialized, "SERVER_NOT_INITIALIZED"),
        (ErrorCode::InvalidParameter, "INVALID_PARAMETER"),
        (ErrorCode::InvalidRequest, "INVALID_REQUEST"),
        (ErrorCode::RateLimited, "RATE_LIMITED"),
        (ErrorCode::UpstreamUnavailable, "UPSTREAM_UNAVAILABLE"),
        (ErrorCode::LlmTimeout, "LLM_TIMEOUT"),
        (ErrorCode::LlmMalformed, "LLM_MALFORMED"),
        (ErrorCode::SecurityViolation, "SECURITY_VIOLATION"),
        (ErrorCode::SqlParse, "SQL_PARSE"),
        (ErrorCode::NoSuchDatabase, "NO_SUCH_DATABASE"),
        (ErrorCode::DatabaseRequired, "DATABASE_REQUIRED"),
        (ErrorCode::DbError, "DB_ERROR"),
        (ErrorCode::Timeout, "TIMEOUT"),
        (ErrorCode::Canceled, "CANCELED")
    ];
    for (code, expected) in cases {
        assert_eq!(code.as_str(), expected);
        assert_eq!(
            serde_json::to_value(code).unwrap(),
            serde_json::Value::String(expected.to_string())
        );
    }
}

#[test]
fn request_deserializes_with_defaults() {
    let request: QueryRequest =
        serde_json::from_str(r#"{"question": "how many users?"}"#).unwrap();
    assert_eq!(request.question, "how many users?");
    assert!(request.database.is_none());
    assert_eq!(request.return_type, ReturnType::Result);
}

#[test]
fn request_accepts_sql_return_type() {
    let request: QueryRequest =
        serde_json::from_str(r#"{"question": "q", "return_type": "sql", "database": "app"}"#)
            .unwrap();
    assert_eq!(request.return_type, ReturnType::Sql);
    assert_eq!(request.database.as_deref(), Some("app"));
}

#[test]
fn success_response_shape() {
    let response = QueryResponse::success(
        String::from("SELECT COUNT(*) FROM users;"),
        None,
        90,
        123
    );
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["success"], true);
    assert_eq!(value["generated_sql"], "SELECT COUNT(*) FROM users;");
    assert_eq!(value["confidence"], 90);
    assert_eq!(value["tokens_used"], 123);
    // Absent payloads are omitted, not null.
    assert!(value.get("data").is_none());
    assert!(value.get("error").is_none());
}

#[test]
fn failure_response_keeps_generated_sql() {
    let err = QueryError::SecurityViolation {
        reason: String::from("Statement type 'DELETE' is not allowed")
    };
    let response =
        QueryResponse::failure(&err, Some(String::from("DELETE FROM orders")), 40);
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["success"], false);
    assert_eq!(value["generated_sql"], "DELETE FROM orders");
    assert_eq!(value["error"]["code"], "SECURITY_VIOLATION");
    assert!(
        value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("DELETE")
    );
    assert_eq!(value["tokens_used"], 40);
}

#[test]
fn db_failure_carries_sqlstate_details() {
    let err = QueryError::Db {
        message:  String::from("relation \"nope\" does not exist"),
        sqlstate: Some(String::from("42P01"))
    };
    let response = QueryResponse::failure(&err, None, 0);
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["error"]["code"], "DB_ERROR");
    assert_eq!(value["error"]["details"]["sqlstate"], "42P01");
}

#[test]
fn data_payload_serializes_rows_in_order() {
    let mut row = serde_json::Map::new();
    row.insert(String::from("id"), serde_json::json!(1));
    let data = QueryData {
        columns:   vec![String::from("id")],
        rows:      vec![row],
        row_count: 1,
        truncated: false
    };
    let response = QueryResponse::success(String::from("SELECT id FROM t"), Some(data), 80, 10);
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["data"]["columns"][0], "id");
    assert_eq!(value["data"]["rows"][0]["id"], 1);
    assert_eq!(value["data"]["row_count"], 1);
    assert_eq!(value["data"]["truncated"], false);
}

#[test]
fn retry_classification_matches_taxonomy() {
    assert!(
        QueryError::SecurityViolation {
            reason: String::new()
        }
        .is_retryable_policy()
    );
    assert!(
        QueryError::SqlParse {
            message: String::new()
        }
        .is_retryable_policy()
    );
    assert!(!QueryError::DatabaseRequired.is_retryable_policy());

    assert!(QueryError::Timeout { seconds: 30 }.is_retryable_database());
    assert!(
        QueryError::Db {
            message:  String::from("x"),
            sqlstate: Some(String::from("08006"))
        }
        .is_retryable_database()
    );
    assert!(
        !QueryError::Db {
            message:  String::from("syntax error"),
            sqlstate: Some(String::from("42601"))
        }
        .is_retryable_database()
    );

    assert!(QueryError::LlmTimeout.feeds_breaker());
    assert!(!QueryError::UpstreamUnavailable.feeds_breaker());
    assert!(!QueryError::Canceled.feeds_breaker());
}
