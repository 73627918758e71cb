//! Property-based tests using proptest

use proptest::prelude::*;
use rdbms_layer::core::query::Query;
use rdbms_layer::core::{DatabaseDomain, DatabaseValue, LikeMatch, QueryFlags, QueryVerb};

// ============================================================================
// Domain ID Tests
// ============================================================================

proptest! {
    /// Any domain survives a trip through its string ID
    #[test]
    fn test_domain_id_roundtrip(
        database in "[a-z0-9?_-]{1,10}",
        schema in proptest::option::of("[a-z0-9?_-]{0,8}"),
        prefix in "[a-z0-9?_-]{0,6}",
    ) {
        let domain = DatabaseDomain::new(Some(database), schema, prefix).unwrap();
        let parsed = DatabaseDomain::from_id(&domain.id()).unwrap();
        prop_assert_eq!(parsed, domain);
    }

    /// IDs never contain more separators than components
    #[test]
    fn test_domain_id_separator_count(
        database in "[a-z-]{1,10}",
        prefix in "[a-z-]{1,6}",
    ) {
        let domain = DatabaseDomain::new(Some(database), None::<String>, prefix).unwrap();
        prop_assert_eq!(domain.id().matches('-').count(), 1);
    }
}

// ============================================================================
// Statement Classification Tests
// ============================================================================

fn leading_noise() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("   ".to_string()),
        Just("\n\t".to_string()),
        "[a-z ]{0,12}".prop_map(|c| format!("/* {} */ ", c)),
        ("[a-z ]{0,12}", "[a-z ]{0,12}").prop_map(|(a, b)| format!("/* {}\n * {}\n */\n", a, b)),
        "[a-z ]{0,12}".prop_map(|c| format!("-- {}\n", c)),
    ]
}

proptest! {
    /// Comments and whitespace before the verb do not change the classification
    #[test]
    fn test_verb_ignores_leading_comments(
        noise in leading_noise(),
        (body, verb) in prop_oneof![
            Just(("select * from t", QueryVerb::Select)),
            Just(("INSERT INTO t (a) VALUES (1)", QueryVerb::Insert)),
            Just(("Update t SET a = 1", QueryVerb::Update)),
            Just(("delete FROM t WHERE a = 1", QueryVerb::Delete)),
            Just(("CREATE TABLE t (a INT)", QueryVerb::Create)),
            Just(("ROLLBACK TO SAVEPOINT sp", QueryVerb::RollbackToSavepoint)),
        ],
    ) {
        let query = Query::new(format!("{}{}", noise, body), QueryFlags::empty());
        prop_assert_eq!(query.verb(), verb);
        prop_assert_eq!(query.is_write(), verb.is_write());
    }

    /// Only SELECTs are reads, regardless of flags other than CHANGE_*
    #[test]
    fn test_select_is_never_a_write(columns in "[a-z]{1,8}( *, *[a-z]{1,8}){0,3}") {
        let query = Query::new(format!("SELECT {} FROM t", columns), QueryFlags::NO_RETRY);
        prop_assert!(!query.is_write());
        prop_assert!(!query.changes_transaction());
    }
}

// ============================================================================
// Value Tests
// ============================================================================

proptest! {
    /// Truthiness agrees with the boolean reading wherever one exists
    #[test]
    fn test_truthy_matches_as_bool(value in prop_oneof![
        any::<bool>().prop_map(DatabaseValue::from),
        any::<i32>().prop_map(DatabaseValue::from),
        any::<i64>().prop_map(DatabaseValue::from),
        prop_oneof![Just("0"), Just("1"), Just("true"), Just("no")].prop_map(DatabaseValue::from),
    ]) {
        if let Some(b) = value.as_bool() {
            prop_assert_eq!(value.is_truthy(), b);
        }
    }

    /// Option::None always maps to NULL
    #[test]
    fn test_none_is_null(_value in 0..100u32) {
        let db_val = DatabaseValue::from(Option::<i64>::None);
        prop_assert!(db_val.is_null());
        prop_assert!(!db_val.is_truthy());
    }
}

// ============================================================================
// SQL Literal Tests (against SQLite)
// ============================================================================

#[cfg(feature = "sqlite")]
mod sqlite_literals {
    use super::*;
    use rdbms_layer::backends::{BackendDriver, SqlDialect, SqliteDriver};
    use rdbms_layer::core::ConnectionConfig;
    use tokio::runtime::Runtime;

    fn runtime_and_driver() -> (Runtime, SqliteDriver) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut driver = SqliteDriver::new();
        rt.block_on(driver.open(&ConnectionConfig::sqlite(":memory:")))
            .unwrap();
        (rt, driver)
    }

    fn select_one(rt: &Runtime, driver: &mut SqliteDriver, expr: &str) -> DatabaseValue {
        let mut status = rt.block_on(
            driver.do_single_statement_query(&Query::new(format!("SELECT {} AS v", expr), QueryFlags::empty())),
        );
        assert!(status.is_ok(), "{}: {}", expr, status.error());
        let rows = status.take_rows();
        rows[0].get("v").cloned().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Quoted literals read back as the value that was quoted
        #[test]
        fn test_quoted_literals_read_back(value in prop_oneof![
            ((i64::MIN + 1)..=i64::MAX).prop_map(DatabaseValue::from),
            "\\PC{0,40}".prop_map(DatabaseValue::from),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(DatabaseValue::from),
        ]) {
            let (rt, mut driver) = runtime_and_driver();
            let literal = driver.add_quotes(&value);
            let back = select_one(&rt, &mut driver, &literal);
            match &value {
                DatabaseValue::Long(v) => prop_assert_eq!(back.as_long(), Some(*v)),
                DatabaseValue::String(s) => prop_assert_eq!(back.as_string(), s.clone()),
                DatabaseValue::Bytes(b) => prop_assert_eq!(back.as_bytes(), Some(b.as_slice())),
                other => prop_assert!(false, "unexpected value {:?}", other),
            }
        }

        /// A literal LIKE pattern matches its own text and nothing longer
        #[test]
        fn test_like_literal_matches_itself(text in "[a-z%_`'\\\\]{0,20}") {
            let (rt, mut driver) = runtime_and_driver();
            let like = driver.build_like(&[LikeMatch::Literal(text.clone())]);

            let quoted = driver.quote_string(&text);
            let same = select_one(&rt, &mut driver, &format!("{}{}", quoted, like));
            prop_assert_eq!(same.as_long(), Some(1));

            let longer = driver.quote_string(&format!("{}x", text));
            let other = select_one(&rt, &mut driver, &format!("{}{}", longer, like));
            prop_assert_eq!(other.as_long(), Some(0));
        }
    }
}
