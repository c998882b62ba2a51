//! Black-box fuzzing of statement building.
//!
//! Random and hostile values must always travel as bound parameters: the
//! number of placeholders matches the parameter list and no value text ever
//! shows up in the generated SQL.

use atomic_pg::error::DbError;
use atomic_pg::sql::{Predicate, Statement};
use atomic_pg::{FilterSpec, QueryParam, SearchSpec, SelectOptions, ValueMap};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Values that would break out of a quoted literal if they were spliced in.
fn hostile_values() -> Vec<String> {
    vec![
        "'OR 1=1--".to_string(),
        "'; DROP TABLE users--".to_string(),
        "1' UNION SELECT NULL, NULL--".to_string(),
        "$1".to_string(),
        "%_%".to_string(),
        "\\".to_string(),
        "üöÄ".repeat(20),
        "\u{0000}\u{FFFF}".to_string(),
        format!("zz{}zz", random_string(24)),
    ]
}

const SUFFIXES: &[&str] = &[
    "", "__lt", "__lte", "__gt", "__gte", "__contains", "__icontains", "__startswith",
    "__istartswith", "__endswith", "__iendswith",
];

/// Highest `$n` in the SQL, which must equal the number of distinct placeholders.
fn max_placeholder(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[start..end].parse::<usize>() {
                max = max.max(n);
            }
            i = end;
        } else {
            i += 1;
        }
    }
    max
}

fn assert_no_leak(sql: &str, params: &[QueryParam], values: &[String]) {
    assert_eq!(max_placeholder(sql), params.len(), "sql: {sql}");
    for value in values {
        // Short values like "$1" or "\\" legitimately collide with SQL text.
        if value.len() > 4 {
            assert!(!sql.contains(value.as_str()), "value leaked into sql: {sql}");
        }
    }
}

#[test]
fn fuzz_filter_values_are_always_bound() {
    let mut rng = rand::thread_rng();
    let values = hostile_values();

    for _ in 0..200 {
        let mut filters = FilterSpec::new();
        let mut used = Vec::new();
        for i in 0..rng.gen_range(1..6) {
            let column = format!("c{i}");
            let suffix = SUFFIXES.choose(&mut rng).copied().unwrap_or_default();
            let value = values.choose(&mut rng).cloned().unwrap_or_default();
            if rng.gen_bool(0.2) {
                let list: Vec<String> = (0..rng.gen_range(0..4))
                    .map(|_| values.choose(&mut rng).cloned().unwrap_or_default())
                    .collect();
                used.extend(list.iter().cloned());
                filters.insert(format!("{column}__in"), list);
            } else {
                used.push(value.clone());
                filters.insert(format!("{column}{suffix}"), value);
            }
        }

        let search = rng.gen_bool(0.5).then(|| {
            let term = values.choose(&mut rng).cloned().unwrap_or_default();
            used.push(term.clone());
            SearchSpec::new(["name", "email__startswith"], term)
        });

        let predicate = Predicate::compile(&filters, search.as_ref()).unwrap();
        assert_no_leak(&predicate.sql, &predicate.params, &used);

        let stmt = Statement::select_where(
            "t",
            &filters,
            search.as_ref(),
            &SelectOptions::new().offset(rng.gen_range(0..10)).limit(5),
        )
        .unwrap();
        assert_no_leak(&stmt.sql, &stmt.params, &used);
    }
}

#[test]
fn fuzz_write_values_are_always_bound() {
    let mut rng = rand::thread_rng();
    let values = hostile_values();

    for _ in 0..100 {
        let mut row = ValueMap::new();
        let mut used = Vec::new();
        for i in 0..rng.gen_range(1..8) {
            if rng.gen_bool(0.2) {
                row.insert(format!("col_{i}"), QueryParam::Null);
            } else {
                let value = values.choose(&mut rng).cloned().unwrap_or_default();
                used.push(value.clone());
                row.insert(format!("col_{i}"), value);
            }
        }

        let insert = Statement::insert("public.t", &row).unwrap();
        assert_no_leak(&insert.sql, &insert.params, &used);

        let update = Statement::update("t", &FilterSpec::new().with("id", 7), &row).unwrap();
        assert_no_leak(&update.sql, &update.params, &used);
    }
}

#[test]
fn fuzz_identifiers_are_rejected_or_plain() {
    for _ in 0..200 {
        let name = match rand::thread_rng().gen_range(0..3) {
            0 => random_string(rand::thread_rng().gen_range(1..40)),
            1 => hostile_values()[rand::thread_rng().gen_range(0..6)].clone(),
            _ => format!("{}.{}", random_string(5), random_string(5)),
        };

        match Statement::insert(&name, &ValueMap::new().set("a", 1)) {
            Ok(stmt) => {
                // Accepted names are plain identifiers and appear verbatim.
                assert!(stmt.sql.contains(&name));
                assert!(
                    name.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$')
                );
            }
            Err(DbError::InvalidIdentifier { .. }) => {}
            Err(e) => panic!("unexpected error for {name:?}: {e}"),
        }
    }
}

#[test]
fn fuzz_unknown_suffixes_are_rejected() {
    // No operator name is six alphanumeric characters.
    for _ in 0..100 {
        let key = format!("col__{}", random_string(6).to_lowercase());
        let filters = FilterSpec::new().with(key.as_str(), 1);
        let err = Predicate::compile(&filters, None).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperator { .. }), "{err:?}");
    }
}
