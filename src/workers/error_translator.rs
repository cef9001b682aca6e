// src/workers/error_translator.rs
// Rewrites raw query-engine errors into actionable user prose.
//
// Every translation keeps the raw message appended under a
// "Technical details:" suffix so the model (and a curious user) can still
// see exactly what the engine said.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COLUMN_NOT_FOUND: Regex =
        Regex::new(r#"(?i)unable to find column "([^"]+)"|column "([^"]+)" not found"#).unwrap();
    static ref RELATION_NOT_FOUND: Regex =
        Regex::new(r"(?i)relation\s+'?([^'\s]+)'?\s+was not found|table\s+'([^']+)'\s+not found")
            .unwrap();
    static ref UNSUPPORTED_FUNCTION: Regex =
        Regex::new(r"(?i)unsupported function\s+'([^']+)'|function\s+'([^']+)'\s+not found")
            .unwrap();
    static ref CAST_FAILED: Regex = Regex::new(
        r"(?i)conversion from `str` to `(i\d+|u\d+|f\d+)` failed|could not parse .* as (integer|int|float|number)"
    )
    .unwrap();
    static ref GROUP_BY_ORDINAL: Regex = Regex::new(
        r"(?i)group by ordinal value must refer to a valid column|group by position \d+ is not in select list"
    )
    .unwrap();
}

/// Translate a raw engine error message to a user-facing explanation.
///
/// `available_columns` (when known) is included for column-not-found errors
/// so the model can self-correct without another schema round-trip.
pub fn translate_engine_error(raw: &str, available_columns: &[String]) -> String {
    let friendly = friendly_message(raw, available_columns);
    format!("{friendly}\n\nTechnical details: {raw}")
}

fn friendly_message(raw: &str, available_columns: &[String]) -> String {
    let lower = raw.to_lowercase();

    if let Some(caps) = COLUMN_NOT_FOUND.captures(raw) {
        let column = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("?");
        let mut msg = format!(
            "Column '{column}' doesn't exist in the dataset. Column names are case-sensitive."
        );
        if !available_columns.is_empty() {
            msg.push_str(&format!(
                " Available columns: {}",
                available_columns.join(", ")
            ));
        }
        return msg;
    }

    if RELATION_NOT_FOUND.is_match(raw) {
        return "Table not found. Use the dataset name as shown in the schema (table1, table2, ...)."
            .to_string();
    }

    if UNSUPPORTED_FUNCTION.is_match(raw) {
        return "Function not supported in Polars SQL. Check the dialect notes for a supported \
                alternative (e.g. strftime instead of DATE_TRUNC, LENGTH instead of LEN)."
            .to_string();
    }

    if CAST_FAILED.is_match(raw) {
        return "Could not convert string to number. Some values in the column are not numeric. \
                Use CAST(column AS FLOAT) only on clean numeric text, or filter out the \
                non-numeric rows first."
            .to_string();
    }

    if GROUP_BY_ORDINAL.is_match(raw) {
        return "GROUP BY position number is out of range. GROUP BY 1 refers to the first column \
                in your SELECT list; make sure the number matches a selected column."
            .to_string();
    }

    if lower.contains("duplicate output name") || lower.contains("duplicateerror") {
        return "Duplicate column name in query results. Give each expression a distinct alias \
                with AS."
            .to_string();
    }

    if lower.contains("expected string type") {
        return "This operation works on text columns only. Convert the column first with \
                CAST(column AS VARCHAR)."
            .to_string();
    }

    if lower.contains("derived tables must have aliases") {
        return "Subqueries in FROM must be given an alias. Add one after the closing \
                parenthesis: (...) AS subquery_name."
            .to_string();
    }

    if lower.contains("statement type is not supported")
        || lower.contains("unsupported statement type")
    {
        return "Only read-only queries are allowed. INSERT, UPDATE, DELETE, CREATE, ALTER, or \
                DROP statements are not supported. Use SELECT queries to analyze and retrieve \
                data."
            .to_string();
    }

    if lower.contains("non-numeric arguments for limit") || lower.contains("non-numeric arguments for offset")
    {
        return "LIMIT and OFFSET need literal numbers, e.g. LIMIT 10 OFFSET 20.".to_string();
    }

    if lower.contains("'is_in' cannot check for") {
        return "The values in your IN (...) list don't match the column's type. Use CAST() so \
                both sides have the same type."
            .to_string();
    }

    if lower.contains("distinct on") {
        return "DISTINCT ON is not supported. Use a ROW_NUMBER() window function to pick one row \
                per group instead."
            .to_string();
    }

    if lower.contains("intersect") || lower.contains("except") {
        return "INTERSECT and EXCEPT are not supported. Use a LEFT JOIN with IS NULL, or a \
                NOT EXISTS pattern, instead."
            .to_string();
    }

    if lower.contains("having") {
        return "HAVING needs column aliases here. Alias the aggregate with AS in the SELECT \
                list and refer to the alias in HAVING."
            .to_string();
    }

    if lower.contains("sql parser error") || lower.contains("syntax error") {
        return "SQL syntax error. Check for missing commas, unmatched parentheses, or reserved \
                words used as identifiers (quote them with double quotes)."
            .to_string();
    }

    "The query failed. Review the technical details below and adjust the query.".to_string()
}
