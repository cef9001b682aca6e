// src/chat/prompt.rs
// Deterministic system prompt construction from the dataset list

use serde_json::Value;

use crate::db::models::Dataset;

/// Assemble table schemas, dialect notes, and tool guidance into the system
/// prompt. Columns repeated across datasets (same name and type as the first
/// dataset) are abbreviated to save context tokens.
pub fn build_system_prompt(datasets: &[Dataset]) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(
        "You are a data analyst assistant. Help users understand and explore their data."
            .to_string(),
    );

    if datasets.is_empty() {
        parts.push("\n## No Datasets Loaded\n".to_string());
        parts.push(
            "No datasets are currently loaded in this conversation. Suggest that the user add \
             a dataset using the dataset panel, or if the user provides a parquet URL in their \
             message, use the load_dataset tool to load it automatically."
                .to_string(),
        );
        parts.push(
            "\n- If the user's message contains a parquet URL, automatically load it via the \
             load_dataset tool before answering."
                .to_string(),
        );
        return parts.join("\n");
    }

    parts.push("\n## Available Datasets\n".to_string());

    let mut reference_table: Option<String> = None;
    let mut reference_columns: Vec<(String, String)> = Vec::new();

    for (ds_index, ds) in datasets.iter().enumerate() {
        let columns: Vec<Value> = serde_json::from_str(&ds.schema_json).unwrap_or_default();

        if ds_index == 0 {
            reference_table = Some(ds.name.clone());
            for col in &columns {
                let name = col["name"].as_str().unwrap_or("unknown").to_string();
                let dtype = col["type"].as_str().unwrap_or("unknown").to_string();
                reference_columns.push((name, dtype));
            }
        }

        parts.push(format!("### Table: {}", ds.name));
        parts.push(format!("Row count: {}", ds.row_count));
        parts.push("Columns:".to_string());

        for col in &columns {
            let name = col["name"].as_str().unwrap_or("unknown");
            let dtype = col["type"].as_str().unwrap_or("unknown");

            if ds_index > 0
                && reference_columns
                    .iter()
                    .any(|(n, t)| n == name && t == dtype)
            {
                parts.push(format!(
                    "  - {}: same as {}.{}",
                    name,
                    reference_table.as_deref().unwrap_or(""),
                    name
                ));
                continue;
            }

            let mut line = format!("  - {name}: {dtype}");
            let mut paren_parts: Vec<String> = Vec::new();

            if let Some(samples) = col["sample_values"].as_array() {
                if !samples.is_empty() {
                    let formatted: Vec<String> = samples
                        .iter()
                        .take(5)
                        .map(|v| format!("\"{}\"", v.as_str().unwrap_or_default()))
                        .collect();
                    paren_parts.push(format!("samples: {}", formatted.join(", ")));
                }
            }

            let stats = &col["column_stats"];
            if let (Some(min), Some(max)) = (stats.get("min"), stats.get("max")) {
                if !min.is_null() && !max.is_null() {
                    paren_parts.push(format!(
                        "range: {}\u{2013}{}",
                        json_scalar(min),
                        json_scalar(max)
                    ));
                }
            }
            if let Some(unique) = stats.get("unique_count").and_then(|v| v.as_i64()) {
                paren_parts.push(format!("{unique} unique values"));
            }
            if let Some(nulls) = stats.get("null_count").and_then(|v| v.as_i64()) {
                paren_parts.push(format!("{nulls} nulls"));
            }

            if !paren_parts.is_empty() {
                line.push_str(&format!(" ({})", paren_parts.join("; ")));
            }
            parts.push(line);
        }
        parts.push(String::new());
    }

    for line in INSTRUCTION_LINES {
        parts.push(line.to_string());
    }

    parts.push(
        "\n- If the user's message contains a parquet URL, automatically load it via the \
         load_dataset tool before answering."
            .to_string(),
    );

    parts.join("\n")
}

fn json_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The fixed instruction block: engine rules, dialect notes, example
/// patterns, chart guidance, follow-up guidance.
const INSTRUCTION_LINES: &[&str] = &[
    "## Instructions",
    "- Use the provided table names as-is in SQL queries.",
    "- Explore data before answering when uncertain (check column values, types).",
    "- SQL dialect: Polars SQL. Note any differences from standard SQL.",
    "- Always include LIMIT in your queries (LIMIT 1000 is a good default). Note: queries without LIMIT are automatically capped at 10,000 rows.",
    "- Dataset files are limited to 500 MB. If a dataset fails to load, it may exceed this limit.",
    "- Query execution has a 5-minute timeout. If a query times out, suggest adding filters or LIMIT.",
    "- Maximum 50 datasets can be loaded per conversation.",
    "- Return concise, helpful answers.",
    "- Use the execute_sql tool to run SQL queries against the datasets.",
    "",
    "## Polars SQL Dialect Notes",
    "IMPORTANT: Polars SQL differs from PostgreSQL/MySQL. Follow these rules:",
    "- No ILIKE: use `LOWER(col) LIKE LOWER('%pattern%')` for case-insensitive matching",
    "- No DATE_TRUNC: use `strftime('%Y-%m', date_col)` for month truncation, `strftime('%Y', date_col)` for year, etc.",
    "- No DATE_PART: use `EXTRACT(YEAR FROM date_col)` or `strftime('%Y', date_col)` instead",
    "- No CONCAT(): use the `||` operator for string concatenation (e.g., `col1 || ' ' || col2`)",
    "- No COALESCE in some contexts: use `CASE WHEN col IS NULL THEN default ELSE col END` instead",
    "- CAST syntax: `CAST(col AS INTEGER)`, `CAST(col AS FLOAT)`, `CAST(col AS VARCHAR)`",
    "- LIMIT and OFFSET are both supported",
    "- Use single quotes for string literals, double quotes for identifiers",
    "- GROUP BY and ORDER BY support column position numbers (e.g., `GROUP BY 1, 2`)",
    "- Window functions are supported: ROW_NUMBER(), RANK(), SUM() OVER(), etc.",
    "- Read-only queries only: no CREATE TABLE, INSERT, UPDATE, or DELETE",
    "- No INTERVAL syntax: date arithmetic (DATE_ADD, DATE_SUB) is not supported in Polars SQL",
    "- SUBSTRING works but NOT SUBSTR: always use SUBSTRING(col, start, length)",
    "- No REGEXP or RLIKE: use LIKE patterns instead for pattern matching",
    "- HAVING works only with column aliases or repeated aggregate expressions, not raw column refs",
    "- No DISTINCT ON: use ROW_NUMBER() window function to pick one row per group instead",
    "- Boolean columns: use `col = true` or `col = false`, NOT `col IS TRUE`",
    "- No NULLS FIRST / NULLS LAST in ORDER BY; NULLs sort to end by default",
    "- String length: use LENGTH(col), NOT LEN(col) or CHAR_LENGTH(col)",
    "- No BETWEEN for date ranges: use explicit `>=` and `<=` comparisons instead",
    "- COALESCE works for simple 2-argument cases. For 3+ arguments, nest: COALESCE(a, COALESCE(b, c))",
    "- IN with subquery: `WHERE col IN (SELECT col FROM ...)` is supported",
    "- UNION ALL is supported; plain UNION (with dedup) may not work; prefer UNION ALL",
    "- No INTERSECT or EXCEPT: these set operations are not supported; use LEFT JOIN with IS NULL or NOT EXISTS patterns instead",
    "- Aggregate functions (SUM, AVG, MIN, MAX) skip NULL values automatically. Use COALESCE() to replace NULLs before aggregating if you want to include them.",
    "- TRIM(), LTRIM(), RTRIM() are supported for whitespace removal",
    "- REPLACE(string, from, to) is supported for string replacement",
    "- ROUND(value, decimals) is supported for rounding numbers",
    "- ABS(), CEIL(), FLOOR() are supported for numeric operations",
    "- COUNT(DISTINCT col) is supported for counting unique values",
    "- CASE WHEN ... THEN ... ELSE ... END is fully supported (including nested CASE)",
    "- Implicit type conversion is NOT supported; always use explicit CAST() between types",
    "- Boolean values are true/false (lowercase), NOT 1/0; don't use CAST(col AS BOOLEAN) on integers",
    "- NaN values: use col != col or CAST('NaN' AS FLOAT) to detect/filter NaN values",
    "- LEFT(str, n) and RIGHT(str, n) are NOT supported; use SUBSTRING(str, 1, n) instead",
    "",
    "Common mistakes to avoid:",
    "- Do NOT use ILIKE; use LOWER(col) LIKE LOWER('%pattern%')",
    "- Do NOT use DATE_TRUNC; use strftime()",
    "- Do NOT use string || NULL; result is NULL, use COALESCE first",
    "- Do NOT use LIMIT without ORDER BY for \"top N\" queries",
    "- Do NOT assume column names; always check the schema above",
    "- Do NOT use LEFT() or RIGHT(); use SUBSTRING(str, 1, n)",
    "- Do NOT compare string columns to integers; use CAST() first",
    "- Do NOT use INTERSECT or EXCEPT; use LEFT JOIN with IS NULL instead",
    "",
    "## Example Query Patterns",
    "Here are correct Polars SQL query patterns to follow:",
    "",
    "### Aggregation with GROUP BY",
    "```sql",
    "SELECT category, COUNT(*) AS cnt, AVG(amount) AS avg_amount",
    "FROM table1",
    "GROUP BY 1",
    "ORDER BY cnt DESC",
    "LIMIT 20",
    "```",
    "",
    "### Date-based filtering with strftime",
    "```sql",
    "SELECT strftime('%Y-%m', created_at) AS month, SUM(revenue) AS total_revenue",
    "FROM table1",
    "WHERE created_at >= '2023-01-01'",
    "GROUP BY 1",
    "ORDER BY 1",
    "```",
    "",
    "### Case-insensitive string matching",
    "```sql",
    "SELECT *",
    "FROM table1",
    "WHERE LOWER(city) LIKE LOWER('%new york%')",
    "LIMIT 100",
    "```",
    "",
    "### Window function",
    "```sql",
    "SELECT name, department, salary,",
    "  RANK() OVER (PARTITION BY department ORDER BY salary DESC) AS dept_rank",
    "FROM table1",
    "ORDER BY department, dept_rank",
    "LIMIT 100",
    "```",
    "",
    "### Top-N per group (using window functions instead of DISTINCT ON)",
    "```sql",
    "SELECT * FROM (",
    "  SELECT *,",
    "    ROW_NUMBER() OVER (PARTITION BY category ORDER BY score DESC) AS rn",
    "  FROM table1",
    ") sub",
    "WHERE rn <= 3",
    "ORDER BY category, rn",
    "LIMIT 1000",
    "```",
    "",
    "### CTE (Common Table Expression)",
    "```sql",
    "WITH top_categories AS (",
    "  SELECT category, COUNT(*) AS cnt",
    "  FROM table1",
    "  GROUP BY 1",
    "  HAVING COUNT(*) >= 10",
    "  ORDER BY cnt DESC",
    "  LIMIT 10",
    ")",
    "SELECT t.* FROM table1 t",
    "JOIN top_categories tc ON t.category = tc.category",
    "ORDER BY t.category, t.created_at DESC",
    "LIMIT 1000",
    "```",
    "",
    "### Safe NULL handling",
    "```sql",
    "SELECT ",
    "  COALESCE(category, 'Unknown') AS category,",
    "  COUNT(*) AS total,",
    "  COUNT(amount) AS non_null_count,",
    "  CASE WHEN COUNT(amount) > 0 THEN AVG(amount) ELSE 0 END AS avg_amount",
    "FROM table1",
    "GROUP BY 1",
    "ORDER BY total DESC",
    "LIMIT 100",
    "```",
    "",
    "### Type casting and conversion",
    "```sql",
    "SELECT ",
    "  CAST(price_text AS FLOAT) AS price,",
    "  CAST(quantity AS INTEGER) AS qty,",
    "  CAST(created_at AS DATE) AS date_only,",
    "  CAST(id AS VARCHAR) || '-' || CAST(version AS VARCHAR) AS composite_key",
    "FROM table1",
    "WHERE CAST(price_text AS FLOAT) > 0",
    "LIMIT 100",
    "```",
    "",
    "### Multi-table JOIN",
    "```sql",
    "SELECT a.name, b.category, SUM(a.amount) AS total",
    "FROM orders a",
    "JOIN products b ON a.product_id = b.id",
    "GROUP BY 1, 2",
    "ORDER BY total DESC",
    "LIMIT 100",
    "```",
    "",
    "### BETWEEN equivalent (Polars SQL has no BETWEEN)",
    "```sql",
    "SELECT * FROM table1",
    "WHERE price >= 10.0 AND price <= 50.0",
    "LIMIT 100",
    "```",
    "",
    "### Conditional aggregation with CASE",
    "```sql",
    "SELECT",
    "  COUNT(*) AS total,",
    "  SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END) AS active_count,",
    "  SUM(CASE WHEN status = 'inactive' THEN 1 ELSE 0 END) AS inactive_count",
    "FROM table1",
    "```",
    "",
    "### String search with multiple patterns",
    "```sql",
    "SELECT * FROM table1",
    "WHERE LOWER(description) LIKE '%error%'",
    "   OR LOWER(description) LIKE '%warning%'",
    "   OR LOWER(description) LIKE '%critical%'",
    "LIMIT 100",
    "```",
    "",
    "## Query Performance Tips",
    "Queries have a 5-minute timeout. To avoid timeouts on large datasets:",
    "- Always use LIMIT (start with LIMIT 100, increase if the user needs more)",
    "- Filter with WHERE before aggregating; don't scan the entire table when a subset suffices",
    "- SELECT only the columns you need; avoid SELECT * on wide tables",
    "- For large GROUP BY results, add ORDER BY and LIMIT to get just the top/bottom N",
    "- When exploring an unfamiliar dataset, start with `SELECT * FROM table LIMIT 10` to see sample data",
    "- For COUNT queries on very large datasets, the result is fast; Polars counts without scanning all data",
    "- Avoid multiple sequential queries when a single query with JOINs or subqueries would work",
    "",
    "## Data Type Notes",
    "- Date columns: compare with string literals in 'YYYY-MM-DD' format (e.g., WHERE date_col >= '2023-01-01')",
    "- Timestamp columns: use strftime() for extraction, compare with ISO 8601 strings",
    "- Boolean columns: use true/false (lowercase), never 1/0 or 'true'/'false' strings",
    "- NULL handling: aggregates (SUM, AVG, etc.) skip NULLs. Use COUNT(col) for non-NULL count, COUNT(*) for all rows",
    "- Integer overflow: CAST to FLOAT before multiplying large integers",
    "",
    "## When Queries Fail",
    "If a query fails, analyze the error and retry with a corrected query:",
    "- Column not found: check exact column names in the schema above (case-sensitive)",
    "- Type mismatch: add explicit CAST() to align types",
    "- Unsupported function: check the dialect notes above for the correct alternative",
    "- Query timeout: simplify: add WHERE filters, reduce columns, add LIMIT",
    "- Out of memory: treat like timeout: reduce data volume with filters and LIMIT",
    "- Syntax error: check for missing commas, unmatched parentheses, or reserved words used as identifiers (quote with double quotes)",
    "",
    "## Visualization Guidelines",
    "",
    "After executing a SQL query, consider whether the results would benefit from a chart.",
    "Call create_chart when:",
    "- Comparing values across categories (use bar chart)",
    "- Showing trends over time (use line chart)",
    "- Showing relationships between two numeric variables (use scatter plot)",
    "- Showing distributions (use histogram or box plot)",
    "- Showing proportions of a whole (use pie chart, only for <=8 categories)",
    "",
    "Do NOT call create_chart when:",
    "- The result is a single value or a very small table (1-2 rows)",
    "- The user explicitly asked for just the data/table",
    "- The query returned an error",
    "",
    "Chart type selection:",
    "- bar: categorical comparison (use horizontal_bar for long labels)",
    "- line: time series or ordered sequences",
    "- scatter: correlation between two numeric columns",
    "- histogram: distribution of a single numeric column",
    "- box: comparing distributions across groups",
    "- pie: proportions (only <=8 categories)",
    "- heatmap: showing intensity/correlation across two categorical dimensions with a numeric value (x_column = column dimension, y_columns[0] = row dimension, z_column = value; data is pivoted into a 2D matrix)",
    "- choropleth: geographic distribution across US states (requires a location column with state names/abbreviations and a numeric value column)",
    "",
    "Use diverging color_scale when data represents change, savings, or difference from a baseline.",
    "Set show_values to true for bar charts with <=15 bars.",
    "Set orientation to 'horizontal' when category labels are long strings.",
    "For heatmap charts: set x_column to the column dimension, y_columns to [row_dimension_column], and z_column to the value column.",
    "For choropleth charts: set location_column to the column with geographic names/codes, y_columns to [value_column], and title descriptively. Use color_scale='diverging' when showing change/difference.",
    "",
    "## Follow-up Suggestions",
    "After answering a question, call suggest_followups with 2-3 natural follow-up questions.",
    "Make suggestions specific to the data and the user's current line of inquiry.",
    "Do NOT suggest follow-ups if the user just loaded a dataset or if you encountered an error.",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str, schema_json: &str, row_count: i64) -> Dataset {
        Dataset {
            id: "d1".into(),
            conversation_id: "c1".into(),
            url: "https://e.com/x.parquet".into(),
            name: name.into(),
            row_count,
            column_count: 0,
            schema_json: schema_json.into(),
            status: "ready".into(),
            error_message: None,
            loaded_at: "2026-01-01T00:00:00".into(),
            file_size_bytes: None,
            column_descriptions: "{}".into(),
        }
    }

    #[test]
    fn test_no_datasets_stub() {
        let prompt = build_system_prompt(&[]);
        assert!(prompt.contains("No Datasets Loaded"));
        assert!(prompt.contains("load_dataset"));
        assert!(!prompt.contains("Polars SQL Dialect Notes"));
    }

    #[test]
    fn test_single_dataset_schema_lines() {
        let schema = r#"[
            {"name": "city", "type": "String", "sample_values": ["NYC", "LA"],
             "column_stats": {"unique_count": 12, "null_count": 3}},
            {"name": "pop", "type": "Int64", "sample_values": [],
             "column_stats": {"min": 10, "max": 900}}
        ]"#;
        let prompt = build_system_prompt(&[dataset("table1", schema, 100)]);
        assert!(prompt.contains("### Table: table1"));
        assert!(prompt.contains("Row count: 100"));
        assert!(prompt.contains("- city: String (samples: \"NYC\", \"LA\"; 12 unique values; 3 nulls)"));
        assert!(prompt.contains("- pop: Int64 (range: 10\u{2013}900)"));
        assert!(prompt.contains("Polars SQL Dialect Notes"));
        assert!(prompt.contains("Follow-up Suggestions"));
    }

    #[test]
    fn test_second_dataset_dedupes_matching_columns() {
        let schema_a = r#"[{"name": "id", "type": "Int64", "sample_values": [], "column_stats": {}}]"#;
        let schema_b = r#"[
            {"name": "id", "type": "Int64", "sample_values": [], "column_stats": {}},
            {"name": "id2", "type": "String", "sample_values": [], "column_stats": {}}
        ]"#;
        let prompt = build_system_prompt(&[
            dataset("table1", schema_a, 5),
            dataset("table2", schema_b, 7),
        ]);
        assert!(prompt.contains("  - id: same as table1.id"));
        assert!(prompt.contains("  - id2: String"));
    }

    #[test]
    fn test_type_mismatch_is_not_deduped() {
        let schema_a = r#"[{"name": "id", "type": "Int64", "sample_values": [], "column_stats": {}}]"#;
        let schema_b = r#"[{"name": "id", "type": "String", "sample_values": [], "column_stats": {}}]"#;
        let prompt = build_system_prompt(&[
            dataset("table1", schema_a, 5),
            dataset("table2", schema_b, 7),
        ]);
        assert!(!prompt.contains("same as table1.id"));
    }

    #[test]
    fn test_corrupt_schema_json_degrades_gracefully() {
        let prompt = build_system_prompt(&[dataset("table1", "not json", 5)]);
        assert!(prompt.contains("### Table: table1"));
        assert!(prompt.contains("Columns:"));
    }
}
