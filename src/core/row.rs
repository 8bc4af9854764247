use super::Value;
use std::fmt;
use std::sync::Arc;

/// One result row as reported by a shard: the driver's column labels plus
/// the decoded values, in select-list order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Looks a value up by column label, ignoring ASCII case.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .and_then(|index| self.values.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Rows merged from one or more shards.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|row| row.columns().to_vec())
            .unwrap_or_default();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the table and its row count to stdout.
    pub fn print(&self) {
        print!("{}", self);
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return writeln!(f, "Empty result set");
        }

        // Calculate column widths
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();

        for row in &self.rows {
            for (i, value) in row.values().iter().enumerate() {
                if let Some(width) = widths.get_mut(i) {
                    *width = (*width).max(value.to_string().len());
                }
            }
        }

        let header: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{:width$}", col, width = widths[i]))
            .collect();

        writeln!(f, "{}", header.join(" | "))?;

        let separator: String = widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-");
        writeln!(f, "{}", separator)?;

        for row in &self.rows {
            let row_str: Vec<String> = row
                .values()
                .iter()
                .zip(widths.iter())
                .map(|(val, width)| format!("{:width$}", val, width = *width))
                .collect();
            writeln!(f, "{}", row_str.join(" | "))?;
        }

        writeln!(f, "\n{} row(s)", self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        let columns: Arc<[String]> = vec!["ID".to_string(), "name".to_string()].into();
        Row::new(columns, vec![Value::from("a1"), Value::from("alice")])
    }

    #[test]
    fn test_get_by_name_is_case_insensitive() {
        let row = sample_row();
        assert_eq!(row.get_by_name("id"), Some(&Value::from("a1")));
        assert_eq!(row.get_by_name("NAME"), Some(&Value::from("alice")));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_query_result_takes_columns_from_first_row() {
        let result = QueryResult::from_rows(vec![sample_row(), sample_row()]);
        assert_eq!(result.columns, vec!["ID".to_string(), "name".to_string()]);
        assert_eq!(result.row_count(), 2);
        assert!(QueryResult::from_rows(Vec::new()).columns.is_empty());
    }

    #[test]
    fn test_rendered_table_reports_count_once() {
        let rendered = QueryResult::from_rows(vec![sample_row(), sample_row()]).to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "ID | name ");
        assert_eq!(lines[1], "---+------");
        assert_eq!(lines[2], "a1 | alice");
        assert_eq!(rendered.matches("row").count(), 1, "{}", rendered);
        assert!(rendered.ends_with("\n2 row(s)\n"), "{}", rendered);

        assert_eq!(QueryResult::default().to_string(), "Empty result set\n");
    }
}
