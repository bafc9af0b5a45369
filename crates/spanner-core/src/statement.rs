//! SQL statements with named parameters.

use std::fmt;

use crate::value::Value;

/// A SQL or DML statement and its named parameters (`@name` in the SQL).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<(String, Value)>,
}

impl Statement {
    /// Create a statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a named parameter. Binding an existing name replaces its value.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.params.push((name, value));
        }
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameters in binding order.
    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    /// Look up a bound parameter.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_replaces_existing() {
        let stmt = Statement::new("UPDATE t SET v = @v WHERE id = @id")
            .bind("v", 1_i64)
            .bind("id", "a")
            .bind("v", 2_i64);
        assert_eq!(stmt.params().len(), 2);
        assert_eq!(stmt.param("v"), Some(&Value::Int64(2)));
        assert_eq!(stmt.params()[1].0, "id");
    }
}
