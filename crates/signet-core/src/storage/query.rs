//! Typed query builder for memory filters
//!
//! Centralizes WHERE-clause assembly and LIKE escaping so no call site
//! concatenates user input into SQL.

use rusqlite::types::ToSql;

use crate::memory::MemoryFilter;

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern
/// used with `ESCAPE '\'`.
pub fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Accumulates conditions and their parameters.
pub(crate) struct SelectBuilder {
    conditions: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl SelectBuilder {
    pub(crate) fn new() -> Self {
        Self {
            conditions: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Add a condition with one positional parameter. The condition text
    /// must use `?` for the placeholder.
    pub(crate) fn push(&mut self, condition: &str, param: impl ToSql + 'static) {
        self.conditions.push(condition.to_string());
        self.params.push(Box::new(param));
    }

    /// Add a parameterless condition.
    pub(crate) fn push_raw(&mut self, condition: &str) {
        self.conditions.push(condition.to_string());
    }

    /// Tag containment against the comma-separated tags column.
    pub(crate) fn push_has_tag(&mut self, tag: &str) {
        self.conditions
            .push("(',' || tags || ',') LIKE ? ESCAPE '\\'".to_string());
        self.params
            .push(Box::new(format!("%,{},%", escape_like(tag))));
    }

    /// Assemble `base [WHERE ...] [suffix]`.
    pub(crate) fn build(&self, base: &str, suffix: &str) -> String {
        let mut sql = base.to_string();
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if !suffix.is_empty() {
            sql.push(' ');
            sql.push_str(suffix);
        }
        sql
    }

    /// Parameters in push order, ready for `rusqlite::params_from_iter`.
    pub(crate) fn params(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

/// Build the WHERE fragment for a `MemoryFilter` over the `memories` table
/// (or an alias of it).
pub(crate) fn filter_conditions(filter: &MemoryFilter, builder: &mut SelectBuilder) {
    if !filter.include_deleted {
        builder.push_raw("is_deleted = 0");
    }
    if let Some(memory_type) = filter.memory_type {
        builder.push("type = ?", memory_type.as_str().to_string());
    }
    if let Some(category) = &filter.category {
        builder.push("category = ?", category.clone());
    }
    for tag in &filter.tags {
        builder.push_has_tag(tag);
    }
    if let Some(who) = &filter.who {
        builder.push("who = ?", who.clone());
    }
    if let Some(pinned) = filter.pinned {
        builder.push("pinned = ?", pinned as i64);
    }
    if let Some(min) = filter.importance_min {
        builder.push("importance >= ?", min);
    }
    if let Some(since) = filter.created_since {
        builder.push("created_at > ?", since);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;

    #[test]
    fn escapes_like_metacharacters() {
        assert_eq!(escape_like("50%_done\\x"), "50\\%\\_done\\\\x");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn builds_where_clause_in_order() {
        let mut builder = SelectBuilder::new();
        let filter = MemoryFilter {
            memory_type: Some(MemoryType::Fact),
            tags: vec!["alpha".to_string()],
            importance_min: Some(0.5),
            ..Default::default()
        };
        filter_conditions(&filter, &mut builder);
        let sql = builder.build("SELECT id FROM memories", "ORDER BY created_at");
        assert!(sql.starts_with("SELECT id FROM memories WHERE is_deleted = 0 AND type = ?"));
        assert!(sql.contains("tags"));
        assert!(sql.ends_with("ORDER BY created_at"));
        assert_eq!(builder.params().len(), 3);
    }

    #[test]
    fn no_conditions_means_no_where() {
        let builder = SelectBuilder::new();
        assert_eq!(builder.build("SELECT 1", ""), "SELECT 1");
    }
}
