//! Builder for the upstream encoded-query DSL.
//!
//! Clauses are joined by `^` (AND) or `^OR`; each clause is
//! `<field><op><value>`. `ORDERBY`/`ORDERBYDESC` clauses terminate the query.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    StartsWith,
    EndsWith,
    Contains,
    DoesNotContain,
    In,
    NotIn,
}

impl QueryOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::StartsWith => "STARTSWITH",
            Self::EndsWith => "ENDSWITH",
            Self::Contains => "CONTAINS",
            Self::DoesNotContain => "DOESNOTCONTAIN",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodedQuery {
    clauses: Vec<String>,
    order: Option<String>,
}

impl EncodedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// AND-append a clause.
    pub fn and(mut self, field: &str, op: QueryOp, value: &str) -> Self {
        self.clauses
            .push(format!("{}{}{}", field, op.as_str(), value));
        self
    }

    /// OR-append a clause to the previous one.
    pub fn or(mut self, field: &str, op: QueryOp, value: &str) -> Self {
        self.clauses
            .push(format!("OR{}{}{}", field, op.as_str(), value));
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order = Some(format!("ORDERBY{}", field));
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order = Some(format!("ORDERBYDESC{}", field));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.order.is_none()
    }

    pub fn build(&self) -> String {
        let mut parts: Vec<&str> = self.clauses.iter().map(String::as_str).collect();
        if let Some(order) = &self.order {
            parts.push(order.as_str());
        }
        parts.join("^")
    }
}

impl fmt::Display for EncodedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_clause() {
        let q = EncodedQuery::new().and("sys_id", QueryOp::Eq, "abc123");
        assert_eq!(q.build(), "sys_id=abc123");
    }

    #[test]
    fn test_and_clauses() {
        let q = EncodedQuery::new()
            .and("state", QueryOp::Ne, "7")
            .and("priority", QueryOp::Le, "2");
        assert_eq!(q.build(), "state!=7^priority<=2");
    }

    #[test]
    fn test_or_clause() {
        let q = EncodedQuery::new()
            .and("element", QueryOp::Eq, "comments")
            .or("element", QueryOp::Eq, "work_notes");
        assert_eq!(q.build(), "element=comments^ORelement=work_notes");
    }

    #[test]
    fn test_order_by_terminates() {
        let q = EncodedQuery::new()
            .and("sys_updated_on", QueryOp::Ge, "2025-01-01 00:00:00")
            .order_by("sys_updated_on");
        assert_eq!(
            q.build(),
            "sys_updated_on>=2025-01-01 00:00:00^ORDERBYsys_updated_on"
        );

        let desc = EncodedQuery::new()
            .and("active", QueryOp::Eq, "true")
            .order_by_desc("sys_created_on");
        assert_eq!(desc.build(), "active=true^ORDERBYDESCsys_created_on");
    }

    #[test]
    fn test_text_operators() {
        let q = EncodedQuery::new()
            .and("short_description", QueryOp::Like, "email")
            .and("number", QueryOp::StartsWith, "INC")
            .and("assignment_group", QueryOp::In, "net,ops");
        assert_eq!(
            q.build(),
            "short_descriptionLIKEemail^numberSTARTSWITHINC^assignment_groupINnet,ops"
        );
    }
}
