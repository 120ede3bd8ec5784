//! Shared AST traversal helpers for the sqlparser-backed engine.
//!
//! One generic walker drives every read-only analysis (scope, safety,
//! lineage, diff decomposition). Callbacks fire for each query, select,
//! table factor, and expression encountered, in source order.

use sqlparser::ast::{
    Delete, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    ObjectName, ObjectNamePart, Query, Select, SetExpr, Statement, TableFactor, TableWithJoins,
};

use crate::sql::types::TableRef;

/// Callbacks invoked during a traversal. Any of them may be a no-op.
pub(crate) struct AstWalker<'a> {
    pub on_query: &'a mut dyn FnMut(&Query),
    pub on_select: &'a mut dyn FnMut(&Select),
    pub on_table: &'a mut dyn FnMut(&TableFactor),
    pub on_expr: &'a mut dyn FnMut(&Expr),
}

impl AstWalker<'_> {
    pub(crate) fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => self.query(query),
            Statement::Insert(insert) => {
                if let Some(source) = &insert.source {
                    self.query(source);
                }
            }
            Statement::CreateTable(create) => {
                if let Some(query) = &create.query {
                    self.query(query);
                }
            }
            Statement::CreateView { query, .. } => self.query(query),
            Statement::Delete(delete) => self.delete(delete),
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                self.table_with_joins(table);
                for assignment in assignments {
                    self.expr(&assignment.value);
                }
                if let Some(selection) = selection {
                    self.expr(selection);
                }
            }
            Statement::Explain { statement, .. } => self.statement(statement),
            _ => {}
        }
    }

    fn delete(&mut self, delete: &Delete) {
        let tables = match &delete.from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        for table in tables {
            self.table_with_joins(table);
        }
        if let Some(selection) = &delete.selection {
            self.expr(selection);
        }
    }

    pub(crate) fn query(&mut self, query: &Query) {
        (self.on_query)(query);
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.query(&cte.query);
            }
        }
        self.set_expr(&query.body);
    }

    fn set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.expr(expr);
                    }
                }
            }
            _ => {}
        }
    }

    fn select(&mut self, select: &Select) {
        (self.on_select)(select);
        for item in &select.projection {
            if let Some(expr) = select_item_expr(item) {
                self.expr(expr);
            }
        }
        for table in &select.from {
            self.table_with_joins(table);
        }
        if let Some(selection) = &select.selection {
            self.expr(selection);
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                self.expr(expr);
            }
        }
        if let Some(having) = &select.having {
            self.expr(having);
        }
        if let Some(qualify) = &select.qualify {
            self.expr(qualify);
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) {
        self.table_factor(&table.relation);
        for join in &table.joins {
            self.table_factor(&join.relation);
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        (self.on_table)(factor);
        match factor {
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            TableFactor::TableFunction { expr, .. } => self.expr(expr),
            TableFactor::UNNEST { array_exprs, .. } => {
                for expr in array_exprs {
                    self.expr(expr);
                }
            }
            TableFactor::Pivot { table, .. } => self.table_factor(table),
            TableFactor::Unpivot { table, .. } => self.table_factor(table),
            _ => {}
        }
    }

    pub(crate) fn expr(&mut self, expr: &Expr) {
        (self.on_expr)(expr);
        match expr {
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { expr, .. } => self.expr(expr),
            Expr::Nested(inner) => self.expr(inner),
            Expr::Cast { expr, .. } => self.expr(expr),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner) => self.expr(inner),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.expr(left);
                self.expr(right);
            }
            Expr::InList { expr, list, .. } => {
                self.expr(expr);
                for item in list {
                    self.expr(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr);
                self.query(subquery);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr);
                self.expr(low);
                self.expr(high);
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.expr(expr);
                self.expr(pattern);
            }
            Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                if let Some(operand) = operand {
                    self.expr(operand);
                }
                for when in conditions {
                    self.expr(&when.condition);
                    self.expr(&when.result);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result);
                }
            }
            Expr::Function(function) => self.function_arguments(&function.args),
            Expr::Exists { subquery, .. } => self.query(subquery),
            Expr::Subquery(subquery) => self.query(subquery),
            Expr::Tuple(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            Expr::Extract { expr, .. } => self.expr(expr),
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                self.expr(expr);
                if let Some(from) = substring_from {
                    self.expr(from);
                }
                if let Some(len) = substring_for {
                    self.expr(len);
                }
            }
            _ => {}
        }
    }

    fn function_arguments(&mut self, args: &FunctionArguments) {
        match args {
            FunctionArguments::List(list) => {
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Named { arg, .. } | FunctionArg::ExprNamed { arg, .. } => arg,
                        FunctionArg::Unnamed(arg) => arg,
                    };
                    if let FunctionArgExpr::Expr(expr) = arg_expr {
                        self.expr(expr);
                    }
                }
            }
            FunctionArguments::Subquery(subquery) => self.query(subquery),
            FunctionArguments::None => {}
        }
    }
}

/// Return the expression carried by a SELECT item, if any (wildcards carry
/// none).
pub(crate) fn select_item_expr(item: &sqlparser::ast::SelectItem) -> Option<&Expr> {
    use sqlparser::ast::SelectItem;
    match item {
        SelectItem::UnnamedExpr(expr) => Some(expr),
        SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

/// Extract the identifier value of one object-name part.
pub(crate) fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        other => other.to_string(),
    }
}

/// Convert a dotted object name into a [`TableRef`]. The last part is the
/// table name, the one before it the schema, the one before that the catalog.
pub(crate) fn table_ref_from(name: &ObjectName) -> TableRef {
    let parts: Vec<String> = name.0.iter().map(part_value).collect();
    let mut iter = parts.into_iter().rev();
    let table = iter.next().unwrap_or_default();
    let schema = iter.next();
    let catalog = iter.next();
    TableRef {
        catalog,
        schema,
        name: table,
    }
}

/// Collect the (lowercased) names of every CTE defined anywhere in the
/// statement, including nested WITH clauses.
pub(crate) fn collect_cte_names(statement: &Statement) -> std::collections::BTreeSet<String> {
    let mut names = std::collections::BTreeSet::new();
    let mut on_query = |query: &Query| {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                names.insert(cte.alias.name.value.to_lowercase());
            }
        }
    };
    let mut noop_select = |_: &Select| {};
    let mut noop_table = |_: &TableFactor| {};
    let mut noop_expr = |_: &Expr| {};
    AstWalker {
        on_query: &mut on_query,
        on_select: &mut noop_select,
        on_table: &mut noop_table,
        on_expr: &mut noop_expr,
    }
    .statement(statement);
    names
}

/// Collect every named table factor in the statement, in traversal order,
/// duplicates included.
pub(crate) fn collect_tables(statement: &Statement) -> Vec<TableRef> {
    let mut tables = Vec::new();
    let mut on_table = |factor: &TableFactor| {
        if let TableFactor::Table { name, .. } = factor {
            tables.push(table_ref_from(name));
        }
    };
    let mut noop_query = |_: &Query| {};
    let mut noop_select = |_: &Select| {};
    let mut noop_expr = |_: &Expr| {};
    AstWalker {
        on_query: &mut noop_query,
        on_select: &mut noop_select,
        on_table: &mut on_table,
        on_expr: &mut noop_expr,
    }
    .statement(statement);
    tables
}

/// Collect every named table factor reachable from a query node.
pub(crate) fn collect_tables_in_query(query: &Query) -> Vec<TableRef> {
    let mut tables = Vec::new();
    let mut on_table = |factor: &TableFactor| {
        if let TableFactor::Table { name, .. } = factor {
            tables.push(table_ref_from(name));
        }
    };
    let mut noop_query = |_: &Query| {};
    let mut noop_select = |_: &Select| {};
    let mut noop_expr = |_: &Expr| {};
    AstWalker {
        on_query: &mut noop_query,
        on_select: &mut noop_select,
        on_table: &mut on_table,
        on_expr: &mut noop_expr,
    }
    .query(query);
    tables
}

/// Return the primary query of a statement (SELECT, CREATE … AS SELECT,
/// INSERT … SELECT), if it has one.
pub(crate) fn statement_query(statement: &Statement) -> Option<&Query> {
    match statement {
        Statement::Query(query) => Some(query),
        Statement::CreateTable(create) => create.query.as_deref(),
        Statement::CreateView { query, .. } => Some(query),
        Statement::Insert(insert) => insert.source.as_deref(),
        _ => None,
    }
}

/// Return the first SELECT in a query body, descending through nested
/// queries and the left arm of set operations.
pub(crate) fn first_select(query: &Query) -> Option<&Select> {
    fn from_body(body: &SetExpr) -> Option<&Select> {
        match body {
            SetExpr::Select(select) => Some(select),
            SetExpr::Query(query) => from_body(&query.body),
            SetExpr::SetOperation { left, .. } => from_body(left),
            _ => None,
        }
    }
    from_body(&query.body)
}
