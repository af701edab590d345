//! Recursive collection of referenced objects from a parsed query.
//!
//! Walks every clause of a `SELECT` tree (CTEs, set operations, derived
//! tables, subqueries in any expression position) and gathers the tables,
//! columns and functions it touches. Nested DML - writable CTEs, `INSERT`
//! inside a set expression - aborts the walk with a security violation so
//! the statement-kind gate cannot be smuggled past inside a query body.

use compact_str::CompactString;
use indexmap::IndexSet;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint,
    LimitClause, ObjectName, OrderByKind, Query, SetExpr, TableFactor, WindowType
};

use crate::error::{QueryError, security_violation};

/// Everything a statement references.
#[derive(Debug, Default)]
pub struct SqlObjects {
    /// Base relations, dotted where schema-qualified, original case.
    pub tables:    IndexSet<CompactString>,
    /// `(qualifier, column)` pairs; the qualifier is the textual prefix,
    /// which may be an alias rather than a real table.
    pub columns:   IndexSet<(Option<CompactString>, CompactString)>,
    /// Called functions, dotted where schema-qualified.
    pub functions: IndexSet<CompactString>
}

/// Unquoted, dot-joined rendering of an object name.
pub fn object_name_text(name: &ObjectName) -> CompactString {
    let mut out = String::new();
    for (i, part) in name.0.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(part.to_string().trim_matches('"'));
    }
    out.into()
}

pub fn collect_query(query: &Query, objects: &mut SqlObjects) -> Result<(), QueryError> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, objects)?;
        }
    }
    collect_set_expr(&query.body, objects)?;

    if let Some(order_by) = &query.order_by
        && let OrderByKind::Expressions(exprs) = &order_by.kind
    {
        for expr in exprs {
            collect_expr(&expr.expr, objects)?;
        }
    }
    if let Some(limit_clause) = &query.limit_clause {
        match limit_clause {
            LimitClause::LimitOffset {
                limit,
                offset,
                limit_by
            } => {
                if let Some(limit) = limit {
                    collect_expr(limit, objects)?;
                }
                if let Some(offset) = offset {
                    collect_expr(&offset.value, objects)?;
                }
                for expr in limit_by {
                    collect_expr(expr, objects)?;
                }
            }
            LimitClause::OffsetCommaLimit {
                offset,
                limit
            } => {
                collect_expr(offset, objects)?;
                collect_expr(limit, objects)?;
            }
        }
    }
    Ok(())
}

fn collect_set_expr(set_expr: &SetExpr, objects: &mut SqlObjects) -> Result<(), QueryError> {
    match set_expr {
        SetExpr::Select(select) => {
            for item in &select.projection {
                if let sqlparser::ast::SelectItem::UnnamedExpr(expr)
                | sqlparser::ast::SelectItem::ExprWithAlias {
                    expr, ..
                } = item
                {
                    collect_expr(expr, objects)?;
                }
            }
            for table in &select.from {
                collect_table_factor(&table.relation, objects)?;
                for join in &table.joins {
                    collect_table_factor(&join.relation, objects)?;
                    if let Some(constraint) = join_constraint(&join.join_operator)
                        && let JoinConstraint::On(expr) = constraint
                    {
                        collect_expr(expr, objects)?;
                    }
                }
            }
            if let Some(selection) = &select.selection {
                collect_expr(selection, objects)?;
            }
            if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
                for expr in exprs {
                    collect_expr(expr, objects)?;
                }
            }
            if let Some(having) = &select.having {
                collect_expr(having, objects)?;
            }
            Ok(())
        }
        SetExpr::SetOperation {
            left,
            right,
            ..
        } => {
            collect_set_expr(left, objects)?;
            collect_set_expr(right, objects)
        }
        SetExpr::Query(query) => collect_query(query, objects),
        SetExpr::Values(values) => {
            for row in &values.rows {
                for expr in row {
                    collect_expr(expr, objects)?;
                }
            }
            Ok(())
        }
        SetExpr::Table(table) => {
            if let Some(name) = &table.table_name {
                let text = match &table.schema_name {
                    Some(schema) => format!("{}.{}", schema, name),
                    None => name.clone()
                };
                objects.tables.insert(text.into());
            }
            Ok(())
        }
        SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Delete(_) | SetExpr::Merge(_) => Err(
            security_violation("Data-modifying statements are not allowed inside queries")
        )
    }
}

fn join_constraint(
    op: &sqlparser::ast::JoinOperator
) -> Option<&sqlparser::ast::JoinConstraint> {
    use sqlparser::ast::JoinOperator;
    match op {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => Some(c),
        _ => None
    }
}

fn collect_table_factor(
    table_factor: &TableFactor,
    objects: &mut SqlObjects
) -> Result<(), QueryError> {
    match table_factor {
        TableFactor::Table {
            name,
            args,
            ..
        } => {
            // `FROM generate_series(...)` is a function call, not a relation.
            if args.is_some() {
                objects.functions.insert(object_name_text(name));
            } else {
                objects.tables.insert(object_name_text(name));
            }
            Ok(())
        }
        TableFactor::Derived {
            subquery, ..
        } => collect_query(subquery, objects),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_table_factor(&table_with_joins.relation, objects)?;
            for join in &table_with_joins.joins {
                collect_table_factor(&join.relation, objects)?;
                if let Some(JoinConstraint::On(expr)) = join_constraint(&join.join_operator) {
                    collect_expr(expr, objects)?;
                }
            }
            Ok(())
        }
        TableFactor::TableFunction {
            expr, ..
        } => collect_expr(expr, objects),
        TableFactor::UNNEST {
            array_exprs, ..
        } => {
            for expr in array_exprs {
                collect_expr(expr, objects)?;
            }
            Ok(())
        }
        _ => Ok(())
    }
}

fn collect_expr(expr: &Expr, objects: &mut SqlObjects) -> Result<(), QueryError> {
    match expr {
        Expr::Identifier(ident) => {
            objects
                .columns
                .insert((None, ident.value.as_str().into()));
            Ok(())
        }
        Expr::CompoundIdentifier(idents) => {
            if let Some(col) = idents.last() {
                let qualifier = if idents.len() >= 2 {
                    Some(CompactString::from(idents[idents.len() - 2].value.as_str()))
                } else {
                    None
                };
                objects
                    .columns
                    .insert((qualifier, col.value.as_str().into()));
            }
            Ok(())
        }
        Expr::Function(func) => {
            objects.functions.insert(object_name_text(&func.name));
            match &func.args {
                FunctionArguments::List(arg_list) => {
                    for arg in &arg_list.args {
                        match arg {
                            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                                collect_expr(e, objects)?;
                            }
                            FunctionArg::Named {
                                arg: FunctionArgExpr::Expr(e),
                                ..
                            } => {
                                collect_expr(e, objects)?;
                            }
                            _ => {}
                        }
                    }
                }
                FunctionArguments::Subquery(query) => collect_query(query, objects)?,
                FunctionArguments::None => {}
            }
            if let Some(filter) = &func.filter {
                collect_expr(filter, objects)?;
            }
            if let Some(WindowType::WindowSpec(spec)) = &func.over {
                for part in &spec.partition_by {
                    collect_expr(part, objects)?;
                }
                for order in &spec.order_by {
                    collect_expr(&order.expr, objects)?;
                }
            }
            for order in &func.within_group {
                collect_expr(&order.expr, objects)?;
            }
            Ok(())
        }
        Expr::BinaryOp {
            left,
            right,
            ..
        } => {
            collect_expr(left, objects)?;
            collect_expr(right, objects)
        }
        Expr::UnaryOp {
            expr, ..
        }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr)
        | Expr::IsUnknown(expr)
        | Expr::IsNotUnknown(expr)
        | Expr::Cast {
            expr, ..
        }
        | Expr::Extract {
            expr, ..
        }
        | Expr::Collate {
            expr, ..
        } => collect_expr(expr, objects),
        Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
            collect_expr(left, objects)?;
            collect_expr(right, objects)
        }
        Expr::InList {
            expr,
            list,
            ..
        } => {
            collect_expr(expr, objects)?;
            for item in list {
                collect_expr(item, objects)?;
            }
            Ok(())
        }
        Expr::InSubquery {
            expr,
            subquery,
            ..
        } => {
            collect_expr(expr, objects)?;
            collect_query(subquery, objects)
        }
        Expr::Between {
            expr,
            low,
            high,
            ..
        } => {
            collect_expr(expr, objects)?;
            collect_expr(low, objects)?;
            collect_expr(high, objects)
        }
        Expr::Like {
            expr,
            pattern,
            ..
        }
        | Expr::ILike {
            expr,
            pattern,
            ..
        }
        | Expr::SimilarTo {
            expr,
            pattern,
            ..
        } => {
            collect_expr(expr, objects)?;
            collect_expr(pattern, objects)
        }
        Expr::AnyOp {
            left,
            right,
            ..
        }
        | Expr::AllOp {
            left,
            right,
            ..
        } => {
            collect_expr(left, objects)?;
            collect_expr(right, objects)
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(op) = operand {
                collect_expr(op, objects)?;
            }
            for case_when in conditions {
                collect_expr(&case_when.condition, objects)?;
                collect_expr(&case_when.result, objects)?;
            }
            if let Some(else_res) = else_result {
                collect_expr(else_res, objects)?;
            }
            Ok(())
        }
        Expr::Exists {
            subquery, ..
        }
        | Expr::Subquery(subquery) => collect_query(subquery, objects),
        Expr::Tuple(exprs) => {
            for e in exprs {
                collect_expr(e, objects)?;
            }
            Ok(())
        }
        _ => Ok(())
    }
}
