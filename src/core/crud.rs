//! SELECT and write helpers on top of [`Connection::query`]
//!
//! Table names go through [`Connection::table_name`], so the domain's
//! prefix and schema apply; column names and raw expressions are passed
//! through untouched.

use super::connection::Connection;
use super::error::Result;
use super::query::QueryFlags;
use super::query_builder::{
    check_unique_key, insert_select_sql, replace_sql, unique_key_conditions, upsert_sql,
    Assignments, Conditions, DeleteBuilder, InsertBuilder, Join, SelectBuilder, SelectOptions,
    UpdateBuilder,
};
use super::transaction::Cancelable;
use super::value::{DatabaseRow, DatabaseValue, ResultWrapper};
use crate::backends::ReplaceStyle;

impl Connection {
    /// Render a SELECT against resolved table names without running it
    pub fn select_sql_text(
        &self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        options: &SelectOptions,
        joins: &[Join],
    ) -> String {
        let from = tables.iter().map(|t| self.table_name_with_alias(t)).collect();
        let mut builder = SelectBuilder::new(from)
            .columns(vars)
            .conditions(conds.clone())
            .options(options.clone());
        for join in joins {
            builder = builder.join(
                join.join_type,
                self.table_name_with_alias(&join.table),
                join.on.clone(),
            );
        }
        builder.build(self.driver.dialect())
    }

    /// Run a SELECT
    pub async fn select(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<ResultWrapper> {
        let sql = self.select_sql_text(tables, vars, conds, options, joins);
        self.query(&sql, fname, QueryFlags::empty()).await
    }

    /// First matching row
    pub async fn select_row(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseRow>> {
        let options = options.clone().limit(1);
        let result = self.select(tables, vars, conds, fname, &options, joins).await?;
        Ok(result.into_rows().into_iter().next())
    }

    /// Single value of the first matching row
    pub async fn select_field(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseValue>> {
        let row = self
            .select_row(tables, &[var], conds, fname, options, joins)
            .await?;
        Ok(row.and_then(|r| r.get_index(0).cloned()))
    }

    /// One value per matching row
    pub async fn select_field_values(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Vec<DatabaseValue>> {
        let result = self
            .select(tables, &[var], conds, fname, options, joins)
            .await?;
        Ok(result
            .into_rows()
            .into_iter()
            .filter_map(|row| row.get_index(0).cloned())
            .collect())
    }

    /// Number of matching rows; with `var` other than `*`, rows where it is
    /// NULL are not counted
    pub async fn select_row_count(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<u64> {
        let mut conds = conds.clone();
        if var != "*" {
            conds = conds.not_null(var);
        }
        let inner = self.select_sql_text(tables, &["1"], &conds, options, joins);
        let sql = format!("SELECT COUNT(*) AS rowcount FROM ({}) tmp_count", inner);
        let result = self.query(&sql, fname, QueryFlags::empty()).await?;
        Ok(result
            .first()
            .and_then(|row| row.get("rowcount"))
            .and_then(|v| v.as_long())
            .map_or(0, |n| n.max(0) as u64))
    }

    /// Insert rows sharing the same columns; returns the affected count
    ///
    /// With `ignore`, rows violating a unique key are skipped.
    pub async fn insert(
        &mut self,
        table: &str,
        rows: &[DatabaseRow],
        fname: &str,
        ignore: bool,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = InsertBuilder::new(self.table_name(table))
            .rows(rows.iter().cloned())
            .ignore(ignore)
            .build(self.driver.dialect())?;
        let result = self.query(&sql, fname, QueryFlags::empty()).await?;
        Ok(result.affected_rows())
    }

    /// Update matching rows
    ///
    /// Empty conditions are rejected unless built with
    /// [`Conditions::all_rows`].
    pub async fn update(
        &mut self,
        table: &str,
        set: &Assignments,
        conds: &Conditions,
        fname: &str,
    ) -> Result<u64> {
        conds.require_filter(fname)?;
        let sql = UpdateBuilder::new(self.table_name(table))
            .set(set.clone())
            .conditions(conds.clone())
            .build(self.driver.dialect())?;
        let result = self.query(&sql, fname, QueryFlags::empty()).await?;
        Ok(result.affected_rows())
    }

    /// Delete matching rows; same filter rule as [`Connection::update`]
    pub async fn delete(&mut self, table: &str, conds: &Conditions, fname: &str) -> Result<u64> {
        conds.require_filter(fname)?;
        let sql = DeleteBuilder::new(self.table_name(table))
            .conditions(conds.clone())
            .build(self.driver.dialect());
        let result = self.query(&sql, fname, QueryFlags::empty()).await?;
        Ok(result.affected_rows())
    }

    /// Insert rows, first removing any row with the same `unique_key`
    ///
    /// The old row is deleted rather than updated, so on SQLite and MySQL
    /// an auto-increment column of a replaced row receives a new value.
    /// Without a unique key this is a plain insert.
    pub async fn replace(
        &mut self,
        table: &str,
        unique_key: &[&str],
        rows: &[DatabaseRow],
        fname: &str,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if unique_key.is_empty() {
            return self.insert(table, rows, fname, false).await;
        }
        check_unique_key(rows, unique_key)?;

        let affected = match self.driver.replace_style() {
            ReplaceStyle::Native => {
                let sql = replace_sql(self.driver.dialect(), &self.table_name(table), rows)?;
                self.query(&sql, fname, QueryFlags::empty())
                    .await?
                    .affected_rows()
            }
            ReplaceStyle::Emulated => {
                let table = table.to_string();
                let key: Vec<String> = unique_key.iter().map(|k| k.to_string()).collect();
                let rows = rows.to_vec();
                let caller = fname.to_string();
                self.do_atomic_section(fname, Cancelable::Yes, move |conn| {
                    Box::pin(async move {
                        let key: Vec<&str> = key.iter().map(String::as_str).collect();
                        let mut affected = 0;
                        for row in &rows {
                            let conds = unique_key_conditions(row, &key)?;
                            affected += conn.delete(&table, &conds, &caller).await?;
                            affected += conn
                                .insert(&table, std::slice::from_ref(row), &caller, false)
                                .await?;
                        }
                        Ok(affected)
                    })
                })
                .await?
            }
        };

        let affected = self.driver.adjust_upsert_affected_rows(affected, rows.len());
        self.set_affected_rows(affected);
        Ok(affected)
    }

    /// Insert rows, applying `set` to those whose `unique_key` already exists
    pub async fn upsert(
        &mut self,
        table: &str,
        rows: &[DatabaseRow],
        unique_key: &[&str],
        set: &Assignments,
        fname: &str,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql(
            self.driver.dialect(),
            &self.table_name(table),
            rows,
            unique_key,
            set,
        )?;
        let affected = self
            .query(&sql, fname, QueryFlags::empty())
            .await?
            .affected_rows();
        let affected = self.driver.adjust_upsert_affected_rows(affected, rows.len());
        self.set_affected_rows(affected);
        Ok(affected)
    }

    /// Copy rows selected from `src_tables` into `dest_table`
    ///
    /// `var_map` pairs destination columns with source expressions. Runs as
    /// one `INSERT ... SELECT` in CLI mode when the backend considers it
    /// safe for these options; otherwise the rows are read and written back
    /// in batches inside an atomic section.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_select(
        &mut self,
        dest_table: &str,
        src_tables: &[&str],
        var_map: &[(&str, &str)],
        conds: &Conditions,
        fname: &str,
        ignore: bool,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<u64> {
        let dest_columns: Vec<&str> = var_map.iter().map(|(dest, _)| *dest).collect();
        let src_vars: Vec<&str> = var_map.iter().map(|(_, src)| *src).collect();

        if self.config.cli_mode && self.driver.is_insert_select_safe(options) {
            let select = self.select_sql_text(src_tables, &src_vars, conds, options, joins);
            let sql = insert_select_sql(
                self.driver.dialect(),
                &self.table_name(dest_table),
                &dest_columns,
                &select,
                ignore,
            );
            let result = self.query(&sql, fname, QueryFlags::empty()).await?;
            return Ok(result.affected_rows());
        }

        let selected = self
            .select(src_tables, &src_vars, conds, fname, options, joins)
            .await?;
        let rows: Vec<DatabaseRow> = selected
            .into_rows()
            .into_iter()
            .map(|src| {
                dest_columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        (
                            column.to_string(),
                            src.get_index(i).cloned().unwrap_or(DatabaseValue::Null),
                        )
                    })
                    .collect()
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        tracing::debug!(
            target: "rdbms::query",
            fname,
            rows = rows.len(),
            "INSERT SELECT emulated with batched inserts"
        );
        let batch_size = self.config.non_native_insert_select_batch_size.max(1);
        let table = dest_table.to_string();
        let caller = fname.to_string();
        let affected = self
            .do_atomic_section(fname, Cancelable::Yes, move |conn| {
                Box::pin(async move {
                    let mut affected = 0;
                    for batch in rows.chunks(batch_size) {
                        affected += conn.insert(&table, batch, &caller, ignore).await?;
                    }
                    Ok(affected)
                })
            })
            .await?;
        self.set_affected_rows(affected);
        Ok(affected)
    }
}
