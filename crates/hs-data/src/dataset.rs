//! In-memory columnar table of decay candidates.
//!
//! Column-major storage (one `Vec<f64>` per named column), the same layout
//! the likelihood code consumes. Boolean flags are stored as 1/0.

use std::collections::HashMap;

use hs_core::{Error, Result};

use crate::expr::{CompiledExpr, Expr, is_true};

/// Columnar table with named `f64` columns.
#[derive(Debug, Clone, Default)]
pub struct TabularDataset {
    n_rows: usize,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    index: HashMap<String, usize>,
}

impl TabularDataset {
    /// Build a dataset from `(name, values)` pairs.
    ///
    /// All columns must have the same length and distinct names.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let n_rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut ds = TabularDataset { n_rows, ..Default::default() };
        for (name, values) in columns {
            ds.add_column(name, values)?;
        }
        Ok(ds)
    }

    /// Number of rows.
    pub fn count(&self) -> usize {
        self.n_rows
    }

    /// `true` when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Column names in storage order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Borrow a column.
    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.index.get(name).map(|&i| self.columns[i].as_slice()).ok_or_else(|| {
            Error::UndefinedColumn { column: name.to_string(), expression: name.to_string() }
        })
    }

    /// Append a new column. Fails if the name is taken or the length differs.
    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(Error::Validation(format!("column '{name}' already exists")));
        }
        if self.names.is_empty() && self.n_rows == 0 {
            self.n_rows = values.len();
        }
        if values.len() != self.n_rows {
            return Err(Error::Validation(format!(
                "column '{name}' has {} rows, expected {}",
                values.len(),
                self.n_rows
            )));
        }
        self.index.insert(name.clone(), self.names.len());
        self.names.push(name);
        self.columns.push(values);
        Ok(())
    }

    /// Overwrite an existing column, or append it when absent.
    pub fn set_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        match self.index.get(name) {
            Some(&i) if values.len() == self.n_rows => {
                self.columns[i] = values;
                Ok(())
            }
            Some(_) => Err(Error::Validation(format!(
                "column '{name}' has {} rows, expected {}",
                values.len(),
                self.n_rows
            ))),
            None => self.add_column(name, values),
        }
    }

    /// Rename a column.
    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        if self.index.contains_key(to) {
            return Err(Error::Validation(format!("column '{to}' already exists")));
        }
        let i = self.index.remove(from).ok_or_else(|| Error::UndefinedColumn {
            column: from.to_string(),
            expression: format!("rename {from} -> {to}"),
        })?;
        self.names[i] = to.to_string();
        self.index.insert(to.to_string(), i);
        Ok(())
    }

    /// Resolve an expression against this dataset's columns.
    ///
    /// An unknown column fails with [`Error::UndefinedColumn`].
    pub fn compile(&self, expr: &Expr) -> Result<CompiledExpr> {
        expr.bind(&self.names).map_err(|column| Error::UndefinedColumn {
            column,
            expression: expr.to_string(),
        })
    }

    /// Evaluate an expression for every row.
    pub fn evaluate(&self, expr: &Expr) -> Result<Vec<f64>> {
        let compiled = self.compile(expr)?;
        Ok(compiled.eval_bulk(&self.columns, self.n_rows))
    }

    /// Row mask for a boolean expression.
    pub fn mask(&self, predicate: &Expr) -> Result<Vec<bool>> {
        Ok(self.evaluate(predicate)?.into_iter().map(is_true).collect())
    }

    /// Number of rows satisfying `predicate`, without materialising them.
    pub fn count_where(&self, predicate: &Expr) -> Result<usize> {
        Ok(self.mask(predicate)?.into_iter().filter(|&b| b).count())
    }

    /// Rows satisfying `predicate`, as a new dataset. `self` is untouched.
    pub fn filter(&self, predicate: &Expr) -> Result<TabularDataset> {
        let mask = self.mask(predicate)?;
        Ok(self.select_rows(&mask))
    }

    /// Rows satisfying every expression in `predicates`.
    pub fn filter_all(&self, predicates: &[Expr]) -> Result<TabularDataset> {
        self.filter(&Expr::all(predicates.iter().cloned()))
    }

    /// Keep only rows satisfying `predicate`.
    pub fn filter_in_place(&mut self, predicate: &Expr) -> Result<()> {
        let mask = self.mask(predicate)?;
        for col in &mut self.columns {
            let mut keep = mask.iter();
            col.retain(|_| keep.next().copied().unwrap_or(false));
        }
        self.n_rows = mask.iter().filter(|&&b| b).count();
        Ok(())
    }

    /// Rows where `mask` is true. `mask` shorter than the table drops the tail.
    pub fn select_rows(&self, mask: &[bool]) -> TabularDataset {
        let keep: Vec<usize> =
            mask.iter().enumerate().filter(|&(_, &b)| b).map(|(i, _)| i).collect();
        let columns = self
            .columns
            .iter()
            .map(|col| keep.iter().map(|&i| col[i]).collect::<Vec<f64>>())
            .collect();
        TabularDataset {
            n_rows: keep.len(),
            names: self.names.clone(),
            columns,
            index: self.index.clone(),
        }
    }

    /// Compute `name = expression` row by row. An existing column is replaced.
    ///
    /// Referencing a missing column fails with [`Error::InvalidExpression`].
    pub fn derive(&mut self, name: &str, expression: &Expr) -> Result<()> {
        let compiled = expression.bind(&self.names).map_err(|missing| {
            Error::InvalidExpression(format!(
                "cannot derive '{name}' = {expression}: missing column '{missing}'"
            ))
        })?;
        let values = compiled.eval_bulk(&self.columns, self.n_rows);
        match self.index.get(name) {
            Some(&i) => self.columns[i] = values,
            None => self.add_column(name, values)?,
        }
        Ok(())
    }

    /// [`derive`](Self::derive) from an expression string.
    pub fn derive_str(&mut self, name: &str, expression: &str) -> Result<()> {
        let expr = Expr::parse(expression)?;
        self.derive(name, &expr)
    }

    /// Append the rows of `other` (same column set) to this dataset.
    pub fn append(&mut self, other: &TabularDataset) -> Result<()> {
        if self.names.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        for name in &self.names {
            if !other.has_column(name) {
                return Err(Error::Validation(format!(
                    "cannot append: column '{name}' missing in other dataset"
                )));
            }
        }
        for (i, name) in self.names.iter().enumerate() {
            self.columns[i].extend_from_slice(other.column(name)?);
        }
        self.n_rows += other.n_rows;
        Ok(())
    }

    /// Iterate `(name, values)` in storage order.
    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.names.iter().zip(&self.columns).map(|(n, c)| (n.as_str(), c.as_slice()))
    }
}
