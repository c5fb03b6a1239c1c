//! Typed in-memory table of enrolled identity embeddings.
//!
//! Rows are stored as two row-major matrices (base and dynamic) plus a
//! parallel `has_dynamic` flag and an id ⇄ row index map. An identity with
//! no dynamic template carries a copy of its base row in the dynamic matrix
//! so fusion can run over the whole table at once.
//!
//! Mutation is whole-row or whole-table only (`reload`, `upsert_row`,
//! `set_dynamic`, `remove_row`), each taking `&mut self`. The engine thread
//! owns the table and lends `&IdentityTable` to the matcher per cycle, so a
//! reader can never observe a half-written row.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::types::Embedding;

#[derive(Error, Debug, PartialEq)]
pub enum TableError {
    #[error("embedding dimension mismatch: table holds {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("duplicate identity id: {0}")]
    DuplicateId(String),
    #[error("unknown identity id: {0}")]
    UnknownId(String),
    #[error("embedding matrix shape error: {0}")]
    Shape(String),
}

impl From<ndarray::ShapeError> for TableError {
    fn from(e: ndarray::ShapeError) -> Self {
        TableError::Shape(e.to_string())
    }
}

/// Roster metadata carried alongside each row.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMeta {
    pub id: String,
    pub name: String,
    pub default_shift: Option<String>,
}

/// One identity as loaded from the store.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub meta: IdentityMeta,
    pub base: Embedding,
    pub dynamic: Option<Embedding>,
}

#[derive(Debug, Clone)]
pub struct IdentityTable {
    dim: usize,
    meta: Vec<IdentityMeta>,
    index: HashMap<String, usize>,
    base: Array2<f32>,
    dynamic: Array2<f32>,
    has_dynamic: Vec<bool>,
}

impl IdentityTable {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            meta: Vec::new(),
            index: HashMap::new(),
            base: Array2::zeros((0, dim)),
            dynamic: Array2::zeros((0, dim)),
            has_dynamic: Vec::new(),
        }
    }

    /// Build a table from store records, validating every row.
    pub fn from_records(dim: usize, records: Vec<IdentityRecord>) -> Result<Self, TableError> {
        let rows = records.len();
        let mut table = Self::new(dim);
        let mut base = Vec::with_capacity(rows * dim);
        let mut dynamic = Vec::with_capacity(rows * dim);
        for record in records {
            if table.index.contains_key(&record.meta.id) {
                return Err(TableError::DuplicateId(record.meta.id));
            }
            table.check_dim(&record.base)?;
            if let Some(d) = &record.dynamic {
                table.check_dim(d)?;
            }
            base.extend_from_slice(record.base.as_slice());
            dynamic.extend_from_slice(record.dynamic.as_ref().unwrap_or(&record.base).as_slice());
            table.has_dynamic.push(record.dynamic.is_some());
            table.index.insert(record.meta.id.clone(), table.meta.len());
            table.meta.push(record.meta);
        }
        table.base = Array2::from_shape_vec((rows, dim), base)?;
        table.dynamic = Array2::from_shape_vec((rows, dim), dynamic)?;
        Ok(table)
    }

    /// Replace the whole table. On error the current contents are untouched.
    pub fn reload(&mut self, records: Vec<IdentityRecord>) -> Result<(), TableError> {
        let fresh = Self::from_records(self.dim, records)?;
        *self = fresh;
        Ok(())
    }

    /// Insert a new identity or overwrite an existing row in full.
    pub fn upsert_row(&mut self, record: IdentityRecord) -> Result<usize, TableError> {
        self.check_dim(&record.base)?;
        if let Some(dynamic) = &record.dynamic {
            self.check_dim(dynamic)?;
        }
        let dynamic_row = record.dynamic.as_ref().unwrap_or(&record.base);
        let has_dynamic = record.dynamic.is_some();

        if let Some(&row) = self.index.get(&record.meta.id) {
            self.base.row_mut(row).assign(&record.base.view());
            self.dynamic.row_mut(row).assign(&dynamic_row.view());
            self.has_dynamic[row] = has_dynamic;
            self.meta[row] = record.meta;
            return Ok(row);
        }

        let row = self.meta.len();
        self.push_rows(record.base.view(), dynamic_row.view())?;
        self.has_dynamic.push(has_dynamic);
        self.index.insert(record.meta.id.clone(), row);
        self.meta.push(record.meta);
        Ok(row)
    }

    /// Replace an identity's dynamic template and mark it present.
    pub fn set_dynamic(&mut self, id: &str, dynamic: &Embedding) -> Result<(), TableError> {
        self.check_dim(dynamic)?;
        let row = self
            .row_of(id)
            .ok_or_else(|| TableError::UnknownId(id.to_string()))?;
        self.dynamic.row_mut(row).assign(&dynamic.view());
        self.has_dynamic[row] = true;
        Ok(())
    }

    /// Remove an identity. Returns false if it was not present.
    pub fn remove_row(&mut self, id: &str) -> bool {
        let Some(row) = self.index.remove(id) else {
            return false;
        };
        let keep: Vec<usize> = (0..self.meta.len()).filter(|&r| r != row).collect();
        self.base = self.base.select(Axis(0), &keep);
        self.dynamic = self.dynamic.select(Axis(0), &keep);
        self.has_dynamic.remove(row);
        self.meta.remove(row);
        for slot in self.index.values_mut() {
            if *slot > row {
                *slot -= 1;
            }
        }
        true
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    pub fn row_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn meta(&self, row: usize) -> &IdentityMeta {
        &self.meta[row]
    }

    pub fn has_dynamic(&self, row: usize) -> bool {
        self.has_dynamic[row]
    }

    pub fn base_row(&self, row: usize) -> ArrayView1<'_, f32> {
        self.base.row(row)
    }

    pub fn dynamic_row(&self, row: usize) -> ArrayView1<'_, f32> {
        self.dynamic.row(row)
    }

    pub fn base_matrix(&self) -> ArrayView2<'_, f32> {
        self.base.view()
    }

    pub fn dynamic_matrix(&self) -> ArrayView2<'_, f32> {
        self.dynamic.view()
    }

    /// The identity's dynamic template, if one has been learned.
    pub fn dynamic_embedding(&self, row: usize) -> Option<Embedding> {
        if !self.has_dynamic[row] {
            return None;
        }
        Embedding::from_raw(self.dynamic.row(row).to_vec()).ok()
    }

    /// Append one row to both matrices, or to neither.
    fn push_rows(
        &mut self,
        base: ArrayView1<'_, f32>,
        dynamic: ArrayView1<'_, f32>,
    ) -> Result<(), TableError> {
        self.base.push_row(base)?;
        if let Err(e) = self.dynamic.push_row(dynamic) {
            let keep: Vec<usize> = (0..self.meta.len()).collect();
            self.base = self.base.select(Axis(0), &keep);
            return Err(e.into());
        }
        Ok(())
    }

    fn check_dim(&self, e: &Embedding) -> Result<(), TableError> {
        if e.dim() != self.dim {
            return Err(TableError::DimensionMismatch {
                expected: self.dim,
                got: e.dim(),
            });
        }
        Ok(())
    }
}
