//! Values that flow between pipeline nodes.
//!
//! Every dataset in the catalog loads and saves a [`Data`]. Tables are Arrow
//! record batches; cleaning, sorting, grouping and joining all run on Arrow
//! compute kernels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, RecordBatch, Scalar, UInt32Array};
use arrow::compute::kernels::cmp::gt_eq;
use arrow::compute::kernels::zip::zip;
use arrow::compute::{
    and, cast, filter_record_batch, is_not_null, lexsort_to_indices, take, take_record_batch, SortColumn,
    SortOptions,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::row::{RowConverter, SortField};
use serde_json::Value;
use thiserror::Error;

/// A value produced or consumed by a node
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Columnar table
    Table(Table),

    /// Arbitrary structured object (fitted scalers, parameters, reports)
    Object(Value),

    /// RGB raster
    Image(ImageData),
}

impl Data {
    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Data::Table(_) => "table",
            Data::Object(_) => "object",
            Data::Image(_) => "image",
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Data::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Data::Object(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            Data::Image(image) => Some(image),
            _ => None,
        }
    }

    /// Take the table out of this value, failing on any other variant
    pub fn into_table(self) -> Result<Table, TableError> {
        match self {
            Data::Table(table) => Ok(table),
            other => Err(TableError::NotATable(other.kind())),
        }
    }
}

impl From<Table> for Data {
    fn from(table: Table) -> Self {
        Data::Table(table)
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::Object(value)
    }
}

impl From<ImageData> for Data {
    fn from(image: ImageData) -> Self {
        Data::Image(image)
    }
}

/// Errors raised by table operations
#[derive(Debug, Error)]
pub enum TableError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("tables differ in length: {left} rows vs {right} rows")]
    LengthMismatch { left: usize, right: usize },

    #[error("expected a table, got {0}")]
    NotATable(&'static str),

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

/// How [`Table::join`] keeps unmatched rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
}

/// A table backed by a single Arrow record batch
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    batch: RecordBatch,
}

impl Table {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Build a table from named columns. Every field is nullable.
    pub fn from_columns<I, N>(columns: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (N, ArrayRef)>,
        N: AsRef<str>,
    {
        let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = columns
            .into_iter()
            .map(|(name, array)| (Field::new(name.as_ref(), array.data_type().clone(), true), array))
            .unzip();
        let schema = Arc::new(Schema::new(fields));
        if arrays.is_empty() {
            return Ok(Self::new(RecordBatch::new_empty(schema)));
        }
        Ok(Self::new(RecordBatch::try_new(schema, arrays)?))
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.batch
            .schema_ref()
            .index_of(name)
            .map_err(|_| TableError::UnknownColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<&ArrayRef, TableError> {
        Ok(self.batch.column(self.column_index(name)?))
    }

    fn indices(&self, names: &[&str]) -> Result<Vec<usize>, TableError> {
        names.iter().map(|n| self.column_index(n)).collect()
    }

    fn keys(&self, names: &[&str]) -> Result<Vec<ArrayRef>, TableError> {
        names.iter().map(|n| self.column(n).cloned()).collect()
    }

    fn named_columns(&self) -> impl Iterator<Item = (String, ArrayRef)> + '_ {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .zip(self.batch.columns())
            .map(|(field, column)| (field.name().clone(), column.clone()))
    }

    fn with_columns(&self, columns: Vec<ArrayRef>) -> Result<Table, TableError> {
        Ok(Table::new(RecordBatch::try_new(self.batch.schema(), columns)?))
    }

    /// Numeric view of a column; cells that do not cast to a float are `None`
    pub fn column_f64(&self, name: &str) -> Result<Vec<Option<f64>>, TableError> {
        let floats = cast(self.column(name)?.as_ref(), &DataType::Float64)?;
        Ok(floats.as_primitive::<Float64Type>().iter().collect())
    }

    /// Keep only the named columns, in the given order
    pub fn select(&self, names: &[&str]) -> Result<Table, TableError> {
        let idx = self.indices(names)?;
        Ok(Table::new(self.batch.project(&idx)?))
    }

    /// Rows where `mask` is true; null counts as false
    pub fn filter(&self, mask: &BooleanArray) -> Result<Table, TableError> {
        Ok(Table::new(filter_record_batch(&self.batch, mask)?))
    }

    /// Drop rows with a null in any of the named columns
    pub fn drop_nulls(&self, names: &[&str]) -> Result<Table, TableError> {
        let mut mask = BooleanArray::from(vec![true; self.len()]);
        for column in self.keys(names)? {
            mask = and(&mask, &is_not_null(column.as_ref())?)?;
        }
        self.filter(&mask)
    }

    /// Keep the first row for each distinct key. Null keys compare equal.
    pub fn dedupe_by(&self, names: &[&str]) -> Result<Table, TableError> {
        let keys = self.keys(names)?;
        let rows = row_converter(&keys)?.convert_columns(&keys)?;
        let mut seen = HashSet::with_capacity(rows.num_rows());
        let mask: BooleanArray = rows.iter().map(|row| Some(seen.insert(row))).collect();
        self.filter(&mask)
    }

    /// Replace nulls in the named columns, cast to each column's type
    pub fn fill_nulls(&self, fills: &[(&str, f64)]) -> Result<Table, TableError> {
        let mut columns = self.batch.columns().to_vec();
        for (name, value) in fills {
            let idx = self.column_index(name)?;
            columns[idx] = fill_column(&columns[idx], *value)?;
        }
        self.with_columns(columns)
    }

    /// Replace every null in the numeric columns
    pub fn fill_all_nulls(&self, value: f64) -> Result<Table, TableError> {
        let columns = self
            .batch
            .columns()
            .iter()
            .map(|column| {
                if column.data_type().is_numeric() {
                    fill_column(column, value)
                } else {
                    Ok(column.clone())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.with_columns(columns)
    }

    /// Keep rows whose value in `name` is at least `min`
    pub fn filter_at_least(&self, name: &str, min: f64) -> Result<Table, TableError> {
        let values = cast(self.column(name)?.as_ref(), &DataType::Float64)?;
        let mask = gt_eq(&values, &Float64Array::new_scalar(min))?;
        self.filter(&mask)
    }

    /// Stable ascending sort by the named columns, nulls first
    pub fn sort_by(&self, names: &[&str]) -> Result<Table, TableError> {
        let options = Some(SortOptions {
            descending: false,
            nulls_first: true,
        });
        let mut columns: Vec<SortColumn> = self
            .keys(names)?
            .into_iter()
            .map(|values| SortColumn { values, options })
            .collect();
        // Row position breaks ties
        columns.push(SortColumn {
            values: Arc::new(UInt32Array::from_iter_values(0..self.len() as u32)),
            options,
        });
        let indices = lexsort_to_indices(&columns, None)?;
        Ok(Table::new(take_record_batch(&self.batch, &indices)?))
    }

    /// Sum every other column per (`group`, `order`) pair, then accumulate
    /// the sums over `order` within each `group`.
    ///
    /// Rows with a null key are dropped and null cells count as zero. Value
    /// columns come out as floats, sorted by `group` then `order`.
    pub fn running_totals(&self, group: &str, order: &str) -> Result<Table, TableError> {
        let g = self.column_index(group)?;
        let o = self.column_index(order)?;
        let sorted = self.drop_nulls(&[group, order])?.sort_by(&[group, order])?;
        let value_idx: Vec<usize> = (0..self.num_columns()).filter(|&i| i != g && i != o).collect();

        let values = value_idx
            .iter()
            .map(|&i| {
                let floats = cast(sorted.batch.column(i).as_ref(), &DataType::Float64)?;
                Ok(floats.as_primitive::<Float64Type>().clone())
            })
            .collect::<Result<Vec<Float64Array>, ArrowError>>()?;

        let group_keys = [sorted.batch.column(g).clone()];
        let pair_keys = [sorted.batch.column(g).clone(), sorted.batch.column(o).clone()];
        let groups = row_converter(&group_keys)?.convert_columns(&group_keys)?;
        let pairs = row_converter(&pair_keys)?.convert_columns(&pair_keys)?;

        let mut firsts: Vec<u32> = Vec::new();
        let mut totals: Vec<Vec<f64>> = vec![Vec::new(); values.len()];
        for row in 0..sorted.len() {
            if row == 0 || pairs.row(row) != pairs.row(row - 1) {
                let new_group = row == 0 || groups.row(row) != groups.row(row - 1);
                firsts.push(row as u32);
                for total in totals.iter_mut() {
                    let carried = match total.last() {
                        Some(last) if !new_group => *last,
                        _ => 0.0,
                    };
                    total.push(carried);
                }
            }
            for (total, column) in totals.iter_mut().zip(&values) {
                if let (true, Some(last)) = (column.is_valid(row), total.last_mut()) {
                    *last += column.value(row);
                }
            }
        }

        let firsts = UInt32Array::from(firsts);
        let mut columns: Vec<(String, ArrayRef)> = vec![
            (group.to_string(), take(sorted.batch.column(g).as_ref(), &firsts, None)?),
            (order.to_string(), take(sorted.batch.column(o).as_ref(), &firsts, None)?),
        ];
        let schema = self.batch.schema();
        for (&i, total) in value_idx.iter().zip(totals) {
            columns.push((schema.field(i).name().clone(), Arc::new(Float64Array::from(total))));
        }
        Table::from_columns(columns)
    }

    /// Join on equal key columns.
    ///
    /// Output columns are this table's columns followed by `other`'s
    /// non-key columns; key cells come from whichever side matched. Null
    /// keys never match. Row order:
    /// - inner and left keep this table's order
    /// - right keeps `other`'s order
    /// - outer is sorted by the key columns
    pub fn join(&self, other: &Table, on: &[&str], how: JoinKind) -> Result<Table, TableError> {
        let left_keys = self.keys(on)?;
        let right_key_idx = other.indices(on)?;
        let right_keys = right_key_idx
            .iter()
            .zip(&left_keys)
            .map(|(&i, left)| cast(other.batch.column(i).as_ref(), left.data_type()))
            .collect::<Result<Vec<_>, _>>()?;

        let converter = row_converter(&left_keys)?;
        let left_rows = converter.convert_columns(&left_keys)?;
        let right_rows = converter.convert_columns(&right_keys)?;

        let mut index: HashMap<_, Vec<u32>> = HashMap::new();
        for (r, row) in right_rows.iter().enumerate() {
            if all_valid(&right_keys, r) {
                index.entry(row).or_default().push(r as u32);
            }
        }
        let matches = |l: usize| {
            if all_valid(&left_keys, l) {
                index.get(&left_rows.row(l))
            } else {
                None
            }
        };

        let mut pairs: Vec<(Option<u32>, Option<u32>)> = Vec::new();
        if how == JoinKind::Right {
            let mut by_right: Vec<Vec<u32>> = vec![Vec::new(); other.len()];
            for l in 0..self.len() {
                for &r in matches(l).into_iter().flatten() {
                    by_right[r as usize].push(l as u32);
                }
            }
            for (r, lefts) in by_right.into_iter().enumerate() {
                if lefts.is_empty() {
                    pairs.push((None, Some(r as u32)));
                } else {
                    pairs.extend(lefts.into_iter().map(|l| (Some(l), Some(r as u32))));
                }
            }
        } else {
            let mut matched = vec![false; other.len()];
            for l in 0..self.len() {
                match matches(l) {
                    Some(hits) => {
                        for &r in hits {
                            matched[r as usize] = true;
                            pairs.push((Some(l as u32), Some(r)));
                        }
                    }
                    None if how != JoinKind::Inner => pairs.push((Some(l as u32), None)),
                    None => {}
                }
            }
            if how == JoinKind::Outer {
                pairs.extend(
                    matched
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| !**m)
                        .map(|(r, _)| (None, Some(r as u32))),
                );
            }
        }

        let left_idx: UInt32Array = pairs.iter().map(|(l, _)| *l).collect();
        let right_idx: UInt32Array = pairs.iter().map(|(_, r)| *r).collect();
        let from_left = is_not_null(&left_idx)?;

        let mut columns: Vec<(String, ArrayRef)> = Vec::new();
        for (name, column) in self.named_columns() {
            let mut taken = take(column.as_ref(), &left_idx, None)?;
            if let Some(k) = on.iter().position(|key| *key == name.as_str()) {
                let right = take(right_keys[k].as_ref(), &right_idx, None)?;
                taken = zip(&from_left, &taken, &right)?;
            }
            columns.push((name, taken));
        }
        for (i, (name, column)) in other.named_columns().enumerate() {
            if !right_key_idx.contains(&i) {
                columns.push((name, take(column.as_ref(), &right_idx, None)?));
            }
        }

        let joined = Table::from_columns(columns)?;
        if how == JoinKind::Outer {
            joined.sort_by(on)
        } else {
            Ok(joined)
        }
    }

    /// Place `other`'s columns after this table's
    pub fn concat_columns(&self, other: &Table) -> Result<Table, TableError> {
        if self.len() != other.len() {
            return Err(TableError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        Table::from_columns(self.named_columns().chain(other.named_columns()))
    }
}

fn row_converter(columns: &[ArrayRef]) -> Result<RowConverter, ArrowError> {
    RowConverter::new(
        columns
            .iter()
            .map(|c| SortField::new(c.data_type().clone()))
            .collect(),
    )
}

fn all_valid(columns: &[ArrayRef], row: usize) -> bool {
    columns.iter().all(|c| c.is_valid(row))
}

fn fill_column(column: &ArrayRef, value: f64) -> Result<ArrayRef, ArrowError> {
    if column.null_count() == 0 {
        return Ok(column.clone());
    }
    let fill = cast(&Float64Array::from(vec![value]), column.data_type())?;
    zip(&is_not_null(column.as_ref())?, column, &Scalar::new(fill))
}

/// An RGB8 raster
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB triples
    pub pixels: Vec<u8>,
}

impl ImageData {
    /// A canvas filled with one color
    pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let pixels = color
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Set one pixel; coordinates outside the canvas are ignored
    pub fn put(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.pixels[offset..offset + 3].copy_from_slice(&color);
    }

    pub fn get(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn ints(values: &[Option<i64>]) -> ArrayRef {
        Arc::new(Int64Array::from(values.to_vec()))
    }

    fn floats(values: &[Option<f64>]) -> ArrayRef {
        Arc::new(Float64Array::from(values.to_vec()))
    }

    fn table(columns: Vec<(&str, ArrayRef)>) -> Table {
        Table::from_columns(columns).unwrap()
    }

    #[test]
    fn test_unknown_column() {
        let t = table(vec![("id", ints(&[Some(1)]))]);
        assert!(matches!(t.select(&["nope"]), Err(TableError::UnknownColumn(c)) if c == "nope"));
    }

    #[test]
    fn test_dedupe_and_drop_nulls() {
        let t = table(vec![
            ("id", ints(&[Some(1), Some(1), Some(2)])),
            ("lat", floats(&[Some(46.0), Some(47.0), None])),
        ]);

        let deduped = t.dedupe_by(&["id"]).unwrap();
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped.column_f64("lat").unwrap(), vec![Some(46.0), None]);

        let dropped = t.drop_nulls(&["lat"]).unwrap();
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn test_fill_keeps_column_type() {
        let t = table(vec![
            ("code", ints(&[Some(5), None])),
            ("name", Arc::new(StringArray::from(vec![None, Some("B")])) as ArrayRef),
        ]);

        let filled = t.fill_nulls(&[("code", 99.0)]).unwrap();
        assert_eq!(filled.column("code").unwrap().data_type(), &DataType::Int64);
        assert_eq!(filled.column_f64("code").unwrap(), vec![Some(5.0), Some(99.0)]);

        // Non-numeric columns are left alone
        let all = t.fill_all_nulls(0.0).unwrap();
        assert_eq!(all.column("name").unwrap().null_count(), 1);
    }

    #[test]
    fn test_sort_is_stable_with_nulls_first() {
        let t = table(vec![
            ("year", ints(&[Some(2001), None, Some(2000), Some(2001)])),
            ("tag", ints(&[Some(1), Some(2), Some(3), Some(4)])),
        ]);

        let sorted = t.sort_by(&["year"]).unwrap();
        assert_eq!(
            sorted.column_f64("tag").unwrap(),
            vec![Some(2.0), Some(3.0), Some(1.0), Some(4.0)]
        );
    }

    #[test]
    fn test_running_totals_accumulate_per_group() {
        let t = table(vec![
            ("id", ints(&[Some(1), Some(1), Some(1), Some(2), Some(2)])),
            ("year", ints(&[Some(2001), Some(2000), Some(2001), Some(2000), Some(2002)])),
            ("change", ints(&[Some(1), Some(2), Some(3), None, Some(5)])),
        ]);

        let totals = t.running_totals("id", "year").unwrap();
        assert_eq!(totals.column_names(), vec!["id", "year", "change"]);
        assert_eq!(
            totals.column_f64("id").unwrap(),
            vec![Some(1.0), Some(1.0), Some(2.0), Some(2.0)]
        );
        assert_eq!(
            totals.column_f64("year").unwrap(),
            vec![Some(2000.0), Some(2001.0), Some(2000.0), Some(2002.0)]
        );
        assert_eq!(
            totals.column_f64("change").unwrap(),
            vec![Some(2.0), Some(6.0), Some(0.0), Some(5.0)]
        );
    }

    #[test]
    fn test_outer_join_keeps_both_sides_sorted_by_key() {
        let left = table(vec![
            ("id", ints(&[Some(3), Some(1)])),
            ("year", ints(&[Some(2000), Some(2000)])),
            ("area", floats(&[Some(30.0), Some(10.0)])),
        ]);
        let right = table(vec![
            ("id", ints(&[Some(2), Some(1)])),
            ("year", ints(&[Some(2001), Some(2000)])),
            ("balance", floats(&[Some(-2.0), Some(-1.0)])),
        ]);

        let joined = left.join(&right, &["id", "year"], JoinKind::Outer).unwrap();
        assert_eq!(joined.column_names(), vec!["id", "year", "area", "balance"]);
        assert_eq!(joined.column_f64("id").unwrap(), vec![Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(joined.column_f64("area").unwrap(), vec![Some(10.0), None, Some(30.0)]);
        assert_eq!(joined.column_f64("balance").unwrap(), vec![Some(-1.0), Some(-2.0), None]);

        let inner = left.join(&right, &["id", "year"], JoinKind::Inner).unwrap();
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn test_right_join_follows_right_order() {
        let left = table(vec![
            ("id", ints(&[Some(1), Some(2), Some(1)])),
            ("name", Arc::new(StringArray::from(vec![Some("a"), Some("b"), Some("c")])) as ArrayRef),
        ]);
        let right = table(vec![
            ("id", ints(&[Some(2), Some(9), Some(1)])),
            ("year", ints(&[Some(2000), Some(2001), Some(2002)])),
        ]);

        let joined = left.join(&right, &["id"], JoinKind::Right).unwrap();
        assert_eq!(
            joined.column_f64("id").unwrap(),
            vec![Some(2.0), Some(9.0), Some(1.0), Some(1.0)]
        );
        let names = joined.column("name").unwrap().as_string::<i32>().clone();
        assert_eq!(
            names.iter().collect::<Vec<_>>(),
            vec![Some("b"), None, Some("a"), Some("c")]
        );
        assert_eq!(
            joined.column_f64("year").unwrap(),
            vec![Some(2000.0), Some(2001.0), Some(2002.0), Some(2002.0)]
        );
    }

    #[test]
    fn test_integer_and_float_keys_match() {
        let left = table(vec![("id", ints(&[Some(1)]))]);
        let right = table(vec![("id", floats(&[Some(1.0)])), ("v", floats(&[Some(7.0)]))]);
        let joined = left.join(&right, &["id"], JoinKind::Inner).unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined.column("id").unwrap().data_type(), &DataType::Int64);
    }

    #[test]
    fn test_concat_columns_checks_length() {
        let a = table(vec![("a", ints(&[Some(1), Some(2)]))]);
        let b = table(vec![("b", ints(&[Some(3)]))]);
        assert!(matches!(
            a.concat_columns(&b),
            Err(TableError::LengthMismatch { left: 2, right: 1 })
        ));
        assert_eq!(a.concat_columns(&a).unwrap().num_columns(), 2);
    }

    #[test]
    fn test_image_put_ignores_out_of_bounds() {
        let mut image = ImageData::filled(2, 2, [255, 255, 255]);
        image.put(1, 1, [0, 0, 0]);
        image.put(5, 5, [0, 0, 0]);
        assert_eq!(image.get(1, 1), Some([0, 0, 0]));
        assert_eq!(image.get(0, 0), Some([255, 255, 255]));
        assert_eq!(image.pixels.len(), 12);
    }
}
