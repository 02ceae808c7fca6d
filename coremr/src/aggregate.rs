use std::marker::PhantomData;

use crate::helpe::*;

/// `ceil(rows / reducers)`, and at least one.
#[inline(always)]
pub fn rows_per_reducer(rows: usize, reducers: usize) -> usize {
    rows.div_ceil(reducers.max(1)).max(1)
}

/// The rows of an aggregate table that reducer `reducer` out of `reducers`
/// is responsible for. Trailing reducers may own nothing.
pub fn owned_rows(reducer: usize, reducers: usize, rows: usize) -> Range<usize> {
    let rpr = rows_per_reducer(rows, reducers);
    let start = (reducer * rpr).min(rows);
    let end = ((reducer + 1) * rpr).min(rows);

    start..end
}

/// The reducer whose [`owned_rows`] contain `row`.
#[inline(always)]
pub fn owner_of(row: usize, reducers: usize, rows: usize) -> usize {
    (row / rows_per_reducer(rows, reducers)).min(reducers.saturating_sub(1))
}

/// A dense `rows x width` table that mappers read and reducers update.
///
/// The table lives with the caller between iterations. During the map
/// phase every mapper sees all of it; during the reduce phase each reducer
/// may write its own rows only.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState<T> {
    width:  usize,
    data:   Vec<T>,
}

impl<T: Copy> AggregateState<T> {
    pub fn new(rows: usize, width: usize, fill: T) -> Self {
        Self { width, data: vec![fill; rows * width] }
    }

    pub fn from_rows(width: usize, data: Vec<T>) -> Result<Self, MrError> {
        if width == 0 || data.len() % width != 0 {
            return Err(MrError::Config(format!(
                "{} values do not form rows of width {}", data.len(), width
            )));
        }

        Ok(Self { width, data })
    }

    pub fn rows(&self) -> usize {
        if self.width == 0 { 0 } else { self.data.len() / self.width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn row(&self, idx: usize) -> &[T] {
        &self.data[idx * self.width..(idx + 1) * self.width]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [T] {
        &mut self.data[idx * self.width..(idx + 1) * self.width]
    }

    pub fn into_inner(self) -> Vec<T> {
        self.data
    }

    pub(crate) fn share(&mut self) -> SharedAggregate<'_, T> {
        SharedAggregate {
            ptr:    self.data.as_mut_ptr(),
            rows:   self.rows(),
            width:  self.width,
            _owner: PhantomData,
        }
    }
}

/// An exclusive borrow of an [`AggregateState`], fanned out to workers.
/// Whether a given access is sound depends on the current phase, hence
/// the `unsafe` accessors.
pub(crate) struct SharedAggregate<'a, T> {
    ptr:    *mut T,
    rows:   usize,
    width:  usize,
    _owner: PhantomData<&'a mut [T]>,
}

impl<T> Clone for SharedAggregate<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedAggregate<'_, T> {}

// SAFETY: the pointer stands for a `&mut [T]`; see the accessors.
unsafe impl<T: Send + Sync> Send for SharedAggregate<'_, T> {}
unsafe impl<T: Send + Sync> Sync for SharedAggregate<'_, T> {}

impl<'a, T> SharedAggregate<'a, T> {
    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn width(&self) -> usize {
        self.width
    }

    /// # Safety
    /// No `rows_mut` view may be alive while the returned slice is.
    pub(crate) unsafe fn table(&self) -> &'a [T] {
        std::slice::from_raw_parts(self.ptr, self.rows * self.width)
    }

    /// # Safety
    /// No `table` view may be alive, and `range`s handed out concurrently
    /// must be disjoint.
    pub(crate) unsafe fn rows_mut(&self, range: Range<usize>) -> &'a mut [T] {
        debug_assert!(range.end <= self.rows);
        std::slice::from_raw_parts_mut(self.ptr.add(range.start * self.width), range.len() * self.width)
    }
}

/// A reducer's own rows of the aggregate table, addressed by global row
/// index.
pub struct OwnedRows<'t, T> {
    range:  Range<usize>,
    width:  usize,
    data:   &'t mut [T],
}

impl<'t, T> OwnedRows<'t, T> {
    pub(crate) fn new(range: Range<usize>, width: usize, data: &'t mut [T]) -> Self {
        Self { range, width, data }
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn row(&self, row: usize) -> &[T] {
        assert!(self.range.contains(&row), "row {row} outside {:?}", self.range);
        let local = row - self.range.start;
        &self.data[local * self.width..(local + 1) * self.width]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        assert!(self.range.contains(&row), "row {row} outside {:?}", self.range);
        let local = row - self.range.start;
        &mut self.data[local * self.width..(local + 1) * self.width]
    }
}
