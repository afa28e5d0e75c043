//! Splits a concatenated observation buffer into independent
//! subsequences by length (spec §4.6).

use nalgebra::DMatrix;

use crate::error::{HmmError, Result};

/// A dense buffer of observation rows plus the `lengths` partition of
/// independent subsequences (spec §3 `ObservationBuffer`).
#[derive(Clone, Debug)]
pub struct ObservationBuffer {
    data: DMatrix<f64>,
    lengths: Vec<usize>,
}

impl ObservationBuffer {
    /// Wraps `data` (T total rows) as a single subsequence.
    pub fn single(data: DMatrix<f64>) -> Self {
        let len = data.nrows();
        Self { data, lengths: vec![len] }
    }

    /// Wraps `data` with an explicit `lengths` partition, validating
    /// that it sums to the row count.
    pub fn with_lengths(data: DMatrix<f64>, lengths: Vec<usize>) -> Result<Self> {
        let total: usize = lengths.iter().sum();
        if total != data.nrows() {
            return Err(HmmError::LengthMismatch {
                expected: data.nrows(),
                actual: total,
            });
        }
        Ok(Self { data, lengths })
    }

    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Yields `(offset, subsequence)` pairs, one per entry in `lengths`,
    /// each a contiguous row slice of `data`.
    pub fn subsequences(&self) -> Vec<(usize, DMatrix<f64>)> {
        let mut out = Vec::with_capacity(self.lengths.len());
        let mut offset = 0usize;
        for &len in &self.lengths {
            let rows = self.data.rows(offset, len).into_owned();
            out.push((offset, rows));
            offset += len;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_wraps_whole_buffer_as_one_subsequence() {
        let data = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let buf = ObservationBuffer::single(data);
        assert_eq!(buf.lengths(), &[4]);
        assert_eq!(buf.subsequences().len(), 1);
    }

    #[test]
    fn lengths_partition_matching_row_count_splits_correctly() {
        let data = DMatrix::from_row_slice(10, 1, &[0., 1., 2., 3., 4., 5., 6., 7., 8., 9.]);
        let buf = ObservationBuffer::with_lengths(data, vec![3, 4, 3]).unwrap();
        let subs = buf.subsequences();
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].1.nrows(), 3);
        assert_eq!(subs[1].1.nrows(), 4);
        assert_eq!(subs[2].1.nrows(), 3);
        assert_eq!(subs[1].0, 3);
        assert_eq!(subs[2].1[(0, 0)], 7.0);
    }

    #[test]
    fn mismatched_lengths_fail() {
        let data = DMatrix::from_row_slice(10, 1, &[0.; 10]);
        let err = ObservationBuffer::with_lengths(data, vec![3, 3]).unwrap_err();
        assert!(matches!(err, HmmError::LengthMismatch { expected: 10, actual: 6 }));
    }
}
