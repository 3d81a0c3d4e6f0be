//! # Minimal sparse matrices
//!
//! Just the shapes the serializers need: triplet accumulation, compressed
//! sparse rows for the class × target mask matrix, and compressed sparse
//! columns for the class × barcode count matrix. Duplicate triplets are
//! summed on conversion.

/// Triplet (COO) accumulator.
#[derive(Debug, Default, Clone)]
pub struct CooMatrix {
    pub nrows: usize,
    pub ncols: usize,
    entries: Vec<(usize, usize, i32)>,
}

impl CooMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        CooMatrix {
            nrows,
            ncols,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: i32) {
        debug_assert!(row < self.nrows && col < self.ncols);
        self.entries.push((row, col, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert to CSR, summing duplicate coordinates.
    pub fn to_csr(&self) -> CsrMatrix {
        let mut entries = self.entries.clone();
        entries.sort_unstable_by_key(|&(r, c, _)| (r, c));

        let mut indptr = Vec::with_capacity(self.nrows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();

        indptr.push(0);
        let mut row = 0usize;
        for (r, c, v) in entries {
            while row < r {
                indptr.push(indices.len() as i32);
                row += 1;
            }
            if indices.len() > (*indptr.last().unwrap()) as usize
                && *indices.last().unwrap() == c as i32
            {
                *data.last_mut().unwrap() += v;
            } else {
                indices.push(c as i32);
                data.push(v);
            }
        }
        while row < self.nrows {
            indptr.push(indices.len() as i32);
            row += 1;
        }

        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            indptr,
            indices,
            data,
        }
    }
}

/// Compressed sparse row matrix: `indptr` has `nrows + 1` entries and
/// `indices` holds column ids sorted within each row.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub indptr: Vec<i32>,
    pub indices: Vec<i32>,
    pub data: Vec<i32>,
}

impl CsrMatrix {
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Reinterpret as CSC over the same logical matrix.
    pub fn to_csc(&self) -> CscMatrix {
        let mut col_counts = vec![0i32; self.ncols + 1];
        for &c in &self.indices {
            col_counts[c as usize + 1] += 1;
        }
        for i in 1..col_counts.len() {
            col_counts[i] += col_counts[i - 1];
        }
        let indptr = col_counts.clone();

        let mut indices = vec![0i32; self.nnz()];
        let mut data = vec![0i32; self.nnz()];
        let mut next = indptr.clone();
        for row in 0..self.nrows {
            for k in self.indptr[row] as usize..self.indptr[row + 1] as usize {
                let col = self.indices[k] as usize;
                let slot = next[col] as usize;
                indices[slot] = row as i32;
                data[slot] = self.data[k];
                next[col] += 1;
            }
        }

        CscMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            indptr,
            indices,
            data,
        }
    }
}

/// Compressed sparse column matrix: `indptr` has `ncols + 1` entries and
/// `indices` holds row ids sorted within each column.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CscMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub indptr: Vec<i32>,
    pub indices: Vec<i32>,
    pub data: Vec<i32>,
}

impl CscMatrix {
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Build directly from per-column `(row, value)` lists whose rows are
    /// already in ascending order.
    pub fn from_columns(nrows: usize, columns: Vec<Vec<(i32, i32)>>) -> Self {
        let ncols = columns.len();
        let mut indptr = Vec::with_capacity(ncols + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();

        indptr.push(0);
        for column in columns {
            for (row, value) in column {
                indices.push(row);
                data.push(value);
            }
            indptr.push(indices.len() as i32);
        }

        CscMatrix {
            nrows,
            ncols,
            indptr,
            indices,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_conversion_sums_duplicates() {
        let mut coo = CooMatrix::new(2, 3);
        coo.push(0, 1, 1);
        coo.push(1, 0, 2);
        coo.push(0, 1, 4);
        coo.push(0, 2, 1);

        let csr = coo.to_csr();
        assert_eq!(vec![0, 2, 3], csr.indptr);
        assert_eq!(vec![1, 2, 0], csr.indices);
        assert_eq!(vec![5, 1, 2], csr.data);
        assert_eq!(3, csr.nnz());
    }

    #[test]
    fn csr_keeps_empty_rows() {
        let mut coo = CooMatrix::new(4, 2);
        coo.push(1, 1, 7);
        coo.push(3, 0, 9);

        let csr = coo.to_csr();
        assert_eq!(vec![0, 0, 1, 1, 2], csr.indptr);
        assert_eq!(vec![1, 0], csr.indices);
    }

    #[test]
    fn csc_matches_column_walk() {
        // | 1 0 2 |
        // | 0 3 0 |
        let mut coo = CooMatrix::new(2, 3);
        coo.push(0, 0, 1);
        coo.push(0, 2, 2);
        coo.push(1, 1, 3);

        let csc = coo.to_csr().to_csc();
        assert_eq!(vec![0, 1, 2, 3], csc.indptr);
        assert_eq!(vec![0, 1, 0], csc.indices);
        assert_eq!(vec![1, 3, 2], csc.data);
    }

    #[test]
    fn columns_builder_matches_conversion() {
        let mut coo = CooMatrix::new(3, 2);
        coo.push(0, 0, 5);
        coo.push(2, 0, 1);
        coo.push(1, 1, 4);

        let by_columns =
            CscMatrix::from_columns(3, vec![vec![(0, 5), (2, 1)], vec![(1, 4)]]);
        assert_eq!(coo.to_csr().to_csc(), by_columns);
    }
}
