//! Tensor Operations
//!
//! A minimal dense tensor used by every layer of the model. Data lives in a
//! flat `Vec<f32>` in row-major order together with its shape.
//!
//! ## Scope
//!
//! The transformer in this crate processes one sequence at a time as a 2D
//! activation matrix `[seq_len, n_embd]`, so the operations here are the 2D
//! ones the forward and backward passes need:
//!
//! - matrix multiplication and transpose
//! - row-wise softmax, mean and variance
//! - element-wise arithmetic with last-dimension broadcasting (bias, gain)
//! - column slicing, used to split and merge attention heads
//! - in-place accumulation and scaling, used for gradients
//!
//! Batches of sequences are handled one level up by running sequences in
//! parallel, see [`crate::model`].
//!
//! ## Parallelism
//!
//! Large matrix multiplications use a cache-blocked kernel parallelized over
//! row blocks with Rayon. Element-wise operations switch to Rayon once the
//! tensor is larger than [`PAR_THRESHOLD`]; below that the sequential loop is
//! faster than the scheduling overhead.
//!
//! ## Example
//!
//! ```rust
//! use picogpt::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```

use rayon::prelude::*;

/// Element count above which element-wise operations run in parallel
pub const PAR_THRESHOLD: usize = 16_384;

/// A multi-dimensional array of `f32` values in row-major layout
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// A zero tensor with the same shape as `self`
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows of a 2D tensor
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Size of the last dimension
    pub fn cols(&self) -> usize {
        *self.shape.last().expect("tensor has at least one dimension")
    }

    /// Borrow row `i` of a 2D tensor
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Matrix multiplication of two 2D tensors
    ///
    /// For `A @ B` where `A` is `[m, k]` and `B` is `[k, n]`, the result is
    /// `[m, n]` with `C[i,j] = sum_l A[i,l] * B[l,j]`.
    ///
    /// Small products run sequentially; from 32K multiply-adds on, the
    /// parallel cache-blocked kernel is used.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 32_768 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        // i-k-j loop order keeps the inner loop contiguous in both operands
        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out_row = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::axpy(a_val, &other.data[l * n..(l + 1) * n], out_row);
            }
        }

        Tensor::new(result, vec![m, n])
    }

    /// `result[j] += a_val * b[j]`, written so LLVM can auto-vectorize it
    #[inline(always)]
    fn axpy(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of `BLOCK_SIZE`; each Rayon task
    /// walks its block in `BLOCK_SIZE`-wide column and inner-dimension tiles
    /// so both operands stay in L1 while the tile is computed.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::axpy(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];

        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }

        Tensor::new(result, vec![cols, rows])
    }

    /// Softmax over the last dimension of a 2D tensor
    ///
    /// Uses the numerically stable form `exp(x - max) / sum(exp(x - max))`.
    /// Entries equal to `-inf` come out as exactly `0.0` as long as the row
    /// holds at least one finite value.
    pub fn softmax_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut result = self.data.clone();
        for row in result.chunks_mut(cols) {
            softmax_in_place(row);
        }
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition
    ///
    /// Supports an exact shape match or broadcasting a 1D tensor over the
    /// last dimension (`[*, n] + [n]`, e.g. adding a bias).
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication with the same broadcasting as [`Tensor::add`]
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "mul", |a, b| a * b)
    }

    /// Element-wise subtraction with the same broadcasting as [`Tensor::add`]
    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "sub", |a, b| a - b)
    }

    fn broadcast_zip<F>(&self, other: &Tensor, op: &str, f: F) -> Tensor
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        if self.shape == other.shape {
            let result = if self.len() >= PAR_THRESHOLD {
                self.data
                    .par_iter()
                    .zip(&other.data)
                    .map(|(&a, &b)| f(a, b))
                    .collect()
            } else {
                self.data
                    .iter()
                    .zip(&other.data)
                    .map(|(&a, &b)| f(a, b))
                    .collect()
            };
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.cols();
        assert!(
            other.shape.len() == 1 && other.len() == last_dim,
            "Unsupported broadcast for {}: {:?} and {:?}",
            op,
            self.shape,
            other.shape
        );
        let result = self
            .data
            .chunks(last_dim)
            .flat_map(|row| row.iter().zip(&other.data).map(|(&a, &b)| f(a, b)))
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Apply a function to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let result = if self.len() >= PAR_THRESHOLD {
            self.data.par_iter().map(|&x| f(x)).collect()
        } else {
            self.data.iter().map(|&x| f(x)).collect()
        };
        Tensor::new(result, self.shape.clone())
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// `self += other`, shapes must match
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        if self.len() >= PAR_THRESHOLD {
            self.data
                .par_iter_mut()
                .zip(&other.data)
                .for_each(|(a, &b)| *a += b);
        } else {
            for (a, &b) in self.data.iter_mut().zip(&other.data) {
                *a += b;
            }
        }
    }

    /// `self *= scalar` in place
    pub fn scale_assign(&mut self, scalar: f32) {
        if self.len() >= PAR_THRESHOLD {
            self.data.par_iter_mut().for_each(|x| *x *= scalar);
        } else {
            self.data.iter_mut().for_each(|x| *x *= scalar);
        }
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        if self.len() >= PAR_THRESHOLD {
            self.data.par_iter().map(|&x| x * x).sum()
        } else {
            self.data.iter().map(|&x| x * x).sum()
        }
    }

    /// Mean of each row of a 2D tensor, shape `[rows, 1]`
    pub fn mean_rows(&self) -> Tensor {
        let cols = self.cols();
        let result: Vec<f32> = self
            .data
            .chunks(cols)
            .map(|row| row.iter().sum::<f32>() / cols as f32)
            .collect();
        let rows = result.len();
        Tensor::new(result, vec![rows, 1])
    }

    /// Biased variance of each row of a 2D tensor, shape `[rows, 1]`
    pub fn var_rows(&self) -> Tensor {
        let cols = self.cols();
        let result: Vec<f32> = self
            .data
            .chunks(cols)
            .map(|row| {
                let mean = row.iter().sum::<f32>() / cols as f32;
                row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / cols as f32
            })
            .collect();
        let rows = result.len();
        Tensor::new(result, vec![rows, 1])
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// Used for causal masking in attention (setting future positions to -inf)
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Copy columns `start..end` of a 2D tensor into a new `[rows, end - start]` tensor
    ///
    /// Splitting `[seq, n_embd]` into per-head `[seq, head_dim]` slices is a
    /// column slice.
    pub fn slice_cols(&self, start: usize, end: usize) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        assert!(start <= end && end <= cols, "column slice out of bounds");
        let width = end - start;
        let mut result = Vec::with_capacity(rows * width);
        for row in self.data.chunks(cols) {
            result.extend_from_slice(&row[start..end]);
        }
        Tensor::new(result, vec![rows, width])
    }

    /// Write `src` into columns `start..start + src.cols()` of a 2D tensor
    ///
    /// The inverse of [`Tensor::slice_cols`], used to concatenate heads.
    pub fn set_cols(&mut self, start: usize, src: &Tensor) {
        let cols = self.cols();
        let width = src.cols();
        assert_eq!(self.rows(), src.rows(), "row count must match");
        assert!(start + width <= cols, "column slice out of bounds");
        for (dst_row, src_row) in self.data.chunks_mut(cols).zip(src.data.chunks(width)) {
            dst_row[start..start + width].copy_from_slice(src_row);
        }
    }

    /// Sum over rows of a 2D tensor, shape `[cols]`
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (acc, &x) in result.iter_mut().zip(row) {
                *acc += x;
            }
        }
        Tensor::new(result, vec![cols])
    }
}

/// Numerically stable softmax over a slice, in place
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Index of the largest value; the lowest index wins ties
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let c = a.matmul(&b);
        assert_eq!(c.data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_blocked_matches_naive() {
        // 40 x 37 @ 37 x 29 crosses the parallel threshold
        let (m, k, n) = (40, 37, 29);
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 * 0.5).collect(), vec![k, n]);
        let c = a.matmul(&b);

        for i in 0..m {
            for j in 0..n {
                let expected: f32 = (0..k).map(|l| a.data[i * k + l] * b.data[l * n + j]).sum();
                assert!((c.data[i * n + j] - expected).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let tt = t.transpose();
        assert_eq!(tt.shape, vec![3, 2]);
        assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_softmax_rows_with_neg_infinity() {
        let t = Tensor::new(vec![1.0, f32::NEG_INFINITY, 1.0, 2.0], vec![2, 2]);
        let s = t.softmax_rows();
        assert_eq!(s.data[0], 1.0);
        assert_eq!(s.data[1], 0.0);
        assert!((s.data[2] + s.data[3] - 1.0).abs() < 1e-6);
        assert!(s.data[3] > s.data[2]);
    }

    #[test]
    fn test_bias_broadcast() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        assert_eq!(x.add(&b).data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_slice_and_set_cols() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], vec![2, 4]);
        let head = x.slice_cols(2, 4);
        assert_eq!(head.data, vec![3.0, 4.0, 7.0, 8.0]);

        let mut merged = Tensor::zeros(vec![2, 4]);
        merged.set_cols(0, &x.slice_cols(0, 2));
        merged.set_cols(2, &head);
        assert_eq!(merged, x);
    }

    #[test]
    fn test_argmax_prefers_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
    }
}
