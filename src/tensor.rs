//! Dense f64 Tensors
//!
//! Every layer in the engine reads and writes `Tensor`s: one contiguous
//! row-major buffer plus the shape that gives it meaning.
//!
//! ```text
//! shape   [2, 3]
//! strides [3, 1]          element (r, c) lives at data[r * 3 + c]
//! data    [a b c d e f]   rows: [a b c] [d e f]
//! ```
//!
//! Values are `f64` throughout. Central-difference gradient checks against the
//! analytic backward passes need the extra precision to agree to 1e-5.
//!
//! ```rust
//! use minillm::Tensor;
//!
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let y = x.matmul(&w);
//! assert_eq!(y.shape, vec![2, 2]);
//! assert_eq!(y.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Large 2D matmuls use a cache-blocked kernel parallelised over row blocks,
//! batched matmuls run one Rayon task per batch slice, and softmax runs one
//! task per row.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// Row-major n-dimensional array of `f64`
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    /// Row-major strides derived from `shape`
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Wrap `data` with `shape`
    ///
    /// # Panics
    ///
    /// If `data.len()` is not the product of `shape`.
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "tensor of shape {:?} needs {} values, got {}",
            shape,
            numel,
            data.len()
        );

        let strides = Self::row_major_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let numel: usize = shape.iter().product();
        Self::new(vec![value; numel], shape)
    }

    /// Values drawn from `N(0, std²)` using the caller's generator
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, std: f64, rng: &mut R) -> Self {
        let numel: usize = shape.iter().product();
        let data = match Normal::new(0.0, std) {
            Ok(normal) => (0..numel).map(|_| normal.sample(rng)).collect(),
            // Only reachable for a non-finite std
            Err(_) => vec![0.0; numel],
        };
        Self::new(data, shape)
    }

    /// `[d0, d1, d2]` gives `[d1*d2, d2, 1]`
    fn row_major_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = Vec::with_capacity(shape.len());
        let mut acc = 1;
        for &dim in shape.iter().rev() {
            strides.push(acc);
            acc *= dim;
        }
        strides.reverse();
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of the last dimension (1 for a scalar)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// `out += scale * row`
    #[inline(always)]
    fn axpy(scale: f64, row: &[f64], out: &mut [f64]) {
        for (o, &v) in out.iter_mut().zip(row) {
            *o += scale * v;
        }
    }

    /// Plain `[m, k] @ [k, n]` on raw slices, accumulating into `out`
    fn gemm_into(a: &[f64], b: &[f64], out: &mut [f64], k: usize, n: usize) {
        if k == 0 || n == 0 {
            return;
        }
        for (a_row, out_row) in a.chunks_exact(k).zip(out.chunks_exact_mut(n)) {
            for (&a_val, b_row) in a_row.iter().zip(b.chunks_exact(n)) {
                Self::axpy(a_val, b_row, out_row);
            }
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - Batched: `[..., m, k] @ [..., k, n] -> [..., m, n]` where the leading
    ///   dimensions of both operands are identical (used by attention with
    ///   `[batch, heads, seq, d_k]`)
    ///
    /// # Panics
    ///
    /// On mismatched inner dimensions or leading dimensions.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.ndim() == 2 && other.ndim() == 2 {
            let (m, k) = (self.shape[0], self.shape[1]);
            let n = other.shape[1];
            assert_eq!(
                other.shape[0], k,
                "matmul inner dimensions differ: {:?} @ {:?}",
                self.shape, other.shape
            );

            if m * n * k >= 4_096 {
                return self.matmul_blocked(other, m, n, k);
            }
            let mut out = vec![0.0; m * n];
            Self::gemm_into(&self.data, &other.data, &mut out, k, n);
            return Tensor::new(out, vec![m, n]);
        }

        // Batched over identical leading dimensions
        let rank = self.ndim();
        assert!(
            rank >= 3 && other.ndim() == rank && self.shape[..rank - 2] == other.shape[..rank - 2],
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        let m = self.shape[rank - 2];
        let k = self.shape[rank - 1];
        let n = other.shape[rank - 1];
        assert_eq!(
            other.shape[rank - 2],
            k,
            "Inner dimensions must match for batched matmul: {:?} @ {:?}",
            self.shape,
            other.shape
        );

        let mut result = vec![0.0; self.len() / k.max(1) * n];
        result
            .par_chunks_mut((m * n).max(1))
            .zip(self.data.par_chunks((m * k).max(1)))
            .zip(other.data.par_chunks((k * n).max(1)))
            .for_each(|((out, a), b)| Self::gemm_into(a, b, out, k, n));

        let mut shape = self.shape[..rank - 2].to_vec();
        shape.push(m);
        shape.push(n);
        Tensor::new(result, shape)
    }

    /// 2D matmul in TILE×TILE tiles, one Rayon task per band of TILE rows
    fn matmul_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const TILE: usize = 8;
        let mut out = vec![0.0; m * n];

        out.par_chunks_mut(TILE * n)
            .zip(self.data.par_chunks(TILE * k))
            .for_each(|(out_band, a_band)| {
                let rows = out_band.len() / n;
                for col in (0..n).step_by(TILE) {
                    let cols = col..(col + TILE).min(n);
                    for inner in (0..k).step_by(TILE) {
                        for r in 0..rows {
                            let a_row = &a_band[r * k..(r + 1) * k];
                            let out_row = &mut out_band[r * n..(r + 1) * n];
                            for l in inner..(inner + TILE).min(k) {
                                let b_row = &other.data[l * n..(l + 1) * n];
                                Self::axpy(a_row[l], &b_row[cols.clone()], &mut out_row[cols.clone()]);
                            }
                        }
                    }
                }
            });
        debug_assert_eq!(out.len(), m * n);
        Tensor::new(out, vec![m, n])
    }

    /// Softmax along the last axis
    ///
    /// Uses the max-subtracted form `exp(x - max) / Σ exp(x - max)`. Rows whose
    /// entries are all `-inf` produce zeros instead of NaN.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use minillm::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
    /// let result = tensor.softmax();
    /// let total: f64 = result.data.iter().sum();
    /// assert!((total - 1.0).abs() < 1e-12);
    /// ```
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; self.len()];

        result
            .par_chunks_mut(cols.max(1))
            .zip(self.data.par_chunks(cols.max(1)))
            .for_each(|(out, row)| softmax_row(row, out));

        Tensor::new(result, self.shape.clone())
    }

    /// `self + other`, broadcasting `other` when it is
    ///
    /// - the same shape,
    /// - a trailing suffix of `self.shape` (bias `[n]` onto `[*, n]`,
    ///   positional table `[seq, dim]` onto `[batch, seq, dim]`), or
    /// - a keep-dim column `[.., 1]` against `[.., n]`.
    ///
    /// ```rust
    /// # use minillm::Tensor;
    /// let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let bias = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(x.add(&bias).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "add", |a, b| a + b)
    }

    /// Same broadcasting rules as [`add`](Self::add)
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "mul", |a, b| a * b)
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "sub", |a, b| a - b)
    }

    pub fn div(&self, other: &Tensor) -> Tensor {
        self.broadcast_zip(other, "div", |a, b| a / b)
    }

    fn broadcast_zip<F>(&self, other: &Tensor, op: &str, f: F) -> Tensor
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let offset = self.ndim().saturating_sub(other.ndim());
        if other.ndim() < self.ndim() && self.shape[offset..] == other.shape[..] {
            let period = other.len();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % period]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        // Keep-dim statistics such as `[b, t, 1]` against `[b, t, d]`
        if self.ndim() == other.ndim()
            && other.last_dim() == 1
            && self.shape[..self.ndim() - 1] == other.shape[..other.ndim() - 1]
        {
            let cols = self.last_dim();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i / cols]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {}: {:?} with {:?}",
            op, self.shape, other.shape
        );
    }

    pub fn add_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x + scalar)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn div_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x / scalar)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f64::sqrt)
    }

    /// Apply a function to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64 + Sync + Send,
    {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Overwrite every element with `value`
    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f64 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Sum of all elements
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Sum over every dimension except the last
    ///
    /// `[a, b, n] -> [n]`. Used for bias and normalization-parameter gradients.
    pub fn sum_leading(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (acc, &v) in result.iter_mut().zip(row) {
                *acc += v;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Collapse all leading dimensions: `[a, b, n] -> [a*b, n]`
    pub fn flatten_2d(&self) -> Tensor {
        let cols = self.last_dim();
        self.reshape(&[self.len() / cols.max(1), cols])
    }

    /// Same data, new shape with the same element count
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let numel: usize = new_shape.iter().product();
        assert_eq!(
            self.len(),
            numel,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Swap two axes; negative axes count from the end
    ///
    /// ```rust
    /// # use minillm::Tensor;
    /// let m = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let t = m.transpose(-1, -2);
    /// assert_eq!(t.shape, vec![3, 2]);
    /// assert_eq!(t.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let (d1, d2) = (self.axis(dim1), self.axis(dim2));
        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.ndim() == 2 {
            let (rows, cols) = (self.shape[0], self.shape[1]);
            let mut out = vec![0.0; rows * cols];
            for (i, row) in self.data.chunks_exact(cols.max(1)).enumerate() {
                for (j, &v) in row.iter().enumerate() {
                    out[j * rows + i] = v;
                }
            }
            return Tensor::new(out, new_shape);
        }

        // General case: walk the output in row-major order and map each flat
        // index back through the swapped source strides.
        let out_strides = Self::row_major_strides(&new_shape);
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);

        let result = (0..self.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (dim, &stride) in out_strides.iter().enumerate() {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src += coord * src_strides[dim];
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// The mask may have the same shape as the tensor, or the shape of its
    /// trailing dimensions (a `[seq, seq]` causal mask over `[b, h, seq, seq]`).
    pub fn masked_fill(&self, mask: &Tensor, value: f64) -> Tensor {
        let period = mask.len();
        assert!(
            period > 0 && self.len() % period == 0 && self.shape.ends_with(&mask.shape),
            "Mask shape {:?} does not broadcast onto {:?}",
            mask.shape,
            self.shape
        );
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &x)| if mask.data[i % period] != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Mean along the last axis
    ///
    /// With `keepdim` the reduced axis stays as size 1.
    pub fn mean(&self, keepdim: bool) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f64> = self
            .data
            .par_chunks(cols.max(1))
            .map(|row| row.iter().sum::<f64>() / cols as f64)
            .collect();
        Tensor::new(result, self.reduced_shape(keepdim))
    }

    /// Population variance along the last axis
    pub fn var(&self, keepdim: bool) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f64> = self
            .data
            .par_chunks(cols.max(1))
            .map(|row| {
                let mean = row.iter().sum::<f64>() / cols as f64;
                row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / cols as f64
            })
            .collect();
        Tensor::new(result, self.reduced_shape(keepdim))
    }

    fn reduced_shape(&self, keepdim: bool) -> Vec<usize> {
        let mut shape = self.shape[..self.ndim().saturating_sub(1)].to_vec();
        if keepdim {
            shape.push(1);
        }
        shape
    }

    /// First `rows` entries along dimension 0
    pub fn narrow_rows(&self, rows: usize) -> Tensor {
        assert!(
            !self.shape.is_empty() && rows <= self.shape[0],
            "Cannot take {} rows from {:?}",
            rows,
            self.shape
        );
        let mut shape = self.shape.clone();
        shape[0] = rows;
        let end = rows * self.strides[0];
        Tensor::new(self.data[..end].to_vec(), shape)
    }

    /// Build a `[batch, seq]` tensor of token ids
    pub fn from_ids(ids: &[Vec<usize>]) -> Tensor {
        let batch = ids.len();
        let seq = ids.first().map_or(0, Vec::len);
        let data = ids
            .iter()
            .flat_map(|row| {
                assert_eq!(row.len(), seq, "Ragged id batch");
                row.iter().map(|&id| id as f64)
            })
            .collect();
        Tensor::new(data, vec![batch, seq])
    }

    fn axis(&self, axis: isize) -> usize {
        let ndim = self.ndim() as isize;
        let pos = if axis < 0 { ndim + axis } else { axis };
        assert!(
            (0..ndim).contains(&pos),
            "Axis {} out of range for {:?}",
            axis,
            self.shape
        );
        pos as usize
    }
}

/// Numerically stable softmax of one row into `out`
pub(crate) fn softmax_row(row: &[f64], out: &mut [f64]) {
    let max = row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if max == f64::NEG_INFINITY {
        out.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let mut sum = 0.0;
    for (o, &x) in out.iter_mut().zip(row) {
        *o = (x - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}

/// Softmax of a slice, returned as a new vector
pub fn softmax_vec(row: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; row.len()];
    softmax_row(row, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul_2d_small_and_blocked_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Tensor::randn(vec![20, 30], 1.0, &mut rng);
        let b = Tensor::randn(vec![30, 25], 1.0, &mut rng);
        let fast = a.matmul(&b);

        for i in 0..20 {
            for j in 0..25 {
                let expected: f64 = (0..30).map(|l| a.data[i * 30 + l] * b.data[l * 25 + j]).sum();
                assert!((fast.data[i * 25 + j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_batched_matmul_matches_per_slice() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Tensor::randn(vec![2, 3, 4, 5], 1.0, &mut rng);
        let b = Tensor::randn(vec![2, 3, 5, 2], 1.0, &mut rng);
        let c = a.matmul(&b);
        assert_eq!(c.shape, vec![2, 3, 4, 2]);

        let a0 = Tensor::new(a.data[20..40].to_vec(), vec![4, 5]);
        let b0 = Tensor::new(b.data[10..20].to_vec(), vec![5, 2]);
        let c0 = a0.matmul(&b0);
        assert_eq!(&c.data[8..16], &c0.data[..]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0], vec![2, 3]);
        let s = t.softmax();
        assert!((s.data[..3].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((s.data[3..].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(s.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_softmax_masked_entries_are_zero() {
        let t = Tensor::new(vec![0.5, f64::NEG_INFINITY, f64::NEG_INFINITY], vec![1, 3]);
        let s = t.softmax();
        assert_eq!(s.data, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_add_broadcast_trailing_shape() {
        let x = Tensor::zeros(vec![2, 3, 2]);
        let pe = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]);
        let y = x.add(&pe);
        assert_eq!(&y.data[..6], &pe.data[..]);
        assert_eq!(&y.data[6..], &pe.data[..]);
    }

    fn counting(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::new((0..n).map(|i| i as f64).collect(), shape.to_vec())
    }

    #[test]
    fn test_sub_keepdim_statistic() {
        let x = Tensor::new(vec![1.0, 3.0, 10.0, 20.0], vec![2, 2]);
        let mean = x.mean(true);
        assert_eq!(mean.shape, vec![2, 1]);
        assert_eq!(x.sub(&mean).data, vec![-1.0, 1.0, -5.0, 5.0]);
    }

    #[test]
    fn test_transpose_4d_roundtrip() {
        let t = counting(&[1, 2, 3, 4]);
        let tt = t.transpose(1, 2);
        assert_eq!(tt.shape, vec![1, 3, 2, 4]);
        // element [0, 0, 2, 1] of the source lands at [0, 2, 0, 1]
        assert_eq!(tt.data[2 * 8 + 1], t.data[2 * 4 + 1]);
        assert_eq!(tt.data[17], 9.0);
        assert_eq!(tt.transpose(1, 2), t);
    }

    #[test]
    fn test_var_is_population_variance() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 4]);
        assert!((t.var(false).data[0] - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_sum_leading() {
        let t = counting(&[3, 2]);
        assert_eq!(t.sum_leading().data, vec![6.0, 9.0]);
    }

    #[test]
    fn test_masked_fill_broadcasts_mask() {
        let t = Tensor::zeros(vec![2, 2, 2]);
        let mask = Tensor::new(vec![0.0, 1.0, 0.0, 0.0], vec![2, 2]);
        let filled = t.masked_fill(&mask, -5.0);
        assert_eq!(filled.data, vec![0.0, -5.0, 0.0, 0.0, 0.0, -5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_narrow_rows() {
        let t = counting(&[3, 2]);
        assert_eq!(t.narrow_rows(2).data, vec![0.0, 1.0, 2.0, 3.0]);
    }
}
