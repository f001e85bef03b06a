pub mod ops;

use ndarray::{s, Array2, Axis, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;

use crate::errors::{Error, Result};
use crate::types::Dims;

/// A dense row-major 2-D tensor of `f32`.
///
/// Thin adapter over `ndarray::Array2`; the graph layer never touches
/// ndarray directly.
#[derive(Clone, Debug, Default)]
pub struct Tensor {
    data: Array2<f32>,
}

impl Tensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Array2::zeros((rows, cols)).into()
    }

    pub fn ones(rows: usize, cols: usize) -> Self {
        Array2::ones((rows, cols)).into()
    }

    pub fn full(rows: usize, cols: usize, value: f32) -> Self {
        Array2::from_elem((rows, cols), value).into()
    }

    pub fn identity(n: usize) -> Self {
        Array2::eye(n).into()
    }

    /// Uniform fill in [-1, 1) from the graph's RNG.
    pub fn random(rows: usize, cols: usize, rng: &mut StdRng) -> Self {
        Array2::random_using((rows, cols), Uniform::new(-1.0, 1.0), rng).into()
    }

    pub fn from_vec(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self> {
        let len = values.len();
        Array2::from_shape_vec((rows, cols), values)
            .map(Into::into)
            .map_err(|_| Error::Codec(format!("{len} values cannot fill a {rows}x{cols} tensor")))
    }

    pub fn from_rows(rows: &[&[f32]]) -> Self {
        let r = rows.len();
        let c = rows.first().map_or(0, |row| row.len());
        let mut data = Array2::zeros((r, c));
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                data[[i, j]] = v;
            }
        }
        data.into()
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> Dims {
        (self.data.nrows(), self.data.ncols())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[[row, col]]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[[row, col]] = value;
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    /// Row-major element view. Storage is standard-layout by construction.
    pub fn as_slice(&self) -> &[f32] {
        self.data.as_slice().expect("tensor storage is row-major")
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        self.data
            .as_slice_mut()
            .expect("tensor storage is row-major")
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    pub fn copy_from(&mut self, other: &Self) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::shape("copy_from", self.shape(), other.shape()));
        }
        self.data.assign(&other.data);
        Ok(())
    }

    /// Element-wise map into a fresh tensor.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let mut out = self.clone();
        Zip::from(out.data_mut()).par_for_each(|v| *v = f(*v));
        out
    }

    /// Element-wise map written into `out` (same shape as `self`).
    pub fn map_into<F>(&self, out: &mut Self, f: F)
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        Zip::from(&mut out.data)
            .and(&self.data)
            .par_for_each(|o, &x| *o = f(x));
    }

    /// Element-wise combine of `self` and `other` into `out`.
    pub fn zip_into<F>(&self, other: &Self, out: &mut Self, f: F)
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        Zip::from(&mut out.data)
            .and(&self.data)
            .and(&other.data)
            .par_for_each(|o, &a, &b| *o = f(a, b));
    }

    /// `out += f(a, b)` element-wise.
    pub fn zip_accumulate<F>(&self, other: &Self, out: &mut Self, f: F)
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        Zip::from(&mut out.data)
            .and(&self.data)
            .and(&other.data)
            .par_for_each(|o, &a, &b| *o += f(a, b));
    }

    pub fn matmul(&self, other: &Self) -> Result<Self> {
        if self.cols() != other.rows() {
            return Err(Error::shape("matmul", (self.cols(), 0), other.shape()));
        }
        Ok(self.data.dot(&other.data).into())
    }

    /// `out = a · b`, reusing `out`'s buffer.
    pub fn matmul_into(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        if a.cols() != b.rows() {
            return Err(Error::shape("matmul", (a.cols(), 0), b.shape()));
        }
        ndarray::linalg::general_mat_mul(1.0, &a.data, &b.data, 0.0, &mut out.data);
        Ok(())
    }

    /// `out += a · b`.
    pub fn matmul_accumulate(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        if a.cols() != b.rows() {
            return Err(Error::shape("matmul", (a.cols(), 0), b.shape()));
        }
        ndarray::linalg::general_mat_mul(1.0, &a.data, &b.data, 1.0, &mut out.data);
        Ok(())
    }

    /// `out = beta * out + opt_t(a) · opt_t(b)` with optional transposes,
    /// without materializing the transposed operands.
    pub fn matmul_t(
        a: &Self,
        trans_a: bool,
        b: &Self,
        trans_b: bool,
        beta: f32,
        out: &mut Self,
    ) -> Result<()> {
        let lhs = if trans_a { a.data.t() } else { a.data.view() };
        let rhs = if trans_b { b.data.t() } else { b.data.view() };
        if lhs.ncols() != rhs.nrows() {
            return Err(Error::shape(
                "matmul",
                (lhs.nrows(), lhs.ncols()),
                (rhs.nrows(), rhs.ncols()),
            ));
        }
        ndarray::linalg::general_mat_mul(1.0, &lhs, &rhs, beta, &mut out.data);
        Ok(())
    }

    pub fn transpose(&self) -> Self {
        self.data.t().to_owned().into()
    }

    pub fn reshape(&self, rows: usize, cols: usize) -> Result<Self> {
        if rows * cols != self.len() {
            return Err(Error::shape("reshape", (rows, cols), self.shape()));
        }
        Tensor::from_vec(rows, cols, self.as_slice().to_vec())
    }

    /// Copy the block anchored at (row, col) into `out`; `out`'s shape
    /// selects the block size.
    pub fn read_block_into(&self, row: usize, col: usize, out: &mut Self) -> Result<()> {
        let (rows, cols) = out.shape();
        if row + rows > self.rows() || col + cols > self.cols() {
            return Err(Error::shape("block", (rows, cols), self.shape()));
        }
        out.data
            .assign(&self.data.slice(s![row..row + rows, col..col + cols]));
        Ok(())
    }

    /// Rectangular sub-block copy.
    pub fn block(&self, row: usize, col: usize, rows: usize, cols: usize) -> Result<Self> {
        if row + rows > self.rows() || col + cols > self.cols() {
            return Err(Error::shape("block", (rows, cols), self.shape()));
        }
        Ok(self
            .data
            .slice(s![row..row + rows, col..col + cols])
            .to_owned()
            .into())
    }

    /// Write `src` into the rectangular block anchored at (row, col).
    pub fn set_block(&mut self, row: usize, col: usize, src: &Self) -> Result<()> {
        let (rows, cols) = src.shape();
        if row + rows > self.rows() || col + cols > self.cols() {
            return Err(Error::shape("set_block", (rows, cols), self.shape()));
        }
        self.data
            .slice_mut(s![row..row + rows, col..col + cols])
            .assign(&src.data);
        Ok(())
    }

    /// Add `src` into the rectangular block anchored at (row, col).
    pub fn add_block(&mut self, row: usize, col: usize, src: &Self) -> Result<()> {
        let (rows, cols) = src.shape();
        if row + rows > self.rows() || col + cols > self.cols() {
            return Err(Error::shape("add_block", (rows, cols), self.shape()));
        }
        let mut view = self.data.slice_mut(s![row..row + rows, col..col + cols]);
        view += &src.data;
        Ok(())
    }

    /// Expand a 1x1, 1xC or Rx1 tensor to (rows, cols).
    pub fn broadcast_to(&self, rows: usize, cols: usize) -> Result<Self> {
        let out = match self.shape() {
            (1, 1) => Array2::from_elem((rows, cols), self.data[[0, 0]]),
            (1, c) if c == cols => {
                let mut out = Array2::zeros((rows, cols));
                for mut row in out.rows_mut() {
                    row.assign(&self.data.row(0));
                }
                out
            }
            (r, 1) if r == rows => {
                let mut out = Array2::zeros((rows, cols));
                for mut col in out.columns_mut() {
                    col.assign(&self.data.column(0));
                }
                out
            }
            found => return Err(Error::shape("broadcast", (rows, cols), found)),
        };
        Ok(out.into())
    }

    pub fn sum(&self) -> f32 {
        self.data.sum()
    }

    pub fn mean(&self) -> f32 {
        self.data.mean().unwrap_or(0.0)
    }

    /// Per-column sums as a 1xC tensor.
    pub fn column_sums(&self) -> Self {
        let sums = self.data.sum_axis(Axis(0));
        let cols = sums.len();
        Array2::from_shape_vec((1, cols), sums.to_vec()).expect("1xC reshape").into()
    }

    /// Per-row sums as an Rx1 tensor.
    pub fn row_sums(&self) -> Self {
        let sums = self.data.sum_axis(Axis(1));
        let rows = sums.len();
        Array2::from_shape_vec((rows, 1), sums.to_vec()).expect("Rx1 reshape").into()
    }

    /// Element-wise minimum with another tensor.
    pub fn elem_min(&self, other: &Self) -> Result<Self> {
        if self.shape() != other.shape() {
            return Err(Error::shape("min", self.shape(), other.shape()));
        }
        let mut out = self.clone();
        other.zip_into(self, &mut out, |b, a| a.min(b));
        Ok(out)
    }

    /// Element-wise maximum with another tensor.
    pub fn elem_max(&self, other: &Self) -> Result<Self> {
        if self.shape() != other.shape() {
            return Err(Error::shape("max", self.shape(), other.shape()));
        }
        let mut out = self.clone();
        other.zip_into(self, &mut out, |b, a| a.max(b));
        Ok(out)
    }

    /// Apply `f` to each row in place.
    pub fn apply_rows<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut [f32]),
    {
        let cols = self.cols();
        if cols == 0 {
            return;
        }
        for row in self.as_slice_mut().chunks_mut(cols) {
            f(row);
        }
    }

    /// Flat dot product over all elements.
    pub fn dot_flat(&self, other: &Self) -> f32 {
        self.as_slice()
            .iter()
            .zip(other.as_slice())
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn is_approx(&self, other: &Self, tolerance: f32) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        self.as_slice()
            .iter()
            .zip(other.as_slice())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl From<Array2<f32>> for Tensor {
    fn from(data: Array2<f32>) -> Self {
        // Owned arrays from transposed views keep their stride order;
        // repack so as_slice stays row-major.
        if data.is_standard_layout() {
            Self { data }
        } else {
            let shape = (data.nrows(), data.ncols());
            let flat: Vec<f32> = data.iter().copied().collect();
            Self {
                data: Array2::from_shape_vec(shape, flat).expect("repack preserves length"),
            }
        }
    }
}
