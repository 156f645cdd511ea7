//! Small dense kernels on row-major blocks.
//!
//! These are the inner loops of the eliminator and the partitioned view. Every
//! kernel is generic over the block dimensions it touches. A dimension given as
//! a const parameter is known to the compiler, which unrolls and vectorizes the
//! loops; [`DYNAMIC`] means "read the size at run time".
//!
//! All kernels combine the product with the destination through an
//! [`Accumulate`] mode:
//!
//! ```text
//! Assign:    C  = A * B
//! Add:       C += A * B
//! Subtract:  C -= A * B
//! ```
//!
//! Dimension mismatches are bugs in the caller and panic.

/// Sentinel for a block dimension that is only known at run time.
pub const DYNAMIC: usize = 0;

/// How a kernel result is combined with the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulate {
    Assign,
    Add,
    Subtract,
}

impl Accumulate {
    #[inline(always)]
    pub fn apply(self, dst: &mut f64, value: f64) {
        match self {
            Accumulate::Assign => *dst = value,
            Accumulate::Add => *dst += value,
            Accumulate::Subtract => *dst -= value,
        }
    }
}

/// Resolve a dimension: the const parameter when it is static, the run-time
/// value otherwise. A static dimension must agree with the run-time one.
#[inline(always)]
pub fn resolve_dim<const N: usize>(runtime: usize) -> usize {
    assert!(runtime > 0, "block dimensions must be positive");
    if N == DYNAMIC {
        runtime
    } else {
        assert_eq!(
            runtime, N,
            "run-time block dimension does not match the compile-time one"
        );
        N
    }
}

/// Read-only view of a dense row-major block.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    data: &'a [f64],
    rows: usize,
    cols: usize,
}

impl<'a> MatRef<'a> {
    pub fn new(data: &'a [f64], rows: usize, cols: usize) -> Self {
        assert!(
            data.len() >= rows * cols,
            "buffer of {} values cannot hold a {}x{} block",
            data.len(),
            rows,
            cols
        );
        Self {
            data: &data[..rows * cols],
            rows,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &'a [f64] {
        self.data
    }
}

/// Writable region of a larger row-major buffer.
///
/// The buffer is `row_stride x col_stride`; the region starts at
/// `(start_row, start_col)`.
#[derive(Debug)]
pub struct MatMut<'a> {
    data: &'a mut [f64],
    start_row: usize,
    start_col: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> MatMut<'a> {
    /// The whole buffer as a `rows x cols` block.
    pub fn new(data: &'a mut [f64], rows: usize, cols: usize) -> Self {
        Self::region(data, 0, 0, rows, cols)
    }

    pub fn region(
        data: &'a mut [f64],
        start_row: usize,
        start_col: usize,
        row_stride: usize,
        col_stride: usize,
    ) -> Self {
        assert!(
            data.len() >= row_stride * col_stride,
            "buffer of {} values cannot hold a {}x{} matrix",
            data.len(),
            row_stride,
            col_stride
        );
        Self {
            data,
            start_row,
            start_col,
            row_stride,
            col_stride,
        }
    }

    #[inline(always)]
    fn at(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.data[(self.start_row + row) * self.col_stride + self.start_col + col]
    }

    #[inline(always)]
    fn check_fits(&self, rows: usize, cols: usize) {
        assert!(
            self.start_row + rows <= self.row_stride && self.start_col + cols <= self.col_stride,
            "{}x{} product does not fit at ({}, {}) of a {}x{} destination",
            rows,
            cols,
            self.start_row,
            self.start_col,
            self.row_stride,
            self.col_stride
        );
    }
}

/// `C op= A * B`
#[inline]
pub fn matrix_matrix_multiply<const RA: usize, const CA: usize, const RB: usize, const CB: usize>(
    op: Accumulate,
    a: MatRef<'_>,
    b: MatRef<'_>,
    c: &mut MatMut<'_>,
) {
    let ra = resolve_dim::<RA>(a.rows);
    let ca = resolve_dim::<CA>(a.cols);
    let rb = resolve_dim::<RB>(b.rows);
    let cb = resolve_dim::<CB>(b.cols);
    assert_eq!(ca, rb, "inner dimensions of A * B differ");
    c.check_fits(ra, cb);

    let (a, b) = (a.data, b.data);
    for row in 0..ra {
        for col in 0..cb {
            let mut sum = 0.0;
            for k in 0..ca {
                sum += a[row * ca + k] * b[k * cb + col];
            }
            op.apply(c.at(row, col), sum);
        }
    }
}

/// `C op= Aᵗ * B`
#[inline]
pub fn matrix_transpose_matrix_multiply<
    const RA: usize,
    const CA: usize,
    const RB: usize,
    const CB: usize,
>(
    op: Accumulate,
    a: MatRef<'_>,
    b: MatRef<'_>,
    c: &mut MatMut<'_>,
) {
    let ra = resolve_dim::<RA>(a.rows);
    let ca = resolve_dim::<CA>(a.cols);
    let rb = resolve_dim::<RB>(b.rows);
    let cb = resolve_dim::<CB>(b.cols);
    assert_eq!(ra, rb, "inner dimensions of Aᵗ * B differ");
    c.check_fits(ca, cb);

    let (a, b) = (a.data, b.data);
    for row in 0..ca {
        for col in 0..cb {
            let mut sum = 0.0;
            for k in 0..ra {
                sum += a[k * ca + row] * b[k * cb + col];
            }
            op.apply(c.at(row, col), sum);
        }
    }
}

/// `y op= A * x`
#[inline]
pub fn matrix_vector_multiply<const R: usize, const C: usize>(
    op: Accumulate,
    a: MatRef<'_>,
    x: &[f64],
    y: &mut [f64],
) {
    let rows = resolve_dim::<R>(a.rows);
    let cols = resolve_dim::<C>(a.cols);
    assert!(x.len() >= cols && y.len() >= rows, "vector too short for A * x");

    let a = a.data;
    for row in 0..rows {
        let mut sum = 0.0;
        for col in 0..cols {
            sum += a[row * cols + col] * x[col];
        }
        op.apply(&mut y[row], sum);
    }
}

/// `y op= Aᵗ * x`
#[inline]
pub fn matrix_transpose_vector_multiply<const R: usize, const C: usize>(
    op: Accumulate,
    a: MatRef<'_>,
    x: &[f64],
    y: &mut [f64],
) {
    let rows = resolve_dim::<R>(a.rows);
    let cols = resolve_dim::<C>(a.cols);
    assert!(x.len() >= rows && y.len() >= cols, "vector too short for Aᵗ * x");

    let a = a.data;
    for col in 0..cols {
        let mut sum = 0.0;
        for row in 0..rows {
            sum += a[row * cols + col] * x[row];
        }
        op.apply(&mut y[col], sum);
    }
}
