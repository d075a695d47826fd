use core::marker::PhantomData;

use reborrow::{Reborrow, ReborrowMut};

use crate::error::{DimsError, Result};
use crate::scalar::Scalar;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Struc {
    General,
    Triangular,
    Symmetric,
    Hermitian,
}

/// Which triangle holds the referenced elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Uplo {
    Upper,
    Lower,
    Dense,
}

impl Uplo {
    #[inline]
    pub fn flip(self) -> Self {
        match self {
            Uplo::Upper => Uplo::Lower,
            Uplo::Lower => Uplo::Upper,
            Uplo::Dense => Uplo::Dense,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Diag {
    Unit,
    NonUnit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Untyped-lifetime operand descriptor shared by every worker of one operation.
///
/// `diag_off` is `col - row` for the elements on the diagonal.
#[derive(Debug)]
pub(crate) struct Operand<T> {
    pub ptr: *mut T,
    pub nrows: usize,
    pub ncols: usize,
    pub rs: isize,
    pub cs: isize,
    pub struc: Struc,
    pub uplo: Uplo,
    pub diag: Diag,
    pub conj: bool,
    pub diag_off: isize,
}

impl<T> Clone for Operand<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Operand<T> {}

unsafe impl<T: Sync> Sync for Operand<T> {}
unsafe impl<T: Send> Send for Operand<T> {}

impl<T: Scalar> Operand<T> {
    pub fn new(ptr: *mut T, nrows: usize, ncols: usize, rs: isize, cs: isize) -> Self {
        Self {
            ptr,
            nrows,
            ncols,
            rs,
            cs,
            struc: Struc::General,
            uplo: Uplo::Dense,
            diag: Diag::NonUnit,
            conj: false,
            diag_off: 0,
        }
    }

    #[inline]
    pub fn trans(self) -> Self {
        Self {
            nrows: self.ncols,
            ncols: self.nrows,
            rs: self.cs,
            cs: self.rs,
            uplo: self.uplo.flip(),
            diag_off: -self.diag_off,
            ..self
        }
    }

    #[inline]
    pub fn toggle_conj(self) -> Self {
        Self {
            conj: !self.conj,
            ..self
        }
    }

    #[inline]
    pub fn submatrix(self, row: usize, col: usize, nrows: usize, ncols: usize) -> Self {
        debug_assert!(row + nrows <= self.nrows && col + ncols <= self.ncols);
        Self {
            ptr: self.ptr_at(row, col),
            nrows,
            ncols,
            diag_off: self.diag_off + row as isize - col as isize,
            ..self
        }
    }

    #[inline(always)]
    pub fn ptr_at(&self, i: usize, j: usize) -> *mut T {
        self.ptr
            .wrapping_offset(i as isize * self.rs + j as isize * self.cs)
    }

    /// Stored value, conjugated if the view says so, no structure applied.
    #[inline(always)]
    pub unsafe fn read(&self, i: usize, j: usize) -> T {
        unsafe { (*self.ptr_at(i, j)).conj_if(self.conj) }
    }

    /// Whether an element at distance `d = (col - row) - diag_off` from the
    /// diagonal lies in the referenced triangle.
    #[inline(always)]
    pub fn in_stored(&self, d: isize) -> bool {
        match self.uplo {
            Uplo::Upper => d >= 0,
            Uplo::Lower => d <= 0,
            Uplo::Dense => true,
        }
    }

    /// Element through the structural interpretation of the view.
    pub unsafe fn get(&self, i: usize, j: usize) -> T {
        let d = j as isize - i as isize - self.diag_off;
        unsafe {
            match self.struc {
                Struc::General => self.read(i, j),
                Struc::Triangular => {
                    if d == 0 && self.diag == Diag::Unit {
                        T::one()
                    } else if self.in_stored(d) {
                        self.read(i, j)
                    } else {
                        T::zero()
                    }
                }
                Struc::Symmetric | Struc::Hermitian => {
                    let herm = self.struc == Struc::Hermitian;
                    if d == 0 && herm {
                        T::from_real(self.read(i, j).re())
                    } else if self.in_stored(d) {
                        self.read(i, j)
                    } else {
                        let ri = (j as isize - self.diag_off) as usize;
                        let rj = (i as isize + self.diag_off) as usize;
                        self.read(ri, rj).conj_if(herm)
                    }
                }
            }
        }
    }

    /// Whether the storage is contiguous along rows rather than columns.
    #[inline]
    pub fn is_row_stored(&self) -> bool {
        self.cs.unsigned_abs() == 1 && self.rs.unsigned_abs() != 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nrows == 0 || self.ncols == 0
    }
}

fn largest_offset(
    nrows: usize,
    ncols: usize,
    rs: usize,
    cs: usize,
) -> core::result::Result<usize, DimsError> {
    let r = (nrows - 1)
        .checked_mul(rs)
        .ok_or(DimsError::SizeOverflow)?;
    let c = (ncols - 1)
        .checked_mul(cs)
        .ok_or(DimsError::SizeOverflow)?;
    r.checked_add(c).ok_or(DimsError::SizeOverflow)
}

fn check_slice(
    len: usize,
    nrows: usize,
    ncols: usize,
    rs: usize,
    cs: usize,
) -> core::result::Result<(), DimsError> {
    if nrows == 0 || ncols == 0 {
        return Ok(());
    }
    let offset = largest_offset(nrows, ncols, rs, cs)?;
    if offset >= len {
        return Err(DimsError::BufferTooSmall(offset + 1));
    }
    Ok(())
}

/// Immutable strided view with structure tags.
pub struct MatRef<'a, T> {
    pub(crate) inner: Operand<T>,
    _marker: PhantomData<&'a [T]>,
}

impl<T> Clone for MatRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MatRef<'_, T> {}

/// Mutable strided view with structure tags.
pub struct MatMut<'a, T> {
    pub(crate) inner: Operand<T>,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'b, T> Reborrow<'b> for MatRef<'_, T> {
    type Target = MatRef<'b, T>;

    fn rb(&'b self) -> Self::Target {
        *self
    }
}

impl<'b, T> Reborrow<'b> for MatMut<'_, T> {
    type Target = MatRef<'b, T>;

    fn rb(&'b self) -> Self::Target {
        MatRef {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<'b, T> ReborrowMut<'b> for MatMut<'_, T> {
    type Target = MatMut<'b, T>;

    fn rb_mut(&'b mut self) -> Self::Target {
        MatMut {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

macro_rules! common_accessors {
    () => {
        pub fn nrows(&self) -> usize {
            self.inner.nrows
        }

        pub fn ncols(&self) -> usize {
            self.inner.ncols
        }

        pub fn row_stride(&self) -> isize {
            self.inner.rs
        }

        pub fn col_stride(&self) -> isize {
            self.inner.cs
        }

        pub fn struc(&self) -> Struc {
            self.inner.struc
        }

        pub fn uplo(&self) -> Uplo {
            self.inner.uplo
        }

        pub fn diag(&self) -> Diag {
            self.inner.diag
        }

        pub fn is_conj(&self) -> bool {
            self.inner.conj
        }

        /// `col - row` of the diagonal elements.
        pub fn diag_offset(&self) -> isize {
            self.inner.diag_off
        }

        /// Element as seen through the structure tags.
        pub fn get(&self, i: usize, j: usize) -> T {
            assert!(i < self.nrows() && j < self.ncols());
            unsafe { self.inner.get(i, j) }
        }

        /// Transposed alias; the stored triangle and diagonal offset follow.
        pub fn trans(self) -> Self {
            Self {
                inner: self.inner.trans(),
                _marker: PhantomData,
            }
        }

        /// Conjugated alias.
        pub fn conj(self) -> Self {
            Self {
                inner: self.inner.toggle_conj(),
                _marker: PhantomData,
            }
        }

        pub fn adjoint(self) -> Self {
            self.trans().conj()
        }

        pub fn submatrix(self, row: usize, col: usize, nrows: usize, ncols: usize) -> Self {
            assert!(row + nrows <= self.nrows() && col + ncols <= self.ncols());
            Self {
                inner: self.inner.submatrix(row, col, nrows, ncols),
                _marker: PhantomData,
            }
        }

        /// # Panics
        /// if a structured view names no triangle, or if a symmetric or
        /// Hermitian view is not square around its own diagonal.
        pub fn with_structure(self, struc: Struc, uplo: Uplo, diag: Diag) -> Self {
            if struc != Struc::General {
                assert!(uplo != Uplo::Dense, "structured views must name a stored triangle");
            }
            if matches!(struc, Struc::Symmetric | Struc::Hermitian) {
                // reflected reads must stay inside the view
                assert!(
                    self.nrows() == self.ncols() && self.diag_offset() == 0,
                    "{struc:?} view must be square with a centered diagonal, got {}x{} with offset {}",
                    self.nrows(),
                    self.ncols(),
                    self.diag_offset(),
                );
            }
            Self {
                inner: Operand {
                    struc,
                    uplo,
                    diag,
                    ..self.inner
                },
                _marker: PhantomData,
            }
        }

        pub fn triangular(self, uplo: Uplo, diag: Diag) -> Self {
            self.with_structure(Struc::Triangular, uplo, diag)
        }

        pub fn symmetric(self, uplo: Uplo) -> Self {
            self.with_structure(Struc::Symmetric, uplo, Diag::NonUnit)
        }

        pub fn hermitian(self, uplo: Uplo) -> Self {
            self.with_structure(Struc::Hermitian, uplo, Diag::NonUnit)
        }

        /// General view that still names a triangle, as used for a
        /// triangular output.
        pub fn with_uplo(self, uplo: Uplo) -> Self {
            Self {
                inner: Operand { uplo, ..self.inner },
                _marker: PhantomData,
            }
        }
    };
}

impl<'a, T: Scalar> MatRef<'a, T> {
    /// # Safety
    /// every element in the declared extent must be readable for `'a`.
    pub unsafe fn from_raw_parts(
        ptr: *const T,
        nrows: usize,
        ncols: usize,
        row_stride: isize,
        col_stride: isize,
    ) -> Self {
        Self {
            inner: Operand::new(ptr as *mut T, nrows, ncols, row_stride, col_stride),
            _marker: PhantomData,
        }
    }

    pub fn try_from_slice(
        buf: &'a [T],
        nrows: usize,
        ncols: usize,
        row_stride: usize,
        col_stride: usize,
    ) -> Result<Self> {
        check_slice(buf.len(), nrows, ncols, row_stride, col_stride)?;
        Ok(unsafe {
            Self::from_raw_parts(
                buf.as_ptr(),
                nrows,
                ncols,
                row_stride as isize,
                col_stride as isize,
            )
        })
    }

    /// Column-major view with leading dimension `nrows`.
    pub fn from_col_major(buf: &'a [T], nrows: usize, ncols: usize) -> Result<Self> {
        Self::try_from_slice(buf, nrows, ncols, 1, nrows)
    }

    pub fn as_ptr(&self) -> *const T {
        self.inner.ptr
    }

    common_accessors!();
}

impl<'a, T: Scalar> MatMut<'a, T> {
    /// # Safety
    /// every element in the declared extent must be writable for `'a` and
    /// not aliased elsewhere.
    pub unsafe fn from_raw_parts_mut(
        ptr: *mut T,
        nrows: usize,
        ncols: usize,
        row_stride: isize,
        col_stride: isize,
    ) -> Self {
        Self {
            inner: Operand::new(ptr, nrows, ncols, row_stride, col_stride),
            _marker: PhantomData,
        }
    }

    pub fn try_from_mut_slice(
        buf: &'a mut [T],
        nrows: usize,
        ncols: usize,
        row_stride: usize,
        col_stride: usize,
    ) -> Result<Self> {
        check_slice(buf.len(), nrows, ncols, row_stride, col_stride)?;
        Ok(unsafe {
            Self::from_raw_parts_mut(
                buf.as_mut_ptr(),
                nrows,
                ncols,
                row_stride as isize,
                col_stride as isize,
            )
        })
    }

    pub fn from_col_major_mut(buf: &'a mut [T], nrows: usize, ncols: usize) -> Result<Self> {
        Self::try_from_mut_slice(buf, nrows, ncols, 1, nrows)
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.inner.ptr
    }

    pub fn write(&mut self, i: usize, j: usize, value: T) {
        assert!(i < self.nrows() && j < self.ncols());
        unsafe { *self.inner.ptr_at(i, j) = value };
    }

    common_accessors!();
}
