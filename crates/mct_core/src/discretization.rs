//! Discretization shape and the degree-of-freedom layout.
//!
//! State vector layout:
//! - inlet block `[0, n_comp·n_channel)`, ordered channel-major, component-minor,
//! - bulk block, ordered axial cell, then channel, then component.
//!
//! [`Indexer`] is the only place that knows these strides.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discretization {
    pub n_comp: usize,
    pub n_col: usize,
    pub n_channel: usize,
}

impl Discretization {
    pub fn new(n_comp: usize, n_col: usize, n_channel: usize) -> Result<Self, ModelError> {
        if n_comp == 0 {
            return Err(ModelError::InvalidDiscretization(
                "number of components must be positive".into(),
            ));
        }
        if n_col == 0 {
            return Err(ModelError::InvalidDiscretization(
                "number of axial cells must be positive".into(),
            ));
        }
        if n_channel == 0 {
            return Err(ModelError::InvalidDiscretization(
                "number of channels must be positive".into(),
            ));
        }
        Ok(Self {
            n_comp,
            n_col,
            n_channel,
        })
    }

    pub fn num_inlet_dofs(&self) -> usize {
        self.n_comp * self.n_channel
    }

    pub fn num_bulk_dofs(&self) -> usize {
        self.n_comp * self.n_col * self.n_channel
    }

    pub fn num_dofs(&self) -> usize {
        self.num_inlet_dofs() + self.num_bulk_dofs()
    }

    pub fn indexer(&self) -> Indexer {
        Indexer { disc: *self }
    }
}

/// Semantic coordinate of a single DOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dof {
    Inlet { channel: usize, comp: usize },
    Bulk { cell: usize, channel: usize, comp: usize },
}

/// Maps `(cell, channel, component)` coordinates to flat offsets.
#[derive(Debug, Clone, Copy)]
pub struct Indexer {
    disc: Discretization,
}

impl Indexer {
    pub fn new(disc: Discretization) -> Self {
        Self { disc }
    }

    #[inline]
    pub fn stride_axial_cell(&self) -> usize {
        self.disc.n_comp * self.disc.n_channel
    }

    #[inline]
    pub fn stride_channel(&self) -> usize {
        self.disc.n_comp
    }

    #[inline]
    pub fn stride_comp(&self) -> usize {
        1
    }

    #[inline]
    pub fn offset_inlet(&self) -> usize {
        0
    }

    #[inline]
    pub fn offset_c(&self) -> usize {
        self.disc.num_inlet_dofs()
    }

    #[inline]
    pub fn inlet(&self, channel: usize, comp: usize) -> usize {
        debug_assert!(channel < self.disc.n_channel, "channel {channel} out of range");
        debug_assert!(comp < self.disc.n_comp, "component {comp} out of range");
        self.offset_inlet() + channel * self.disc.n_comp + comp
    }

    #[inline]
    pub fn c(&self, cell: usize, channel: usize, comp: usize) -> usize {
        debug_assert!(cell < self.disc.n_col, "axial cell {cell} out of range");
        debug_assert!(channel < self.disc.n_channel, "channel {channel} out of range");
        debug_assert!(comp < self.disc.n_comp, "component {comp} out of range");
        self.offset_c()
            + cell * self.stride_axial_cell()
            + channel * self.stride_channel()
            + comp * self.stride_comp()
    }

    /// Bulk block of a state buffer.
    pub fn bulk<'a, T>(&self, data: &'a [T]) -> &'a [T] {
        &data[self.offset_c()..self.disc.num_dofs()]
    }

    /// Inlet block of a state buffer.
    pub fn inlet_block<'a, T>(&self, data: &'a [T]) -> &'a [T] {
        &data[self.offset_inlet()..self.offset_c()]
    }

    pub fn is_inlet(&self, offset: usize) -> bool {
        offset < self.offset_c()
    }

    /// Inverse of [`Indexer::inlet`] and [`Indexer::c`].
    pub fn decompose(&self, offset: usize) -> Dof {
        debug_assert!(offset < self.disc.num_dofs(), "offset {offset} out of range");
        if self.is_inlet(offset) {
            let local = offset - self.offset_inlet();
            return Dof::Inlet {
                channel: local / self.stride_channel(),
                comp: local % self.stride_channel(),
            };
        }
        let local = offset - self.offset_c();
        let cell = local / self.stride_axial_cell();
        let rest = local % self.stride_axial_cell();
        Dof::Bulk {
            cell,
            channel: rest / self.stride_channel(),
            comp: rest % self.stride_channel(),
        }
    }
}
