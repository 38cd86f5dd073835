//! Read-only views over a solution vector for the recording layer.

use crate::discretization::Discretization;
use serde::{Deserialize, Serialize};

/// Axes of the bulk concentration block, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateOrdering {
    AxialCell,
    Channel,
    Component,
}

pub const CONCENTRATION_ORDERING: [StateOrdering; 3] = [
    StateOrdering::AxialCell,
    StateOrdering::Channel,
    StateOrdering::Component,
];

/// Shape of a unit operation's solution, reported once before the first
/// time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionStructure {
    pub n_comp: usize,
    pub n_axial_cells: usize,
    pub n_channels: usize,
    pub n_inlet_ports: usize,
    pub n_outlet_ports: usize,
    pub axial_coordinates: Vec<f64>,
    pub channel_coordinates: Vec<f64>,
    pub ordering: Vec<StateOrdering>,
}

impl SolutionStructure {
    pub fn new(disc: &Discretization, col_length: f64) -> Self {
        let h = col_length / disc.n_col as f64;
        Self {
            n_comp: disc.n_comp,
            n_axial_cells: disc.n_col,
            n_channels: disc.n_channel,
            n_inlet_ports: disc.n_channel,
            n_outlet_ports: disc.n_channel,
            axial_coordinates: (0..disc.n_col).map(|i| (i as f64 + 0.5) * h).collect(),
            channel_coordinates: (0..disc.n_channel).map(|i| i as f64).collect(),
            ordering: CONCENTRATION_ORDERING.to_vec(),
        }
    }
}

/// Non-owning view of a state vector together with the flow directions that
/// decide which end cell is a channel's outlet.
#[derive(Debug, Clone, Copy)]
pub struct Exporter<'a> {
    disc: Discretization,
    forward: &'a [bool],
    col_length: f64,
    data: &'a [f64],
}

impl<'a> Exporter<'a> {
    pub fn new(disc: Discretization, forward: &'a [bool], col_length: f64, data: &'a [f64]) -> Self {
        debug_assert_eq!(forward.len(), disc.n_channel);
        debug_assert!(data.len() >= disc.num_dofs());
        Self {
            disc,
            forward,
            col_length,
            data,
        }
    }

    pub fn num_components(&self) -> usize {
        self.disc.n_comp
    }

    pub fn num_axial_cells(&self) -> usize {
        self.disc.n_col
    }

    pub fn num_channels(&self) -> usize {
        self.disc.n_channel
    }

    pub fn num_inlet_ports(&self) -> usize {
        self.disc.n_channel
    }

    pub fn num_outlet_ports(&self) -> usize {
        self.disc.n_channel
    }

    /// Inlet concentrations of all components entering through `port`.
    pub fn inlet(&self, port: usize) -> &'a [f64] {
        let start = self.disc.indexer().inlet(port, 0);
        &self.data[start..start + self.disc.n_comp]
    }

    /// Concentrations of the cell drained by `port`: the last axial cell for
    /// forward flow, the first one for reversed flow.
    pub fn outlet(&self, port: usize) -> &'a [f64] {
        let cell = if self.forward[port] {
            self.disc.n_col - 1
        } else {
            0
        };
        let start = self.disc.indexer().c(cell, port, 0);
        &self.data[start..start + self.disc.n_comp]
    }

    /// Bulk block, ordered as [`CONCENTRATION_ORDERING`].
    pub fn concentration(&self) -> &'a [f64] {
        &self.disc.indexer().bulk(self.data)[..self.disc.num_bulk_dofs()]
    }

    pub fn concentration_ordering(&self) -> &'static [StateOrdering] {
        &CONCENTRATION_ORDERING
    }

    /// Strides of the bulk block along its axes, outermost first.
    pub fn bulk_strides(&self) -> [usize; 3] {
        let idx = self.disc.indexer();
        [idx.stride_axial_cell(), idx.stride_channel(), idx.stride_comp()]
    }

    /// Cell centers along the column.
    pub fn axial_coordinates(&self) -> Vec<f64> {
        self.structure().axial_coordinates
    }

    pub fn channel_coordinates(&self) -> Vec<f64> {
        self.structure().channel_coordinates
    }

    pub fn structure(&self) -> SolutionStructure {
        SolutionStructure::new(&self.disc, self.col_length)
    }
}

/// Consumer of solution structure and time points.
pub trait SolutionRecorder {
    fn unit_operation_structure(&mut self, unit_op_id: usize, structure: &SolutionStructure);
    fn unit_operation_solution(&mut self, unit_op_id: usize, exporter: &Exporter<'_>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub time: f64,
    /// `[port][component]`
    pub inlet: Vec<Vec<f64>>,
    /// `[port][component]`
    pub outlet: Vec<Vec<f64>>,
    pub bulk: Option<Vec<f64>>,
}

/// Keeps every reported time point in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalStorageRecorder {
    pub store_bulk: bool,
    pub structure: Option<SolutionStructure>,
    pub records: Vec<SolutionRecord>,
    #[serde(skip)]
    current_time: f64,
}

impl InternalStorageRecorder {
    pub fn new(store_bulk: bool) -> Self {
        Self {
            store_bulk,
            ..Self::default()
        }
    }

    /// Time stamp of the solutions reported next.
    pub fn begin_timestep(&mut self, t: f64) {
        self.current_time = t;
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// Outlet history of one port and component.
    pub fn outlet_series(&self, port: usize, comp: usize) -> Vec<f64> {
        self.records.iter().map(|r| r.outlet[port][comp]).collect()
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }
}

impl SolutionRecorder for InternalStorageRecorder {
    fn unit_operation_structure(&mut self, _unit_op_id: usize, structure: &SolutionStructure) {
        self.structure = Some(structure.clone());
    }

    fn unit_operation_solution(&mut self, _unit_op_id: usize, exporter: &Exporter<'_>) {
        let inlet = (0..exporter.num_inlet_ports())
            .map(|p| exporter.inlet(p).to_vec())
            .collect();
        let outlet = (0..exporter.num_outlet_ports())
            .map(|p| exporter.outlet(p).to_vec())
            .collect();
        let bulk = self.store_bulk.then(|| exporter.concentration().to_vec());
        self.records.push(SolutionRecord {
            time: self.current_time,
            inlet,
            outlet,
            bulk,
        });
    }
}
