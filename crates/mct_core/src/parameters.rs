//! Model parameters, their identifiers, and sensitivity seeds.
//!
//! Parameters are stored as plain values. When the residual is evaluated for
//! a sensitivity direction, every parameter registered for that direction is
//! lifted into the evaluation type with its seed as derivative.

use crate::convection_dispersion::TransportCoefficients;
use crate::inlet::InletProfile;
use crate::traits::Active;
use serde::{Deserialize, Serialize};

/// Identifies one model quantity. `None` fields are wildcards, so a single id
/// may address a whole family of entries (e.g. a dispersion coefficient shared
/// by all channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterId {
    ColLength,
    ColDispersion {
        component: Option<usize>,
        channel: Option<usize>,
    },
    ExchangeRate {
        from: Option<usize>,
        to: Option<usize>,
        component: Option<usize>,
    },
    CrossSectionArea {
        channel: Option<usize>,
    },
    FlowRate {
        channel: Option<usize>,
    },
    InitC {
        component: Option<usize>,
        channel: Option<usize>,
    },
    InletCoefficient {
        section: Option<usize>,
        channel: Option<usize>,
        component: Option<usize>,
        degree: Option<usize>,
    },
}

fn slot(pattern: Option<usize>, concrete: Option<usize>) -> bool {
    match (pattern, concrete) {
        (None, _) => true,
        (Some(p), Some(c)) => p == c,
        (Some(_), None) => false,
    }
}

impl ParameterId {
    /// Whether `self`, possibly containing wildcards, addresses `concrete`.
    pub fn matches(&self, concrete: &ParameterId) -> bool {
        use ParameterId::*;
        match (self, concrete) {
            (ColLength, ColLength) => true,
            (
                ColDispersion { component, channel },
                ColDispersion {
                    component: c2,
                    channel: ch2,
                },
            ) => slot(*component, *c2) && slot(*channel, *ch2),
            (
                ExchangeRate {
                    from,
                    to,
                    component,
                },
                ExchangeRate {
                    from: f2,
                    to: t2,
                    component: c2,
                },
            ) => slot(*from, *f2) && slot(*to, *t2) && slot(*component, *c2),
            (CrossSectionArea { channel }, CrossSectionArea { channel: ch2 }) => {
                slot(*channel, *ch2)
            }
            (FlowRate { channel }, FlowRate { channel: ch2 }) => slot(*channel, *ch2),
            (
                InitC { component, channel },
                InitC {
                    component: c2,
                    channel: ch2,
                },
            ) => slot(*component, *c2) && slot(*channel, *ch2),
            (
                InletCoefficient {
                    section,
                    channel,
                    component,
                    degree,
                },
                InletCoefficient {
                    section: s2,
                    channel: ch2,
                    component: c2,
                    degree: d2,
                },
            ) => {
                slot(*section, *s2)
                    && slot(*channel, *ch2)
                    && slot(*component, *c2)
                    && slot(*degree, *d2)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitiveParameter {
    pub id: ParameterId,
    pub direction: usize,
    pub seed: f64,
}

/// Physical parameters of the multi-channel transport model.
///
/// Per-entry arrays are laid out `[channel·n_comp + comp]`; the exchange
/// matrix is `[(from·n_channel + to)·n_comp + comp]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub n_comp: usize,
    pub n_channel: usize,
    pub col_length: f64,
    pub cross_sections: Vec<f64>,
    pub flow_rates: Vec<f64>,
    pub dispersion: Vec<f64>,
    pub exchange: Vec<f64>,
    pub init_c: Vec<f64>,
    pub inlet: InletProfile,
    sensitive: Vec<SensitiveParameter>,
}

impl ModelParameters {
    pub fn new(n_comp: usize, n_channel: usize) -> Self {
        let entries = n_comp * n_channel;
        Self {
            n_comp,
            n_channel,
            col_length: 1.0,
            cross_sections: vec![1.0; n_channel],
            flow_rates: vec![0.0; n_channel],
            dispersion: vec![0.0; entries],
            exchange: vec![0.0; n_channel * n_channel * n_comp],
            init_c: vec![0.0; entries],
            inlet: InletProfile::zero(entries),
            sensitive: Vec::new(),
        }
    }

    #[inline]
    pub fn entry(&self, channel: usize, comp: usize) -> usize {
        channel * self.n_comp + comp
    }

    #[inline]
    pub fn exchange_index(&self, from: usize, to: usize, comp: usize) -> usize {
        (from * self.n_channel + to) * self.n_comp + comp
    }

    /// Visits every concrete entry addressed by `id` with a mutable reference.
    fn for_each_entry<F: FnMut(&mut f64)>(&mut self, id: &ParameterId, mut f: F) -> bool {
        let mut hit = false;
        let mut visit = |concrete: ParameterId, value: &mut f64| {
            if id.matches(&concrete) {
                f(value);
                hit = true;
            }
        };
        let (n_comp, n_channel) = (self.n_comp, self.n_channel);
        visit(ParameterId::ColLength, &mut self.col_length);
        for ch in 0..n_channel {
            visit(
                ParameterId::CrossSectionArea { channel: Some(ch) },
                &mut self.cross_sections[ch],
            );
            visit(
                ParameterId::FlowRate { channel: Some(ch) },
                &mut self.flow_rates[ch],
            );
            for comp in 0..n_comp {
                let e = ch * n_comp + comp;
                visit(
                    ParameterId::ColDispersion {
                        component: Some(comp),
                        channel: Some(ch),
                    },
                    &mut self.dispersion[e],
                );
                visit(
                    ParameterId::InitC {
                        component: Some(comp),
                        channel: Some(ch),
                    },
                    &mut self.init_c[e],
                );
                for sec in 0..self.inlet.num_sections() {
                    for degree in 0..4 {
                        if let Some(value) = self.inlet.coefficient_mut(sec, degree, e) {
                            visit(
                                ParameterId::InletCoefficient {
                                    section: Some(sec),
                                    channel: Some(ch),
                                    component: Some(comp),
                                    degree: Some(degree),
                                },
                                value,
                            );
                        }
                    }
                }
            }
        }
        for from in 0..n_channel {
            for to in 0..n_channel {
                for comp in 0..n_comp {
                    let idx = (from * n_channel + to) * n_comp + comp;
                    visit(
                        ParameterId::ExchangeRate {
                            from: Some(from),
                            to: Some(to),
                            component: Some(comp),
                        },
                        &mut self.exchange[idx],
                    );
                }
            }
        }
        hit
    }

    /// Sets every entry addressed by `id`; returns whether any entry matched.
    pub fn set(&mut self, id: &ParameterId, value: f64) -> bool {
        self.for_each_entry(id, |v| *v = value)
    }

    pub fn addresses_any(&mut self, id: &ParameterId) -> bool {
        self.for_each_entry(id, |_| {})
    }

    pub fn add_sensitive(&mut self, id: ParameterId, direction: usize, seed: f64) {
        self.sensitive
            .retain(|s| !(s.id == id && s.direction == direction));
        self.sensitive.push(SensitiveParameter {
            id,
            direction,
            seed,
        });
    }

    pub fn clear_sensitive(&mut self) {
        self.sensitive.clear();
    }

    pub fn sensitive(&self) -> &[SensitiveParameter] {
        &self.sensitive
    }

    pub fn num_directions(&self) -> usize {
        self.sensitive
            .iter()
            .map(|s| s.direction + 1)
            .max()
            .unwrap_or(0)
    }

    /// Seed of `concrete` in `direction`; zero if it is not sensitive there.
    pub fn seed(&self, concrete: &ParameterId, direction: Option<usize>) -> f64 {
        let Some(direction) = direction else {
            return 0.0;
        };
        self.sensitive
            .iter()
            .filter(|s| s.direction == direction && s.id.matches(concrete))
            .map(|s| s.seed)
            .sum()
    }

    #[inline]
    pub fn lift<T: Active>(&self, concrete: ParameterId, value: f64, direction: Option<usize>) -> T {
        T::seeded(value, self.seed(&concrete, direction))
    }

    /// Lifts an inlet coefficient `(section, degree, entry, value)`.
    pub fn lift_inlet<T: Active>(
        &self,
        direction: Option<usize>,
    ) -> impl Fn(usize, usize, usize, f64) -> T + '_ {
        move |sec, degree, entry, value| {
            self.lift(
                ParameterId::InletCoefficient {
                    section: Some(sec),
                    channel: Some(entry / self.n_comp),
                    component: Some(entry % self.n_comp),
                    degree: Some(degree),
                },
                value,
                direction,
            )
        }
    }

    /// Builds the transport coefficients in evaluation type `T`, seeding the
    /// parameters of `direction` if one is given.
    pub fn coefficients<T: Active>(&self, direction: Option<usize>) -> TransportCoefficients<T> {
        let (n_comp, n_channel) = (self.n_comp, self.n_channel);
        let col_length = self.lift(ParameterId::ColLength, self.col_length, direction);
        let mut cross_sections = Vec::with_capacity(n_channel);
        let mut velocity = Vec::with_capacity(n_channel);
        for ch in 0..n_channel {
            let area: T = self.lift(
                ParameterId::CrossSectionArea { channel: Some(ch) },
                self.cross_sections[ch],
                direction,
            );
            let flow: T = self.lift(
                ParameterId::FlowRate { channel: Some(ch) },
                self.flow_rates[ch],
                direction,
            );
            velocity.push(flow / area);
            cross_sections.push(area);
        }
        let mut dispersion = Vec::with_capacity(n_comp * n_channel);
        for ch in 0..n_channel {
            for comp in 0..n_comp {
                dispersion.push(self.lift(
                    ParameterId::ColDispersion {
                        component: Some(comp),
                        channel: Some(ch),
                    },
                    self.dispersion[self.entry(ch, comp)],
                    direction,
                ));
            }
        }
        let mut exchange = Vec::with_capacity(self.exchange.len());
        for from in 0..n_channel {
            for to in 0..n_channel {
                for comp in 0..n_comp {
                    exchange.push(self.lift(
                        ParameterId::ExchangeRate {
                            from: Some(from),
                            to: Some(to),
                            component: Some(comp),
                        },
                        self.exchange[self.exchange_index(from, to, comp)],
                        direction,
                    ));
                }
            }
        }
        TransportCoefficients {
            n_comp,
            n_channel,
            col_length,
            cross_sections,
            velocity,
            dispersion,
            exchange,
        }
    }

    /// Inlet concentrations of all channels and components at `tau`.
    pub fn inlet_values<T: Active>(&self, sec_idx: usize, tau: f64, direction: Option<usize>, out: &mut [T]) {
        let lift = self.lift_inlet::<T>(direction);
        for (entry, v) in out.iter_mut().enumerate().take(self.inlet.num_entries()) {
            *v = self.inlet.value(sec_idx, entry, tau, &lift);
        }
    }

    /// Time derivatives of the inlet concentrations at `tau`.
    pub fn inlet_slopes<T: Active>(&self, sec_idx: usize, tau: f64, direction: Option<usize>, out: &mut [T]) {
        let lift = self.lift_inlet::<T>(direction);
        for (entry, v) in out.iter_mut().enumerate().take(self.inlet.num_entries()) {
            *v = self.inlet.time_derivative(sec_idx, entry, tau, &lift);
        }
    }
}
