// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of qadu.
//
// qadu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// qadu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with qadu.  If not, see
// <http://www.gnu.org/licenses/>.

//! # qadu metrics
//!
//! qadu uses [OpenTelemetry] to collect & export metrics. OTel advises us to create instruments
//! once & re-use them, which leaves the question of where to keep them. Rather than a field per
//! instrument, or a centralized list of metric names, each module declares the metrics it emits
//! with [define_metric], which registers the name (and the instrument type) through David Tolnay's
//! [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! define_metric! { "qadu.cycles.started", qadu_cycles_started, Sort::IntegralCounter }
//! // ...
//! counter_add!(self.instruments, qadu_cycles_started, 1, &[]);
//! ```
//!
//! The [Instruments] constructor walks the registrations, panics on duplicate names & pre-builds
//! every instrument so that recording doesn't require `&mut self` (and so the container can live in
//! an [Arc](std::sync::Arc)).
//!
//! Looking-up a name that wasn't registered, or recording to a counter as though it were a gauge,
//! panics. Those are logic errors; `define_metric` binds the name to an identifier precisely so that
//! a typo at the recording site fails to compile.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Declare a metric
///
/// Registers `$name` with the given [Sort] & binds it to the constant `$ident` for use with
/// [counter_add] or [gauge_setu].
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, $sort:expr) => {
        #[allow(non_upper_case_globals)]
        const $ident: &str = $name;
        inventory::submit! { $crate::metrics::Registration::new($name, $sort) }
    };
}

/// Panic if any metric name has been registered more than once
///
/// [Instruments::new] performs the same check, but this can be called at startup before the meter
/// provider is installed.
pub fn check_metric_names() {
    let mut names: HashSet<&'static str> = HashSet::new();
    inventory::iter::<Registration>.into_iter().for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<&'static str, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        inventory::iter::<Registration>.into_iter().for_each(|reg| {
            let name = reg.name();
            match m.entry(name) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", name)
                }
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });

        Instruments { map: m }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name an integral gauge", name);
        }
    }
}

impl Default for Instruments {
    fn default() -> Self {
        Instruments::new("qadu")
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
