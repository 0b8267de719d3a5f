// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of plaudit.
//
// plaudit is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// plaudit is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with plaudit.  If not,
// see <http://www.gnu.org/licenses/>.

//! # plaudit metrics
//!
//! plaudit uses [OpenTelemetry] to collect metrics. OTel "instruments" (counters, gauges) are
//! meant to be created once & re-used, which raises the question of where to keep them; I'd
//! rather not litter the application state with dozens of fields of type `Counter<u64>`. Instead,
//! each collection site *registers* its metric by name & type with David Tolnay's [inventory]
//! crate:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("snapshot.cache.hits", Sort::IntegralCounter) }
//! ```
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//! [inventory]: https://docs.rs/inventory/latest/inventory/index.html
//!
//! An [Instruments] instance, built once & attached to the application state, walks the registry,
//! checks for name clashes & pre-builds every instrument; `counter_add!`/`gauge_setu!` then look
//! the instrument up by name at the collection site.
//!
//! The lookups `panic!` on an unknown name or a mis-typed instrument. These are logic errors that
//! a richer type system would catch at compile time, and the convention seems to be to panic on
//! them; still, a bad metric name in a little-used code path is a ticking time bomb, so
//! [Instruments::new]'s up-front clash check is the best defense we have.

use std::collections::{hash_map::Entry, HashMap};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `Gauge<u64>`
    IntegralGauge,
    // more later?
}

/// The type of thing being inventoried: a metric name & its instrument type
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    /// Pre-build every registered instrument against the meter named `prefix`
    ///
    /// Pre-creating risks building instruments that are never used, but carries the benefit of
    /// making `add` & `record` *not* require `&mut self`, so an instance can live in an `Arc`.
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<String, Instrument> = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match map.entry(reg.name()) {
                Entry::Occupied(_occupied_entry) => {
                    panic!("The metric name {} was registered twice", name)
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
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(counter)) = self.map.get(name) {
            counter.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(gauge)) = self.map.get(name) {
            gauge.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
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
